// Copyright The PSP Emulator Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Emulator configuration.
//!
//! The CLI surface is parsed once into a [`Config`] which is then handed to
//! CCD creation frozen; nothing in the core mutates it afterwards.

use clap::{Parser, ValueEnum};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// What kind of firmware the emulated PSP runs.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, ValueEnum)]
pub enum EmuMode {
    /// A single user-mode application, with supervisor calls emulated or
    /// proxied by the host.
    App,
    /// The off-chip supervisor (the flash bootloader and everything above).
    #[default]
    System,
    /// The on-chip boot ROM, from the reset vector up.
    SystemOnChipBl,
}

/// Emulated Zen micro-architecture generation.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, ValueEnum)]
#[allow(missing_docs)]
pub enum MicroArch {
    #[default]
    Zen,
    ZenPlus,
    Zen2,
}

/// Emulated CPU market segment.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, ValueEnum)]
#[allow(missing_docs)]
pub enum CpuSegment {
    #[default]
    Ryzen,
    RyzenPro,
    Threadripper,
    Epyc,
}

/// ACPI system state the host is in when the PSP boots.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, ValueEnum)]
#[allow(missing_docs)]
pub enum AcpiState {
    #[default]
    S0,
    S1,
    S2,
    S3,
    S4,
    S5,
}

/// `clap` renders defaults through `Display`; reuse the CLI spelling.
macro_rules! display_via_value_enum {
    ($($t:ty),*) => {
        $(impl fmt::Display for $t {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let value = self
                    .to_possible_value()
                    .expect("no skipped variants");
                f.write_str(value.get_name())
            }
        })*
    };
}

display_via_value_enum!(EmuMode, MicroArch, CpuSegment, AcpiState);

/// The frozen emulator configuration.
#[derive(Clone, Debug, Parser)]
#[command(name = "psp-emu", about = "AMD Platform Security Processor emulator")]
pub struct Config {
    /// Emulation mode.
    #[arg(long, value_enum, default_value_t)]
    pub mode: EmuMode,

    /// Emulated micro-architecture.
    #[arg(long, value_enum, default_value_t)]
    pub micro_arch: MicroArch,

    /// Emulated CPU segment.
    #[arg(long, value_enum, default_value_t)]
    pub cpu_segment: CpuSegment,

    /// ACPI state at boot.
    #[arg(long, value_enum, default_value_t)]
    pub acpi_state: AcpiState,

    /// Flash ROM image, served through the SMN flash device.
    #[arg(long)]
    pub flash_rom: Option<PathBuf>,

    /// On-chip bootloader image (`system-on-chip-bl` mode).
    #[arg(long)]
    pub on_chip_bl: Option<PathBuf>,

    /// Binary to load and execute (`app` and `system` modes).
    #[arg(long)]
    pub binary_load: Option<PathBuf>,

    /// Boot-ROM service page image placed at the top of SRAM.
    #[arg(long)]
    pub boot_rom_svc_page: Option<PathBuf>,

    /// Additional app binary preloaded next to the main one.
    #[arg(long)]
    pub app_preload: Option<PathBuf>,

    /// The loaded binary starts with a 256-byte firmware header.
    #[arg(long)]
    pub binary_contains_hdr: bool,

    /// Parse and load the PSP directory from the flash image.
    #[arg(long)]
    pub load_psp_dir: bool,

    /// Report the PSP as running in debug mode.
    #[arg(long)]
    pub psp_dbg_mode: bool,

    /// Intercept `svc 0x6` debug logging even outside `app` mode.
    #[arg(long)]
    pub intercept_svc6: bool,

    /// Trace every supervisor call dispatch.
    #[arg(long)]
    pub trace_svcs: bool,

    /// Drive the emulated timer from host wall-clock time.
    #[arg(long)]
    pub timer_realtime: bool,

    /// GDB stub port; 0 disables the debugger.
    #[arg(long, default_value_t = 0)]
    pub dbg_port: u16,

    /// EM100 flash-emulation server port; 0 disables it.
    #[arg(long, default_value_t = 0)]
    pub em100_flash_emu_port: u16,

    /// Number of emulated sockets.
    #[arg(long, default_value_t = 1)]
    pub sockets: u32,

    /// Number of CCDs per socket.
    #[arg(long, default_value_t = 1)]
    pub ccds_per_socket: u32,

    /// Devices to instantiate, by registry name. Omit to instantiate all.
    #[arg(long = "device")]
    pub devices: Option<Vec<String>>,

    /// PSP proxy transport address (consumed by the binary, not the core).
    #[arg(long)]
    pub proxy_addr: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: EmuMode::default(),
            micro_arch: MicroArch::default(),
            cpu_segment: CpuSegment::default(),
            acpi_state: AcpiState::default(),
            flash_rom: None,
            on_chip_bl: None,
            binary_load: None,
            boot_rom_svc_page: None,
            app_preload: None,
            binary_contains_hdr: false,
            load_psp_dir: false,
            psp_dbg_mode: false,
            intercept_svc6: false,
            trace_svcs: false,
            timer_realtime: false,
            dbg_port: 0,
            em100_flash_emu_port: 0,
            sockets: 1,
            ccds_per_socket: 1,
            devices: None,
            proxy_addr: None,
        }
    }
}

/// A rejected configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The selected mode needs an image the configuration does not provide.
    #[error("mode {mode:?} requires {what}")]
    MissingImage {
        /// The configured mode.
        mode: EmuMode,
        /// Which option is missing.
        what: &'static str,
    },
    /// The topology counts must both be non-zero.
    #[error("topology must have at least one socket and one CCD per socket")]
    EmptyTopology,
}

impl Config {
    /// Checks mode/image coherence before any CCD is built.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.mode {
            EmuMode::App | EmuMode::System => {
                if self.binary_load.is_none() {
                    return Err(ConfigError::MissingImage {
                        mode: self.mode,
                        what: "--binary-load",
                    });
                }
            }
            EmuMode::SystemOnChipBl => {
                if self.on_chip_bl.is_none() {
                    return Err(ConfigError::MissingImage {
                        mode: self.mode,
                        what: "--on-chip-bl",
                    });
                }
            }
        }
        if self.sockets == 0 || self.ccds_per_socket == 0 {
            return Err(ConfigError::EmptyTopology);
        }
        Ok(())
    }

    /// Total number of CCDs across all sockets.
    pub fn ccd_count(&self) -> u32 {
        self.sockets * self.ccds_per_socket
    }

    /// Whether the named device should be instantiated.
    pub fn wants_device(&self, name: &str) -> bool {
        match &self.devices {
            Some(list) => list.iter().any(|n| n == name),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn app_mode_requires_a_binary() {
        let cfg = Config {
            mode: EmuMode::App,
            ..Default::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::MissingImage { .. })
        ));
    }

    #[test]
    fn on_chip_mode_requires_the_rom() {
        let cfg = Config {
            mode: EmuMode::SystemOnChipBl,
            binary_load: Some("unused".into()),
            ..Default::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::MissingImage { .. })
        ));
    }

    #[test]
    fn device_subset_selection() {
        let all = Config::default();
        assert!(all.wants_device("ccp"));

        let subset = Config {
            devices: Some(vec!["ccp".into()]),
            ..Default::default()
        };
        assert!(subset.wants_device("ccp"));
        assert!(!subset.wants_device("smn-flash"));
    }

    #[test]
    fn topology_must_be_non_empty() {
        let cfg = Config {
            mode: EmuMode::System,
            binary_load: Some("fw.bin".into()),
            sockets: 0,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::EmptyTopology)));
    }
}
