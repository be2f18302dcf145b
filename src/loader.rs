// Copyright The PSP Emulator Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Initial memory population.
//!
//! Reads the configured images once and places them per emulation mode:
//! the app binary low in SRAM, the off-chip supervisor at the SRAM base, the
//! on-chip bootloader in its own ROM region high in the address space, and
//! the boot-ROM service page at the top of SRAM. Directory parsing of the
//! flash image is the flash tooling's job; the raw image only feeds the SMN
//! flash device.

use crate::{
    config::{Config, EmuMode},
    cpu::{CpuCore, CpuError, MemPerms, SRAM_SIZE},
    executor::MemFault,
};
use log::{debug, info};
use std::path::{Path, PathBuf};
use thiserror::Error;
use zerocopy::little_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// App binaries load at this SRAM address.
const APP_LOAD_ADDR: u32 = 0x1_5000;
/// A preloaded companion app lands here.
const APP_PRELOAD_ADDR: u32 = 0x2_0000;
/// The off-chip supervisor loads at the SRAM base.
const SYSTEM_LOAD_ADDR: u32 = 0x0;
/// The on-chip bootloader ROM region.
const ON_CHIP_BL_BASE: u32 = 0xffff_0000;
const ON_CHIP_BL_SIZE: u32 = 0x1_0000;
/// The boot ROM leaves its service page in the top SRAM page.
const BOOT_ROM_SVC_PAGE_ADDR: u32 = 0x3_f000;
const BOOT_ROM_SVC_PAGE_SIZE: usize = 0x1000;

/// Size of the firmware header in front of signed PSP binaries.
pub const BINARY_HDR_SIZE: usize = 0x100;

/// The 256-byte header in front of signed PSP binaries. Only the fields the
/// loader reports are named; the rest is signature material.
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
struct BinaryHeader {
    _reserved0: [u8; 0x10],
    magic: [u8; 4],
    size_signed: U32,
    is_encrypted: U32,
    _reserved1: [u8; 0xe4],
}

/// Image loading failures.
#[derive(Debug, Error)]
pub enum LoaderError {
    /// Reading an image file failed.
    #[error("failed to read {path:?}: {source}")]
    Io {
        /// The offending path.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },
    /// The mode needs an image that was not loaded.
    #[error("{what} image required but not loaded")]
    MissingImage {
        /// Which image is missing.
        what: &'static str,
    },
    /// An image does not fit its destination.
    #[error("{what} image of {len:#x} bytes exceeds {max:#x}")]
    TooLarge {
        /// Which image overflowed.
        what: &'static str,
        /// Actual length.
        len: usize,
        /// Allowed maximum.
        max: usize,
    },
    /// The binary is declared to carry a header but is shorter than one.
    #[error("binary shorter than its {BINARY_HDR_SIZE}-byte header")]
    HeaderTruncated,
    /// Region setup failed.
    #[error(transparent)]
    Region(#[from] CpuError),
    /// Copying an image into guest memory failed.
    #[error(transparent)]
    Mem(#[from] MemFault),
}

/// All raw image bytes the configuration names.
#[derive(Debug, Default)]
pub struct LoadedImages {
    /// Flash ROM, served by the SMN flash device.
    pub flash: Option<Vec<u8>>,
    /// On-chip bootloader.
    pub on_chip_bl: Option<Vec<u8>>,
    /// The binary to execute.
    pub binary: Option<Vec<u8>>,
    /// Boot-ROM service page.
    pub boot_rom_svc_page: Option<Vec<u8>>,
    /// App preload companion.
    pub app_preload: Option<Vec<u8>>,
}

fn read_optional(path: Option<&Path>) -> Result<Option<Vec<u8>>, LoaderError> {
    match path {
        Some(path) => std::fs::read(path)
            .map(Some)
            .map_err(|source| LoaderError::Io {
                path: path.to_path_buf(),
                source,
            }),
        None => Ok(None),
    }
}

/// Reads every configured image file.
pub fn read_images(cfg: &Config) -> Result<LoadedImages, LoaderError> {
    Ok(LoadedImages {
        flash: read_optional(cfg.flash_rom.as_deref())?,
        on_chip_bl: read_optional(cfg.on_chip_bl.as_deref())?,
        binary: read_optional(cfg.binary_load.as_deref())?,
        boot_rom_svc_page: read_optional(cfg.boot_rom_svc_page.as_deref())?,
        app_preload: read_optional(cfg.app_preload.as_deref())?,
    })
}

/// Offset of the entry point within a binary, honouring the header flag.
fn entry_offset(cfg: &Config, binary: &[u8]) -> Result<u32, LoaderError> {
    if !cfg.binary_contains_hdr {
        return Ok(0);
    }
    if binary.len() < BINARY_HDR_SIZE {
        return Err(LoaderError::HeaderTruncated);
    }
    let header = BinaryHeader::ref_from_bytes(&binary[..BINARY_HDR_SIZE])
        .expect("header slice has the exact size");
    debug!(
        "binary header: magic {:02x?}, {:#x} signed bytes, encrypted={}",
        header.magic,
        header.size_signed.get(),
        header.is_encrypted.get() != 0,
    );
    Ok(BINARY_HDR_SIZE as u32)
}

fn place(
    core: &mut CpuCore,
    what: &'static str,
    addr: u32,
    max: usize,
    image: &[u8],
) -> Result<(), LoaderError> {
    if image.len() > max {
        return Err(LoaderError::TooLarge {
            what,
            len: image.len(),
            max,
        });
    }
    core.mem_write(addr, image)?;
    info!("{what}: {:#x} bytes at {addr:#010x}", image.len());
    Ok(())
}

/// Populates initial guest memory and returns the entry point.
pub fn populate(
    core: &mut CpuCore,
    cfg: &Config,
    images: &LoadedImages,
) -> Result<u32, LoaderError> {
    let entry = match cfg.mode {
        EmuMode::App => {
            let binary = images
                .binary
                .as_deref()
                .ok_or(LoaderError::MissingImage { what: "binary" })?;
            place(
                core,
                "app binary",
                APP_LOAD_ADDR,
                SRAM_SIZE - APP_LOAD_ADDR as usize,
                binary,
            )?;
            if let Some(preload) = images.app_preload.as_deref() {
                place(
                    core,
                    "app preload",
                    APP_PRELOAD_ADDR,
                    SRAM_SIZE - APP_PRELOAD_ADDR as usize,
                    preload,
                )?;
            }
            APP_LOAD_ADDR + entry_offset(cfg, binary)?
        }
        EmuMode::System => {
            let binary = images
                .binary
                .as_deref()
                .ok_or(LoaderError::MissingImage { what: "binary" })?;
            place(core, "supervisor binary", SYSTEM_LOAD_ADDR, SRAM_SIZE, binary)?;
            SYSTEM_LOAD_ADDR + entry_offset(cfg, binary)?
        }
        EmuMode::SystemOnChipBl => {
            let rom = images
                .on_chip_bl
                .as_deref()
                .ok_or(LoaderError::MissingImage {
                    what: "on-chip bootloader",
                })?;
            core.mem_add_region(ON_CHIP_BL_BASE, ON_CHIP_BL_SIZE, MemPerms::RX)?;
            place(
                core,
                "on-chip bootloader",
                ON_CHIP_BL_BASE,
                ON_CHIP_BL_SIZE as usize,
                rom,
            )?;
            ON_CHIP_BL_BASE
        }
    };

    if let Some(page) = images.boot_rom_svc_page.as_deref() {
        place(
            core,
            "boot ROM service page",
            BOOT_ROM_SVC_PAGE_ADDR,
            BOOT_ROM_SVC_PAGE_SIZE,
            page,
        )?;
    }
    if cfg.load_psp_dir {
        debug!("PSP directory parsing is delegated to the flash tooling");
    }

    Ok(entry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn cfg(mode: EmuMode) -> Config {
        Config {
            mode,
            ..Default::default()
        }
    }

    #[test]
    fn read_images_reports_the_failing_path() {
        let config = Config {
            binary_load: Some("/nonexistent/psp-fw.bin".into()),
            ..Default::default()
        };
        let err = read_images(&config).unwrap_err();
        assert!(matches!(err, LoaderError::Io { .. }));
        assert!(err.to_string().contains("psp-fw.bin"));
    }

    #[test]
    fn read_images_loads_file_contents() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[1, 2, 3, 4]).unwrap();
        let config = Config {
            binary_load: Some(file.path().to_path_buf()),
            ..Default::default()
        };
        let images = read_images(&config).unwrap();
        assert_eq!(images.binary.as_deref(), Some(&[1, 2, 3, 4][..]));
    }

    #[test]
    fn app_binary_lands_at_its_load_address() {
        let mut core = CpuCore::new(EmuMode::App);
        let images = LoadedImages {
            binary: Some(vec![0xaa, 0xbb, 0xcc, 0xdd]),
            ..Default::default()
        };
        let entry = populate(&mut core, &cfg(EmuMode::App), &images).unwrap();
        assert_eq!(entry, APP_LOAD_ADDR);

        let mut word = [0; 4];
        core.mem_read(APP_LOAD_ADDR, &mut word).unwrap();
        assert_eq!(word, [0xaa, 0xbb, 0xcc, 0xdd]);
    }

    #[test]
    fn header_moves_the_entry_point() {
        let mut core = CpuCore::new(EmuMode::App);
        let mut binary = vec![0; BINARY_HDR_SIZE];
        binary.extend_from_slice(&[0x11; 8]);
        let images = LoadedImages {
            binary: Some(binary),
            ..Default::default()
        };
        let mut config = cfg(EmuMode::App);
        config.binary_contains_hdr = true;
        let entry = populate(&mut core, &config, &images).unwrap();
        assert_eq!(entry, APP_LOAD_ADDR + BINARY_HDR_SIZE as u32);
    }

    #[test]
    fn truncated_header_is_rejected() {
        let mut core = CpuCore::new(EmuMode::App);
        let images = LoadedImages {
            binary: Some(vec![0; 0x80]),
            ..Default::default()
        };
        let mut config = cfg(EmuMode::App);
        config.binary_contains_hdr = true;
        assert!(matches!(
            populate(&mut core, &config, &images),
            Err(LoaderError::HeaderTruncated)
        ));
    }

    #[test]
    fn on_chip_bl_gets_its_rom_region() {
        let mut core = CpuCore::new(EmuMode::SystemOnChipBl);
        let images = LoadedImages {
            on_chip_bl: Some(vec![0x42; 0x100]),
            ..Default::default()
        };
        let entry = populate(&mut core, &cfg(EmuMode::SystemOnChipBl), &images).unwrap();
        assert_eq!(entry, ON_CHIP_BL_BASE);

        let mut byte = [0; 1];
        core.mem_read(ON_CHIP_BL_BASE + 0xff, &mut byte).unwrap();
        assert_eq!(byte[0], 0x42);
    }

    #[test]
    fn oversized_service_page_is_rejected() {
        let mut core = CpuCore::new(EmuMode::System);
        let images = LoadedImages {
            binary: Some(vec![0; 4]),
            boot_rom_svc_page: Some(vec![0; BOOT_ROM_SVC_PAGE_SIZE + 1]),
            ..Default::default()
        };
        assert!(matches!(
            populate(&mut core, &cfg(EmuMode::System), &images),
            Err(LoaderError::TooLarge { .. })
        ));
    }

    #[test]
    fn missing_required_image_is_reported() {
        let mut core = CpuCore::new(EmuMode::System);
        let images = LoadedImages::default();
        assert!(matches!(
            populate(&mut core, &cfg(EmuMode::System), &images),
            Err(LoaderError::MissingImage { .. })
        ));
    }
}
