// Copyright The PSP Emulator Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! One Core Complex Die: a PSP core, its I/O manager and its devices.

use crate::{
    config::{Config, EmuMode},
    cpu::{CpuCore, CpuError, RunEnv, RunStop},
    devices::{self, DeviceInit},
    executor::{MemFault, RunLimits},
    iomgr::{IoManager, IomError},
    loader::{self, LoadedImages, LoaderError},
    proxy::ProxyClient,
    svc::SvcState,
};
use log::{debug, info, warn};
use thiserror::Error;

/// CCD construction failures; all fatal.
#[derive(Debug, Error)]
pub enum CcdError {
    /// A device could not be instantiated.
    #[error(transparent)]
    Iom(#[from] IomError),
    /// Initial memory population failed.
    #[error(transparent)]
    Loader(#[from] LoaderError),
}

/// One emulated CCD.
pub struct Ccd {
    socket_id: u32,
    ccd_id: u32,
    core: CpuCore,
    iomgr: IoManager,
    svc: Option<SvcState>,
    entry: u32,
    intercept_svc6: bool,
    trace_svcs: bool,
}

impl Ccd {
    /// Composes a CCD: core, I/O manager, the configured device subset and,
    /// in `App` mode, supervisor state tied to the proxy connection.
    pub fn new(
        socket_id: u32,
        ccd_id: u32,
        cfg: &Config,
        images: &LoadedImages,
        proxy: Box<dyn ProxyClient>,
    ) -> Result<Self, CcdError> {
        let mut core = CpuCore::new(cfg.mode);
        core.set_ccd_id(ccd_id);

        if let Some(names) = &cfg.devices {
            for name in names {
                if devices::find(name).is_none() {
                    warn!("device {name:?} is not in the registry, skipping");
                }
            }
        }

        let mut iomgr = IoManager::new();
        let init = DeviceInit {
            ccd_id,
            config: cfg,
            flash: images.flash.as_deref(),
        };
        for desc in devices::REGISTRY {
            if cfg.wants_device(desc.name) {
                iomgr.attach(desc, &init)?;
                debug!("ccd {ccd_id}: attached {} ({})", desc.name, desc.description);
            }
        }

        let entry = loader::populate(&mut core, cfg, images)?;
        core.exec_set_start_addr(entry);

        let svc = (cfg.mode == EmuMode::App).then(|| SvcState::new(proxy));
        info!("ccd {ccd_id} (socket {socket_id}) ready, entry {entry:#010x}");

        Ok(Self {
            socket_id,
            ccd_id,
            core,
            iomgr,
            svc,
            entry,
            intercept_svc6: cfg.intercept_svc6,
            trace_svcs: cfg.trace_svcs,
        })
    }

    /// The socket this CCD sits on.
    pub fn socket_id(&self) -> u32 {
        self.socket_id
    }

    /// The CCD identifier.
    pub fn ccd_id(&self) -> u32 {
        self.ccd_id
    }

    /// Drops per-device and per-core state, reloads initial memory and
    /// rewinds the PC to the configured entry.
    #[allow(unused)]
    pub fn reset(&mut self, cfg: &Config, images: &LoadedImages) -> Result<(), CcdError> {
        self.core.reset();
        self.iomgr.reset_devices();
        if let Some(svc) = &mut self.svc {
            svc.reset();
        }
        self.entry = loader::populate(&mut self.core, cfg, images)?;
        self.core.exec_set_start_addr(self.entry);
        Ok(())
    }

    /// Runs until the guest halts, exits or faults.
    pub fn run(&mut self) -> Result<RunStop, CpuError> {
        self.run_bounded(RunLimits::UNBOUNDED)
    }

    /// Runs with explicit ceilings.
    pub fn run_bounded(&mut self, limits: RunLimits) -> Result<RunStop, CpuError> {
        let mut env = RunEnv {
            iomgr: &mut self.iomgr,
            svc: self.svc.as_mut(),
            intercept_svc6: self.intercept_svc6,
            trace_svcs: self.trace_svcs,
        };
        self.core.exec_run(&mut env, limits)
    }

    /// The underlying CPU core, for debugger integration.
    pub fn core(&self) -> &CpuCore {
        &self.core
    }

    /// Mutable access to the CPU core.
    #[allow(unused)]
    pub fn core_mut(&mut self) -> &mut CpuCore {
        &mut self.core
    }

    /// Number of live device instances.
    pub fn device_count(&self) -> usize {
        self.iomgr.device_count()
    }

    /// Reads through the full guest address-space routing, devices included.
    /// This is the debugger's view of memory.
    #[allow(unused)]
    pub fn bus_read(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), MemFault> {
        let (_, mut mem) = self.core.split_mem(&mut self.iomgr, self.svc.as_mut());
        crate::executor::Bus::read(&mut mem, addr, buf)
    }

    /// Writes through the full guest address-space routing.
    #[allow(unused)]
    pub fn bus_write(&mut self, addr: u32, data: &[u8]) -> Result<(), MemFault> {
        let (_, mut mem) = self.core.split_mem(&mut self.iomgr, self.svc.as_mut());
        crate::executor::Bus::write(&mut mem, addr, data)
    }
}
