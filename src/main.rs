// Copyright The PSP Emulator Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Functional emulator for the AMD Platform Security Processor.

mod ccd;
mod config;
mod cpu;
mod devices;
mod executor;
mod iomgr;
mod loader;
mod proxy;
mod svc;

use anyhow::Context;
use ccd::Ccd;
use clap::Parser;
use config::Config;
use executor::CoreReg;
use log::{info, warn};
use proxy::DisconnectedProxy;

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cfg = Config::parse();
    cfg.validate().context("invalid configuration")?;

    info!(
        "emulating {} {} in {} mode (ACPI {}, psp-dbg={}, realtime-timer={})",
        cfg.micro_arch,
        cfg.cpu_segment,
        cfg.mode,
        cfg.acpi_state,
        cfg.psp_dbg_mode,
        cfg.timer_realtime,
    );
    if cfg.dbg_port != 0 {
        warn!("GDB stub is served by an external tool; --dbg-port ignored here");
    }
    if cfg.em100_flash_emu_port != 0 {
        warn!("EM100 flash emulation is served by an external tool; port ignored here");
    }
    if cfg.proxy_addr.is_some() {
        warn!("proxy transport is an external collaborator; running disconnected");
    }

    let images = loader::read_images(&cfg).context("loading images")?;

    let mut ccds = Vec::with_capacity(cfg.ccd_count() as usize);
    for socket in 0..cfg.sockets {
        for die in 0..cfg.ccds_per_socket {
            let ccd_id = socket * cfg.ccds_per_socket + die;
            let ccd = Ccd::new(
                socket,
                ccd_id,
                &cfg,
                &images,
                Box::new(DisconnectedProxy::default()),
            )
            .with_context(|| format!("creating CCD {ccd_id} on socket {socket}"))?;
            ccds.push(ccd);
        }
    }

    // CCDs are independent; only the first one executes. The others exist so
    // cross-CCD SMN targets resolve.
    let first = &mut ccds[0];
    info!(
        "starting CCD {} (socket {}) with {} device(s)",
        first.ccd_id(),
        first.socket_id(),
        first.device_count()
    );
    let stop = first.run().context("emulation failed")?;
    info!(
        "emulation stopped: {stop:?}, pc={:#010x}",
        first.core().reg(CoreReg::Pc)
    );
    Ok(())
}
