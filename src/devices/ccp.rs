// Copyright The PSP Emulator Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Cryptographic co-processor stub.
//!
//! Firmware queues crypto operations on the CCP and polls per-queue status
//! registers for completion. Cryptographic fidelity is explicitly out of
//! scope, so the stub reports every queue as halted-and-idle and swallows
//! all writes; firmware that merely checks for completion makes progress,
//! firmware that depends on results must run against the proxy.

use super::{DevCtx, Device, DeviceDescriptor, DeviceError, DeviceInit, Window, read_reg32};
use log::trace;

const QUEUE_COUNT: u32 = 5;
const QUEUE_STRIDE: u32 = 0x1000;
/// Control/status register offsets within one queue bank.
const Q_CONTROL: u32 = 0x0;
const Q_STATUS: u32 = 0x100;
/// "Queue halted" status value firmware treats as done-and-idle.
const Q_STATUS_HALTED: u32 = 0x1;

/// Registry entry.
pub const DESCRIPTOR: DeviceDescriptor = DeviceDescriptor {
    name: "ccp",
    description: "Cryptographic co-processor (stub)",
    mmio: Some(Window {
        base: 0x0300_0000,
        size: 0x1_0000,
    }),
    smn: None,
    create,
};

fn create(_init: &DeviceInit) -> Result<Box<dyn Device>, DeviceError> {
    Ok(Box::new(Ccp))
}

struct Ccp;

impl Device for Ccp {
    fn read(&mut self, _ctx: &mut DevCtx, off: u32, buf: &mut [u8]) {
        read_reg32(off, buf, |reg| {
            let queue = reg / QUEUE_STRIDE;
            if queue >= QUEUE_COUNT {
                return 0;
            }
            match reg % QUEUE_STRIDE {
                Q_CONTROL => 0,
                Q_STATUS => Q_STATUS_HALTED,
                _ => 0,
            }
        });
    }

    fn write(&mut self, _ctx: &mut DevCtx, off: u32, data: &[u8]) {
        trace!("ccp: discarding write of {} bytes at {off:#x}", data.len());
    }
}
