// Copyright The PSP Emulator Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Unknown status block at PSP address 0x0301_0000.
//!
//! The on-chip bootloader spin-waits on bit 8 of the register at offset
//! 0x104 early in its boot path. What the block really is has not been
//! reverse engineered; reporting the bit as set is enough to let boot
//! proceed, and every other offset reads as zero.

use super::{DevCtx, Device, DeviceDescriptor, DeviceError, DeviceInit, Window, read_reg32};
use log::trace;

const STATUS_OFFSET: u32 = 0x104;
const STATUS_READY: u32 = 0x100;

/// Registry entry.
pub const DESCRIPTOR: DeviceDescriptor = DeviceDescriptor {
    name: "unk-0x03010000",
    description: "Unknown status block polled by the on-chip bootloader",
    mmio: Some(Window {
        base: 0x0301_0000,
        size: 0x1000,
    }),
    smn: None,
    create,
};

fn create(_init: &DeviceInit) -> Result<Box<dyn Device>, DeviceError> {
    Ok(Box::new(Unknown))
}

struct Unknown;

impl Device for Unknown {
    fn read(&mut self, _ctx: &mut DevCtx, off: u32, buf: &mut [u8]) {
        read_reg32(off, buf, |reg| match reg {
            STATUS_OFFSET => STATUS_READY,
            _ => 0,
        });
    }

    fn write(&mut self, _ctx: &mut DevCtx, off: u32, data: &[u8]) {
        trace!(
            "unk-0x03010000: ignoring write of {} bytes at {off:#x}",
            data.len()
        );
    }
}
