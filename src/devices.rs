// Copyright The PSP Emulator Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! The pluggable peripheral model.
//!
//! A [`DeviceDescriptor`] is an immutable record describing one emulated
//! peripheral: its name, the windows it claims in the PSP MMIO and SMN
//! address spaces, and a constructor for per-instance state. The static
//! [`REGISTRY`] is the link-time set of known devices; a CCD instantiates
//! either all of them or the subset the configuration names.

pub mod ccp;
pub mod flash;
pub mod unknown;

use crate::{config::Config, cpu::StopFlag};
use thiserror::Error;

/// An address window claimed by a device in one address space.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Window {
    /// First address covered.
    pub base: u32,
    /// Window length in bytes.
    pub size: u32,
}

impl Window {
    /// One past the last covered address. Windows may run to the very top of
    /// the 32-bit space, so the end is a 64-bit value.
    pub fn end(&self) -> u64 {
        u64::from(self.base) + u64::from(self.size)
    }

    /// Whether `[addr, addr + len)` lies entirely inside the window.
    pub fn contains(&self, addr: u32, len: u32) -> bool {
        addr >= self.base && u64::from(addr) + u64::from(len) <= self.end()
    }

    /// Whether two windows share any address.
    pub fn overlaps(&self, other: &Window) -> bool {
        u64::from(self.base) < other.end() && u64::from(other.base) < self.end()
    }
}

/// Context handed to device callbacks for each access.
pub struct DevCtx<'a> {
    /// Identifier of the CCD the access originated from.
    pub ccd_id: u32,
    /// Cooperative stop request; a callback may halt the core through this.
    pub stop: &'a StopFlag,
}

/// Everything a device constructor may draw on.
pub struct DeviceInit<'a> {
    /// Identifier of the owning CCD.
    pub ccd_id: u32,
    /// The frozen emulator configuration.
    pub config: &'a Config,
    /// The flash ROM image, when one was loaded.
    pub flash: Option<&'a [u8]>,
}

/// A device instantiation failure, surfaced from CCD creation.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// The device cannot work with the given configuration or images.
    #[error("device init failed: {0}")]
    Init(&'static str),
}

/// An emulated peripheral.
///
/// Reads may zero-fill unmodeled offsets; writes are fire-and-forget and must
/// not block. Callbacks run synchronously on the executor thread and may
/// request a cooperative stop through the context.
pub trait Device {
    /// Returns the instance to its post-init state.
    fn reset(&mut self) {}

    /// Handles a guest read of `buf.len()` bytes at `off` within the window.
    fn read(&mut self, ctx: &mut DevCtx, off: u32, buf: &mut [u8]);

    /// Handles a guest write of `data` at `off` within the window.
    fn write(&mut self, ctx: &mut DevCtx, off: u32, data: &[u8]);
}

/// Constructor signature for device instances.
pub type DeviceCreate = fn(&DeviceInit) -> Result<Box<dyn Device>, DeviceError>;

/// Immutable description of one device.
pub struct DeviceDescriptor {
    /// Registry name, used for subset selection.
    pub name: &'static str,
    /// Human-readable description.
    pub description: &'static str,
    /// Window claimed in the PSP MMIO space, if any.
    pub mmio: Option<Window>,
    /// Window claimed in the SMN space, if any.
    pub smn: Option<Window>,
    /// Instance constructor.
    pub create: DeviceCreate,
}

/// All devices known at link time.
pub static REGISTRY: &[DeviceDescriptor] = &[
    unknown::DESCRIPTOR,
    ccp::DESCRIPTOR,
    flash::DESCRIPTOR,
];

/// Looks a descriptor up by registry name.
pub fn find(name: &str) -> Option<&'static DeviceDescriptor> {
    REGISTRY.iter().find(|desc| desc.name == name)
}

/// Serves a byte-granular read out of a 32-bit register function.
///
/// Devices modelled as word registers use this to honour 1-, 2- and 4-byte
/// guest accesses at arbitrary offsets.
pub fn read_reg32(off: u32, buf: &mut [u8], reg: impl Fn(u32) -> u32) {
    for (i, byte) in buf.iter_mut().enumerate() {
        let at = off.wrapping_add(i as u32);
        let word = reg(at & !3);
        *byte = (word >> ((at & 3) * 8)) as u8;
    }
}
