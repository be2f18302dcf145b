// Copyright The PSP Emulator Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Routing of guest memory accesses to emulated devices.
//!
//! The manager keeps one region table per address space — PSP MMIO, SMN
//! (keyed by CCD target), and the dynamically managed x86 mapping windows —
//! and resolves each guest access to the instance callback that owns it.
//! Windows in the same address space never overlap; registration enforces
//! this.

use crate::{
    devices::{DevCtx, Device, DeviceDescriptor, DeviceError, DeviceInit, Window},
    executor::AccessWidth,
};
use arrayvec::ArrayVec;
use log::{trace, warn};
use thiserror::Error;

/// Eight x86 mapping slots plus the privileged-DRAM mapping.
pub const X86_REGION_MAX: usize = 9;

/// Registration failure.
#[derive(Debug, Error)]
pub enum IomError {
    /// The window collides with one already registered in the same space.
    #[error("{space} window {base:#x}+{size:#x} overlaps an existing device")]
    Overlap {
        /// Address space name, for diagnostics.
        space: &'static str,
        /// Claimed base address.
        base: u32,
        /// Claimed length.
        size: u32,
    },
    /// The x86 window table is full.
    #[error("all x86 window table entries are in use")]
    X86Full,
    /// Device construction failed.
    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// One live device.
pub struct DeviceInstance {
    /// The descriptor the instance was built from.
    pub desc: &'static DeviceDescriptor,
    dev: Box<dyn Device>,
}

#[derive(Copy, Clone)]
struct MmioRegion {
    window: Window,
    dev: usize,
}

#[derive(Copy, Clone)]
struct SmnRegion {
    ccd_target: u32,
    window: Window,
    dev: usize,
}

/// Which cached mapping an x86 window belongs to.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum X86SlotRef {
    /// One of the eight general mapping slots.
    Slot(usize),
    /// The privileged-DRAM mapping used for SEV state.
    Privileged,
}

#[derive(Copy, Clone)]
struct X86Region {
    window: Window,
    slot: X86SlotRef,
}

/// The per-CCD I/O manager.
#[derive(Default)]
pub struct IoManager {
    instances: Vec<Option<DeviceInstance>>,
    mmio: Vec<MmioRegion>,
    smn: Vec<SmnRegion>,
    x86: ArrayVec<X86Region, X86_REGION_MAX>,
}

impl Drop for IoManager {
    fn drop(&mut self) {
        // Instances go away newest first, mirroring registration.
        self.teardown();
    }
}

impl IoManager {
    /// Creates an empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Instantiates a device and claims its windows.
    ///
    /// The instance state is built by the descriptor's constructor and
    /// `reset` is invoked before the first access can see it. Fails if any
    /// window overlaps or the constructor refuses the configuration.
    pub fn attach(
        &mut self,
        desc: &'static DeviceDescriptor,
        init: &DeviceInit,
    ) -> Result<usize, IomError> {
        if let Some(window) = desc.mmio {
            if self.mmio.iter().any(|r| r.window.overlaps(&window)) {
                return Err(IomError::Overlap {
                    space: "MMIO",
                    base: window.base,
                    size: window.size,
                });
            }
        }
        if let Some(window) = desc.smn {
            if self
                .smn
                .iter()
                .any(|r| r.ccd_target == init.ccd_id && r.window.overlaps(&window))
            {
                return Err(IomError::Overlap {
                    space: "SMN",
                    base: window.base,
                    size: window.size,
                });
            }
        }

        let mut dev = (desc.create)(init)?;
        dev.reset();
        let index = self.instances.len();
        self.instances.push(Some(DeviceInstance { desc, dev }));
        if let Some(window) = desc.mmio {
            self.mmio.push(MmioRegion { window, dev: index });
        }
        if let Some(window) = desc.smn {
            self.smn.push(SmnRegion {
                ccd_target: init.ccd_id,
                window,
                dev: index,
            });
        }
        Ok(index)
    }

    /// Removes one instance from the routing tables and drops its state.
    pub fn detach(&mut self, index: usize) {
        self.mmio.retain(|r| r.dev != index);
        self.smn.retain(|r| r.dev != index);
        if let Some(slot) = self.instances.get_mut(index) {
            *slot = None;
        }
    }

    /// Drops every instance, newest first.
    pub fn teardown(&mut self) {
        for index in (0..self.instances.len()).rev() {
            self.detach(index);
        }
        self.instances.clear();
    }

    /// Re-runs `reset` on every live instance, in registration order.
    pub fn reset_devices(&mut self) {
        for instance in self.instances.iter_mut().flatten() {
            trace!("resetting device {}", instance.desc.name);
            instance.dev.reset();
        }
    }

    /// Number of live instances.
    pub fn device_count(&self) -> usize {
        self.instances.iter().flatten().count()
    }

    /// Resolves a PSP-space address to `(instance, offset)`.
    pub fn mmio_at(&self, addr: u32, len: u32) -> Option<(usize, u32)> {
        self.mmio
            .iter()
            .find(|r| r.window.contains(addr, len))
            .map(|r| (r.dev, addr - r.window.base))
    }

    /// Resolves an SMN address for a CCD target to `(instance, offset)`.
    pub fn smn_at(&self, ccd_target: u32, addr: u32, len: u32) -> Option<(usize, u32)> {
        self.smn
            .iter()
            .find(|r| r.ccd_target == ccd_target && r.window.contains(addr, len))
            .map(|r| (r.dev, addr - r.window.base))
    }

    /// Resolves a PSP-space address to the x86 window covering it.
    pub fn x86_at(&self, addr: u32, len: u32) -> Option<X86SlotRef> {
        self.x86
            .iter()
            .find(|r| r.window.contains(addr, len))
            .map(|r| r.slot)
    }

    /// Registers an x86 mapping window for a slot.
    pub fn register_x86_window(
        &mut self,
        base_4k: u32,
        size_4k: u32,
        slot: X86SlotRef,
    ) -> Result<(), IomError> {
        let window = Window {
            base: base_4k,
            size: size_4k,
        };
        if self.x86.iter().any(|r| r.window.overlaps(&window)) {
            return Err(IomError::Overlap {
                space: "x86",
                base: base_4k,
                size: size_4k,
            });
        }
        self.x86
            .try_push(X86Region { window, slot })
            .map_err(|_| IomError::X86Full)
    }

    /// Removes the window registered for a slot, if any.
    pub fn unregister_x86_window(&mut self, slot: X86SlotRef) {
        self.x86.retain(|r| r.slot != slot);
    }

    /// Dispatches a read to the owning device.
    pub fn dev_read(&mut self, index: usize, ctx: &mut DevCtx, off: u32, buf: &mut [u8]) {
        if AccessWidth::try_from(buf.len() as u32).is_err() {
            warn!("device read of unsupported width {} at {off:#x}", buf.len());
            buf.fill(0);
            return;
        }
        if let Some(instance) = self.instances.get_mut(index).and_then(Option::as_mut) {
            instance.dev.read(ctx, off, buf);
        } else {
            buf.fill(0);
        }
    }

    /// Dispatches a write to the owning device.
    pub fn dev_write(&mut self, index: usize, ctx: &mut DevCtx, off: u32, data: &[u8]) {
        if AccessWidth::try_from(data.len() as u32).is_err() {
            warn!(
                "device write of unsupported width {} at {off:#x}",
                data.len()
            );
            return;
        }
        if let Some(instance) = self.instances.get_mut(index).and_then(Option::as_mut) {
            instance.dev.write(ctx, off, data);
        }
    }
}
