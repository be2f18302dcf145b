// Copyright The PSP Emulator Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! The emulated PSP core.
//!
//! A [`CpuCore`] owns the 256 KiB SRAM, any extra RAM regions, the eight x86
//! mapping slots and the instruction engine. Execution is single-threaded
//! cooperative: device callbacks, SVC handlers and proxy round-trips all run
//! synchronously on the thread inside [`CpuCore::exec_run`], and all of their
//! side effects are visible to the next instruction. The exclusive borrow on
//! the core makes a recursive `exec_run` unrepresentable.

use crate::{
    config::EmuMode,
    devices::DevCtx,
    executor::interp::ArmInterp,
    executor::{Bus, CoreReg, ExecError, Executor, MemFault, RunExit, RunLimits},
    iomgr::{IoManager, X86SlotRef},
    svc::{self, SvcState, x86map::X86MapSet},
};
use bitflags::bitflags;
use log::warn;
use std::cell::Cell;
use std::ops::Range;
use thiserror::Error;

/// SRAM size of one PSP, 256 KiB.
pub const SRAM_SIZE: usize = 0x4_0000;

/// PSP addresses where unknown accesses are tolerated: the MMIO hole.
/// Firmware probes unpopulated registers here and expects reads as zero.
const MMIO_HOLE: Range<u32> = 0x0300_0000..0x0400_0000;

/// Classic ARM supervisor-call vector, used when traps reflect to the guest.
const SVC_VECTOR: u32 = 0x0000_0008;

bitflags! {
    /// Access permissions of a RAM region.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct MemPerms: u8 {
        /// Readable.
        const R = 1 << 0;
        /// Writable.
        const W = 1 << 1;
        /// Executable.
        const X = 1 << 2;
    }
}

impl MemPerms {
    /// Read-write-execute.
    pub const RWX: Self = Self::R.union(Self::W).union(Self::X);
    /// Read-execute, for ROM images.
    pub const RX: Self = Self::R.union(Self::X);
}

/// Cooperative stop request shared between the core and device callbacks.
#[derive(Default)]
pub struct StopFlag(Cell<bool>);

impl StopFlag {
    /// Requests a stop; takes effect at the next instruction boundary.
    pub fn request(&self) {
        self.0.set(true);
    }

    /// Whether a stop is pending.
    pub fn requested(&self) -> bool {
        self.0.get()
    }

    fn clear(&self) {
        self.0.set(false);
    }
}

/// A plain RAM region outside SRAM.
pub struct RamRegion {
    base: u32,
    perms: MemPerms,
    data: Vec<u8>,
}

impl RamRegion {
    /// One past the last covered address; regions may run to the top of the
    /// 32-bit space, so this is 64-bit.
    fn end(&self) -> u64 {
        u64::from(self.base) + self.data.len() as u64
    }

    fn contains(&self, addr: u32, len: u32) -> bool {
        addr >= self.base && u64::from(addr) + u64::from(len) <= self.end()
    }
}

/// Adds a region to a region list, rejecting overlaps with SRAM or existing
/// regions. Shared between the core API and the SVC layer.
pub(crate) fn add_region(
    regions: &mut Vec<RamRegion>,
    base: u32,
    size: u32,
    perms: MemPerms,
) -> Result<(), CpuError> {
    let overlap =
        |a_base: u64, a_end: u64| u64::from(base) < a_end && a_base < u64::from(base) + u64::from(size);
    if overlap(0, SRAM_SIZE as u64) || regions.iter().any(|r| overlap(u64::from(r.base), r.end())) {
        return Err(CpuError::RegionOverlap { base, size });
    }
    regions.push(RamRegion {
        base,
        perms,
        data: vec![0; size as usize],
    });
    Ok(())
}

/// Core-level failures.
#[derive(Debug, Error)]
pub enum CpuError {
    /// The instruction engine failed; its state is preserved.
    #[error(transparent)]
    Exec(#[from] ExecError),
    /// A region would overlap an existing mapping.
    #[error("RAM region {base:#x}+{size:#x} overlaps an existing mapping")]
    RegionOverlap {
        /// Requested base.
        base: u32,
        /// Requested size.
        size: u32,
    },
}

/// Why [`CpuCore::exec_run`] returned.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RunStop {
    /// The instruction ceiling was reached.
    InstrLimit,
    /// The wall-clock ceiling was reached.
    Deadline,
    /// [`CpuCore::exec_stop`] (or a device callback) requested a stop.
    Stopped,
    /// The guest halted.
    Halted,
    /// The guest application exited through `svc 0`.
    GuestExit,
}

/// Per-run links to the rest of the CCD.
pub struct RunEnv<'a> {
    /// The I/O manager routing device windows.
    pub iomgr: &'a mut IoManager,
    /// Supervisor state, present in `App` mode.
    pub svc: Option<&'a mut SvcState>,
    /// Intercept `svc 0x6` for host-side logging even outside `App` mode.
    pub intercept_svc6: bool,
    /// Trace SVC dispatches.
    pub trace_svcs: bool,
}

/// The guest address-space view: SRAM, RAM regions, device windows, x86
/// mapping windows and SMN windows, in that resolution order.
pub struct GuestMem<'a> {
    pub(crate) sram: &'a mut [u8],
    pub(crate) regions: &'a mut Vec<RamRegion>,
    pub(crate) iomgr: &'a mut IoManager,
    pub(crate) x86: &'a mut X86MapSet,
    pub(crate) svc: Option<&'a mut SvcState>,
    pub(crate) stop: &'a StopFlag,
    pub(crate) ccd_id: u32,
}

impl GuestMem<'_> {
    /// Reads `len` bytes into a fresh buffer.
    pub fn read_vec(&mut self, addr: u32, len: usize) -> Result<Vec<u8>, MemFault> {
        let mut buf = vec![0; len];
        self.read(addr, &mut buf)?;
        Ok(buf)
    }

    /// Writes a little-endian doubleword.
    pub fn write_u64(&mut self, addr: u32, value: u64) -> Result<(), MemFault> {
        self.write(addr, &value.to_le_bytes())
    }

    /// Reads a NUL-terminated string of at most `max` bytes, lossily decoded.
    pub fn read_cstr(&mut self, addr: u32, max: usize) -> Result<String, MemFault> {
        let mut bytes = Vec::new();
        for i in 0..max {
            let mut byte = [0];
            self.read(addr.wrapping_add(i as u32), &mut byte)?;
            if byte[0] == 0 {
                break;
            }
            bytes.push(byte[0]);
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

impl Bus for GuestMem<'_> {
    fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), MemFault> {
        let len = buf.len() as u32;

        if (addr as usize) < SRAM_SIZE && addr as usize + buf.len() <= SRAM_SIZE {
            let at = addr as usize;
            buf.copy_from_slice(&self.sram[at..at + buf.len()]);
            return Ok(());
        }

        if let Some(region) = self.regions.iter().find(|r| r.contains(addr, len)) {
            let at = (addr - region.base) as usize;
            buf.copy_from_slice(&region.data[at..at + buf.len()]);
            return Ok(());
        }

        if let Some((dev, off)) = self.iomgr.mmio_at(addr, len) {
            let mut ctx = DevCtx {
                ccd_id: self.ccd_id,
                stop: self.stop,
            };
            self.iomgr.dev_read(dev, &mut ctx, off, buf);
            return Ok(());
        }

        if let Some(slot) = self.iomgr.x86_at(addr, len) {
            let mapping = match slot {
                X86SlotRef::Slot(index) => &mut self.x86.slots[index],
                X86SlotRef::Privileged => &mut self.x86.privileged,
            };
            let Some(state) = self.svc.as_deref_mut() else {
                return Err(MemFault::Proxy { addr });
            };
            return mapping.read(state.proxy.as_mut(), addr, buf);
        }

        if let Some(state) = self.svc.as_deref_mut() {
            if let Some(window) = state.smn_window_at(addr, len) {
                let smn_addr = window.smn_base + (addr - window.psp_base);
                if let Some((dev, off)) = self.iomgr.smn_at(window.ccd_target, smn_addr, len) {
                    let mut ctx = DevCtx {
                        ccd_id: self.ccd_id,
                        stop: self.stop,
                    };
                    self.iomgr.dev_read(dev, &mut ctx, off, buf);
                    return Ok(());
                }
                // No local device claims the fabric address; the remote PSP
                // has the same window live, so read through it.
                return state
                    .proxy
                    .mem_read(u64::from(addr), buf)
                    .map_err(|_| MemFault::Proxy { addr });
            }
        }

        if MMIO_HOLE.contains(&addr) {
            warn!("read of unassigned MMIO {addr:#010x} ({len} bytes), returning zeros");
            buf.fill(0);
            return Ok(());
        }

        Err(MemFault::Unmapped { addr })
    }

    fn write(&mut self, addr: u32, data: &[u8]) -> Result<(), MemFault> {
        let len = data.len() as u32;

        if (addr as usize) < SRAM_SIZE && addr as usize + data.len() <= SRAM_SIZE {
            let at = addr as usize;
            self.sram[at..at + data.len()].copy_from_slice(data);
            return Ok(());
        }

        if let Some(region) = self.regions.iter_mut().find(|r| r.contains(addr, len)) {
            if !region.perms.contains(MemPerms::W) {
                return Err(MemFault::Denied { addr });
            }
            let at = (addr - region.base) as usize;
            region.data[at..at + data.len()].copy_from_slice(data);
            return Ok(());
        }

        if let Some((dev, off)) = self.iomgr.mmio_at(addr, len) {
            let mut ctx = DevCtx {
                ccd_id: self.ccd_id,
                stop: self.stop,
            };
            self.iomgr.dev_write(dev, &mut ctx, off, data);
            return Ok(());
        }

        if let Some(slot) = self.iomgr.x86_at(addr, len) {
            let mapping = match slot {
                X86SlotRef::Slot(index) => &mut self.x86.slots[index],
                X86SlotRef::Privileged => &mut self.x86.privileged,
            };
            let Some(state) = self.svc.as_deref_mut() else {
                return Err(MemFault::Proxy { addr });
            };
            return mapping.write(state.proxy.as_mut(), addr, data);
        }

        if let Some(state) = self.svc.as_deref_mut() {
            if let Some(window) = state.smn_window_at(addr, len) {
                let smn_addr = window.smn_base + (addr - window.psp_base);
                if let Some((dev, off)) = self.iomgr.smn_at(window.ccd_target, smn_addr, len) {
                    let mut ctx = DevCtx {
                        ccd_id: self.ccd_id,
                        stop: self.stop,
                    };
                    self.iomgr.dev_write(dev, &mut ctx, off, data);
                    return Ok(());
                }
                return state
                    .proxy
                    .mem_write(u64::from(addr), data)
                    .map_err(|_| MemFault::Proxy { addr });
            }
        }

        if MMIO_HOLE.contains(&addr) {
            warn!("write to unassigned MMIO {addr:#010x} ({len} bytes) discarded");
            return Ok(());
        }

        Err(MemFault::Unmapped { addr })
    }

    fn stop_requested(&self) -> bool {
        self.stop.requested()
    }
}

/// One emulated PSP core.
pub struct CpuCore {
    mode: EmuMode,
    ccd_id: u32,
    sram: Vec<u8>,
    regions: Vec<RamRegion>,
    exec: Box<dyn Executor>,
    next_pc: u32,
    stop: StopFlag,
    x86: X86MapSet,
}

impl CpuCore {
    /// Creates a core with the built-in interpreter backend.
    pub fn new(mode: EmuMode) -> Self {
        Self::with_executor(mode, Box::new(ArmInterp::new()))
    }

    /// Creates a core around an external instruction engine.
    pub fn with_executor(mode: EmuMode, exec: Box<dyn Executor>) -> Self {
        Self {
            mode,
            ccd_id: 0,
            sram: vec![0; SRAM_SIZE],
            regions: Vec::new(),
            exec,
            next_pc: 0,
            stop: StopFlag::default(),
            x86: X86MapSet::new(),
        }
    }

    /// The emulation mode the core was created in.
    #[allow(unused)]
    pub fn mode(&self) -> EmuMode {
        self.mode
    }

    /// Stores the CCD identifier.
    pub fn set_ccd_id(&mut self, ccd_id: u32) {
        self.ccd_id = ccd_id;
    }

    /// Returns the CCD identifier.
    #[allow(unused)]
    pub fn ccd_id(&self) -> u32 {
        self.ccd_id
    }

    /// The x86 mapping slots.
    #[allow(unused)]
    pub fn x86_mappings(&self) -> &X86MapSet {
        &self.x86
    }

    /// Host-side read of plain guest RAM (SRAM and extra regions).
    #[allow(unused)]
    pub fn mem_read(&self, addr: u32, buf: &mut [u8]) -> Result<(), MemFault> {
        let len = buf.len() as u32;
        if (addr as usize) < SRAM_SIZE && addr as usize + buf.len() <= SRAM_SIZE {
            let at = addr as usize;
            buf.copy_from_slice(&self.sram[at..at + buf.len()]);
            return Ok(());
        }
        if let Some(region) = self.regions.iter().find(|r| r.contains(addr, len)) {
            let at = (addr - region.base) as usize;
            buf.copy_from_slice(&region.data[at..at + buf.len()]);
            return Ok(());
        }
        Err(MemFault::Unmapped { addr })
    }

    /// Host-side write of plain guest RAM. Region permissions do not apply
    /// to the host; the loader writes ROM regions through this.
    pub fn mem_write(&mut self, addr: u32, data: &[u8]) -> Result<(), MemFault> {
        let len = data.len() as u32;
        if (addr as usize) < SRAM_SIZE && addr as usize + data.len() <= SRAM_SIZE {
            let at = addr as usize;
            self.sram[at..at + data.len()].copy_from_slice(data);
            return Ok(());
        }
        if let Some(region) = self.regions.iter_mut().find(|r| r.contains(addr, len)) {
            let at = (addr - region.base) as usize;
            region.data[at..at + data.len()].copy_from_slice(data);
            return Ok(());
        }
        Err(MemFault::Unmapped { addr })
    }

    /// Adds a zero-initialised RAM region. Fails on overlap.
    pub fn mem_add_region(
        &mut self,
        base: u32,
        size: u32,
        perms: MemPerms,
    ) -> Result<(), CpuError> {
        add_region(&mut self.regions, base, size, perms)
    }

    /// Writes a core register.
    #[allow(unused)]
    pub fn set_reg(&mut self, reg: CoreReg, value: u32) {
        self.exec.reg_write(reg, value);
        if reg == CoreReg::Pc {
            self.next_pc = value;
        }
    }

    /// Reads a core register.
    pub fn reg(&self, reg: CoreReg) -> u32 {
        self.exec.reg_read(reg)
    }

    /// Sets the address the next [`CpuCore::exec_run`] starts from.
    pub fn exec_set_start_addr(&mut self, addr: u32) {
        self.next_pc = addr;
        self.exec.reg_write(CoreReg::Pc, addr);
    }

    /// The address the next run will start from.
    #[allow(unused)]
    pub fn start_addr(&self) -> u32 {
        self.next_pc
    }

    /// Requests a cooperative stop. Callable from device callbacks and SVC
    /// handlers; takes effect no later than the end of the current
    /// instruction.
    #[allow(unused)]
    pub fn exec_stop(&self) {
        self.stop.request();
    }

    /// Zeroes SRAM and the register file, drops extra regions and mappings.
    pub fn reset(&mut self) {
        self.sram.fill(0);
        self.regions.clear();
        self.exec.reset();
        self.next_pc = 0;
        self.stop.clear();
        self.x86.reset();
    }

    /// Runs guest code from the stored start address until a ceiling is
    /// reached, the guest halts or exits, a fault occurs, or a stop request
    /// takes effect.
    ///
    /// SVC traps are dispatched per the emulation mode: in `App` mode through
    /// the supervisor-call table, in the `System` modes by reflecting into
    /// the guest's own vector (with optional `svc 0x6` interception).
    pub fn exec_run(&mut self, env: &mut RunEnv, limits: RunLimits) -> Result<RunStop, CpuError> {
        self.stop.clear();
        let mut remaining = limits.max_insns;

        loop {
            let start = self.next_pc;
            let outcome = {
                let Self {
                    exec,
                    sram,
                    regions,
                    x86,
                    stop,
                    ccd_id,
                    ..
                } = self;
                let mut mem = GuestMem {
                    sram,
                    regions,
                    iomgr: env.iomgr,
                    x86,
                    svc: env.svc.as_deref_mut(),
                    stop,
                    ccd_id: *ccd_id,
                };
                exec.run(
                    &mut mem,
                    start,
                    RunLimits {
                        max_insns: remaining,
                        deadline: limits.deadline,
                    },
                )?
            };
            self.next_pc = self.exec.reg_read(CoreReg::Pc);
            if let Some(rem) = &mut remaining {
                *rem = rem.saturating_sub(outcome.retired);
            }

            match outcome.exit {
                RunExit::Svc(imm) => {
                    let halted = self.handle_svc_trap(imm, env);
                    self.next_pc = self.exec.reg_read(CoreReg::Pc);
                    if halted {
                        return Ok(RunStop::GuestExit);
                    }
                    if remaining == Some(0) {
                        return Ok(RunStop::InstrLimit);
                    }
                }
                RunExit::InstrLimit => return Ok(RunStop::InstrLimit),
                RunExit::Deadline => return Ok(RunStop::Deadline),
                RunExit::Stopped => return Ok(RunStop::Stopped),
                RunExit::Wfi => return Ok(RunStop::Halted),
            }
        }
    }

    /// Dispatches one `svc #imm` trap. Returns whether the guest exited.
    fn handle_svc_trap(&mut self, imm: u32, env: &mut RunEnv) -> bool {
        let intercepted = self.mode == EmuMode::App || (env.intercept_svc6 && imm == 0x6);
        if !intercepted {
            // Reflect the trap to the guest supervisor: LR holds the return
            // address, execution continues at the vector.
            let ret = self.exec.reg_read(CoreReg::Pc);
            self.exec.reg_write(CoreReg::Lr, ret);
            self.exec.reg_write(CoreReg::Pc, SVC_VECTOR);
            return false;
        }

        let Self {
            exec,
            sram,
            regions,
            x86,
            stop,
            ccd_id,
            mode,
            ..
        } = self;
        let mut ctx = svc::SvcCtx {
            exec: exec.as_mut(),
            mode: *mode,
            trace: env.trace_svcs,
            halt: false,
            mem: GuestMem {
                sram,
                regions,
                iomgr: env.iomgr,
                x86,
                svc: env.svc.as_deref_mut(),
                stop,
                ccd_id: *ccd_id,
            },
        };
        svc::dispatch(&mut ctx, imm)
    }

    /// Splits the core into its executor and a guest memory view, for the
    /// SVC layer, tests and debugger integration.
    pub(crate) fn split_mem<'a>(
        &'a mut self,
        iomgr: &'a mut IoManager,
        svc: Option<&'a mut SvcState>,
    ) -> (&'a mut dyn Executor, GuestMem<'a>) {
        let Self {
            exec,
            sram,
            regions,
            x86,
            stop,
            ccd_id,
            ..
        } = self;
        (
            exec.as_mut(),
            GuestMem {
                sram,
                regions,
                iomgr,
                x86,
                svc,
                stop,
                ccd_id: *ccd_id,
            },
        )
    }
}
