// Copyright The PSP Emulator Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! The seam between the emulator core and the instruction-execution engine.
//!
//! The engine is deliberately a black box: the core only needs register file
//! access and a way to run guest code against an address-space view until
//! something interesting happens. Alternative engines can be slotted in by
//! implementing [`Executor`].

pub mod interp;

use num_enum::TryFromPrimitive;
use std::time::Instant;
use thiserror::Error;

/// ARM core registers visible through the executor seam.
///
/// Index 0 is an unused sentinel so that raw register numbers coming from
/// debugger integrations start at 1.
#[derive(Copy, Clone, Debug, Eq, PartialEq, TryFromPrimitive)]
#[repr(u32)]
#[allow(missing_docs)]
pub enum CoreReg {
    Invalid = 0,
    R0,
    R1,
    R2,
    R3,
    R4,
    R5,
    R6,
    R7,
    R8,
    R9,
    R10,
    R11,
    R12,
    Sp,
    Lr,
    Pc,
}

/// A guest memory access width supported by device windows.
#[derive(Copy, Clone, Debug, Eq, PartialEq, TryFromPrimitive)]
#[repr(u32)]
pub enum AccessWidth {
    /// Single byte.
    Byte = 1,
    /// Halfword.
    Half = 2,
    /// Word.
    Word = 4,
}

/// A failed guest memory access.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Error)]
pub enum MemFault {
    /// The address hit no SRAM, RAM region, device window or mapping.
    #[error("unmapped guest address {addr:#010x}")]
    Unmapped {
        /// The faulting guest address.
        addr: u32,
    },
    /// The access hit a read-only region with a write, or vice versa.
    #[error("access to {addr:#010x} denied by region permissions")]
    Denied {
        /// The faulting guest address.
        addr: u32,
    },
    /// A backing fill or flush through the proxy failed mid-access.
    #[error("proxy-backed access to {addr:#010x} failed")]
    Proxy {
        /// The faulting guest address.
        addr: u32,
    },
}

/// The guest address-space view an [`Executor`] dereferences through.
///
/// One `Bus` is borrowed for the duration of a single [`Executor::run`] call;
/// device callbacks and mapping fills run synchronously behind it, on the
/// executor thread.
pub trait Bus {
    /// Reads `buf.len()` bytes from the guest address space.
    fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), MemFault>;

    /// Writes `data` to the guest address space.
    fn write(&mut self, addr: u32, data: &[u8]) -> Result<(), MemFault>;

    /// Returns whether a cooperative stop was requested.
    ///
    /// Executors must poll this at every instruction boundary.
    fn stop_requested(&self) -> bool;

    /// Reads a little-endian word.
    fn read_u32(&mut self, addr: u32) -> Result<u32, MemFault> {
        let mut bytes = [0; 4];
        self.read(addr, &mut bytes)?;
        Ok(u32::from_le_bytes(bytes))
    }

    /// Writes a little-endian word.
    fn write_u32(&mut self, addr: u32, value: u32) -> Result<(), MemFault> {
        self.write(addr, &value.to_le_bytes())
    }
}

/// Optional ceilings for one [`Executor::run`] call.
///
/// Reaching a ceiling is a normal return, not an error.
#[derive(Copy, Clone, Debug, Default)]
pub struct RunLimits {
    /// Maximum number of instructions to retire.
    pub max_insns: Option<u64>,
    /// Wall-clock deadline.
    pub deadline: Option<Instant>,
}

impl RunLimits {
    /// No ceilings; run until the guest halts or a stop is requested.
    pub const UNBOUNDED: Self = Self {
        max_insns: None,
        deadline: None,
    };
}

/// Why [`Executor::run`] returned.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RunExit {
    /// The guest executed `svc #imm`. The PC already points past the
    /// instruction; the caller dispatches the call and may resume.
    Svc(u32),
    /// The instruction ceiling was reached.
    InstrLimit,
    /// The wall-clock deadline passed.
    Deadline,
    /// A cooperative stop request took effect.
    Stopped,
    /// The guest halted (`wfi` with nothing to wake it).
    Wfi,
}

/// The outcome of one [`Executor::run`] call.
#[derive(Copy, Clone, Debug)]
pub struct RunOutcome {
    /// Why execution returned.
    pub exit: RunExit,
    /// Instructions retired during this call.
    pub retired: u64,
}

/// An unrecoverable executor error. Register and memory state are preserved
/// for inspection.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Error)]
pub enum ExecError {
    /// The engine hit an instruction encoding it does not model.
    #[error("undefined instruction {insn:#010x} at {pc:#010x}")]
    Undefined {
        /// Address of the instruction.
        pc: u32,
        /// The raw encoding.
        insn: u32,
    },
    /// A guest memory access faulted.
    #[error("memory fault at {pc:#010x}: {fault}")]
    Memory {
        /// Address of the faulting instruction.
        pc: u32,
        /// The underlying fault.
        fault: MemFault,
    },
}

/// A pluggable 32-bit ARM instruction engine.
pub trait Executor {
    /// Resets the register file and internal state to power-on values.
    fn reset(&mut self);

    /// Reads a core register. The `Invalid` sentinel reads as zero.
    fn reg_read(&self, reg: CoreReg) -> u32;

    /// Writes a core register. Writes to the `Invalid` sentinel are ignored.
    fn reg_write(&mut self, reg: CoreReg, value: u32);

    /// Runs from `start` until an exit condition is hit.
    fn run(
        &mut self,
        bus: &mut dyn Bus,
        start: u32,
        limits: RunLimits,
    ) -> Result<RunOutcome, ExecError>;
}
