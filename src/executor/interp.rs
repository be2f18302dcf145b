// Copyright The PSP Emulator Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Built-in A32 interpreter.
//!
//! This models the subset of the ARMv7 A32 instruction set that PSP firmware
//! startup paths exercise: data-processing with full barrel-shifter operands,
//! `MOVW`/`MOVT`, `MUL`/`MLA`, word/byte/halfword loads and stores with all
//! addressing modes, `LDM`/`STM`, branches, `SVC`, `WFI` and the hint space.
//! Encodings outside the subset stop execution with
//! [`ExecError::Undefined`] and preserved state, so unexpected firmware can
//! be diagnosed rather than silently misexecuted.
//!
//! No cycle accuracy is attempted. The wall-clock deadline is polled every
//! 1024 retired instructions to keep the fast path tight.

use super::{Bus, CoreReg, ExecError, Executor, MemFault, RunExit, RunLimits, RunOutcome};
use std::time::Instant;

const DEADLINE_POLL_MASK: u64 = 0x3ff;

/// Condition flags of the CPSR.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
struct Flags {
    n: bool,
    z: bool,
    c: bool,
    v: bool,
}

/// What a single executed instruction did to control flow.
enum Exec {
    Retired,
    Svc(u32),
    Wfi,
    Bkpt,
}

/// The default instruction engine.
pub struct ArmInterp {
    /// r0-r12, sp, lr, pc. During execution `regs[15]` holds the address of
    /// the next instruction to fetch; operand reads of r15 see the
    /// architectural pc + 8.
    regs: [u32; 16],
    flags: Flags,
}

impl Default for ArmInterp {
    fn default() -> Self {
        Self::new()
    }
}

impl ArmInterp {
    /// Creates an interpreter with a zeroed register file.
    pub fn new() -> Self {
        Self {
            regs: [0; 16],
            flags: Flags::default(),
        }
    }

    fn cond_passed(&self, cond: u32) -> bool {
        let Flags { n, z, c, v } = self.flags;
        match cond {
            0x0 => z,
            0x1 => !z,
            0x2 => c,
            0x3 => !c,
            0x4 => n,
            0x5 => !n,
            0x6 => v,
            0x7 => !v,
            0x8 => c && !z,
            0x9 => !c || z,
            0xa => n == v,
            0xb => n != v,
            0xc => !z && n == v,
            0xd => z || n != v,
            _ => true,
        }
    }

    /// Reads a register as a data-processing operand, with the r15 offset.
    fn op_reg(&self, index: usize, pc: u32) -> u32 {
        if index == 15 {
            pc.wrapping_add(8)
        } else {
            self.regs[index]
        }
    }

    /// Writes a register; writes to r15 branch (word aligned, ARM state).
    fn set_reg(&mut self, index: usize, value: u32) {
        if index == 15 {
            self.regs[15] = value & !3;
        } else {
            self.regs[index] = value;
        }
    }

    fn cpsr(&self) -> u32 {
        let Flags { n, z, c, v } = self.flags;
        (u32::from(n) << 31)
            | (u32::from(z) << 30)
            | (u32::from(c) << 29)
            | (u32::from(v) << 28)
            | 0x0000_01d3
    }

    fn set_cpsr_flags(&mut self, value: u32) {
        self.flags = Flags {
            n: value & (1 << 31) != 0,
            z: value & (1 << 30) != 0,
            c: value & (1 << 29) != 0,
            v: value & (1 << 28) != 0,
        };
    }

    /// Rotated-immediate operand: value and shifter carry-out.
    fn imm_operand(&self, insn: u32) -> (u32, bool) {
        let rot = ((insn >> 8) & 0xf) * 2;
        let value = (insn & 0xff).rotate_right(rot);
        let carry = if rot == 0 {
            self.flags.c
        } else {
            value >> 31 != 0
        };
        (value, carry)
    }

    /// Shifted-register operand: value and shifter carry-out.
    fn reg_operand(&self, insn: u32, pc: u32) -> (u32, bool) {
        let value = self.op_reg((insn & 0xf) as usize, pc);
        let shift_type = (insn >> 5) & 3;
        let by_reg = insn & 0x10 != 0;

        if by_reg {
            let amount = self.regs[((insn >> 8) & 0xf) as usize] & 0xff;
            return shift_by_reg(value, shift_type, amount, self.flags.c);
        }

        let amount = (insn >> 7) & 0x1f;
        match (shift_type, amount) {
            (0, 0) => (value, self.flags.c),
            (0, n) => (value << n, value & (1 << (32 - n)) != 0),
            // LSR #0 encodes LSR #32.
            (1, 0) => (0, value >> 31 != 0),
            (1, n) => (value >> n, value & (1 << (n - 1)) != 0),
            // ASR #0 encodes ASR #32.
            (2, 0) => (((value as i32) >> 31) as u32, value >> 31 != 0),
            (2, n) => (((value as i32) >> n) as u32, value & (1 << (n - 1)) != 0),
            // ROR #0 encodes RRX.
            (3, 0) => (
                (u32::from(self.flags.c) << 31) | (value >> 1),
                value & 1 != 0,
            ),
            (_, n) => {
                let rotated = value.rotate_right(n);
                (rotated, rotated >> 31 != 0)
            }
        }
    }

    fn data_processing(&mut self, insn: u32, pc: u32, op2: u32, shifter_carry: bool) {
        let opcode = (insn >> 21) & 0xf;
        let s = insn & (1 << 20) != 0;
        let rn = ((insn >> 16) & 0xf) as usize;
        let rd = ((insn >> 12) & 0xf) as usize;
        let a = self.op_reg(rn, pc);
        let c_in = self.flags.c;

        enum Out {
            Logical(u32),
            Arith(u32, bool, bool),
            None(u32, bool, bool),
            NoneLogical(u32),
        }

        let out = match opcode {
            0x0 => Out::Logical(a & op2),
            0x1 => Out::Logical(a ^ op2),
            0x2 => {
                let (r, c, v) = add_with_carry(a, !op2, true);
                Out::Arith(r, c, v)
            }
            0x3 => {
                let (r, c, v) = add_with_carry(op2, !a, true);
                Out::Arith(r, c, v)
            }
            0x4 => {
                let (r, c, v) = add_with_carry(a, op2, false);
                Out::Arith(r, c, v)
            }
            0x5 => {
                let (r, c, v) = add_with_carry(a, op2, c_in);
                Out::Arith(r, c, v)
            }
            0x6 => {
                let (r, c, v) = add_with_carry(a, !op2, c_in);
                Out::Arith(r, c, v)
            }
            0x7 => {
                let (r, c, v) = add_with_carry(op2, !a, c_in);
                Out::Arith(r, c, v)
            }
            0x8 => Out::NoneLogical(a & op2),
            0x9 => Out::NoneLogical(a ^ op2),
            0xa => {
                let (r, c, v) = add_with_carry(a, !op2, true);
                Out::None(r, c, v)
            }
            0xb => {
                let (r, c, v) = add_with_carry(a, op2, false);
                Out::None(r, c, v)
            }
            0xc => Out::Logical(a | op2),
            0xd => Out::Logical(op2),
            0xe => Out::Logical(a & !op2),
            _ => Out::Logical(!op2),
        };

        let (result, write, flags) = match out {
            Out::Logical(r) => (r, true, (shifter_carry, self.flags.v)),
            Out::Arith(r, c, v) => (r, true, (c, v)),
            Out::None(r, c, v) => (r, false, (c, v)),
            Out::NoneLogical(r) => (r, false, (shifter_carry, self.flags.v)),
        };

        if write {
            self.set_reg(rd, result);
        }
        if s && rd != 15 || !write {
            self.flags.n = result >> 31 != 0;
            self.flags.z = result == 0;
            self.flags.c = flags.0;
            self.flags.v = flags.1;
        }
    }

    fn multiply(&mut self, insn: u32) {
        let accumulate = insn & (1 << 21) != 0;
        let s = insn & (1 << 20) != 0;
        let rd = ((insn >> 16) & 0xf) as usize;
        let acc = ((insn >> 12) & 0xf) as usize;
        let rs = ((insn >> 8) & 0xf) as usize;
        let rm = (insn & 0xf) as usize;

        let mut result = self.regs[rm].wrapping_mul(self.regs[rs]);
        if accumulate {
            result = result.wrapping_add(self.regs[acc]);
        }
        self.set_reg(rd, result);
        if s {
            self.flags.n = result >> 31 != 0;
            self.flags.z = result == 0;
        }
    }

    fn load_store_word(
        &mut self,
        bus: &mut dyn Bus,
        insn: u32,
        pc: u32,
        offset: u32,
    ) -> Result<(), MemFault> {
        let pre = insn & (1 << 24) != 0;
        let up = insn & (1 << 23) != 0;
        let byte = insn & (1 << 22) != 0;
        let writeback = insn & (1 << 21) != 0;
        let load = insn & (1 << 20) != 0;
        let rn = ((insn >> 16) & 0xf) as usize;
        let rd = ((insn >> 12) & 0xf) as usize;

        let base = self.op_reg(rn, pc);
        let indexed = if up {
            base.wrapping_add(offset)
        } else {
            base.wrapping_sub(offset)
        };
        let ea = if pre { indexed } else { base };

        if !pre || writeback {
            self.regs[rn] = indexed;
        }

        if load {
            let value = if byte {
                let mut b = [0; 1];
                bus.read(ea, &mut b)?;
                u32::from(b[0])
            } else {
                bus.read_u32(ea)?
            };
            self.set_reg(rd, value);
        } else {
            let value = self.op_reg(rd, pc);
            if byte {
                bus.write(ea, &[value as u8])?;
            } else {
                bus.write_u32(ea, value)?;
            }
        }
        Ok(())
    }

    fn load_store_half(
        &mut self,
        bus: &mut dyn Bus,
        insn: u32,
        pc: u32,
    ) -> Result<Result<(), MemFault>, ()> {
        let pre = insn & (1 << 24) != 0;
        let up = insn & (1 << 23) != 0;
        let imm_form = insn & (1 << 22) != 0;
        let writeback = insn & (1 << 21) != 0;
        let load = insn & (1 << 20) != 0;
        let rn = ((insn >> 16) & 0xf) as usize;
        let rd = ((insn >> 12) & 0xf) as usize;
        let kind = (insn >> 5) & 3;

        // LDRD/STRD are not modelled.
        if !load && kind != 1 {
            return Err(());
        }

        let offset = if imm_form {
            ((insn >> 4) & 0xf0) | (insn & 0xf)
        } else {
            self.regs[(insn & 0xf) as usize]
        };
        let base = self.op_reg(rn, pc);
        let indexed = if up {
            base.wrapping_add(offset)
        } else {
            base.wrapping_sub(offset)
        };
        let ea = if pre { indexed } else { base };

        if !pre || writeback {
            self.regs[rn] = indexed;
        }

        let access = (|| {
            if load {
                let value = match kind {
                    1 => {
                        let mut b = [0; 2];
                        bus.read(ea, &mut b)?;
                        u32::from(u16::from_le_bytes(b))
                    }
                    2 => {
                        let mut b = [0; 1];
                        bus.read(ea, &mut b)?;
                        b[0] as i8 as i32 as u32
                    }
                    _ => {
                        let mut b = [0; 2];
                        bus.read(ea, &mut b)?;
                        i16::from_le_bytes(b) as i32 as u32
                    }
                };
                self.set_reg(rd, value);
                Ok(())
            } else {
                let value = self.op_reg(rd, pc) as u16;
                bus.write(ea, &value.to_le_bytes())
            }
        })();
        Ok(access)
    }

    fn load_store_multiple(
        &mut self,
        bus: &mut dyn Bus,
        insn: u32,
        pc: u32,
    ) -> Result<(), MemFault> {
        let pre = insn & (1 << 24) != 0;
        let up = insn & (1 << 23) != 0;
        let writeback = insn & (1 << 21) != 0;
        let load = insn & (1 << 20) != 0;
        let rn = ((insn >> 16) & 0xf) as usize;
        let list = insn & 0xffff;
        let count = list.count_ones();

        let base = self.regs[rn];
        let bytes = count * 4;
        let start = match (up, pre) {
            (true, false) => base,
            (true, true) => base.wrapping_add(4),
            (false, false) => base.wrapping_sub(bytes).wrapping_add(4),
            (false, true) => base.wrapping_sub(bytes),
        };
        let new_base = if up {
            base.wrapping_add(bytes)
        } else {
            base.wrapping_sub(bytes)
        };

        if load {
            if writeback {
                self.regs[rn] = new_base;
            }
            let mut addr = start;
            let mut branch = None;
            for i in 0..16 {
                if list & (1 << i) == 0 {
                    continue;
                }
                let value = bus.read_u32(addr)?;
                if i == 15 {
                    branch = Some(value);
                } else {
                    self.regs[i] = value;
                }
                addr = addr.wrapping_add(4);
            }
            if let Some(target) = branch {
                self.set_reg(15, target);
            }
        } else {
            let mut addr = start;
            for i in 0..16 {
                if list & (1 << i) == 0 {
                    continue;
                }
                bus.write_u32(addr, self.op_reg(i, pc))?;
                addr = addr.wrapping_add(4);
            }
            if writeback {
                self.regs[rn] = new_base;
            }
        }
        Ok(())
    }

    fn execute(&mut self, bus: &mut dyn Bus, pc: u32, insn: u32) -> Result<Exec, ExecError> {
        let mem = |fault| ExecError::Memory { pc, fault };
        let undef = ExecError::Undefined { pc, insn };

        match (insn >> 25) & 7 {
            0b000 => {
                if insn & 0x0fff_fff0 == 0x012f_ff10 {
                    // BX
                    let target = self.op_reg((insn & 0xf) as usize, pc);
                    self.set_reg(15, target);
                } else if insn & 0x0fff_fff0 == 0x012f_ff30 {
                    // BLX (register)
                    let target = self.op_reg((insn & 0xf) as usize, pc);
                    self.regs[14] = pc.wrapping_add(4);
                    self.set_reg(15, target);
                } else if insn & 0x0ff0_00f0 == 0x0120_0070 {
                    return Ok(Exec::Bkpt);
                } else if insn & 0x0fc0_00f0 == 0x0000_0090 {
                    self.multiply(insn);
                } else if insn & 0x0e00_0090 == 0x0000_0090 && (insn >> 5) & 3 != 0 {
                    self.load_store_half(bus, insn, pc)
                        .map_err(|()| undef)?
                        .map_err(mem)?;
                } else if insn & 0x0fbf_0fff == 0x010f_0000 {
                    // MRS
                    let rd = ((insn >> 12) & 0xf) as usize;
                    self.set_reg(rd, self.cpsr());
                } else if insn & 0x0fb0_fff0 == 0x0120_f000 {
                    // MSR (register); only the flags field is modelled.
                    if insn & (1 << 19) != 0 {
                        let value = self.regs[(insn & 0xf) as usize];
                        self.set_cpsr_flags(value);
                    }
                } else if insn & 0x90 == 0x90 {
                    // Remaining 1001-space encodings (SWP, UMULL, ...).
                    return Err(undef);
                } else {
                    let (op2, carry) = self.reg_operand(insn, pc);
                    self.data_processing(insn, pc, op2, carry);
                }
            }
            0b001 => {
                if insn & 0x0ff0_0000 == 0x0300_0000 {
                    // MOVW
                    let rd = ((insn >> 12) & 0xf) as usize;
                    let imm = ((insn >> 4) & 0xf000) | (insn & 0xfff);
                    self.set_reg(rd, imm);
                } else if insn & 0x0ff0_0000 == 0x0340_0000 {
                    // MOVT
                    let rd = ((insn >> 12) & 0xf) as usize;
                    let imm = ((insn >> 4) & 0xf000) | (insn & 0xfff);
                    let value = (self.regs[rd] & 0xffff) | (imm << 16);
                    self.set_reg(rd, value);
                } else if insn & 0x0fb0_f000 == 0x0320_f000 {
                    if (insn >> 16) & 0xf == 0 {
                        // Hint space: WFI halts, everything else retires.
                        if insn & 0xff == 3 {
                            return Ok(Exec::Wfi);
                        }
                    } else if insn & (1 << 19) != 0 {
                        // MSR (immediate), flags field.
                        let (value, _) = self.imm_operand(insn);
                        self.set_cpsr_flags(value);
                    }
                } else {
                    let (op2, carry) = self.imm_operand(insn);
                    self.data_processing(insn, pc, op2, carry);
                }
            }
            0b010 => {
                let offset = insn & 0xfff;
                self.load_store_word(bus, insn, pc, offset).map_err(mem)?;
            }
            0b011 => {
                if insn & 0x10 != 0 {
                    return Err(undef);
                }
                let (offset, _) = self.reg_operand(insn, pc);
                self.load_store_word(bus, insn, pc, offset).map_err(mem)?;
            }
            0b100 => {
                self.load_store_multiple(bus, insn, pc).map_err(mem)?;
            }
            0b101 => {
                let offset = ((insn & 0x00ff_ffff) << 8) as i32 >> 6;
                let target = pc.wrapping_add(8).wrapping_add(offset as u32);
                if insn & (1 << 24) != 0 {
                    self.regs[14] = pc.wrapping_add(4);
                }
                self.set_reg(15, target);
            }
            _ => {
                if insn & 0x0f00_0000 == 0x0f00_0000 {
                    return Ok(Exec::Svc(insn & 0x00ff_ffff));
                }
                if insn & 0x0f00_0010 == 0x0e00_0010 {
                    // MCR is ignored, MRC reads as zero. Firmware pokes CP15
                    // cache maintenance ops which have no meaning here.
                    if insn & (1 << 20) != 0 {
                        let rd = ((insn >> 12) & 0xf) as usize;
                        if rd != 15 {
                            self.regs[rd] = 0;
                        }
                    }
                } else {
                    return Err(undef);
                }
            }
        }
        Ok(Exec::Retired)
    }
}

impl Executor for ArmInterp {
    fn reset(&mut self) {
        self.regs = [0; 16];
        self.flags = Flags::default();
    }

    fn reg_read(&self, reg: CoreReg) -> u32 {
        match (reg as usize).checked_sub(1) {
            Some(index) => self.regs[index],
            None => 0,
        }
    }

    fn reg_write(&mut self, reg: CoreReg, value: u32) {
        if let Some(index) = (reg as usize).checked_sub(1) {
            self.regs[index] = value;
        }
    }

    fn run(
        &mut self,
        bus: &mut dyn Bus,
        start: u32,
        limits: RunLimits,
    ) -> Result<RunOutcome, ExecError> {
        self.regs[15] = start & !3;
        let mut retired = 0u64;

        loop {
            if bus.stop_requested() {
                return Ok(RunOutcome {
                    exit: RunExit::Stopped,
                    retired,
                });
            }
            if limits.max_insns.is_some_and(|max| retired >= max) {
                return Ok(RunOutcome {
                    exit: RunExit::InstrLimit,
                    retired,
                });
            }
            if retired & DEADLINE_POLL_MASK == 0
                && limits.deadline.is_some_and(|d| Instant::now() >= d)
            {
                return Ok(RunOutcome {
                    exit: RunExit::Deadline,
                    retired,
                });
            }

            let pc = self.regs[15];
            let insn = bus
                .read_u32(pc)
                .map_err(|fault| ExecError::Memory { pc, fault })?;
            self.regs[15] = pc.wrapping_add(4);

            let cond = insn >> 28;
            if cond == 0xf {
                return Err(ExecError::Undefined { pc, insn });
            }
            if self.cond_passed(cond) {
                match self.execute(bus, pc, insn)? {
                    Exec::Retired => {}
                    Exec::Svc(imm) => {
                        return Ok(RunOutcome {
                            exit: RunExit::Svc(imm),
                            retired: retired + 1,
                        });
                    }
                    Exec::Wfi => {
                        return Ok(RunOutcome {
                            exit: RunExit::Wfi,
                            retired: retired + 1,
                        });
                    }
                    Exec::Bkpt => {
                        return Ok(RunOutcome {
                            exit: RunExit::Stopped,
                            retired: retired + 1,
                        });
                    }
                }
            }
            retired += 1;
        }
    }
}

/// Shift by a register-supplied amount, with the ARM special cases for
/// amounts of 0, 32 and above.
fn shift_by_reg(value: u32, shift_type: u32, amount: u32, c_in: bool) -> (u32, bool) {
    if amount == 0 {
        return (value, c_in);
    }
    match shift_type {
        0 => match amount {
            1..=31 => (value << amount, value & (1 << (32 - amount)) != 0),
            32 => (0, value & 1 != 0),
            _ => (0, false),
        },
        1 => match amount {
            1..=31 => (value >> amount, value & (1 << (amount - 1)) != 0),
            32 => (0, value >> 31 != 0),
            _ => (0, false),
        },
        2 => {
            if amount < 32 {
                (
                    ((value as i32) >> amount) as u32,
                    value & (1 << (amount - 1)) != 0,
                )
            } else {
                (((value as i32) >> 31) as u32, value >> 31 != 0)
            }
        }
        _ => {
            let eff = amount % 32;
            if eff == 0 {
                (value, value >> 31 != 0)
            } else {
                let rotated = value.rotate_right(eff);
                (rotated, rotated >> 31 != 0)
            }
        }
    }
}

fn add_with_carry(a: u32, b: u32, carry_in: bool) -> (u32, bool, bool) {
    let (partial, c1) = a.overflowing_add(b);
    let (result, c2) = partial.overflowing_add(u32::from(carry_in));
    let overflow = (!(a ^ b) & (a ^ result)) >> 31 != 0;
    (result, c1 | c2, overflow)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A flat RAM bus for interpreter tests.
    struct RamBus {
        mem: Vec<u8>,
        stop: bool,
    }

    impl RamBus {
        fn new() -> Self {
            Self {
                mem: vec![0; 0x2_0000],
                stop: false,
            }
        }

        fn load(&mut self, addr: u32, program: &[u32]) {
            for (i, insn) in program.iter().enumerate() {
                let at = addr as usize + i * 4;
                self.mem[at..at + 4].copy_from_slice(&insn.to_le_bytes());
            }
        }
    }

    impl Bus for RamBus {
        fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), MemFault> {
            let addr = addr as usize;
            let end = addr + buf.len();
            if end > self.mem.len() {
                return Err(MemFault::Unmapped { addr: addr as u32 });
            }
            buf.copy_from_slice(&self.mem[addr..end]);
            Ok(())
        }

        fn write(&mut self, addr: u32, data: &[u8]) -> Result<(), MemFault> {
            let addr = addr as usize;
            let end = addr + data.len();
            if end > self.mem.len() {
                return Err(MemFault::Unmapped { addr: addr as u32 });
            }
            self.mem[addr..end].copy_from_slice(data);
            Ok(())
        }

        fn stop_requested(&self) -> bool {
            self.stop
        }
    }

    const WFI: u32 = 0xe320_f003;

    fn run_program(program: &[u32]) -> (ArmInterp, RamBus, RunOutcome) {
        let mut bus = RamBus::new();
        bus.load(0, program);
        let mut cpu = ArmInterp::new();
        let outcome = cpu
            .run(&mut bus, 0, RunLimits::UNBOUNDED)
            .expect("program faulted");
        (cpu, bus, outcome)
    }

    #[test]
    fn data_processing_and_flags() {
        // mov r0, #5; add r1, r0, #3; subs r2, r1, #8; moveq r3, #1
        let (cpu, _, outcome) = run_program(&[
            0xe3a0_0005,
            0xe280_1003,
            0xe251_2008,
            0x03a0_3001,
            WFI,
        ]);
        assert_eq!(outcome.exit, RunExit::Wfi);
        assert_eq!(outcome.retired, 5);
        assert_eq!(cpu.regs[0], 5);
        assert_eq!(cpu.regs[1], 8);
        assert_eq!(cpu.regs[2], 0);
        assert_eq!(cpu.regs[3], 1);
        assert!(cpu.flags.z);
        assert!(cpu.flags.c);
    }

    #[test]
    fn movw_movt_builds_constants() {
        // movw r0, #0xbeef; movt r0, #0xdead
        let (cpu, _, _) = run_program(&[0xe30b_0eef, 0xe34d_0ead, WFI]);
        assert_eq!(cpu.regs[0], 0xdead_beef);
    }

    #[test]
    fn multiply_accumulate() {
        // mov r1, #6; mov r2, #7; mul r0, r1, r2; mla r3, r1, r2, r0
        let (cpu, _, _) = run_program(&[
            0xe3a0_1006,
            0xe3a0_2007,
            0xe000_0291,
            0xe023_0291,
            WFI,
        ]);
        assert_eq!(cpu.regs[0], 42);
        assert_eq!(cpu.regs[3], 84);
    }

    #[test]
    fn load_store_roundtrip() {
        // movw r1, #0x1000; movw r0, #0x1234; str r0, [r1]; ldr r2, [r1];
        // strb r0, [r1, #8]; ldrb r3, [r1, #8]; ldrh r4, [r1]
        let (cpu, bus, _) = run_program(&[
            0xe301_1000,
            0xe301_0234,
            0xe581_0000,
            0xe591_2000,
            0xe5c1_0008,
            0xe5d1_3008,
            0xe1d1_40b0,
            WFI,
        ]);
        assert_eq!(cpu.regs[2], 0x1234);
        assert_eq!(cpu.regs[3], 0x34);
        assert_eq!(cpu.regs[4], 0x1234);
        assert_eq!(&bus.mem[0x1000..0x1004], &[0x34, 0x12, 0, 0]);
    }

    #[test]
    fn pc_relative_load_sees_pc_plus_8() {
        // ldr r0, [pc, #4] ; wfi ; wfi ; .word 0xcafef00d
        let (cpu, _, _) = run_program(&[0xe59f_0004, WFI, WFI, 0xcafe_f00d]);
        assert_eq!(cpu.regs[0], 0xcafe_f00d);
    }

    #[test]
    fn push_pop_and_branch_link() {
        // mov sp, #0x8000; mov r0, #1; mov r1, #2; push {r0, r1};
        // mov r0, #0; mov r1, #0; pop {r0, r1}; bl over the first wfi
        let (cpu, _, _) = run_program(&[
            0xe3a0_d902, // mov sp, #0x8000
            0xe3a0_0001,
            0xe3a0_1002,
            0xe92d_0003, // push {r0, r1}
            0xe3a0_0000,
            0xe3a0_1000,
            0xe8bd_0003, // pop {r0, r1}
            0xeb00_0000, // bl 0x24
            WFI,
            WFI,
        ]);
        assert_eq!(cpu.regs[0], 1);
        assert_eq!(cpu.regs[1], 2);
        assert_eq!(cpu.regs[13], 0x8000);
        assert_eq!(cpu.regs[14], 0x20);
    }

    #[test]
    fn subroutine_call_and_return() {
        // bl 0x10; wfi; (pad); (pad); mov r0, #9; bx lr
        let (cpu, _, _) = run_program(&[
            0xeb00_0002, // bl 0x10
            WFI,
            0,
            0,
            0xe3a0_0009, // mov r0, #9
            0xe12f_ff1e, // bx lr
        ]);
        assert_eq!(cpu.regs[0], 9);
    }

    #[test]
    fn svc_reports_immediate_and_resumes_after() {
        let mut bus = RamBus::new();
        bus.load(0, &[0xe3a0_0007, 0xef00_0006, 0xe3a0_1001, WFI]);
        let mut cpu = ArmInterp::new();
        let outcome = cpu.run(&mut bus, 0, RunLimits::UNBOUNDED).unwrap();
        assert_eq!(outcome.exit, RunExit::Svc(6));
        assert_eq!(outcome.retired, 2);
        // Resume past the svc.
        let pc = cpu.reg_read(CoreReg::Pc);
        assert_eq!(pc, 8);
        let outcome = cpu.run(&mut bus, pc, RunLimits::UNBOUNDED).unwrap();
        assert_eq!(outcome.exit, RunExit::Wfi);
        assert_eq!(cpu.regs[1], 1);
    }

    #[test]
    fn instruction_ceiling_is_a_normal_return() {
        let mut bus = RamBus::new();
        // b .
        bus.load(0, &[0xeaff_fffe]);
        let mut cpu = ArmInterp::new();
        let limits = RunLimits {
            max_insns: Some(10),
            deadline: None,
        };
        let outcome = cpu.run(&mut bus, 0, limits).unwrap();
        assert_eq!(outcome.exit, RunExit::InstrLimit);
        assert_eq!(outcome.retired, 10);
    }

    #[test]
    fn undefined_encoding_preserves_state() {
        let mut bus = RamBus::new();
        bus.load(0, &[0xe3a0_0041, 0xe7f0_00f0]);
        let mut cpu = ArmInterp::new();
        let err = cpu.run(&mut bus, 0, RunLimits::UNBOUNDED).unwrap_err();
        assert_eq!(
            err,
            ExecError::Undefined {
                pc: 4,
                insn: 0xe7f0_00f0
            }
        );
        assert_eq!(cpu.regs[0], 0x41);
    }

    #[test]
    fn conditional_skip_retires_without_side_effects() {
        // cmp r0, #1 (r0 == 0, so NE); moveq r1, #5; movne r2, #6
        let (cpu, _, _) = run_program(&[0xe350_0001, 0x03a0_1005, 0x13a0_2006, WFI]);
        assert_eq!(cpu.regs[1], 0);
        assert_eq!(cpu.regs[2], 6);
    }

    #[test]
    fn register_shifted_operand() {
        // mov r0, #1; mov r1, #4; mov r2, r0, lsl r1
        let (cpu, _, _) = run_program(&[0xe3a0_0001, 0xe3a0_1004, 0xe1a0_2110, WFI]);
        assert_eq!(cpu.regs[2], 16);
    }

    #[test]
    fn sentinel_register_reads_zero() {
        let cpu = ArmInterp::new();
        assert_eq!(cpu.reg_read(CoreReg::Invalid), 0);
    }
}
