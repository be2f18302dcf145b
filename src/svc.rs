// Copyright The PSP Emulator Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Supervisor-call emulation.
//!
//! In `App` mode every `svc #imm` the guest executes lands here. The
//! immediate indexes a fixed table covering 0x00..=0x48; a populated slot
//! runs its handler, an empty slot fails the call with status 0x9 and leaves
//! R1..R3 untouched. R0..R3 carry the arguments, R0 carries the returned
//! status.
//!
//! Handlers either satisfy the call locally (stack setup, debug logging) or
//! marshal it to a real PSP through the proxy, staging request and response
//! blobs in fixed scratch addresses of the remote address space and keeping
//! guest memory coherent on both sides of the trip.

pub mod x86map;

use crate::{
    config::EmuMode,
    cpu::{self, GuestMem, MemPerms},
    executor::{Bus, CoreReg, Executor, MemFault},
    iomgr::X86SlotRef,
    proxy::{ProxyClient, ProxyError},
};
use self::x86map::X86_SLOT_COUNT;
use arrayvec::ArrayVec;
use log::{debug, info, trace, warn};
use thiserror::Error;

/// Call completed successfully.
pub const PSP_STATUS_OK: u32 = 0;

/// General memory error, also returned for unimplemented calls.
pub const PSP_STATUS_GENERAL_ERROR: u32 = 0x9;

/// Number of table slots; syscall numbers run 0x00..=0x48.
pub const SVC_TABLE_SIZE: usize = 0x49;

/// Scratch addresses in the remote PSP reserved for marshaled blobs.
const PROXY_SCRATCH_0: u32 = 0x2_0000;
const PROXY_SCRATCH_1: u32 = 0x2_1000;
const PROXY_SCRATCH_ECC: u32 = 0x2_2000;

/// The two pages `app_init` hands the app as its stack.
const APP_STACK_BASE: u32 = 0x5_0000;
const APP_STACK_SIZE: u32 = 0x2000;
const APP_STACK_TOP: u32 = 0x5_2000;

/// `dbg_log` strings are bounded; firmware guarantees termination.
const DBG_LOG_MAX: usize = 512;

/// Syscall numbers forwarded from inside other handlers.
const SVC_SMN_UNMAP: u32 = 0x05;
const SVC_X86_MEM_UNMAP: u32 = 0x08;
const SVC_QUERY_SAVE_STATE_REGION: u32 = 0x3c;

/// Size caps for guest-controlled marshaling lengths.
const X86_COPY_MAX: u32 = 0x0100_0000;
const RNG_BUF_MAX: u32 = 0x1000;
const FUSE_BUF_MAX: u32 = 0x400;

/// SMN windows are mapped in 1 MiB-aligned units.
pub const SMN_WINDOW_SIZE: u32 = 0x0010_0000;
const SMN_WINDOW_MAX: usize = 16;

/// One live SMN window recorded from a map call.
pub struct SmnWindow {
    /// PSP-side window base, 1 MiB aligned.
    pub psp_base: u32,
    /// SMN fabric base the window translates to.
    pub smn_base: u32,
    /// The CCD whose fabric the address refers to.
    pub ccd_target: u32,
}

impl SmnWindow {
    fn contains(&self, addr: u32, len: u32) -> bool {
        addr >= self.psp_base && addr.wrapping_add(len) <= self.psp_base + SMN_WINDOW_SIZE
    }
}

/// Supervisor state of one `App`-mode CCD.
pub struct SvcState {
    pub(crate) proxy: Box<dyn ProxyClient>,
    smn_windows: ArrayVec<SmnWindow, SMN_WINDOW_MAX>,
    state_region_size: u32,
}

impl SvcState {
    /// Creates supervisor state around a proxy connection.
    pub fn new(proxy: Box<dyn ProxyClient>) -> Self {
        Self {
            proxy,
            smn_windows: ArrayVec::new(),
            state_region_size: 0,
        }
    }

    /// Drops per-run state; the proxy connection survives a reset.
    pub fn reset(&mut self) {
        self.smn_windows.clear();
        self.state_region_size = 0;
    }

    /// Number of live SMN windows.
    #[allow(unused)]
    pub fn smn_window_count(&self) -> usize {
        self.smn_windows.len()
    }

    pub(crate) fn smn_window_at(&self, addr: u32, len: u32) -> Option<&SmnWindow> {
        self.smn_windows.iter().find(|w| w.contains(addr, len))
    }
}

/// A handler failure; every variant is reported to the guest as 0x9.
#[derive(Debug, Error)]
pub enum SvcError {
    /// The proxy round-trip failed.
    #[error(transparent)]
    Proxy(#[from] ProxyError),
    /// A guest memory access failed.
    #[error(transparent)]
    Mem(#[from] MemFault),
    /// Setting up guest RAM failed.
    #[error(transparent)]
    Core(#[from] cpu::CpuError),
    /// The call is only meaningful in `App` mode.
    #[error("call valid only in app emulation mode")]
    WrongMode,
    /// No supervisor state is attached to this run.
    #[error("no supervisor state attached")]
    NoSvcState,
    /// The sub-operation is not implemented by the firmware either.
    #[error("unsupported sub-operation")]
    Unsupported,
}

/// Everything a handler may touch: the register file, the guest address
/// space, the mapping slots (through it) and the supervisor state.
pub struct SvcCtx<'a> {
    /// Register file of the trapping core.
    pub exec: &'a mut dyn Executor,
    /// Emulation mode, for per-call gating.
    pub mode: EmuMode,
    /// Whether to trace this dispatch.
    pub trace: bool,
    /// Set by a handler to halt the core (the app exited).
    pub halt: bool,
    /// Guest address-space view.
    pub mem: GuestMem<'a>,
}

type SvcHandler = fn(&mut SvcCtx, u32, [u32; 4]) -> Result<u32, SvcError>;

struct SvcEntry {
    name: &'static str,
    handler: SvcHandler,
}

static SVC_TABLE: [Option<SvcEntry>; SVC_TABLE_SIZE] = build_table();

const fn build_table() -> [Option<SvcEntry>; SVC_TABLE_SIZE] {
    const fn entry(name: &'static str, handler: SvcHandler) -> Option<SvcEntry> {
        Some(SvcEntry { name, handler })
    }

    let mut table: [Option<SvcEntry>; SVC_TABLE_SIZE] = [const { None }; SVC_TABLE_SIZE];
    table[0x00] = entry("app_exit", app_exit);
    table[0x01] = entry("app_init", app_init);
    table[0x03] = entry("smn_map_ex", smn_map_ex);
    table[0x04] = entry("smn_map", smn_map);
    table[0x05] = entry("smn_unmap", smn_unmap);
    table[0x06] = entry("dbg_log", dbg_log);
    table[0x07] = entry("x86_mem_map", x86_mem_map);
    table[0x08] = entry("x86_mem_unmap", x86_mem_unmap);
    table[0x09] = entry("x86_copy_to_psp", x86_copy_to_psp);
    table[0x0a] = entry("x86_copy_from_psp", x86_copy_from_psp);
    table[0x25] = entry("x86_mem_map_ex", x86_mem_map);
    table[0x28] = entry("smu_msg", smu_msg);
    table[0x32] = entry("opaque_req_32", opaque_request);
    table[0x33] = entry("opaque_req_33", opaque_request);
    table[0x35] = entry("opaque_req_35", opaque_request);
    table[0x36] = entry("opaque_req_36", opaque_request);
    table[0x38] = entry("opaque_req_38", opaque_request);
    table[0x39] = entry("rng", rng);
    table[0x3c] = entry("query_save_state_region", query_save_state_region);
    table[0x41] = entry("ecc_curve_op", ecc_curve_op);
    table[0x42] = entry("query_fuses", query_fuses);
    table[0x48] = entry("query_smm_region", query_smm_region);
    table
}

/// Dispatches one trapped `svc`. Returns whether the guest exited.
pub fn dispatch(ctx: &mut SvcCtx, num: u32) -> bool {
    let args = [
        ctx.exec.reg_read(CoreReg::R0),
        ctx.exec.reg_read(CoreReg::R1),
        ctx.exec.reg_read(CoreReg::R2),
        ctx.exec.reg_read(CoreReg::R3),
    ];
    let entry = usize::try_from(num)
        .ok()
        .and_then(|n| SVC_TABLE.get(n))
        .and_then(Option::as_ref);

    if ctx.trace {
        trace!(
            target: "svc",
            "svc {num:#04x} {} ({:#010x}, {:#010x}, {:#010x}, {:#010x})",
            entry.map_or("<unhandled>", |e| e.name),
            args[0],
            args[1],
            args[2],
            args[3],
        );
    }

    let status = match entry {
        Some(e) => (e.handler)(ctx, num, args).unwrap_or_else(|err| {
            warn!("svc {num:#x} ({}) failed: {err}", e.name);
            PSP_STATUS_GENERAL_ERROR
        }),
        None => {
            debug!("unhandled svc {num:#x}");
            PSP_STATUS_GENERAL_ERROR
        }
    };

    if ctx.trace {
        trace!(target: "svc", "svc {num:#04x} -> {status:#x}");
    }
    ctx.exec.reg_write(CoreReg::R0, status);
    ctx.halt
}

fn require_app(ctx: &SvcCtx) -> Result<(), SvcError> {
    if ctx.mode == EmuMode::App {
        Ok(())
    } else {
        Err(SvcError::WrongMode)
    }
}

fn state_mut<'a>(ctx: &'a mut SvcCtx) -> Result<&'a mut SvcState, SvcError> {
    ctx.mem.svc.as_deref_mut().ok_or(SvcError::NoSvcState)
}

fn proxy_call(ctx: &mut SvcCtx, num: u32, args: [u32; 4]) -> Result<u32, SvcError> {
    Ok(state_mut(ctx)?.proxy.svc_call(num, args)?)
}

fn proxy_read(ctx: &mut SvcCtx, addr: u64, buf: &mut [u8]) -> Result<(), SvcError> {
    Ok(state_mut(ctx)?.proxy.mem_read(addr, buf)?)
}

fn proxy_write(ctx: &mut SvcCtx, addr: u64, data: &[u8]) -> Result<(), SvcError> {
    Ok(state_mut(ctx)?.proxy.mem_write(addr, data)?)
}

/// `svc 0x00`: the app is done. Reports the SEV state buffer to the remote
/// side, flushes the privileged-DRAM mapping if the guest dirtied it, and
/// halts the core. Always succeeds from the guest's point of view.
fn app_exit(ctx: &mut SvcCtx, _num: u32, _args: [u32; 4]) -> Result<u32, SvcError> {
    require_app(ctx)?;
    ctx.halt = true;

    let size = state_mut(ctx)?.state_region_size;
    match proxy_call(ctx, SVC_QUERY_SAVE_STATE_REGION, [size, 0, 0, 0]) {
        Ok(_) => {
            if ctx.mem.x86.privileged.is_dirty() {
                let state = ctx.mem.svc.as_deref_mut().ok_or(SvcError::NoSvcState)?;
                if let Err(err) = ctx.mem.x86.privileged.flush(state.proxy.as_mut()) {
                    warn!("privileged DRAM flush on exit failed: {err}");
                }
            }
        }
        Err(err) => debug!("state buffer query on exit failed: {err}"),
    }
    Ok(PSP_STATUS_OK)
}

/// `svc 0x01`: sets up the app stack. Two pages appear at 0x50000 and the
/// stack top is written to the pointer the guest passed in R2.
fn app_init(ctx: &mut SvcCtx, _num: u32, args: [u32; 4]) -> Result<u32, SvcError> {
    require_app(ctx)?;
    cpu::add_region(ctx.mem.regions, APP_STACK_BASE, APP_STACK_SIZE, MemPerms::RWX)?;
    ctx.mem.write_u32(args[2], APP_STACK_TOP)?;
    Ok(PSP_STATUS_OK)
}

fn record_smn_window(
    ctx: &mut SvcCtx,
    psp_base: u32,
    smn_addr: u32,
    ccd_target: u32,
) -> Result<u32, SvcError> {
    let window = SmnWindow {
        psp_base: psp_base & !(SMN_WINDOW_SIZE - 1),
        smn_base: smn_addr & !(SMN_WINDOW_SIZE - 1),
        ccd_target,
    };
    let state = state_mut(ctx)?;
    if state.smn_windows.try_push(window).is_err() {
        warn!("SMN window table full, unmapping remote window {psp_base:#x}");
        let _ = state.proxy.svc_call(SVC_SMN_UNMAP, [psp_base, 0, 0, 0]);
        return Ok(0);
    }
    Ok(psp_base)
}

/// `svc 0x03`: maps an SMN address for an explicit CCD target.
fn smn_map_ex(ctx: &mut SvcCtx, num: u32, args: [u32; 4]) -> Result<u32, SvcError> {
    let psp_base = proxy_call(ctx, num, args)?;
    if psp_base == 0 {
        return Ok(0);
    }
    record_smn_window(ctx, psp_base, args[0], args[1])
}

/// `svc 0x04`: maps an SMN address on the calling CCD.
fn smn_map(ctx: &mut SvcCtx, num: u32, args: [u32; 4]) -> Result<u32, SvcError> {
    let psp_base = proxy_call(ctx, num, args)?;
    if psp_base == 0 {
        return Ok(0);
    }
    let target = ctx.mem.ccd_id;
    record_smn_window(ctx, psp_base, args[0], target)
}

/// `svc 0x05`: drops the window covering the given PSP address.
fn smn_unmap(ctx: &mut SvcCtx, num: u32, args: [u32; 4]) -> Result<u32, SvcError> {
    let base = args[0] & !(SMN_WINDOW_SIZE - 1);
    let state = state_mut(ctx)?;
    state.smn_windows.retain(|w| w.psp_base != base);
    Ok(state.proxy.svc_call(num, args)?)
}

/// `svc 0x06`: appends a guest C string to the host log.
fn dbg_log(ctx: &mut SvcCtx, _num: u32, args: [u32; 4]) -> Result<u32, SvcError> {
    let text = ctx.mem.read_cstr(args[0], DBG_LOG_MAX)?;
    info!(target: "guest", "{}", text.trim_end_matches(['\r', '\n']));
    Ok(PSP_STATUS_OK)
}

/// `svc 0x07`/`0x25`: maps x86 physical memory into the PSP address space.
///
/// The map call is forwarded first so the remote PSP establishes the real
/// hardware window; a local slot then shadows it with a lazily filled
/// backing. With all eight slots busy the remote window is released again
/// and the guest sees a NULL base.
fn x86_mem_map(ctx: &mut SvcCtx, num: u32, args: [u32; 4]) -> Result<u32, SvcError> {
    let psp_base = proxy_call(ctx, num, args)?;
    if psp_base == 0 {
        return Ok(0);
    }
    let phys = (u64::from(args[1]) << 32) | u64::from(args[0]);

    let Some(slot) = ctx.mem.x86.alloc(phys, psp_base) else {
        warn!("all {X86_SLOT_COUNT} x86 mapping slots busy, releasing remote window");
        let _ = proxy_call(ctx, SVC_X86_MEM_UNMAP, [psp_base, 0, 0, 0]);
        return Ok(0);
    };
    let (base_4k, len_4k) = {
        let mapping = &ctx.mem.x86.slots[slot];
        (mapping.psp_base_4k, mapping.mapped_len_4k)
    };
    if let Err(err) = ctx
        .mem
        .iomgr
        .register_x86_window(base_4k, len_4k, X86SlotRef::Slot(slot))
    {
        warn!("x86 window registration failed: {err}");
        ctx.mem.x86.slots[slot].clear();
        let _ = proxy_call(ctx, SVC_X86_MEM_UNMAP, [psp_base, 0, 0, 0]);
        return Ok(0);
    }
    Ok(psp_base)
}

/// `svc 0x08`: unmaps an x86 window, writing the dirty prefix back first.
fn x86_mem_unmap(ctx: &mut SvcCtx, num: u32, args: [u32; 4]) -> Result<u32, SvcError> {
    if let Some(slot) = ctx.mem.x86.find_by_base(args[0]) {
        {
            let state = ctx.mem.svc.as_deref_mut().ok_or(SvcError::NoSvcState)?;
            ctx.mem.x86.slots[slot].flush(state.proxy.as_mut())?;
        }
        ctx.mem.x86.slots[slot].clear();
        ctx.mem.iomgr.unregister_x86_window(X86SlotRef::Slot(slot));
    }
    proxy_call(ctx, num, args)
}

/// `svc 0x09`: remote copy from x86 memory into PSP memory. R0 holds the
/// PSP destination, R1/R2 the x86 source, R3 the length. The remote side
/// performs the copy; the x86 source range is then pulled so the local view
/// of the destination matches.
fn x86_copy_to_psp(ctx: &mut SvcCtx, num: u32, args: [u32; 4]) -> Result<u32, SvcError> {
    let len = args[3].min(X86_COPY_MAX) as usize;
    let x86_src = (u64::from(args[2]) << 32) | u64::from(args[1]);
    let status = proxy_call(ctx, num, args)?;
    if status == PSP_STATUS_OK && len > 0 {
        let mut buf = vec![0; len];
        proxy_read(ctx, x86_src, &mut buf)?;
        ctx.mem.write(args[0], &buf)?;
    }
    Ok(status)
}

/// `svc 0x0a`: remote copy from PSP memory out to x86 memory, same register
/// layout. The local PSP source range is pushed to the remote PSP first so
/// the copy sees current data; the x86 side is entirely remote.
fn x86_copy_from_psp(ctx: &mut SvcCtx, num: u32, args: [u32; 4]) -> Result<u32, SvcError> {
    let len = args[3].min(X86_COPY_MAX) as usize;
    if len > 0 {
        let buf = ctx.mem.read_vec(args[0], len)?;
        proxy_write(ctx, u64::from(args[0]), &buf)?;
    }
    proxy_call(ctx, num, args)
}

/// `svc 0x28`: SMU message. The optional result pointer is redirected to
/// remote scratch and read back after the call.
fn smu_msg(ctx: &mut SvcCtx, num: u32, args: [u32; 4]) -> Result<u32, SvcError> {
    let user_ptr = args[2];
    let fwd_ptr = if user_ptr != 0 { PROXY_SCRATCH_0 } else { 0 };
    let status = proxy_call(ctx, num, [args[0], args[1], fwd_ptr, args[3]])?;
    if user_ptr != 0 {
        let mut word = [0; 4];
        proxy_read(ctx, u64::from(PROXY_SCRATCH_0), &mut word)?;
        ctx.mem.write_u32(user_ptr, u32::from_le_bytes(word))?;
    }
    Ok(status)
}

/// Request blob sizes of the opaque proxied calls. The layouts are firmware
/// internals; they are carried bit-exact in both directions.
/// TODO: validate the sizes by differential testing against hardware.
const OPAQUE_REQUESTS: &[(u32, usize)] = &[
    (0x32, 0x20),
    (0x33, 0x28),
    (0x35, 0x40),
    (0x36, 0x40),
    (0x38, 0x30),
];

/// `svc 0x32/0x33/0x35/0x36/0x38`: opaque request blobs round-tripped
/// through remote scratch.
fn opaque_request(ctx: &mut SvcCtx, num: u32, args: [u32; 4]) -> Result<u32, SvcError> {
    let len = OPAQUE_REQUESTS
        .iter()
        .find(|(n, _)| *n == num)
        .map(|(_, len)| *len)
        .ok_or(SvcError::Unsupported)?;
    let ptr = args[0];
    if ptr == 0 {
        return proxy_call(ctx, num, args);
    }

    let blob = ctx.mem.read_vec(ptr, len)?;
    proxy_write(ctx, u64::from(PROXY_SCRATCH_0), &blob)?;
    let status = proxy_call(ctx, num, [PROXY_SCRATCH_0, args[1], args[2], args[3]])?;
    let mut back = vec![0; len];
    proxy_read(ctx, u64::from(PROXY_SCRATCH_0), &mut back)?;
    ctx.mem.write(ptr, &back)?;
    Ok(status)
}

/// `svc 0x39`: hardware random bytes, staged through remote scratch.
fn rng(ctx: &mut SvcCtx, num: u32, args: [u32; 4]) -> Result<u32, SvcError> {
    let ptr = args[0];
    let len = args[1].min(RNG_BUF_MAX) as usize;
    let status = proxy_call(ctx, num, [PROXY_SCRATCH_0, args[1], args[2], args[3]])?;
    if status == PSP_STATUS_OK && ptr != 0 && len > 0 {
        let mut buf = vec![0; len];
        proxy_read(ctx, u64::from(PROXY_SCRATCH_0), &mut buf)?;
        ctx.mem.write(ptr, &buf)?;
    }
    Ok(status)
}

/// `svc 0x3c`: reports the SEV state region and lazily establishes the
/// privileged-DRAM mapping over it.
fn query_save_state_region(ctx: &mut SvcCtx, num: u32, args: [u32; 4]) -> Result<u32, SvcError> {
    require_app(ctx)?;
    state_mut(ctx)?.state_region_size = args[0];
    let addr = proxy_call(ctx, num, args)?;
    if addr != 0 && ctx.mem.x86.privileged.is_free() {
        ctx.mem.x86.init_privileged(addr);
        let (base_4k, len_4k) = {
            let mapping = &ctx.mem.x86.privileged;
            (mapping.psp_base_4k, mapping.mapped_len_4k)
        };
        if let Err(err) = ctx
            .mem
            .iomgr
            .register_x86_window(base_4k, len_4k, X86SlotRef::Privileged)
        {
            warn!("privileged DRAM window registration failed: {err}");
            ctx.mem.x86.privileged.clear();
        }
    }
    Ok(addr)
}

/// Buffer sizes of the ECC curve sub-operations (ECDH/ECDSA marshaling).
/// TODO: validate the layouts by differential testing against hardware.
const ECC_SUBOPS: &[(u32, usize, usize)] = &[
    (1, 0x90, 0x90),
    (2, 0xd8, 0x90),
    (3, 0x120, 0x4),
    (5, 0xd8, 0x48),
];

/// `svc 0x41`: ECC curve operations. Curve constants and operands are staged
/// at the ECC scratch area; sub-operations outside {1, 2, 3, 5} fail.
fn ecc_curve_op(ctx: &mut SvcCtx, num: u32, args: [u32; 4]) -> Result<u32, SvcError> {
    let (_, in_len, out_len) = ECC_SUBOPS
        .iter()
        .find(|(subop, _, _)| *subop == args[0])
        .ok_or(SvcError::Unsupported)?;

    let input = ctx.mem.read_vec(args[1], *in_len)?;
    proxy_write(ctx, u64::from(PROXY_SCRATCH_ECC), &input)?;
    let status = proxy_call(
        ctx,
        num,
        [args[0], PROXY_SCRATCH_ECC, PROXY_SCRATCH_ECC, args[3]],
    )?;
    if status == PSP_STATUS_OK && args[2] != 0 {
        let mut out = vec![0; *out_len];
        proxy_read(ctx, u64::from(PROXY_SCRATCH_ECC), &mut out)?;
        ctx.mem.write(args[2], &out)?;
    }
    Ok(status)
}

/// `svc 0x42`: fuse query. The guest buffer starts with its size word; both
/// are synced back from the remote side after the call.
fn query_fuses(ctx: &mut SvcCtx, num: u32, args: [u32; 4]) -> Result<u32, SvcError> {
    let ptr = args[0];
    let size = ctx.mem.read_u32(ptr)?.min(FUSE_BUF_MAX);
    let blob = ctx.mem.read_vec(ptr.wrapping_add(4), size as usize)?;

    let mut staged = size.to_le_bytes().to_vec();
    staged.extend_from_slice(&blob);
    proxy_write(ctx, u64::from(PROXY_SCRATCH_0), &staged)?;

    let status = proxy_call(ctx, num, [PROXY_SCRATCH_0, args[1], args[2], args[3]])?;

    let mut header = [0; 4];
    proxy_read(ctx, u64::from(PROXY_SCRATCH_0), &mut header)?;
    let back_size = u32::from_le_bytes(header).min(FUSE_BUF_MAX);
    let mut data = vec![0; back_size as usize];
    proxy_read(ctx, u64::from(PROXY_SCRATCH_0 + 4), &mut data)?;
    ctx.mem.write_u32(ptr, back_size)?;
    ctx.mem.write(ptr.wrapping_add(4), &data)?;
    Ok(status)
}

/// `svc 0x48`: SMM region bounds, two doublewords read from remote scratch
/// and stored at the guest pointers in R0 and R1.
fn query_smm_region(ctx: &mut SvcCtx, num: u32, args: [u32; 4]) -> Result<u32, SvcError> {
    let status = proxy_call(
        ctx,
        num,
        [PROXY_SCRATCH_0, PROXY_SCRATCH_1, args[2], args[3]],
    )?;
    let mut word = [0; 8];
    proxy_read(ctx, u64::from(PROXY_SCRATCH_0), &mut word)?;
    ctx.mem.write_u64(args[0], u64::from_le_bytes(word))?;
    proxy_read(ctx, u64::from(PROXY_SCRATCH_1), &mut word)?;
    ctx.mem.write_u64(args[1], u64::from_le_bytes(word))?;
    Ok(status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cpu::CpuCore,
        iomgr::IoManager,
        proxy::testing::MockProxy,
        svc::x86map::NIL_X86_ADDR,
    };

    fn fixture(mode: EmuMode) -> (CpuCore, IoManager, SvcState, MockProxy) {
        let core = CpuCore::new(mode);
        let iomgr = IoManager::new();
        let proxy = MockProxy::new();
        let state = SvcState::new(Box::new(proxy.clone()));
        (core, iomgr, state, proxy)
    }

    fn call(
        core: &mut CpuCore,
        iomgr: &mut IoManager,
        state: &mut SvcState,
        num: u32,
        args: [u32; 4],
    ) -> (u32, bool) {
        core.set_reg(CoreReg::R0, args[0]);
        core.set_reg(CoreReg::R1, args[1]);
        core.set_reg(CoreReg::R2, args[2]);
        core.set_reg(CoreReg::R3, args[3]);
        let mode = core.mode();
        let halted = {
            let (exec, mem) = core.split_mem(iomgr, Some(state));
            let mut ctx = SvcCtx {
                exec,
                mode,
                trace: false,
                halt: false,
                mem,
            };
            dispatch(&mut ctx, num)
        };
        (core.reg(CoreReg::R0), halted)
    }

    /// Writes through the full bus routing, as guest stores would.
    fn guest_write(
        core: &mut CpuCore,
        iomgr: &mut IoManager,
        state: &mut SvcState,
        addr: u32,
        data: &[u8],
    ) {
        let (_, mut mem) = core.split_mem(iomgr, Some(state));
        mem.write(addr, data).unwrap();
    }

    #[test]
    fn unknown_svc_fails_and_preserves_other_registers() {
        let (mut core, mut iomgr, mut state, _proxy) = fixture(EmuMode::App);
        let (r0, halted) = call(
            &mut core,
            &mut iomgr,
            &mut state,
            0x02,
            [0x11, 0x22, 0x33, 0x44],
        );
        assert_eq!(r0, PSP_STATUS_GENERAL_ERROR);
        assert!(!halted);
        assert_eq!(core.reg(CoreReg::R1), 0x22);
        assert_eq!(core.reg(CoreReg::R2), 0x33);
        assert_eq!(core.reg(CoreReg::R3), 0x44);
    }

    #[test]
    fn svc_number_past_table_end_fails() {
        let (mut core, mut iomgr, mut state, _proxy) = fixture(EmuMode::App);
        let (r0, _) = call(&mut core, &mut iomgr, &mut state, 0x49, [0; 4]);
        assert_eq!(r0, PSP_STATUS_GENERAL_ERROR);
    }

    #[test]
    fn app_init_builds_the_stack() {
        let (mut core, mut iomgr, mut state, _proxy) = fixture(EmuMode::App);
        let (r0, _) = call(
            &mut core,
            &mut iomgr,
            &mut state,
            0x01,
            [0, 0, 0x1_0000, 0],
        );
        assert_eq!(r0, PSP_STATUS_OK);

        // The stack top landed at the user pointer.
        let mut word = [0; 4];
        core.mem_read(0x1_0000, &mut word).unwrap();
        assert_eq!(u32::from_le_bytes(word), APP_STACK_TOP);

        // Two fresh pages exist at 0x50000.
        let mut probe = [0; 4];
        core.mem_read(APP_STACK_BASE, &mut probe).unwrap();
        core.mem_read(APP_STACK_TOP - 4, &mut probe).unwrap();
        assert!(core.mem_read(APP_STACK_TOP, &mut probe).is_err());

        // A second init must report a memory error.
        let (r0, _) = call(
            &mut core,
            &mut iomgr,
            &mut state,
            0x01,
            [0, 0, 0x1_0000, 0],
        );
        assert_eq!(r0, PSP_STATUS_GENERAL_ERROR);
    }

    #[test]
    fn dbg_log_reads_guest_string() {
        let (mut core, mut iomgr, mut state, _proxy) = fixture(EmuMode::App);
        core.mem_write(0x2000, b"psp says hi\n\0").unwrap();
        let (r0, _) = call(&mut core, &mut iomgr, &mut state, 0x06, [0x2000, 0, 0, 0]);
        assert_eq!(r0, PSP_STATUS_OK);
    }

    #[test]
    fn app_only_calls_fail_outside_app_mode() {
        let (mut core, mut iomgr, mut state, _proxy) = fixture(EmuMode::System);
        let (r0, halted) = call(&mut core, &mut iomgr, &mut state, 0x00, [0; 4]);
        assert_eq!(r0, PSP_STATUS_GENERAL_ERROR);
        assert!(!halted);
    }

    #[test]
    fn x86_map_slot_exhaustion_releases_the_remote_window() {
        let (mut core, mut iomgr, mut state, proxy) = fixture(EmuMode::App);
        for i in 0..9u32 {
            proxy.script_result(0x0400_0000 + i * 0x0400_0000);
        }

        for i in 0..8u32 {
            let (r0, _) = call(
                &mut core,
                &mut iomgr,
                &mut state,
                0x25,
                [i * 0x1000, 0x1, 0, 0],
            );
            assert_eq!(r0, 0x0400_0000 + i * 0x0400_0000);
        }
        assert_eq!(core.x86_mappings().live_count(), 8);

        // Ninth map: remote succeeds, no slot; guest sees NULL and the
        // remote window is released again.
        let ninth_base = 0x0400_0000 + 8 * 0x0400_0000;
        let (r0, _) = call(&mut core, &mut iomgr, &mut state, 0x25, [0x9000, 0x1, 0, 0]);
        assert_eq!(r0, 0);
        assert_eq!(core.x86_mappings().live_count(), 8);
        let calls = proxy.calls();
        let last = calls.last().unwrap();
        assert_eq!(last.0, SVC_X86_MEM_UNMAP);
        assert_eq!(last.1[0], ninth_base);
    }

    #[test]
    fn x86_unmap_writes_back_exactly_the_dirty_prefix() {
        let (mut core, mut iomgr, mut state, proxy) = fixture(EmuMode::App);
        proxy.script_result(0x0400_0000);

        let (base, _) = call(
            &mut core,
            &mut iomgr,
            &mut state,
            0x07,
            [0x0, 0x1, 0, 0],
        );
        assert_eq!(base, 0x0400_0000);

        // Guest stores 16 bytes at base + 0x40.
        guest_write(&mut core, &mut iomgr, &mut state, base + 0x40, &[0x5a; 16]);

        let (r0, _) = call(&mut core, &mut iomgr, &mut state, 0x08, [base, 0, 0, 0]);
        assert_eq!(r0, PSP_STATUS_OK);

        // Exactly the written prefix went back through the proxy, landing at
        // the mapped x86 physical address (phys_lo/phys_hi of the map call).
        let writes = proxy.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].0, 0x1_0000_0000);
        assert_eq!(writes[0].1.len(), 0x50);
        assert_eq!(&writes[0].1[0x40..], &[0x5a; 16]);

        // The unmap itself was forwarded and the slot is free again.
        assert!(proxy.calls().iter().any(|(n, a)| *n == 0x08 && a[0] == base));
        assert_eq!(core.x86_mappings().live_count(), 0);
        assert!(
            core.x86_mappings().slots[0].phys_x86_base == NIL_X86_ADDR
                && core.x86_mappings().slots[0].backing.is_none()
        );
        // The window is gone from the I/O manager.
        assert!(iomgr.x86_at(base, 4).is_none());
    }

    #[test]
    fn x86_map_unmap_pair_preserves_slot_count() {
        let (mut core, mut iomgr, mut state, proxy) = fixture(EmuMode::App);
        proxy.script_result(0x0400_0000);
        let before = core.x86_mappings().live_count();
        let (base, _) = call(&mut core, &mut iomgr, &mut state, 0x07, [0, 0, 0, 0]);
        call(&mut core, &mut iomgr, &mut state, 0x08, [base, 0, 0, 0]);
        assert_eq!(core.x86_mappings().live_count(), before);
    }

    #[test]
    fn x86_window_reads_fill_lazily_from_the_proxy() {
        let (mut core, mut iomgr, mut state, proxy) = fixture(EmuMode::App);
        proxy.script_result(0x0400_0000);
        // The mapping targets x86 0x2_0000_0000; the fill must fetch there.
        proxy.fill_mem(0x2_0000_0010, &[0xde, 0xad, 0xbe, 0xef]);

        let (base, _) = call(&mut core, &mut iomgr, &mut state, 0x07, [0, 0x2, 0, 0]);

        let word = {
            let (_, mut mem) = core.split_mem(&mut iomgr, Some(&mut state));
            mem.read_u32(base + 0x10).unwrap()
        };
        assert_eq!(word, u32::from_le_bytes([0xde, 0xad, 0xbe, 0xef]));
    }

    #[test]
    fn x86_copy_to_psp_pulls_the_x86_source() {
        let (mut core, mut iomgr, mut state, proxy) = fixture(EmuMode::App);
        let pattern: Vec<u8> = (0x30u8..0x40).collect();
        proxy.fill_mem(0x5_0000_0040, &pattern);

        // Copy 0x10 bytes from x86 0x5_0000_0040 to PSP 0x4000.
        let (r0, _) = call(
            &mut core,
            &mut iomgr,
            &mut state,
            0x09,
            [0x4000, 0x40, 0x5, 0x10],
        );
        assert_eq!(r0, PSP_STATUS_OK);

        let mut buf = [0; 0x10];
        core.mem_read(0x4000, &mut buf).unwrap();
        assert_eq!(&buf[..], &pattern[..]);
    }

    #[test]
    fn x86_copy_from_psp_pushes_the_psp_source() {
        let (mut core, mut iomgr, mut state, proxy) = fixture(EmuMode::App);
        core.mem_write(0x4800, &[0xc3; 8]).unwrap();

        // Copy 8 bytes from PSP 0x4800 out to x86 0x6_0000_0000.
        let (r0, _) = call(
            &mut core,
            &mut iomgr,
            &mut state,
            0x0a,
            [0x4800, 0x0, 0x6, 0x8],
        );
        assert_eq!(r0, PSP_STATUS_OK);

        // The PSP-side source was staged to the remote PSP address before
        // the forwarded call performed the x86-side copy.
        let writes = proxy.writes();
        assert_eq!(writes[0].0, 0x4800);
        assert_eq!(writes[0].1, vec![0xc3; 8]);
        assert_eq!(proxy.calls()[0], (0x0a, [0x4800, 0x0, 0x6, 0x8]));
    }

    #[test]
    fn smu_msg_reads_back_the_result_word() {
        let (mut core, mut iomgr, mut state, proxy) = fixture(EmuMode::App);
        proxy.fill_mem(u64::from(PROXY_SCRATCH_0), &0x1234_5678u32.to_le_bytes());

        let (r0, _) = call(
            &mut core,
            &mut iomgr,
            &mut state,
            0x28,
            [0x42, 0x1, 0x3000, 0],
        );
        assert_eq!(r0, PSP_STATUS_OK);

        // The forwarded call had the result pointer redirected to scratch.
        let calls = proxy.calls();
        assert_eq!(calls[0].0, 0x28);
        assert_eq!(calls[0].1, [0x42, 0x1, PROXY_SCRATCH_0, 0]);

        let mut word = [0; 4];
        core.mem_read(0x3000, &mut word).unwrap();
        assert_eq!(u32::from_le_bytes(word), 0x1234_5678);
    }

    #[test]
    fn rng_copies_bytes_into_the_guest_buffer() {
        let (mut core, mut iomgr, mut state, proxy) = fixture(EmuMode::App);
        let pattern: Vec<u8> = (0u8..0x20).collect();
        proxy.fill_mem(u64::from(PROXY_SCRATCH_0), &pattern);

        let (r0, _) = call(&mut core, &mut iomgr, &mut state, 0x39, [0x5000, 0x20, 0, 0]);
        assert_eq!(r0, PSP_STATUS_OK);

        let mut buf = [0; 0x20];
        core.mem_read(0x5000, &mut buf).unwrap();
        assert_eq!(&buf[..], &pattern[..]);
    }

    #[test]
    fn opaque_request_round_trips_the_blob() {
        let (mut core, mut iomgr, mut state, proxy) = fixture(EmuMode::App);
        core.mem_write(0x6000, &[0x11; 0x20]).unwrap();

        let (r0, _) = call(&mut core, &mut iomgr, &mut state, 0x32, [0x6000, 0, 0, 0]);
        assert_eq!(r0, PSP_STATUS_OK);

        // The request blob was staged to scratch bit-exact.
        assert_eq!(proxy.mem_at(u64::from(PROXY_SCRATCH_0), 0x20), vec![0x11; 0x20]);
        // The forwarded call points at scratch.
        assert_eq!(proxy.calls()[0].1[0], PROXY_SCRATCH_0);
    }

    #[test]
    fn query_smm_region_stores_both_doublewords() {
        let (mut core, mut iomgr, mut state, proxy) = fixture(EmuMode::App);
        proxy.fill_mem(u64::from(PROXY_SCRATCH_0), &0x1_2345_6789u64.to_le_bytes());
        proxy.fill_mem(u64::from(PROXY_SCRATCH_1), &0xfeed_f00du64.to_le_bytes());

        let (r0, _) = call(
            &mut core,
            &mut iomgr,
            &mut state,
            0x48,
            [0x7000, 0x7010, 0, 0],
        );
        assert_eq!(r0, PSP_STATUS_OK);

        let mut dword = [0; 8];
        core.mem_read(0x7000, &mut dword).unwrap();
        assert_eq!(u64::from_le_bytes(dword), 0x1_2345_6789);
        core.mem_read(0x7010, &mut dword).unwrap();
        assert_eq!(u64::from_le_bytes(dword), 0xfeed_f00d);
    }

    #[test]
    fn query_fuses_syncs_size_and_buffer() {
        let (mut core, mut iomgr, mut state, proxy) = fixture(EmuMode::App);
        core.mem_write(0x8000, &0x8u32.to_le_bytes()).unwrap();
        core.mem_write(0x8004, &[0xab; 8]).unwrap();

        let (r0, _) = call(&mut core, &mut iomgr, &mut state, 0x42, [0x8000, 0, 0, 0]);
        assert_eq!(r0, PSP_STATUS_OK);

        // Staged as size word + payload.
        assert_eq!(proxy.mem_at(u64::from(PROXY_SCRATCH_0), 4), 0x8u32.to_le_bytes());
        assert_eq!(proxy.mem_at(u64::from(PROXY_SCRATCH_0 + 4), 8), vec![0xab; 8]);
    }

    #[test]
    fn ecc_curve_op_rejects_unknown_subops() {
        let (mut core, mut iomgr, mut state, _proxy) = fixture(EmuMode::App);
        let (r0, _) = call(&mut core, &mut iomgr, &mut state, 0x41, [4, 0, 0, 0]);
        assert_eq!(r0, PSP_STATUS_GENERAL_ERROR);
    }

    #[test]
    fn ecc_curve_op_marshals_through_ecc_scratch() {
        let (mut core, mut iomgr, mut state, proxy) = fixture(EmuMode::App);
        core.mem_write(0x9000, &[0x77; 0x90]).unwrap();

        let (r0, _) = call(
            &mut core,
            &mut iomgr,
            &mut state,
            0x41,
            [1, 0x9000, 0xa000, 0],
        );
        assert_eq!(r0, PSP_STATUS_OK);
        assert_eq!(proxy.mem_at(u64::from(PROXY_SCRATCH_ECC), 0x90), vec![0x77; 0x90]);
        assert_eq!(
            proxy.calls()[0].1,
            [1, PROXY_SCRATCH_ECC, PROXY_SCRATCH_ECC, 0]
        );
    }

    #[test]
    fn smn_map_records_a_window_and_routes_through_the_proxy() {
        let (mut core, mut iomgr, mut state, proxy) = fixture(EmuMode::App);
        proxy.script_result(0x0100_0000);
        proxy.fill_mem(0x0100_0123, &[0x42]);

        let (r0, _) = call(
            &mut core,
            &mut iomgr,
            &mut state,
            0x03,
            [0x0a02_0000, 0, 0, 0],
        );
        assert_eq!(r0, 0x0100_0000);
        assert_eq!(state.smn_window_count(), 1);

        // No local SMN device covers the fabric address, so the access goes
        // through the remote window.
        let byte = {
            let (_, mut mem) = core.split_mem(&mut iomgr, Some(&mut state));
            let mut b = [0];
            mem.read(0x0100_0123, &mut b).unwrap();
            b[0]
        };
        assert_eq!(byte, 0x42);

        // Unmap drops the window.
        let (_, _) = call(
            &mut core,
            &mut iomgr,
            &mut state,
            0x05,
            [0x0100_0000, 0, 0, 0],
        );
        assert_eq!(state.smn_window_count(), 0);
    }

    #[test]
    fn app_exit_queries_the_state_buffer_and_halts() {
        let (mut core, mut iomgr, mut state, proxy) = fixture(EmuMode::App);
        // Establish the state region size first.
        proxy.script_result(0x0800_0000);
        call(&mut core, &mut iomgr, &mut state, 0x3c, [0x2000, 0, 0, 0]);
        assert!(!core.x86_mappings().privileged.is_free());
        assert_eq!(
            core.x86_mappings().privileged.phys_x86_base,
            x86map::PRIV_DRAM_FAKE_PHYS
        );

        let (r0, halted) = call(&mut core, &mut iomgr, &mut state, 0x00, [0; 4]);
        assert_eq!(r0, PSP_STATUS_OK);
        assert!(halted);

        // The exit path re-queried the state buffer with the recorded size.
        let calls = proxy.calls();
        let last = calls.last().unwrap();
        assert_eq!(last.0, SVC_QUERY_SAVE_STATE_REGION);
        assert_eq!(last.1[0], 0x2000);
    }
}
