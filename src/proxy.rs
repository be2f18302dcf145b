// Copyright The PSP Emulator Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Client interface to a real hardware PSP.
//!
//! Supervisor calls the emulator cannot satisfy locally are forwarded to a
//! physical PSP over a proxy link, together with the guest memory reads and
//! writes needed to keep both sides coherent. The wire transport is an
//! external collaborator; the emulator core only ever talks to the blocking
//! request/response interface below.

use log::warn;
use thiserror::Error;

/// A proxy transport failure. Syscall forwarding lowers these to the guest
/// status 0x9; mapping fills surface them as memory faults.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// No proxy transport is connected.
    #[error("no PSP proxy connected")]
    NotConnected,
    /// The transport reported an I/O failure.
    #[allow(unused)]
    #[error("proxy transport error: {0}")]
    Transport(#[from] std::io::Error),
    /// The remote PSP rejected the request.
    #[allow(unused)]
    #[error("remote PSP refused request (status {0:#x})")]
    Refused(u32),
}

/// A blocking connection to a remote PSP.
///
/// Calls are serialized by the single-threaded execution model; every
/// round-trip suspends the executor thread.
///
/// Memory addresses are 64-bit: syscall marshaling targets the remote PSP's
/// own 32-bit address space (scratch pages, SRAM, live SMN windows), while
/// x86 mapping fills and write-backs target x86 physical memory, which does
/// not fit in 32 bits. The transport routes the access from the operation
/// that established the address.
pub trait ProxyClient {
    /// Executes `svc #num` on the remote PSP and returns its R0.
    fn svc_call(&mut self, num: u32, args: [u32; 4]) -> Result<u32, ProxyError>;

    /// Reads remote memory.
    fn mem_read(&mut self, addr: u64, buf: &mut [u8]) -> Result<(), ProxyError>;

    /// Writes remote memory.
    fn mem_write(&mut self, addr: u64, data: &[u8]) -> Result<(), ProxyError>;
}

/// Placeholder client used when no transport was configured.
///
/// Every operation fails with [`ProxyError::NotConnected`], which the SVC
/// layer reports to the guest as an ordinary error status, so proxy-dependent
/// firmware still runs as far as its first hardware dependency.
#[derive(Default)]
pub struct DisconnectedProxy {
    warned: bool,
}

impl DisconnectedProxy {
    fn nag(&mut self) {
        if !self.warned {
            warn!("guest requires the PSP proxy but none is connected");
            self.warned = true;
        }
    }
}

impl ProxyClient for DisconnectedProxy {
    fn svc_call(&mut self, _num: u32, _args: [u32; 4]) -> Result<u32, ProxyError> {
        self.nag();
        Err(ProxyError::NotConnected)
    }

    fn mem_read(&mut self, _addr: u64, _buf: &mut [u8]) -> Result<(), ProxyError> {
        self.nag();
        Err(ProxyError::NotConnected)
    }

    fn mem_write(&mut self, _addr: u64, _data: &[u8]) -> Result<(), ProxyError> {
        self.nag();
        Err(ProxyError::NotConnected)
    }
}
