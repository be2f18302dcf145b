// Copyright The PSP Emulator Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! SPI flash behind the SMN fabric.
//!
//! The boot flash is not in the PSP address space; firmware reaches it by
//! mapping SMN windows over the flash controller's fabric range. The device
//! serves the configured flash ROM image read-only; addresses beyond the end
//! of the image read as erased flash (0xff).

use super::{DevCtx, Device, DeviceDescriptor, DeviceError, DeviceInit, Window};
use log::warn;

/// Fabric address the flash contents appear at.
const SMN_FLASH_BASE: u32 = 0x0a00_0000;
/// Largest flash part modelled, 16 MiB.
const SMN_FLASH_SIZE: u32 = 0x0100_0000;

const ERASED: u8 = 0xff;

/// Registry entry.
pub const DESCRIPTOR: DeviceDescriptor = DeviceDescriptor {
    name: "smn-flash",
    description: "Boot flash contents on the SMN fabric",
    mmio: None,
    smn: Some(Window {
        base: SMN_FLASH_BASE,
        size: SMN_FLASH_SIZE,
    }),
    create,
};

fn create(init: &DeviceInit) -> Result<Box<dyn Device>, DeviceError> {
    let image = init.flash.unwrap_or(&[]).to_vec();
    if image.len() > SMN_FLASH_SIZE as usize {
        return Err(DeviceError::Init("flash image exceeds 16 MiB"));
    }
    Ok(Box::new(Flash { image }))
}

struct Flash {
    image: Vec<u8>,
}

impl Device for Flash {
    fn read(&mut self, _ctx: &mut DevCtx, off: u32, buf: &mut [u8]) {
        for (i, byte) in buf.iter_mut().enumerate() {
            let at = off as usize + i;
            *byte = self.image.get(at).copied().unwrap_or(ERASED);
        }
    }

    fn write(&mut self, ctx: &mut DevCtx, off: u32, data: &[u8]) {
        warn!(
            "smn-flash (ccd {}): write of {} bytes at {off:#x} ignored (read-only)",
            ctx.ccd_id,
            data.len()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::StopFlag;

    #[test]
    fn serves_image_and_erased_tail() {
        let stop = StopFlag::default();
        let mut ctx = DevCtx {
            ccd_id: 0,
            stop: &stop,
        };
        let mut dev = Flash {
            image: vec![0x55, 0xaa],
        };

        let mut buf = [0; 4];
        dev.read(&mut ctx, 0, &mut buf);
        assert_eq!(buf, [0x55, 0xaa, ERASED, ERASED]);
    }

    #[test]
    fn oversized_image_is_rejected() {
        let cfg = crate::config::Config::default();
        let image = vec![0; SMN_FLASH_SIZE as usize + 1];
        let init = DeviceInit {
            ccd_id: 0,
            config: &cfg,
            flash: Some(&image),
        };
        assert!((DESCRIPTOR.create)(&init).is_err());
    }
}
