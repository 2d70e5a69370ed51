// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

use {
    crate::maps,
    camera_cdaf_protocols::{clamp_focus_index, FocusActuator},
    glib::{Error, FileError},
    nix::{
        fcntl::{open, OFlag},
        sys::stat::Mode,
        unistd::close,
    },
    std::os::unix::io::RawFd,
    tracing::debug,
};

const LENS_SLAVE_ADDRESS: libc::c_int = 0x0c;

const I2C_SMBUS_WRITE: u8 = 0;
const I2C_SMBUS_BYTE_DATA: u32 = 2;

// The largest SMBus transfer is a 32 byte block plus length and PEC.
const I2C_SMBUS_BLOCK_MAX: usize = 32;

#[repr(C)]
struct I2cSmbusData {
    block: [u8; I2C_SMBUS_BLOCK_MAX + 2],
}

#[repr(C)]
struct I2cSmbusIoctlData {
    read_write: u8,
    command: u8,
    size: u32,
    data: *mut I2cSmbusData,
}

nix::ioctl_write_int_bad!(i2c_set_slave_address, 0x0703);
nix::ioctl_write_ptr_bad!(i2c_smbus_transfer, 0x0720, I2cSmbusIoctlData);

/// Split a focus index into the register and data bytes of the voice coil
/// write: the 10 bit code is shifted high, bits 13..8 select the register
/// and bits 7..0 carry the rest with the low nibble zero.
pub fn pack_focus_word(index: u16) -> (u8, u8) {
    let value = ((index as u32) << 4) & 0x3ff0;
    (((value >> 8) & 0x3f) as u8, (value & 0xf0) as u8)
}

/// The lens focus actuator behind the camera I2C bus.
pub struct LensActuator {
    camera_id: String,
    fd: RawFd,
}

impl LensActuator {
    pub fn new(camera_id: &str) -> Result<Self, Error> {
        let device = maps::identifier_to_device(camera_id)?;

        let fd = open(device, OFlag::O_RDWR, Mode::empty()).map_err(|e| {
            let msg = format!("Failed to open i2c device '{}': {}", device, e);
            Error::new(FileError::Failed, &msg)
        })?;

        debug!("i2c focus controller {} open on {}", camera_id, device);

        Ok(Self {
            camera_id: camera_id.to_string(),
            fd,
        })
    }
}

impl Drop for LensActuator {
    fn drop(&mut self) {
        debug!("closing i2c focus controller for {}", self.camera_id);
        let _ = close(self.fd);
    }
}

impl FocusActuator for LensActuator {
    fn set_focus(&mut self, index: u16) -> Result<(), Error> {
        let index = clamp_focus_index(index as i32);
        let (command, value) = pack_focus_word(index);

        unsafe { i2c_set_slave_address(self.fd, LENS_SLAVE_ADDRESS) }.map_err(|e| {
            let msg = format!("ioctl(I2C_SLAVE) failed in set_focus: {}", e);
            Error::new(FileError::Failed, &msg)
        })?;

        let mut data = I2cSmbusData {
            block: [0; I2C_SMBUS_BLOCK_MAX + 2],
        };
        data.block[0] = value;

        let request = I2cSmbusIoctlData {
            read_write: I2C_SMBUS_WRITE,
            command,
            size: I2C_SMBUS_BYTE_DATA,
            data: &mut data,
        };

        unsafe { i2c_smbus_transfer(self.fd, &request) }
            .map(|_| ())
            .map_err(|e| {
                let msg = format!("I2C write failed in set_focus: {}", e);
                Error::new(FileError::Failed, &msg)
            })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn focus_word_packing() {
        assert_eq!(pack_focus_word(512), (0x20, 0x00));
        assert_eq!(pack_focus_word(50), (0x03, 0x20));
        assert_eq!(pack_focus_word(900), (0x38, 0x40));
    }

    #[test]
    fn low_nibble_is_always_clear() {
        for index in (50..=900).step_by(7) {
            let (_, value) = pack_focus_word(index);
            assert_eq!(value & 0x0f, 0);
        }
    }
}
