// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

use {
    crate::maps,
    glib::{Error, FileError},
    nix::{
        fcntl::{open, OFlag},
        sys::stat::Mode,
        unistd::{close, read},
    },
    std::os::unix::io::RawFd,
    tracing::debug,
};

const GPIO_CHIP: &str = "/dev/gpiochip0";

const GPIOHANDLE_REQUEST_INPUT: u32 = 1 << 0;
const GPIOHANDLE_REQUEST_OUTPUT: u32 = 1 << 1;
const GPIOEVENT_REQUEST_FALLING_EDGE: u32 = 1 << 1;

const GPIOHANDLES_MAX: usize = 64;

// Request and data layouts of the v1 GPIO character device ABI.
#[repr(C)]
struct GpioHandleRequest {
    lineoffsets: [u32; GPIOHANDLES_MAX],
    flags: u32,
    default_values: [u8; GPIOHANDLES_MAX],
    consumer_label: [u8; 32],
    lines: u32,
    fd: libc::c_int,
}

#[repr(C)]
struct GpioEventRequest {
    lineoffset: u32,
    handleflags: u32,
    eventflags: u32,
    consumer_label: [u8; 32],
    fd: libc::c_int,
}

#[repr(C)]
struct GpioHandleData {
    values: [u8; GPIOHANDLES_MAX],
}

nix::ioctl_readwrite!(gpio_get_linehandle, 0xb4, 0x03, GpioHandleRequest);
nix::ioctl_readwrite!(gpio_get_lineevent, 0xb4, 0x04, GpioEventRequest);
nix::ioctl_readwrite!(gpiohandle_get_line_values, 0xb4, 0x08, GpioHandleData);
nix::ioctl_readwrite!(gpiohandle_set_line_values, 0xb4, 0x09, GpioHandleData);

fn open_chip() -> Result<RawFd, Error> {
    open(GPIO_CHIP, OFlag::O_RDONLY, Mode::empty()).map_err(|e| {
        let msg = format!("Could not open '{}': {}", GPIO_CHIP, e);
        Error::new(FileError::Failed, &msg)
    })
}

/// One digital output line, requested from the GPIO chip by board pin
/// number and held until drop.
pub struct OutputPin {
    pin_number: u32,
    offset: u32,
    fd: RawFd,
}

impl OutputPin {
    pub fn new(pin_number: u32) -> Result<Self, Error> {
        let offset = maps::pin_to_line_offset(pin_number)?;

        let chip_fd = open_chip()?;

        let mut request: GpioHandleRequest = unsafe { std::mem::zeroed() };
        request.lineoffsets[0] = offset;
        request.flags = GPIOHANDLE_REQUEST_OUTPUT;
        request.lines = 1;

        let result = unsafe { gpio_get_linehandle(chip_fd, &mut request) };
        let _ = close(chip_fd);

        result.map_err(|e| {
            let msg = format!(
                "Failed to get line handle for pin {} (offset {}): {}",
                pin_number, offset, e,
            );
            Error::new(FileError::Failed, &msg)
        })?;

        debug!("GPIO output pin {} (offset {}) running", pin_number, offset);

        Ok(Self {
            pin_number,
            offset,
            fd: request.fd,
        })
    }

    pub fn set(&mut self, value: u8) -> Result<(), Error> {
        let mut data: GpioHandleData = unsafe { std::mem::zeroed() };
        data.values[0] = value;

        unsafe { gpiohandle_set_line_values(self.fd, &mut data) }
            .map(|_| ())
            .map_err(|e| {
                let msg = format!("Failed to set pin {}: {}", self.pin_number, e);
                Error::new(FileError::Failed, &msg)
            })
    }

    pub fn get(&mut self) -> Result<u8, Error> {
        let mut data: GpioHandleData = unsafe { std::mem::zeroed() };

        unsafe { gpiohandle_get_line_values(self.fd, &mut data) }
            .map(|_| data.values[0])
            .map_err(|e| {
                let msg = format!("Failed to read pin {}: {}", self.pin_number, e);
                Error::new(FileError::Failed, &msg)
            })
    }
}

impl Drop for OutputPin {
    fn drop(&mut self) {
        debug!(
            "closing GPIO output pin {} (offset {})",
            self.pin_number, self.offset,
        );
        let _ = close(self.fd);
    }
}

/// One falling-edge event line. The event file descriptor is handed to a
/// dispatcher watch; [`drain_events`] clears the queue on each wakeup.
pub struct InputPin {
    pin_number: u32,
    offset: u32,
    fd: RawFd,
}

impl InputPin {
    pub fn new(pin_number: u32) -> Result<Self, Error> {
        let offset = maps::pin_to_line_offset(pin_number)?;

        let chip_fd = open_chip()?;

        let mut request: GpioEventRequest = unsafe { std::mem::zeroed() };
        request.lineoffset = offset;
        request.handleflags = GPIOHANDLE_REQUEST_INPUT;
        request.eventflags = GPIOEVENT_REQUEST_FALLING_EDGE;

        let result = unsafe { gpio_get_lineevent(chip_fd, &mut request) };
        let _ = close(chip_fd);

        result.map_err(|e| {
            let msg = format!(
                "Failed to get line event for pin {} (offset {}): {}",
                pin_number, offset, e,
            );
            Error::new(FileError::Failed, &msg)
        })?;

        debug!("GPIO event pin {} (offset {}) running", pin_number, offset);

        Ok(Self {
            pin_number,
            offset,
            fd: request.fd,
        })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for InputPin {
    fn drop(&mut self) {
        debug!(
            "closing GPIO event pin {} (offset {})",
            self.pin_number, self.offset,
        );
        let _ = close(self.fd);
    }
}

/// Consume pending edge event records so the descriptor stops polling
/// ready. The records themselves carry nothing the shutter logic needs.
pub fn drain_events(fd: RawFd) {
    let mut scratch = [0u8; 64];
    let _ = read(fd, &mut scratch);
}
