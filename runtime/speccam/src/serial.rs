// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

use {
    crate::maps,
    ams_as7265x_protocols::LineSender,
    glib::{Error, FileError},
    nix::{
        fcntl::{flock, open, FlockArg, OFlag},
        sys::{
            stat::Mode,
            termios::{
                cfsetspeed, tcflush, tcgetattr, tcsetattr, BaudRate, ControlFlags, FlushArg,
                InputFlags, LocalFlags, OutputFlags, SetArg, SpecialCharacterIndices, Termios,
            },
        },
        unistd::{close, write},
    },
    std::os::unix::io::RawFd,
    tracing::debug,
};

const LINE_FEED: u8 = b'\n';
const CARRIAGE_RETURN: u8 = b'\r';

/// The inbound accumulator never grows past one reply line.
pub const BUFFER_SIZE: usize = 256;

/// Accumulates inbound bytes and yields complete lines on LF or CR, with
/// the terminator stripped. Empty lines are swallowed, which also absorbs
/// the second half of CRLF pairs. An unterminated run past the buffer size
/// is discarded.
#[derive(Default, Debug)]
pub struct LineBuffer {
    bytes: Vec<u8>,
}

impl LineBuffer {
    pub fn push_bytes(&mut self, data: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();

        for &byte in data {
            if byte == LINE_FEED || byte == CARRIAGE_RETURN {
                if !self.bytes.is_empty() {
                    lines.push(String::from_utf8_lossy(&self.bytes).into_owned());
                    self.bytes.clear();
                }
            } else {
                if self.bytes.len() >= BUFFER_SIZE {
                    self.bytes.clear();
                }
                self.bytes.push(byte);
            }
        }

        lines
    }
}

/// The serial line to the spectral sensor board.
///
/// The port is locked for exclusive use and reconfigured to 115200-8-N-1
/// raw with no flow control; the original settings are restored when the
/// port is dropped.
pub struct SerialPort {
    port_id: String,
    device: &'static str,
    fd: RawFd,
    original_termios: Termios,
}

impl SerialPort {
    pub fn new(port_id: &str) -> Result<Self, Error> {
        let device = maps::identifier_to_device(port_id)?;

        let fd = open(device, OFlag::O_RDWR | OFlag::O_NONBLOCK, Mode::empty()).map_err(|e| {
            let msg = format!("Can not open serial device '{}': {}", device, e);
            Error::new(FileError::Failed, &msg)
        })?;

        if let Err(e) = flock(fd, FlockArg::LockExclusiveNonblock) {
            let _ = close(fd);
            let msg = format!(
                "Cannot lock port! Serial device '{}' may currently be in use by another program: {}",
                device, e,
            );
            return Err(Error::new(FileError::Failed, &msg));
        }

        let original_termios = match tcgetattr(fd) {
            Ok(termios) => termios,
            Err(e) => {
                let _ = close(fd);
                let msg = format!("Failed to read settings of '{}': {}", device, e);
                return Err(Error::new(FileError::Failed, &msg));
            }
        };

        let port = Self {
            port_id: port_id.to_string(),
            device,
            fd,
            original_termios,
        };
        port.configure()?;

        debug!("serial port {} open on {}", port_id, device);

        Ok(port)
    }

    fn configure(&self) -> Result<(), Error> {
        let mut termios = self.original_termios.clone();

        cfsetspeed(&mut termios, BaudRate::B115200).map_err(|e| {
            let msg = format!("Failed to set speed of '{}': {}", self.device, e);
            Error::new(FileError::Failed, &msg)
        })?;

        termios.control_flags &= !(ControlFlags::CSIZE
            | ControlFlags::PARENB
            | ControlFlags::CSTOPB
            | ControlFlags::CRTSCTS);
        termios.control_flags |= ControlFlags::CS8 | ControlFlags::CREAD | ControlFlags::CLOCAL;

        termios.input_flags &= !(InputFlags::IGNBRK
            | InputFlags::BRKINT
            | InputFlags::PARMRK
            | InputFlags::ISTRIP
            | InputFlags::INLCR
            | InputFlags::IGNCR
            | InputFlags::ICRNL
            | InputFlags::IXON
            | InputFlags::IXOFF
            | InputFlags::IXANY);

        termios.output_flags = OutputFlags::empty();
        termios.local_flags = LocalFlags::empty();

        termios.control_chars[SpecialCharacterIndices::VMIN as usize] = 0;
        termios.control_chars[SpecialCharacterIndices::VTIME as usize] = 0;

        tcsetattr(self.fd, SetArg::TCSANOW, &termios)
            .and_then(|_| tcflush(self.fd, FlushArg::TCIOFLUSH))
            .map_err(|e| {
                let msg = format!("Failed to configure '{}': {}", self.device, e);
                Error::new(FileError::Failed, &msg)
            })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for SerialPort {
    fn drop(&mut self) {
        debug!("shutting down serial port on {}", self.device);
        let _ = tcsetattr(self.fd, SetArg::TCSANOW, &self.original_termios);
        let _ = close(self.fd);
    }
}

impl LineSender for SerialPort {
    fn send_line(&mut self, line: &str) -> Result<usize, Error> {
        if line.is_empty() {
            let msg = "String length zero";
            return Err(Error::new(FileError::Failed, msg));
        }

        let mut frame = Vec::with_capacity(line.len() + 1);
        frame.extend_from_slice(line.as_bytes());
        frame.push(LINE_FEED);

        let mut written = 0;
        while written < frame.len() {
            match write(self.fd, &frame[written..]) {
                Ok(len) => written += len,
                Err(nix::errno::Errno::EAGAIN) => continue,
                Err(e) => {
                    let msg = format!("Write to serial port {} failed: {}", self.port_id, e);
                    return Err(Error::new(FileError::Io, &msg));
                }
            }
        }

        Ok(written)
    }
}
