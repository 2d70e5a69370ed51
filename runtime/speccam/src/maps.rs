// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

use glib::{error::ErrorDomain, Error, Quark};

/// The enumeration to represent any error of board configuration lookups.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ConfigError {
    UnknownDevice,
    UnknownPin,
    Invalid(i32),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let msg = match self {
            ConfigError::UnknownDevice => "unknown-device",
            ConfigError::UnknownPin => "unknown-pin",
            ConfigError::Invalid(_) => "invalid",
        };

        write!(f, "ConfigError::{}", msg)
    }
}

impl ErrorDomain for ConfigError {
    fn domain() -> Quark {
        Quark::from_str("speccam-config-error-quark")
    }

    fn code(self) -> i32 {
        match self {
            ConfigError::UnknownDevice => 0,
            ConfigError::UnknownPin => 1,
            ConfigError::Invalid(v) => v,
        }
    }

    fn from(code: i32) -> Option<Self> {
        let enumeration = match code {
            0 => ConfigError::UnknownDevice,
            1 => ConfigError::UnknownPin,
            _ => ConfigError::Invalid(code),
        };
        Some(enumeration)
    }
}

const DEVICE_MAP: &[(&str, &str)] = &[
    ("USB0", "/dev/ttyUSB0"),
    ("USB1", "/dev/ttyUSB1"),
    ("USB2", "/dev/ttyUSB2"),
    ("UART0", "/dev/ttyS0"),
    ("UART1", "/dev/ttyTHS1"),
    ("UART2", "/dev/ttyTHS2"),
    ("camera-0", "/dev/i2c-8"),
    ("camera-1", "/dev/i2c-7"),
];

// Board pins wired on this device: the shutter button and the two LEDs.
const PIN_MAP: &[(u32, u32)] = &[(7, 216), (38, 77), (40, 78)];

/// Resolve a port or camera identifier to its device path.
pub fn identifier_to_device(identifier: &str) -> Result<&'static str, Error> {
    DEVICE_MAP
        .iter()
        .find(|(id, _)| *id == identifier)
        .map(|(_, device)| *device)
        .ok_or_else(|| {
            let msg = format!("Device ID '{}' not available for use", identifier);
            Error::new(ConfigError::UnknownDevice, &msg)
        })
}

/// Resolve a board pin number to its GPIO chip line offset.
pub fn pin_to_line_offset(pin_number: u32) -> Result<u32, Error> {
    PIN_MAP
        .iter()
        .find(|(pin, _)| *pin == pin_number)
        .map(|(_, offset)| *offset)
        .ok_or_else(|| {
            let msg = format!("Pin number {} not valid for general IO use", pin_number);
            Error::new(ConfigError::UnknownPin, &msg)
        })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn known_identifiers_resolve() {
        assert_eq!(identifier_to_device("USB0").unwrap(), "/dev/ttyUSB0");
        assert_eq!(identifier_to_device("camera-0").unwrap(), "/dev/i2c-8");
        assert_eq!(identifier_to_device("camera-1").unwrap(), "/dev/i2c-7");
    }

    #[test]
    fn unknown_identifier_is_a_config_error() {
        let err = identifier_to_device("camera-9").unwrap_err();
        assert_eq!(err.kind::<ConfigError>(), Some(ConfigError::UnknownDevice));
    }

    #[test]
    fn wired_pins_resolve() {
        assert_eq!(pin_to_line_offset(7).unwrap(), 216);
        assert_eq!(pin_to_line_offset(38).unwrap(), 77);
        assert_eq!(pin_to_line_offset(40).unwrap(), 78);
    }

    #[test]
    fn unknown_pin_is_a_config_error() {
        let err = pin_to_line_offset(13).unwrap_err();
        assert_eq!(err.kind::<ConfigError>(), Some(ConfigError::UnknownPin));
    }
}
