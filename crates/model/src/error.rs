//! USB error taxonomy

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// USB operation errors
///
/// Mirrors the libusb error codes. Every variant carries a stable numeric
/// status code (see [`UsbError::code`]) so that callers which log or persist
/// status values get the same numbers regardless of backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error, Serialize, Deserialize)]
pub enum UsbError {
    /// Input/output error
    #[error("Input/output error")]
    Io,
    /// Invalid parameter
    #[error("Invalid parameter")]
    InvalidParam,
    /// Access denied (insufficient permissions)
    #[error("Access denied (insufficient permissions)")]
    Access,
    /// No such device (it may have been disconnected)
    #[error("No such device (it may have been disconnected)")]
    NoDevice,
    /// Entity not found
    #[error("Entity not found")]
    NotFound,
    /// Resource busy
    #[error("Resource busy")]
    Busy,
    /// Operation timed out
    #[error("Operation timed out")]
    Timeout,
    /// Overflow
    #[error("Overflow")]
    Overflow,
    /// Pipe error (endpoint stalled)
    #[error("Pipe error")]
    Pipe,
    /// System call interrupted (perhaps due to signal)
    #[error("System call interrupted (perhaps due to signal)")]
    Interrupted,
    /// Insufficient memory
    #[error("Insufficient memory")]
    NoMemory,
    /// Operation not supported or unimplemented on this platform
    #[error("Operation not supported or unimplemented on this platform")]
    NotSupported,
    /// Other error
    #[error("Other error")]
    Other,
}

impl UsbError {
    /// Numeric status code (libusb numbering, `-99` for [`UsbError::Other`])
    pub fn code(&self) -> i32 {
        match self {
            UsbError::Io => -1,
            UsbError::InvalidParam => -2,
            UsbError::Access => -3,
            UsbError::NoDevice => -4,
            UsbError::NotFound => -5,
            UsbError::Busy => -6,
            UsbError::Timeout => -7,
            UsbError::Overflow => -8,
            UsbError::Pipe => -9,
            UsbError::Interrupted => -10,
            UsbError::NoMemory => -11,
            UsbError::NotSupported => -12,
            UsbError::Other => -99,
        }
    }

    /// Map a numeric status code back to an error
    ///
    /// Returns `None` for `0` (success). Unknown negative codes map to
    /// [`UsbError::Other`].
    pub fn from_code(code: i32) -> Option<Self> {
        let error = match code {
            0 => return None,
            -1 => UsbError::Io,
            -2 => UsbError::InvalidParam,
            -3 => UsbError::Access,
            -4 => UsbError::NoDevice,
            -5 => UsbError::NotFound,
            -6 => UsbError::Busy,
            -7 => UsbError::Timeout,
            -8 => UsbError::Overflow,
            -9 => UsbError::Pipe,
            -10 => UsbError::Interrupted,
            -11 => UsbError::NoMemory,
            -12 => UsbError::NotSupported,
            _ => UsbError::Other,
        };
        Some(error)
    }
}

/// Error parsing a `VID:PID[@BUS.PORT]` filter string
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FilterParseError {
    /// Missing the `:` separating vendor and product id
    #[error("Invalid filter format '{0}', expected VID:PID (e.g., '0x1234:0x5678')")]
    Format(String),

    /// A vendor or product id that is not a `0x` prefixed 16-bit hex number
    #[error("Invalid {name} '{value}', must be a hex number like '0x1234' or '*'")]
    HexId { name: &'static str, value: String },

    /// A bus or port that is not a decimal byte or `*`
    #[error("Invalid {name} '{value}', must be a decimal number or '*'")]
    Location { name: &'static str, value: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_round_trip() {
        let all = [
            UsbError::Io,
            UsbError::InvalidParam,
            UsbError::Access,
            UsbError::NoDevice,
            UsbError::NotFound,
            UsbError::Busy,
            UsbError::Timeout,
            UsbError::Overflow,
            UsbError::Pipe,
            UsbError::Interrupted,
            UsbError::NoMemory,
            UsbError::NotSupported,
            UsbError::Other,
        ];

        for error in all {
            assert_eq!(UsbError::from_code(error.code()), Some(error));
        }
    }

    #[test]
    fn test_success_and_unknown_codes() {
        assert_eq!(UsbError::from_code(0), None);
        assert_eq!(UsbError::from_code(-42), Some(UsbError::Other));
    }

    #[test]
    fn test_error_display() {
        assert_eq!(UsbError::Pipe.to_string(), "Pipe error");
        assert!(UsbError::NoDevice.to_string().contains("disconnected"));
    }
}
