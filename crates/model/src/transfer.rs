//! Transfer kinds, completion statuses and control request helpers

use crate::error::UsbError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Size of a control transfer setup packet
pub const CONTROL_SETUP_SIZE: usize = 8;

/// USB transfer type of an endpoint
///
/// The discriminants match the transfer type bits of an endpoint's
/// `bmAttributes` (stream is a libusb extension of bulk).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferKind {
    Control = 0,
    Isochronous = 1,
    Bulk = 2,
    Interrupt = 3,
    Stream = 4,
}

impl TransferKind {
    /// Decode the transfer type from an endpoint's `bmAttributes`
    pub fn from_attributes(attributes: u8) -> Self {
        match attributes & 0x03 {
            0 => TransferKind::Control,
            1 => TransferKind::Isochronous,
            2 => TransferKind::Bulk,
            _ => TransferKind::Interrupt,
        }
    }
}

impl fmt::Display for TransferKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransferKind::Control => "control",
            TransferKind::Isochronous => "isochronous",
            TransferKind::Bulk => "bulk",
            TransferKind::Interrupt => "interrupt",
            TransferKind::Stream => "stream",
        };
        f.write_str(name)
    }
}

/// Completion status of a single transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferStatus {
    /// Transfer completed without error
    Completed,
    /// Transfer failed for an unspecified reason
    Error,
    /// No data within the transfer timeout
    Timeout,
    /// Transfer was cancelled
    Cancelled,
    /// Endpoint halted
    Stall,
    /// Device disconnected
    NoDevice,
    /// Device sent more data than requested
    Overflow,
}

impl TransferStatus {
    pub fn is_completed(&self) -> bool {
        matches!(self, TransferStatus::Completed)
    }
}

impl From<UsbError> for TransferStatus {
    fn from(error: UsbError) -> Self {
        match error {
            UsbError::Timeout => TransferStatus::Timeout,
            UsbError::Pipe => TransferStatus::Stall,
            UsbError::NoDevice => TransferStatus::NoDevice,
            UsbError::Overflow => TransferStatus::Overflow,
            UsbError::Interrupted => TransferStatus::Cancelled,
            _ => TransferStatus::Error,
        }
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransferStatus::Completed => "transfer completed",
            TransferStatus::Error => "transfer error",
            TransferStatus::Timeout => "transfer timeout",
            TransferStatus::Cancelled => "transfer cancelled",
            TransferStatus::Stall => "transfer stall",
            TransferStatus::NoDevice => "no device",
            TransferStatus::Overflow => "transfer overflow",
        };
        f.write_str(name)
    }
}

/// Direction(s) a transfer channel is opened for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpenMode {
    Read,
    Write,
    ReadWrite,
}

impl OpenMode {
    pub fn readable(&self) -> bool {
        matches!(self, OpenMode::Read | OpenMode::ReadWrite)
    }

    pub fn writable(&self) -> bool {
        matches!(self, OpenMode::Write | OpenMode::ReadWrite)
    }
}

/// `bmRequestType` building blocks
pub struct RequestType;

impl RequestType {
    pub const DIRECTION_OUT: u8 = 0x00;
    pub const DIRECTION_IN: u8 = 0x80;

    pub const STANDARD: u8 = 0x00 << 5;
    pub const CLASS: u8 = 0x01 << 5;
    pub const VENDOR: u8 = 0x02 << 5;
    pub const RESERVED: u8 = 0x03 << 5;

    pub const RECIPIENT_DEVICE: u8 = 0x00;
    pub const RECIPIENT_INTERFACE: u8 = 0x01;
    pub const RECIPIENT_ENDPOINT: u8 = 0x02;
    pub const RECIPIENT_OTHER: u8 = 0x03;

    /// True if the request type describes a device-to-host transfer
    pub fn is_in(request_type: u8) -> bool {
        request_type & Self::DIRECTION_IN != 0
    }
}

/// Standard `bRequest` values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Request {
    GetStatus = 0x00,
    ClearFeature = 0x01,
    SetFeature = 0x03,
    SetAddress = 0x05,
    GetDescriptor = 0x06,
    SetDescriptor = 0x07,
    GetConfiguration = 0x08,
    SetConfiguration = 0x09,
    GetInterface = 0x0A,
    SetInterface = 0x0B,
    SynchFrame = 0x0C,
    SetSel = 0x30,
    IsochDelay = 0x31,
}

/// Build a control transfer setup packet
///
/// Multi-byte fields are little-endian, as on the wire.
pub fn control_setup(
    request_type: u8,
    request: u8,
    value: u16,
    index: u16,
    length: u16,
) -> [u8; CONTROL_SETUP_SIZE] {
    let value = value.to_le_bytes();
    let index = index.to_le_bytes();
    let length = length.to_le_bytes();
    [
        request_type,
        request,
        value[0],
        value[1],
        index[0],
        index[1],
        length[0],
        length[1],
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_setup_layout() {
        let setup = control_setup(
            RequestType::DIRECTION_IN | RequestType::STANDARD | RequestType::RECIPIENT_DEVICE,
            Request::GetDescriptor as u8,
            0x0100,
            0x0409,
            18,
        );
        assert_eq!(setup, [0x80, 0x06, 0x00, 0x01, 0x09, 0x04, 18, 0]);
        assert!(RequestType::is_in(setup[0]));
    }

    #[test]
    fn test_kind_from_attributes() {
        assert_eq!(TransferKind::from_attributes(0x02), TransferKind::Bulk);
        assert_eq!(TransferKind::from_attributes(0x03), TransferKind::Interrupt);
        // Sync/usage bits are ignored
        assert_eq!(TransferKind::from_attributes(0x0D), TransferKind::Isochronous);
        assert_eq!(TransferKind::from_attributes(0x00), TransferKind::Control);
    }

    #[test]
    fn test_status_from_error() {
        assert_eq!(TransferStatus::from(UsbError::Pipe), TransferStatus::Stall);
        assert_eq!(TransferStatus::from(UsbError::NoDevice), TransferStatus::NoDevice);
        assert_eq!(TransferStatus::from(UsbError::Busy), TransferStatus::Error);
    }

    #[test]
    fn test_open_mode_directions() {
        assert!(OpenMode::Read.readable());
        assert!(!OpenMode::Read.writable());
        assert!(OpenMode::Write.writable());
        assert!(OpenMode::ReadWrite.readable() && OpenMode::ReadWrite.writable());
    }
}
