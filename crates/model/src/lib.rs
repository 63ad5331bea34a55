//! Shared value types for usbhost
//!
//! This crate defines the types that flow between the transfer engine, the
//! device monitor and callers: device identities and filters, configuration
//! selections, transfer kinds and completion statuses, and the USB error
//! taxonomy.
//!
//! # Example
//!
//! ```
//! use model::{DeviceFilter, DeviceIdentity};
//!
//! let filter: DeviceFilter = "0x1234:0x5678".parse().unwrap();
//! let device = DeviceIdentity::new(0x1234, 0x5678, 3, 7);
//!
//! // Wildcard bus/port matches any location
//! assert!(filter.matches(&device));
//! assert!(!filter.at(1, 1).matches(&device));
//! ```

pub mod error;
pub mod transfer;
pub mod types;

pub use error::{FilterParseError, UsbError};
pub use transfer::{
    CONTROL_SETUP_SIZE, OpenMode, Request, RequestType, TransferKind, TransferStatus,
    control_setup,
};
pub use types::{DeviceConfig, DeviceFilter, DeviceIdentity, DeviceSpeed, EndpointDescriptor};
