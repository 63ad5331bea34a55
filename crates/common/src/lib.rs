//! Common utilities for usbhost
//!
//! This crate provides functionality shared by the host library and the
//! command line tool: logging setup, the crate-wide error type and the
//! notification channels that carry transfer, device and monitor events.

pub mod channel;
pub mod error;
pub mod logging;
pub mod test_utils;

pub use channel::{
    DeviceEvent, EventReceiver, EventSender, MonitorEvent, TransferEvent, event_channel,
};
pub use error::{Error, Result};
pub use logging::{LogLevel, setup_logging};
