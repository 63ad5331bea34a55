//! Transport backend capability
//!
//! The engine, directory and monitor talk to the platform through these
//! traits only. [`libusb::LibusbBackend`] drives libusb through `rusb`;
//! [`mock::MockBackend`] is an in-memory backend whose devices and transfer
//! completions are scripted by tests.
//!
//! # Completion contract
//!
//! A [`CompletionHandler`] passed to [`RawHandle::submit_transfer`] is called
//! exactly once, with the transfer buffer handed back, and never from inside
//! `submit_transfer` itself. It may be called from any thread and may call
//! back into the handle (resubmit, clear a halt).

pub mod libusb;
pub mod mock;

use common::LogLevel;
use model::{DeviceFilter, DeviceIdentity, TransferKind, TransferStatus, UsbError};
use std::sync::Arc;
use std::time::Duration;

/// Identifier of a submitted transfer, unique per backend
pub type TransferId = u64;

/// Identifier of a hotplug registration
pub type HotplugToken = u64;

/// A transfer ready to be submitted
#[derive(Debug)]
pub struct TransferRequest {
    /// Endpoint address; bit 7 set for IN
    pub endpoint: u8,
    pub kind: TransferKind,
    /// Data to send, or space to receive into
    ///
    /// Control transfers start with the 8-byte setup packet.
    pub buffer: Vec<u8>,
    pub timeout: Duration,
}

/// Outcome of a transfer, delivered to its completion handler
#[derive(Debug)]
pub struct TransferCompletion {
    pub status: TransferStatus,
    /// Bytes actually transferred, excluding a control setup packet
    pub actual_length: usize,
    /// The buffer of the request, handed back
    pub buffer: Vec<u8>,
}

pub type CompletionHandler = Box<dyn FnOnce(TransferCompletion) + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HotplugEvent {
    Arrived,
    Left,
}

pub type HotplugCallback = Arc<dyn Fn(HotplugEvent, DeviceIdentity) + Send + Sync + 'static>;

/// Endpoint as listed in a configuration descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawEndpoint {
    pub address: u8,
    pub attributes: u8,
    pub max_packet_size: u16,
}

/// One alternate setting of one interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawInterface {
    pub number: u8,
    pub alternate: u8,
    pub endpoints: Vec<RawEndpoint>,
}

/// Configuration descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawConfig {
    /// bConfigurationValue
    pub number: u8,
    /// Every alternate setting of every interface
    pub interfaces: Vec<RawInterface>,
}

/// Platform USB backend
pub trait Backend: Send + Sync {
    /// Snapshot the attached devices
    ///
    /// The snapshot holds backend resources until dropped.
    fn device_list(&self) -> Result<Box<dyn DeviceList>, UsbError>;

    fn has_hotplug(&self) -> bool;

    /// Register for arrival/departure of devices matching `filter`
    ///
    /// Vendor id, product id and class of the filter are honoured; bus and
    /// port are left to the callback.
    fn register_hotplug(
        &self,
        filter: &DeviceFilter,
        callback: HotplugCallback,
    ) -> Result<HotplugToken, UsbError>;

    /// Stop delivering events for `token`
    ///
    /// After this returns the callback is not called again.
    fn deregister_hotplug(&self, token: HotplugToken);

    /// Service pending completions and hotplug events for up to `timeout`
    fn handle_events(&self, timeout: Duration) -> Result<(), UsbError>;

    fn set_log_level(&self, level: LogLevel);
}

/// Snapshot of attached devices
///
/// Indices run from `0` to `len() - 1`. Dropping the list releases it.
pub trait DeviceList: Send {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Vendor/product id, class, location and speed of one device
    ///
    /// Configurations, endpoints and description are left empty.
    fn descriptor(&self, index: usize) -> Result<DeviceIdentity, UsbError>;

    /// Configuration descriptor by index (not by configuration value)
    fn config_descriptor(&self, index: usize, config_index: u8) -> Result<RawConfig, UsbError>;

    /// Product string, if it can be read without disturbing the device
    fn description(&self, _index: usize) -> Option<String> {
        None
    }

    fn open(&self, index: usize) -> Result<Arc<dyn RawHandle>, UsbError>;
}

/// An opened device
pub trait RawHandle: Send + Sync {
    fn active_configuration(&self) -> Result<u8, UsbError>;

    fn set_configuration(&self, config: u8) -> Result<(), UsbError>;

    fn claim_interface(&self, interface: u8) -> Result<(), UsbError>;

    fn release_interface(&self, interface: u8) -> Result<(), UsbError>;

    fn set_alternate_setting(&self, interface: u8, alternate: u8) -> Result<(), UsbError>;

    /// Detach an active kernel driver from `interface`
    ///
    /// Returns whether a driver was detached.
    fn detach_kernel_driver(&self, interface: u8) -> Result<bool, UsbError>;

    fn attach_kernel_driver(&self, interface: u8) -> Result<(), UsbError>;

    fn clear_halt(&self, endpoint: u8) -> Result<(), UsbError>;

    /// Submit a transfer; `on_complete` runs once the transfer ends
    ///
    /// On error the handler is dropped without being called.
    fn submit_transfer(
        &self,
        request: TransferRequest,
        on_complete: CompletionHandler,
    ) -> Result<TransferId, UsbError>;

    /// Request cancellation; the completion reports [`TransferStatus::Cancelled`]
    ///
    /// Returns [`UsbError::NotFound`] if the transfer already finished.
    fn cancel_transfer(&self, id: TransferId) -> Result<(), UsbError>;
}
