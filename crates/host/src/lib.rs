//! Host-side USB access
//!
//! This crate provides:
//! - Device enumeration ([`directory::devices`])
//! - Opening devices by filter ([`UsbDevice`])
//! - Asynchronous bulk, interrupt, isochronous and control transfers with
//!   continuation of partial writes and continuous read polling
//!   ([`TransferChannel`])
//! - Arrival and departure monitoring ([`DeviceMonitor`])
//!
//! Everything runs on top of a [`Backend`]: [`LibusbBackend`] for real
//! hardware, [`MockBackend`] for tests. [`UsbHost`] ties a backend to its
//! event thread.
//!
//! # Example
//!
//! ```no_run
//! use host::UsbHost;
//! use model::{DeviceConfig, DeviceFilter, OpenMode, TransferKind};
//!
//! let host = UsbHost::with_libusb()?;
//! let device = host.device(DeviceFilter::new(0x1234, 0x5678), DeviceConfig::default());
//! device.open()?;
//!
//! let channel = device.channel_pair(TransferKind::Bulk, 0x81, 0x01);
//! channel.open(OpenMode::ReadWrite)?;
//! channel.write(b"ping")?;
//! # Ok::<(), model::UsbError>(())
//! ```

pub mod backend;
pub mod buffer;
pub mod device;
pub mod directory;
pub mod event_loop;
pub mod monitor;
pub mod settings;
pub mod transfer;

pub use backend::libusb::LibusbBackend;
pub use backend::mock::{MockBackend, MockDevice};
pub use backend::{Backend, DeviceList, RawHandle};
pub use buffer::TransferBuffer;
pub use device::UsbDevice;
pub use event_loop::EventLoop;
pub use monitor::{DeviceMonitor, MonitorMode};
pub use settings::{ChannelSettings, MIN_POLL_INTERVAL, MonitorSettings};
pub use transfer::TransferChannel;

use common::LogLevel;
use model::{DeviceConfig, DeviceFilter, DeviceIdentity, UsbError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Lock a mutex, recovering the data if a holder panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A backend together with the thread servicing its events
pub struct UsbHost {
    backend: Arc<dyn Backend>,
    event_loop: Arc<EventLoop>,
    channel_settings: ChannelSettings,
}

impl UsbHost {
    /// Start the event thread for `backend`
    pub fn new(backend: Arc<dyn Backend>) -> Result<Self, UsbError> {
        let event_loop = Arc::new(EventLoop::spawn(Arc::clone(&backend))?);
        Ok(Self {
            backend,
            event_loop,
            channel_settings: ChannelSettings::default(),
        })
    }

    /// Host on a fresh libusb context
    pub fn with_libusb() -> Result<Self, UsbError> {
        Self::new(Arc::new(LibusbBackend::new()?))
    }

    /// Settings applied to devices created from now on
    pub fn with_channel_settings(mut self, settings: ChannelSettings) -> Self {
        self.channel_settings = settings;
        self
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn set_log_level(&self, level: LogLevel) {
        self.backend.set_log_level(level);
    }

    /// Enumerate attached devices; see [`directory::devices`]
    pub fn devices(&self, detail: bool) -> Result<Vec<DeviceIdentity>, UsbError> {
        directory::devices(self.backend.as_ref(), detail)
    }

    /// A closed device selected by `filter`
    pub fn device(&self, filter: DeviceFilter, config: DeviceConfig) -> UsbDevice {
        UsbDevice::with_parts(
            Arc::clone(&self.backend),
            Some(Arc::clone(&self.event_loop)),
            filter,
            config,
            self.channel_settings.clone(),
        )
    }

    /// Start a device monitor
    pub fn monitor(&self, settings: MonitorSettings) -> Result<DeviceMonitor, UsbError> {
        DeviceMonitor::with_event_loop(
            Arc::clone(&self.backend),
            Some(Arc::clone(&self.event_loop)),
            settings,
        )
    }
}
