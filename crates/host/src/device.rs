//! USB device handle
//!
//! A [`UsbDevice`] is described by a [`DeviceFilter`] and a [`DeviceConfig`].
//! Opening it looks the filter up in the attached devices, claims the
//! configured interface and keeps the handle until [`UsbDevice::close`].
//! Transfer channels created from the device share its handle.

use crate::backend::{Backend, HotplugEvent, HotplugToken, RawHandle};
use crate::event_loop::EventLoop;
use crate::lock;
use crate::settings::ChannelSettings;
use crate::transfer::TransferChannel;
use common::{DeviceEvent, EventReceiver, EventSender, event_channel};
use model::{DeviceConfig, DeviceFilter, DeviceIdentity, DeviceSpeed, TransferKind, UsbError};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Process-wide source of device ids
static NEXT_DEVICE_ID: AtomicU64 = AtomicU64::new(1);

/// Mutable part of a device, guarded by one lock
struct DeviceState {
    filter: DeviceFilter,
    config: DeviceConfig,
    identity: Option<DeviceIdentity>,
    timeout: Duration,
    speed: DeviceSpeed,
    status: Option<UsbError>,
    departure_watch: Option<HotplugToken>,
    claimed_interface: Option<u8>,
    driver_detached: bool,
}

/// State shared between a device and the channels created from it
pub(crate) struct DeviceShared {
    id: u64,
    backend: Arc<dyn Backend>,
    // Keeps the event thread alive while completions can still arrive
    _event_loop: Option<Arc<EventLoop>>,
    handle: RwLock<Option<Arc<dyn RawHandle>>>,
    connected: AtomicBool,
    open_channels: AtomicUsize,
    state: Mutex<DeviceState>,
    // Serializes open and close
    lifecycle: Mutex<()>,
    events: EventSender<DeviceEvent>,
    settings: ChannelSettings,
}

impl DeviceShared {
    /// Handle for new submissions; `None` unless connected
    pub(crate) fn handle(&self) -> Option<Arc<dyn RawHandle>> {
        if !self.is_connected() {
            return None;
        }
        self.current_handle()
    }

    fn current_handle(&self) -> Option<Arc<dyn RawHandle>> {
        self.handle
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub(crate) fn settings(&self) -> &ChannelSettings {
        &self.settings
    }

    pub(crate) fn timeout(&self) -> Duration {
        lock(&self.state).timeout
    }

    pub(crate) fn speed(&self) -> DeviceSpeed {
        lock(&self.state).speed
    }

    pub(crate) fn channel_opened(&self) {
        self.open_channels.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn channel_closed(&self) {
        self.open_channels.fetch_sub(1, Ordering::AcqRel);
    }

    /// The device went away underneath us
    pub(crate) fn mark_disconnected(&self) {
        if self.connected.swap(false, Ordering::AcqRel) {
            warn!("Device {} disconnected", self.id);
            self.set_status(UsbError::NoDevice);
            self.events.emit(DeviceEvent::ConnectionChanged(false));
        }
    }

    /// Record `error` as the last device status
    pub(crate) fn set_status(&self, error: UsbError) {
        let changed = {
            let mut state = lock(&self.state);
            let changed = state.status != Some(error);
            state.status = Some(error);
            changed
        };

        if changed {
            debug!("Device {} status: {}", self.id, error);
            self.events.emit(DeviceEvent::StatusChanged(error));
        }
    }

    fn clear_status(&self) {
        lock(&self.state).status = None;
    }
}

/// A USB device selected by filter
pub struct UsbDevice {
    shared: Arc<DeviceShared>,
}

impl UsbDevice {
    /// Create a closed device on `backend`
    ///
    /// The caller is responsible for driving [`Backend::handle_events`];
    /// devices created through [`crate::UsbHost`] share its event thread.
    pub fn new(backend: Arc<dyn Backend>, filter: DeviceFilter, config: DeviceConfig) -> Self {
        Self::with_parts(backend, None, filter, config, ChannelSettings::default())
    }

    pub(crate) fn with_parts(
        backend: Arc<dyn Backend>,
        event_loop: Option<Arc<EventLoop>>,
        filter: DeviceFilter,
        config: DeviceConfig,
        settings: ChannelSettings,
    ) -> Self {
        let (events, _) = event_channel();
        let shared = DeviceShared {
            id: NEXT_DEVICE_ID.fetch_add(1, Ordering::Relaxed),
            backend,
            _event_loop: event_loop,
            handle: RwLock::new(None),
            connected: AtomicBool::new(false),
            open_channels: AtomicUsize::new(0),
            state: Mutex::new(DeviceState {
                filter,
                config,
                identity: None,
                timeout: settings.timeout(),
                speed: DeviceSpeed::Unknown,
                status: None,
                departure_watch: None,
                claimed_interface: None,
                driver_detached: false,
            }),
            lifecycle: Mutex::new(()),
            events,
            settings,
        };

        Self {
            shared: Arc::new(shared),
        }
    }

    /// Unique id of this device object
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Open the first attached device matching the filter
    ///
    /// Wildcard fields of the filter are filled in from the device found.
    pub fn open(&self) -> Result<(), UsbError> {
        let shared = &self.shared;
        let _lifecycle = lock(&shared.lifecycle);

        if shared.is_connected() {
            debug!("Device {} already open", shared.id);
            return Err(UsbError::Busy);
        }

        let (filter, config) = {
            let state = lock(&shared.state);
            (state.filter.clone(), state.config)
        };

        if !filter.is_specific() {
            warn!("Refusing to open device with unspecific filter {}", filter);
            return Err(self.fail(UsbError::InvalidParam));
        }

        let list = shared.backend.device_list().map_err(|e| {
            warn!("Failed to list devices: {}", e);
            self.fail(e)
        })?;

        let found = (0..list.len()).find_map(|index| match list.descriptor(index) {
            Ok(identity) if filter.matches(&identity) => Some((index, identity)),
            Ok(_) => None,
            Err(e) => {
                debug!("Skipping device {} with unreadable descriptor: {}", index, e);
                None
            }
        });

        let Some((index, identity)) = found else {
            debug!("No attached device matches {}", filter);
            return Err(self.fail(UsbError::NotFound));
        };

        let handle = list.open(index).map_err(|e| {
            warn!("Failed to open {}: {}", identity, e);
            self.fail(e)
        })?;
        drop(list);

        let driver_detached = match handle.detach_kernel_driver(config.interface) {
            Ok(detached) => {
                if detached {
                    debug!("Detached kernel driver from interface {}", config.interface);
                }
                detached
            }
            Err(e) => {
                debug!(
                    "Could not detach kernel driver from interface {}: {}",
                    config.interface, e
                );
                false
            }
        };

        if let Err(e) = claim(handle.as_ref(), config) {
            warn!("Failed to set up {} on {}: {}", config, identity, e);
            if driver_detached {
                let _ = handle.attach_kernel_driver(config.interface);
            }
            return Err(self.fail(e));
        }

        {
            let mut state = lock(&shared.state);
            state.filter = filter.resolve(&identity);
            state.speed = identity.speed;
            state.identity = Some(identity.clone());
            state.claimed_interface = Some(config.interface);
            state.driver_detached = driver_detached;
        }
        *shared.handle.write().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        shared.clear_status();
        shared.connected.store(true, Ordering::Release);

        self.watch_departure(&identity);

        info!("Opened {} ({})", identity, config);
        shared.events.emit(DeviceEvent::ConnectionChanged(true));
        Ok(())
    }

    /// Mark the device disconnected when the backend reports it left
    fn watch_departure(&self, identity: &DeviceIdentity) {
        let shared = &self.shared;
        if !shared.backend.has_hotplug() {
            return;
        }

        let weak: Weak<DeviceShared> = Arc::downgrade(shared);
        let watched = identity.clone();
        let callback = Arc::new(move |event: HotplugEvent, identity: DeviceIdentity| {
            if event == HotplugEvent::Left && identity.same_device(&watched) {
                if let Some(shared) = weak.upgrade() {
                    shared.mark_disconnected();
                }
            }
        });

        match shared.backend.register_hotplug(&identity.filter(), callback) {
            Ok(token) => lock(&shared.state).departure_watch = Some(token),
            Err(e) => warn!("Failed to watch {} for removal: {}", identity, e),
        }
    }

    /// Release the device
    ///
    /// Channels should be closed first; their transfers fail with
    /// `NoDevice` afterwards.
    pub fn close(&self) {
        let shared = &self.shared;
        let _lifecycle = lock(&shared.lifecycle);

        let handle = shared
            .handle
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let was_connected = shared.connected.swap(false, Ordering::AcqRel);
        let (watch, interface, driver_detached) = {
            let mut state = lock(&shared.state);
            (
                state.departure_watch.take(),
                state.claimed_interface.take(),
                std::mem::take(&mut state.driver_detached),
            )
        };

        if let Some(token) = watch {
            shared.backend.deregister_hotplug(token);
        }

        let Some(handle) = handle else {
            debug!("Device {} already closed", shared.id);
            return;
        };

        let open_channels = shared.open_channels.load(Ordering::Acquire);
        if open_channels > 0 {
            warn!(
                "Closing device {} with {} channel(s) still open",
                shared.id, open_channels
            );
        }

        if let Some(interface) = interface {
            if let Err(e) = handle.release_interface(interface) {
                warn!("Failed to release interface {}: {}", interface, e);
            }
            if driver_detached {
                match handle.attach_kernel_driver(interface) {
                    Ok(()) => debug!("Reattached kernel driver to interface {}", interface),
                    Err(e) => debug!("Could not reattach kernel driver: {}", e),
                }
            }
        }
        drop(handle);

        info!("Closed device {}", shared.id);
        if was_connected {
            shared.events.emit(DeviceEvent::ConnectionChanged(false));
        }
    }

    fn fail(&self, error: UsbError) -> UsbError {
        self.shared.set_status(error);
        error
    }

    pub fn is_connected(&self) -> bool {
        self.shared.is_connected()
    }

    /// Identity of the opened device; `None` before the first open
    pub fn identity(&self) -> Option<DeviceIdentity> {
        lock(&self.shared.state).identity.clone()
    }

    pub fn filter(&self) -> DeviceFilter {
        lock(&self.shared.state).filter.clone()
    }

    /// Change the filter used by the next [`open`](Self::open)
    pub fn set_filter(&self, filter: DeviceFilter) {
        lock(&self.shared.state).filter = filter;
    }

    pub fn config(&self) -> DeviceConfig {
        lock(&self.shared.state).config
    }

    /// Change the configuration used by the next [`open`](Self::open)
    pub fn set_config(&self, config: DeviceConfig) {
        lock(&self.shared.state).config = config;
    }

    /// Backend timeout of transfers submitted from now on
    pub fn timeout(&self) -> Duration {
        self.shared.timeout()
    }

    pub fn set_timeout(&self, timeout: Duration) {
        lock(&self.shared.state).timeout = timeout;
    }

    pub fn speed(&self) -> DeviceSpeed {
        self.shared.speed()
    }

    pub fn speed_string(&self) -> &'static str {
        self.speed().as_str()
    }

    /// Last error recorded for this device; `None` while everything is fine
    pub fn status(&self) -> Option<UsbError> {
        lock(&self.shared.state).status
    }

    /// Numeric status: `0` for ok, otherwise [`UsbError::code`]
    pub fn status_code(&self) -> i32 {
        self.status().map_or(0, |e| e.code())
    }

    pub fn status_string(&self) -> String {
        self.status()
            .map_or_else(|| "No error".to_string(), |e| e.to_string())
    }

    /// Subscribe to connection and status changes
    pub fn events(&self) -> EventReceiver<DeviceEvent> {
        self.shared.events.subscribe()
    }

    /// Channel on a single endpoint; the direction follows bit 7 of `endpoint`
    pub fn channel(&self, kind: TransferKind, endpoint: u8) -> TransferChannel {
        if endpoint & 0x80 != 0 {
            TransferChannel::new(Arc::clone(&self.shared), kind, Some(endpoint), None)
        } else {
            TransferChannel::new(Arc::clone(&self.shared), kind, None, Some(endpoint))
        }
    }

    /// Channel reading from `endpoint_in` and writing to `endpoint_out`
    pub fn channel_pair(
        &self,
        kind: TransferKind,
        endpoint_in: u8,
        endpoint_out: u8,
    ) -> TransferChannel {
        TransferChannel::new(
            Arc::clone(&self.shared),
            kind,
            Some(endpoint_in),
            Some(endpoint_out),
        )
    }

    /// Channel on the default control endpoint
    pub fn control_channel(&self) -> TransferChannel {
        TransferChannel::new(
            Arc::clone(&self.shared),
            TransferKind::Control,
            Some(0x80),
            Some(0x00),
        )
    }
}

impl Drop for UsbDevice {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for UsbDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsbDevice")
            .field("id", &self.shared.id)
            .field("filter", &self.filter())
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Select the configuration, claim the interface and pick the alternate setting
fn claim(handle: &dyn RawHandle, config: DeviceConfig) -> Result<(), UsbError> {
    match handle.active_configuration() {
        Ok(active) if active == config.config => {}
        Ok(active) => {
            debug!("Switching configuration {} -> {}", active, config.config);
            handle.set_configuration(config.config)?;
        }
        Err(e) => {
            debug!("Could not read active configuration: {}", e);
            handle.set_configuration(config.config)?;
        }
    }

    handle.claim_interface(config.interface)?;

    if config.alternate != 0 {
        if let Err(e) = handle.set_alternate_setting(config.interface, config.alternate) {
            let _ = handle.release_interface(config.interface);
            return Err(e);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::{MockBackend, MockDevice};
    use common::test_utils::create_mock_identity;

    fn backend_with_device() -> MockBackend {
        let backend = MockBackend::new();
        backend.add_device(MockDevice::new(create_mock_identity(0x1234, 0x5678, 2, 3)).with_bulk_pair());
        backend
    }

    #[test]
    fn test_open_resolves_filter() {
        let backend = backend_with_device();
        let device = UsbDevice::new(
            Arc::new(backend.clone()),
            DeviceFilter::new(0x1234, 0x5678),
            DeviceConfig::default(),
        );

        device.open().unwrap();
        assert!(device.is_connected());
        assert_eq!(device.filter().bus, Some(2));
        assert_eq!(device.filter().port, Some(3));
        assert_eq!(device.speed(), DeviceSpeed::High);
        assert_eq!(backend.claimed_interfaces(), vec![0]);
        assert_eq!(backend.outstanding_lists(), 0);
    }

    #[test]
    fn test_open_twice_is_busy() {
        let backend = backend_with_device();
        let device = UsbDevice::new(
            Arc::new(backend),
            DeviceFilter::new(0x1234, 0x5678),
            DeviceConfig::default(),
        );

        device.open().unwrap();
        assert_eq!(device.open(), Err(UsbError::Busy));
    }

    #[test]
    fn test_unspecific_filter_rejected() {
        let device = UsbDevice::new(
            Arc::new(backend_with_device()),
            DeviceFilter::default(),
            DeviceConfig::default(),
        );

        assert_eq!(device.open(), Err(UsbError::InvalidParam));
        assert_eq!(device.status(), Some(UsbError::InvalidParam));
        assert_eq!(device.status_code(), UsbError::InvalidParam.code());
    }

    #[test]
    fn test_close_releases_interface() {
        let backend = backend_with_device();
        let device = UsbDevice::new(
            Arc::new(backend.clone()),
            DeviceFilter::new(0x1234, 0x5678),
            DeviceConfig::default(),
        );

        device.open().unwrap();
        device.close();
        assert!(!device.is_connected());
        assert_eq!(backend.released_interfaces(), vec![0]);

        // Second close is a no-op
        device.close();
        assert_eq!(backend.released_interfaces(), vec![0]);
    }

    #[test]
    fn test_status_string_when_ok() {
        let device = UsbDevice::new(
            Arc::new(MockBackend::new()),
            DeviceFilter::new(0x1234, 0x5678),
            DeviceConfig::default(),
        );
        assert_eq!(device.status_code(), 0);
        assert_eq!(device.status_string(), "No error");
    }
}
