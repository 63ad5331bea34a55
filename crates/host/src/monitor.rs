//! Device presence monitor
//!
//! The monitor keeps the last observed list of attached devices and reports
//! arrivals and departures on its event channel. With hotplug support each
//! backend callback is published as a one-element [`MonitorEvent`]; without
//! it a ticker thread rescans the devices every poll interval and publishes
//! the difference to the previous scan.
//!
//! The watch set (`add_device`/`remove_device`) only drives the presence
//! queries. Notifications always cover every device on the system; callers
//! match them against their own filters.

use crate::backend::{Backend, HotplugEvent, HotplugToken};
use crate::device::UsbDevice;
use crate::directory;
use crate::event_loop::EventLoop;
use crate::lock;
use crate::settings::MonitorSettings;
use common::{EventReceiver, EventSender, MonitorEvent, event_channel};
use model::{DeviceConfig, DeviceFilter, DeviceIdentity, UsbError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::Instant;
use tracing::{debug, info, warn};

/// How the monitor learns about changes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorMode {
    /// Backend hotplug callbacks
    Hotplug,
    /// Periodic rescans
    Polling,
}

#[derive(Default)]
struct MonitorState {
    watched: Vec<DeviceFilter>,
    last_system: Vec<DeviceIdentity>,
    /// Ids of devices opened through the monitor
    in_use: Vec<u64>,
}

struct MonitorInner {
    backend: Arc<dyn Backend>,
    settings: MonitorSettings,
    state: Mutex<MonitorState>,
    // Serializes rescans so a slow scan cannot overwrite a newer one
    scan: Mutex<()>,
    events: EventSender<MonitorEvent>,
    shutting_down: AtomicBool,
    hotplug: Mutex<Option<HotplugToken>>,
    _event_loop: Option<Arc<EventLoop>>,
}

/// Watches the system for device arrivals and departures
pub struct DeviceMonitor {
    inner: Arc<MonitorInner>,
    mode: MonitorMode,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl DeviceMonitor {
    /// Start monitoring `backend`
    ///
    /// The caller drives [`Backend::handle_events`] for hotplug delivery;
    /// monitors created through [`crate::UsbHost`] share its event thread.
    pub fn start(backend: Arc<dyn Backend>, settings: MonitorSettings) -> Result<Self, UsbError> {
        Self::with_event_loop(backend, None, settings)
    }

    pub(crate) fn with_event_loop(
        backend: Arc<dyn Backend>,
        event_loop: Option<Arc<EventLoop>>,
        settings: MonitorSettings,
    ) -> Result<Self, UsbError> {
        let initial = directory::devices(backend.as_ref(), settings.enumerate_details)
            .unwrap_or_else(|e| {
                warn!("Initial device scan failed: {}", e);
                Vec::new()
            });
        debug!("Monitor starting with {} attached devices", initial.len());

        let (events, _) = event_channel();
        let inner = Arc::new(MonitorInner {
            backend,
            settings,
            state: Mutex::new(MonitorState {
                last_system: initial,
                ..MonitorState::default()
            }),
            scan: Mutex::new(()),
            events,
            shutting_down: AtomicBool::new(false),
            hotplug: Mutex::new(None),
            _event_loop: event_loop,
        });

        let mut monitor = Self {
            inner,
            mode: MonitorMode::Polling,
            ticker: Mutex::new(None),
        };

        if monitor.inner.backend.has_hotplug() && !monitor.inner.settings.force_polling {
            match monitor.register_hotplug() {
                Ok(()) => monitor.mode = MonitorMode::Hotplug,
                Err(e) => warn!("Hotplug registration failed, polling instead: {}", e),
            }
        }

        if monitor.mode == MonitorMode::Polling {
            monitor.spawn_ticker()?;
        }

        info!("Device monitor started in {:?} mode", monitor.mode);
        Ok(monitor)
    }

    fn register_hotplug(&self) -> Result<(), UsbError> {
        let weak: Weak<MonitorInner> = Arc::downgrade(&self.inner);
        let token = self.inner.backend.register_hotplug(
            &DeviceFilter::default(),
            Arc::new(move |event, identity| {
                if let Some(inner) = weak.upgrade() {
                    inner.hotplug_event(event, identity);
                }
            }),
        )?;
        *lock(&self.inner.hotplug) = Some(token);
        Ok(())
    }

    fn spawn_ticker(&self) -> Result<(), UsbError> {
        let inner = Arc::clone(&self.inner);
        let thread = std::thread::Builder::new()
            .name("usb-monitor".to_string())
            .spawn(move || {
                let interval = inner.settings.poll_interval();
                while !inner.is_shutting_down() {
                    let deadline = Instant::now() + interval;
                    loop {
                        let now = Instant::now();
                        if now >= deadline || inner.is_shutting_down() {
                            break;
                        }
                        std::thread::park_timeout(deadline - now);
                    }
                    inner.tick();
                }
                debug!("Monitor ticker stopped");
            })
            .map_err(|e| {
                warn!("Failed to spawn monitor thread: {}", e);
                UsbError::NoMemory
            })?;

        *lock(&self.ticker) = Some(thread);
        Ok(())
    }

    pub fn mode(&self) -> MonitorMode {
        self.mode
    }

    /// Subscribe to arrival and departure notifications
    pub fn events(&self) -> EventReceiver<MonitorEvent> {
        self.inner.events.subscribe()
    }

    /// Rescan now and publish the difference to the previous scan
    pub fn tick(&self) {
        self.inner.tick();
    }

    /// Add a filter to the watch set
    ///
    /// Returns false if the filter is already watched. A filter without bus
    /// and port is already watched when any entry on the same ids is.
    pub fn add_device(&self, filter: DeviceFilter) -> bool {
        let mut state = lock(&self.inner.state);
        if state.watched.iter().any(|f| watches_same(f, &filter)) {
            return false;
        }
        debug!("Watching {}", filter);
        state.watched.push(filter);
        true
    }

    /// Remove the first watched filter that is the same entry as `filter`
    ///
    /// Removing an unknown filter succeeds.
    pub fn remove_device(&self, filter: &DeviceFilter) -> bool {
        let mut state = lock(&self.inner.state);
        match state.watched.iter().position(|f| watches_same(f, filter)) {
            Some(index) => {
                debug!("No longer watching {}", state.watched.remove(index));
            }
            None => debug!("{} is not watched", filter),
        }
        true
    }

    pub fn watched(&self) -> Vec<DeviceFilter> {
        lock(&self.inner.state).watched.clone()
    }

    /// True if `filter` matches a device of the last observed system list
    pub fn is_present(&self, filter: &DeviceFilter) -> bool {
        lock(&self.inner.state)
            .last_system
            .iter()
            .any(|identity| filter.matches(identity))
    }

    /// Watched filters that match a device of the last observed system list
    pub fn present_devices(&self) -> Vec<DeviceFilter> {
        let state = lock(&self.inner.state);
        state
            .watched
            .iter()
            .filter(|filter| state.last_system.iter().any(|d| filter.matches(d)))
            .cloned()
            .collect()
    }

    /// The last observed system list
    pub fn system_devices(&self) -> Vec<DeviceIdentity> {
        lock(&self.inner.state).last_system.clone()
    }

    /// Apply `filter` and `config` to `device`, open it and track it as in use
    ///
    /// The watch set is not touched.
    pub fn open_device(
        &self,
        device: &UsbDevice,
        filter: DeviceFilter,
        config: DeviceConfig,
    ) -> Result<(), UsbError> {
        device.set_filter(filter);
        device.set_config(config);
        device.open()?;

        let id = device.id();
        let mut state = lock(&self.inner.state);
        if !state.in_use.contains(&id) {
            state.in_use.push(id);
        }
        Ok(())
    }

    /// Stop tracking `device` and close it
    pub fn close_device(&self, device: &UsbDevice) {
        let id = device.id();
        lock(&self.inner.state).in_use.retain(|d| *d != id);
        device.close();
    }

    /// Ids of the devices opened through this monitor
    pub fn devices_in_use(&self) -> Vec<u64> {
        lock(&self.inner.state).in_use.clone()
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.is_shutting_down()
    }

    /// Stop monitoring
    ///
    /// Deregisters the hotplug callback or stops the ticker. No notification
    /// is published once this has begun. Later calls do nothing.
    pub fn shutdown(&self) {
        let inner = &self.inner;
        if inner.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }

        // Wait out a publication in progress
        drop(lock(&inner.state));
        inner.events.close();

        if let Some(token) = lock(&inner.hotplug).take() {
            inner.backend.deregister_hotplug(token);
        }

        if let Some(thread) = lock(&self.ticker).take() {
            thread.thread().unpark();
            if thread.join().is_err() {
                warn!("Monitor thread panicked");
            }
        }

        info!("Device monitor stopped");
    }
}

impl Drop for DeviceMonitor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl MonitorInner {
    fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    fn tick(&self) {
        if self.is_shutting_down() {
            return;
        }
        let _scan = lock(&self.scan);

        let current = match directory::devices(self.backend.as_ref(), self.settings.enumerate_details)
        {
            Ok(current) => current,
            Err(e) => {
                warn!("Device scan failed: {}", e);
                return;
            }
        };

        let mut state = lock(&self.state);
        let (inserted, removed) = diff(&state.last_system, &current);
        state.last_system = current;

        if self.is_shutting_down() {
            return;
        }
        if !inserted.is_empty() {
            info!("{} device(s) arrived", inserted.len());
            self.events.emit(MonitorEvent::Arrived(inserted));
        }
        if !removed.is_empty() {
            info!("{} device(s) removed", removed.len());
            self.events.emit(MonitorEvent::Removed(removed));
        }
    }

    fn hotplug_event(&self, event: HotplugEvent, identity: DeviceIdentity) {
        let mut state = lock(&self.state);
        if self.is_shutting_down() {
            return;
        }

        match event {
            HotplugEvent::Arrived => {
                info!("Device arrived: {}", identity);
                if !state.last_system.iter().any(|d| d.same_device(&identity)) {
                    state.last_system.push(identity.clone());
                }
                self.events.emit(MonitorEvent::Arrived(vec![identity]));
            }
            HotplugEvent::Left => {
                info!("Device removed: {}", identity);
                state.last_system.retain(|d| !d.same_device(&identity));
                self.events.emit(MonitorEvent::Removed(vec![identity]));
            }
        }
    }
}

/// Devices in `current` but not `previous`, and in `previous` but not `current`
///
/// Devices are compared by vendor id, product id, bus and port.
pub fn diff(
    previous: &[DeviceIdentity],
    current: &[DeviceIdentity],
) -> (Vec<DeviceIdentity>, Vec<DeviceIdentity>) {
    let absent_from =
        |list: &[DeviceIdentity], device: &DeviceIdentity| !list.iter().any(|d| d.same_device(device));

    let inserted = current
        .iter()
        .filter(|d| absent_from(previous, d))
        .cloned()
        .collect();
    let removed = previous
        .iter()
        .filter(|d| absent_from(current, d))
        .cloned()
        .collect();
    (inserted, removed)
}

/// True if `incoming` names the same watch entry as `existing`
///
/// Ids, class and platform id must be equal. Location is compared only when
/// `incoming` pins a bus or a port, so a location-free filter is the same
/// entry as any filter on the same ids.
fn watches_same(existing: &DeviceFilter, incoming: &DeviceFilter) -> bool {
    let same_ids = existing.vendor_id == incoming.vendor_id
        && existing.product_id == incoming.product_id
        && existing.class == incoming.class
        && existing.subclass == incoming.subclass
        && existing.platform_id == incoming.platform_id;
    if !same_ids {
        return false;
    }
    if incoming.bus.is_none() && incoming.port.is_none() {
        return true;
    }
    existing.bus == incoming.bus && existing.port == incoming.port
}
