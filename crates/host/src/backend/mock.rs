//! In-memory backend for tests
//!
//! Devices, descriptor failures and hotplug events are scripted by the test.
//! Submitted transfers stay pending until the test completes them with
//! [`MockBackend::complete_read`], [`MockBackend::complete_write`] or
//! [`MockBackend::complete_next`]; cancelled transfers complete with
//! [`TransferStatus::Cancelled`] on the next [`Backend::handle_events`] call,
//! the way libusb reports cancellations from its event loop.

use super::{
    Backend, CompletionHandler, DeviceList, HotplugCallback, HotplugEvent, HotplugToken,
    RawConfig, RawEndpoint, RawHandle, RawInterface, TransferCompletion, TransferId,
    TransferRequest,
};
use crate::lock;
use common::LogLevel;
use model::{
    CONTROL_SETUP_SIZE, DeviceFilter, DeviceIdentity, TransferKind, TransferStatus, UsbError,
};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// A scripted device
#[derive(Debug, Clone)]
pub struct MockDevice {
    pub identity: DeviceIdentity,
    pub configs: Vec<RawConfig>,
    pub description: Option<String>,
    /// Error returned when the device descriptor is read
    pub descriptor_error: Option<UsbError>,
    /// Error returned when the device is opened
    pub open_error: Option<UsbError>,
}

impl MockDevice {
    pub fn new(identity: DeviceIdentity) -> Self {
        Self {
            identity,
            configs: Vec::new(),
            description: None,
            descriptor_error: None,
            open_error: None,
        }
    }

    /// Device with one configuration holding a bulk IN 0x81 / OUT 0x01 pair
    /// and an interrupt IN 0x82 endpoint on interface 0
    pub fn with_bulk_pair(mut self) -> Self {
        self.configs = vec![RawConfig {
            number: 1,
            interfaces: vec![RawInterface {
                number: 0,
                alternate: 0,
                endpoints: vec![
                    RawEndpoint {
                        address: 0x81,
                        attributes: 0x02,
                        max_packet_size: 512,
                    },
                    RawEndpoint {
                        address: 0x01,
                        attributes: 0x02,
                        max_packet_size: 512,
                    },
                    RawEndpoint {
                        address: 0x82,
                        attributes: 0x03,
                        max_packet_size: 64,
                    },
                ],
            }],
        }];
        self.identity.config_count = 1;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_descriptor_error(mut self, error: UsbError) -> Self {
        self.descriptor_error = Some(error);
        self
    }

    pub fn with_open_error(mut self, error: UsbError) -> Self {
        self.open_error = Some(error);
        self
    }
}

/// Record of one submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmittedTransfer {
    pub id: TransferId,
    pub endpoint: u8,
    pub kind: TransferKind,
    /// Buffer contents at submission
    pub data: Vec<u8>,
}

struct PendingTransfer {
    id: TransferId,
    endpoint: u8,
    kind: TransferKind,
    buffer: Vec<u8>,
    handler: CompletionHandler,
}

struct MockState {
    devices: Vec<MockDevice>,
    outstanding_lists: usize,
    lists_handed_out: usize,
    hotplug: Vec<(HotplugToken, DeviceFilter, HotplugCallback)>,
    next_token: HotplugToken,
    next_transfer: TransferId,
    pending: VecDeque<PendingTransfer>,
    cancelled: VecDeque<(CompletionHandler, TransferCompletion)>,
    submitted: Vec<SubmittedTransfer>,
    cancel_requests: Vec<TransferId>,
    submit_errors: VecDeque<UsbError>,
    cleared_halts: Vec<u8>,
    claimed: Vec<u8>,
    released: Vec<u8>,
    configurations_set: Vec<u8>,
    alternates_set: Vec<(u8, u8)>,
    detached: Vec<u8>,
    attached: Vec<u8>,
    active_config: u8,
    kernel_driver_active: bool,
    log_level: Option<LogLevel>,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            devices: Vec::new(),
            outstanding_lists: 0,
            lists_handed_out: 0,
            hotplug: Vec::new(),
            next_token: 1,
            next_transfer: 1,
            pending: VecDeque::new(),
            cancelled: VecDeque::new(),
            submitted: Vec::new(),
            cancel_requests: Vec::new(),
            submit_errors: VecDeque::new(),
            cleared_halts: Vec::new(),
            claimed: Vec::new(),
            released: Vec::new(),
            configurations_set: Vec::new(),
            alternates_set: Vec::new(),
            detached: Vec::new(),
            attached: Vec::new(),
            active_config: 1,
            kernel_driver_active: false,
            log_level: None,
        }
    }
}

/// Scriptable in-memory backend
#[derive(Clone, Default)]
pub struct MockBackend {
    state: Arc<Mutex<MockState>>,
    hotplug: bool,
}

impl MockBackend {
    /// Backend without hotplug support
    pub fn new() -> Self {
        Self::default()
    }

    /// Backend reporting hotplug support
    pub fn with_hotplug() -> Self {
        Self {
            hotplug: true,
            ..Self::default()
        }
    }

    /// Attach a device without raising a hotplug event
    pub fn add_device(&self, device: MockDevice) {
        lock(&self.state).devices.push(device);
    }

    /// Replace the attached devices without raising hotplug events
    pub fn set_devices(&self, devices: Vec<MockDevice>) {
        lock(&self.state).devices = devices;
    }

    /// Attach a device and notify matching hotplug registrations
    pub fn plug(&self, device: MockDevice) {
        let identity = device.identity.clone();
        lock(&self.state).devices.push(device);
        self.fire(HotplugEvent::Arrived, identity);
    }

    /// Detach a device and notify matching hotplug registrations
    pub fn unplug(&self, identity: &DeviceIdentity) {
        let removed = {
            let mut state = lock(&self.state);
            let before = state.devices.len();
            state.devices.retain(|d| !d.identity.same_device(identity));
            before != state.devices.len()
        };
        if removed {
            self.fire(HotplugEvent::Left, identity.clone());
        }
    }

    fn fire(&self, event: HotplugEvent, identity: DeviceIdentity) {
        let callbacks: Vec<HotplugCallback> = lock(&self.state)
            .hotplug
            .iter()
            .filter(|(_, filter, _)| filter.matches(&identity))
            .map(|(_, _, callback)| Arc::clone(callback))
            .collect();

        for callback in callbacks {
            callback(event, identity.clone());
        }
    }

    /// Device lists handed out and not yet dropped
    pub fn outstanding_lists(&self) -> usize {
        lock(&self.state).outstanding_lists
    }

    /// Device lists handed out so far
    pub fn lists_handed_out(&self) -> usize {
        lock(&self.state).lists_handed_out
    }

    pub fn hotplug_registrations(&self) -> usize {
        lock(&self.state).hotplug.len()
    }

    /// Number of transfers submitted and not yet completed
    pub fn pending_transfers(&self) -> usize {
        lock(&self.state).pending.len()
    }

    /// Endpoints of the pending transfers, oldest first
    pub fn pending_endpoints(&self) -> Vec<u8> {
        lock(&self.state).pending.iter().map(|p| p.endpoint).collect()
    }

    /// Every submission so far, oldest first
    pub fn submitted(&self) -> Vec<SubmittedTransfer> {
        lock(&self.state).submitted.clone()
    }

    pub fn cancel_requests(&self) -> Vec<TransferId> {
        lock(&self.state).cancel_requests.clone()
    }

    /// Make the next submission fail with `error`
    pub fn fail_next_submit(&self, error: UsbError) {
        lock(&self.state).submit_errors.push_back(error);
    }

    /// Complete the oldest pending transfer on `endpoint` with received `data`
    ///
    /// Data beyond the transfer length is cut off. Returns false if nothing
    /// was pending on the endpoint.
    pub fn complete_read(&self, endpoint: u8, status: TransferStatus, data: &[u8]) -> bool {
        let Some(mut pending) = self.take_pending(endpoint) else {
            return false;
        };

        let offset = if pending.kind == TransferKind::Control {
            CONTROL_SETUP_SIZE
        } else {
            0
        };
        let room = pending.buffer.len().saturating_sub(offset);
        let n = data.len().min(room);
        pending.buffer[offset..offset + n].copy_from_slice(&data[..n]);

        Self::finish(pending, status, n);
        true
    }

    /// Complete the oldest pending transfer on `endpoint`, reporting
    /// `actual` bytes sent
    ///
    /// Returns the bytes that count as sent, or `None` if nothing was
    /// pending on the endpoint.
    pub fn complete_write(
        &self,
        endpoint: u8,
        status: TransferStatus,
        actual: usize,
    ) -> Option<Vec<u8>> {
        let pending = self.take_pending(endpoint)?;

        let offset = if pending.kind == TransferKind::Control {
            CONTROL_SETUP_SIZE
        } else {
            0
        };
        let n = actual.min(pending.buffer.len().saturating_sub(offset));
        let sent = pending.buffer[offset..offset + n].to_vec();

        Self::finish(pending, status, n);
        Some(sent)
    }

    /// Complete the oldest pending transfer with no data
    pub fn complete_next(&self, status: TransferStatus) -> bool {
        let pending = lock(&self.state).pending.pop_front();
        match pending {
            Some(pending) => {
                Self::finish(pending, status, 0);
                true
            }
            None => false,
        }
    }

    /// Run completion handlers of cancelled transfers now
    pub fn deliver_cancellations(&self) -> usize {
        let cancelled: Vec<_> = lock(&self.state).cancelled.drain(..).collect();
        let count = cancelled.len();
        for (handler, completion) in cancelled {
            handler(completion);
        }
        count
    }

    fn take_pending(&self, endpoint: u8) -> Option<PendingTransfer> {
        let mut state = lock(&self.state);
        let index = state.pending.iter().position(|p| p.endpoint == endpoint)?;
        state.pending.remove(index)
    }

    fn finish(pending: PendingTransfer, status: TransferStatus, actual_length: usize) {
        let PendingTransfer {
            buffer, handler, ..
        } = pending;
        handler(TransferCompletion {
            status,
            actual_length,
            buffer,
        });
    }

    pub fn cleared_halts(&self) -> Vec<u8> {
        lock(&self.state).cleared_halts.clone()
    }

    pub fn claimed_interfaces(&self) -> Vec<u8> {
        lock(&self.state).claimed.clone()
    }

    pub fn released_interfaces(&self) -> Vec<u8> {
        lock(&self.state).released.clone()
    }

    pub fn configurations_set(&self) -> Vec<u8> {
        lock(&self.state).configurations_set.clone()
    }

    pub fn alternate_settings(&self) -> Vec<(u8, u8)> {
        lock(&self.state).alternates_set.clone()
    }

    pub fn detached_drivers(&self) -> Vec<u8> {
        lock(&self.state).detached.clone()
    }

    pub fn attached_drivers(&self) -> Vec<u8> {
        lock(&self.state).attached.clone()
    }

    /// Configuration value reported as active by opened handles
    pub fn set_active_configuration(&self, config: u8) {
        lock(&self.state).active_config = config;
    }

    /// Report a kernel driver bound to every interface
    pub fn set_kernel_driver_active(&self, active: bool) {
        lock(&self.state).kernel_driver_active = active;
    }

    pub fn log_level(&self) -> Option<LogLevel> {
        lock(&self.state).log_level
    }
}

impl Backend for MockBackend {
    fn device_list(&self) -> Result<Box<dyn DeviceList>, UsbError> {
        let mut state = lock(&self.state);
        state.outstanding_lists += 1;
        state.lists_handed_out += 1;
        Ok(Box::new(MockDeviceList {
            devices: state.devices.clone(),
            state: Arc::clone(&self.state),
        }))
    }

    fn has_hotplug(&self) -> bool {
        self.hotplug
    }

    fn register_hotplug(
        &self,
        filter: &DeviceFilter,
        callback: HotplugCallback,
    ) -> Result<HotplugToken, UsbError> {
        if !self.hotplug {
            return Err(UsbError::NotSupported);
        }

        // Bus and port are left to the callback
        let filter = DeviceFilter {
            bus: None,
            port: None,
            ..filter.clone()
        };

        let mut state = lock(&self.state);
        let token = state.next_token;
        state.next_token += 1;
        state.hotplug.push((token, filter, callback));
        Ok(token)
    }

    fn deregister_hotplug(&self, token: HotplugToken) {
        lock(&self.state).hotplug.retain(|(t, _, _)| *t != token);
    }

    fn handle_events(&self, timeout: Duration) -> Result<(), UsbError> {
        if self.deliver_cancellations() == 0 {
            std::thread::sleep(timeout.min(Duration::from_millis(1)));
        }
        Ok(())
    }

    fn set_log_level(&self, level: LogLevel) {
        lock(&self.state).log_level = Some(level);
    }
}

struct MockDeviceList {
    devices: Vec<MockDevice>,
    state: Arc<Mutex<MockState>>,
}

impl MockDeviceList {
    fn device(&self, index: usize) -> Result<&MockDevice, UsbError> {
        self.devices.get(index).ok_or(UsbError::NotFound)
    }
}

impl Drop for MockDeviceList {
    fn drop(&mut self) {
        lock(&self.state).outstanding_lists -= 1;
    }
}

impl DeviceList for MockDeviceList {
    fn len(&self) -> usize {
        self.devices.len()
    }

    fn descriptor(&self, index: usize) -> Result<DeviceIdentity, UsbError> {
        let device = self.device(index)?;
        if let Some(error) = device.descriptor_error {
            return Err(error);
        }

        let mut identity = device.identity.clone();
        identity.configurations.clear();
        identity.endpoints.clear();
        identity.description = None;
        Ok(identity)
    }

    fn config_descriptor(&self, index: usize, config_index: u8) -> Result<RawConfig, UsbError> {
        self.device(index)?
            .configs
            .get(config_index as usize)
            .cloned()
            .ok_or(UsbError::NotFound)
    }

    fn description(&self, index: usize) -> Option<String> {
        self.device(index).ok()?.description.clone()
    }

    fn open(&self, index: usize) -> Result<Arc<dyn RawHandle>, UsbError> {
        let device = self.device(index)?;
        if let Some(error) = device.open_error {
            return Err(error);
        }

        Ok(Arc::new(MockHandle {
            identity: device.identity.clone(),
            state: Arc::clone(&self.state),
        }))
    }
}

struct MockHandle {
    identity: DeviceIdentity,
    state: Arc<Mutex<MockState>>,
}

impl MockHandle {
    fn attached(&self, state: &MockState) -> Result<(), UsbError> {
        if state
            .devices
            .iter()
            .any(|d| d.identity.same_device(&self.identity))
        {
            Ok(())
        } else {
            Err(UsbError::NoDevice)
        }
    }
}

impl RawHandle for MockHandle {
    fn active_configuration(&self) -> Result<u8, UsbError> {
        let state = lock(&self.state);
        self.attached(&state)?;
        Ok(state.active_config)
    }

    fn set_configuration(&self, config: u8) -> Result<(), UsbError> {
        let mut state = lock(&self.state);
        self.attached(&state)?;
        state.configurations_set.push(config);
        state.active_config = config;
        Ok(())
    }

    fn claim_interface(&self, interface: u8) -> Result<(), UsbError> {
        let mut state = lock(&self.state);
        self.attached(&state)?;
        if state.claimed.contains(&interface) {
            return Err(UsbError::Busy);
        }
        state.claimed.push(interface);
        Ok(())
    }

    fn release_interface(&self, interface: u8) -> Result<(), UsbError> {
        let mut state = lock(&self.state);
        let index = state
            .claimed
            .iter()
            .position(|i| *i == interface)
            .ok_or(UsbError::NotFound)?;
        state.claimed.remove(index);
        state.released.push(interface);
        Ok(())
    }

    fn set_alternate_setting(&self, interface: u8, alternate: u8) -> Result<(), UsbError> {
        let mut state = lock(&self.state);
        self.attached(&state)?;
        state.alternates_set.push((interface, alternate));
        Ok(())
    }

    fn detach_kernel_driver(&self, interface: u8) -> Result<bool, UsbError> {
        let mut state = lock(&self.state);
        if !state.kernel_driver_active {
            return Ok(false);
        }
        state.detached.push(interface);
        Ok(true)
    }

    fn attach_kernel_driver(&self, interface: u8) -> Result<(), UsbError> {
        lock(&self.state).attached.push(interface);
        Ok(())
    }

    fn clear_halt(&self, endpoint: u8) -> Result<(), UsbError> {
        let mut state = lock(&self.state);
        self.attached(&state)?;
        state.cleared_halts.push(endpoint);
        Ok(())
    }

    fn submit_transfer(
        &self,
        request: TransferRequest,
        on_complete: CompletionHandler,
    ) -> Result<TransferId, UsbError> {
        let mut state = lock(&self.state);
        if let Some(error) = state.submit_errors.pop_front() {
            return Err(error);
        }
        self.attached(&state)?;
        if request.kind == TransferKind::Stream {
            return Err(UsbError::NotSupported);
        }
        if request.kind == TransferKind::Control && request.buffer.len() < CONTROL_SETUP_SIZE {
            return Err(UsbError::InvalidParam);
        }

        let id = state.next_transfer;
        state.next_transfer += 1;
        state.submitted.push(SubmittedTransfer {
            id,
            endpoint: request.endpoint,
            kind: request.kind,
            data: request.buffer.clone(),
        });
        state.pending.push_back(PendingTransfer {
            id,
            endpoint: request.endpoint,
            kind: request.kind,
            buffer: request.buffer,
            handler: on_complete,
        });
        Ok(id)
    }

    fn cancel_transfer(&self, id: TransferId) -> Result<(), UsbError> {
        let mut state = lock(&self.state);
        state.cancel_requests.push(id);

        let index = state
            .pending
            .iter()
            .position(|p| p.id == id)
            .ok_or(UsbError::NotFound)?;
        if let Some(pending) = state.pending.remove(index) {
            state.cancelled.push_back((
                pending.handler,
                TransferCompletion {
                    status: TransferStatus::Cancelled,
                    actual_length: 0,
                    buffer: pending.buffer,
                },
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn identity(port: u8) -> DeviceIdentity {
        DeviceIdentity::new(0x1234, 0x5678, 1, port)
    }

    #[test]
    fn test_device_list_tracks_outstanding() {
        let backend = MockBackend::new();
        backend.add_device(MockDevice::new(identity(1)));

        let list = backend.device_list().unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(backend.outstanding_lists(), 1);
        drop(list);
        assert_eq!(backend.outstanding_lists(), 0);
    }

    #[test]
    fn test_handler_not_called_on_submit() {
        let backend = MockBackend::new();
        backend.add_device(MockDevice::new(identity(1)));
        let handle = backend.device_list().unwrap().open(0).unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        handle
            .submit_transfer(
                TransferRequest {
                    endpoint: 0x81,
                    kind: TransferKind::Bulk,
                    buffer: vec![0; 4],
                    timeout: Duration::from_millis(100),
                },
                Box::new(move |completion| {
                    assert_eq!(&completion.buffer[..completion.actual_length], &[9, 9]);
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(backend.complete_read(0x81, TransferStatus::Completed, &[9, 9]));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!backend.complete_next(TransferStatus::Completed));
    }

    #[test]
    fn test_cancel_completes_on_handle_events() {
        let backend = MockBackend::new();
        backend.add_device(MockDevice::new(identity(1)));
        let handle = backend.device_list().unwrap().open(0).unwrap();

        let status = Arc::new(Mutex::new(None));
        let seen = Arc::clone(&status);
        let id = handle
            .submit_transfer(
                TransferRequest {
                    endpoint: 0x81,
                    kind: TransferKind::Interrupt,
                    buffer: vec![0; 8],
                    timeout: Duration::from_millis(100),
                },
                Box::new(move |completion| {
                    *seen.lock().unwrap() = Some(completion.status);
                }),
            )
            .unwrap();

        handle.cancel_transfer(id).unwrap();
        assert_eq!(*status.lock().unwrap(), None);
        assert_eq!(handle.cancel_transfer(id), Err(UsbError::NotFound));

        backend.handle_events(Duration::from_millis(1)).unwrap();
        assert_eq!(*status.lock().unwrap(), Some(TransferStatus::Cancelled));
    }

    #[test]
    fn test_hotplug_fires_for_matching_filter() {
        let backend = MockBackend::with_hotplug();
        let events = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&events);
        let token = backend
            .register_hotplug(
                &DeviceFilter::new(0x1234, 0x5678).at(9, 9),
                Arc::new(move |event, identity| seen.lock().unwrap().push((event, identity))),
            )
            .unwrap();

        backend.plug(MockDevice::new(identity(3)));
        backend.plug(MockDevice::new(DeviceIdentity::new(0xaaaa, 0xbbbb, 1, 4)));
        backend.unplug(&identity(3));

        {
            let events = events.lock().unwrap();
            assert_eq!(events.len(), 2);
            assert_eq!(events[0].0, HotplugEvent::Arrived);
            assert_eq!(events[1].0, HotplugEvent::Left);
        }

        backend.deregister_hotplug(token);
        backend.plug(MockDevice::new(identity(5)));
        assert_eq!(events.lock().unwrap().len(), 2);
    }
}
