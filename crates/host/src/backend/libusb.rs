//! libusb backend
//!
//! Enumeration, hotplug and handle management go through `rusb`. Transfers
//! use libusb's asynchronous API directly: each submission allocates a
//! `libusb_transfer` whose user data is the boxed [`PendingTransfer`], and the
//! libusb callback hands the buffer back through the completion dispatcher
//! thread so that completion handlers never run on the event thread.

use super::{
    Backend, CompletionHandler, DeviceList, HotplugCallback, HotplugEvent, HotplugToken,
    RawConfig, RawEndpoint, RawHandle, RawInterface, TransferCompletion, TransferId,
    TransferRequest,
};
use crate::lock;
use common::LogLevel;
use model::{
    CONTROL_SETUP_SIZE, DeviceFilter, DeviceIdentity, DeviceSpeed, TransferKind, TransferStatus,
    UsbError,
};
use rusb::constants::*;
use rusb::ffi;
use rusb::{Context, Device, DeviceHandle, Hotplug, HotplugBuilder, Registration, UsbContext};
use std::collections::HashMap;
use std::ffi::{c_int, c_uint, c_void};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Map a rusb error onto the USB error taxonomy
pub fn map_rusb_error(err: rusb::Error) -> UsbError {
    match err {
        rusb::Error::Io => UsbError::Io,
        rusb::Error::InvalidParam => UsbError::InvalidParam,
        rusb::Error::Access => UsbError::Access,
        rusb::Error::NoDevice => UsbError::NoDevice,
        rusb::Error::NotFound => UsbError::NotFound,
        rusb::Error::Busy => UsbError::Busy,
        rusb::Error::Timeout => UsbError::Timeout,
        rusb::Error::Overflow => UsbError::Overflow,
        rusb::Error::Pipe => UsbError::Pipe,
        rusb::Error::Interrupted => UsbError::Interrupted,
        rusb::Error::NoMem => UsbError::NoMemory,
        rusb::Error::NotSupported => UsbError::NotSupported,
        _ => UsbError::Other,
    }
}

/// Map a raw libusb return code
fn map_libusb_error(code: c_int) -> UsbError {
    UsbError::from_code(code).unwrap_or(UsbError::Other)
}

fn map_transfer_status(status: c_int) -> TransferStatus {
    match status {
        LIBUSB_TRANSFER_COMPLETED => TransferStatus::Completed,
        LIBUSB_TRANSFER_TIMED_OUT => TransferStatus::Timeout,
        LIBUSB_TRANSFER_CANCELLED => TransferStatus::Cancelled,
        LIBUSB_TRANSFER_STALL => TransferStatus::Stall,
        LIBUSB_TRANSFER_NO_DEVICE => TransferStatus::NoDevice,
        LIBUSB_TRANSFER_OVERFLOW => TransferStatus::Overflow,
        _ => TransferStatus::Error,
    }
}

fn map_device_speed(speed: rusb::Speed) -> DeviceSpeed {
    match speed {
        rusb::Speed::Low => DeviceSpeed::Low,
        rusb::Speed::Full => DeviceSpeed::Full,
        rusb::Speed::High => DeviceSpeed::High,
        rusb::Speed::Super => DeviceSpeed::Super,
        rusb::Speed::SuperPlus => DeviceSpeed::SuperPlus,
        _ => DeviceSpeed::Unknown,
    }
}

fn map_log_level(level: LogLevel) -> rusb::LogLevel {
    match level.backend_level() {
        LogLevel::None => rusb::LogLevel::None,
        LogLevel::Error => rusb::LogLevel::Error,
        LogLevel::Warning => rusb::LogLevel::Warning,
        LogLevel::Info => rusb::LogLevel::Info,
        LogLevel::Debug | LogLevel::DebugAll => rusb::LogLevel::Debug,
    }
}

/// Rebuild `bmAttributes` from the decoded endpoint fields
fn endpoint_attributes(endpoint: &rusb::EndpointDescriptor<'_>) -> u8 {
    let transfer = match endpoint.transfer_type() {
        rusb::TransferType::Control => 0,
        rusb::TransferType::Isochronous => 1,
        rusb::TransferType::Bulk => 2,
        rusb::TransferType::Interrupt => 3,
    };
    let sync = match endpoint.sync_type() {
        rusb::SyncType::NoSync => 0,
        rusb::SyncType::Asynchronous => 1,
        rusb::SyncType::Adaptive => 2,
        rusb::SyncType::Synchronous => 3,
    };
    let usage = match endpoint.usage_type() {
        rusb::UsageType::Data => 0,
        rusb::UsageType::Feedback => 1,
        rusb::UsageType::FeedbackData => 2,
        rusb::UsageType::Reserved => 3,
    };
    transfer | (sync << 2) | (usage << 4)
}

fn identity_of<T: UsbContext>(device: &Device<T>) -> Result<DeviceIdentity, UsbError> {
    let descriptor = device.device_descriptor().map_err(map_rusb_error)?;

    let mut identity = DeviceIdentity::new(
        descriptor.vendor_id(),
        descriptor.product_id(),
        device.bus_number(),
        device.port_number(),
    );
    identity.class = descriptor.class_code();
    identity.subclass = descriptor.sub_class_code();
    identity.speed = map_device_speed(device.speed());
    identity.config_count = descriptor.num_configurations();
    Ok(identity)
}

type Completion = (CompletionHandler, TransferCompletion);

/// A submitted `libusb_transfer`
struct RawTransfer(NonNull<ffi::libusb_transfer>);

// SAFETY: the pointer is only dereferenced by libusb; cancel and free are
// serialized by the registry lock.
unsafe impl Send for RawTransfer {}

/// Transfers currently owned by libusb
struct TransferRegistry {
    next_id: AtomicU64,
    active: Mutex<HashMap<TransferId, RawTransfer>>,
    completions: async_channel::Sender<Completion>,
}

/// User data of a submitted transfer
struct PendingTransfer {
    id: TransferId,
    kind: TransferKind,
    buffer: Vec<u8>,
    handler: CompletionHandler,
    registry: Arc<TransferRegistry>,
}

extern "system" fn transfer_finished(transfer: *mut ffi::libusb_transfer) {
    if transfer.is_null() {
        return;
    }

    // SAFETY: libusb passes back the transfer filled in `submit_transfer`.
    let (status, actual_length, user_data) =
        unsafe { ((*transfer).status, (*transfer).actual_length, (*transfer).user_data) };
    if user_data.is_null() {
        return;
    }

    // SAFETY: user_data is the leaked `PendingTransfer` of this transfer and
    // libusb calls back exactly once.
    let pending = unsafe { Box::from_raw(user_data.cast::<PendingTransfer>()) };

    let actual_length = if pending.kind == TransferKind::Isochronous {
        // SAFETY: isochronous transfers are allocated with one packet descriptor.
        unsafe { (*(*transfer).iso_packet_desc.as_ptr()).actual_length as usize }
    } else {
        actual_length.max(0) as usize
    };

    {
        let mut active = lock(&pending.registry.active);
        active.remove(&pending.id);
        // SAFETY: removed from the registry under its lock, so no cancel can
        // reach this transfer any more.
        unsafe { ffi::libusb_free_transfer(transfer) };
    }

    let PendingTransfer {
        id,
        buffer,
        handler,
        registry,
        ..
    } = *pending;

    let completion = TransferCompletion {
        status: map_transfer_status(status),
        actual_length,
        buffer,
    };
    trace!(
        "Transfer {} finished: {} ({} bytes)",
        id, completion.status, completion.actual_length
    );

    if registry.completions.try_send((handler, completion)).is_err() {
        warn!("Completion dispatcher stopped, dropping completion of transfer {}", id);
    }
}

/// Device handle pointer used when filling transfers
struct RawDeviceHandle(NonNull<ffi::libusb_device_handle>);

// SAFETY: libusb device handles may be used from any thread.
unsafe impl Send for RawDeviceHandle {}
unsafe impl Sync for RawDeviceHandle {}

/// An opened libusb device
pub struct LibusbHandle {
    handle: Mutex<DeviceHandle<Context>>,
    raw: RawDeviceHandle,
    registry: Arc<TransferRegistry>,
}

impl LibusbHandle {
    fn new(handle: DeviceHandle<Context>, registry: Arc<TransferRegistry>) -> Result<Self, UsbError> {
        let raw = NonNull::new(handle.as_raw()).ok_or(UsbError::InvalidParam)?;
        Ok(Self {
            handle: Mutex::new(handle),
            raw: RawDeviceHandle(raw),
            registry,
        })
    }
}

impl RawHandle for LibusbHandle {
    fn active_configuration(&self) -> Result<u8, UsbError> {
        lock(&self.handle)
            .active_configuration()
            .map_err(map_rusb_error)
    }

    fn set_configuration(&self, config: u8) -> Result<(), UsbError> {
        lock(&self.handle)
            .set_active_configuration(config)
            .map_err(map_rusb_error)
    }

    fn claim_interface(&self, interface: u8) -> Result<(), UsbError> {
        lock(&self.handle)
            .claim_interface(interface)
            .map_err(map_rusb_error)
    }

    fn release_interface(&self, interface: u8) -> Result<(), UsbError> {
        lock(&self.handle)
            .release_interface(interface)
            .map_err(map_rusb_error)
    }

    fn set_alternate_setting(&self, interface: u8, alternate: u8) -> Result<(), UsbError> {
        lock(&self.handle)
            .set_alternate_setting(interface, alternate)
            .map_err(map_rusb_error)
    }

    fn detach_kernel_driver(&self, interface: u8) -> Result<bool, UsbError> {
        let handle = lock(&self.handle);
        match handle.kernel_driver_active(interface) {
            Ok(true) => {
                handle
                    .detach_kernel_driver(interface)
                    .map_err(map_rusb_error)?;
                Ok(true)
            }
            Ok(false) => Ok(false),
            Err(e) => Err(map_rusb_error(e)),
        }
    }

    fn attach_kernel_driver(&self, interface: u8) -> Result<(), UsbError> {
        lock(&self.handle)
            .attach_kernel_driver(interface)
            .map_err(map_rusb_error)
    }

    fn clear_halt(&self, endpoint: u8) -> Result<(), UsbError> {
        lock(&self.handle)
            .clear_halt(endpoint)
            .map_err(map_rusb_error)
    }

    fn submit_transfer(
        &self,
        request: TransferRequest,
        on_complete: CompletionHandler,
    ) -> Result<TransferId, UsbError> {
        let TransferRequest {
            endpoint,
            kind,
            buffer,
            timeout,
        } = request;

        if kind == TransferKind::Stream {
            return Err(UsbError::NotSupported);
        }
        if kind == TransferKind::Control && buffer.len() < CONTROL_SETUP_SIZE {
            return Err(UsbError::InvalidParam);
        }
        let length = c_int::try_from(buffer.len()).map_err(|_| UsbError::InvalidParam)?;
        let iso_packets: c_int = if kind == TransferKind::Isochronous { 1 } else { 0 };
        let endpoint = if kind == TransferKind::Control { 0 } else { endpoint };
        let timeout = c_uint::try_from(timeout.as_millis()).unwrap_or(c_uint::MAX);

        // SAFETY: plain allocation, checked for null below.
        let transfer = NonNull::new(unsafe { ffi::libusb_alloc_transfer(iso_packets) })
            .ok_or(UsbError::NoMemory)?;

        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        let pending = Box::into_raw(Box::new(PendingTransfer {
            id,
            kind,
            buffer,
            handler: on_complete,
            registry: Arc::clone(&self.registry),
        }));

        // SAFETY: `transfer` was just allocated and is not yet shared. The
        // buffer lives in `pending` until the callback reclaims it.
        unsafe {
            let t = transfer.as_ptr();
            (*t).dev_handle = self.raw.0.as_ptr();
            (*t).endpoint = endpoint;
            (*t).transfer_type = kind as u8;
            (*t).timeout = timeout;
            (*t).length = length;
            (*t).buffer = (*pending).buffer.as_mut_ptr();
            (*t).callback = transfer_finished;
            (*t).user_data = pending.cast::<c_void>();
            (*t).num_iso_packets = iso_packets;
            if kind == TransferKind::Isochronous {
                ffi::libusb_set_iso_packet_lengths(t, length as c_uint);
            }
        }

        let mut active = lock(&self.registry.active);
        // SAFETY: fully initialised transfer on an open handle.
        let rc = unsafe { ffi::libusb_submit_transfer(transfer.as_ptr()) };
        if rc < 0 {
            drop(active);
            // SAFETY: submission failed, so libusb will not call back and
            // both allocations are still ours.
            unsafe {
                drop(Box::from_raw(pending));
                ffi::libusb_free_transfer(transfer.as_ptr());
            }
            let error = map_libusb_error(rc);
            debug!("Failed to submit {} transfer on {:#04x}: {}", kind, endpoint, error);
            return Err(error);
        }
        active.insert(id, RawTransfer(transfer));

        trace!("Submitted {} transfer {} on {:#04x}", kind, id, endpoint);
        Ok(id)
    }

    fn cancel_transfer(&self, id: TransferId) -> Result<(), UsbError> {
        let active = lock(&self.registry.active);
        let transfer = active.get(&id).ok_or(UsbError::NotFound)?;

        // SAFETY: transfers in the registry have not been freed yet.
        let rc = unsafe { ffi::libusb_cancel_transfer(transfer.0.as_ptr()) };
        if rc < 0 {
            return Err(map_libusb_error(rc));
        }
        Ok(())
    }
}

/// Devices of one libusb enumeration
struct LibusbDeviceList {
    devices: Vec<Device<Context>>,
    registry: Arc<TransferRegistry>,
}

impl LibusbDeviceList {
    fn device(&self, index: usize) -> Result<&Device<Context>, UsbError> {
        self.devices.get(index).ok_or(UsbError::NotFound)
    }
}

impl DeviceList for LibusbDeviceList {
    fn len(&self) -> usize {
        self.devices.len()
    }

    fn descriptor(&self, index: usize) -> Result<DeviceIdentity, UsbError> {
        identity_of(self.device(index)?)
    }

    fn config_descriptor(&self, index: usize, config_index: u8) -> Result<RawConfig, UsbError> {
        let config = self
            .device(index)?
            .config_descriptor(config_index)
            .map_err(map_rusb_error)?;

        let mut interfaces = Vec::new();
        for interface in config.interfaces() {
            for setting in interface.descriptors() {
                interfaces.push(RawInterface {
                    number: setting.interface_number(),
                    alternate: setting.setting_number(),
                    endpoints: setting
                        .endpoint_descriptors()
                        .map(|endpoint| RawEndpoint {
                            address: endpoint.address(),
                            attributes: endpoint_attributes(&endpoint),
                            max_packet_size: endpoint.max_packet_size(),
                        })
                        .collect(),
                });
            }
        }

        Ok(RawConfig {
            number: config.number(),
            interfaces,
        })
    }

    fn description(&self, index: usize) -> Option<String> {
        let device = self.device(index).ok()?;
        let descriptor = device.device_descriptor().ok()?;
        let handle = device.open().ok()?;
        handle.read_product_string_ascii(&descriptor).ok()
    }

    fn open(&self, index: usize) -> Result<Arc<dyn RawHandle>, UsbError> {
        let handle = self.device(index)?.open().map_err(map_rusb_error)?;
        Ok(Arc::new(LibusbHandle::new(
            handle,
            Arc::clone(&self.registry),
        )?))
    }
}

/// Forwards rusb hotplug notifications to a [`HotplugCallback`]
struct HotplugForwarder {
    callback: HotplugCallback,
}

impl HotplugForwarder {
    fn forward(&self, event: HotplugEvent, device: &Device<Context>) {
        match identity_of(device) {
            Ok(identity) => (self.callback)(event, identity),
            Err(e) => warn!(
                "Hot-plug {:?} for unreadable device (bus={}, port={}): {}",
                event,
                device.bus_number(),
                device.port_number(),
                e
            ),
        }
    }
}

impl Hotplug<Context> for HotplugForwarder {
    fn device_arrived(&mut self, device: Device<Context>) {
        debug!(
            "Hot-plug callback: device arrived (bus={}, port={})",
            device.bus_number(),
            device.port_number()
        );
        self.forward(HotplugEvent::Arrived, &device);
    }

    fn device_left(&mut self, device: Device<Context>) {
        debug!(
            "Hot-plug callback: device left (bus={}, port={})",
            device.bus_number(),
            device.port_number()
        );
        self.forward(HotplugEvent::Left, &device);
    }
}

/// Backend on a private libusb context
pub struct LibusbBackend {
    context: Context,
    registry: Arc<TransferRegistry>,
    registrations: Mutex<HashMap<HotplugToken, Registration<Context>>>,
    next_token: AtomicU64,
}

impl LibusbBackend {
    /// Create a libusb context and start the completion dispatcher thread
    pub fn new() -> Result<Self, UsbError> {
        let mut context = Context::new().map_err(map_rusb_error)?;
        context.set_log_level(rusb::LogLevel::Warning);

        let (tx, rx) = async_channel::unbounded::<Completion>();
        std::thread::Builder::new()
            .name("usb-completions".to_string())
            .spawn(move || {
                while let Ok((handler, completion)) = rx.recv_blocking() {
                    handler(completion);
                }
                debug!("Completion dispatcher stopped");
            })
            .map_err(|e| {
                warn!("Failed to spawn completion dispatcher: {}", e);
                UsbError::NoMemory
            })?;

        debug!("libusb backend created (hotplug: {})", rusb::has_hotplug());

        Ok(Self {
            context,
            registry: Arc::new(TransferRegistry {
                next_id: AtomicU64::new(1),
                active: Mutex::new(HashMap::new()),
                completions: tx,
            }),
            registrations: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
        })
    }
}

impl Backend for LibusbBackend {
    fn device_list(&self) -> Result<Box<dyn DeviceList>, UsbError> {
        let list = self.context.devices().map_err(map_rusb_error)?;
        let devices = list.iter().collect();
        Ok(Box::new(LibusbDeviceList {
            devices,
            registry: Arc::clone(&self.registry),
        }))
    }

    fn has_hotplug(&self) -> bool {
        rusb::has_hotplug()
    }

    fn register_hotplug(
        &self,
        filter: &DeviceFilter,
        callback: HotplugCallback,
    ) -> Result<HotplugToken, UsbError> {
        let mut builder = HotplugBuilder::new();
        if let Some(vendor_id) = filter.vendor_id {
            builder.vendor_id(vendor_id);
        }
        if let Some(product_id) = filter.product_id {
            builder.product_id(product_id);
        }
        if let Some(class) = filter.class {
            builder.class(class);
        }

        let registration = builder
            .enumerate(false)
            .register(&self.context, Box::new(HotplugForwarder { callback }))
            .map_err(map_rusb_error)?;

        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        lock(&self.registrations).insert(token, registration);
        debug!("Hot-plug callback {} registered for {}", token, filter);
        Ok(token)
    }

    fn deregister_hotplug(&self, token: HotplugToken) {
        // Dropping the registration deregisters the callback
        if lock(&self.registrations).remove(&token).is_some() {
            debug!("Hot-plug callback {} deregistered", token);
        }
    }

    fn handle_events(&self, timeout: Duration) -> Result<(), UsbError> {
        self.context
            .handle_events(Some(timeout))
            .map_err(map_rusb_error)
    }

    fn set_log_level(&self, level: LogLevel) {
        let mut context = self.context.clone();
        context.set_log_level(map_log_level(level));
    }
}
