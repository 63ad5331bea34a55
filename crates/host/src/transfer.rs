//! Transfer engine
//!
//! A [`TransferChannel`] moves bytes between its [`TransferBuffer`] and one
//! or two endpoints of an opened device. Each direction is a small state
//! machine:
//!
//! ```text
//! Idle --submit--> InFlight --completion--> Completing --> Idle
//!                     |                          |
//!                   cancel                   resubmit (polling, write remainder)
//!                     v                          v
//!                 Cancelling --completion--> InFlight
//! ```
//!
//! Only one transfer per direction is ever in flight, so completions of a
//! direction arrive in submission order. Completion handlers run on the
//! backend's completion thread. The terminal notification of an operation
//! is published while the direction's state lock is held, after the state
//! has left `Completing`; [`TransferChannel::close`] therefore returns only
//! once nothing more can be published for the transfers it cancelled.

use crate::backend::{RawHandle, TransferCompletion, TransferId, TransferRequest};
use crate::buffer::TransferBuffer;
use crate::device::DeviceShared;
use crate::lock;
use bytes::Bytes;
use common::{EventReceiver, EventSender, TransferEvent, event_channel};
use model::{
    CONTROL_SETUP_SIZE, DeviceSpeed, OpenMode, RequestType, TransferKind, TransferStatus,
    UsbError,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Re-check interval of the blocking waits
const WAIT_INTERVAL: Duration = Duration::from_millis(10);

/// Poll size of bulk endpoints on high speed and faster devices
pub const HIGH_SPEED_POLL_SIZE: usize = 512;

/// Poll size of every other endpoint
pub const DEFAULT_POLL_SIZE: usize = 64;

/// Read size used for automatic polling when none is configured
pub fn default_poll_size(kind: TransferKind, speed: DeviceSpeed) -> usize {
    if kind == TransferKind::Bulk && speed >= DeviceSpeed::High {
        HIGH_SPEED_POLL_SIZE
    } else {
        DEFAULT_POLL_SIZE
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PipeState {
    Idle,
    InFlight(TransferId),
    Completing,
    Cancelling(TransferId),
}

/// One direction of a channel
struct Pipe {
    state: Mutex<PipeState>,
    changed: Condvar,
    /// Handle the transfer in flight was submitted on
    ///
    /// Held until the completion has run, even if the device is closed.
    handle: Mutex<Option<Arc<dyn RawHandle>>>,
}

impl Pipe {
    fn new() -> Self {
        Self {
            state: Mutex::new(PipeState::Idle),
            changed: Condvar::new(),
            handle: Mutex::new(None),
        }
    }

    fn state(&self) -> MutexGuard<'_, PipeState> {
        lock(&self.state)
    }

    fn begin_completion(&self) {
        *self.state() = PipeState::Completing;
        self.changed.notify_all();
    }

    /// Release `state` and wake waiters; drops the handle once idle
    fn release(&self, state: MutexGuard<'_, PipeState>) {
        if *state == PipeState::Idle {
            lock(&self.handle).take();
        }
        drop(state);
        self.changed.notify_all();
    }
}

struct ChannelInner {
    device: Arc<DeviceShared>,
    kind: TransferKind,
    endpoint_in: Option<u8>,
    endpoint_out: Option<u8>,
    mode: Mutex<Option<OpenMode>>,
    buffer: TransferBuffer,
    read: Pipe,
    write: Pipe,
    polling: AtomicBool,
    poll_size: Mutex<Option<usize>>,
    /// Bytes sent so far of the current write
    written: AtomicUsize,
    last_status: Mutex<Option<TransferStatus>>,
    events: EventSender<TransferEvent>,
}

/// Transfer channel bound to a device and one or two endpoints
pub struct TransferChannel {
    inner: Arc<ChannelInner>,
}

impl TransferChannel {
    pub(crate) fn new(
        device: Arc<DeviceShared>,
        kind: TransferKind,
        endpoint_in: Option<u8>,
        endpoint_out: Option<u8>,
    ) -> Self {
        let (events, _) = event_channel();
        let poll_size = device.settings().poll_size;
        Self {
            inner: Arc::new(ChannelInner {
                device,
                kind,
                endpoint_in,
                endpoint_out,
                mode: Mutex::new(None),
                buffer: TransferBuffer::new(),
                read: Pipe::new(),
                write: Pipe::new(),
                polling: AtomicBool::new(false),
                poll_size: Mutex::new(poll_size),
                written: AtomicUsize::new(0),
                last_status: Mutex::new(None),
                events,
            }),
        }
    }

    pub fn kind(&self) -> TransferKind {
        self.inner.kind
    }

    pub fn endpoint_in(&self) -> Option<u8> {
        self.inner.endpoint_in
    }

    pub fn endpoint_out(&self) -> Option<u8> {
        self.inner.endpoint_out
    }

    /// Subscribe to data-ready, bytes-written and error notifications
    pub fn events(&self) -> EventReceiver<TransferEvent> {
        self.inner.events.subscribe()
    }

    pub fn open_mode(&self) -> Option<OpenMode> {
        *lock(&self.inner.mode)
    }

    pub fn is_open(&self) -> bool {
        self.open_mode().is_some()
    }

    /// Open the channel
    ///
    /// Reading interrupt channels start polling right away when the device
    /// settings ask for it, as does any channel whose polling was enabled
    /// before opening.
    pub fn open(&self, mode: OpenMode) -> Result<(), UsbError> {
        let inner = &self.inner;
        {
            let mut current = lock(&inner.mode);
            if current.is_some() {
                return Err(UsbError::Busy);
            }
            if (mode.readable() && inner.endpoint_in.is_none())
                || (mode.writable() && inner.endpoint_out.is_none())
            {
                warn!("Channel has no endpoint for {:?}", mode);
                return Err(UsbError::InvalidParam);
            }
            if !inner.device.is_connected() {
                return Err(UsbError::NoDevice);
            }
            *current = Some(mode);
        }
        inner.device.channel_opened();

        debug!(
            "Opened {} channel in={:?} out={:?} for {:?}",
            inner.kind, inner.endpoint_in, inner.endpoint_out, mode
        );

        if mode.readable() && inner.kind != TransferKind::Control {
            if inner.kind == TransferKind::Interrupt && inner.device.settings().auto_poll_interrupt
            {
                inner.polling.store(true, Ordering::Release);
            }
            if inner.polling.load(Ordering::Acquire) {
                if let Err(e) = inner.start_polling() {
                    warn!("Failed to start polling: {}", e);
                }
            }
        }

        Ok(())
    }

    /// Close the channel
    ///
    /// Cancels in-flight transfers and blocks until their completions have
    /// run. Buffered data is discarded, as are queued notifications nobody
    /// subscribes to anymore. Closing a closed channel does nothing.
    pub fn close(&self) {
        let inner = &self.inner;
        let was_open = lock(&inner.mode).take().is_some();
        inner.polling.store(false, Ordering::Release);

        inner.cancel_and_wait(&inner.read);
        inner.cancel_and_wait(&inner.write);
        inner.buffer.clear();
        inner.events.discard_unobserved();

        if was_open {
            inner.device.channel_closed();
            debug!("Closed {} channel", inner.kind);
        }
    }

    /// Take up to `max` received bytes
    pub fn read(&self, max: usize) -> Result<Bytes, UsbError> {
        self.inner.ensure(OpenMode::readable)?;
        Ok(self.inner.buffer.read(max))
    }

    /// Take every received byte
    pub fn read_all(&self) -> Result<Bytes, UsbError> {
        self.inner.ensure(OpenMode::readable)?;
        Ok(self.inner.buffer.read_all())
    }

    pub fn bytes_available(&self) -> usize {
        self.inner.buffer.bytes_available()
    }

    /// Bytes of the current write not yet sent
    pub fn bytes_to_write(&self) -> usize {
        self.inner.buffer.bytes_to_write()
    }

    /// Schedule `data` for sending; returns the number of bytes accepted
    ///
    /// Completion is reported by a [`TransferEvent::BytesWritten`] carrying
    /// the total sent, or by a [`TransferEvent::Error`]. On a control channel
    /// `data` starts with the setup packet; an IN request receives its data
    /// into the read accumulator.
    pub fn write(&self, data: &[u8]) -> Result<usize, UsbError> {
        self.inner.write(data)
    }

    /// Submit one read of up to `max` bytes
    pub fn submit_read(&self, max: usize) -> Result<(), UsbError> {
        let inner = &self.inner;
        inner.ensure(OpenMode::readable)?;
        if inner.kind == TransferKind::Control {
            return Err(UsbError::InvalidParam);
        }
        let handle = inner.device.handle().ok_or(UsbError::NoDevice)?;

        let mut state = inner.read.state();
        if *state != PipeState::Idle {
            return Err(UsbError::Busy);
        }
        inner.submit_read_locked(&mut state, &handle, max)
    }

    /// Submit one read of the poll size
    ///
    /// Rejected while automatic polling is enabled.
    pub fn poll(&self) -> Result<(), UsbError> {
        if self.polling() {
            return Err(UsbError::Busy);
        }
        self.submit_read(self.poll_size())
    }

    /// Enable or disable automatic read resubmission
    ///
    /// Enabling on an open, idle channel submits the first read right away.
    /// Disabling lets an in-flight read complete without resubmitting.
    pub fn set_polling(&self, enable: bool) -> Result<(), UsbError> {
        let inner = &self.inner;
        if enable && (inner.kind == TransferKind::Control || inner.endpoint_in.is_none()) {
            return Err(UsbError::InvalidParam);
        }

        inner.polling.store(enable, Ordering::Release);
        if enable && inner.is_readable() {
            inner.start_polling()?;
        }
        Ok(())
    }

    pub fn polling(&self) -> bool {
        self.inner.polling.load(Ordering::Acquire)
    }

    pub fn poll_size(&self) -> usize {
        self.inner.poll_size()
    }

    pub fn set_poll_size(&self, size: usize) {
        *lock(&self.inner.poll_size) = Some(size.max(1));
    }

    /// Request cancellation of in-flight transfers without waiting
    pub fn cancel(&self) {
        self.inner.request_cancel(&self.inner.read);
        self.inner.request_cancel(&self.inner.write);
    }

    /// True while a read is submitted or completing
    pub fn is_reading(&self) -> bool {
        *self.inner.read.state() != PipeState::Idle
    }

    /// True while a write is submitted or completing
    pub fn is_writing(&self) -> bool {
        *self.inner.write.state() != PipeState::Idle
    }

    /// Status of the most recent completion
    pub fn last_status(&self) -> Option<TransferStatus> {
        *lock(&self.inner.last_status)
    }

    /// Wait until received bytes are available
    pub fn wait_for_ready_read(&self, timeout: Duration) -> bool {
        wait(timeout, || {
            if self.bytes_available() > 0 {
                Some(true)
            } else if !self.is_open() {
                Some(false)
            } else {
                None
            }
        })
    }

    /// Wait until the current write has been sent completely
    pub fn wait_for_bytes_written(&self, timeout: Duration) -> bool {
        wait(timeout, || {
            if self.is_writing() {
                None
            } else {
                Some(self.bytes_to_write() == 0)
            }
        })
    }
}

impl Drop for TransferChannel {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for TransferChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferChannel")
            .field("kind", &self.inner.kind)
            .field("endpoint_in", &self.inner.endpoint_in)
            .field("endpoint_out", &self.inner.endpoint_out)
            .field("mode", &self.open_mode())
            .finish()
    }
}

/// Re-check `done` every [`WAIT_INTERVAL`] until it decides or `timeout` passes
fn wait(timeout: Duration, mut done: impl FnMut() -> Option<bool>) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(result) = done() {
            return result;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        std::thread::sleep(WAIT_INTERVAL.min(deadline - now));
    }
}

impl ChannelInner {
    fn is_readable(&self) -> bool {
        matches!(*lock(&self.mode), Some(mode) if mode.readable())
    }

    fn is_writable(&self) -> bool {
        matches!(*lock(&self.mode), Some(mode) if mode.writable())
    }

    fn ensure(&self, allowed: fn(&OpenMode) -> bool) -> Result<(), UsbError> {
        match *lock(&self.mode) {
            Some(mode) if allowed(&mode) => Ok(()),
            _ => Err(UsbError::InvalidParam),
        }
    }

    fn poll_size(&self) -> usize {
        let fixed = *lock(&self.poll_size);
        fixed.unwrap_or_else(|| default_poll_size(self.kind, self.device.speed()))
    }

    fn record_status(&self, status: TransferStatus) {
        *lock(&self.last_status) = Some(status);
    }

    fn start_polling(self: &Arc<Self>) -> Result<(), UsbError> {
        let handle = self.device.handle().ok_or(UsbError::NoDevice)?;
        let mut state = self.read.state();
        if *state != PipeState::Idle {
            // The read in flight resubmits on completion
            return Ok(());
        }
        let size = self.poll_size();
        self.submit_read_locked(&mut state, &handle, size)
    }

    /// Submit a read; the read state must be held and not in flight
    fn submit_read_locked(
        self: &Arc<Self>,
        state: &mut PipeState,
        handle: &Arc<dyn RawHandle>,
        max: usize,
    ) -> Result<(), UsbError> {
        let Some(endpoint) = self.endpoint_in else {
            return Err(UsbError::InvalidParam);
        };

        let request = TransferRequest {
            endpoint,
            kind: self.kind,
            buffer: vec![0; max],
            timeout: self.device.timeout(),
        };
        let channel = Arc::clone(self);
        match handle.submit_transfer(request, Box::new(move |c| channel.read_finished(c))) {
            Ok(id) => {
                trace!("Submitted read {} of {} bytes on {:#04x}", id, max, endpoint);
                *lock(&self.read.handle) = Some(Arc::clone(handle));
                *state = PipeState::InFlight(id);
                Ok(())
            }
            Err(e) => {
                warn!("Failed to submit read on {:#04x}: {}", endpoint, e);
                *state = PipeState::Idle;
                self.submission_failed(e);
                Err(e)
            }
        }
    }

    fn submission_failed(&self, error: UsbError) {
        if error == UsbError::NoDevice {
            self.device.mark_disconnected();
        } else {
            self.device.set_status(error);
        }
        self.events.emit(TransferEvent::Error(error.into()));
    }

    fn read_finished(self: &Arc<Self>, completion: TransferCompletion) {
        self.read.begin_completion();

        let status = completion.status;
        self.record_status(status);
        let event = if status.is_completed() {
            let n = completion.actual_length.min(completion.buffer.len());
            self.buffer.append_read(&completion.buffer[..n]);
            trace!("Read {} bytes", n);
            TransferEvent::ReadyRead
        } else {
            self.transfer_failed(status, self.endpoint_in);
            TransferEvent::Error(status)
        };

        let mut state = self.read.state();
        *state = PipeState::Idle;
        self.events.emit(event);

        if status.is_completed() && self.polling.load(Ordering::Acquire) && self.is_readable() {
            match self.device.handle() {
                Some(handle) => {
                    let size = self.poll_size();
                    // Failures are published by the submission itself
                    let _ = self.submit_read_locked(&mut state, &handle, size);
                }
                None => debug!("Polling stopped, device is gone"),
            }
        }

        self.read.release(state);
    }

    fn write(self: &Arc<Self>, data: &[u8]) -> Result<usize, UsbError> {
        self.ensure(OpenMode::writable)?;
        if data.is_empty() {
            return Ok(0);
        }
        if self.kind == TransferKind::Control && data.len() < CONTROL_SETUP_SIZE {
            return Err(UsbError::InvalidParam);
        }
        let handle = self.device.handle().ok_or(UsbError::NoDevice)?;

        let mut state = self.write.state();
        if *state != PipeState::Idle {
            return Err(UsbError::Busy);
        }

        self.buffer.stage_write(data);
        self.written.store(0, Ordering::Release);

        let (endpoint, buffer) = match self.prepare_write(data) {
            Some(prepared) => prepared,
            None => {
                self.buffer.consume_written(data.len());
                return Err(UsbError::InvalidParam);
            }
        };

        self.submit_write_locked(&mut state, &handle, endpoint, buffer)?;
        Ok(data.len())
    }

    /// Endpoint and transfer buffer for sending `data`
    fn prepare_write(&self, data: &[u8]) -> Option<(u8, Vec<u8>)> {
        if self.kind != TransferKind::Control {
            return Some((self.endpoint_out?, data.to_vec()));
        }

        let request_type = data[0];
        if RequestType::is_in(request_type) {
            // Setup packet followed by room for wLength bytes
            let length = u16::from_le_bytes([data[6], data[7]]) as usize;
            let mut buffer = vec![0; CONTROL_SETUP_SIZE + length];
            buffer[..CONTROL_SETUP_SIZE].copy_from_slice(&data[..CONTROL_SETUP_SIZE]);
            Some((self.endpoint_in.unwrap_or(0x80), buffer))
        } else {
            Some((self.endpoint_out.unwrap_or(0x00), data.to_vec()))
        }
    }

    fn submit_write_locked(
        self: &Arc<Self>,
        state: &mut PipeState,
        handle: &Arc<dyn RawHandle>,
        endpoint: u8,
        buffer: Vec<u8>,
    ) -> Result<(), UsbError> {
        let len = buffer.len();
        let request = TransferRequest {
            endpoint,
            kind: self.kind,
            buffer,
            timeout: self.device.timeout(),
        };
        let channel = Arc::clone(self);
        match handle.submit_transfer(request, Box::new(move |c| channel.write_finished(c))) {
            Ok(id) => {
                trace!("Submitted write {} of {} bytes on {:#04x}", id, len, endpoint);
                *lock(&self.write.handle) = Some(Arc::clone(handle));
                *state = PipeState::InFlight(id);
                Ok(())
            }
            Err(e) => {
                warn!("Failed to submit write on {:#04x}: {}", endpoint, e);
                *state = PipeState::Idle;
                self.submission_failed(e);
                Err(e)
            }
        }
    }

    fn write_finished(self: &Arc<Self>, completion: TransferCompletion) {
        self.write.begin_completion();

        let status = completion.status;
        self.record_status(status);

        if self.kind == TransferKind::Control {
            self.control_finished(completion);
            return;
        }

        let sent = completion.actual_length.min(completion.buffer.len());
        let remaining = self.buffer.consume_written(sent);
        let total = self.written.fetch_add(sent, Ordering::AcqRel) + sent;
        if !status.is_completed() {
            self.transfer_failed(status, self.endpoint_out);
        }

        let mut state = self.write.state();
        *state = PipeState::Idle;

        if !status.is_completed() {
            // The unsent remainder stays staged
            self.events.emit(TransferEvent::Error(status));
        } else if remaining == 0 {
            trace!("Wrote {} bytes", total);
            self.events.emit(TransferEvent::BytesWritten(total));
        } else if sent == 0 {
            warn!("Write made no progress, {} bytes left", remaining);
            self.events.emit(TransferEvent::Error(TransferStatus::Error));
        } else if !self.is_writable() {
            debug!("Channel closed with {} bytes left to write", remaining);
            self.events.emit(TransferEvent::Error(TransferStatus::Cancelled));
        } else {
            trace!("Partial write of {} bytes, {} left", sent, remaining);
            let handle = self.device.handle();
            match (handle, self.endpoint_out) {
                (Some(handle), Some(endpoint)) => {
                    let buffer = self.buffer.pending_write();
                    // Failures are published by the submission itself
                    let _ = self.submit_write_locked(&mut state, &handle, endpoint, buffer);
                }
                _ => {
                    self.events.emit(TransferEvent::Error(TransferStatus::NoDevice));
                }
            }
        }

        self.write.release(state);
    }

    /// Control transfers complete or fail as a whole
    fn control_finished(self: &Arc<Self>, completion: TransferCompletion) {
        let status = completion.status;
        let setup_type = completion.buffer.first().copied().unwrap_or(0);
        let staged = self.buffer.bytes_to_write();
        self.buffer.consume_written(staged);

        let event = if status.is_completed() {
            if RequestType::is_in(setup_type) {
                let data = completion.buffer.get(CONTROL_SETUP_SIZE..).unwrap_or(&[]);
                let n = completion.actual_length.min(data.len());
                self.buffer.append_read(&data[..n]);
                TransferEvent::ReadyRead
            } else {
                TransferEvent::BytesWritten(CONTROL_SETUP_SIZE + completion.actual_length)
            }
        } else {
            self.transfer_failed(status, Some(0));
            TransferEvent::Error(status)
        };

        let mut state = self.write.state();
        *state = PipeState::Idle;
        self.events.emit(event);
        self.write.release(state);
    }

    /// Side effects of a failed transfer on `endpoint`
    fn transfer_failed(&self, status: TransferStatus, endpoint: Option<u8>) {
        let pipe = if endpoint.is_some_and(|e| e & 0x80 != 0) {
            &self.read
        } else {
            &self.write
        };
        match status {
            TransferStatus::Cancelled => debug!("Transfer cancelled"),
            TransferStatus::NoDevice => self.device.mark_disconnected(),
            TransferStatus::Stall => {
                warn!("Endpoint {:?} stalled", endpoint);
                let handle = lock(&pipe.handle).clone();
                if let (Some(endpoint), Some(handle)) = (endpoint, handle) {
                    if let Err(e) = handle.clear_halt(endpoint) {
                        warn!("Failed to clear halt on {:#04x}: {}", endpoint, e);
                    }
                }
            }
            status => debug!("Transfer failed: {}", status),
        }
    }

    /// Ask the backend to cancel the transfer in flight on `pipe`, if any
    fn request_cancel(&self, pipe: &Pipe) {
        let mut state = pipe.state();
        if let PipeState::InFlight(id) = *state {
            Self::cancel_transfer(pipe, id);
            *state = PipeState::Cancelling(id);
        }
    }

    fn cancel_transfer(pipe: &Pipe, id: TransferId) {
        let Some(handle) = lock(&pipe.handle).clone() else {
            debug!("No handle to cancel transfer {}", id);
            return;
        };
        match handle.cancel_transfer(id) {
            Ok(()) => trace!("Cancelling transfer {}", id),
            // Already completing
            Err(UsbError::NotFound) => {}
            Err(e) => warn!("Failed to cancel transfer {}: {}", id, e),
        }
    }

    /// Cancel whatever is in flight on `pipe` and wait until it is idle
    fn cancel_and_wait(&self, pipe: &Pipe) {
        let mut state = pipe.state();
        loop {
            match *state {
                PipeState::Idle => return,
                PipeState::InFlight(id) => {
                    Self::cancel_transfer(pipe, id);
                    *state = PipeState::Cancelling(id);
                }
                PipeState::Completing | PipeState::Cancelling(_) => {}
            }
            let (guard, _) = pipe
                .changed
                .wait_timeout(state, WAIT_INTERVAL)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_poll_size() {
        assert_eq!(default_poll_size(TransferKind::Bulk, DeviceSpeed::High), 512);
        assert_eq!(default_poll_size(TransferKind::Bulk, DeviceSpeed::Super), 512);
        assert_eq!(default_poll_size(TransferKind::Bulk, DeviceSpeed::Full), 64);
        assert_eq!(default_poll_size(TransferKind::Interrupt, DeviceSpeed::High), 64);
        assert_eq!(default_poll_size(TransferKind::Isochronous, DeviceSpeed::Unknown), 64);
    }

    #[test]
    fn test_wait_decides_early() {
        let start = Instant::now();
        assert!(wait(Duration::from_secs(5), || Some(true)));
        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(!wait(Duration::from_millis(20), || None));
    }
}
