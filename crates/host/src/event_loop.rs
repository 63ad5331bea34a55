//! Backend event thread
//!
//! One dedicated thread per backend services completions and hotplug
//! notifications by calling [`Backend::handle_events`] in a loop. It is
//! shared by every device, channel and monitor created on the backend and
//! stops once the last of them is dropped.

use crate::backend::Backend;
use model::UsbError;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

/// How long one `handle_events` call may block
const EVENT_TIMEOUT: Duration = Duration::from_millis(100);

pub struct EventLoop {
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl EventLoop {
    /// Spawn the event thread for `backend`
    pub fn spawn(backend: Arc<dyn Backend>) -> Result<Self, UsbError> {
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);

        let thread = std::thread::Builder::new()
            .name("usb-events".to_string())
            .spawn(move || run(backend, flag))
            .map_err(|e| {
                warn!("Failed to spawn USB event thread: {}", e);
                UsbError::NoMemory
            })?;

        Ok(Self {
            running,
            thread: Some(thread),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

fn run(backend: Arc<dyn Backend>, running: Arc<AtomicBool>) {
    info!("USB event thread started");

    while running.load(Ordering::Acquire) {
        match backend.handle_events(EVENT_TIMEOUT) {
            Ok(()) => {}
            Err(UsbError::Interrupted) => {
                debug!("USB event handling interrupted");
            }
            Err(e) => {
                // Transient errors are retried after a short pause
                warn!("Error handling USB events: {}", e);
                std::thread::sleep(EVENT_TIMEOUT);
            }
        }
    }

    info!("USB event thread stopped");
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            // The last owner may be a completion running on the event thread
            // itself; that thread exits on its own once the flag is read.
            if thread.thread().id() == std::thread::current().id() {
                return;
            }
            if thread.join().is_err() {
                warn!("USB event thread panicked");
            }
        }
    }
}
