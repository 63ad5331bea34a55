//! Test utilities for usbhost
//!
//! Provides builders and helper functions for testing across crates.
//!
//! # Example
//!
//! ```
//! use common::test_utils::create_mock_identity;
//!
//! let device = create_mock_identity(0x1234, 0x5678, 1, 4);
//! assert_eq!(device.vendor_id, 0x1234);
//! assert_eq!(device.port, 4);
//! ```

use model::{DeviceIdentity, DeviceSpeed};
use std::future::Future;
use std::time::{Duration, Instant};

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Create a device identity at the given location
pub fn create_mock_identity(vendor_id: u16, product_id: u16, bus: u8, port: u8) -> DeviceIdentity {
    let mut identity = DeviceIdentity::new(vendor_id, product_id, bus, port);
    identity.speed = DeviceSpeed::High;
    identity.config_count = 1;
    identity
}

/// Create `count` distinct identities on bus 1, ports 1..=count
pub fn create_mock_identity_list(count: u8) -> Vec<DeviceIdentity> {
    (1..=count)
        .map(|i| create_mock_identity(0x1000 + i as u16, 0x2000 + i as u16, 1, i))
        .collect()
}

/// Create mock bulk transfer data of specified size
pub fn create_mock_bulk_data(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i & 0xFF) as u8).collect()
}

/// Wait up to `timeout` for the next event on a notification receiver
///
/// Returns `None` on timeout or if the channel is closed and empty.
pub fn recv_timeout<T>(rx: &async_channel::Receiver<T>, timeout: Duration) -> Option<T> {
    let deadline = Instant::now() + timeout;
    loop {
        match rx.try_recv() {
            Ok(event) => return Some(event),
            Err(async_channel::TryRecvError::Closed) => return None,
            Err(async_channel::TryRecvError::Empty) => {}
        }
        if Instant::now() >= deadline {
            return None;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
}

/// Drain every event currently queued on a receiver
pub fn drain<T>(rx: &async_channel::Receiver<T>) -> Vec<T> {
    std::iter::from_fn(|| rx.try_recv().ok()).collect()
}

/// Poll `condition` until it holds or `timeout` elapses
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while !condition() {
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    true
}

/// Run an async operation with a timeout
///
/// # Example
/// ```ignore
/// use common::test_utils::{with_timeout, DEFAULT_TEST_TIMEOUT};
///
/// #[tokio::test]
/// async fn test_with_timeout() {
///     let event = with_timeout(DEFAULT_TEST_TIMEOUT, rx.recv()).await.unwrap();
/// }
/// ```
pub async fn with_timeout<T, F>(duration: Duration, future: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| TimeoutError { duration })
}

/// Error returned when a test times out
#[derive(Debug)]
pub struct TimeoutError {
    /// The timeout duration that was exceeded
    pub duration: Duration,
}

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Test timed out after {:?}", self.duration)
    }
}

impl std::error::Error for TimeoutError {}
