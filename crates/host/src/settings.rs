//! Tunables for transfer channels and device monitors

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Transfer channel settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelSettings {
    /// Backend timeout of every submitted transfer, in milliseconds
    pub timeout_ms: u64,
    /// Fixed poll chunk size; derived from endpoint type and device speed when unset
    pub poll_size: Option<usize>,
    /// Start polling when an interrupt IN endpoint is opened for reading
    pub auto_poll_interrupt: bool,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            timeout_ms: 250,
            poll_size: None,
            auto_poll_interrupt: true,
        }
    }
}

impl ChannelSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Shortest interval between scans in poll-driven mode
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Device monitor settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorSettings {
    /// Interval between system list scans in poll-driven mode, in milliseconds
    pub poll_interval_ms: u64,
    /// Scan on a timer even when the backend supports hotplug
    pub force_polling: bool,
    /// Read configuration descriptors and product strings on every scan
    pub enumerate_details: bool,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 250,
            force_polling: false,
            enumerate_details: false,
        }
    }
}

impl MonitorSettings {
    /// Interval between scans, never shorter than [`MIN_POLL_INTERVAL`]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms).max(MIN_POLL_INTERVAL)
    }
}
