//! Integration tests for the device monitor
//!
//! Tests arrival and departure reporting, including:
//! - Poll-driven deltas between scans
//! - Hotplug-driven single device events
//! - Watch set and presence queries
//! - Shutdown

use common::MonitorEvent;
use common::test_utils::{
    DEFAULT_TEST_TIMEOUT, create_mock_identity, drain, recv_timeout, wait_until, with_timeout,
};
use host::{
    DeviceMonitor, MIN_POLL_INTERVAL, MockBackend, MockDevice, MonitorMode, MonitorSettings,
    UsbHost,
};
use model::{DeviceConfig, DeviceFilter, DeviceIdentity, UsbError};
use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;

/// Interval long enough that only explicit ticks rescan
fn manual_settings() -> MonitorSettings {
    MonitorSettings {
        poll_interval_ms: 3_600_000,
        ..MonitorSettings::default()
    }
}

fn identity(n: u8) -> DeviceIdentity {
    create_mock_identity(0x1000 + n as u16, 0x2000 + n as u16, 1, n)
}

fn mock(n: u8) -> MockDevice {
    MockDevice::new(identity(n)).with_bulk_pair()
}

mod polling {
    use super::*;

    #[test]
    fn test_delta_between_scans() {
        let backend = MockBackend::new();
        backend.set_devices(vec![mock(1), mock(2)]);
        let monitor = DeviceMonitor::start(Arc::new(backend.clone()), manual_settings()).unwrap();
        assert_eq!(monitor.mode(), MonitorMode::Polling);
        let events = monitor.events();

        backend.set_devices(vec![mock(2), mock(3)]);
        monitor.tick();

        assert_eq!(
            drain(&events),
            vec![
                MonitorEvent::Arrived(vec![identity(3)]),
                MonitorEvent::Removed(vec![identity(1)]),
            ]
        );
        assert_eq!(monitor.system_devices(), vec![identity(2), identity(3)]);
    }

    #[test]
    fn test_initial_devices_not_reported() {
        let backend = MockBackend::new();
        backend.set_devices(vec![mock(1)]);
        let monitor = DeviceMonitor::start(Arc::new(backend.clone()), manual_settings()).unwrap();
        let events = monitor.events();

        monitor.tick();
        assert!(drain(&events).is_empty());
        assert!(monitor.is_present(&identity(1).filter()));
    }

    #[test]
    fn test_each_tick_reported_separately() {
        let backend = MockBackend::new();
        let monitor = DeviceMonitor::start(Arc::new(backend.clone()), manual_settings()).unwrap();
        let events = monitor.events();

        backend.set_devices(vec![mock(1)]);
        monitor.tick();
        backend.set_devices(vec![mock(1), mock(2)]);
        monitor.tick();

        assert_eq!(
            drain(&events),
            vec![
                MonitorEvent::Arrived(vec![identity(1)]),
                MonitorEvent::Arrived(vec![identity(2)]),
            ]
        );
    }

    #[test]
    fn test_unreadable_device_excluded() {
        let backend = MockBackend::new();
        let monitor = DeviceMonitor::start(Arc::new(backend.clone()), manual_settings()).unwrap();
        let events = monitor.events();

        backend.set_devices(vec![
            mock(1),
            mock(2).with_descriptor_error(UsbError::Io),
            mock(3),
        ]);
        monitor.tick();

        assert_eq!(
            drain(&events),
            vec![MonitorEvent::Arrived(vec![identity(1), identity(3)])]
        );
        assert_eq!(backend.outstanding_lists(), 0);
    }

    #[test]
    fn test_ticker_scans_on_its_own() {
        let backend = MockBackend::new();
        let host = UsbHost::new(Arc::new(backend.clone())).unwrap();
        let monitor = host
            .monitor(MonitorSettings {
                poll_interval_ms: 10,
                ..MonitorSettings::default()
            })
            .unwrap();
        let events = monitor.events();

        backend.set_devices(vec![mock(4)]);
        assert_eq!(
            recv_timeout(&events, DEFAULT_TEST_TIMEOUT),
            Some(MonitorEvent::Arrived(vec![identity(4)]))
        );
    }

    #[tokio::test]
    async fn test_async_consumer() {
        let backend = MockBackend::new();
        let host = UsbHost::new(Arc::new(backend.clone())).unwrap();
        let monitor = host
            .monitor(MonitorSettings {
                poll_interval_ms: 10,
                ..MonitorSettings::default()
            })
            .unwrap();
        let events = monitor.events();

        backend.set_devices(vec![mock(6)]);
        let event = with_timeout(DEFAULT_TEST_TIMEOUT, events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event, MonitorEvent::Arrived(vec![identity(6)]));
    }

    #[test]
    fn test_zero_interval_scans_at_minimum_pace() {
        let backend = MockBackend::new();
        let monitor = DeviceMonitor::start(
            Arc::new(backend.clone()),
            MonitorSettings {
                poll_interval_ms: 0,
                ..MonitorSettings::default()
            },
        )
        .unwrap();
        let events = monitor.events();

        backend.set_devices(vec![mock(7)]);
        assert!(wait_until(DEFAULT_TEST_TIMEOUT, || !events.is_empty()));
        assert_eq!(drain(&events), vec![MonitorEvent::Arrived(vec![identity(7)])]);

        let before = backend.lists_handed_out();
        std::thread::sleep(MIN_POLL_INTERVAL * 10);
        let scans = backend.lists_handed_out() - before;
        assert!(scans <= 30, "{} scans in {:?}", scans, MIN_POLL_INTERVAL * 10);

        monitor.shutdown();
    }

    #[test]
    fn test_force_polling_with_hotplug() {
        let backend = MockBackend::with_hotplug();
        let monitor = DeviceMonitor::start(
            Arc::new(backend.clone()),
            MonitorSettings {
                force_polling: true,
                ..manual_settings()
            },
        )
        .unwrap();

        assert_eq!(monitor.mode(), MonitorMode::Polling);
        assert_eq!(backend.hotplug_registrations(), 0);
    }
}

mod hotplug {
    use super::*;

    #[test]
    fn test_events_per_callback() {
        let backend = MockBackend::with_hotplug();
        backend.set_devices(vec![mock(1)]);
        let monitor = DeviceMonitor::start(Arc::new(backend.clone()), manual_settings()).unwrap();
        assert_eq!(monitor.mode(), MonitorMode::Hotplug);
        let events = monitor.events();

        backend.plug(mock(2));
        backend.unplug(&identity(1));

        assert_eq!(
            drain(&events),
            vec![
                MonitorEvent::Arrived(vec![identity(2)]),
                MonitorEvent::Removed(vec![identity(1)]),
            ]
        );
        assert!(monitor.is_present(&identity(2).filter()));
        assert!(!monitor.is_present(&identity(1).filter()));
    }

    #[test]
    fn test_shutdown_deregisters() {
        let backend = MockBackend::with_hotplug();
        let monitor = DeviceMonitor::start(Arc::new(backend.clone()), manual_settings()).unwrap();
        let events = monitor.events();
        assert_eq!(backend.hotplug_registrations(), 1);

        monitor.shutdown();
        assert_eq!(backend.hotplug_registrations(), 0);

        backend.plug(mock(5));
        assert!(events.recv_blocking().is_err());
    }
}

mod watch_set {
    use super::*;

    #[test]
    fn test_add_and_remove() {
        let backend = MockBackend::new();
        let monitor = DeviceMonitor::start(Arc::new(backend), manual_settings()).unwrap();
        let filter = DeviceFilter::new(0x1234, 0x5678);

        assert!(monitor.add_device(filter.clone()));
        assert!(!monitor.add_device(filter.clone()));
        assert_eq!(monitor.watched().len(), 1);

        assert!(monitor.remove_device(&filter));
        assert!(monitor.remove_device(&filter));
        assert!(monitor.watched().is_empty());
    }

    #[test]
    fn test_location_free_filter_matches_located_entry() {
        let backend = MockBackend::new();
        let monitor = DeviceMonitor::start(Arc::new(backend), manual_settings()).unwrap();
        let located = DeviceFilter::new(0x1234, 0x5678).at(1, 4);

        assert!(monitor.add_device(located.clone()));
        assert!(!monitor.add_device(DeviceFilter::new(0x1234, 0x5678)));
        assert!(!monitor.add_device(located.clone()));
        assert!(monitor.add_device(DeviceFilter::new(0x1234, 0x5678).at(1, 5)));
        assert_eq!(monitor.watched().len(), 2);

        // Removes the first entry on the same ids, whatever its location
        monitor.remove_device(&DeviceFilter::new(0x1234, 0x5678));
        assert_eq!(
            monitor.watched(),
            vec![DeviceFilter::new(0x1234, 0x5678).at(1, 5)]
        );
    }

    #[test]
    fn test_present_devices() {
        let backend = MockBackend::new();
        backend.set_devices(vec![mock(1), mock(2)]);
        let monitor = DeviceMonitor::start(Arc::new(backend.clone()), manual_settings()).unwrap();

        let present = DeviceFilter::new(0x1001, 0x2001);
        let absent = DeviceFilter::new(0x1009, 0x2009);
        monitor.add_device(present.clone());
        monitor.add_device(absent.clone());

        assert!(monitor.is_present(&present));
        assert!(!monitor.is_present(&absent));
        assert_eq!(monitor.present_devices(), vec![present.clone()]);

        backend.set_devices(vec![mock(2)]);
        monitor.tick();
        assert!(monitor.present_devices().is_empty());
    }

    #[test]
    fn test_open_device_tracks_use() {
        let backend = MockBackend::new();
        backend.set_devices(vec![mock(1)]);
        let host = UsbHost::new(Arc::new(backend.clone())).unwrap();
        let monitor = host.monitor(manual_settings()).unwrap();
        let device = host.device(DeviceFilter::default(), DeviceConfig::default());

        monitor
            .open_device(&device, DeviceFilter::new(0x1001, 0x2001), DeviceConfig::default())
            .unwrap();
        assert!(device.is_connected());
        assert_eq!(monitor.devices_in_use(), vec![device.id()]);
        assert!(monitor.watched().is_empty());

        monitor.close_device(&device);
        assert!(!device.is_connected());
        assert!(monitor.devices_in_use().is_empty());
    }

    #[test]
    fn test_failed_open_not_tracked() {
        let backend = MockBackend::new();
        let host = UsbHost::new(Arc::new(backend)).unwrap();
        let monitor = host.monitor(manual_settings()).unwrap();
        let device = host.device(DeviceFilter::default(), DeviceConfig::default());

        assert_eq!(
            monitor.open_device(&device, DeviceFilter::new(0x1001, 0x2001), DeviceConfig::default()),
            Err(UsbError::NotFound)
        );
        assert!(monitor.devices_in_use().is_empty());
    }
}

#[test]
fn test_no_events_after_shutdown() {
    let backend = MockBackend::new();
    let monitor = DeviceMonitor::start(Arc::new(backend.clone()), manual_settings()).unwrap();
    let events = monitor.events();

    monitor.shutdown();
    monitor.shutdown();
    assert!(monitor.is_shut_down());

    backend.set_devices(vec![mock(1)]);
    monitor.tick();
    assert!(drain(&events).is_empty());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_tick_reports_set_difference(
        before in prop::collection::vec(any::<bool>(), 8),
        after in prop::collection::vec(any::<bool>(), 8),
    ) {
        let select = |mask: &[bool]| -> Vec<u8> {
            (1..=8u8).filter(|n| mask[*n as usize - 1]).collect()
        };
        let previous = select(before.as_slice());
        let current = select(after.as_slice());

        let backend = MockBackend::new();
        backend.set_devices(previous.iter().map(|n| mock(*n)).collect());
        let monitor = DeviceMonitor::start(Arc::new(backend.clone()), manual_settings()).unwrap();
        let events = monitor.events();

        backend.set_devices(current.iter().map(|n| mock(*n)).collect());
        monitor.tick();

        let inserted: Vec<DeviceIdentity> = current
            .iter()
            .filter(|n| !previous.contains(*n))
            .map(|n| identity(*n))
            .collect();
        let removed: Vec<DeviceIdentity> = previous
            .iter()
            .filter(|n| !current.contains(*n))
            .map(|n| identity(*n))
            .collect();

        let mut expected = Vec::new();
        if !inserted.is_empty() {
            expected.push(MonitorEvent::Arrived(inserted));
        }
        if !removed.is_empty() {
            expected.push(MonitorEvent::Removed(removed));
        }
        prop_assert_eq!(drain(&events), expected);
    }
}
