//! Device filter matching tests
//!
//! Run with: `cargo test -p model --test filter_tests`

use model::{DeviceFilter, DeviceIdentity, UsbError};
use proptest::prelude::*;

fn identity_strategy() -> impl Strategy<Value = DeviceIdentity> {
    (any::<u16>(), any::<u16>(), any::<u8>(), any::<u8>(), any::<u8>(), any::<u8>()).prop_map(
        |(vid, pid, bus, port, class, subclass)| {
            let mut identity = DeviceIdentity::new(vid, pid, bus, port);
            identity.class = class;
            identity.subclass = subclass;
            identity
        },
    )
}

proptest! {
    /// A filter with wildcard bus/port matches a device at any location
    #[test]
    fn prop_wildcard_location_matches_anywhere(identity in identity_strategy()) {
        let filter = DeviceFilter::new(identity.vendor_id, identity.product_id);
        prop_assert!(filter.matches(&identity));
    }

    /// A filter with a concrete location matches only that location
    #[test]
    fn prop_concrete_location_is_exact(
        identity in identity_strategy(),
        bus in any::<u8>(),
        port in any::<u8>(),
    ) {
        let filter = DeviceFilter::new(identity.vendor_id, identity.product_id).at(bus, port);
        let expected = identity.bus == bus && identity.port == port;
        prop_assert_eq!(filter.matches(&identity), expected);
    }

    /// The all-wildcard filter matches everything
    #[test]
    fn prop_empty_filter_matches_all(identity in identity_strategy()) {
        prop_assert!(DeviceFilter::default().matches(&identity));
    }

    /// An identity's own filter matches it, and resolving any matching
    /// filter against it yields a filter that still matches
    #[test]
    fn prop_resolve_preserves_match(identity in identity_strategy()) {
        prop_assert!(identity.filter().matches(&identity));
        let resolved = DeviceFilter::default().resolve(&identity);
        prop_assert!(resolved.matches(&identity));
        prop_assert!(resolved.is_specific());
    }

    /// Display output parses back to the same filter
    #[test]
    fn prop_display_parses_back(
        vid in proptest::option::of(any::<u16>()),
        pid in proptest::option::of(any::<u16>()),
        bus in proptest::option::of(any::<u8>()),
        port in proptest::option::of(any::<u8>()),
    ) {
        let filter = DeviceFilter { vendor_id: vid, product_id: pid, bus, port, ..DeviceFilter::default() };
        let parsed: DeviceFilter = filter.to_string().parse().unwrap();
        prop_assert_eq!(parsed, filter);
    }
}

#[test]
fn test_filter_serializes_as_struct() {
    let filter = DeviceFilter::new(0x1234, 0x5678).at(1, 2);
    let json = serde_json::to_string(&filter).unwrap();
    let back: DeviceFilter = serde_json::from_str(&json).unwrap();
    assert_eq!(back, filter);

    // Missing fields are wildcards
    let partial: DeviceFilter = serde_json::from_str(r#"{"vendor_id": 4660}"#).unwrap();
    assert_eq!(partial.vendor_id, Some(0x1234));
    assert_eq!(partial.product_id, None);
}

#[test]
fn test_identity_display() {
    let mut identity = DeviceIdentity::new(0x1234, 0x5678, 1, 4);
    assert_eq!(identity.to_string(), "0x1234:0x5678@1.4");

    identity.description = Some("Widget".to_string());
    assert_eq!(identity.to_string(), "0x1234:0x5678@1.4 (Widget)");
}

#[test]
fn test_same_device_ignores_details() {
    let a = DeviceIdentity::new(0x1234, 0x5678, 1, 4);
    let mut b = a.clone();
    b.description = Some("Widget".to_string());
    b.config_count = 2;

    assert!(a.same_device(&b));
    assert_ne!(a, b);
    assert!(!a.same_device(&DeviceIdentity::new(0x1234, 0x5678, 1, 5)));
}

#[test]
fn test_usb_error_serializes() {
    let json = serde_json::to_string(&UsbError::Timeout).unwrap();
    let back: UsbError = serde_json::from_str(&json).unwrap();
    assert_eq!(back, UsbError::Timeout);
}
