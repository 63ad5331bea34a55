//! One-shot enumeration of attached devices

use crate::backend::{Backend, DeviceList};
use model::{DeviceConfig, DeviceIdentity, EndpointDescriptor, UsbError};
use tracing::{debug, warn};

/// Snapshot the attached devices
///
/// With `detail`, every configuration descriptor is walked to fill in
/// [`DeviceIdentity::configurations`] (one entry per alternate setting of
/// each interface) and [`DeviceIdentity::endpoints`], and the product string
/// is read where possible. A device whose descriptors cannot be read is
/// skipped with a warning. Only a failure to obtain the device list itself
/// is returned as an error.
pub fn devices(backend: &dyn Backend, detail: bool) -> Result<Vec<DeviceIdentity>, UsbError> {
    let list = backend.device_list().map_err(|e| {
        warn!("Failed to list devices: {}", e);
        e
    })?;

    let mut identities = Vec::with_capacity(list.len());
    for index in 0..list.len() {
        match describe(list.as_ref(), index, detail) {
            Ok(identity) => identities.push(identity),
            Err(e) => warn!("Skipping device {}: {}", index, e),
        }
    }

    debug!("Enumerated {} of {} devices", identities.len(), list.len());
    Ok(identities)
}

fn describe(list: &dyn DeviceList, index: usize, detail: bool) -> Result<DeviceIdentity, UsbError> {
    let mut identity = list.descriptor(index)?;
    if !detail {
        return Ok(identity);
    }

    for config_index in 0..identity.config_count {
        let config = list.config_descriptor(index, config_index)?;
        for interface in &config.interfaces {
            identity.configurations.push(DeviceConfig::new(
                config.number,
                interface.number,
                interface.alternate,
            ));
            identity
                .endpoints
                .extend(interface.endpoints.iter().map(|endpoint| EndpointDescriptor {
                    address: endpoint.address,
                    attributes: endpoint.attributes,
                    max_packet_size: endpoint.max_packet_size,
                    config: config.number,
                    interface: interface.number,
                    alternate: interface.alternate,
                }));
        }
    }

    identity.description = list.description(index);
    Ok(identity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::{MockBackend, MockDevice};
    use common::test_utils::create_mock_identity;
    use model::TransferKind;

    #[test]
    fn test_summary_has_no_details() {
        let backend = MockBackend::new();
        backend.add_device(
            MockDevice::new(create_mock_identity(0x1234, 0x5678, 1, 2))
                .with_bulk_pair()
                .with_description("Widget"),
        );

        let found = devices(&backend, false).unwrap();
        assert_eq!(found.len(), 1);
        assert!(found[0].endpoints.is_empty());
        assert_eq!(found[0].description, None);
    }

    #[test]
    fn test_detail_walks_descriptors() {
        let backend = MockBackend::new();
        backend.add_device(
            MockDevice::new(create_mock_identity(0x1234, 0x5678, 1, 2))
                .with_bulk_pair()
                .with_description("Widget"),
        );

        let found = devices(&backend, true).unwrap();
        let identity = &found[0];
        assert_eq!(identity.configurations, vec![DeviceConfig::new(1, 0, 0)]);
        assert_eq!(identity.endpoints.len(), 3);
        assert_eq!(identity.endpoints[0].kind(), TransferKind::Bulk);
        assert_eq!(identity.endpoints[2].kind(), TransferKind::Interrupt);
        assert_eq!(identity.description.as_deref(), Some("Widget"));
        assert_eq!(backend.outstanding_lists(), 0);
    }

    #[test]
    fn test_missing_config_skips_device() {
        let backend = MockBackend::new();
        let mut broken = MockDevice::new(create_mock_identity(0x1234, 0x0001, 1, 1)).with_bulk_pair();
        broken.identity.config_count = 2;
        backend.add_device(broken);
        backend.add_device(MockDevice::new(create_mock_identity(0x1234, 0x0002, 1, 2)).with_bulk_pair());

        // Summary enumeration does not read configurations
        assert_eq!(devices(&backend, false).unwrap().len(), 2);

        let found = devices(&backend, true).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].product_id, 0x0002);
    }
}
