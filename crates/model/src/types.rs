//! Device identity, filter and configuration types
//!
//! A [`DeviceIdentity`] is what enumeration reports about an attached device.
//! A [`DeviceFilter`] is what a caller declares to select devices: every
//! field left as `None` is a wildcard.

use crate::error::FilterParseError;
use crate::transfer::TransferKind;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// USB device speed
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum DeviceSpeed {
    /// Speed not reported by the backend
    #[default]
    Unknown,
    /// Low speed - 1.5 Mbps (USB 1.0)
    Low,
    /// Full speed - 12 Mbps (USB 1.1)
    Full,
    /// High speed - 480 Mbps (USB 2.0)
    High,
    /// SuperSpeed - 5 Gbps (USB 3.0)
    Super,
    /// SuperSpeed+ - 10 Gbps (USB 3.1)
    SuperPlus,
}

impl DeviceSpeed {
    /// Human readable speed name
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceSpeed::Unknown => "Unknown speed",
            DeviceSpeed::Low => "Low speed",
            DeviceSpeed::Full => "Full speed",
            DeviceSpeed::High => "High speed",
            DeviceSpeed::Super => "Super speed",
            DeviceSpeed::SuperPlus => "Super speed plus",
        }
    }
}

/// Configuration, interface and alternate setting a device is used with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// bConfigurationValue
    pub config: u8,
    /// bInterfaceNumber
    pub interface: u8,
    /// bAlternateSetting
    pub alternate: u8,
}

impl DeviceConfig {
    pub const fn new(config: u8, interface: u8, alternate: u8) -> Self {
        Self {
            config,
            interface,
            alternate,
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self::new(1, 0, 0)
    }
}

impl fmt::Display for DeviceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "config {}, interface {}, alternate {}",
            self.config, self.interface, self.alternate
        )
    }
}

/// One endpoint of one alternate setting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndpointDescriptor {
    /// bEndpointAddress (bit 7 set for IN)
    pub address: u8,
    /// bmAttributes
    pub attributes: u8,
    /// wMaxPacketSize
    pub max_packet_size: u16,
    /// Owning configuration value
    pub config: u8,
    /// Owning interface number
    pub interface: u8,
    /// Owning alternate setting
    pub alternate: u8,
}

impl EndpointDescriptor {
    pub fn is_in(&self) -> bool {
        self.address & 0x80 != 0
    }

    pub fn number(&self) -> u8 {
        self.address & 0x0F
    }

    pub fn kind(&self) -> TransferKind {
        TransferKind::from_attributes(self.attributes)
    }
}

impl fmt::Display for EndpointDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ep {:#04x} {} {} (max {} bytes) [{}.{}.{}]",
            self.address,
            if self.is_in() { "IN" } else { "OUT" },
            self.kind(),
            self.max_packet_size,
            self.config,
            self.interface,
            self.alternate
        )
    }
}

/// Identity of an attached device as reported by enumeration
///
/// Identities are plain values: they are produced by enumeration or hotplug
/// notifications and copied, never updated in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub vendor_id: u16,
    pub product_id: u16,
    pub bus: u8,
    pub port: u8,
    pub class: u8,
    pub subclass: u8,
    #[serde(default)]
    pub speed: DeviceSpeed,
    /// Product string, when it could be read
    #[serde(default)]
    pub description: Option<String>,
    /// Number of configurations the device reports
    #[serde(default)]
    pub config_count: u8,
    /// One entry per alternate setting of every interface of every configuration
    #[serde(default)]
    pub configurations: Vec<DeviceConfig>,
    #[serde(default)]
    pub endpoints: Vec<EndpointDescriptor>,
}

impl DeviceIdentity {
    pub fn new(vendor_id: u16, product_id: u16, bus: u8, port: u8) -> Self {
        Self {
            vendor_id,
            product_id,
            bus,
            port,
            class: 0,
            subclass: 0,
            speed: DeviceSpeed::Unknown,
            description: None,
            config_count: 0,
            configurations: Vec::new(),
            endpoints: Vec::new(),
        }
    }

    /// True if both identities describe the same physical attachment
    ///
    /// Compares vendor/product id and bus/port only. Two devices with equal
    /// ids plugged into the same port one after another are indistinguishable.
    pub fn same_device(&self, other: &DeviceIdentity) -> bool {
        self.vendor_id == other.vendor_id
            && self.product_id == other.product_id
            && self.bus == other.bus
            && self.port == other.port
    }

    /// A filter selecting exactly this attachment
    pub fn filter(&self) -> DeviceFilter {
        DeviceFilter::new(self.vendor_id, self.product_id).at(self.bus, self.port)
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:#06x}:{:#06x}@{}.{}",
            self.vendor_id, self.product_id, self.bus, self.port
        )?;
        if let Some(description) = &self.description {
            write!(f, " ({})", description)?;
        }
        Ok(())
    }
}

/// Pattern selecting devices
///
/// `None` fields match anything. Parsed from and displayed as
/// `VID:PID[@BUS.PORT]`, e.g. `0x1234:0x5678` or `0x1234:0x5678@1.4`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceFilter {
    #[serde(default)]
    pub vendor_id: Option<u16>,
    #[serde(default)]
    pub product_id: Option<u16>,
    #[serde(default)]
    pub bus: Option<u8>,
    #[serde(default)]
    pub port: Option<u8>,
    #[serde(default)]
    pub class: Option<u8>,
    #[serde(default)]
    pub subclass: Option<u8>,
    /// Platform specific device path or instance id
    #[serde(default)]
    pub platform_id: Option<String>,
}

impl DeviceFilter {
    /// Filter on vendor and product id, any bus and port
    pub fn new(vendor_id: u16, product_id: u16) -> Self {
        Self {
            vendor_id: Some(vendor_id),
            product_id: Some(product_id),
            ..Self::default()
        }
    }

    /// Restrict the filter to one bus and port
    pub fn at(mut self, bus: u8, port: u8) -> Self {
        self.bus = Some(bus);
        self.port = Some(port);
        self
    }

    /// Restrict the filter to a device class and subclass
    pub fn with_class(mut self, class: u8, subclass: u8) -> Self {
        self.class = Some(class);
        self.subclass = Some(subclass);
        self
    }

    pub fn with_platform_id(mut self, platform_id: impl Into<String>) -> Self {
        self.platform_id = Some(platform_id.into());
        self
    }

    /// True if every non-wildcard field equals the identity's field
    pub fn matches(&self, identity: &DeviceIdentity) -> bool {
        field_matches(self.vendor_id, identity.vendor_id)
            && field_matches(self.product_id, identity.product_id)
            && field_matches(self.bus, identity.bus)
            && field_matches(self.port, identity.port)
            && field_matches(self.class, identity.class)
            && field_matches(self.subclass, identity.subclass)
    }

    /// True if the filter narrows the search enough to open a device
    ///
    /// Needs vendor and product id, or class and subclass, or bus and port.
    pub fn is_specific(&self) -> bool {
        (self.vendor_id.is_some() && self.product_id.is_some())
            || (self.class.is_some() && self.subclass.is_some())
            || (self.bus.is_some() && self.port.is_some())
    }

    /// Copy of this filter with the wildcards filled in from `identity`
    pub fn resolve(&self, identity: &DeviceIdentity) -> DeviceFilter {
        DeviceFilter {
            vendor_id: Some(self.vendor_id.unwrap_or(identity.vendor_id)),
            product_id: Some(self.product_id.unwrap_or(identity.product_id)),
            bus: Some(self.bus.unwrap_or(identity.bus)),
            port: Some(self.port.unwrap_or(identity.port)),
            class: Some(self.class.unwrap_or(identity.class)),
            subclass: Some(self.subclass.unwrap_or(identity.subclass)),
            platform_id: self.platform_id.clone(),
        }
    }
}

fn field_matches<T: PartialEq>(filter: Option<T>, value: T) -> bool {
    filter.is_none_or(|f| f == value)
}

impl fmt::Display for DeviceFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_hex(f, self.vendor_id)?;
        f.write_str(":")?;
        fmt_hex(f, self.product_id)?;
        if self.bus.is_some() || self.port.is_some() {
            f.write_str("@")?;
            fmt_location(f, self.bus)?;
            f.write_str(".")?;
            fmt_location(f, self.port)?;
        }
        Ok(())
    }
}

fn fmt_hex(f: &mut fmt::Formatter<'_>, id: Option<u16>) -> fmt::Result {
    match id {
        Some(id) => write!(f, "{:#06x}", id),
        None => f.write_str("*"),
    }
}

fn fmt_location(f: &mut fmt::Formatter<'_>, value: Option<u8>) -> fmt::Result {
    match value {
        Some(value) => write!(f, "{}", value),
        None => f.write_str("*"),
    }
}

impl FromStr for DeviceFilter {
    type Err = FilterParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (ids, location) = match s.split_once('@') {
            Some((ids, location)) => (ids, Some(location)),
            None => (s, None),
        };

        let (vid, pid) = ids
            .split_once(':')
            .ok_or_else(|| FilterParseError::Format(s.to_string()))?;
        if pid.contains(':') {
            return Err(FilterParseError::Format(s.to_string()));
        }

        let mut filter = DeviceFilter {
            vendor_id: parse_hex_id(vid, "VID")?,
            product_id: parse_hex_id(pid, "PID")?,
            ..DeviceFilter::default()
        };

        if let Some(location) = location {
            let (bus, port) = location
                .split_once('.')
                .ok_or_else(|| FilterParseError::Format(s.to_string()))?;
            filter.bus = parse_location(bus, "bus")?;
            filter.port = parse_location(port, "port")?;
        }

        Ok(filter)
    }
}

fn parse_hex_id(value: &str, name: &'static str) -> Result<Option<u16>, FilterParseError> {
    if value == "*" {
        return Ok(None);
    }

    let invalid = || FilterParseError::HexId {
        name,
        value: value.to_string(),
    };

    let hex = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .ok_or_else(invalid)?;
    if hex.is_empty() || hex.len() > 4 {
        return Err(invalid());
    }

    u16::from_str_radix(hex, 16).map(Some).map_err(|_| invalid())
}

fn parse_location(value: &str, name: &'static str) -> Result<Option<u8>, FilterParseError> {
    if value == "*" {
        return Ok(None);
    }

    value
        .parse::<u8>()
        .map(Some)
        .map_err(|_| FilterParseError::Location {
            name,
            value: value.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wildcard_location_matches_any_port() {
        let filter = DeviceFilter::new(0x1234, 0x5678);

        assert!(filter.matches(&DeviceIdentity::new(0x1234, 0x5678, 1, 1)));
        assert!(filter.matches(&DeviceIdentity::new(0x1234, 0x5678, 9, 3)));
        assert!(!filter.matches(&DeviceIdentity::new(0x1234, 0x9999, 1, 1)));
        assert!(!filter.matches(&DeviceIdentity::new(0x9999, 0x5678, 1, 1)));
    }

    #[test]
    fn test_concrete_location_matches_exactly() {
        let filter = DeviceFilter::new(0x1234, 0x5678).at(2, 4);

        assert!(filter.matches(&DeviceIdentity::new(0x1234, 0x5678, 2, 4)));
        assert!(!filter.matches(&DeviceIdentity::new(0x1234, 0x5678, 2, 5)));
        assert!(!filter.matches(&DeviceIdentity::new(0x1234, 0x5678, 3, 4)));
    }

    #[test]
    fn test_class_filter() {
        let filter = DeviceFilter::default().with_class(0x03, 0x01);
        let mut hid = DeviceIdentity::new(0x046d, 0xc52b, 1, 2);
        hid.class = 0x03;
        hid.subclass = 0x01;

        assert!(filter.is_specific());
        assert!(filter.matches(&hid));
        assert!(!filter.matches(&DeviceIdentity::new(0x046d, 0xc52b, 1, 2)));
    }

    #[test]
    fn test_is_specific() {
        assert!(DeviceFilter::new(1, 2).is_specific());
        assert!(!DeviceFilter::default().is_specific());
        assert!(
            DeviceFilter {
                bus: Some(1),
                port: Some(2),
                ..DeviceFilter::default()
            }
            .is_specific()
        );
        assert!(
            !DeviceFilter {
                vendor_id: Some(1),
                ..DeviceFilter::default()
            }
            .is_specific()
        );
    }

    #[test]
    fn test_resolve_fills_wildcards() {
        let mut identity = DeviceIdentity::new(0x1234, 0x5678, 3, 7);
        identity.class = 0xff;

        let resolved = DeviceFilter::new(0x1234, 0x5678).resolve(&identity);
        assert_eq!(resolved.bus, Some(3));
        assert_eq!(resolved.port, Some(7));
        assert_eq!(resolved.class, Some(0xff));
        assert!(resolved.matches(&identity));
    }

    #[test]
    fn test_parse_filter() {
        let filter: DeviceFilter = "0x1234:0x5678".parse().unwrap();
        assert_eq!(filter, DeviceFilter::new(0x1234, 0x5678));

        let filter: DeviceFilter = "0xABCD:0xef01@1.4".parse().unwrap();
        assert_eq!(filter, DeviceFilter::new(0xabcd, 0xef01).at(1, 4));

        let filter: DeviceFilter = "0x1234:*@*.3".parse().unwrap();
        assert_eq!(filter.product_id, None);
        assert_eq!(filter.bus, None);
        assert_eq!(filter.port, Some(3));
    }

    #[test]
    fn test_parse_filter_invalid() {
        assert!("1234:5678".parse::<DeviceFilter>().is_err());
        assert!("0x1234".parse::<DeviceFilter>().is_err());
        assert!("0x1234:0x5678:0x9abc".parse::<DeviceFilter>().is_err());
        assert!("0xGHIJ:0x5678".parse::<DeviceFilter>().is_err());
        assert!("0x12345:0x5678".parse::<DeviceFilter>().is_err());
        assert!("0x1234:0x5678@1".parse::<DeviceFilter>().is_err());
        assert!("0x1234:0x5678@1.300".parse::<DeviceFilter>().is_err());
    }

    #[test]
    fn test_filter_display() {
        assert_eq!(DeviceFilter::new(0x1234, 0x5678).to_string(), "0x1234:0x5678");
        assert_eq!(
            DeviceFilter::new(0x1234, 0x5678).at(1, 4).to_string(),
            "0x1234:0x5678@1.4"
        );
    }

    #[test]
    fn test_endpoint_descriptor_helpers() {
        let ep = EndpointDescriptor {
            address: 0x81,
            attributes: 0x03,
            max_packet_size: 8,
            config: 1,
            interface: 0,
            alternate: 0,
        };
        assert!(ep.is_in());
        assert_eq!(ep.number(), 1);
        assert_eq!(ep.kind(), TransferKind::Interrupt);
    }

    #[test]
    fn test_speed_ordering() {
        assert!(DeviceSpeed::High >= DeviceSpeed::High);
        assert!(DeviceSpeed::Super > DeviceSpeed::High);
        assert!(DeviceSpeed::Full < DeviceSpeed::High);
        assert_eq!(DeviceSpeed::default(), DeviceSpeed::Unknown);
    }
}
