//! Shared types and OpenAPI schemas.
//!
//! This module contains the device model and the small enums that are shared
//! between the scanner, connections, events and the HTTP layer.

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::error::{BleError, Result};

static ADDRESS_RE: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"^[0-9A-Fa-f]{2}(:[0-9A-Fa-f]{2}){5}$").ok());

/// Returns `true` if `address` is a colon separated 48-bit hardware address.
#[must_use]
pub fn is_valid_address(address: &str) -> bool {
    ADDRESS_RE
        .as_ref()
        .is_some_and(|re| re.is_match(address))
}

/// Lifecycle state of a connection.
///
/// Legal transitions:
///
/// ```text
/// DISCONNECTED --connect--> CONNECTING
/// CONNECTING --link up--> CONNECTED
/// CONNECTING --failure--> DISCONNECTED | SCANNING_FOR_RECONNECTION
/// CONNECTED --discover--> SERVICE_DISCOVERING
/// SERVICE_DISCOVERING --ok--> SERVICE_DISCOVERED
/// SERVICE_DISCOVERING --failure--> DISCONNECTED
/// SERVICE_DISCOVERED --mtu--> MTU_SUCCESS
/// link up states --link lost--> SCANNING_FOR_RECONNECTION | DISCONNECTED
/// SCANNING_FOR_RECONNECTION --found--> CONNECTING
/// SCANNING_FOR_RECONNECTION --exhausted--> DISCONNECTED
/// any --release--> RELEASED
/// ```
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, ToSchema,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    /// No link and no reconnection in progress.
    #[default]
    Disconnected,
    /// A link is being opened.
    Connecting,
    /// Waiting for the device to advertise again.
    ScanningForReconnection,
    /// The link is up, services not yet discovered.
    Connected,
    /// Service discovery is running.
    ServiceDiscovering,
    /// Services are known; requests may execute.
    ServiceDiscovered,
    /// The negotiated MTU has been applied.
    MtuSuccess,
    /// Reserved. Connect timeouts are reported as events and never entered as a state.
    Timeout,
    /// Terminal.
    Released,
}

impl ConnectionState {
    /// Returns `true` once services are discovered, i.e. requests may execute.
    #[inline]
    #[must_use]
    pub const fn is_ready(self) -> bool {
        matches!(self, Self::ServiceDiscovered | Self::MtuSuccess)
    }

    /// Returns `true` while the radio link is established.
    #[inline]
    #[must_use]
    pub const fn is_link_up(self) -> bool {
        matches!(
            self,
            Self::Connected | Self::ServiceDiscovering | Self::ServiceDiscovered | Self::MtuSuccess
        )
    }

    /// Returns `true` for the terminal state.
    #[inline]
    #[must_use]
    pub const fn is_released(self) -> bool {
        matches!(self, Self::Released)
    }

    /// Returns `true` if `next` is a legal successor of `self`.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        use ConnectionState::{
            Connected, Connecting, Disconnected, MtuSuccess, Released, ScanningForReconnection,
            ServiceDiscovered, ServiceDiscovering,
        };

        match (self, next) {
            (Released, _) => false,
            (_, Released)
            | (Disconnected | ScanningForReconnection, Connecting)
            | (Connecting, Connected)
            | (Connected, ServiceDiscovering)
            | (ServiceDiscovering, ServiceDiscovered)
            | (ServiceDiscovered, MtuSuccess)
            | (
                Connecting | ScanningForReconnection | Connected | ServiceDiscovering
                | ServiceDiscovered | MtuSuccess,
                Disconnected,
            )
            | (
                Connecting | Connected | ServiceDiscovering | ServiceDiscovered | MtuSuccess,
                ScanningForReconnection,
            ) => true,
            _ => false,
        }
    }

    /// Upper snake case name, as used on the wire.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "DISCONNECTED",
            Self::Connecting => "CONNECTING",
            Self::ScanningForReconnection => "SCANNING_FOR_RECONNECTION",
            Self::Connected => "CONNECTED",
            Self::ServiceDiscovering => "SERVICE_DISCOVERING",
            Self::ServiceDiscovered => "SERVICE_DISCOVERED",
            Self::MtuSuccess => "MTU_SUCCESS",
            Self::Timeout => "TIMEOUT",
            Self::Released => "RELEASED",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which phase a connect timeout expired in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutKind {
    /// The device never re-appeared while scanning for reconnection.
    CannotDiscoverDevice,
    /// The link never came up.
    CannotConnect,
    /// Service discovery never finished.
    CannotDiscoverServices,
}

impl fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::CannotDiscoverDevice => "device not found",
            Self::CannotConnect => "link not established",
            Self::CannotDiscoverServices => "services not discovered",
        };
        f.write_str(text)
    }
}

/// Power state of the host adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum AdapterState {
    /// Powered and usable.
    On,
    /// Powered off or unavailable.
    Off,
}

/// Bond (pairing) state reported by the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BondState {
    /// Not bonded.
    #[default]
    None,
    /// Bonding in progress.
    Bonding,
    /// Bonded.
    Bonded,
}

/// LE physical layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Phy {
    /// LE 1M.
    #[default]
    #[serde(rename = "le_1m")]
    Le1M,
    /// LE 2M.
    #[serde(rename = "le_2m")]
    Le2M,
    /// LE Coded.
    #[serde(rename = "le_coded")]
    LeCoded,
}

/// Coding preference when [`Phy::LeCoded`] is requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhyOption {
    /// Let the controller decide.
    #[default]
    NoPreferred,
    /// S=2 coding.
    S2,
    /// S=8 coding.
    S8,
}

/// A peripheral known to the library.
///
/// Identity is the hardware address; two `Device` values with the same address
/// compare equal regardless of name, RSSI or state.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Device {
    address: String,

    /// Advertised or cached display name.
    #[schema(example = "Sensor-01")]
    pub name: Option<String>,

    /// Last known signal strength in dBm.
    #[schema(example = -58)]
    pub rssi: Option<i16>,

    /// Raw advertisement payload from the last scan result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_advertisement: Option<Vec<u8>>,

    /// Whether the last advertisement was connectable; `None` when unknown.
    pub connectable: Option<bool>,

    /// Current connection state.
    pub state: ConnectionState,
}

impl Device {
    /// Creates a device from an address, normalising it to upper case.
    ///
    /// # Errors
    ///
    /// Returns [`BleError::InvalidAddress`] if the address is malformed.
    pub fn new(address: &str) -> Result<Self> {
        if !is_valid_address(address) {
            return Err(BleError::InvalidAddress(address.to_string()));
        }
        Ok(Self {
            address: address.to_ascii_uppercase(),
            name: None,
            rssi: None,
            raw_advertisement: None,
            connectable: None,
            state: ConnectionState::Disconnected,
        })
    }

    /// Sets the display name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Hardware address in upper case.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Name or an empty string.
    #[must_use]
    pub fn name_or_empty(&self) -> &str {
        self.name.as_deref().unwrap_or_default()
    }
}

impl PartialEq for Device {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

impl Eq for Device {}

impl std::hash::Hash for Device {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.address.hash(state);
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{name} [{}]", self.address),
            None => f.write_str(&self.address),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_addresses() {
        assert!(is_valid_address("AA:BB:CC:DD:EE:FF"));
        assert!(is_valid_address("aa:bb:cc:dd:ee:ff"));
        assert!(!is_valid_address("AA:BB:CC:DD:EE"));
        assert!(!is_valid_address("AA-BB-CC-DD-EE-FF"));
        assert!(!is_valid_address("GG:BB:CC:DD:EE:FF"));
        assert!(!is_valid_address(""));
    }

    #[test]
    fn test_device_normalises_address() {
        let device = Device::new("aa:bb:cc:dd:ee:ff").unwrap();
        assert_eq!(device.address(), "AA:BB:CC:DD:EE:FF");
        assert_eq!(device.state, ConnectionState::Disconnected);
    }

    #[test]
    fn test_device_rejects_bad_address() {
        let err = Device::new("not-an-address").unwrap_err();
        assert!(matches!(err, BleError::InvalidAddress(_)));
    }

    #[test]
    fn test_device_equality_is_by_address() {
        let a = Device::new("AA:BB:CC:DD:EE:FF").unwrap().with_name("one");
        let mut b = Device::new("aa:bb:cc:dd:ee:ff").unwrap().with_name("two");
        b.rssi = Some(-40);
        assert_eq!(a, b);
    }

    #[test]
    fn test_connection_state_display() {
        assert_eq!(ConnectionState::Disconnected.to_string(), "DISCONNECTED");
        assert_eq!(
            ConnectionState::ScanningForReconnection.to_string(),
            "SCANNING_FOR_RECONNECTION"
        );
        assert_eq!(ConnectionState::MtuSuccess.to_string(), "MTU_SUCCESS");
    }

    #[test]
    fn test_connection_state_serde_matches_display() {
        let json = serde_json::to_string(&ConnectionState::ServiceDiscovered).unwrap();
        assert_eq!(json, "\"SERVICE_DISCOVERED\"");
    }

    #[test]
    fn test_happy_path_is_legal() {
        use ConnectionState::*;
        let path = [
            Disconnected,
            Connecting,
            Connected,
            ServiceDiscovering,
            ServiceDiscovered,
            MtuSuccess,
            ScanningForReconnection,
            Connecting,
            Disconnected,
            Released,
        ];
        for pair in path.windows(2) {
            assert!(
                pair[0].can_transition_to(pair[1]),
                "{} -> {} should be legal",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn test_skipped_edges_are_illegal() {
        use ConnectionState::*;
        assert!(!Disconnected.can_transition_to(Connected));
        assert!(!Connecting.can_transition_to(ServiceDiscovered));
        assert!(!Connected.can_transition_to(MtuSuccess));
        assert!(!ServiceDiscovered.can_transition_to(Connecting));
        assert!(!Disconnected.can_transition_to(ScanningForReconnection));
        assert!(!Released.can_transition_to(Connecting));
        assert!(!Released.can_transition_to(Released));
    }

    #[test]
    fn test_readiness() {
        assert!(ConnectionState::ServiceDiscovered.is_ready());
        assert!(ConnectionState::MtuSuccess.is_ready());
        assert!(!ConnectionState::Connected.is_ready());
        assert!(ConnectionState::Connected.is_link_up());
        assert!(!ConnectionState::ScanningForReconnection.is_link_up());
    }
}
