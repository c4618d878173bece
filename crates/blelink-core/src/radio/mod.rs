//! The radio peripheral stack seam.
//!
//! The core never talks to hardware directly. A [`RadioStack`] opens links and
//! runs scans; a [`GattLink`] accepts one GATT operation at a time and reports
//! completion later as a [`LinkEvent`] on the channel handed to
//! [`RadioStack::open_link`]. Submission methods only fail synchronously when
//! the stack refuses outright.
//!
//! Backends:
//!
//! - [`sim::SimulatedRadio`] - scriptable in-process stack for tests and demos
//! - `bluer::BluerRadio` - BlueZ over D-Bus (feature `bluetooth`)

use std::ops::BitOr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use uuid::{uuid, Uuid};

use crate::config::{PowerProfile, ScanFilters};
use crate::request::WriteMode;
use crate::scanner::ScanError;
use crate::types::{AdapterState, BondState, Phy, PhyOption};

#[cfg(feature = "bluetooth")]
pub mod bluer;
pub mod sim;

/// Client Characteristic Configuration Descriptor.
pub const CCCD_UUID: Uuid = uuid!("00002902-0000-1000-8000-00805f9b34fb");

/// CCCD value enabling notifications.
pub const ENABLE_NOTIFICATION_VALUE: [u8; 2] = [0x01, 0x00];

/// CCCD value enabling indications.
pub const ENABLE_INDICATION_VALUE: [u8; 2] = [0x02, 0x00];

/// CCCD value disabling both.
pub const DISABLE_NOTIFICATION_VALUE: [u8; 2] = [0x00, 0x00];

/// GATT status for success.
pub const GATT_SUCCESS: u16 = 0;

/// Generic GATT failure status, also used for a lost link.
pub const GATT_ERROR: u16 = 133;

/// Sender half for link completions.
pub type LinkEventSender = mpsc::UnboundedSender<LinkEvent>;

/// Sender half for raw advertisements.
pub type AdvertisementSender = mpsc::UnboundedSender<Advertisement>;

/// Failure to submit an operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StackError {
    /// Adapter off, permission revoked or link gone.
    #[error("radio stack unavailable")]
    Unavailable,

    /// The stack refused the operation.
    #[error("rejected by radio stack: {0}")]
    Rejected(String),

    /// The backend cannot perform this operation.
    #[error("{0} is not supported by this radio stack")]
    Unsupported(&'static str),
}

/// GATT characteristic property bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CharacteristicProperties(u8);

impl CharacteristicProperties {
    /// Broadcast.
    pub const BROADCAST: Self = Self(0x01);
    /// Read.
    pub const READ: Self = Self(0x02);
    /// Write without response.
    pub const WRITE_NO_RESPONSE: Self = Self(0x04);
    /// Write with response.
    pub const WRITE: Self = Self(0x08);
    /// Notify.
    pub const NOTIFY: Self = Self(0x10);
    /// Indicate.
    pub const INDICATE: Self = Self(0x20);
    /// Authenticated signed writes.
    pub const SIGNED_WRITE: Self = Self(0x40);

    /// From raw bits.
    #[must_use]
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    /// Raw bits.
    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Returns `true` if every bit of `other` is set.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for CharacteristicProperties {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// A discovered characteristic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattCharacteristic {
    /// Characteristic UUID.
    pub uuid: Uuid,
    /// Property bits.
    pub properties: CharacteristicProperties,
    /// Descriptor UUIDs.
    pub descriptors: Vec<Uuid>,
}

impl GattCharacteristic {
    /// A characteristic with no descriptors.
    #[must_use]
    pub const fn new(uuid: Uuid, properties: CharacteristicProperties) -> Self {
        Self {
            uuid,
            properties,
            descriptors: Vec::new(),
        }
    }

    /// Add a descriptor.
    #[must_use]
    pub fn with_descriptor(mut self, descriptor: Uuid) -> Self {
        self.descriptors.push(descriptor);
        self
    }
}

/// A discovered primary service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattService {
    /// Service UUID.
    pub uuid: Uuid,
    /// Characteristics in discovery order.
    pub characteristics: Vec<GattCharacteristic>,
}

impl GattService {
    /// Find a characteristic by UUID.
    #[must_use]
    pub fn characteristic(&self, uuid: Uuid) -> Option<&GattCharacteristic> {
        self.characteristics.iter().find(|c| c.uuid == uuid)
    }
}

/// Completion or unsolicited event from a link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// The link came up or went down.
    ConnectionStateChanged {
        /// Link is up.
        connected: bool,
        /// GATT status.
        status: u16,
    },
    /// Service discovery finished.
    ServicesDiscovered {
        /// GATT status.
        status: u16,
        /// Discovered services.
        services: Vec<GattService>,
    },
    /// A characteristic read finished.
    CharacteristicRead {
        /// Service UUID.
        service: Uuid,
        /// Characteristic UUID.
        characteristic: Uuid,
        /// GATT status.
        status: u16,
        /// Value read.
        value: Vec<u8>,
    },
    /// A characteristic write was confirmed.
    CharacteristicWritten {
        /// Service UUID.
        service: Uuid,
        /// Characteristic UUID.
        characteristic: Uuid,
        /// GATT status.
        status: u16,
        /// Value written.
        value: Vec<u8>,
    },
    /// The peripheral notified or indicated.
    CharacteristicChanged {
        /// Service UUID.
        service: Uuid,
        /// Characteristic UUID.
        characteristic: Uuid,
        /// New value.
        value: Vec<u8>,
    },
    /// A descriptor read finished.
    DescriptorRead {
        /// Service UUID.
        service: Uuid,
        /// Characteristic UUID.
        characteristic: Uuid,
        /// Descriptor UUID.
        descriptor: Uuid,
        /// GATT status.
        status: u16,
        /// Value read.
        value: Vec<u8>,
    },
    /// A descriptor write was confirmed.
    DescriptorWritten {
        /// Service UUID.
        service: Uuid,
        /// Characteristic UUID.
        characteristic: Uuid,
        /// Descriptor UUID.
        descriptor: Uuid,
        /// GATT status.
        status: u16,
        /// Value written.
        value: Vec<u8>,
    },
    /// MTU negotiation finished.
    MtuChanged {
        /// Negotiated MTU.
        mtu: u16,
        /// GATT status.
        status: u16,
    },
    /// Remote RSSI read finished.
    RssiRead {
        /// dBm.
        rssi: i16,
        /// GATT status.
        status: u16,
    },
    /// PHY update finished.
    PhyUpdated {
        /// Transmit PHY.
        tx: Phy,
        /// Receive PHY.
        rx: Phy,
        /// GATT status.
        status: u16,
    },
}

/// One raw advertisement as reported by the stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    /// Hardware address.
    pub address: String,
    /// Name resolved by the stack, if any.
    pub name: Option<String>,
    /// dBm.
    pub rssi: i16,
    /// Raw AD structures.
    pub data: Vec<u8>,
    /// Connectable flag, when the stack reports it.
    pub connectable: Option<bool>,
}

/// Parameters for a stack-level scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackScanSettings {
    /// Power/latency trade-off.
    pub power_profile: PowerProfile,
    /// Result batching window.
    pub report_delay: Duration,
    /// Filters to apply in the stack; `None` for unfiltered discovery.
    pub filters: Option<ScanFilters>,
}

/// One open (or opening) link to a peripheral.
pub trait GattLink: Send + Sync {
    /// Start service discovery.
    ///
    /// # Errors
    ///
    /// Returns a [`StackError`] if the stack refuses the submission.
    fn discover_services(&self) -> Result<(), StackError>;

    /// Read a characteristic.
    ///
    /// # Errors
    ///
    /// Returns a [`StackError`] if the stack refuses the submission.
    fn read_characteristic(&self, service: Uuid, characteristic: Uuid) -> Result<(), StackError>;

    /// Write one package to a characteristic.
    ///
    /// # Errors
    ///
    /// Returns a [`StackError`] if the stack refuses the submission.
    fn write_characteristic(
        &self,
        service: Uuid,
        characteristic: Uuid,
        value: &[u8],
        mode: WriteMode,
    ) -> Result<(), StackError>;

    /// Read a descriptor.
    ///
    /// # Errors
    ///
    /// Returns a [`StackError`] if the stack refuses the submission.
    fn read_descriptor(
        &self,
        service: Uuid,
        characteristic: Uuid,
        descriptor: Uuid,
    ) -> Result<(), StackError>;

    /// Write a descriptor.
    ///
    /// # Errors
    ///
    /// Returns a [`StackError`] if the stack refuses the submission.
    fn write_descriptor(
        &self,
        service: Uuid,
        characteristic: Uuid,
        descriptor: Uuid,
        value: &[u8],
    ) -> Result<(), StackError>;

    /// Route value changes of a characteristic to this link. Synchronous; the
    /// CCCD write that follows is a separate operation.
    ///
    /// # Errors
    ///
    /// Returns a [`StackError`] if the stack refuses.
    fn set_notification(
        &self,
        service: Uuid,
        characteristic: Uuid,
        enable: bool,
    ) -> Result<(), StackError>;

    /// Negotiate the ATT MTU.
    ///
    /// # Errors
    ///
    /// Returns a [`StackError`] if the stack refuses the submission.
    fn request_mtu(&self, mtu: u16) -> Result<(), StackError>;

    /// Read remote RSSI.
    ///
    /// # Errors
    ///
    /// Returns a [`StackError`] if the stack refuses the submission.
    fn read_rssi(&self) -> Result<(), StackError>;

    /// Request a PHY.
    ///
    /// # Errors
    ///
    /// Returns a [`StackError`] if the stack refuses the submission.
    fn set_preferred_phy(&self, tx: Phy, rx: Phy, option: PhyOption) -> Result<(), StackError>;

    /// Tear the link down. No further events are delivered.
    fn close(&self);
}

/// The host radio.
pub trait RadioStack: Send + Sync + 'static {
    /// Current adapter power state.
    fn adapter_state(&self) -> AdapterState;

    /// Subscribe to adapter power changes.
    fn watch_adapter(&self) -> watch::Receiver<AdapterState>;

    /// Begin connecting to `address`; link events go to `events`.
    ///
    /// # Errors
    ///
    /// Returns [`StackError::Unavailable`] when the adapter is off.
    fn open_link(
        &self,
        address: &str,
        events: LinkEventSender,
    ) -> Result<Arc<dyn GattLink>, StackError>;

    /// Start discovery, sending every advertisement to `sink`.
    ///
    /// # Errors
    ///
    /// Returns a classified [`ScanError`].
    fn start_scan(
        &self,
        settings: &StackScanSettings,
        sink: AdvertisementSender,
    ) -> Result<(), ScanError>;

    /// Stop discovery.
    fn stop_scan(&self);

    /// Bond state of `address`.
    fn bond_state(&self, address: &str) -> BondState;

    /// Start bonding with `address`. Returns `false` if the stack refused.
    fn create_bond(&self, address: &str) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_properties_contains() {
        let props = CharacteristicProperties::READ | CharacteristicProperties::NOTIFY;
        assert!(props.contains(CharacteristicProperties::READ));
        assert!(props.contains(CharacteristicProperties::NOTIFY));
        assert!(!props.contains(CharacteristicProperties::WRITE));
        assert_eq!(props.bits(), 0x12);
    }

    #[test]
    fn test_service_lookup() {
        let char_uuid = uuid!("6e400003-b5a3-f393-e0a9-e50e24dcca9e");
        let service = GattService {
            uuid: uuid!("6e400001-b5a3-f393-e0a9-e50e24dcca9e"),
            characteristics: vec![GattCharacteristic::new(
                char_uuid,
                CharacteristicProperties::NOTIFY,
            )
            .with_descriptor(CCCD_UUID)],
        };
        let found = service.characteristic(char_uuid).unwrap();
        assert_eq!(found.descriptors, vec![CCCD_UUID]);
        assert!(service.characteristic(CCCD_UUID).is_none());
    }
}
