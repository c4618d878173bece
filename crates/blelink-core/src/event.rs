//! Events broadcast to observers.

use uuid::Uuid;

use crate::connection::ConnectError;
use crate::observer::EventObserver;
use crate::request::{RequestError, RequestInfo};
use crate::types::{AdapterState, Device, Phy, TimeoutKind};

/// Discriminant of [`BleEvent`], used as the key of an observer's dispatch table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    /// [`BleEvent::ConnectionStateChanged`]
    ConnectionStateChanged,
    /// [`BleEvent::ConnectFailed`]
    ConnectFailed,
    /// [`BleEvent::ConnectTimeout`]
    ConnectTimeout,
    /// [`BleEvent::AdapterStateChanged`]
    AdapterStateChanged,
    /// [`BleEvent::ScanResult`]
    ScanResult,
    /// [`BleEvent::CharacteristicChanged`]
    CharacteristicChanged,
    /// [`BleEvent::CharacteristicRead`]
    CharacteristicRead,
    /// [`BleEvent::CharacteristicWrite`]
    CharacteristicWrite,
    /// [`BleEvent::DescriptorRead`]
    DescriptorRead,
    /// [`BleEvent::DescriptorWrite`]
    DescriptorWrite,
    /// [`BleEvent::NotificationChanged`]
    NotificationChanged,
    /// [`BleEvent::MtuChanged`]
    MtuChanged,
    /// [`BleEvent::RssiRead`]
    RssiRead,
    /// [`BleEvent::PhyChanged`]
    PhyChanged,
    /// [`BleEvent::RequestFailed`]
    RequestFailed,
}

impl EventKind {
    /// Number of kinds.
    pub const COUNT: usize = 15;

    /// Every kind, in declaration order.
    pub const ALL: [Self; Self::COUNT] = [
        Self::ConnectionStateChanged,
        Self::ConnectFailed,
        Self::ConnectTimeout,
        Self::AdapterStateChanged,
        Self::ScanResult,
        Self::CharacteristicChanged,
        Self::CharacteristicRead,
        Self::CharacteristicWrite,
        Self::DescriptorRead,
        Self::DescriptorWrite,
        Self::NotificationChanged,
        Self::MtuChanged,
        Self::RssiRead,
        Self::PhyChanged,
        Self::RequestFailed,
    ];

    /// Position in [`Self::ALL`].
    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Stable snake case name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ConnectionStateChanged => "connection_state_changed",
            Self::ConnectFailed => "connect_failed",
            Self::ConnectTimeout => "connect_timeout",
            Self::AdapterStateChanged => "adapter_state_changed",
            Self::ScanResult => "scan_result",
            Self::CharacteristicChanged => "characteristic_changed",
            Self::CharacteristicRead => "characteristic_read",
            Self::CharacteristicWrite => "characteristic_write",
            Self::DescriptorRead => "descriptor_read",
            Self::DescriptorWrite => "descriptor_write",
            Self::NotificationChanged => "notification_changed",
            Self::MtuChanged => "mtu_changed",
            Self::RssiRead => "rssi_read",
            Self::PhyChanged => "phy_changed",
            Self::RequestFailed => "request_failed",
        }
    }
}

/// An event with its typed parameters.
#[derive(Debug, Clone)]
pub enum BleEvent {
    /// A connection moved to `device.state`.
    ConnectionStateChanged {
        /// Device snapshot after the transition.
        device: Device,
    },
    /// A connect attempt gave up.
    ConnectFailed {
        /// Device snapshot.
        device: Device,
        /// Why.
        error: ConnectError,
    },
    /// A connect attempt exceeded its budget.
    ConnectTimeout {
        /// Device snapshot.
        device: Device,
        /// Phase that timed out.
        kind: TimeoutKind,
    },
    /// The adapter was powered on or off.
    AdapterStateChanged {
        /// New state.
        state: AdapterState,
    },
    /// The scanner found or refreshed a device.
    ScanResult {
        /// Device with the latest advertisement.
        device: Device,
    },
    /// The peripheral notified or indicated a new value.
    CharacteristicChanged {
        /// Source device.
        device: Device,
        /// Service UUID.
        service: Uuid,
        /// Characteristic UUID.
        characteristic: Uuid,
        /// New value.
        value: Vec<u8>,
    },
    /// A characteristic read completed.
    CharacteristicRead {
        /// Originating request.
        info: RequestInfo,
        /// Value read.
        value: Vec<u8>,
    },
    /// A characteristic write completed.
    CharacteristicWrite {
        /// Originating request.
        info: RequestInfo,
        /// Full payload written.
        value: Vec<u8>,
    },
    /// A descriptor read completed.
    DescriptorRead {
        /// Originating request.
        info: RequestInfo,
        /// Value read.
        value: Vec<u8>,
    },
    /// A descriptor write completed.
    DescriptorWrite {
        /// Originating request.
        info: RequestInfo,
        /// Value written.
        value: Vec<u8>,
    },
    /// Notifications or indications were toggled.
    NotificationChanged {
        /// Originating request.
        info: RequestInfo,
        /// Whether they are now enabled.
        enabled: bool,
    },
    /// The link MTU changed.
    MtuChanged {
        /// Originating request.
        info: RequestInfo,
        /// Negotiated MTU.
        mtu: u16,
    },
    /// Remote RSSI was read.
    RssiRead {
        /// Originating request.
        info: RequestInfo,
        /// Signal strength in dBm.
        rssi: i16,
    },
    /// The link PHY changed.
    PhyChanged {
        /// Originating request.
        info: RequestInfo,
        /// Transmit PHY.
        tx: Phy,
        /// Receive PHY.
        rx: Phy,
    },
    /// A request failed.
    RequestFailed {
        /// Originating request.
        info: RequestInfo,
        /// Why.
        error: RequestError,
    },
}

impl BleEvent {
    /// The event's kind.
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::ConnectionStateChanged { .. } => EventKind::ConnectionStateChanged,
            Self::ConnectFailed { .. } => EventKind::ConnectFailed,
            Self::ConnectTimeout { .. } => EventKind::ConnectTimeout,
            Self::AdapterStateChanged { .. } => EventKind::AdapterStateChanged,
            Self::ScanResult { .. } => EventKind::ScanResult,
            Self::CharacteristicChanged { .. } => EventKind::CharacteristicChanged,
            Self::CharacteristicRead { .. } => EventKind::CharacteristicRead,
            Self::CharacteristicWrite { .. } => EventKind::CharacteristicWrite,
            Self::DescriptorRead { .. } => EventKind::DescriptorRead,
            Self::DescriptorWrite { .. } => EventKind::DescriptorWrite,
            Self::NotificationChanged { .. } => EventKind::NotificationChanged,
            Self::MtuChanged { .. } => EventKind::MtuChanged,
            Self::RssiRead { .. } => EventKind::RssiRead,
            Self::PhyChanged { .. } => EventKind::PhyChanged,
            Self::RequestFailed { .. } => EventKind::RequestFailed,
        }
    }

    /// Address of the device the event concerns, if any.
    #[must_use]
    pub fn address(&self) -> Option<&str> {
        match self {
            Self::ConnectionStateChanged { device }
            | Self::ConnectFailed { device, .. }
            | Self::ConnectTimeout { device, .. }
            | Self::ScanResult { device }
            | Self::CharacteristicChanged { device, .. } => Some(device.address()),
            Self::CharacteristicRead { info, .. }
            | Self::CharacteristicWrite { info, .. }
            | Self::DescriptorRead { info, .. }
            | Self::DescriptorWrite { info, .. }
            | Self::NotificationChanged { info, .. }
            | Self::MtuChanged { info, .. }
            | Self::RssiRead { info, .. }
            | Self::PhyChanged { info, .. }
            | Self::RequestFailed { info, .. } => Some(info.device.address()),
            Self::AdapterStateChanged { .. } => None,
        }
    }

    /// Invoke the observer method matching this event.
    pub fn deliver(&self, observer: &dyn EventObserver) {
        match self {
            Self::ConnectionStateChanged { device } => observer.on_connection_state_changed(device),
            Self::ConnectFailed { device, error } => observer.on_connect_failed(device, error),
            Self::ConnectTimeout { device, kind } => observer.on_connect_timeout(device, *kind),
            Self::AdapterStateChanged { state } => observer.on_adapter_state_changed(*state),
            Self::ScanResult { device } => observer.on_scan_result(device),
            Self::CharacteristicChanged {
                device,
                service,
                characteristic,
                value,
            } => observer.on_characteristic_changed(device, *service, *characteristic, value),
            Self::CharacteristicRead { info, value } => observer.on_characteristic_read(info, value),
            Self::CharacteristicWrite { info, value } => {
                observer.on_characteristic_write(info, value);
            }
            Self::DescriptorRead { info, value } => observer.on_descriptor_read(info, value),
            Self::DescriptorWrite { info, value } => observer.on_descriptor_write(info, value),
            Self::NotificationChanged { info, enabled } => {
                observer.on_notification_changed(info, *enabled);
            }
            Self::MtuChanged { info, mtu } => observer.on_mtu_changed(info, *mtu),
            Self::RssiRead { info, rssi } => observer.on_rssi_read(info, *rssi),
            Self::PhyChanged { info, tx, rx } => observer.on_phy_changed(info, *tx, *rx),
            Self::RequestFailed { info, error } => observer.on_request_failed(info, error),
        }
    }
}
