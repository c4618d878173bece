//! GATT requests and their builder.
//!
//! A [`Request`] is an immutable description of one GATT operation plus its
//! timeout, retry and priority policy and an optional completion callback.
//! Requests are only created through [`RequestBuilder`], which checks the
//! required fields for the operation kind and fails with a [`BuildError`]
//! instead of deferring the problem to execution.
//!
//! ```
//! use blelink_core::request::RequestBuilder;
//! use uuid::uuid;
//!
//! let service = uuid!("6e400001-b5a3-f393-e0a9-e50e24dcca9e");
//! let rx = uuid!("6e400002-b5a3-f393-e0a9-e50e24dcca9e");
//!
//! let request = RequestBuilder::write_characteristic(service, rx, vec![0x01, 0x02])
//!     .tag("start")
//!     .retries(1)
//!     .build()
//!     .unwrap();
//! assert_eq!(request.tag(), Some("start"));
//! ```

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::poster::ExecutionContext;
use crate::types::{Device, Phy, PhyOption};

/// Smallest ATT MTU.
pub const MIN_MTU: u16 = 23;

/// Largest ATT MTU.
pub const MAX_MTU: u16 = 517;

/// ATT header bytes subtracted from the MTU to get the payload size.
pub const ATT_HEADER_SIZE: usize = 3;

/// Package size used when nothing else is configured.
pub const DEFAULT_PACKAGE_SIZE: usize = 20;

/// Priority of the connection bootstrap requests.
pub const BOOTSTRAP_PRIORITY: i32 = i32::MAX;

/// Completion callback. Fires exactly once.
pub type RequestCallback =
    Box<dyn FnOnce(&RequestInfo, Result<RequestOutput, RequestError>) + Send + 'static>;

/// Kind of GATT operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    /// Read a characteristic value.
    ReadCharacteristic,
    /// Write a characteristic value.
    WriteCharacteristic,
    /// Read a descriptor value.
    ReadDescriptor,
    /// Write a descriptor value.
    WriteDescriptor,
    /// Enable or disable notifications or indications.
    SetNotification,
    /// Negotiate the ATT MTU.
    ChangeMtu,
    /// Read remote signal strength.
    ReadRssi,
    /// Change the preferred PHY.
    SetPreferredPhy,
}

impl RequestKind {
    /// Stable snake case name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ReadCharacteristic => "read_characteristic",
            Self::WriteCharacteristic => "write_characteristic",
            Self::ReadDescriptor => "read_descriptor",
            Self::WriteDescriptor => "write_descriptor",
            Self::SetNotification => "set_notification",
            Self::ChangeMtu => "change_mtu",
            Self::ReadRssi => "read_rssi",
            Self::SetPreferredPhy => "set_preferred_phy",
        }
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Notifications are unacknowledged, indications are confirmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    /// Unacknowledged value pushes.
    #[default]
    Notification,
    /// Acknowledged value pushes.
    Indication,
}

/// Delivery mode of a characteristic write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    /// Completes on the peripheral's write confirmation.
    #[default]
    WithResponse,
    /// Completes once submitted.
    WithoutResponse,
    /// Authenticated signed write, completes once submitted.
    Signed,
}

impl WriteMode {
    /// Returns `true` if completion waits for a confirmation.
    #[must_use]
    pub const fn is_acknowledged(self) -> bool {
        matches!(self, Self::WithResponse)
    }
}

/// How a characteristic payload is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriteOptions {
    /// Delivery mode.
    pub mode: WriteMode,
    /// Largest package sent in one write.
    pub package_size: usize,
    /// Use `mtu - 3` instead of `package_size`.
    pub use_mtu_as_package_size: bool,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            mode: WriteMode::WithResponse,
            package_size: DEFAULT_PACKAGE_SIZE,
            use_mtu_as_package_size: false,
        }
    }
}

impl WriteOptions {
    /// Options with the given mode and default packaging.
    #[must_use]
    pub fn with_mode(mode: WriteMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    /// Effective package size on a link with `mtu`.
    #[must_use]
    pub fn effective_package_size(&self, mtu: u16) -> usize {
        let size = if self.use_mtu_as_package_size {
            usize::from(mtu).saturating_sub(ATT_HEADER_SIZE)
        } else {
            self.package_size
        };
        size.max(1)
    }
}

/// Operation and its parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// Read a characteristic.
    ReadCharacteristic {
        /// Service UUID.
        service: Uuid,
        /// Characteristic UUID.
        characteristic: Uuid,
    },
    /// Write a characteristic.
    WriteCharacteristic {
        /// Service UUID.
        service: Uuid,
        /// Characteristic UUID.
        characteristic: Uuid,
        /// Full payload.
        value: Vec<u8>,
        /// Delivery options; `None` uses the connection defaults.
        options: Option<WriteOptions>,
    },
    /// Read a descriptor.
    ReadDescriptor {
        /// Service UUID.
        service: Uuid,
        /// Characteristic UUID.
        characteristic: Uuid,
        /// Descriptor UUID.
        descriptor: Uuid,
    },
    /// Write a descriptor.
    WriteDescriptor {
        /// Service UUID.
        service: Uuid,
        /// Characteristic UUID.
        characteristic: Uuid,
        /// Descriptor UUID.
        descriptor: Uuid,
        /// Value.
        value: Vec<u8>,
    },
    /// Toggle notifications or indications.
    SetNotification {
        /// Service UUID.
        service: Uuid,
        /// Characteristic UUID.
        characteristic: Uuid,
        /// Notification or indication.
        kind: NotificationKind,
        /// Enable or disable.
        enable: bool,
    },
    /// Negotiate the MTU.
    ChangeMtu {
        /// Requested MTU.
        mtu: u16,
    },
    /// Read remote RSSI.
    ReadRssi,
    /// Change the preferred PHY.
    SetPreferredPhy {
        /// Transmit PHY.
        tx: Phy,
        /// Receive PHY.
        rx: Phy,
        /// Coding option for LE Coded.
        option: PhyOption,
    },
}

impl Operation {
    /// The operation's kind.
    #[must_use]
    pub const fn kind(&self) -> RequestKind {
        match self {
            Self::ReadCharacteristic { .. } => RequestKind::ReadCharacteristic,
            Self::WriteCharacteristic { .. } => RequestKind::WriteCharacteristic,
            Self::ReadDescriptor { .. } => RequestKind::ReadDescriptor,
            Self::WriteDescriptor { .. } => RequestKind::WriteDescriptor,
            Self::SetNotification { .. } => RequestKind::SetNotification,
            Self::ChangeMtu { .. } => RequestKind::ChangeMtu,
            Self::ReadRssi => RequestKind::ReadRssi,
            Self::SetPreferredPhy { .. } => RequestKind::SetPreferredPhy,
        }
    }

    /// Target service, if any.
    #[must_use]
    pub const fn service(&self) -> Option<Uuid> {
        match self {
            Self::ReadCharacteristic { service, .. }
            | Self::WriteCharacteristic { service, .. }
            | Self::ReadDescriptor { service, .. }
            | Self::WriteDescriptor { service, .. }
            | Self::SetNotification { service, .. } => Some(*service),
            _ => None,
        }
    }

    /// Target characteristic, if any.
    #[must_use]
    pub const fn characteristic(&self) -> Option<Uuid> {
        match self {
            Self::ReadCharacteristic { characteristic, .. }
            | Self::WriteCharacteristic { characteristic, .. }
            | Self::ReadDescriptor { characteristic, .. }
            | Self::WriteDescriptor { characteristic, .. }
            | Self::SetNotification { characteristic, .. } => Some(*characteristic),
            _ => None,
        }
    }

    /// Target descriptor, if any.
    #[must_use]
    pub const fn descriptor(&self) -> Option<Uuid> {
        match self {
            Self::ReadDescriptor { descriptor, .. } | Self::WriteDescriptor { descriptor, .. } => {
                Some(*descriptor)
            }
            _ => None,
        }
    }
}

/// Successful result of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestOutput {
    /// Value read from a characteristic or descriptor.
    Value(Vec<u8>),
    /// Value written to a characteristic or descriptor.
    Written(Vec<u8>),
    /// Notifications are now enabled (`true`) or disabled.
    Notification(bool),
    /// Negotiated MTU.
    Mtu(u16),
    /// Remote RSSI in dBm.
    Rssi(i16),
    /// Active PHYs.
    Phy {
        /// Transmit PHY.
        tx: Phy,
        /// Receive PHY.
        rx: Phy,
    },
}

impl RequestOutput {
    /// The bytes read or written, if this output carries any.
    #[must_use]
    pub fn value(&self) -> Option<&[u8]> {
        match self {
            Self::Value(value) | Self::Written(value) => Some(value),
            _ => None,
        }
    }
}

/// Identity of a request, passed to callbacks and events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestInfo {
    /// Correlation id.
    pub id: Uuid,
    /// Caller-supplied tag.
    pub tag: Option<String>,
    /// Operation kind.
    pub kind: RequestKind,
    /// Device snapshot when the request completed.
    pub device: Device,
    /// Target service.
    pub service: Option<Uuid>,
    /// Target characteristic.
    pub characteristic: Option<Uuid>,
    /// Target descriptor.
    pub descriptor: Option<Uuid>,
}

/// Request execution failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    /// The stack did not complete the operation in time.
    #[error("request timed out")]
    RequestTimeout,

    /// The link is not usable.
    #[error("GATT link unavailable")]
    GattUnavailable,

    /// The connection went away before the request ran.
    #[error("device disconnected")]
    DeviceDisconnected,

    /// The service was not discovered on the device.
    #[error("service not found: {0}")]
    ServiceNotFound(Uuid),

    /// The characteristic was not discovered on the service.
    #[error("characteristic not found: {0}")]
    CharacteristicNotFound(Uuid),

    /// The descriptor was not discovered on the characteristic.
    #[error("descriptor not found: {0}")]
    DescriptorNotFound(Uuid),

    /// The stack refused the operation.
    #[error("request rejected: {0}")]
    Rejected(String),

    /// The peripheral answered with a non-success GATT status.
    #[error("GATT status {0}")]
    GattStatus(u16),

    /// The adapter was powered off.
    #[error("bluetooth adapter disabled")]
    AdapterDisabled,
}

impl RequestError {
    /// Returns `true` if a request's retry budget applies to this failure.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RequestTimeout | Self::Rejected(_) | Self::GattStatus(_)
        )
    }

    /// Machine-readable code.
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::RequestTimeout => "REQUEST_TIMEOUT",
            Self::GattUnavailable => "GATT_UNAVAILABLE",
            Self::DeviceDisconnected => "DEVICE_DISCONNECTED",
            Self::ServiceNotFound(_) => "SERVICE_NOT_FOUND",
            Self::CharacteristicNotFound(_) => "CHARACTERISTIC_NOT_FOUND",
            Self::DescriptorNotFound(_) => "DESCRIPTOR_NOT_FOUND",
            Self::Rejected(_) => "REQUEST_REJECTED",
            Self::GattStatus(_) => "GATT_STATUS",
            Self::AdapterDisabled => "ADAPTER_DISABLED",
        }
    }
}

/// Request construction failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BuildError {
    /// A field required by the operation kind was not set.
    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    /// MTU outside `MIN_MTU..=MAX_MTU`.
    #[error("MTU {0} outside 23..=517")]
    InvalidMtu(u16),

    /// A write with no bytes.
    #[error("write payload is empty")]
    EmptyPayload,

    /// Write options with a zero package size.
    #[error("package size must be at least 1")]
    InvalidPackageSize,

    /// A zero timeout.
    #[error("timeout must be greater than zero")]
    ZeroTimeout,
}

/// One GATT operation with its policy.
pub struct Request {
    id: Uuid,
    tag: Option<String>,
    op: Operation,
    priority: i32,
    timeout: Option<Duration>,
    retries: u32,
    context: Option<ExecutionContext>,
    callback: Option<RequestCallback>,
}

impl Request {
    /// Correlation id.
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Caller tag.
    #[must_use]
    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    /// Operation.
    #[must_use]
    pub const fn operation(&self) -> &Operation {
        &self.op
    }

    /// Operation kind.
    #[must_use]
    pub const fn kind(&self) -> RequestKind {
        self.op.kind()
    }

    /// Queue priority; higher runs first.
    #[must_use]
    pub const fn priority(&self) -> i32 {
        self.priority
    }

    /// Timeout override.
    #[must_use]
    pub const fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Re-executions allowed after a retryable failure.
    #[must_use]
    pub const fn retries(&self) -> u32 {
        self.retries
    }

    /// Context the callback runs on.
    #[must_use]
    pub const fn execution_context(&self) -> Option<ExecutionContext> {
        self.context
    }

    /// Returns `true` if completion is delivered to a callback instead of a
    /// broadcast.
    #[must_use]
    pub const fn has_callback(&self) -> bool {
        self.callback.is_some()
    }

    /// Identity of this request on `device`.
    #[must_use]
    pub fn info(&self, device: &Device) -> RequestInfo {
        RequestInfo {
            id: self.id,
            tag: self.tag.clone(),
            kind: self.op.kind(),
            device: device.clone(),
            service: self.op.service(),
            characteristic: self.op.characteristic(),
            descriptor: self.op.descriptor(),
        }
    }

    pub(crate) fn take_callback(&mut self) -> Option<RequestCallback> {
        self.callback.take()
    }

    pub(crate) fn consume_retry(&mut self) -> bool {
        if self.retries == 0 {
            return false;
        }
        self.retries -= 1;
        true
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.id)
            .field("tag", &self.tag)
            .field("op", &self.op)
            .field("priority", &self.priority)
            .field("timeout", &self.timeout)
            .field("retries", &self.retries)
            .field("context", &self.context)
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

/// Builds a [`Request`].
#[must_use]
pub struct RequestBuilder {
    kind: RequestKind,
    service: Option<Uuid>,
    characteristic: Option<Uuid>,
    descriptor: Option<Uuid>,
    value: Option<Vec<u8>>,
    write_options: Option<WriteOptions>,
    notification_kind: NotificationKind,
    enable: Option<bool>,
    mtu: Option<u16>,
    phy: Option<(Phy, Phy, PhyOption)>,
    tag: Option<String>,
    priority: i32,
    timeout: Option<Duration>,
    retries: u32,
    context: Option<ExecutionContext>,
    callback: Option<RequestCallback>,
}

impl RequestBuilder {
    /// An empty builder for `kind`.
    pub const fn new(kind: RequestKind) -> Self {
        Self {
            kind,
            service: None,
            characteristic: None,
            descriptor: None,
            value: None,
            write_options: None,
            notification_kind: NotificationKind::Notification,
            enable: None,
            mtu: None,
            phy: None,
            tag: None,
            priority: 0,
            timeout: None,
            retries: 0,
            context: None,
            callback: None,
        }
    }

    /// Read `characteristic` of `service`.
    pub const fn read_characteristic(service: Uuid, characteristic: Uuid) -> Self {
        Self::new(RequestKind::ReadCharacteristic)
            .service(service)
            .characteristic(characteristic)
    }

    /// Write `value` to `characteristic` of `service`.
    pub fn write_characteristic(service: Uuid, characteristic: Uuid, value: impl Into<Vec<u8>>) -> Self {
        Self::new(RequestKind::WriteCharacteristic)
            .service(service)
            .characteristic(characteristic)
            .value(value)
    }

    /// Read `descriptor`.
    pub const fn read_descriptor(service: Uuid, characteristic: Uuid, descriptor: Uuid) -> Self {
        Self::new(RequestKind::ReadDescriptor)
            .service(service)
            .characteristic(characteristic)
            .descriptor(descriptor)
    }

    /// Write `value` to `descriptor`.
    pub fn write_descriptor(
        service: Uuid,
        characteristic: Uuid,
        descriptor: Uuid,
        value: impl Into<Vec<u8>>,
    ) -> Self {
        Self::new(RequestKind::WriteDescriptor)
            .service(service)
            .characteristic(characteristic)
            .descriptor(descriptor)
            .value(value)
    }

    /// Enable or disable notifications.
    pub const fn set_notification(service: Uuid, characteristic: Uuid, enable: bool) -> Self {
        Self::new(RequestKind::SetNotification)
            .service(service)
            .characteristic(characteristic)
            .enable(enable)
    }

    /// Enable or disable indications.
    pub const fn set_indication(service: Uuid, characteristic: Uuid, enable: bool) -> Self {
        Self::set_notification(service, characteristic, enable)
            .notification_kind(NotificationKind::Indication)
    }

    /// Negotiate `mtu`.
    pub const fn change_mtu(mtu: u16) -> Self {
        Self::new(RequestKind::ChangeMtu).mtu(mtu)
    }

    /// Read remote RSSI.
    pub const fn read_rssi() -> Self {
        Self::new(RequestKind::ReadRssi)
    }

    /// Request a PHY.
    pub const fn set_preferred_phy(tx: Phy, rx: Phy, option: PhyOption) -> Self {
        Self::new(RequestKind::SetPreferredPhy).phy(tx, rx, option)
    }

    /// Target service.
    pub const fn service(mut self, service: Uuid) -> Self {
        self.service = Some(service);
        self
    }

    /// Target characteristic.
    pub const fn characteristic(mut self, characteristic: Uuid) -> Self {
        self.characteristic = Some(characteristic);
        self
    }

    /// Target descriptor.
    pub const fn descriptor(mut self, descriptor: Uuid) -> Self {
        self.descriptor = Some(descriptor);
        self
    }

    /// Payload for writes.
    pub fn value(mut self, value: impl Into<Vec<u8>>) -> Self {
        self.value = Some(value.into());
        self
    }

    /// Write delivery options.
    pub const fn write_options(mut self, options: WriteOptions) -> Self {
        self.write_options = Some(options);
        self
    }

    /// Notification or indication.
    pub const fn notification_kind(mut self, kind: NotificationKind) -> Self {
        self.notification_kind = kind;
        self
    }

    /// Enable or disable for notification requests.
    pub const fn enable(mut self, enable: bool) -> Self {
        self.enable = Some(enable);
        self
    }

    /// MTU for MTU requests.
    pub const fn mtu(mut self, mtu: u16) -> Self {
        self.mtu = Some(mtu);
        self
    }

    /// PHY preference for PHY requests.
    pub const fn phy(mut self, tx: Phy, rx: Phy, option: PhyOption) -> Self {
        self.phy = Some((tx, rx, option));
        self
    }

    /// Correlation tag.
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    /// Queue priority; higher runs first, equal priorities stay FIFO.
    pub const fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Override the connection's request timeout.
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Re-executions after a retryable failure.
    pub const fn retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Context the callback runs on.
    pub const fn execution_context(mut self, context: ExecutionContext) -> Self {
        self.context = Some(context);
        self
    }

    /// Completion callback.
    pub fn callback(
        mut self,
        callback: impl FnOnce(&RequestInfo, Result<RequestOutput, RequestError>) + Send + 'static,
    ) -> Self {
        self.callback = Some(Box::new(callback));
        self
    }

    /// Validate and build.
    ///
    /// # Errors
    ///
    /// Returns a [`BuildError`] naming the first missing or invalid field.
    pub fn build(self) -> Result<Request, BuildError> {
        if self.timeout.is_some_and(|t| t.is_zero()) {
            return Err(BuildError::ZeroTimeout);
        }

        let op = match self.kind {
            RequestKind::ReadCharacteristic => Operation::ReadCharacteristic {
                service: required(self.service, "service")?,
                characteristic: required(self.characteristic, "characteristic")?,
            },
            RequestKind::WriteCharacteristic => {
                if self.write_options.is_some_and(|o| o.package_size == 0) {
                    return Err(BuildError::InvalidPackageSize);
                }
                Operation::WriteCharacteristic {
                    service: required(self.service, "service")?,
                    characteristic: required(self.characteristic, "characteristic")?,
                    value: payload(self.value)?,
                    options: self.write_options,
                }
            }
            RequestKind::ReadDescriptor => Operation::ReadDescriptor {
                service: required(self.service, "service")?,
                characteristic: required(self.characteristic, "characteristic")?,
                descriptor: required(self.descriptor, "descriptor")?,
            },
            RequestKind::WriteDescriptor => Operation::WriteDescriptor {
                service: required(self.service, "service")?,
                characteristic: required(self.characteristic, "characteristic")?,
                descriptor: required(self.descriptor, "descriptor")?,
                value: payload(self.value)?,
            },
            RequestKind::SetNotification => Operation::SetNotification {
                service: required(self.service, "service")?,
                characteristic: required(self.characteristic, "characteristic")?,
                kind: self.notification_kind,
                enable: required(self.enable, "enable")?,
            },
            RequestKind::ChangeMtu => {
                let mtu = required(self.mtu, "mtu")?;
                if !(MIN_MTU..=MAX_MTU).contains(&mtu) {
                    return Err(BuildError::InvalidMtu(mtu));
                }
                Operation::ChangeMtu { mtu }
            }
            RequestKind::ReadRssi => Operation::ReadRssi,
            RequestKind::SetPreferredPhy => {
                let (tx, rx, option) = required(self.phy, "phy")?;
                Operation::SetPreferredPhy { tx, rx, option }
            }
        };

        Ok(Request {
            id: Uuid::now_v7(),
            tag: self.tag,
            op,
            priority: self.priority,
            timeout: self.timeout,
            retries: self.retries,
            context: self.context,
            callback: self.callback,
        })
    }
}

fn required<T>(value: Option<T>, field: &'static str) -> Result<T, BuildError> {
    value.ok_or(BuildError::MissingField(field))
}

fn payload(value: Option<Vec<u8>>) -> Result<Vec<u8>, BuildError> {
    let value = required(value, "value")?;
    if value.is_empty() {
        return Err(BuildError::EmptyPayload);
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::uuid;

    const SERVICE: Uuid = uuid!("6e400001-b5a3-f393-e0a9-e50e24dcca9e");
    const RX: Uuid = uuid!("6e400002-b5a3-f393-e0a9-e50e24dcca9e");

    #[test]
    fn test_write_requires_payload() {
        let err = RequestBuilder::new(RequestKind::WriteCharacteristic)
            .service(SERVICE)
            .characteristic(RX)
            .build()
            .unwrap_err();
        assert_eq!(err, BuildError::MissingField("value"));

        let err = RequestBuilder::write_characteristic(SERVICE, RX, Vec::new())
            .build()
            .unwrap_err();
        assert_eq!(err, BuildError::EmptyPayload);
    }

    #[test]
    fn test_write_requires_target() {
        let err = RequestBuilder::new(RequestKind::WriteCharacteristic)
            .value([1u8])
            .build()
            .unwrap_err();
        assert_eq!(err, BuildError::MissingField("service"));

        let err = RequestBuilder::new(RequestKind::WriteCharacteristic)
            .service(SERVICE)
            .value([1u8])
            .build()
            .unwrap_err();
        assert_eq!(err, BuildError::MissingField("characteristic"));
    }

    #[test]
    fn test_descriptor_requires_descriptor() {
        let err = RequestBuilder::new(RequestKind::ReadDescriptor)
            .service(SERVICE)
            .characteristic(RX)
            .build()
            .unwrap_err();
        assert_eq!(err, BuildError::MissingField("descriptor"));
    }

    #[test]
    fn test_mtu_bounds() {
        assert_eq!(
            RequestBuilder::change_mtu(22).build().unwrap_err(),
            BuildError::InvalidMtu(22)
        );
        assert_eq!(
            RequestBuilder::change_mtu(518).build().unwrap_err(),
            BuildError::InvalidMtu(518)
        );
        let request = RequestBuilder::change_mtu(247).build().unwrap();
        assert_eq!(request.operation(), &Operation::ChangeMtu { mtu: 247 });
    }

    #[test]
    fn test_notification_requires_enable() {
        let err = RequestBuilder::new(RequestKind::SetNotification)
            .service(SERVICE)
            .characteristic(RX)
            .build()
            .unwrap_err();
        assert_eq!(err, BuildError::MissingField("enable"));

        let request = RequestBuilder::set_indication(SERVICE, RX, true).build().unwrap();
        assert!(matches!(
            request.operation(),
            Operation::SetNotification {
                kind: NotificationKind::Indication,
                enable: true,
                ..
            }
        ));
    }

    #[test]
    fn test_zero_package_size_rejected() {
        let options = WriteOptions {
            package_size: 0,
            ..WriteOptions::default()
        };
        let err = RequestBuilder::write_characteristic(SERVICE, RX, [1u8])
            .write_options(options)
            .build()
            .unwrap_err();
        assert_eq!(err, BuildError::InvalidPackageSize);
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let err = RequestBuilder::read_rssi()
            .timeout(Duration::ZERO)
            .build()
            .unwrap_err();
        assert_eq!(err, BuildError::ZeroTimeout);
    }

    #[test]
    fn test_request_info() {
        let request = RequestBuilder::read_characteristic(SERVICE, RX)
            .tag("battery")
            .priority(5)
            .retries(2)
            .build()
            .unwrap();
        let device = Device::new("AA:BB:CC:DD:EE:FF").unwrap();
        let info = request.info(&device);

        assert_eq!(info.id, request.id());
        assert_eq!(info.tag.as_deref(), Some("battery"));
        assert_eq!(info.kind, RequestKind::ReadCharacteristic);
        assert_eq!(info.service, Some(SERVICE));
        assert_eq!(info.characteristic, Some(RX));
        assert_eq!(info.descriptor, None);
        assert_eq!(request.priority(), 5);
        assert!(!request.has_callback());
    }

    #[test]
    fn test_consume_retry() {
        let mut request = RequestBuilder::read_rssi().retries(1).build().unwrap();
        assert!(request.consume_retry());
        assert!(!request.consume_retry());
    }

    #[test]
    fn test_effective_package_size() {
        let options = WriteOptions::default();
        assert_eq!(options.effective_package_size(247), DEFAULT_PACKAGE_SIZE);

        let options = WriteOptions {
            use_mtu_as_package_size: true,
            ..WriteOptions::default()
        };
        assert_eq!(options.effective_package_size(247), 244);
        assert_eq!(options.effective_package_size(MIN_MTU), 20);
    }

    #[test]
    fn test_retryable_errors() {
        assert!(RequestError::RequestTimeout.is_retryable());
        assert!(RequestError::GattStatus(133).is_retryable());
        assert!(RequestError::Rejected("busy".into()).is_retryable());
        assert!(!RequestError::DeviceDisconnected.is_retryable());
        assert!(!RequestError::CharacteristicNotFound(RX).is_retryable());
    }
}
