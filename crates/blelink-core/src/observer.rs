//! The observer capability interface.
//!
//! An observer implements one method per event kind; every method has a no-op
//! default so implementors override only what they care about. Which kinds an
//! observer receives, and on which execution context, is declared by
//! [`EventObserver::subscriptions`] and [`EventObserver::execution_context`].
//! Both are read once per observer *type* and cached by the dispatcher, so they
//! must not depend on instance state.

use uuid::Uuid;

use crate::connection::ConnectError;
use crate::event::EventKind;
use crate::poster::ExecutionContext;
use crate::request::{RequestError, RequestInfo};
use crate::types::{AdapterState, Device, Phy, TimeoutKind};

/// Receives library events.
#[allow(unused_variables)]
pub trait EventObserver: Send + Sync + 'static {
    /// A connection changed state; `device.state` is the new state.
    fn on_connection_state_changed(&self, device: &Device) {}

    /// A connect attempt gave up.
    fn on_connect_failed(&self, device: &Device, error: &ConnectError) {}

    /// A connect attempt timed out.
    fn on_connect_timeout(&self, device: &Device, kind: TimeoutKind) {}

    /// The adapter was powered on or off.
    fn on_adapter_state_changed(&self, state: AdapterState) {}

    /// The scanner reported a device.
    fn on_scan_result(&self, device: &Device) {}

    /// A notification or indication arrived.
    fn on_characteristic_changed(
        &self,
        device: &Device,
        service: Uuid,
        characteristic: Uuid,
        value: &[u8],
    ) {
    }

    /// A characteristic read completed.
    fn on_characteristic_read(&self, info: &RequestInfo, value: &[u8]) {}

    /// A characteristic write completed.
    fn on_characteristic_write(&self, info: &RequestInfo, value: &[u8]) {}

    /// A descriptor read completed.
    fn on_descriptor_read(&self, info: &RequestInfo, value: &[u8]) {}

    /// A descriptor write completed.
    fn on_descriptor_write(&self, info: &RequestInfo, value: &[u8]) {}

    /// Notifications were toggled.
    fn on_notification_changed(&self, info: &RequestInfo, enabled: bool) {}

    /// The MTU changed.
    fn on_mtu_changed(&self, info: &RequestInfo, mtu: u16) {}

    /// RSSI was read.
    fn on_rssi_read(&self, info: &RequestInfo, rssi: i16) {}

    /// The PHY changed.
    fn on_phy_changed(&self, info: &RequestInfo, tx: Phy, rx: Phy) {}

    /// A request failed.
    fn on_request_failed(&self, info: &RequestInfo, error: &RequestError) {}

    /// Whether this observer type wants `kind` at all.
    ///
    /// Asked of the first registered instance only; the answer is cached
    /// for the type and must not depend on instance state.
    fn subscriptions(&self, kind: EventKind) -> bool {
        true
    }

    /// Context override for `kind`; `None` uses the poster's default.
    ///
    /// Cached per type like [`subscriptions`](Self::subscriptions).
    fn execution_context(&self, kind: EventKind) -> Option<ExecutionContext> {
        None
    }
}
