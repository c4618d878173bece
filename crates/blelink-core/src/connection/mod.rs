//! Per-device connection state machine.
//!
//! Every [`Connection`] is driven by one actor task that owns the link, the
//! request queue and all timers. The handle only sends commands to it, so
//! the queue is never touched from two places at once and at most one
//! request is in flight per link. Results are delivered through the
//! request's callback, or broadcast to registered observers when it has
//! none.

mod actor;
mod queue;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{info_span, trace, warn, Instrument};
use uuid::Uuid;

use crate::config::ConnectionConfiguration;
use crate::dispatch::{DirectObserver, Dispatcher};
use crate::event::BleEvent;
use crate::radio::{CharacteristicProperties, GattService, RadioStack};
use crate::request::{
    Request, RequestBuilder, RequestError, RequestInfo, RequestKind, RequestOutput, MIN_MTU,
};
use crate::scanner::Scanner;
use crate::types::{ConnectionState, Device, TimeoutKind};

/// Why a connect sequence gave up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConnectError {
    /// A connect phase exceeded the connect timeout.
    #[error("connect timed out: {0}")]
    ConnectTimeout(TimeoutKind),

    /// The radio stack refused to open a link.
    #[error("radio stack unavailable")]
    StackUnavailable,

    /// Service discovery failed.
    #[error("service discovery failed")]
    ServiceDiscoveryFailed,

    /// The reconnect budget is exhausted.
    #[error("maximum reconnection attempts reached")]
    MaximumReconnection,

    /// The device advertises as non-connectable.
    #[error("device is not connectable")]
    Unconnectable,
}

impl ConnectError {
    /// Machine-readable code.
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::ConnectTimeout(_) => "CONNECT_TIMEOUT",
            Self::StackUnavailable => "STACK_UNAVAILABLE",
            Self::ServiceDiscoveryFailed => "SERVICE_DISCOVERY_FAILED",
            Self::MaximumReconnection => "MAXIMUM_RECONNECTION",
            Self::Unconnectable => "UNCONNECTABLE",
        }
    }
}

pub(crate) enum Command {
    Execute(Request),
    Disconnect,
    Reconnect,
    Release { quiet: bool },
    ClearQueue(Option<RequestKind>),
    AdapterOff,
    AdapterOn,
    DeviceFound(Device),
}

/// Collaborators a connection actor needs.
pub(crate) struct ConnectionContext {
    pub radio: Arc<dyn RadioStack>,
    pub scanner: Arc<dyn Scanner>,
    pub dispatcher: Arc<Dispatcher>,
    pub handle: Handle,
}

/// State readable from any handle without a round trip to the actor.
pub(crate) struct Shared {
    address: String,
    device: RwLock<Device>,
    mtu: AtomicU16,
    services: RwLock<Vec<GattService>>,
    notifications: RwLock<HashSet<(Uuid, Uuid)>>,
    released: AtomicBool,
    affinity: u64,
    dispatcher: Arc<Dispatcher>,
    observer: Option<DirectObserver>,
}

impl Shared {
    fn device(&self) -> Device {
        self.device.read().clone()
    }

    fn state(&self) -> ConnectionState {
        self.device.read().state
    }

    /// Broadcast to registered observers and the connection's own observer.
    fn emit(&self, event: BleEvent) {
        let event = Arc::new(event);
        if let Some(observer) = &self.observer {
            self.dispatcher.post_to(observer, &event);
        }
        self.dispatcher.broadcast_shared(&event);
    }

    /// Finish `request`. The callback wins over the broadcast; the
    /// connection's own observer always hears about it.
    fn complete(&self, mut request: Request, result: Result<RequestOutput, RequestError>) {
        let info = request.info(&self.device());
        match &result {
            Ok(output) => trace!(
                request = %info.kind,
                value = %output.value().map(hex::encode).unwrap_or_default(),
                "request completed"
            ),
            Err(err) => warn!(request = %info.kind, error = %err, "request failed"),
        }

        let event = Arc::new(completion_event(&info, &result));
        if let Some(observer) = &self.observer {
            self.dispatcher.post_to(observer, &event);
        }
        match request.take_callback() {
            Some(callback) => {
                self.dispatcher.post(
                    request.execution_context(),
                    self.affinity,
                    Box::new(move || callback(&info, result)),
                );
            }
            None => self.dispatcher.broadcast_shared(&event),
        }
    }
}

fn completion_event(info: &RequestInfo, result: &Result<RequestOutput, RequestError>) -> BleEvent {
    let info = info.clone();
    match result {
        Err(error) => BleEvent::RequestFailed {
            info,
            error: error.clone(),
        },
        Ok(RequestOutput::Value(value)) if info.kind == RequestKind::ReadDescriptor => {
            BleEvent::DescriptorRead {
                info,
                value: value.clone(),
            }
        }
        Ok(RequestOutput::Value(value)) => BleEvent::CharacteristicRead {
            info,
            value: value.clone(),
        },
        Ok(RequestOutput::Written(value)) if info.kind == RequestKind::WriteDescriptor => {
            BleEvent::DescriptorWrite {
                info,
                value: value.clone(),
            }
        }
        Ok(RequestOutput::Written(value)) => BleEvent::CharacteristicWrite {
            info,
            value: value.clone(),
        },
        Ok(RequestOutput::Notification(enabled)) => BleEvent::NotificationChanged {
            info,
            enabled: *enabled,
        },
        Ok(RequestOutput::Mtu(mtu)) => BleEvent::MtuChanged { info, mtu: *mtu },
        Ok(RequestOutput::Rssi(rssi)) => BleEvent::RssiRead { info, rssi: *rssi },
        Ok(RequestOutput::Phy { tx, rx }) => BleEvent::PhyChanged {
            info,
            tx: *tx,
            rx: *rx,
        },
    }
}

/// Handle to one device's connection. Cheap to clone.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
    config: Arc<ConnectionConfiguration>,
}

impl Connection {
    /// Spawn the actor and begin connecting after `start_delay`.
    pub(crate) fn spawn(
        device: Device,
        config: Arc<ConnectionConfiguration>,
        context: ConnectionContext,
        observer: Option<DirectObserver>,
        affinity: u64,
        start_delay: std::time::Duration,
    ) -> Self {
        let address = device.address().to_string();
        let shared = Arc::new(Shared {
            address: address.clone(),
            device: RwLock::new(device),
            mtu: AtomicU16::new(MIN_MTU),
            services: RwLock::new(Vec::new()),
            notifications: RwLock::new(HashSet::new()),
            released: AtomicBool::new(false),
            affinity,
            dispatcher: Arc::clone(&context.dispatcher),
            observer,
        });
        let (commands, rx) = mpsc::unbounded_channel();

        let handle = context.handle.clone();
        let actor = actor::Actor::new(
            Arc::clone(&shared),
            Arc::clone(&config),
            context,
            commands.downgrade(),
        );
        handle.spawn(
            actor
                .run(rx, start_delay)
                .instrument(info_span!("connection", address = %address)),
        );

        Self {
            shared,
            commands,
            config,
        }
    }

    /// Hardware address.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.shared.address
    }

    /// Snapshot of the device, including its current state.
    #[must_use]
    pub fn device(&self) -> Device {
        self.shared.device()
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Returns `true` while the link is up.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state().is_link_up()
    }

    /// Returns `true` once services are discovered and requests run.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.state().is_ready()
    }

    /// Returns `true` after release.
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.shared.released.load(Ordering::Acquire)
    }

    /// Negotiated MTU, or the ATT minimum before negotiation.
    #[must_use]
    pub fn mtu(&self) -> u16 {
        self.shared.mtu.load(Ordering::Acquire)
    }

    /// The frozen configuration.
    #[must_use]
    pub fn configuration(&self) -> &ConnectionConfiguration {
        &self.config
    }

    /// Whether link loss triggers reconnection.
    #[must_use]
    pub fn is_auto_reconnect_enabled(&self) -> bool {
        self.config.auto_reconnect
    }

    /// Services from the last discovery.
    #[must_use]
    pub fn services(&self) -> Vec<GattService> {
        self.shared.services.read().clone()
    }

    /// Returns `true` if the characteristic has every bit of `property`.
    #[must_use]
    pub fn has_property(
        &self,
        service: Uuid,
        characteristic: Uuid,
        property: CharacteristicProperties,
    ) -> bool {
        self.shared
            .services
            .read()
            .iter()
            .find(|s| s.uuid == service)
            .and_then(|s| s.characteristic(characteristic))
            .is_some_and(|c| c.properties.contains(property))
    }

    /// Returns `true` if notifications or indications are enabled.
    #[must_use]
    pub fn is_notification_enabled(&self, service: Uuid, characteristic: Uuid) -> bool {
        self.shared
            .notifications
            .read()
            .contains(&(service, characteristic))
    }

    /// Queue a request. It fails with `DeviceDisconnected` if the connection
    /// is released or disconnected with no connect pending.
    pub fn execute(&self, request: Request) {
        if self.is_released() {
            self.shared
                .complete(request, Err(RequestError::DeviceDisconnected));
            return;
        }
        if let Err(mpsc::error::SendError(Command::Execute(request))) =
            self.commands.send(Command::Execute(request))
        {
            self.shared
                .complete(request, Err(RequestError::DeviceDisconnected));
        }
    }

    /// Write `value` to the telemetry write characteristic. Returns `false`
    /// if the connection is not ready to accept it.
    pub fn write_characteristic(&self, value: &[u8]) -> bool {
        if value.is_empty() || self.is_released() || !self.is_ready() {
            return false;
        }
        let telemetry = &self.config.telemetry;
        match RequestBuilder::write_characteristic(
            telemetry.service,
            telemetry.write_characteristic,
            value,
        )
        .build()
        {
            Ok(request) => {
                self.execute(request);
                true
            }
            Err(_) => false,
        }
    }

    /// Disconnect without reconnecting. Idempotent.
    pub fn disconnect(&self) {
        let _ = self.commands.send(Command::Disconnect);
    }

    /// Reset reconnect counters and restart the connect sequence.
    pub fn reconnect(&self) {
        let _ = self.commands.send(Command::Reconnect);
    }

    /// Tear down and fail every pending request. Terminal.
    pub fn release(&self) {
        self.send_release(false);
    }

    /// Release without broadcasting the `RELEASED` transition.
    pub fn release_quietly(&self) {
        self.send_release(true);
    }

    fn send_release(&self, quiet: bool) {
        if !self.shared.released.swap(true, Ordering::AcqRel) {
            let _ = self.commands.send(Command::Release { quiet });
        }
    }

    /// Cancel every queued request that has not started.
    pub fn clear_request_queue(&self) {
        let _ = self.commands.send(Command::ClearQueue(None));
    }

    /// Cancel queued requests of one kind.
    pub fn clear_request_queue_by_kind(&self, kind: RequestKind) {
        let _ = self.commands.send(Command::ClearQueue(Some(kind)));
    }

    pub(crate) fn adapter_changed(&self, on: bool) {
        let _ = self
            .commands
            .send(if on { Command::AdapterOn } else { Command::AdapterOff });
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("address", &self.shared.address)
            .field("state", &self.state())
            .field("mtu", &self.mtu())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_error_codes() {
        assert_eq!(
            ConnectError::ConnectTimeout(TimeoutKind::CannotConnect).error_code(),
            "CONNECT_TIMEOUT"
        );
        assert_eq!(ConnectError::Unconnectable.error_code(), "UNCONNECTABLE");
    }

    #[test]
    fn test_completion_event_mapping() {
        let device = Device::new("AA:BB:CC:DD:EE:FF").unwrap();
        let request = RequestBuilder::read_descriptor(Uuid::nil(), Uuid::nil(), Uuid::nil())
            .build()
            .unwrap();
        let info = request.info(&device);

        let event = completion_event(&info, &Ok(RequestOutput::Value(vec![1])));
        assert!(matches!(event, BleEvent::DescriptorRead { .. }));

        let event = completion_event(&info, &Err(RequestError::RequestTimeout));
        assert!(matches!(
            event,
            BleEvent::RequestFailed {
                error: RequestError::RequestTimeout,
                ..
            }
        ));
    }
}
