use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use super::queue::RequestQueue;
use super::{Command, ConnectError, ConnectionContext, Shared};
use crate::config::{ConnectionConfiguration, ScanFilters};
use crate::event::BleEvent;
use crate::radio::{
    GattCharacteristic, GattLink, GattService, LinkEvent, RadioStack, StackError, CCCD_UUID,
    DISABLE_NOTIFICATION_VALUE, ENABLE_INDICATION_VALUE, ENABLE_NOTIFICATION_VALUE, GATT_ERROR,
    GATT_SUCCESS,
};
use crate::request::{
    NotificationKind, Operation, Request, RequestBuilder, RequestError, RequestOutput,
    WriteOptions, BOOTSTRAP_PRIORITY, MIN_MTU,
};
use crate::scanner::advertisement::ParsedAdvertisement;
use crate::scanner::{ScanListener, Scanner};
use crate::types::{AdapterState, ConnectionState, Device, TimeoutKind};

type CommandSender = mpsc::WeakUnboundedSender<Command>;

/// The request currently on the link.
struct InFlight {
    request: Request,
    /// Write packages not yet submitted.
    packages: VecDeque<Vec<u8>>,
}

/// Outcome of submitting a request to the link.
enum Submitted {
    /// Wait for a completion event.
    Pending(VecDeque<Vec<u8>>),
    /// Already complete.
    Done(RequestOutput),
}

enum Flow {
    Continue,
    Stop,
}

pub(super) struct Actor {
    shared: Arc<Shared>,
    config: Arc<ConnectionConfiguration>,
    radio: Arc<dyn RadioStack>,
    scanner: Arc<dyn Scanner>,
    commands: CommandSender,

    link: Option<Arc<dyn GattLink>>,
    link_events: Option<mpsc::UnboundedReceiver<LinkEvent>>,
    queue: RequestQueue,
    current: Option<InFlight>,

    request_deadline: Option<Instant>,
    connect_started: Option<Instant>,
    connect_at: Option<Instant>,
    discover_at: Option<Instant>,

    try_count: u32,
    immediate_count: u32,
    active_disconnect: bool,
    reconnect_listener: Option<Arc<dyn ScanListener>>,
    started_scan: bool,
}

impl Actor {
    pub(super) fn new(
        shared: Arc<Shared>,
        config: Arc<ConnectionConfiguration>,
        context: ConnectionContext,
        commands: CommandSender,
    ) -> Self {
        Self {
            shared,
            config,
            radio: context.radio,
            scanner: context.scanner,
            commands,
            link: None,
            link_events: None,
            queue: RequestQueue::default(),
            current: None,
            request_deadline: None,
            connect_started: None,
            connect_at: None,
            discover_at: None,
            try_count: 0,
            immediate_count: 0,
            active_disconnect: false,
            reconnect_listener: None,
            started_scan: false,
        }
    }

    pub(super) async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        start_delay: Duration,
    ) {
        if start_delay.is_zero() {
            self.connect_now();
        } else {
            debug!(delay_ms = start_delay.as_millis(), "connect deferred");
            self.connect_at = Some(Instant::now() + start_delay);
        }

        loop {
            let deadline = self.next_deadline();
            let flow = tokio::select! {
                biased;
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => {
                        self.release(true);
                        Flow::Stop
                    }
                },
                event = recv_link(&mut self.link_events) => {
                    self.handle_link_event(event);
                    Flow::Continue
                }
                () = sleep_until_opt(deadline) => {
                    self.on_deadline();
                    Flow::Continue
                }
            };
            if matches!(flow, Flow::Stop) {
                break;
            }
        }

        commands.close();
        while let Ok(command) = commands.try_recv() {
            if let Command::Execute(request) = command {
                self.shared
                    .complete(request, Err(RequestError::DeviceDisconnected));
            }
        }
    }

    // ===== State =====

    fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    fn set_state(&self, next: ConnectionState) {
        if let Some(device) = self.apply_state(next) {
            self.emit(BleEvent::ConnectionStateChanged { device });
        }
    }

    /// Store `next` and return the updated device, or `None` if unchanged.
    fn apply_state(&self, next: ConnectionState) -> Option<Device> {
        let mut device = self.shared.device.write();
        let current = device.state;
        if current == next {
            return None;
        }
        if !current.can_transition_to(next) {
            warn!(from = %current, to = %next, "illegal connection state transition");
        }
        device.state = next;
        debug!(from = %current, to = %next, "connection state changed");
        Some(device.clone())
    }

    fn emit(&self, event: BleEvent) {
        self.shared.emit(event);
    }

    fn connect_failed(&self, error: ConnectError) {
        error!(error = %error, "connect failed");
        self.emit(BleEvent::ConnectFailed {
            device: self.shared.device(),
            error,
        });
    }

    fn adapter_on(&self) -> bool {
        self.radio.adapter_state() == AdapterState::On
    }

    fn budget_exhausted(&self) -> bool {
        self.config
            .try_reconnect_max_times
            .is_some_and(|max| self.try_count >= max)
    }

    fn should_reconnect(&self) -> bool {
        self.config.auto_reconnect && !self.active_disconnect
    }

    // ===== Timers =====

    fn connect_deadline(&self) -> Option<Instant> {
        let started = self.connect_started?;
        matches!(
            self.state(),
            ConnectionState::Connecting
                | ConnectionState::ScanningForReconnection
                | ConnectionState::Connected
                | ConnectionState::ServiceDiscovering
        )
        .then(|| started + self.config.connect_timeout)
    }

    fn next_deadline(&self) -> Option<Instant> {
        [
            self.connect_at,
            self.discover_at,
            self.connect_deadline(),
            self.request_deadline,
        ]
        .into_iter()
        .flatten()
        .min()
    }

    fn on_deadline(&mut self) {
        let now = Instant::now();
        if self.connect_at.is_some_and(|at| at <= now) {
            self.connect_at = None;
            self.connect_now();
        } else if self.discover_at.is_some_and(|at| at <= now) {
            self.discover_at = None;
            self.discover_services();
        } else if self.connect_deadline().is_some_and(|at| at <= now) {
            self.on_connect_timeout();
        } else if self.request_deadline.is_some_and(|at| at <= now) {
            self.on_request_timeout();
        }
    }

    // ===== Commands =====

    fn handle_command(&mut self, command: Command) -> Flow {
        match command {
            Command::Execute(request) => self.enqueue(request),
            Command::Disconnect => {
                info!("disconnect requested");
                self.active_disconnect = true;
                self.disconnect_internal(false, false);
            }
            Command::Reconnect => {
                info!("reconnect requested");
                self.active_disconnect = false;
                self.try_count = 0;
                self.immediate_count = 0;
                self.disconnect_internal(true, true);
            }
            Command::Release { quiet } => {
                self.release(quiet);
                return Flow::Stop;
            }
            Command::ClearQueue(kind) => {
                let removed = self.queue.remove(kind);
                debug!(count = removed.len(), kind = ?kind, "request queue cleared");
                for request in removed {
                    self.shared
                        .complete(request, Err(RequestError::DeviceDisconnected));
                }
            }
            Command::AdapterOff => self.on_adapter_off(),
            Command::AdapterOn => {
                if self.should_reconnect() && self.state() == ConnectionState::Disconnected {
                    self.try_count = 0;
                    self.immediate_count = 0;
                    self.disconnect_internal(true, true);
                }
            }
            Command::DeviceFound(device) => self.on_device_found(&device),
        }
        Flow::Continue
    }

    fn enqueue(&mut self, request: Request) {
        let idle = self.state() == ConnectionState::Disconnected && self.connect_at.is_none();
        if idle {
            self.shared
                .complete(request, Err(RequestError::DeviceDisconnected));
            return;
        }
        trace!(request = %request.kind(), queued = self.queue.len(), "request queued");
        self.queue.push(request);
        self.pump();
    }

    fn release(&mut self, quiet: bool) {
        self.shared.released.store(true, Ordering::Release);
        self.flush(&RequestError::DeviceDisconnected);
        self.remove_reconnect_listener();
        self.close_link();
        self.connect_at = None;
        self.discover_at = None;
        self.connect_started = None;
        if quiet {
            self.apply_state(ConnectionState::Released);
        } else {
            self.set_state(ConnectionState::Released);
        }
        info!(quiet, "connection released");
    }

    fn on_adapter_off(&mut self) {
        warn!("adapter powered off");
        self.flush(&RequestError::AdapterDisabled);
        self.remove_reconnect_listener();
        self.close_link();
        self.connect_at = None;
        self.discover_at = None;
        self.connect_started = None;
        self.set_state(ConnectionState::Disconnected);
    }

    // ===== Connect sequence =====

    fn connect_now(&mut self) {
        self.close_link();
        self.connect_started = Some(Instant::now());
        self.set_state(ConnectionState::Connecting);

        let (tx, rx) = mpsc::unbounded_channel();
        match self.radio.open_link(&self.shared.address, tx) {
            Ok(link) => {
                debug!(attempt = self.try_count, "opening link");
                self.link = Some(link);
                self.link_events = Some(rx);
            }
            Err(err) => {
                error!(error = %err, "radio stack refused to open a link");
                self.connect_failed(ConnectError::StackUnavailable);
                self.disconnect_internal(self.should_reconnect(), false);
            }
        }
    }

    fn discover_services(&mut self) {
        if self.state() != ConnectionState::Connected {
            return;
        }
        self.set_state(ConnectionState::ServiceDiscovering);
        let submitted = self
            .link
            .as_ref()
            .map_or(Err(StackError::Unavailable), |link| link.discover_services());
        if let Err(err) = submitted {
            error!(error = %err, "service discovery could not start");
            self.on_services_discovered(GATT_ERROR, Vec::new());
        }
    }

    fn on_link_up(&mut self) {
        if self.state() != ConnectionState::Connecting {
            trace!("ignoring stale link up");
            return;
        }
        self.set_state(ConnectionState::Connected);
        self.discover_at = Some(Instant::now() + self.config.discover_services_delay);
    }

    fn on_link_lost(&mut self, status: u16) {
        if self.link.is_none() {
            return;
        }
        let connecting = self.state() == ConnectionState::Connecting;
        if connecting {
            warn!(status, "link attempt failed");
        } else {
            error!(status, "link lost");
        }
        let reconnect = self.should_reconnect();
        self.disconnect_internal(reconnect, false);
        if connecting && !reconnect && !self.active_disconnect {
            self.connect_failed(ConnectError::StackUnavailable);
        }
    }

    fn on_services_discovered(&mut self, status: u16, services: Vec<GattService>) {
        if self.state() != ConnectionState::ServiceDiscovering {
            return;
        }
        if status != GATT_SUCCESS {
            error!(status, "service discovery failed");
            self.disconnect_internal(self.should_reconnect(), false);
            self.connect_failed(ConnectError::ServiceDiscoveryFailed);
            return;
        }

        debug!(count = services.len(), "services discovered");
        *self.shared.services.write() = services;
        self.try_count = 0;
        self.immediate_count = 0;
        self.connect_started = None;
        self.set_state(ConnectionState::ServiceDiscovered);
        self.bootstrap();
        self.pump();
    }

    /// Queue MTU negotiation and the telemetry subscription ahead of
    /// application requests.
    fn bootstrap(&mut self) {
        let device = self.shared.device();
        let telemetry = &self.config.telemetry;
        let mut builders = vec![RequestBuilder::change_mtu(self.config.mtu_for(&device))];
        if telemetry.bootstrap
            && self
                .characteristic(telemetry.service, telemetry.notify_characteristic)
                .is_ok()
        {
            builders.push(RequestBuilder::set_notification(
                telemetry.service,
                telemetry.notify_characteristic,
                true,
            ));
            builders.push(RequestBuilder::read_characteristic(
                telemetry.service,
                telemetry.notify_characteristic,
            ));
        }

        for builder in builders {
            match builder
                .priority(BOOTSTRAP_PRIORITY)
                .tag("bootstrap")
                .build()
            {
                Ok(request) => self.queue.push(request),
                Err(err) => warn!(error = %err, "skipping bootstrap request"),
            }
        }
    }

    fn on_connect_timeout(&mut self) {
        let kind = match self.state() {
            ConnectionState::ScanningForReconnection => TimeoutKind::CannotDiscoverDevice,
            ConnectionState::Connecting => TimeoutKind::CannotConnect,
            _ => TimeoutKind::CannotDiscoverServices,
        };
        error!(kind = %kind, "connect timed out");
        self.connect_started = None;
        self.emit(BleEvent::ConnectTimeout {
            device: self.shared.device(),
            kind,
        });

        if self.should_reconnect() {
            self.disconnect_internal(true, false);
        } else {
            self.disconnect_internal(false, false);
            self.connect_failed(ConnectError::ConnectTimeout(kind));
        }
    }

    /// Tear the link down, then either schedule a reconnect or settle in
    /// `DISCONNECTED`.
    ///
    /// A `manual` reconnect connects directly without spending the
    /// immediate budget.
    fn disconnect_internal(&mut self, reconnect: bool, manual: bool) {
        self.flush(&RequestError::DeviceDisconnected);
        self.connect_at = None;
        self.discover_at = None;
        self.close_link();

        let state = self.state();
        if state == ConnectionState::Released {
            return;
        }
        if !(reconnect && self.adapter_on() && !self.shared.released.load(Ordering::Acquire)) {
            self.remove_reconnect_listener();
            self.connect_started = None;
            self.set_state(ConnectionState::Disconnected);
            return;
        }

        if self.budget_exhausted() {
            self.remove_reconnect_listener();
            self.connect_started = None;
            self.set_state(ConnectionState::Disconnected);
            self.connect_failed(ConnectError::MaximumReconnection);
            return;
        }

        self.try_count += 1;
        if manual || self.immediate_count < self.config.reconnect_immediately_max_times {
            if !manual {
                self.immediate_count += 1;
            }
            info!(
                attempt = self.try_count,
                immediate = self.immediate_count,
                "reconnecting"
            );
            self.set_state(if state == ConnectionState::Disconnected {
                ConnectionState::Disconnected
            } else {
                ConnectionState::ScanningForReconnection
            });
            self.connect_at = Some(Instant::now());
        } else {
            info!(attempt = self.try_count, "scanning for reconnection");
            self.set_state(ConnectionState::ScanningForReconnection);
            self.connect_started = Some(Instant::now());
            self.start_reconnect_scan();
        }
    }

    fn on_device_found(&mut self, device: &Device) {
        if self.state() != ConnectionState::ScanningForReconnection
            || self.reconnect_listener.is_none()
        {
            return;
        }
        info!(rssi = ?device.rssi, "device found again");
        {
            let mut current = self.shared.device.write();
            if device.name.is_some() {
                current.name.clone_from(&device.name);
            }
            current.rssi = device.rssi;
            current.raw_advertisement.clone_from(&device.raw_advertisement);
        }
        self.remove_reconnect_listener();
        self.connect_now();
    }

    fn start_reconnect_scan(&mut self) {
        if self.reconnect_listener.is_none() {
            let listener: Arc<dyn ScanListener> = Arc::new(ReconnectListener {
                address: self.shared.address.clone(),
                filters: self.config.reconnect_filters.clone(),
                commands: self.commands.clone(),
            });
            self.scanner.add_listener(Arc::clone(&listener));
            self.reconnect_listener = Some(listener);
        }
        if !self.scanner.is_scanning() {
            self.started_scan = self.scanner.start();
        }
    }

    fn remove_reconnect_listener(&mut self) {
        if let Some(listener) = self.reconnect_listener.take() {
            self.scanner.remove_listener(&listener);
        }
        if std::mem::take(&mut self.started_scan) && self.scanner.is_scanning() {
            self.scanner.stop(true);
        }
    }

    fn close_link(&mut self) {
        if let Some(link) = self.link.take() {
            link.close();
        }
        self.link_events = None;
        self.shared.services.write().clear();
        self.shared.notifications.write().clear();
        self.shared.mtu.store(MIN_MTU, Ordering::Release);
    }

    // ===== Requests =====

    fn flush(&mut self, error: &RequestError) {
        self.request_deadline = None;
        if let Some(in_flight) = self.current.take() {
            self.shared.complete(in_flight.request, Err(error.clone()));
        }
        for request in self.queue.drain() {
            self.shared.complete(request, Err(error.clone()));
        }
    }

    fn pump(&mut self) {
        while self.current.is_none() && self.state().is_ready() {
            let Some(request) = self.queue.pop() else {
                break;
            };
            self.launch(request);
        }
    }

    fn launch(&mut self, mut request: Request) {
        let submitted = match self.link.clone() {
            Some(link) => self.submit(link.as_ref(), &request),
            None => Err(RequestError::GattUnavailable),
        };
        match submitted {
            Ok(Submitted::Pending(packages)) => {
                let timeout = request.timeout().unwrap_or(self.config.request_timeout);
                self.request_deadline = Some(Instant::now() + timeout);
                trace!(request = %request.kind(), id = %request.id(), "request started");
                self.current = Some(InFlight { request, packages });
            }
            Ok(Submitted::Done(output)) => self.shared.complete(request, Ok(output)),
            Err(RequestError::GattUnavailable) => {
                self.shared
                    .complete(request, Err(RequestError::GattUnavailable));
                self.disconnect_internal(self.should_reconnect(), false);
            }
            Err(err) if err.is_retryable() && request.consume_retry() => {
                debug!(error = %err, "retrying request");
                self.queue.push_front(request);
            }
            Err(err) => self.shared.complete(request, Err(err)),
        }
    }

    fn characteristic(
        &self,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<GattCharacteristic, RequestError> {
        let services = self.shared.services.read();
        let service = services
            .iter()
            .find(|s| s.uuid == service)
            .ok_or(RequestError::ServiceNotFound(service))?;
        service
            .characteristic(characteristic)
            .cloned()
            .ok_or(RequestError::CharacteristicNotFound(characteristic))
    }

    fn descriptor(
        &self,
        service: Uuid,
        characteristic: Uuid,
        descriptor: Uuid,
    ) -> Result<(), RequestError> {
        let found = self.characteristic(service, characteristic)?;
        if found.descriptors.contains(&descriptor) {
            Ok(())
        } else {
            Err(RequestError::DescriptorNotFound(descriptor))
        }
    }

    fn write_options(
        &self,
        service: Uuid,
        characteristic: Uuid,
        options: Option<WriteOptions>,
    ) -> WriteOptions {
        options
            .or_else(|| {
                self.config
                    .default_write_options
                    .get(&(service, characteristic))
                    .copied()
            })
            .unwrap_or_default()
    }

    fn submit(
        &self,
        link: &dyn GattLink,
        request: &Request,
    ) -> Result<Submitted, RequestError> {
        let pending = || Submitted::Pending(VecDeque::new());
        match request.operation() {
            Operation::ReadCharacteristic {
                service,
                characteristic,
            } => {
                self.characteristic(*service, *characteristic)?;
                link.read_characteristic(*service, *characteristic)
                    .map_err(stack_error)?;
                Ok(pending())
            }
            Operation::WriteCharacteristic {
                service,
                characteristic,
                value,
                options,
            } => {
                self.characteristic(*service, *characteristic)?;
                let options = self.write_options(*service, *characteristic, *options);
                let size = options.effective_package_size(self.shared.mtu.load(Ordering::Acquire));
                let mut packages: VecDeque<Vec<u8>> =
                    value.chunks(size).map(<[u8]>::to_vec).collect();
                trace!(
                    value = %hex::encode(value),
                    packages = packages.len(),
                    mode = ?options.mode,
                    "writing characteristic"
                );

                if !options.mode.is_acknowledged() {
                    for package in &packages {
                        link.write_characteristic(*service, *characteristic, package, options.mode)
                            .map_err(stack_error)?;
                    }
                    return Ok(Submitted::Done(RequestOutput::Written(value.clone())));
                }

                if let Some(first) = packages.pop_front() {
                    link.write_characteristic(*service, *characteristic, &first, options.mode)
                        .map_err(stack_error)?;
                }
                Ok(Submitted::Pending(packages))
            }
            Operation::ReadDescriptor {
                service,
                characteristic,
                descriptor,
            } => {
                self.descriptor(*service, *characteristic, *descriptor)?;
                link.read_descriptor(*service, *characteristic, *descriptor)
                    .map_err(stack_error)?;
                Ok(pending())
            }
            Operation::WriteDescriptor {
                service,
                characteristic,
                descriptor,
                value,
            } => {
                self.descriptor(*service, *characteristic, *descriptor)?;
                link.write_descriptor(*service, *characteristic, *descriptor, value)
                    .map_err(stack_error)?;
                Ok(pending())
            }
            Operation::SetNotification {
                service,
                characteristic,
                kind,
                enable,
            } => {
                self.descriptor(*service, *characteristic, CCCD_UUID)?;
                link.set_notification(*service, *characteristic, *enable)
                    .map_err(stack_error)?;
                let value = match (enable, kind) {
                    (false, _) => DISABLE_NOTIFICATION_VALUE,
                    (true, NotificationKind::Notification) => ENABLE_NOTIFICATION_VALUE,
                    (true, NotificationKind::Indication) => ENABLE_INDICATION_VALUE,
                };
                link.write_descriptor(*service, *characteristic, CCCD_UUID, &value)
                    .map_err(stack_error)?;
                Ok(pending())
            }
            Operation::ChangeMtu { mtu } => {
                link.request_mtu(*mtu).map_err(stack_error)?;
                Ok(pending())
            }
            Operation::ReadRssi => {
                link.read_rssi().map_err(stack_error)?;
                Ok(pending())
            }
            Operation::SetPreferredPhy { tx, rx, option } => {
                link.set_preferred_phy(*tx, *rx, *option)
                    .map_err(stack_error)?;
                Ok(pending())
            }
        }
    }

    fn on_request_timeout(&mut self) {
        if let Some(in_flight) = &self.current {
            warn!(
                request = %in_flight.request.kind(),
                id = %in_flight.request.id(),
                "request timed out"
            );
        }
        self.finish(Err(RequestError::RequestTimeout));
    }

    fn finish(&mut self, result: Result<RequestOutput, RequestError>) {
        let Some(mut in_flight) = self.current.take() else {
            return;
        };
        self.request_deadline = None;
        match result {
            Err(err) if err.is_retryable() && in_flight.request.consume_retry() => {
                debug!(error = %err, "retrying request");
                self.queue.push_front(in_flight.request);
            }
            result => self.shared.complete(in_flight.request, result),
        }
        self.pump();
    }

    fn on_completion(&mut self, event: LinkEvent) {
        let Some(mut in_flight) = self.current.take() else {
            trace!(?event, "completion with no request in flight");
            return;
        };
        if !completes(in_flight.request.operation(), &event) {
            trace!(?event, "ignoring stale completion");
            self.current = Some(in_flight);
            return;
        }

        let status = event_status(&event);
        if status != GATT_SUCCESS {
            self.current = Some(in_flight);
            self.finish(Err(RequestError::GattStatus(status)));
            return;
        }

        let output = match event {
            LinkEvent::CharacteristicRead { value, .. } => {
                trace!(value = %hex::encode(&value), "characteristic read");
                RequestOutput::Value(value)
            }
            LinkEvent::CharacteristicWritten { .. } => {
                let Operation::WriteCharacteristic {
                    service,
                    characteristic,
                    value,
                    options,
                } = in_flight.request.operation()
                else {
                    self.current = Some(in_flight);
                    return;
                };
                let Some(next) = in_flight.packages.pop_front() else {
                    let output = RequestOutput::Written(value.clone());
                    self.current = Some(in_flight);
                    self.finish(Ok(output));
                    return;
                };

                let mode = self.write_options(*service, *characteristic, *options).mode;
                let timeout = in_flight
                    .request
                    .timeout()
                    .unwrap_or(self.config.request_timeout);
                let sent = self
                    .link
                    .as_ref()
                    .map_or(Err(StackError::Unavailable), |link| {
                        link.write_characteristic(*service, *characteristic, &next, mode)
                    });
                self.current = Some(in_flight);
                match sent {
                    Ok(()) => self.request_deadline = Some(Instant::now() + timeout),
                    Err(err) => self.finish(Err(stack_error(err))),
                }
                return;
            }
            LinkEvent::DescriptorRead { value, .. } => RequestOutput::Value(value),
            LinkEvent::DescriptorWritten { value, .. } => match in_flight.request.operation() {
                Operation::SetNotification {
                    service,
                    characteristic,
                    enable,
                    ..
                } => {
                    let mut notifications = self.shared.notifications.write();
                    if *enable {
                        notifications.insert((*service, *characteristic));
                    } else {
                        notifications.remove(&(*service, *characteristic));
                    }
                    RequestOutput::Notification(*enable)
                }
                _ => RequestOutput::Written(value),
            },
            LinkEvent::MtuChanged { mtu, .. } => {
                debug!(mtu, "mtu negotiated");
                self.shared.mtu.store(mtu, Ordering::Release);
                if self.state() == ConnectionState::ServiceDiscovered {
                    self.set_state(ConnectionState::MtuSuccess);
                }
                RequestOutput::Mtu(mtu)
            }
            LinkEvent::RssiRead { rssi, .. } => {
                self.shared.device.write().rssi = Some(rssi);
                RequestOutput::Rssi(rssi)
            }
            LinkEvent::PhyUpdated { tx, rx, .. } => RequestOutput::Phy { tx, rx },
            other => {
                trace!(event = ?other, "unexpected completion");
                self.current = Some(in_flight);
                return;
            }
        };
        self.current = Some(in_flight);
        self.finish(Ok(output));
    }

    // ===== Link events =====

    fn handle_link_event(&mut self, event: Option<LinkEvent>) {
        let Some(event) = event else {
            self.link_events = None;
            self.on_link_lost(GATT_ERROR);
            return;
        };
        match event {
            LinkEvent::ConnectionStateChanged {
                connected: true, ..
            } => self.on_link_up(),
            LinkEvent::ConnectionStateChanged {
                connected: false,
                status,
            } => self.on_link_lost(status),
            LinkEvent::ServicesDiscovered { status, services } => {
                self.on_services_discovered(status, services);
            }
            LinkEvent::CharacteristicChanged {
                service,
                characteristic,
                value,
            } => {
                trace!(%characteristic, value = %hex::encode(&value), "characteristic changed");
                self.emit(BleEvent::CharacteristicChanged {
                    device: self.shared.device(),
                    service,
                    characteristic,
                    value,
                });
            }
            completion => self.on_completion(completion),
        }
    }
}

/// Returns `true` if `event` is the completion `op` is waiting for.
fn completes(op: &Operation, event: &LinkEvent) -> bool {
    match (op, event) {
        (
            Operation::ReadCharacteristic { characteristic, .. },
            LinkEvent::CharacteristicRead {
                characteristic: c, ..
            },
        )
        | (
            Operation::WriteCharacteristic { characteristic, .. },
            LinkEvent::CharacteristicWritten {
                characteristic: c, ..
            },
        ) => characteristic == c,
        (
            Operation::ReadDescriptor {
                characteristic,
                descriptor,
                ..
            },
            LinkEvent::DescriptorRead {
                characteristic: c,
                descriptor: d,
                ..
            },
        )
        | (
            Operation::WriteDescriptor {
                characteristic,
                descriptor,
                ..
            },
            LinkEvent::DescriptorWritten {
                characteristic: c,
                descriptor: d,
                ..
            },
        ) => characteristic == c && descriptor == d,
        (
            Operation::SetNotification { characteristic, .. },
            LinkEvent::DescriptorWritten {
                characteristic: c,
                descriptor,
                ..
            },
        ) => characteristic == c && *descriptor == CCCD_UUID,
        (Operation::ChangeMtu { .. }, LinkEvent::MtuChanged { .. })
        | (Operation::ReadRssi, LinkEvent::RssiRead { .. })
        | (Operation::SetPreferredPhy { .. }, LinkEvent::PhyUpdated { .. }) => true,
        _ => false,
    }
}

const fn event_status(event: &LinkEvent) -> u16 {
    match event {
        LinkEvent::CharacteristicRead { status, .. }
        | LinkEvent::CharacteristicWritten { status, .. }
        | LinkEvent::DescriptorRead { status, .. }
        | LinkEvent::DescriptorWritten { status, .. }
        | LinkEvent::MtuChanged { status, .. }
        | LinkEvent::RssiRead { status, .. }
        | LinkEvent::PhyUpdated { status, .. }
        | LinkEvent::ServicesDiscovered { status, .. }
        | LinkEvent::ConnectionStateChanged { status, .. } => *status,
        LinkEvent::CharacteristicChanged { .. } => GATT_SUCCESS,
    }
}

fn stack_error(err: StackError) -> RequestError {
    match err {
        StackError::Unavailable => RequestError::GattUnavailable,
        StackError::Rejected(reason) => RequestError::Rejected(reason),
        StackError::Unsupported(op) => RequestError::Rejected(format!("{op} is not supported")),
    }
}

async fn recv_link(rx: &mut Option<mpsc::UnboundedReceiver<LinkEvent>>) -> Option<LinkEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Watches scan results for the device being reconnected.
struct ReconnectListener {
    address: String,
    filters: Option<ScanFilters>,
    commands: CommandSender,
}

impl ScanListener for ReconnectListener {
    fn on_scan_result(&self, device: &Device) {
        if !device.address().eq_ignore_ascii_case(&self.address) {
            return;
        }
        if let Some(filters) = &self.filters {
            let parsed = device
                .raw_advertisement
                .as_deref()
                .map(ParsedAdvertisement::parse)
                .unwrap_or_default();
            if !filters.matches(
                device.address(),
                device.name.as_deref(),
                device.rssi.unwrap_or(i16::MIN),
                &parsed.service_uuids,
            ) {
                return;
            }
        }
        if let Some(commands) = self.commands.upgrade() {
            let _ = commands.send(Command::DeviceFound(device.clone()));
        }
    }
}
