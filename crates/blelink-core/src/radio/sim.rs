//! Scriptable in-process radio stack.
//!
//! Every peripheral is described by a [`Peripheral`] script: how long the link
//! takes to come up, how discovery and each GATT operation behave, and which
//! services and values it exposes. Completions are delivered after the
//! scripted delay on the tokio timer, so tests running with a paused clock
//! see fully deterministic timing. Every submitted operation is recorded in an
//! operation log together with the number of operations in flight on that
//! link.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{
    Advertisement, AdvertisementSender, CharacteristicProperties, GattCharacteristic, GattLink,
    GattService, LinkEvent, LinkEventSender, RadioStack, StackError, StackScanSettings, CCCD_UUID,
    GATT_ERROR, GATT_SUCCESS,
};
use crate::config::{ScanFilters, TelemetryChannel};
use crate::request::{WriteMode, MAX_MTU};
use crate::scanner::advertisement::ParsedAdvertisement;
use crate::scanner::ScanError;
use crate::types::{AdapterState, BondState, Phy, PhyOption};

/// How a link attempt ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectBehavior {
    /// Link comes up after the link delay.
    #[default]
    Succeed,
    /// Link attempt fails with this status after the link delay.
    Fail(u16),
    /// The stack never answers.
    Never,
}

/// How one operation is answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OpBehavior {
    /// Success after the response delay.
    #[default]
    Respond,
    /// Completion with a failure status after the response delay.
    Fail(u16),
    /// Submission is refused synchronously.
    Reject,
    /// Accepted but never completed.
    Never,
}

/// Operations a script can configure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimOp {
    /// Service discovery.
    DiscoverServices,
    /// Characteristic read.
    ReadCharacteristic,
    /// Characteristic write.
    WriteCharacteristic,
    /// Descriptor read.
    ReadDescriptor,
    /// Descriptor write.
    WriteDescriptor,
    /// MTU request.
    RequestMtu,
    /// RSSI read.
    ReadRssi,
    /// PHY request.
    SetPhy,
}

/// Script for one simulated peripheral.
#[derive(Debug, Clone)]
pub struct Peripheral {
    /// Advertised name.
    pub name: Option<String>,
    /// Link attempt outcome.
    pub connect: ConnectBehavior,
    /// Time from `open_link` to the link event.
    pub link_delay: Duration,
    /// Time from discovery submission to its completion.
    pub discovery_delay: Duration,
    /// Time from any other submission to its completion.
    pub response_delay: Duration,
    /// Exposed services.
    pub services: Vec<GattService>,
    /// Characteristic values.
    pub values: HashMap<Uuid, Vec<u8>>,
    /// Per-operation behaviour; missing entries respond.
    pub behaviors: HashMap<SimOp, OpBehavior>,
    /// Reported RSSI.
    pub rssi: i16,
    /// Largest MTU the peripheral accepts.
    pub max_mtu: u16,
}

impl Default for Peripheral {
    fn default() -> Self {
        Self {
            name: None,
            connect: ConnectBehavior::Succeed,
            link_delay: Duration::from_millis(100),
            discovery_delay: Duration::from_millis(100),
            response_delay: Duration::from_millis(10),
            services: Vec::new(),
            values: HashMap::new(),
            behaviors: HashMap::new(),
            rssi: -60,
            max_mtu: MAX_MTU,
        }
    }
}

impl Peripheral {
    /// A peripheral exposing the telemetry channel from `telemetry`.
    #[must_use]
    pub fn with_telemetry(name: &str, telemetry: &TelemetryChannel) -> Self {
        let service = GattService {
            uuid: telemetry.service,
            characteristics: vec![
                GattCharacteristic::new(
                    telemetry.notify_characteristic,
                    CharacteristicProperties::NOTIFY | CharacteristicProperties::READ,
                )
                .with_descriptor(CCCD_UUID),
                GattCharacteristic::new(
                    telemetry.write_characteristic,
                    CharacteristicProperties::WRITE | CharacteristicProperties::WRITE_NO_RESPONSE,
                ),
            ],
        };
        Self {
            name: Some(name.to_string()),
            services: vec![service],
            ..Self::default()
        }
    }

    /// Set the link delay.
    #[must_use]
    pub const fn link_delay(mut self, delay: Duration) -> Self {
        self.link_delay = delay;
        self
    }

    /// Set the discovery delay.
    #[must_use]
    pub const fn discovery_delay(mut self, delay: Duration) -> Self {
        self.discovery_delay = delay;
        self
    }

    /// Set the response delay.
    #[must_use]
    pub const fn response_delay(mut self, delay: Duration) -> Self {
        self.response_delay = delay;
        self
    }

    /// Set the link attempt outcome.
    #[must_use]
    pub const fn connect(mut self, behavior: ConnectBehavior) -> Self {
        self.connect = behavior;
        self
    }

    /// Script one operation.
    #[must_use]
    pub fn behavior(mut self, op: SimOp, behavior: OpBehavior) -> Self {
        self.behaviors.insert(op, behavior);
        self
    }

    /// Add a service.
    #[must_use]
    pub fn service(mut self, service: GattService) -> Self {
        self.services.push(service);
        self
    }

    /// Seed a characteristic value.
    #[must_use]
    pub fn value(mut self, characteristic: Uuid, value: impl Into<Vec<u8>>) -> Self {
        self.values.insert(characteristic, value.into());
        self
    }

    fn behavior_for(&self, op: SimOp) -> OpBehavior {
        self.behaviors.get(&op).copied().unwrap_or_default()
    }
}

/// One submitted operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpRecord {
    /// Peripheral address.
    pub address: String,
    /// Operation.
    pub op: SimOp,
    /// Submission time.
    pub at: Instant,
    /// Target characteristic, if any.
    pub characteristic: Option<Uuid>,
    /// Target descriptor, if any.
    pub descriptor: Option<Uuid>,
    /// Bytes written, empty for reads.
    pub value: Vec<u8>,
}

struct LinkSlot {
    generation: u64,
    events: LinkEventSender,
    connected: bool,
    in_flight: usize,
    notifying: HashSet<Uuid>,
}

#[derive(Default)]
struct SimState {
    peripherals: HashMap<String, Peripheral>,
    links: HashMap<String, LinkSlot>,
    next_generation: u64,
    open_attempts: HashMap<String, u32>,
    max_in_flight: HashMap<String, usize>,
    op_log: Vec<OpRecord>,
    scan: Option<(AdvertisementSender, Option<ScanFilters>)>,
    last_scan_filters: Option<ScanFilters>,
    scan_failure: Option<ScanError>,
    bonds: HashMap<String, BondState>,
}

struct SimInner {
    state: Mutex<SimState>,
    adapter: watch::Sender<AdapterState>,
}

/// In-process [`RadioStack`].
pub struct SimulatedRadio {
    inner: Arc<SimInner>,
}

impl SimulatedRadio {
    /// A powered-on radio with no peripherals.
    #[must_use]
    pub fn new() -> Arc<Self> {
        let (adapter, _) = watch::channel(AdapterState::On);
        Arc::new(Self {
            inner: Arc::new(SimInner {
                state: Mutex::new(SimState::default()),
                adapter,
            }),
        })
    }

    /// Add or replace the script for `address`.
    pub fn add_peripheral(&self, address: &str, peripheral: Peripheral) {
        self.inner
            .state
            .lock()
            .peripherals
            .insert(key(address), peripheral);
    }

    /// Edit the script for `address` in place.
    pub fn update_peripheral(&self, address: &str, f: impl FnOnce(&mut Peripheral)) {
        if let Some(peripheral) = self.inner.state.lock().peripherals.get_mut(&key(address)) {
            f(peripheral);
        }
    }

    /// Change the link attempt outcome for `address`.
    pub fn set_connect_behavior(&self, address: &str, behavior: ConnectBehavior) {
        self.update_peripheral(address, |p| p.connect = behavior);
    }

    /// Change one operation's behaviour for `address`.
    pub fn set_behavior(&self, address: &str, op: SimOp, behavior: OpBehavior) {
        self.update_peripheral(address, |p| {
            p.behaviors.insert(op, behavior);
        });
    }

    /// Emit an advertisement carrying `name` as its complete local name.
    pub fn advertise(&self, address: &str, name: Option<&str>, rssi: i16) {
        let mut data = vec![0x02, 0x01, 0x06];
        if let Some(name) = name {
            let bytes = name.as_bytes();
            if let Ok(len) = u8::try_from(bytes.len() + 1) {
                data.push(len);
                data.push(0x09);
                data.extend_from_slice(bytes);
            }
        }
        self.advertise_raw(Advertisement {
            address: address.to_string(),
            name: None,
            rssi,
            data,
            connectable: Some(true),
        });
    }

    /// Emit a raw advertisement. Dropped unless a scan is running; stack
    /// filters are applied.
    pub fn advertise_raw(&self, adv: Advertisement) {
        let state = self.inner.state.lock();
        let Some((sink, filters)) = &state.scan else {
            return;
        };
        if let Some(filters) = filters {
            let parsed = ParsedAdvertisement::parse(&adv.data);
            let name = adv.name.as_deref().or(parsed.local_name.as_deref());
            if !filters.matches(&adv.address, name, adv.rssi, &parsed.service_uuids) {
                return;
            }
        }
        let _ = sink.send(adv);
    }

    /// Simulate an unexpected link loss.
    pub fn drop_link(&self, address: &str) {
        let mut state = self.inner.state.lock();
        if let Some(slot) = state.links.remove(&key(address)) {
            debug!(address, "simulated link loss");
            let _ = slot.events.send(LinkEvent::ConnectionStateChanged {
                connected: false,
                status: GATT_ERROR,
            });
        }
    }

    /// Push a value change. Delivered only if notifications were enabled.
    pub fn notify(&self, address: &str, service: Uuid, characteristic: Uuid, value: &[u8]) {
        let state = self.inner.state.lock();
        if let Some(slot) = state.links.get(&key(address)) {
            if slot.connected && slot.notifying.contains(&characteristic) {
                let _ = slot.events.send(LinkEvent::CharacteristicChanged {
                    service,
                    characteristic,
                    value: value.to_vec(),
                });
            }
        }
    }

    /// Power the adapter on or off. Powering off drops every link and scan.
    pub fn set_adapter(&self, adapter: AdapterState) {
        if adapter == AdapterState::Off {
            let mut state = self.inner.state.lock();
            state.scan = None;
            for (_, slot) in state.links.drain() {
                let _ = slot.events.send(LinkEvent::ConnectionStateChanged {
                    connected: false,
                    status: GATT_ERROR,
                });
            }
        }
        self.inner.adapter.send_replace(adapter);
    }

    /// Make the next `start_scan` fail with `error`.
    pub fn fail_next_scan(&self, error: ScanError) {
        self.inner.state.lock().scan_failure = Some(error);
    }

    /// Returns `true` while a scan is running.
    #[must_use]
    pub fn is_scanning(&self) -> bool {
        self.inner.state.lock().scan.is_some()
    }

    /// Filters handed to the most recent scan.
    #[must_use]
    pub fn last_scan_filters(&self) -> Option<ScanFilters> {
        self.inner.state.lock().last_scan_filters.clone()
    }

    /// Every operation submitted so far.
    #[must_use]
    pub fn op_log(&self) -> Vec<OpRecord> {
        self.inner.state.lock().op_log.clone()
    }

    /// Operations submitted to `address`.
    #[must_use]
    pub fn ops_for(&self, address: &str) -> Vec<OpRecord> {
        let address = key(address);
        self.inner
            .state
            .lock()
            .op_log
            .iter()
            .filter(|r| r.address == address)
            .cloned()
            .collect()
    }

    /// Highest number of simultaneously outstanding operations seen on
    /// `address`.
    #[must_use]
    pub fn max_in_flight(&self, address: &str) -> usize {
        self.inner
            .state
            .lock()
            .max_in_flight
            .get(&key(address))
            .copied()
            .unwrap_or(0)
    }

    /// Number of `open_link` calls for `address`.
    #[must_use]
    pub fn open_attempts(&self, address: &str) -> u32 {
        self.inner
            .state
            .lock()
            .open_attempts
            .get(&key(address))
            .copied()
            .unwrap_or(0)
    }

    /// Returns `true` if `address` has a live link.
    #[must_use]
    pub fn is_linked(&self, address: &str) -> bool {
        self.inner
            .state
            .lock()
            .links
            .get(&key(address))
            .is_some_and(|slot| slot.connected)
    }
}

impl RadioStack for SimulatedRadio {
    fn adapter_state(&self) -> AdapterState {
        *self.inner.adapter.borrow()
    }

    fn watch_adapter(&self) -> watch::Receiver<AdapterState> {
        self.inner.adapter.subscribe()
    }

    fn open_link(
        &self,
        address: &str,
        events: LinkEventSender,
    ) -> Result<Arc<dyn GattLink>, StackError> {
        if self.adapter_state() == AdapterState::Off {
            return Err(StackError::Unavailable);
        }
        let address = key(address);
        let mut state = self.inner.state.lock();
        *state.open_attempts.entry(address.clone()).or_default() += 1;
        state.next_generation += 1;
        let generation = state.next_generation;
        state.links.insert(
            address.clone(),
            LinkSlot {
                generation,
                events,
                connected: false,
                in_flight: 0,
                notifying: HashSet::new(),
            },
        );

        let script = state
            .peripherals
            .get(&address)
            .map(|p| (p.connect, p.link_delay));
        drop(state);

        match script {
            Some((ConnectBehavior::Succeed, delay)) => {
                self.inner.schedule(delay, address.clone(), generation, |slot| {
                    slot.connected = true;
                    Some(LinkEvent::ConnectionStateChanged {
                        connected: true,
                        status: GATT_SUCCESS,
                    })
                });
            }
            Some((ConnectBehavior::Fail(status), delay)) => {
                self.inner.schedule(delay, address.clone(), generation, move |_| {
                    Some(LinkEvent::ConnectionStateChanged {
                        connected: false,
                        status,
                    })
                });
            }
            Some((ConnectBehavior::Never, _)) | None => {}
        }

        Ok(Arc::new(SimLink {
            inner: self.inner.clone(),
            address,
            generation,
        }))
    }

    fn start_scan(
        &self,
        settings: &StackScanSettings,
        sink: AdvertisementSender,
    ) -> Result<(), ScanError> {
        let mut state = self.inner.state.lock();
        if let Some(err) = state.scan_failure.take() {
            return Err(err);
        }
        if *self.inner.adapter.borrow() == AdapterState::Off {
            return Err(ScanError::ScanFailed("adapter is off".into()));
        }
        state.last_scan_filters.clone_from(&settings.filters);
        state.scan = Some((sink, settings.filters.clone()));
        Ok(())
    }

    fn stop_scan(&self) {
        self.inner.state.lock().scan = None;
    }

    fn bond_state(&self, address: &str) -> BondState {
        self.inner
            .state
            .lock()
            .bonds
            .get(&key(address))
            .copied()
            .unwrap_or_default()
    }

    fn create_bond(&self, address: &str) -> bool {
        self.inner
            .state
            .lock()
            .bonds
            .insert(key(address), BondState::Bonded);
        true
    }
}

impl std::fmt::Debug for SimulatedRadio {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("SimulatedRadio")
            .field("peripherals", &state.peripherals.len())
            .field("links", &state.links.len())
            .field("scanning", &state.scan.is_some())
            .finish_non_exhaustive()
    }
}

impl SimInner {
    /// Deliver the event built by `f` after `delay`, if the link generation
    /// is still current.
    fn schedule(
        self: &Arc<Self>,
        delay: Duration,
        address: String,
        generation: u64,
        f: impl FnOnce(&mut LinkSlot) -> Option<LinkEvent> + Send + 'static,
    ) {
        let Ok(handle) = Handle::try_current() else {
            warn!("simulated radio used outside a tokio runtime, dropping event");
            return;
        };
        let inner = Arc::clone(self);
        handle.spawn(async move {
            tokio::time::sleep(delay).await;
            let mut state = inner.state.lock();
            if let Some(slot) = state.links.get_mut(&address) {
                if slot.generation == generation {
                    if let Some(event) = f(slot) {
                        let _ = slot.events.send(event);
                    }
                }
            }
        });
    }

    fn submit(
        self: &Arc<Self>,
        address: &str,
        generation: u64,
        record: (SimOp, Option<Uuid>, Option<Uuid>, &[u8]),
        respond: impl FnOnce(&Peripheral, OpBehavior) -> LinkEvent + Send + 'static,
    ) -> Result<(), StackError> {
        let (op, characteristic, descriptor, value) = record;
        let mut state = self.state.lock();
        let live = state
            .links
            .get(address)
            .is_some_and(|slot| slot.generation == generation && slot.connected);
        if !live {
            return Err(StackError::Unavailable);
        }

        state.op_log.push(OpRecord {
            address: address.to_string(),
            op,
            at: Instant::now(),
            characteristic,
            descriptor,
            value: value.to_vec(),
        });

        let peripheral = state.peripherals.get(address).cloned().unwrap_or_default();
        let behavior = peripheral.behavior_for(op);
        match behavior {
            OpBehavior::Reject => return Err(StackError::Rejected("simulated rejection".into())),
            OpBehavior::Never => return Ok(()),
            OpBehavior::Respond | OpBehavior::Fail(_) => {}
        }

        let in_flight = state.links.get_mut(address).map_or(0, |slot| {
            slot.in_flight += 1;
            slot.in_flight
        });
        let max = state.max_in_flight.entry(address.to_string()).or_default();
        *max = (*max).max(in_flight);

        if behavior == OpBehavior::Respond {
            if let (SimOp::WriteCharacteristic, Some(characteristic)) = (op, characteristic) {
                state
                    .peripherals
                    .entry(address.to_string())
                    .or_default()
                    .values
                    .insert(characteristic, value.to_vec());
            }
        }
        drop(state);

        let delay = if op == SimOp::DiscoverServices {
            peripheral.discovery_delay
        } else {
            peripheral.response_delay
        };
        let event = respond(&peripheral, behavior);
        self.schedule(delay, address.to_string(), generation, move |slot| {
            slot.in_flight = slot.in_flight.saturating_sub(1);
            Some(event)
        });
        Ok(())
    }
}

struct SimLink {
    inner: Arc<SimInner>,
    address: String,
    generation: u64,
}

const fn status_of(behavior: OpBehavior) -> u16 {
    match behavior {
        OpBehavior::Fail(status) => status,
        _ => GATT_SUCCESS,
    }
}

impl GattLink for SimLink {
    fn discover_services(&self) -> Result<(), StackError> {
        self.inner.submit(
            &self.address,
            self.generation,
            (SimOp::DiscoverServices, None, None, &[]),
            |peripheral, behavior| LinkEvent::ServicesDiscovered {
                status: status_of(behavior),
                services: if behavior == OpBehavior::Respond {
                    peripheral.services.clone()
                } else {
                    Vec::new()
                },
            },
        )
    }

    fn read_characteristic(&self, service: Uuid, characteristic: Uuid) -> Result<(), StackError> {
        self.inner.submit(
            &self.address,
            self.generation,
            (SimOp::ReadCharacteristic, Some(characteristic), None, &[]),
            move |peripheral, behavior| LinkEvent::CharacteristicRead {
                service,
                characteristic,
                status: status_of(behavior),
                value: peripheral
                    .values
                    .get(&characteristic)
                    .cloned()
                    .unwrap_or_default(),
            },
        )
    }

    fn write_characteristic(
        &self,
        service: Uuid,
        characteristic: Uuid,
        value: &[u8],
        mode: WriteMode,
    ) -> Result<(), StackError> {
        if !mode.is_acknowledged() {
            let mut state = self.inner.state.lock();
            let live = state
                .links
                .get(&self.address)
                .is_some_and(|slot| slot.generation == self.generation && slot.connected);
            if !live {
                return Err(StackError::Unavailable);
            }
            state.op_log.push(OpRecord {
                address: self.address.clone(),
                op: SimOp::WriteCharacteristic,
                at: Instant::now(),
                characteristic: Some(characteristic),
                descriptor: None,
                value: value.to_vec(),
            });
            return Ok(());
        }

        let written = value.to_vec();
        self.inner.submit(
            &self.address,
            self.generation,
            (SimOp::WriteCharacteristic, Some(characteristic), None, value),
            move |_, behavior| LinkEvent::CharacteristicWritten {
                service,
                characteristic,
                status: status_of(behavior),
                value: written,
            },
        )
    }

    fn read_descriptor(
        &self,
        service: Uuid,
        characteristic: Uuid,
        descriptor: Uuid,
    ) -> Result<(), StackError> {
        let address = self.address.clone();
        let inner = Arc::clone(&self.inner);
        self.inner.submit(
            &self.address,
            self.generation,
            (SimOp::ReadDescriptor, Some(characteristic), Some(descriptor), &[]),
            move |_, behavior| {
                let enabled = descriptor == CCCD_UUID
                    && inner
                        .state
                        .lock()
                        .links
                        .get(&address)
                        .is_some_and(|slot| slot.notifying.contains(&characteristic));
                LinkEvent::DescriptorRead {
                    service,
                    characteristic,
                    descriptor,
                    status: status_of(behavior),
                    value: if enabled { vec![0x01, 0x00] } else { vec![0x00, 0x00] },
                }
            },
        )
    }

    fn write_descriptor(
        &self,
        service: Uuid,
        characteristic: Uuid,
        descriptor: Uuid,
        value: &[u8],
    ) -> Result<(), StackError> {
        let written = value.to_vec();
        self.inner.submit(
            &self.address,
            self.generation,
            (SimOp::WriteDescriptor, Some(characteristic), Some(descriptor), value),
            move |_, behavior| LinkEvent::DescriptorWritten {
                service,
                characteristic,
                descriptor,
                status: status_of(behavior),
                value: written,
            },
        )
    }

    fn set_notification(
        &self,
        _service: Uuid,
        characteristic: Uuid,
        enable: bool,
    ) -> Result<(), StackError> {
        let mut state = self.inner.state.lock();
        let Some(slot) = state
            .links
            .get_mut(&self.address)
            .filter(|slot| slot.generation == self.generation && slot.connected)
        else {
            return Err(StackError::Unavailable);
        };
        if enable {
            slot.notifying.insert(characteristic);
        } else {
            slot.notifying.remove(&characteristic);
        }
        Ok(())
    }

    fn request_mtu(&self, mtu: u16) -> Result<(), StackError> {
        self.inner.submit(
            &self.address,
            self.generation,
            (SimOp::RequestMtu, None, None, &[]),
            move |peripheral, behavior| LinkEvent::MtuChanged {
                mtu: mtu.min(peripheral.max_mtu),
                status: status_of(behavior),
            },
        )
    }

    fn read_rssi(&self) -> Result<(), StackError> {
        self.inner.submit(
            &self.address,
            self.generation,
            (SimOp::ReadRssi, None, None, &[]),
            |peripheral, behavior| LinkEvent::RssiRead {
                rssi: peripheral.rssi,
                status: status_of(behavior),
            },
        )
    }

    fn set_preferred_phy(&self, tx: Phy, rx: Phy, _option: PhyOption) -> Result<(), StackError> {
        self.inner.submit(
            &self.address,
            self.generation,
            (SimOp::SetPhy, None, None, &[]),
            move |_, behavior| LinkEvent::PhyUpdated {
                tx,
                rx,
                status: status_of(behavior),
            },
        )
    }

    fn close(&self) {
        let mut state = self.inner.state.lock();
        if state
            .links
            .get(&self.address)
            .is_some_and(|slot| slot.generation == self.generation)
        {
            state.links.remove(&self.address);
        }
    }
}

fn key(address: &str) -> String {
    address.to_ascii_uppercase()
}
