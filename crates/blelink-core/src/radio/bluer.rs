//! BlueZ backend over D-Bus.
//!
//! Every submission spawns a task that awaits the `bluer` call and posts the
//! matching [`LinkEvent`]. BlueZ negotiates the ATT MTU and the PHY on its
//! own, so [`GattLink::request_mtu`] and [`GattLink::set_preferred_phy`]
//! report [`StackError::Unsupported`]. BlueZ also owns the CCCD: writes to it
//! complete immediately once [`GattLink::set_notification`] has subscribed.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use bluer::gatt::remote::{Characteristic, CharacteristicWriteRequest, Descriptor};
use bluer::gatt::WriteOp;
use bluer::{
    Adapter, AdapterEvent, AdapterProperty, Address, DeviceEvent, DeviceProperty,
    DiscoveryFilter, DiscoveryTransport, Session,
};
use futures::{pin_mut, StreamExt};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};
use uuid::Uuid;

use super::{
    Advertisement, AdvertisementSender, CharacteristicProperties, GattCharacteristic, GattLink,
    GattService, LinkEvent, LinkEventSender, RadioStack, StackError, StackScanSettings, CCCD_UUID,
    GATT_ERROR, GATT_SUCCESS,
};
use crate::request::WriteMode;
use crate::scanner::ScanError;
use crate::types::{AdapterState, BondState, Phy, PhyOption};

impl From<bluer::Error> for StackError {
    fn from(err: bluer::Error) -> Self {
        match err.kind {
            bluer::ErrorKind::NotReady | bluer::ErrorKind::ServicesUnresolved => Self::Unavailable,
            bluer::ErrorKind::NotSupported => Self::Unsupported("operation"),
            _ => Self::Rejected(err.to_string()),
        }
    }
}

struct BluerInner {
    adapter: Adapter,
    handle: Handle,
    adapter_state: watch::Sender<AdapterState>,
    scan: Mutex<Option<JoinHandle<()>>>,
    bonds: Mutex<HashMap<String, BondState>>,
}

/// [`RadioStack`] backed by the default BlueZ adapter.
pub struct BluerRadio {
    inner: Arc<BluerInner>,
    watcher: JoinHandle<()>,
}

impl BluerRadio {
    /// Connect to BlueZ and open the default adapter.
    ///
    /// # Errors
    ///
    /// Returns [`StackError::Unavailable`] if D-Bus or the adapter cannot be
    /// reached.
    pub async fn new() -> Result<Arc<Self>, StackError> {
        let session = Session::new().await.map_err(|err| {
            error!(error = %err, "cannot open BlueZ session");
            StackError::Unavailable
        })?;
        let adapter = session.default_adapter().await.map_err(|err| {
            error!(error = %err, "no Bluetooth adapter");
            StackError::Unavailable
        })?;
        let powered = adapter.is_powered().await.unwrap_or(false);
        debug!(adapter = %adapter.name(), powered, "BlueZ adapter opened");

        let (adapter_state, _) = watch::channel(if powered {
            AdapterState::On
        } else {
            AdapterState::Off
        });
        let inner = Arc::new(BluerInner {
            adapter,
            handle: Handle::current(),
            adapter_state,
            scan: Mutex::new(None),
            bonds: Mutex::new(HashMap::new()),
        });
        let watcher = tokio::spawn(watch_power(Arc::clone(&inner)));
        Ok(Arc::new(Self { inner, watcher }))
    }
}

impl Drop for BluerRadio {
    fn drop(&mut self) {
        self.watcher.abort();
        if let Some(scan) = self.inner.scan.lock().take() {
            scan.abort();
        }
    }
}

async fn watch_power(inner: Arc<BluerInner>) {
    let events = match inner.adapter.events().await {
        Ok(events) => events,
        Err(err) => {
            warn!(error = %err, "cannot watch adapter power");
            return;
        }
    };
    pin_mut!(events);
    while let Some(event) = events.next().await {
        if let AdapterEvent::PropertyChanged(AdapterProperty::Powered(powered)) = event {
            let state = if powered {
                AdapterState::On
            } else {
                AdapterState::Off
            };
            inner.adapter_state.send_replace(state);
        }
    }
}

fn parse_address(address: &str) -> Result<Address, StackError> {
    address
        .parse()
        .map_err(|_| StackError::Rejected(format!("invalid address {address}")))
}

/// Rebuild AD structures from the properties BlueZ exposes.
fn encode_advertisement(
    name: Option<&str>,
    uuids: &HashSet<Uuid>,
    manufacturer: &HashMap<u16, Vec<u8>>,
) -> Vec<u8> {
    let mut data = Vec::new();
    let mut push = |kind: u8, payload: &[u8]| {
        if let Ok(len) = u8::try_from(payload.len() + 1) {
            data.push(len);
            data.push(kind);
            data.extend_from_slice(payload);
        }
    };
    if let Some(name) = name {
        push(0x09, name.as_bytes());
    }
    for uuid in uuids {
        push(0x07, &uuid.as_u128().to_le_bytes());
    }
    for (company, payload) in manufacturer {
        let mut bytes = company.to_le_bytes().to_vec();
        bytes.extend_from_slice(payload);
        push(0xFF, &bytes);
    }
    data
}

async fn advertisement(
    adapter: &Adapter,
    address: Address,
) -> bluer::Result<Option<Advertisement>> {
    let device = adapter.device(address)?;
    let Some(rssi) = device.rssi().await? else {
        return Ok(None);
    };
    let name = device.name().await?;
    let uuids = device.uuids().await?.unwrap_or_default();
    let manufacturer = device.manufacturer_data().await?.unwrap_or_default();
    Ok(Some(Advertisement {
        address: address.to_string(),
        data: encode_advertisement(name.as_deref(), &uuids, &manufacturer),
        name,
        rssi,
        connectable: None,
    }))
}

async fn run_scan(adapter: Adapter, settings: StackScanSettings, results: AdvertisementSender) {
    let mut filter = DiscoveryFilter {
        transport: DiscoveryTransport::Le,
        ..DiscoveryFilter::default()
    };
    if let Some(filters) = &settings.filters {
        filter.uuids = filters.service_uuids.iter().copied().collect();
        filter.rssi = filters.min_rssi;
    }
    if let Err(err) = adapter.set_discovery_filter(filter).await {
        warn!(error = %err, "discovery filter rejected");
    }

    let events = match adapter.discover_devices_with_changes().await {
        Ok(events) => events,
        Err(err) => {
            error!(error = %err, "discovery failed to start");
            return;
        }
    };
    pin_mut!(events);
    while let Some(event) = events.next().await {
        let AdapterEvent::DeviceAdded(address) = event else {
            continue;
        };
        match advertisement(&adapter, address).await {
            Ok(Some(adv)) => {
                if results.send(adv).is_err() {
                    break;
                }
            }
            Ok(None) => {}
            Err(err) => trace!(%address, error = %err, "skipping device"),
        }
    }
}

impl RadioStack for BluerRadio {
    fn adapter_state(&self) -> AdapterState {
        *self.inner.adapter_state.borrow()
    }

    fn watch_adapter(&self) -> watch::Receiver<AdapterState> {
        self.inner.adapter_state.subscribe()
    }

    fn open_link(
        &self,
        address: &str,
        events: LinkEventSender,
    ) -> Result<Arc<dyn GattLink>, StackError> {
        if self.adapter_state() == AdapterState::Off {
            return Err(StackError::Unavailable);
        }
        let device = self.inner.adapter.device(parse_address(address)?)?;
        let link = Arc::new(BluerLink {
            device,
            events,
            handle: self.inner.handle.clone(),
            state: Arc::new(Mutex::new(LinkState::default())),
        });
        let connect = Arc::clone(&link);
        let task = self.inner.handle.spawn(async move { connect.run().await });
        link.state.lock().tasks.push(task);
        Ok(link)
    }

    fn start_scan(
        &self,
        settings: &StackScanSettings,
        results: AdvertisementSender,
    ) -> Result<(), ScanError> {
        if self.adapter_state() == AdapterState::Off {
            return Err(ScanError::ScanFailed("adapter is off".to_string()));
        }
        let task = self.inner.handle.spawn(run_scan(
            self.inner.adapter.clone(),
            settings.clone(),
            results,
        ));
        if let Some(previous) = self.inner.scan.lock().replace(task) {
            previous.abort();
        }
        Ok(())
    }

    fn stop_scan(&self) {
        if let Some(scan) = self.inner.scan.lock().take() {
            scan.abort();
        }
    }

    fn bond_state(&self, address: &str) -> BondState {
        self.inner
            .bonds
            .lock()
            .get(&address.to_ascii_uppercase())
            .copied()
            .unwrap_or_default()
    }

    fn create_bond(&self, address: &str) -> bool {
        let device = parse_address(address)
            .and_then(|a| self.inner.adapter.device(a).map_err(StackError::from));
        let Ok(device) = device else {
            return false;
        };
        let key = address.to_ascii_uppercase();
        self.inner.bonds.lock().insert(key.clone(), BondState::Bonding);
        let inner = Arc::clone(&self.inner);
        self.inner.handle.spawn(async move {
            let state = match device.pair().await {
                Ok(()) => BondState::Bonded,
                Err(err) => {
                    warn!(address = %key, error = %err, "pairing failed");
                    BondState::None
                }
            };
            inner.bonds.lock().insert(key, state);
        });
        true
    }
}

#[derive(Default)]
struct LinkState {
    characteristics: HashMap<(Uuid, Uuid), Characteristic>,
    descriptors: HashMap<(Uuid, Uuid), Descriptor>,
    subscriptions: HashMap<(Uuid, Uuid), JoinHandle<()>>,
    tasks: Vec<JoinHandle<()>>,
}

struct BluerLink {
    device: bluer::Device,
    events: LinkEventSender,
    handle: Handle,
    state: Arc<Mutex<LinkState>>,
}

impl BluerLink {
    async fn run(&self) {
        if let Err(err) = self.device.connect().await {
            warn!(address = %self.device.address(), error = %err, "connect failed");
            let _ = self.events.send(LinkEvent::ConnectionStateChanged {
                connected: false,
                status: GATT_ERROR,
            });
            return;
        }
        let _ = self.events.send(LinkEvent::ConnectionStateChanged {
            connected: true,
            status: GATT_SUCCESS,
        });

        let Ok(changes) = self.device.events().await else {
            return;
        };
        pin_mut!(changes);
        while let Some(DeviceEvent::PropertyChanged(property)) = changes.next().await {
            if matches!(property, DeviceProperty::Connected(false)) {
                let _ = self.events.send(LinkEvent::ConnectionStateChanged {
                    connected: false,
                    status: GATT_ERROR,
                });
                break;
            }
        }
    }

    fn spawn<F>(&self, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let task = self.handle.spawn(task);
        let mut state = self.state.lock();
        state.tasks.retain(|t| !t.is_finished());
        state.tasks.push(task);
    }

    fn characteristic(
        &self,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<Characteristic, StackError> {
        self.state
            .lock()
            .characteristics
            .get(&(service, characteristic))
            .cloned()
            .ok_or(StackError::Unavailable)
    }

    fn descriptor(&self, characteristic: Uuid, descriptor: Uuid) -> Result<Descriptor, StackError> {
        self.state
            .lock()
            .descriptors
            .get(&(characteristic, descriptor))
            .cloned()
            .ok_or(StackError::Unavailable)
    }

    fn send(events: &LinkEventSender, event: LinkEvent) {
        let _ = events.send(event);
    }
}

fn status<T>(result: &bluer::Result<T>) -> u16 {
    if result.is_ok() {
        GATT_SUCCESS
    } else {
        GATT_ERROR
    }
}

async fn resolve_services(
    device: &bluer::Device,
) -> bluer::Result<(Vec<GattService>, LinkState)> {
    let mut services = Vec::new();
    let mut cache = LinkState::default();
    for service in device.services().await? {
        let service_uuid = service.uuid().await?;
        let mut characteristics = Vec::new();
        for characteristic in service.characteristics().await? {
            let uuid = characteristic.uuid().await?;
            let flags = characteristic.flags().await?;
            let mut properties = CharacteristicProperties::default();
            for (set, bit) in [
                (flags.broadcast, CharacteristicProperties::BROADCAST),
                (flags.read, CharacteristicProperties::READ),
                (flags.write_without_response, CharacteristicProperties::WRITE_NO_RESPONSE),
                (flags.write, CharacteristicProperties::WRITE),
                (flags.notify, CharacteristicProperties::NOTIFY),
                (flags.indicate, CharacteristicProperties::INDICATE),
                (flags.authenticated_signed_writes, CharacteristicProperties::SIGNED_WRITE),
            ] {
                if set {
                    properties = properties | bit;
                }
            }

            let mut entry = GattCharacteristic::new(uuid, properties);
            for descriptor in characteristic.descriptors().await? {
                let descriptor_uuid = descriptor.uuid().await?;
                entry = entry.with_descriptor(descriptor_uuid);
                cache.descriptors.insert((uuid, descriptor_uuid), descriptor);
            }
            if (flags.notify || flags.indicate) && !entry.descriptors.contains(&CCCD_UUID) {
                entry = entry.with_descriptor(CCCD_UUID);
            }
            characteristics.push(entry);
            cache.characteristics.insert((service_uuid, uuid), characteristic);
        }
        services.push(GattService {
            uuid: service_uuid,
            characteristics,
        });
    }
    Ok((services, cache))
}

impl GattLink for BluerLink {
    fn discover_services(&self) -> Result<(), StackError> {
        let device = self.device.clone();
        let events = self.events.clone();
        let state = Arc::clone(&self.state);
        self.spawn(async move {
            let (status, services) = match resolve_services(&device).await {
                Ok((services, cache)) => {
                    let mut state = state.lock();
                    state.characteristics = cache.characteristics;
                    state.descriptors = cache.descriptors;
                    (GATT_SUCCESS, services)
                }
                Err(err) => {
                    error!(error = %err, "service resolution failed");
                    (GATT_ERROR, Vec::new())
                }
            };
            Self::send(&events, LinkEvent::ServicesDiscovered { status, services });
        });
        Ok(())
    }

    fn read_characteristic(&self, service: Uuid, characteristic: Uuid) -> Result<(), StackError> {
        let remote = self.characteristic(service, characteristic)?;
        let events = self.events.clone();
        self.spawn(async move {
            let result = remote.read().await;
            Self::send(
                &events,
                LinkEvent::CharacteristicRead {
                    service,
                    characteristic,
                    status: status(&result),
                    value: result.unwrap_or_default(),
                },
            );
        });
        Ok(())
    }

    fn write_characteristic(
        &self,
        service: Uuid,
        characteristic: Uuid,
        value: &[u8],
        mode: WriteMode,
    ) -> Result<(), StackError> {
        let remote = self.characteristic(service, characteristic)?;
        let events = self.events.clone();
        let value = value.to_vec();
        self.spawn(async move {
            let request = CharacteristicWriteRequest {
                op_type: if mode.is_acknowledged() {
                    WriteOp::Request
                } else {
                    WriteOp::Command
                },
                ..CharacteristicWriteRequest::default()
            };
            let result = remote.write_ext(&value, &request).await;
            if mode.is_acknowledged() {
                Self::send(
                    &events,
                    LinkEvent::CharacteristicWritten {
                        service,
                        characteristic,
                        status: status(&result),
                        value,
                    },
                );
            } else if let Err(err) = result {
                warn!(%characteristic, error = %err, "unacknowledged write failed");
            }
        });
        Ok(())
    }

    fn read_descriptor(
        &self,
        service: Uuid,
        characteristic: Uuid,
        descriptor: Uuid,
    ) -> Result<(), StackError> {
        let remote = self.descriptor(characteristic, descriptor)?;
        let events = self.events.clone();
        self.spawn(async move {
            let result = remote.read().await;
            Self::send(
                &events,
                LinkEvent::DescriptorRead {
                    service,
                    characteristic,
                    descriptor,
                    status: status(&result),
                    value: result.unwrap_or_default(),
                },
            );
        });
        Ok(())
    }

    fn write_descriptor(
        &self,
        service: Uuid,
        characteristic: Uuid,
        descriptor: Uuid,
        value: &[u8],
    ) -> Result<(), StackError> {
        let value = value.to_vec();
        if descriptor == CCCD_UUID {
            Self::send(
                &self.events,
                LinkEvent::DescriptorWritten {
                    service,
                    characteristic,
                    descriptor,
                    status: GATT_SUCCESS,
                    value,
                },
            );
            return Ok(());
        }
        let remote = self.descriptor(characteristic, descriptor)?;
        let events = self.events.clone();
        self.spawn(async move {
            let result = remote.write(&value).await;
            Self::send(
                &events,
                LinkEvent::DescriptorWritten {
                    service,
                    characteristic,
                    descriptor,
                    status: status(&result),
                    value,
                },
            );
        });
        Ok(())
    }

    fn set_notification(
        &self,
        service: Uuid,
        characteristic: Uuid,
        enable: bool,
    ) -> Result<(), StackError> {
        let key = (service, characteristic);
        if let Some(previous) = self.state.lock().subscriptions.remove(&key) {
            previous.abort();
        }
        if !enable {
            return Ok(());
        }
        let remote = self.characteristic(service, characteristic)?;
        let events = self.events.clone();
        let task = self.handle.spawn(async move {
            let values = match remote.notify().await {
                Ok(values) => values,
                Err(err) => {
                    warn!(%characteristic, error = %err, "subscription failed");
                    return;
                }
            };
            pin_mut!(values);
            while let Some(value) = values.next().await {
                Self::send(
                    &events,
                    LinkEvent::CharacteristicChanged {
                        service,
                        characteristic,
                        value,
                    },
                );
            }
        });
        self.state.lock().subscriptions.insert(key, task);
        Ok(())
    }

    fn request_mtu(&self, _mtu: u16) -> Result<(), StackError> {
        Err(StackError::Unsupported("mtu negotiation"))
    }

    fn read_rssi(&self) -> Result<(), StackError> {
        let device = self.device.clone();
        let events = self.events.clone();
        self.spawn(async move {
            let (rssi, status) = match device.rssi().await {
                Ok(Some(rssi)) => (rssi, GATT_SUCCESS),
                _ => (0, GATT_ERROR),
            };
            Self::send(&events, LinkEvent::RssiRead { rssi, status });
        });
        Ok(())
    }

    fn set_preferred_phy(&self, _tx: Phy, _rx: Phy, _option: PhyOption) -> Result<(), StackError> {
        Err(StackError::Unsupported("phy selection"))
    }

    fn close(&self) {
        let mut state = self.state.lock();
        for (_, task) in state.subscriptions.drain() {
            task.abort();
        }
        for task in state.tasks.drain(..) {
            task.abort();
        }
        drop(state);

        let device = self.device.clone();
        self.handle.spawn(async move {
            if let Err(err) = device.disconnect().await {
                debug!(error = %err, "disconnect failed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::advertisement::ParsedAdvertisement;

    #[test]
    fn test_encoded_advertisement_parses_back() {
        let uuid = uuid::uuid!("6e400001-b5a3-f393-e0a9-e50e24dcca9e");
        let uuids = HashSet::from([uuid]);
        let manufacturer = HashMap::from([(0x0059_u16, vec![0xAA, 0xBB])]);

        let data = encode_advertisement(Some("Sensor"), &uuids, &manufacturer);
        let parsed = ParsedAdvertisement::parse(&data);
        assert_eq!(parsed.local_name.as_deref(), Some("Sensor"));
        assert_eq!(parsed.service_uuids, vec![uuid]);
    }
}
