//! Advertisement data parsing.
//!
//! Raw AD structures are `[len][type][payload...]` repeated. Unknown types
//! are skipped; a truncated trailing structure ends parsing.

use uuid::Uuid;

use crate::radio::Advertisement;
use crate::types::Device;

const AD_FLAGS: u8 = 0x01;
const AD_INCOMPLETE_UUID16: u8 = 0x02;
const AD_COMPLETE_UUID16: u8 = 0x03;
const AD_INCOMPLETE_UUID32: u8 = 0x04;
const AD_COMPLETE_UUID32: u8 = 0x05;
const AD_INCOMPLETE_UUID128: u8 = 0x06;
const AD_COMPLETE_UUID128: u8 = 0x07;
const AD_SHORT_NAME: u8 = 0x08;
const AD_COMPLETE_NAME: u8 = 0x09;
const AD_TX_POWER: u8 = 0x0A;
const AD_SERVICE_DATA_UUID16: u8 = 0x16;
const AD_MANUFACTURER_DATA: u8 = 0xFF;

/// Bluetooth base UUID; 16- and 32-bit UUIDs replace its first four bytes.
const BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5f9b_34fb;

/// Advertisement normalized into one shape for every scanner strategy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedAdvertisement {
    /// Complete or shortened local name.
    pub local_name: Option<String>,
    /// Flags byte.
    pub flags: Option<u8>,
    /// Advertised service UUIDs.
    pub service_uuids: Vec<Uuid>,
    /// TX power level in dBm.
    pub tx_power: Option<i8>,
    /// Service data keyed by service UUID.
    pub service_data: Vec<(Uuid, Vec<u8>)>,
    /// Manufacturer data keyed by company id.
    pub manufacturer_data: Vec<(u16, Vec<u8>)>,
}

impl ParsedAdvertisement {
    /// Parse raw AD structures.
    #[must_use]
    pub fn parse(data: &[u8]) -> Self {
        let mut parsed = Self::default();
        let mut rest = data;

        while let Some((&len, tail)) = rest.split_first() {
            let len = usize::from(len);
            if len == 0 {
                break;
            }
            if tail.len() < len {
                break;
            }
            let (structure, next) = tail.split_at(len);
            rest = next;

            let (ad_type, payload) = (structure[0], &structure[1..]);
            match ad_type {
                AD_FLAGS => parsed.flags = payload.first().copied(),
                AD_INCOMPLETE_UUID16 | AD_COMPLETE_UUID16 => {
                    parsed.service_uuids.extend(payload.chunks_exact(2).map(|c| {
                        uuid_from_short(u32::from(u16::from_le_bytes([c[0], c[1]])))
                    }));
                }
                AD_INCOMPLETE_UUID32 | AD_COMPLETE_UUID32 => {
                    parsed.service_uuids.extend(
                        payload
                            .chunks_exact(4)
                            .map(|c| uuid_from_short(u32::from_le_bytes([c[0], c[1], c[2], c[3]]))),
                    );
                }
                AD_INCOMPLETE_UUID128 | AD_COMPLETE_UUID128 => {
                    parsed
                        .service_uuids
                        .extend(payload.chunks_exact(16).filter_map(uuid_from_le_slice));
                }
                AD_COMPLETE_NAME => {
                    parsed.local_name = Some(String::from_utf8_lossy(payload).into_owned());
                }
                AD_SHORT_NAME => {
                    if parsed.local_name.is_none() {
                        parsed.local_name = Some(String::from_utf8_lossy(payload).into_owned());
                    }
                }
                AD_TX_POWER => {
                    parsed.tx_power = payload.first().map(|&b| i8::from_le_bytes([b]));
                }
                AD_SERVICE_DATA_UUID16 if payload.len() >= 2 => {
                    let uuid = uuid_from_short(u32::from(u16::from_le_bytes([payload[0], payload[1]])));
                    parsed.service_data.push((uuid, payload[2..].to_vec()));
                }
                AD_MANUFACTURER_DATA if payload.len() >= 2 => {
                    let company = u16::from_le_bytes([payload[0], payload[1]]);
                    parsed.manufacturer_data.push((company, payload[2..].to_vec()));
                }
                _ => {}
            }
        }

        parsed
    }
}

/// Expand a 16- or 32-bit UUID against the base UUID.
#[must_use]
pub fn uuid_from_short(short: u32) -> Uuid {
    Uuid::from_u128(BASE_UUID | (u128::from(short) << 96))
}

fn uuid_from_le_slice(bytes: &[u8]) -> Option<Uuid> {
    let mut raw: [u8; 16] = bytes.try_into().ok()?;
    raw.reverse();
    Some(Uuid::from_bytes(raw))
}

/// Build a [`Device`] record from a raw advertisement, or refresh `existing`.
///
/// Returns `None` for addresses that are not well formed.
pub(crate) fn device_from(
    adv: &Advertisement,
    parsed: &ParsedAdvertisement,
    existing: Option<&Device>,
) -> Option<Device> {
    let mut device = match existing {
        Some(device) => device.clone(),
        None => Device::new(&adv.address).ok()?,
    };
    if let Some(name) = adv.name.clone().or_else(|| parsed.local_name.clone()) {
        device.name = Some(name);
    }
    device.rssi = Some(adv.rssi);
    device.raw_advertisement = Some(adv.data.clone());
    if adv.connectable.is_some() {
        device.connectable = adv.connectable;
    }
    Some(device)
}
