//! Adapter descriptors and GATT layout heuristics
//!
//! Cheap ELM327 clones expose the interpreter over one of a handful of
//! GATT layouts. A characteristic is a channel candidate when either its
//! own id or its service id belongs to one of them.

use serde::Serialize;
use uuid::Uuid;

use crate::transport::{Advertisement, CharacteristicInfo, PeripheralId};

/// Expand a 16-bit id onto the Bluetooth base UUID
pub const fn uuid_from_u16(short: u16) -> Uuid {
    Uuid::from_u128(((short as u128) << 96) | 0x0000_0000_0000_1000_8000_0080_5F9B_34FB)
}

/// FFF0 layout: notify FFF1, write FFF2
pub const SERVICE_FFF0: Uuid = uuid_from_u16(0xFFF0);
/// FFE0 layout: FFE1 writes and notifies
pub const SERVICE_FFE0: Uuid = uuid_from_u16(0xFFE0);
/// 18F0 layout: notify 2AF0, write 2AF1
pub const SERVICE_18F0: Uuid = uuid_from_u16(0x18F0);
/// Vendor layout used by vLinker/OBDLink style adapters
pub const SERVICE_VENDOR: Uuid = Uuid::from_u128(0xE7810A71_73AE_499D_8C15_FAA9AEF0C3F2);

/// Services known to carry an ELM327 channel
pub const KNOWN_SERVICES: [Uuid; 4] = [SERVICE_FFF0, SERVICE_FFE0, SERVICE_18F0, SERVICE_VENDOR];

/// Characteristics known to carry an ELM327 channel
pub const KNOWN_CHARACTERISTICS: [Uuid; 6] = [
    uuid_from_u16(0xFFF1),
    uuid_from_u16(0xFFF2),
    uuid_from_u16(0xFFE1),
    uuid_from_u16(0x2AF0),
    uuid_from_u16(0x2AF1),
    Uuid::from_u128(0xBEF8D6C9_9C21_4C9E_B632_BD58C1009F9F),
];

/// Name fragments that suggest an OBD-II adapter
const ADAPTER_NAME_HINTS: &[&str] = &["OBD", "ELM", "VLINK", "VEEPEAK", "KONNWEI", "VGATE"];

/// A peripheral seen during discovery
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AdapterDescriptor {
    /// Platform identifier
    pub id: PeripheralId,
    /// Advertised name, or `Unknown`
    pub name: String,
    /// Signal strength at discovery time (dBm)
    pub rssi: Option<i16>,
    /// Advertised service ids
    #[serde(skip)]
    pub services: Vec<uuid::Uuid>,
    /// Looks like a diagnostic adapter by services or name
    pub is_obd_adapter: bool,
    /// Accepts connections
    pub connectable: bool,
}

impl AdapterDescriptor {
    /// Build a descriptor from a discovery event
    pub fn from_advertisement(advertisement: Advertisement) -> Self {
        let name = advertisement
            .local_name
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| "Unknown".to_string());
        let is_obd_adapter = is_plausible_adapter(&name, &advertisement.services);
        Self {
            id: advertisement.id,
            name,
            rssi: advertisement.rssi,
            services: advertisement.services,
            is_obd_adapter,
            connectable: advertisement.connectable,
        }
    }

    /// Case-insensitive match against a list of known adapter names
    pub fn matches_any(&self, patterns: &[String]) -> bool {
        let name = self.name.to_ascii_uppercase();
        patterns
            .iter()
            .map(|p| p.trim().to_ascii_uppercase())
            .any(|p| !p.is_empty() && name.contains(&p))
    }
}

/// Service or name heuristic for "this is probably an ELM327"
pub fn is_plausible_adapter(name: &str, services: &[Uuid]) -> bool {
    if services.iter().any(|s| KNOWN_SERVICES.contains(s)) {
        return true;
    }
    let name = name.to_ascii_uppercase();
    ADAPTER_NAME_HINTS.iter().any(|hint| name.contains(hint))
}

/// True when the characteristic belongs to a known adapter layout
pub fn is_channel_candidate(characteristic: &CharacteristicInfo) -> bool {
    KNOWN_CHARACTERISTICS.contains(&characteristic.uuid)
        || KNOWN_SERVICES.contains(&characteristic.service)
}

/// Write and notify handles resolved for one connection
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChannelHandles {
    pub write: Option<CharacteristicInfo>,
    pub notify: Option<CharacteristicInfo>,
}

impl ChannelHandles {
    /// Offer characteristics in enumeration order; the first match of each kind wins
    pub fn offer(&mut self, characteristics: &[CharacteristicInfo]) {
        for characteristic in characteristics.iter().filter(|c| is_channel_candidate(c)) {
            if self.write.is_none() && characteristic.properties.is_writable() {
                self.write = Some(characteristic.clone());
            }
            if self.notify.is_none() && characteristic.properties.is_notifying() {
                self.notify = Some(characteristic.clone());
            }
        }
    }

    /// Both handles present
    pub fn is_complete(&self) -> bool {
        self.write.is_some() && self.notify.is_some()
    }

    /// Drop both handles together
    pub fn clear(&mut self) {
        self.write = None;
        self.notify = None;
    }
}
