//! Vehicle profile
//!
//! Header addresses and data identifiers used by the extended reads.
//! These are model-specific values rather than protocol rules; the
//! defaults match the vehicles the probe was built against and can be
//! overridden from configuration.

use obd_protocol::did;
use serde::{Deserialize, Serialize};

/// A single bit inside a data identifier reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusBit {
    /// Data identifier to read
    pub did: u16,
    /// Offset of the byte after the 3-byte positive prefix
    pub byte: usize,
    /// Bit within that byte, 0 = least significant
    pub bit: u8,
}

/// Position identifiers for the four windows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowIdentifiers {
    pub front_left: u16,
    pub front_right: u16,
    pub rear_left: u16,
    pub rear_right: u16,
}

impl Default for WindowIdentifiers {
    fn default() -> Self {
        Self {
            front_left: 0x4101,
            front_right: 0x4102,
            rear_left: 0x4103,
            rear_right: 0x4104,
        }
    }
}

/// Addresses and identifiers for one vehicle family
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VehicleProfile {
    /// Functional broadcast address restored after every addressed read
    pub broadcast_header: String,
    /// Engine controller; also answers the VIN read
    pub engine_header: String,
    /// Transmission controller
    pub transmission_header: String,
    /// Body controller for windows and sunroof
    pub body_header: String,
    pub vin_did: u16,
    /// Serial number identifier, read from both engine and transmission
    pub serial_number_did: u16,
    /// Remote start enable flag
    pub remote_start: StatusBit,
    /// Body controller addresses tried in order for remote start
    pub remote_start_candidates: Vec<String>,
    pub windows: WindowIdentifiers,
    pub sunroof_did: u16,
    /// `ATST` value while probing (units of 4.096 ms)
    pub probe_timeout: u8,
    /// `ATST` value restored after probing
    pub default_timeout: u8,
}

impl Default for VehicleProfile {
    fn default() -> Self {
        Self {
            broadcast_header: "7DF".to_string(),
            engine_header: "7E0".to_string(),
            transmission_header: "7E1".to_string(),
            body_header: "726".to_string(),
            vin_did: did::VIN,
            serial_number_did: did::ECU_SERIAL_NUMBER,
            remote_start: StatusBit {
                did: 0x4047,
                byte: 0,
                bit: 0,
            },
            remote_start_candidates: ["726", "740", "7A0", "765"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            windows: WindowIdentifiers::default(),
            sunroof_did: 0x4110,
            probe_timeout: 0x19,
            default_timeout: 0x32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_probe_order() {
        let profile = VehicleProfile::default();
        assert_eq!(profile.remote_start_candidates, vec!["726", "740", "7A0", "765"]);
        assert_eq!(profile.remote_start.did, 0x4047);
    }

    #[test]
    fn test_partial_override() {
        let profile: VehicleProfile = serde_json::from_str(
            r#"{"body_header": "740", "windows": {"rear_right": 16648}}"#,
        )
        .unwrap();
        assert_eq!(profile.body_header, "740");
        assert_eq!(profile.windows.rear_right, 0x4108);
        assert_eq!(profile.windows.front_left, 0x4101);
        assert_eq!(profile.broadcast_header, "7DF");
    }
}
