//! SAE J1979 Diagnostic Trouble Codes
//!
//! A raw trouble code is a big-endian 16-bit word:
//!
//! ```text
//!  15 14 | 13 12 | 11 ..  8 | 7 .. 4 | 3 .. 0
//! system | type  |  digit   | digit  | digit
//! ```

use crate::command::mode;
use crate::response::ElmResponse;
use crate::ObdError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use tracing::debug;

/// Vehicle system a trouble code belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DtcSystem {
    /// P: engine and transmission
    Powertrain,
    /// C: chassis
    Chassis,
    /// B: body
    Body,
    /// U: network and vehicle integration
    Network,
}

impl DtcSystem {
    /// System encoded in the two high bits of a raw word
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            0 => DtcSystem::Powertrain,
            1 => DtcSystem::Chassis,
            2 => DtcSystem::Body,
            _ => DtcSystem::Network,
        }
    }

    /// Two-bit encoding
    pub fn bits(&self) -> u8 {
        match self {
            DtcSystem::Powertrain => 0,
            DtcSystem::Chassis => 1,
            DtcSystem::Body => 2,
            DtcSystem::Network => 3,
        }
    }

    /// Letter used in the printed form
    pub fn letter(&self) -> char {
        match self {
            DtcSystem::Powertrain => 'P',
            DtcSystem::Chassis => 'C',
            DtcSystem::Body => 'B',
            DtcSystem::Network => 'U',
        }
    }

    /// Parse a system letter
    pub fn from_letter(letter: char) -> Option<Self> {
        match letter.to_ascii_uppercase() {
            'P' => Some(DtcSystem::Powertrain),
            'C' => Some(DtcSystem::Chassis),
            'B' => Some(DtcSystem::Body),
            'U' => Some(DtcSystem::Network),
            _ => None,
        }
    }
}

/// A decoded trouble code such as `P0133`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Dtc {
    system: DtcSystem,
    category: u8,
    number: u16,
}

impl Dtc {
    /// Build a code from its parts; `category` is 0..=3, `number` 0..=0xFFF
    pub fn new(system: DtcSystem, category: u8, number: u16) -> Option<Self> {
        if category > 3 || number > 0x0FFF {
            return None;
        }
        Some(Self {
            system,
            category,
            number,
        })
    }

    /// Decode a raw word. Zero means an empty slot and yields `None`.
    pub fn from_word(word: u16) -> Option<Self> {
        if word == 0 {
            return None;
        }
        Some(Self {
            system: DtcSystem::from_bits((word >> 14) as u8),
            category: ((word >> 12) & 0x03) as u8,
            number: word & 0x0FFF,
        })
    }

    /// Decode a big-endian byte pair
    pub fn from_bytes(high: u8, low: u8) -> Option<Self> {
        Self::from_word(u16::from_be_bytes([high, low]))
    }

    /// Raw 16-bit encoding
    pub fn to_word(&self) -> u16 {
        (u16::from(self.system.bits()) << 14) | (u16::from(self.category) << 12) | self.number
    }

    /// Vehicle system
    pub fn system(&self) -> DtcSystem {
        self.system
    }

    /// Type digit (0 = SAE generic, 1 = manufacturer, ...)
    pub fn category(&self) -> u8 {
        self.category
    }

    /// Trailing three hex digits
    pub fn number(&self) -> u16 {
        self.number
    }
}

impl fmt::Display for Dtc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}{:03X}",
            self.system.letter(),
            self.category,
            self.number
        )
    }
}

impl FromStr for Dtc {
    type Err = ObdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ObdError::InvalidResponse(format!("not a trouble code: {}", s));
        let s = s.trim();
        if s.len() != 5 || !s.is_ascii() {
            return Err(invalid());
        }
        let mut chars = s.chars();
        let system = chars
            .next()
            .and_then(DtcSystem::from_letter)
            .ok_or_else(invalid)?;
        let category = chars
            .next()
            .and_then(|c| c.to_digit(4))
            .ok_or_else(invalid)? as u8;
        let number = u16::from_str_radix(&s[2..], 16).map_err(|_| invalid())?;
        Dtc::new(system, category, number).ok_or_else(invalid)
    }
}

impl Serialize for Dtc {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Dtc {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// Decode a mode 03/07 reply into trouble codes.
///
/// `service` is the request mode (`0x03` or `0x07`). Each frame that
/// starts with the positive response byte contributes its byte pairs;
/// zero words are empty slots and are skipped.
pub fn decode_dtc_response(response: &ElmResponse, service: u8) -> Result<Vec<Dtc>, ObdError> {
    let frames = match response {
        ElmResponse::NoData => return Ok(Vec::new()),
        ElmResponse::Error(fault) => return Err(ObdError::InvalidCommand(fault.to_string())),
        ElmResponse::Malformed(reason) => return Err(ObdError::InvalidResponse(reason.clone())),
        ElmResponse::Data(frames) => frames,
    };

    let echo = mode::positive_response(service);
    let mut codes = Vec::new();

    for frame in frames {
        let Some((&first, payload)) = frame.split_first() else {
            continue;
        };
        if first != echo {
            debug!(service = first, "skipping frame for another service");
            continue;
        }
        codes.extend(decode_dtc_payload(payload));
    }

    Ok(codes)
}

/// Decode the bytes that follow the response service byte.
///
/// CAN replies lead with a reported count, which makes the length odd;
/// the count is advisory and only skipped.
pub fn decode_dtc_payload(payload: &[u8]) -> Vec<Dtc> {
    let pairs = if payload.len() % 2 == 1 {
        debug!(reported = payload[0], "CAN trouble code count");
        &payload[1..]
    } else {
        payload
    };

    pairs
        .chunks_exact(2)
        .filter_map(|pair| Dtc::from_bytes(pair[0], pair[1]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_decode_examples() {
        assert_eq!(Dtc::from_bytes(0x01, 0x33).unwrap().to_string(), "P0133");
        assert_eq!(Dtc::from_bytes(0x03, 0x00).unwrap().to_string(), "P0300");
        assert_eq!(Dtc::from_bytes(0x41, 0x23).unwrap().to_string(), "C0123");
        assert_eq!(Dtc::from_bytes(0x9A, 0xBC).unwrap().to_string(), "B1ABC");
        assert_eq!(Dtc::from_bytes(0xC1, 0x00).unwrap().to_string(), "U0100");
        assert!(Dtc::from_bytes(0x00, 0x00).is_none());
    }

    #[test]
    fn test_parse_code() {
        let dtc: Dtc = "P0133".parse().unwrap();
        assert_eq!(dtc.system(), DtcSystem::Powertrain);
        assert_eq!(dtc.category(), 0);
        assert_eq!(dtc.number(), 0x133);
        assert_eq!(dtc.to_word(), 0x0133);
        assert!("P4133".parse::<Dtc>().is_err());
        assert!("X0133".parse::<Dtc>().is_err());
        assert!("P013".parse::<Dtc>().is_err());
    }

    #[test]
    fn test_legacy_reply() {
        let response = ElmResponse::classify("43 01 33 00 00 00 00");
        let codes = decode_dtc_response(&response, mode::READ_DTC).unwrap();
        assert_eq!(codes.len(), 1);
        assert_eq!(codes[0].to_string(), "P0133");
    }

    #[test]
    fn test_can_reply_skips_count() {
        let response = ElmResponse::classify("43 02 01 33 C1 00");
        let codes: Vec<String> = decode_dtc_response(&response, mode::READ_DTC)
            .unwrap()
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(codes, vec!["P0133", "U0100"]);
    }

    #[test]
    fn test_can_multi_frame_reply() {
        let text = "00A\r0: 43 04 01 33 03 00\r1: 01 71 C1 00 00";
        let response = ElmResponse::classify(text);
        let codes: Vec<String> = decode_dtc_response(&response, mode::READ_DTC)
            .unwrap()
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(codes, vec!["P0133", "P0300", "P0171", "U0100"]);
    }

    #[test]
    fn test_no_data_and_error() {
        assert!(decode_dtc_response(&ElmResponse::NoData, mode::READ_DTC)
            .unwrap()
            .is_empty());
        let err = decode_dtc_response(&ElmResponse::classify("?"), mode::READ_DTC).unwrap_err();
        assert!(matches!(err, ObdError::InvalidCommand(_)));
    }

    #[test]
    fn test_pending_reply_uses_its_own_echo() {
        let response = ElmResponse::classify("47 01 71 00 00 00 00");
        let codes = decode_dtc_response(&response, mode::PENDING_DTC).unwrap();
        assert_eq!(codes[0].to_string(), "P0171");
        assert!(decode_dtc_response(&response, mode::READ_DTC)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_serde_as_string() {
        let dtc: Dtc = "U0100".parse().unwrap();
        let json = serde_json::to_string(&dtc).unwrap();
        assert_eq!(json, "\"U0100\"");
        let back: Dtc = serde_json::from_str(&json).unwrap();
        assert_eq!(back, dtc);
    }

    proptest! {
        #[test]
        fn prop_nonzero_words_print_as_codes(high in any::<u8>(), low in any::<u8>()) {
            prop_assume!(high != 0 || low != 0);
            let code = Dtc::from_bytes(high, low).unwrap().to_string();
            prop_assert_eq!(code.len(), 5);
            let mut chars = code.chars();
            prop_assert!("PCBU".contains(chars.next().unwrap()));
            prop_assert!(('0'..='3').contains(&chars.next().unwrap()));
            prop_assert!(chars.all(|c| c.is_ascii_digit() || ('A'..='F').contains(&c)));
        }

        #[test]
        fn prop_p03xx_components_survive_encoding(number in 0x300u16..0x400) {
            let original = Dtc::new(DtcSystem::Powertrain, 0, number).unwrap();
            let [high, low] = original.to_word().to_be_bytes();
            let decoded = Dtc::from_bytes(high, low).unwrap();
            prop_assert_eq!(decoded.system(), DtcSystem::Powertrain);
            prop_assert_eq!(decoded.category(), 0);
            prop_assert_eq!(decoded.number(), number);
            prop_assert_eq!(decoded.to_string(), format!("P0{:03X}", number));
        }
    }
}
