//! UDS ReadDataByIdentifier (service 0x22) payloads

use crate::command::mode;
use crate::response::ElmResponse;

/// Vehicle identification number
pub const VIN: u16 = 0xF190;
/// ECU serial number
pub const ECU_SERIAL_NUMBER: u16 = 0xF18C;

/// Data bytes of a positive 0x22 reply for `did`.
///
/// Looks for a frame starting with `62 <did hi> <did lo>` and returns what
/// follows it. Negative replies (`7F 22 <nrc>`) and replies for another
/// identifier yield `None`.
pub fn positive_payload(response: &ElmResponse, did: u16) -> Option<Vec<u8>> {
    let [hi, lo] = did.to_be_bytes();
    let prefix = [mode::positive_response(mode::READ_DATA_BY_ID), hi, lo];

    response
        .frames()?
        .iter()
        .find_map(|frame| frame.strip_prefix(&prefix[..]).map(<[u8]>::to_vec))
}

/// Negative response code carried by a `7F 22 xx` reply
pub fn negative_response_code(response: &ElmResponse) -> Option<u8> {
    response.frames()?.iter().find_map(|frame| match frame.as_slice() {
        [mode::NEGATIVE_RESPONSE, mode::READ_DATA_BY_ID, nrc, ..] => Some(*nrc),
        _ => None,
    })
}

/// ASCII text of a payload with control characters and padding removed
pub fn decode_ascii(payload: &[u8]) -> Option<String> {
    let text: String = payload
        .iter()
        .filter(|b| b.is_ascii() && !b.is_ascii_control())
        .map(|&b| b as char)
        .collect();
    let text = text.trim();
    if text.is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}

/// Decode a reply to `22 <did>` as ASCII
pub fn read_ascii(response: &ElmResponse, did: u16) -> Option<String> {
    positive_payload(response, did).and_then(|payload| decode_ascii(&payload))
}

/// Extract one status bit from a positive reply
pub fn read_bit(response: &ElmResponse, did: u16, byte_offset: usize, bit: u8) -> Option<bool> {
    let payload = positive_payload(response, did)?;
    let byte = payload.get(byte_offset)?;
    Some(byte & (1 << (bit & 0x07)) != 0)
}

/// Extract one raw data byte from a positive reply
pub fn read_byte(response: &ElmResponse, did: u16, byte_offset: usize) -> Option<u8> {
    positive_payload(response, did)?.get(byte_offset).copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    const VIN_REPLY: &str = "014\r0: 62 F1 90 53 41 4A\r1: 44 41 41 41 30 37\r2: 48 41 31 32 33 34 35";

    #[test]
    fn test_vin_decode() {
        let response = ElmResponse::classify(VIN_REPLY);
        assert_eq!(read_ascii(&response, VIN).as_deref(), Some("SAJDAAA07HA12345"));
    }

    #[test]
    fn test_wrong_identifier() {
        let response = ElmResponse::classify(VIN_REPLY);
        assert_eq!(read_ascii(&response, ECU_SERIAL_NUMBER), None);
    }

    #[test]
    fn test_negative_response() {
        let response = ElmResponse::classify("7F 22 31");
        assert_eq!(positive_payload(&response, VIN), None);
        assert_eq!(negative_response_code(&response), Some(0x31));
    }

    #[test]
    fn test_ascii_trims_control_characters() {
        assert_eq!(
            decode_ascii(&[0x00, 0x41, 0x42, 0x0D, 0x43, 0xFF, 0x20]).as_deref(),
            Some("ABC")
        );
        assert_eq!(decode_ascii(&[0x00, 0x00]), None);
    }

    #[test]
    fn test_status_bit() {
        let response = ElmResponse::classify("62 40 47 01");
        assert_eq!(read_bit(&response, 0x4047, 0, 0), Some(true));
        assert_eq!(read_bit(&response, 0x4047, 0, 1), Some(false));
        assert_eq!(read_bit(&response, 0x4047, 1, 0), None);
        assert_eq!(read_byte(&response, 0x4047, 0), Some(0x01));
    }
}
