//! ELM327 Response Tokenizer
//!
//! Turns the raw text between two prompts into a typed classification
//! that every decoder consumes the same way.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Bus-level fault markers reported by the interpreter
const BUS_FAULT_MARKERS: &[&str] = &[
    "CAN ERROR",
    "BUS ERROR",
    "BUS BUSY",
    "FB ERROR",
    "DATA ERROR",
    "BUFFER FULL",
    "LV RESET",
];

/// Error reported by the interpreter in place of data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ElmFault {
    /// Request interrupted before a reply arrived
    Stopped,
    /// No ECU answered the protocol search
    UnableToConnect,
    /// Bus or interpreter hardware fault
    Bus(String),
    /// Interpreter did not understand the command (`?`)
    UnknownCommand,
    /// Any other `ERROR`/`ERRxx` line
    Other(String),
}

impl fmt::Display for ElmFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ElmFault::Stopped => write!(f, "STOPPED"),
            ElmFault::UnableToConnect => write!(f, "UNABLE TO CONNECT"),
            ElmFault::Bus(marker) => write!(f, "{}", marker),
            ElmFault::UnknownCommand => write!(f, "?"),
            ElmFault::Other(line) => write!(f, "{}", line),
        }
    }
}

/// Classified reply to a data command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElmResponse {
    /// Hex payload, one frame per responding ECU
    Data(Vec<Vec<u8>>),
    /// Interpreter reported `NO DATA`
    NoData,
    /// Interpreter reported an error token
    Error(ElmFault),
    /// Text that is neither data nor a known marker
    Malformed(String),
}

impl ElmResponse {
    /// Classify a complete reply (prompt already stripped)
    pub fn classify(text: &str) -> Self {
        let upper = text.to_ascii_uppercase();

        if upper.contains("NO DATA") {
            return ElmResponse::NoData;
        }
        if upper.contains("STOPPED") {
            return ElmResponse::Error(ElmFault::Stopped);
        }
        if upper.contains("UNABLE TO CONNECT") {
            return ElmResponse::Error(ElmFault::UnableToConnect);
        }
        if let Some(marker) = BUS_FAULT_MARKERS.iter().find(|m| upper.contains(**m)) {
            return ElmResponse::Error(ElmFault::Bus((*marker).to_string()));
        }

        let lines: Vec<&str> = upper
            .split(['\r', '\n'])
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .collect();

        if lines.iter().any(|line| *line == "?") {
            return ElmResponse::Error(ElmFault::UnknownCommand);
        }
        // Checked before noise filtering: `BUS INIT: ...ERROR` is a failure
        if let Some(line) = lines
            .iter()
            .find(|line| line.starts_with("ERR") || line.contains("ERROR"))
        {
            return ElmResponse::Error(ElmFault::Other((*line).to_string()));
        }

        match parse_frames(&lines) {
            Ok(frames) if frames.is_empty() => {
                ElmResponse::Malformed("empty response".to_string())
            }
            Ok(frames) => ElmResponse::Data(frames),
            Err(reason) => ElmResponse::Malformed(reason),
        }
    }

    /// Frames of a data reply
    pub fn frames(&self) -> Option<&[Vec<u8>]> {
        match self {
            ElmResponse::Data(frames) => Some(frames),
            _ => None,
        }
    }

    /// All data bytes concatenated in arrival order
    pub fn bytes(&self) -> Option<Vec<u8>> {
        self.frames().map(|frames| frames.concat())
    }

    /// True for data replies
    pub fn is_data(&self) -> bool {
        matches!(self, ElmResponse::Data(_))
    }
}

fn is_noise(line: &str) -> bool {
    line.starts_with("SEARCHING") || line.starts_with("BUS INIT")
}

/// A lone three-digit byte count precedes numbered multi-frame replies
fn is_byte_count(line: &str) -> bool {
    line.len() == 3 && line.chars().all(|c| c.is_ascii_hexdigit())
}

fn parse_frames(lines: &[&str]) -> Result<Vec<Vec<u8>>, String> {
    // (bytes, declared length from a preceding byte-count line)
    let mut frames: Vec<(Vec<u8>, Option<usize>)> = Vec::new();
    let mut declared_len = None;

    for line in lines.iter().copied() {
        if is_noise(line) {
            continue;
        }
        if is_byte_count(line) {
            declared_len = usize::from_str_radix(line, 16).ok();
            continue;
        }

        match split_line_number(line) {
            Some((0, rest)) => {
                frames.push((parse_hex_tokens(rest)?, declared_len.take()));
            }
            Some((_, rest)) => {
                let bytes = parse_hex_tokens(rest)?;
                match frames.last_mut() {
                    Some((frame, _)) => frame.extend(bytes),
                    None => frames.push((bytes, declared_len.take())),
                }
            }
            None => frames.push((parse_hex_tokens(line)?, None)),
        }
    }

    Ok(frames
        .into_iter()
        .map(|(mut bytes, declared)| {
            if let Some(len) = declared {
                // consecutive frames are padded past the declared length
                bytes.truncate(len);
            }
            bytes
        })
        .collect())
}

/// Split an `N:` line-number prefix off a multi-frame line
fn split_line_number(line: &str) -> Option<(u8, &str)> {
    let (number, rest) = line.split_once(':')?;
    let number = number.trim();
    if number.is_empty() || number.len() > 2 {
        return None;
    }
    u8::from_str_radix(number, 16)
        .ok()
        .map(|n| (n, rest.trim()))
}

fn parse_hex_tokens(text: &str) -> Result<Vec<u8>, String> {
    let mut bytes = Vec::new();
    for token in text.split_whitespace() {
        if token.len() % 2 != 0 || !token.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(format!("unexpected token `{}`", token));
        }
        for pair in token.as_bytes().chunks(2) {
            let pair = std::str::from_utf8(pair).map_err(|e| e.to_string())?;
            let byte = u8::from_str_radix(pair, 16).map_err(|e| e.to_string())?;
            bytes.push(byte);
        }
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_single_line_data() {
        let response = ElmResponse::classify("43 01 33 00 00 00 00");
        assert_eq!(
            response,
            ElmResponse::Data(vec![vec![0x43, 0x01, 0x33, 0x00, 0x00, 0x00, 0x00]])
        );
    }

    #[test]
    fn test_no_data_and_faults() {
        assert_eq!(ElmResponse::classify("NO DATA"), ElmResponse::NoData);
        assert_eq!(
            ElmResponse::classify("SEARCHING...\rNO DATA"),
            ElmResponse::NoData
        );
        assert_eq!(
            ElmResponse::classify("STOPPED"),
            ElmResponse::Error(ElmFault::Stopped)
        );
        assert_eq!(
            ElmResponse::classify("SEARCHING...\rUNABLE TO CONNECT"),
            ElmResponse::Error(ElmFault::UnableToConnect)
        );
        assert_eq!(
            ElmResponse::classify("CAN ERROR"),
            ElmResponse::Error(ElmFault::Bus("CAN ERROR".into()))
        );
        assert_eq!(
            ElmResponse::classify("?"),
            ElmResponse::Error(ElmFault::UnknownCommand)
        );
        assert_eq!(
            ElmResponse::classify("ERR94"),
            ElmResponse::Error(ElmFault::Other("ERR94".into()))
        );
    }

    #[test]
    fn test_error_inside_bus_init_line() {
        assert_eq!(
            ElmResponse::classify("BUS INIT: ...ERROR"),
            ElmResponse::Error(ElmFault::Other("BUS INIT: ...ERROR".into()))
        );
        assert_eq!(
            ElmResponse::classify("SEARCHING...\rBUS INIT: ERROR"),
            ElmResponse::Error(ElmFault::Other("BUS INIT: ERROR".into()))
        );
    }

    #[test]
    fn test_multi_frame_with_line_numbers() {
        let text = "014\r0: 62 F1 90 53 41 4A\r1: 44 41 41 41 30 37\r2: 48 41 31 32 33 34";
        let response = ElmResponse::classify(text);
        let frames = response.frames().unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..3], &[0x62, 0xF1, 0x90]);
        assert_eq!(frames[0].len(), 18);
    }

    #[test]
    fn test_byte_count_truncates_padding() {
        let response = ElmResponse::classify("008\r0: 62 40 47 01 02 03\r1: 04 05 00 00 00 00 00");
        assert_eq!(
            response.bytes().unwrap(),
            vec![0x62, 0x40, 0x47, 0x01, 0x02, 0x03, 0x04, 0x05]
        );
    }

    #[test]
    fn test_multiple_ecus_are_separate_frames() {
        let response = ElmResponse::classify("43 01 33 00 00 00 00\r\n43 02 17 00 00 00 00");
        assert_eq!(response.frames().unwrap().len(), 2);
    }

    #[test]
    fn test_compact_hex_without_spaces() {
        let response = ElmResponse::classify("SEARCHING...\r4101330000");
        assert_eq!(
            response.bytes().unwrap(),
            vec![0x41, 0x01, 0x33, 0x00, 0x00]
        );
    }

    #[test]
    fn test_malformed() {
        assert!(matches!(
            ElmResponse::classify("ELM327 v1.5"),
            ElmResponse::Malformed(_)
        ));
        assert!(matches!(ElmResponse::classify("   "), ElmResponse::Malformed(_)));
        assert!(matches!(ElmResponse::classify("4 1"), ElmResponse::Malformed(_)));
    }

    proptest! {
        #[test]
        fn prop_space_separated_bytes_parse(bytes in proptest::collection::vec(any::<u8>(), 1..32)) {
            let text = bytes
                .iter()
                .map(|b| format!("{:02X}", b))
                .collect::<Vec<_>>()
                .join(" ");
            prop_assert_eq!(ElmResponse::classify(&text), ElmResponse::Data(vec![bytes]));
        }
    }
}
