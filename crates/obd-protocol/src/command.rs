//! ELM327 Command Builders
//!
//! Commands are plain ASCII. The transport appends the carriage return.

/// Reset the interpreter
pub const RESET: &str = "ATZ";
/// Disable command echo
pub const ECHO_OFF: &str = "ATE0";
/// Identify the interpreter
pub const IDENTIFY: &str = "ATI";
/// Read the supply voltage seen by the adapter
pub const READ_VOLTAGE: &str = "ATRV";
/// Describe the current protocol by number
pub const DESCRIBE_PROTOCOL_NUMBER: &str = "ATDPN";
/// Mode 03: stored trouble codes
pub const READ_STORED_DTCS: &str = "03";
/// Mode 04: clear trouble codes and freeze frames
pub const CLEAR_DTCS: &str = "04";
/// Mode 07: pending trouble codes
pub const READ_PENDING_DTCS: &str = "07";

/// Mode constants, request and response forms
pub mod mode {
    /// Stored diagnostic trouble codes
    pub const READ_DTC: u8 = 0x03;
    /// Clear trouble codes
    pub const CLEAR_DTC: u8 = 0x04;
    /// Pending diagnostic trouble codes
    pub const PENDING_DTC: u8 = 0x07;
    /// UDS ReadDataByIdentifier
    pub const READ_DATA_BY_ID: u8 = 0x22;
    /// Offset added to a service id in a positive response
    pub const POSITIVE_RESPONSE_OFFSET: u8 = 0x40;
    /// UDS negative response service id
    pub const NEGATIVE_RESPONSE: u8 = 0x7F;

    /// Service id of a positive response to `service`
    pub const fn positive_response(service: u8) -> u8 {
        service.wrapping_add(POSITIVE_RESPONSE_OFFSET)
    }
}

/// `ATSH` header selection for a CAN arbitration id such as `7E0`
pub fn set_header(header: &str) -> String {
    format!("ATSH{}", header.trim().to_ascii_uppercase())
}

/// `ATST` response timeout in units of 4.096 ms
pub fn set_timeout(units: u8) -> String {
    format!("ATST{:02X}", units)
}

/// UDS service 0x22 request for a 2-byte data identifier
pub fn read_data_by_identifier(did: u16) -> String {
    format!("{:02X}{:04X}", mode::READ_DATA_BY_ID, did)
}

/// True when `reply` acknowledges an AT command
pub fn is_ok(reply: &str) -> bool {
    reply
        .split(['\r', '\n'])
        .any(|line| line.trim().eq_ignore_ascii_case("OK"))
}

/// Parse the reply to `ATRV`, e.g. `12.6V`
pub fn parse_voltage(reply: &str) -> Option<f32> {
    reply
        .split(['\r', '\n'])
        .map(str::trim)
        .find_map(|line| {
            let number = line.strip_suffix(['V', 'v']).unwrap_or(line);
            number.trim().parse::<f32>().ok()
        })
        .filter(|volts| volts.is_finite() && *volts >= 0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_and_timeout() {
        assert_eq!(set_header("7e0"), "ATSH7E0");
        assert_eq!(set_timeout(0x19), "ATST19");
        assert_eq!(set_timeout(0x32), "ATST32");
    }

    #[test]
    fn test_read_data_by_identifier() {
        assert_eq!(read_data_by_identifier(0xF190), "22F190");
        assert_eq!(read_data_by_identifier(0x0102), "220102");
    }

    #[test]
    fn test_positive_response_ids() {
        assert_eq!(mode::positive_response(mode::READ_DTC), 0x43);
        assert_eq!(mode::positive_response(mode::PENDING_DTC), 0x47);
        assert_eq!(mode::positive_response(mode::READ_DATA_BY_ID), 0x62);
    }

    #[test]
    fn test_voltage() {
        assert_eq!(parse_voltage("12.6V"), Some(12.6));
        assert_eq!(parse_voltage("ATRV\r14.1V"), Some(14.1));
        assert_eq!(parse_voltage("?"), None);
    }

    #[test]
    fn test_ok_detection() {
        assert!(is_ok("OK"));
        assert!(is_ok("ATE0\rOK"));
        assert!(!is_ok("?"));
        assert!(!is_ok("NO DATA"));
    }
}
