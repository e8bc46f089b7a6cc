//! Observable link state

use std::fmt;

use obd_protocol::ObdError;
use serde::Serialize;

use crate::transport::RadioState;

/// Why the link is in the error state
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum LinkFault {
    PoweredOff,
    Unauthorized,
    Unsupported,
    /// Connecting exceeded the bound (milliseconds)
    ConnectionTimeout(u64),
    ConnectionFailed(String),
    /// Enumeration finished without a write and a notify handle
    NoUsableCharacteristics,
    Transport(String),
}

impl LinkFault {
    /// Fault for a radio that is not powered on
    pub fn from_radio(radio: RadioState) -> Option<Self> {
        match radio {
            RadioState::PoweredOn => None,
            RadioState::PoweredOff => Some(LinkFault::PoweredOff),
            RadioState::Unauthorized => Some(LinkFault::Unauthorized),
            RadioState::Unsupported => Some(LinkFault::Unsupported),
        }
    }
}

impl fmt::Display for LinkFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkFault::PoweredOff => write!(f, "{}", RadioState::PoweredOff),
            LinkFault::Unauthorized => write!(f, "{}", RadioState::Unauthorized),
            LinkFault::Unsupported => write!(f, "{}", RadioState::Unsupported),
            LinkFault::ConnectionTimeout(ms) => write!(f, "connection timed out after {}ms", ms),
            LinkFault::ConnectionFailed(reason) => write!(f, "connection failed: {}", reason),
            LinkFault::NoUsableCharacteristics => {
                write!(f, "adapter exposes no usable write/notify characteristics")
            }
            LinkFault::Transport(reason) => write!(f, "transport error: {}", reason),
        }
    }
}

impl From<LinkFault> for ObdError {
    fn from(fault: LinkFault) -> Self {
        match fault {
            LinkFault::PoweredOff | LinkFault::Unauthorized | LinkFault::Unsupported => {
                ObdError::TransportUnavailable(fault.to_string())
            }
            LinkFault::ConnectionTimeout(ms) => ObdError::ConnectionTimeout(ms),
            other => ObdError::Transport(other.to_string()),
        }
    }
}

/// Process-wide connection state; exactly one variant at a time
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Scanning,
    Connecting,
    Connected,
    Error(LinkFault),
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Scanning => write!(f, "scanning"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Error(fault) => write!(f, "error: {}", fault),
        }
    }
}

/// Progress of the adapter startup sequence
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub enum InitStatus {
    #[default]
    Idle,
    Running,
    Ready,
    Failed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_to_error() {
        assert_eq!(
            ObdError::from(LinkFault::ConnectionTimeout(15000)),
            ObdError::ConnectionTimeout(15000)
        );
        assert!(matches!(
            ObdError::from(LinkFault::PoweredOff),
            ObdError::TransportUnavailable(_)
        ));
        assert!(matches!(
            ObdError::from(LinkFault::NoUsableCharacteristics),
            ObdError::Transport(_)
        ));
    }

    #[test]
    fn test_radio_faults() {
        assert_eq!(LinkFault::from_radio(RadioState::PoweredOn), None);
        assert_eq!(
            LinkFault::from_radio(RadioState::Unauthorized),
            Some(LinkFault::Unauthorized)
        );
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ConnectionState::Scanning.to_string(), "scanning");
        assert_eq!(
            ConnectionState::Error(LinkFault::PoweredOff).to_string(),
            "error: Bluetooth is powered off"
        );
    }
}
