//! OBD-II Error Types

use thiserror::Error;

/// Errors that can occur while talking to an ELM327 adapter
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ObdError {
    /// Radio is powered off, unauthorized or unsupported
    #[error("Bluetooth transport unavailable: {0}")]
    TransportUnavailable(String),

    /// Connecting exceeded the connection bound
    #[error("Timed out connecting to adapter after {0}ms")]
    ConnectionTimeout(u64),

    /// Command issued without a ready channel
    #[error("OBD adapter not connected")]
    NotConnected,

    /// Timeout waiting for the `>` prompt
    #[error("Timeout waiting for OBD response after {0}ms")]
    Timeout(u64),

    /// Interpreter answered with an explicit error token
    #[error("Adapter rejected command: {0}")]
    InvalidCommand(String),

    /// Payload could not be decoded
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Startup sequence did not complete
    #[error("Adapter initialization failed: {0}")]
    InitializationFailed(String),

    /// Write or request failed at the transport boundary
    #[error("Transport error: {0}")]
    Transport(String),
}

impl ObdError {
    /// True for failures that indicate the channel itself is gone
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            ObdError::NotConnected | ObdError::TransportUnavailable(_)
        )
    }
}
