//! Transport layer errors

use thiserror::Error;

use super::RadioState;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Bluetooth radio unavailable: {0}")]
    Unavailable(RadioState),

    #[error("Unknown peripheral: {0}")]
    UnknownPeripheral(String),

    #[error("Unknown characteristic: {0}")]
    UnknownCharacteristic(String),

    #[error("Scan failed: {0}")]
    ScanFailed(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("GATT error: {0}")]
    Gatt(String),
}
