//! Bluetooth LE transport boundary
//!
//! The engine drives a transport through request methods and learns about
//! completions from a stream of [`TransportEvent`]s, mirroring how platform
//! Bluetooth stacks report connection, discovery and notification results
//! through callbacks:
//! - [`mock::MockTransport`] for tests and the simulated adapter
//! - `btleplug::BtleplugTransport` for real radios (feature `btleplug`)

pub mod error;
pub mod mock;
pub mod scripted;

#[cfg(feature = "btleplug")]
pub mod btleplug;

use std::fmt;

use async_trait::async_trait;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

pub use error::TransportError;

/// Buffered transport events per subscriber
pub const EVENT_CAPACITY: usize = 1024;

/// Stable identifier of a peripheral, as reported by the platform
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeripheralId(String);

impl PeripheralId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeripheralId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeripheralId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Power and permission state of the local radio
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RadioState {
    PoweredOn,
    PoweredOff,
    Unauthorized,
    Unsupported,
}

impl fmt::Display for RadioState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            RadioState::PoweredOn => "powered on",
            RadioState::PoweredOff => "Bluetooth is powered off",
            RadioState::Unauthorized => "Bluetooth permission denied",
            RadioState::Unsupported => "Bluetooth LE is not supported",
        };
        f.write_str(text)
    }
}

bitflags! {
    /// GATT characteristic capabilities
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CharacteristicProperties: u8 {
        const READ = 0x02;
        const WRITE_WITHOUT_RESPONSE = 0x04;
        const WRITE = 0x08;
        const NOTIFY = 0x10;
        const INDICATE = 0x20;
    }
}

impl CharacteristicProperties {
    /// Accepts writes of either kind
    pub fn is_writable(&self) -> bool {
        self.intersects(Self::WRITE | Self::WRITE_WITHOUT_RESPONSE)
    }

    /// Delivers value changes
    pub fn is_notifying(&self) -> bool {
        self.intersects(Self::NOTIFY | Self::INDICATE)
    }
}

/// A characteristic as found during enumeration
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CharacteristicInfo {
    /// Characteristic identifier
    pub uuid: Uuid,
    /// Owning service
    pub service: Uuid,
    /// Capability flags
    pub properties: CharacteristicProperties,
}

/// How a write is acknowledged
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    WithResponse,
    WithoutResponse,
}

/// One advertisement seen while scanning
#[derive(Debug, Clone, PartialEq)]
pub struct Advertisement {
    pub id: PeripheralId,
    pub local_name: Option<String>,
    pub rssi: Option<i16>,
    pub services: Vec<Uuid>,
    pub connectable: bool,
}

/// Completion and notification callbacks from the platform
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A peripheral advertised while scanning
    Discovered(Advertisement),
    /// A requested connection is up
    Connected(PeripheralId),
    /// A requested connection could not be established
    ConnectFailed { id: PeripheralId, reason: String },
    /// The link went down, requested or not
    Disconnected(PeripheralId),
    /// Service enumeration finished
    ServicesDiscovered { id: PeripheralId, services: Vec<Uuid> },
    /// Characteristic enumeration for one service finished
    CharacteristicsDiscovered {
        id: PeripheralId,
        service: Uuid,
        characteristics: Vec<CharacteristicInfo>,
    },
    /// A subscribed characteristic changed value
    ValueChanged {
        id: PeripheralId,
        characteristic: Uuid,
        value: Vec<u8>,
    },
    /// The local radio changed power or permission state
    RadioStateChanged(RadioState),
}

/// Request side of a Bluetooth LE central
///
/// Request methods return once the request is issued. Their outcome
/// arrives later on [`BleTransport::events`].
#[async_trait]
pub trait BleTransport: Send + Sync {
    /// Current radio state
    async fn radio_state(&self) -> RadioState;

    /// Begin reporting advertisements
    async fn start_scan(&self) -> Result<(), TransportError>;

    /// Stop reporting advertisements
    async fn stop_scan(&self) -> Result<(), TransportError>;

    /// Request a connection; answered by `Connected` or `ConnectFailed`
    async fn connect(&self, id: &PeripheralId) -> Result<(), TransportError>;

    /// Tear down a connection or cancel a pending one
    async fn disconnect(&self, id: &PeripheralId) -> Result<(), TransportError>;

    /// Request service enumeration; answered by `ServicesDiscovered`
    async fn discover_services(&self, id: &PeripheralId) -> Result<(), TransportError>;

    /// Request characteristic enumeration; answered by `CharacteristicsDiscovered`
    async fn discover_characteristics(
        &self,
        id: &PeripheralId,
        service: Uuid,
    ) -> Result<(), TransportError>;

    /// Enable value-changed notifications for a characteristic
    async fn subscribe(
        &self,
        id: &PeripheralId,
        characteristic: &CharacteristicInfo,
    ) -> Result<(), TransportError>;

    /// Write a value to a characteristic
    async fn write(
        &self,
        id: &PeripheralId,
        characteristic: &CharacteristicInfo,
        value: &[u8],
        kind: WriteKind,
    ) -> Result<(), TransportError>;

    /// Subscribe to completion and notification events
    fn events(&self) -> broadcast::Receiver<TransportEvent>;
}
