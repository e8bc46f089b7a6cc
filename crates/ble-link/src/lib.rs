//! Bluetooth LE link to ELM327 adapters
//!
//! Discovers adapters, drives the connection state machine, resolves the
//! write and notify characteristics, initializes the interpreter and
//! correlates commands with their prompt-terminated replies.
//!
//! The radio itself sits behind [`transport::BleTransport`]. An in-memory
//! implementation is always available; a btleplug backed one is compiled
//! with the `btleplug` feature.

pub mod config;
pub mod correlator;
pub mod descriptor;
mod engine;
mod initializer;
pub mod state;
pub mod transport;

pub use config::EngineConfig;
pub use descriptor::{AdapterDescriptor, ChannelHandles};
pub use engine::{AdapterEngine, CommandSession};
pub use state::{ConnectionState, InitStatus, LinkFault};
pub use transport::{BleTransport, PeripheralId, RadioState, TransportError, TransportEvent};
