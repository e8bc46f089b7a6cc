//! Diagnostic Reads over an ELM327 Channel
//!
//! Stored and pending trouble codes, UDS identifier reads (VIN, serial
//! numbers), the multi-address remote start probe and body positions,
//! all expressed as command sequences on a [`CommandChannel`].

mod channel;
mod client;
mod probe;
mod profile;

pub use channel::{ChannelSession, CommandChannel};
pub use client::ObdClient;
pub use profile::{StatusBit, VehicleProfile, WindowIdentifiers};
