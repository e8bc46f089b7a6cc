//! OBD-II Protocol Implementation
//!
//! Wire-level pieces for talking to ELM327-compatible interpreters:
//! command builders, a tokenizer that classifies replies, SAE J1979
//! trouble code decoding and UDS data identifier payloads. Nothing in
//! this crate performs I/O.

pub mod body;
pub mod command;
pub mod did;
pub mod dtc;
mod error;
mod protocol;
pub mod response;

pub use body::{SunroofState, VehicleStatus, WindowState, WindowsStatus};
pub use dtc::{Dtc, DtcSystem};
pub use error::ObdError;
pub use protocol::ObdProtocol;
pub use response::{ElmFault, ElmResponse};
