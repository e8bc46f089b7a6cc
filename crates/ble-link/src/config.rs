//! Engine configuration

use std::time::Duration;

use obd_protocol::ObdProtocol;
use serde::{Deserialize, Serialize};

/// Timing and discovery settings for [`crate::AdapterEngine`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Bound on Connecting before the link errors out (ms)
    pub connect_timeout_ms: u64,
    /// Bound on a single command waiting for the prompt (ms)
    pub command_timeout_ms: u64,
    /// Pause after `ATZ` while the interpreter reboots (ms)
    pub reset_settle_ms: u64,
    /// Connect automatically to adapters with a known name
    pub auto_connect: bool,
    /// Pause between discovery and an automatic connection attempt (ms)
    pub auto_connect_settle_ms: u64,
    /// Name fragments of adapters eligible for auto-connect
    pub known_adapter_names: Vec<String>,
    /// Protocol selected during initialization
    pub protocol: ObdProtocol,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 15_000,
            command_timeout_ms: 5_000,
            reset_settle_ms: 1_000,
            auto_connect: false,
            auto_connect_settle_ms: 500,
            known_adapter_names: ["OBDII", "OBD2", "VEEPEAK", "VLINK", "ELM327", "KONNWEI", "VGATE"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            protocol: ObdProtocol::Auto,
        }
    }
}

impl EngineConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn reset_settle(&self) -> Duration {
        Duration::from_millis(self.reset_settle_ms)
    }

    pub fn auto_connect_settle(&self) -> Duration {
        Duration::from_millis(self.auto_connect_settle_ms)
    }
}
