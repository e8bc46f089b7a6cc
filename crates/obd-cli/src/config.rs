//! Layered configuration for obd-link
//!
//! Built-in defaults, then an optional TOML file, then `OBD_LINK_*`
//! environment variables (`__` separates nested keys, e.g.
//! `OBD_LINK_LINK__AUTO_CONNECT=true`).

use std::path::Path;

use ble_link::EngineConfig;
use config::builder::DefaultState;
use config::{Config, ConfigBuilder, ConfigError, Environment, File};
use obd_client::VehicleProfile;
use serde::{Deserialize, Serialize};

const ENV_PREFIX: &str = "OBD_LINK";

/// Log output settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Maximum level: trace, debug, info, warn or error
    pub level: String,
    /// Emit JSON lines instead of human readable text
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Everything the binary reads from configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub link: EngineConfig,
    pub vehicle: VehicleProfile,
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load configuration, reading `path` when given
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }
        Self::finish(builder)
    }

    fn finish(builder: ConfigBuilder<DefaultState>) -> Result<Self, ConfigError> {
        builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("link.known_adapter_names"),
            )
            .build()?
            .try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::FileFormat;
    use obd_protocol::ObdProtocol;

    fn from_toml(text: &str) -> AppConfig {
        AppConfig::finish(Config::builder().add_source(File::from_str(text, FileFormat::Toml)))
            .unwrap()
    }

    #[test]
    fn test_defaults_without_sources() {
        let config = AppConfig::load(None).unwrap();
        assert_eq!(config.link.command_timeout_ms, 5_000);
        assert_eq!(config.vehicle.broadcast_header, "7DF");
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_file_overrides_nested_values() {
        let config = from_toml(
            r#"
            [link]
            auto_connect = true
            connect_timeout_ms = 20000
            protocol = "iso15765_4_can11bit500"

            [vehicle]
            body_header = "740"
            remote_start_candidates = ["740", "726"]

            [logging]
            json = true
            "#,
        );
        assert!(config.link.auto_connect);
        assert_eq!(config.link.connect_timeout_ms, 20_000);
        assert_eq!(config.link.command_timeout_ms, 5_000);
        assert_eq!(config.link.protocol, ObdProtocol::Iso15765_4Can11bit500);
        assert_eq!(config.vehicle.body_header, "740");
        assert_eq!(config.vehicle.remote_start_candidates, vec!["740", "726"]);
        assert_eq!(config.vehicle.engine_header, "7E0");
        assert!(config.logging.json);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(AppConfig::load(Some(Path::new("/nonexistent/obd-link.toml"))).is_err());
    }
}
