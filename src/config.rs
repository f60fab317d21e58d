use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};

const MIN_PROBE_TIMEOUT_MILLIS: u64 = 100;
const MAX_PROBE_TIMEOUT_MILLIS: u64 = 5000;

/// Deployment environment the server runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Production,
    Development,
    /// Liveness probing is skipped so tests never touch the wire.
    Testing,
}

/// Runtime settings for the server process.
///
/// The address topology itself lives in the DHCP configuration file named by
/// `dhcp_config`; this file only says where things are and how the process
/// should behave.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub dhcp_config: String,
    pub leases_file: String,
    pub devices_file: String,
    pub interface_index: Option<u32>,
    pub liveness_probe: bool,
    pub probe_timeout_millis: u64,
    pub readonly: bool,
    #[serde(default)]
    pub environment: Environment,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            dhcp_config: "dhcp.conf".to_string(),
            leases_file: "leases.json".to_string(),
            devices_file: "devices.json".to_string(),
            interface_index: None,
            liveness_probe: true,
            probe_timeout_millis: 750,
            readonly: false,
            environment: Environment::Production,
        }
    }
}

impl ServerConfig {
    pub fn load_or_create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: ServerConfig = serde_json::from_str(&content)?;
            config.validate()?;
            Ok(config)
        } else {
            let config = ServerConfig::default();
            config.save(path)?;
            Ok(config)
        }
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("dhcp_config", &self.dhcp_config),
            ("leases_file", &self.leases_file),
            ("devices_file", &self.devices_file),
        ] {
            if value.trim().is_empty() {
                return Err(Error::InvalidConfig(format!("{} must not be empty", name)));
            }
        }

        if !(MIN_PROBE_TIMEOUT_MILLIS..=MAX_PROBE_TIMEOUT_MILLIS)
            .contains(&self.probe_timeout_millis)
        {
            return Err(Error::InvalidConfig(format!(
                "probe_timeout_millis must be between {} and {}",
                MIN_PROBE_TIMEOUT_MILLIS, MAX_PROBE_TIMEOUT_MILLIS
            )));
        }

        Ok(())
    }

    /// Whether addresses should be pinged before they are handed out.
    pub fn probe_enabled(&self) -> bool {
        self.liveness_probe && self.environment != Environment::Testing
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_millis)
    }
}
