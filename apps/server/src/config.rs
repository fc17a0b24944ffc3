use anyhow::{Context, Result};
use eas::EasConfig;
use eas_protocol::Component;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;

/// Daemon configuration file: transport settings plus the automation itself.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DaemonConfig {
    #[serde(default)]
    pub transport: TransportConfig,
    pub eas: EasConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransportConfig {
    /// UDP address telemetry frames arrive on.
    pub telemetry_bind: String,
    pub http_bind: String,
    /// Where each component listens for command datagrams.
    pub endpoints: HashMap<Component, SocketAddr>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            telemetry_bind: "0.0.0.0:4000".to_string(),
            http_bind: "0.0.0.0:8080".to_string(),
            endpoints: HashMap::new(),
        }
    }
}

impl DaemonConfig {
    pub fn parse(text: &str) -> Result<Self> {
        let config: DaemonConfig = serde_yaml::from_str(text)?;
        config.eas.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        DaemonConfig::parse(&text).with_context(|| format!("loading {}", path.display()))
    }
}
