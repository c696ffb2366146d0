use std::path::Path;

use anyhow::Context;
use serde::Deserialize;

const DEFAULT_LOOPBACK_CIDR: &str = "127.0.0.0/8";

/// One `[[tunnel]]` table in the config file: one `TunnelSpec` worth of
/// input, minus the endpoint override (not exposed at the CLI boundary).
#[derive(Debug, Deserialize)]
pub struct TunnelConfig {
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub hostnames: Vec<String>,
    pub ports: Vec<u16>,
}

#[derive(Debug, Deserialize)]
pub struct Config {
    /// The loopback range the IP pool allocates from (invariant 6: must
    /// contain `127.0.0.1`). Defaults to the whole `127.0.0.0/8` block.
    #[serde(default)]
    pub loopback_cidr: Option<String>,

    #[serde(rename = "tunnel", default)]
    pub tunnels: Vec<TunnelConfig>,
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path).with_context(|| format!("reading config file {}", path.display()))?;
        let config: Config =
            toml::from_str(&raw).with_context(|| format!("parsing config file {}", path.display()))?;
        Ok(config)
    }

    pub fn loopback_cidr(&self) -> &str {
        self.loopback_cidr.as_deref().unwrap_or(DEFAULT_LOOPBACK_CIDR)
    }
}
