//! Hub configuration persisted as `config.json` in the working directory.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Server identity and listener configuration. A fresh install writes a
/// default config with a newly generated UUID; nodes learn `port`/
/// `tls_port` from the `server-info` message during bootstrap.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HubConfig {
    #[serde(default = "d_name")]
    pub name: String,
    #[serde(default)]
    pub uuid: String,
    #[serde(default = "d_host")]
    pub host: String,
    #[serde(default = "d_port")]
    pub port: u16,
    #[serde(default = "d_tls_port")]
    pub tls_port: u16,
    /// IANA timezone the scheduler evaluates cron expressions in.
    #[serde(default = "d_timezone")]
    pub timezone: String,
}

fn d_name() -> String {
    "hearth".into()
}
fn d_host() -> String {
    "0.0.0.0".into()
}
fn d_port() -> u16 {
    8080
}
fn d_tls_port() -> u16 {
    6443
}
fn d_timezone() -> String {
    "UTC".into()
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            name: d_name(),
            uuid: uuid::Uuid::new_v4().to_string(),
            host: d_host(),
            port: d_port(),
            tls_port: d_tls_port(),
            timezone: d_timezone(),
        }
    }
}

impl HubConfig {
    /// Load `config.json` from `dir`, or create and persist a default
    /// one on first start. A config missing its UUID gets one assigned
    /// and written back.
    pub fn load_or_create(dir: &Path) -> Result<Self> {
        let path = dir.join("config.json");
        if !path.exists() {
            let config = Self::default();
            config.save(dir)?;
            return Ok(config);
        }
        let text = std::fs::read_to_string(&path)?;
        let mut config: HubConfig = serde_json::from_str(&text)?;
        if config.uuid.is_empty() {
            config.uuid = uuid::Uuid::new_v4().to_string();
            config.save(dir)?;
        }
        Ok(config)
    }

    pub fn save(&self, dir: &Path) -> Result<()> {
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(dir.join("config.json"), text)?;
        Ok(())
    }
}
