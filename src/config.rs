// =============================================================================
// FEDERATION NODE — config.rs
// =============================================================================
//
// Settings come from a TOML file (missing file = defaults) and are then
// overridden from the environment:
//   NODE_HOSTNAME, NODE_PORT, NODE_BASE_DIR, NODE_MAC,
//   FEDERATION_UPSTREAM, FEDERATION_RETENTION_HOURS
// =============================================================================

use crate::constants::*;
use crate::error::{FederationError, FederationResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub node: NodeSettings,
    pub federation: FederationSettings,
    pub admins: Vec<AdminPrincipal>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSettings {
    pub hostname: Option<String>,
    pub network_hostname: Option<String>,
    pub address: Option<String>,
    pub ipv4_address: Option<String>,
    pub ipv6_address: Option<String>,
    pub mac_address: Option<String>,
    pub port: u16,
    pub bind: String,
    pub base_dir: PathBuf,
    pub role: Option<String>,
    pub features: Vec<String>,
    pub installed_version: Option<String>,
    pub installed_revision: Option<String>,
    pub key_bits: usize,
}

impl Default for NodeSettings {
    fn default() -> Self {
        NodeSettings {
            hostname: None,
            network_hostname: None,
            address: None,
            ipv4_address: None,
            ipv6_address: None,
            mac_address: None,
            port: DEFAULT_PORT,
            bind: DEFAULT_BIND.to_string(),
            base_dir: PathBuf::from("."),
            role: None,
            features: vec![],
            installed_version: Some(VERSION.to_string()),
            installed_revision: None,
            key_bits: DEFAULT_KEY_BITS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FederationSettings {
    pub upstream_url: Option<String>,
    pub poll_interval_secs: u64,
    pub purge_interval_secs: u64,
    pub request_timeout_secs: u64,
    pub message_retention_hours: i64,
}

impl Default for FederationSettings {
    fn default() -> Self {
        FederationSettings {
            upstream_url: None,
            poll_interval_secs: POLL_INTERVAL_SECS,
            purge_interval_secs: PURGE_INTERVAL_SECS,
            request_timeout_secs: REQUEST_TIMEOUT_SECS,
            message_retention_hours: MESSAGE_RETENTION_HOURS,
        }
    }
}

impl FederationSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::hours(self.message_retention_hours.max(1))
    }
}

/// Operator allowed to register nodes without a signature
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminPrincipal {
    pub name: String,
    pub token: String,
    #[serde(default)]
    pub permissions: Vec<String>,
}

impl AdminPrincipal {
    pub fn has_perm(&self, perm: &str) -> bool {
        self.permissions.iter().any(|p| p == perm)
    }
}

impl Settings {
    pub fn load(path: &Path) -> FederationResult<Self> {
        let mut settings = if path.exists() {
            let text = std::fs::read_to_string(path)?;
            Self::from_toml(&text)?
        } else {
            log::info!("No config at {}, using defaults", path.display());
            Settings::default()
        };
        settings.apply_env();
        Ok(settings)
    }

    pub fn from_toml(text: &str) -> FederationResult<Self> {
        toml::from_str(text).map_err(|e| FederationError::Validation(format!("config: {}", e)))
    }

    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("NODE_HOSTNAME") {
            self.node.hostname = Some(v);
        }
        if let Ok(v) = std::env::var("NODE_PORT") {
            match v.parse() {
                Ok(port) => self.node.port = port,
                Err(_) => log::warn!("NODE_PORT ignored (not a port): {}", v),
            }
        }
        if let Ok(v) = std::env::var("NODE_BASE_DIR") {
            self.node.base_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("NODE_MAC") {
            self.node.mac_address = Some(v);
        }
        if let Ok(v) = std::env::var("FEDERATION_UPSTREAM") {
            if !v.trim().is_empty() {
                self.federation.upstream_url = Some(v.trim().to_string());
            }
        }
        if let Ok(v) = std::env::var("FEDERATION_RETENTION_HOURS") {
            match v.parse() {
                Ok(h) => self.federation.message_retention_hours = h,
                Err(_) => log::warn!("FEDERATION_RETENTION_HOURS ignored: {}", v),
            }
        }
    }

    pub fn state_path(&self) -> PathBuf {
        self.node.base_dir.join(STATE_FILE)
    }

    /// Look up an admin principal by bearer token
    pub fn principal(&self, token: &str) -> Option<&AdminPrincipal> {
        self.admins.iter().find(|a| a.token == token)
    }
}
