//! Configuration system for Meridian.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $MERIDIAN_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/meridian/config.toml
//!   3. ~/.config/meridian/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::wire::{DEFAULT_MAX_PEERS, DEFAULT_PORT};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MeridianConfig {
    pub network: NetworkConfig,
    pub discovery: DiscoveryConfig,
    pub trusted_link: TrustedLinkConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// TCP listening port. 0 = OS-assigned.
    pub port: u16,
    /// Registry capacity. Admission is refused once reached.
    pub max_peers: usize,
    /// Map the listening port through UPnP.
    pub nat: bool,
    /// Run DNS discovery once at startup.
    pub seed: bool,
    /// Identity string sent in the handshake.
    pub client_id: String,
    pub dial_timeout_secs: u64,
    pub reap_interval_secs: u64,
    /// Inbound peers silent for longer than this are reaped.
    pub stale_after_secs: u64,
    pub ping_interval_secs: u64,
    pub nat_renew_interval_secs: u64,
    pub nat_lease_secs: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Every A/AAAA record becomes a candidate at `default_port`.
    pub bootstrap_host: String,
    /// SRV record; targets are dialed at the record's port.
    pub srv_name: String,
    /// Always attempted, whatever DNS says.
    pub fallback_seed: String,
    pub default_port: u16,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TrustedLinkConfig {
    /// Companion node address (`host:port`). None = no trusted link.
    pub companion: Option<String>,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            max_peers: DEFAULT_MAX_PEERS,
            nat: false,
            seed: false,
            client_id: format!("meridian/{}", env!("CARGO_PKG_VERSION")),
            dial_timeout_secs: 5,
            reap_interval_secs: 60,
            stale_after_secs: 5 * 60,
            ping_interval_secs: 30,
            nat_renew_interval_secs: 15 * 60,
            nat_lease_secs: 20 * 60,
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            bootstrap_host: "seed.bysh.me".to_string(),
            srv_name: "_eth._tcp.ethereum.org".to_string(),
            fallback_seed: "54.76.56.74:30303".to_string(),
            default_port: DEFAULT_PORT,
        }
    }
}

impl NetworkConfig {
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn nat_renew_interval(&self) -> Duration {
        Duration::from_secs(self.nat_renew_interval_secs)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("meridian")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl MeridianConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            MeridianConfig::default()
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("MERIDIAN_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&MeridianConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply MERIDIAN_* overrides. `lookup` is `std::env::var` outside tests.
    fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let flag = |v: String| v == "true" || v == "1";

        if let Some(p) = lookup("MERIDIAN_NETWORK__PORT").and_then(|v| v.parse().ok()) {
            self.network.port = p;
        }
        if let Some(n) = lookup("MERIDIAN_NETWORK__MAX_PEERS").and_then(|v| v.parse().ok()) {
            self.network.max_peers = n;
        }
        if let Some(v) = lookup("MERIDIAN_NETWORK__NAT") {
            self.network.nat = flag(v);
        }
        if let Some(v) = lookup("MERIDIAN_NETWORK__SEED") {
            self.network.seed = flag(v);
        }
        if let Some(v) = lookup("MERIDIAN_TRUSTED_LINK__COMPANION") {
            self.trusted_link.companion = if v.is_empty() { None } else { Some(v) };
        }
    }
}
