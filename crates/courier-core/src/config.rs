//! Configuration system for Courier.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $COURIER_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/courier/config.toml
//!   3. ~/.config/courier/config.toml

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::PathBuf;


/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CourierConfig {
    pub messenger: MessengerSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MessengerSettings {
    /// Silence after the last received chunk before an incomplete message
    /// is declared failed and retries are requested.
    pub inactivity_timeout_ms: u64,
    /// UDP port to bind. 0 = OS-assigned.
    pub port: u16,
    /// Address to bind.
    pub bind_address: IpAddr,
    /// Datagram size budget, envelope included.
    pub packet_size: usize,
    /// Failure rounds before an incomplete inbound message is abandoned.
    pub max_retry_rounds: u8,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

/// Packet size in bytes, envelope included.
pub const DEFAULT_PACKET_SIZE: usize = 512;

pub const DEFAULT_PORT: u16 = 5000;

pub const DEFAULT_INACTIVITY_TIMEOUT_MS: u64 = 2000;

/// Extra wait after a message finishes before its identifier is forgotten.
pub const GRACE_PERIOD_MS: u64 = 1000;

/// Failure rounds an incomplete inbound message may report before it is abandoned.
pub const DEFAULT_MAX_RETRY_ROUNDS: u8 = 3;

impl Default for MessengerSettings {
    fn default() -> Self {
        Self {
            inactivity_timeout_ms: DEFAULT_INACTIVITY_TIMEOUT_MS,
            port: DEFAULT_PORT,
            bind_address: IpAddr::from([0, 0, 0, 0]),
            packet_size: DEFAULT_PACKET_SIZE,
            max_retry_rounds: DEFAULT_MAX_RETRY_ROUNDS,
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("courier")
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

impl CourierConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::file_path())
    }

    /// Load from an explicit path, then apply env overrides.
    pub fn load_from(path: &std::path::Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(path)
                .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?
        } else {
            CourierConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("COURIER_CONFIG")
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
            let text = toml::to_string_pretty(&CourierConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply COURIER_* env var overrides. Unparseable values are ignored.
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let m = &mut self.messenger;
        if let Some(v) = lookup("COURIER_MESSENGER__INACTIVITY_TIMEOUT_MS") {
            if let Ok(ms) = v.parse() {
                m.inactivity_timeout_ms = ms;
            }
        }
        if let Some(v) = lookup("COURIER_MESSENGER__PORT") {
            if let Ok(p) = v.parse() {
                m.port = p;
            }
        }
        if let Some(v) = lookup("COURIER_MESSENGER__BIND_ADDRESS") {
            if let Ok(addr) = v.parse() {
                m.bind_address = addr;
            }
        }
        if let Some(v) = lookup("COURIER_MESSENGER__PACKET_SIZE") {
            if let Ok(size) = v.parse() {
                m.packet_size = size;
            }
        }
        if let Some(v) = lookup("COURIER_MESSENGER__MAX_RETRY_ROUNDS") {
            if let Ok(rounds) = v.parse() {
                m.max_retry_rounds = rounds;
            }
        }
    }
}
