//! Configuration schema, defaults, and layered loading.
//!
//! Precedence: defaults < config file < environment < CLI overrides.

use anyhow::{ensure, Context, Result};
use directories::ProjectDirs;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

const MAX_SESSIONS_CEILING: usize = 4096;
const MAX_POLL_QUEUE_CEILING: usize = 65536;

/// Chunk size used when streaming a download toward the transport.
pub const DOWNLOAD_CHUNK_SIZE: u64 = 100 * 1024;

pub fn config_path() -> PathBuf {
    ProjectDirs::from("", "", "hushdrop")
        .map(|p| p.config_dir().join("config.toml"))
        .unwrap_or_else(|| PathBuf::from("hushdrop.toml"))
}

/// Caps and timeouts shared by the registry, engine, rooms, and bus.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitSettings {
    /// Max concurrent sessions the registry will issue.
    pub max_sessions: usize,
    /// Max transfers in progress at once per session.
    pub max_active_transfers: usize,
    /// Max bytes per transfer; 0 means unlimited.
    pub max_transfer_bytes: u64,
    /// Seconds without chunk activity before a transfer is auto-cancelled.
    pub idle_timeout_secs: u64,
    /// Max users per chat room.
    pub room_user_cap: usize,
    /// Expected client poll interval, in seconds.
    pub poll_interval_secs: u64,
    /// Missed polls before a polling client is treated as disconnected.
    pub poll_miss_limit: u32,
    /// Buffered events per polling client; oldest dropped on overflow.
    pub poll_queue_capacity: usize,
    /// Countdown after a completing transfer before auto-shutdown.
    pub shutdown_grace_secs: u64,
    /// Unknown-slug requests tolerated before the server shuts itself down.
    pub not_found_shutdown_threshold: u32,
}

impl Default for LimitSettings {
    fn default() -> Self {
        Self {
            max_sessions: 64,
            max_active_transfers: 4,
            max_transfer_bytes: 0,
            idle_timeout_secs: 300,
            room_user_cap: 32,
            poll_interval_secs: 1,
            poll_miss_limit: 5,
            poll_queue_capacity: 1024,
            shutdown_grace_secs: 3,
            not_found_shutdown_threshold: 20,
        }
    }
}

/// Fully resolved application configuration after all layers merge.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Listen port; 0 picks an ephemeral port.
    pub port: u16,
    /// Where uploaded files land, one subdirectory per transfer.
    pub downloads_dir: PathBuf,
    /// Bind on all interfaces and tolerate unknown-path probing.
    pub public_mode: bool,
    /// Sessions survive their first completed transfer.
    pub persistent: bool,
    /// Suppress auto-shutdown after transfer completion.
    pub stay_open: bool,
    pub limits: LimitSettings,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            port: 0,
            downloads_dir: PathBuf::from("."),
            public_mode: false,
            persistent: false,
            stay_open: false,
            limits: LimitSettings::default(),
        }
    }
}

impl AppConfig {
    /// Rejects values that would wedge or exhaust the server.
    pub fn validate(&self) -> Result<()> {
        let limits = &self.limits;
        ensure!(
            limits.max_sessions >= 1,
            "Invalid config: limits.max_sessions must be >= 1"
        );
        ensure!(
            limits.max_sessions <= MAX_SESSIONS_CEILING,
            "Invalid config: limits.max_sessions must be <= {MAX_SESSIONS_CEILING}"
        );
        ensure!(
            limits.max_active_transfers >= 1,
            "Invalid config: limits.max_active_transfers must be >= 1"
        );
        ensure!(
            limits.room_user_cap >= 2,
            "Invalid config: limits.room_user_cap must be >= 2"
        );
        ensure!(
            limits.poll_interval_secs >= 1,
            "Invalid config: limits.poll_interval_secs must be >= 1"
        );
        ensure!(
            limits.poll_miss_limit >= 1,
            "Invalid config: limits.poll_miss_limit must be >= 1"
        );
        ensure!(
            limits.poll_queue_capacity >= 1,
            "Invalid config: limits.poll_queue_capacity must be >= 1"
        );
        ensure!(
            limits.poll_queue_capacity <= MAX_POLL_QUEUE_CEILING,
            "Invalid config: limits.poll_queue_capacity must be <= {MAX_POLL_QUEUE_CEILING}"
        );
        ensure!(
            limits.idle_timeout_secs >= 1,
            "Invalid config: limits.idle_timeout_secs must be >= 1"
        );
        ensure!(
            limits.not_found_shutdown_threshold >= 1,
            "Invalid config: limits.not_found_shutdown_threshold must be >= 1"
        );
        Ok(())
    }
}

/// Runtime overrides sourced from CLI flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConfigOverrides {
    pub port: Option<u16>,
    pub persistent: Option<bool>,
    pub stay_open: Option<bool>,
    pub public_mode: Option<bool>,
}

/// Loads config from defaults/file/env.
pub fn load_config() -> Result<AppConfig> {
    let path = config_path();

    let config: AppConfig = Figment::new()
        .merge(Serialized::defaults(AppConfig::default()))
        .merge(Toml::file(&path))
        .merge(Env::prefixed("HUSHDROP_").split("_"))
        .extract()
        .context("Failed to load configuration")?;

    config.validate()?;

    Ok(config)
}

/// Applies runtime overrides to a loaded config.
pub fn apply_overrides(mut config: AppConfig, overrides: &ConfigOverrides) -> AppConfig {
    if let Some(port) = overrides.port {
        config.port = port;
    }
    if let Some(persistent) = overrides.persistent {
        config.persistent = persistent;
    }
    if let Some(stay_open) = overrides.stay_open {
        config.stay_open = stay_open;
    }
    if let Some(public_mode) = overrides.public_mode {
        config.public_mode = public_mode;
    }
    config
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        AppConfig::default().validate().expect("defaults validate");
    }

    #[test]
    fn rejects_zero_sessions() {
        let mut config = AppConfig::default();
        config.limits.max_sessions = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_single_user_room_cap() {
        let mut config = AppConfig::default();
        config.limits.room_user_cap = 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn overrides_take_precedence() {
        let config = AppConfig::default();
        let overrides = ConfigOverrides {
            port: Some(7831),
            persistent: Some(true),
            stay_open: Some(true),
            public_mode: None,
        };

        let merged = apply_overrides(config, &overrides);
        assert_eq!(merged.port, 7831);
        assert!(merged.persistent);
        assert!(merged.stay_open);
        assert!(!merged.public_mode);
    }
}
