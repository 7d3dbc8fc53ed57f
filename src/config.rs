//! Configuration management for the swap forwarder
//!
//! Loads configuration from TOML files with environment variable substitution.

use crate::timelock::HopTiming;

use anyhow::{Context, Result};
use lazy_static::lazy_static;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub forwarder: ForwarderConfig,
    pub database: DatabaseConfig,
    pub api: ApiConfig,
    pub metrics: MetricsConfig,
    pub counterparty: CounterpartyConfig,
    pub engines: HashMap<String, EngineConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ForwarderConfig {
    /// Delay before re-running a forward after a temporary error
    pub retry_delay_secs: u64,
    pub cancel_attempts: u32,
    pub cancel_delay_secs: u64,
    /// Inbound preparation deadline, measured from trade start
    pub swap_timeout_secs: u64,
    pub replay_retry_delay_secs: u64,
    pub readiness_poll_secs: u64,
    pub validation_interval_secs: u64,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            retry_delay_secs: 30,
            cancel_attempts: 10,
            cancel_delay_secs: 10,
            swap_timeout_secs: 5,
            replay_retry_delay_secs: 30,
            readiness_poll_secs: 5,
            validation_interval_secs: 10,
        }
    }
}

impl ForwarderConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    pub fn cancel_delay(&self) -> Duration {
        Duration::from_secs(self.cancel_delay_secs)
    }

    pub fn replay_retry_delay(&self) -> Duration {
        Duration::from_secs(self.replay_retry_delay_secs)
    }

    pub fn readiness_poll(&self) -> Duration {
        Duration::from_secs(self.readiness_poll_secs)
    }

    pub fn swap_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.swap_timeout_secs.min(MAX_SWAP_TIMEOUT_SECS) as i64)
    }
}

/// Upper bound on the inbound preparation deadline
const MAX_SWAP_TIMEOUT_SECS: u64 = 3600;

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CounterpartyConfig {
    pub base_url: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl CounterpartyConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn default_request_timeout() -> u64 {
    30
}

fn default_poll_interval() -> u64 {
    1000
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum EngineKindConfig {
    Channel,
    Escrow,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    pub kind: EngineKindConfig,
    pub asset: String,
    pub unit: String,
    pub base_url: String,
    pub api_key: Option<String>,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    pub final_hop_time_lock_secs: u64,
    pub block_buffer_secs: u64,
    pub retrieve_window_secs: u64,
    pub claim_window_secs: u64,
}

impl EngineConfig {
    pub fn timing(&self) -> HopTiming {
        HopTiming {
            final_hop_time_lock: self.final_hop_time_lock_secs,
            block_buffer: self.block_buffer_secs,
            retrieve_window: self.retrieve_window_secs,
            claim_window: self.claim_window_secs,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Settings {
    /// Load settings from the file named by `SWAP_FORWARDER_CONFIG`
    pub fn load() -> Result<Self> {
        let config_path = env::var("SWAP_FORWARDER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        Self::load_from(&config_path)
    }

    /// Load settings from an explicit path
    pub fn load_from(config_path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        Self::parse(&config_str)
    }

    fn parse(raw: &str) -> Result<Self> {
        let config_str = substitute_env_vars(raw);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.engines.len() < 2 {
            anyhow::bail!("At least two engines must be configured");
        }

        let mut assets = HashSet::new();
        for (name, engine) in &self.engines {
            if !assets.insert(engine.asset.as_str()) {
                anyhow::bail!("Asset {} is configured by more than one engine", engine.asset);
            }
            if engine.base_url.is_empty() {
                anyhow::bail!("Engine {} has no base URL configured", name);
            }
            let timing = engine.timing();
            if !timing.is_valid() {
                anyhow::bail!("Engine {} has a zero time-lock parameter", name);
            }
            if engine.api_key.as_deref().map_or(true, str::is_empty) {
                tracing::warn!("Engine {} has no API key - requests will be unauthenticated", name);
            }
        }

        if self.forwarder.cancel_attempts == 0 {
            anyhow::bail!("forwarder.cancel_attempts must be at least 1");
        }
        if self.forwarder.swap_timeout_secs == 0
            || self.forwarder.swap_timeout_secs > MAX_SWAP_TIMEOUT_SECS
        {
            anyhow::bail!(
                "forwarder.swap_timeout_secs must be between 1 and {}",
                MAX_SWAP_TIMEOUT_SECS
            );
        }

        Ok(())
    }
}

lazy_static! {
    static ref ENV_VAR: regex::Regex =
        regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").expect("valid env var pattern");
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    ENV_VAR
        .replace_all(input, |cap: &regex::Captures| {
            env::var(&cap[1]).unwrap_or_default()
        })
        .into_owned()
}
