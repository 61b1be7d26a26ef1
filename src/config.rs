//! Configuration management for the bridge engine
//!
//! Loads configuration from TOML files with environment variable substitution.

use crate::chain::{units, ChainId};

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub bridge: BridgeConfig,
    /// In-memory storage when absent
    pub database: Option<DatabaseConfig>,
    pub api: ApiConfig,
    pub metrics: MetricsConfig,
    pub chains: HashMap<String, ChainConfig>,
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
    pub validators: ValidatorsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfig {
    pub instance_id: String,
    #[serde(default = "default_token_decimals")]
    pub token_decimals: u32,
    /// Inclusive bounds, in token units
    pub min_bridge_amount: String,
    pub max_bridge_amount: String,
    pub quorum_timeout_secs: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub max_refund_attempts: u32,
    pub refund_retry_delay_ms: u64,
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

impl BridgeConfig {
    /// `(min, max)` bridge amount in base units
    pub fn amount_bounds(&self) -> crate::error::BridgeResult<(u128, u128)> {
        let min = units::parse_config_amount(&self.min_bridge_amount, self.token_decimals)?;
        let max = units::parse_config_amount(&self.max_bridge_amount, self.token_decimals)?;
        Ok((min, max))
    }

    pub fn quorum_timeout(&self) -> Duration {
        Duration::from_secs(self.quorum_timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn refund_retry_delay(&self) -> Duration {
        Duration::from_millis(self.refund_retry_delay_ms)
    }
}

fn default_token_decimals() -> u32 {
    18
}

fn default_cleanup_interval() -> u64 {
    300
}

fn default_event_buffer() -> usize {
    10_000
}

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
pub struct ChainConfig {
    pub native_asset_symbol: String,
    pub confirmations_required: u64,
    pub block_time_secs: u64,
    pub fees: FeeConfig,
    pub enabled: bool,
}

/// Fee schedule in token units
#[derive(Debug, Clone, Deserialize)]
pub struct FeeConfig {
    pub base_fee: String,
    pub percentage_basis_points: u32,
    pub min_fee: String,
    pub max_fee: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RouteConfig {
    pub source: ChainId,
    pub destination: ChainId,
    #[serde(default)]
    pub adapter: AdapterKind,
    #[serde(default)]
    pub simulated_latency_ms: u64,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum AdapterKind {
    #[default]
    Simulated,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ValidatorsConfig {
    pub threshold: usize,
    pub addresses: Vec<String>,
}

impl Settings {
    /// Load settings from configuration files
    pub fn load() -> Result<Self> {
        let config_path = env::var("VRTY_BRIDGE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        Self::load_from(&config_path)
    }

    /// Load settings from a specific file
    pub fn load_from(path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        Self::parse(&config_str)
    }

    /// Parse and validate settings from TOML text
    pub fn parse(config_str: &str) -> Result<Self> {
        // Substitute environment variables
        let config_str = substitute_env_vars(config_str);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.enabled_chains().is_empty() {
            anyhow::bail!("At least one chain must be enabled");
        }

        let (min, max) = self.bridge.amount_bounds()?;
        if min == 0 || min > max {
            anyhow::bail!(
                "Bridge amount bounds must satisfy 0 < min <= max (got {} and {})",
                self.bridge.min_bridge_amount,
                self.bridge.max_bridge_amount
            );
        }

        for (name, chain) in &self.chains {
            name.parse::<ChainId>()
                .with_context(|| format!("Unsupported chain {}", name))?;
            if chain.enabled && chain.confirmations_required == 0 {
                tracing::warn!("Chain {} treats unconfirmed events as final", name);
            }
        }

        let unique: HashSet<&String> = self.validators.addresses.iter().collect();
        if unique.len() != self.validators.addresses.len() {
            anyhow::bail!("Validator addresses must be unique");
        }
        if self.validators.threshold == 0 || self.validators.threshold > unique.len() {
            anyhow::bail!(
                "Validator threshold {} must be between 1 and {}",
                self.validators.threshold,
                unique.len()
            );
        }

        if self.routes.is_empty() {
            tracing::warn!("No bridge routes configured - every request will be rejected");
        }

        Ok(())
    }

    /// Get list of enabled chains
    pub fn enabled_chains(&self) -> Vec<(&String, &ChainConfig)> {
        self.chains.iter().filter(|(_, c)| c.enabled).collect()
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    let mut result = input.to_string();
    let re = regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").unwrap();

    for cap in re.captures_iter(input) {
        let var_name = &cap[1];
        let var_value = env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    result
}
