//! Configuration loading from TOML with environment variable resolution.
//!
//! Reads `config.toml` (or the file named by `LOYALTY_CONFIG`) and
//! deserializes into strongly-typed structs. The database URL is referenced
//! by env-var name and resolved at runtime into a [`SecretString`].

use anyhow::{Context, Result};
use secrecy::SecretString;
use serde::Deserialize;
use std::fs;
use std::time::Duration;

use crate::engine::retry::RetryPolicy;

/// Env var naming an alternative config file.
pub const CONFIG_PATH_ENV: &str = "LOYALTY_CONFIG";

const DEFAULT_CONFIG_PATH: &str = "config.toml";

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub accrual: AccrualConfig,
    pub processing: ProcessingConfig,
    #[serde(default)]
    pub retry: RetryConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub run_address: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    /// Name of the env var holding the SQLite URL.
    pub url_env: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct AccrualConfig {
    pub base_url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_transport_retries")]
    pub transport_retries: u32,
    #[serde(default = "default_transport_retry_wait_ms")]
    pub transport_retry_wait_ms: u64,
}

fn default_timeout_secs() -> u64 {
    10
}

fn default_transport_retries() -> u32 {
    2
}

fn default_transport_retry_wait_ms() -> u64 {
    200
}

impl AccrualConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn transport_retry_wait(&self) -> Duration {
        Duration::from_millis(self.transport_retry_wait_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProcessingConfig {
    /// Claim `limit` per tick.
    pub batch_size: u32,
    /// Claim lease length.
    pub score_delta_secs: u64,
    pub poll_interval_secs: u64,
    pub reconcile_interval_secs: u64,
    /// Concurrent scoring calls / reconciliations per tick.
    pub concurrency: usize,
}

impl ProcessingConfig {
    pub fn score_delta(&self) -> Duration {
        Duration::from_secs(self.score_delta_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }
}

/// One backoff policy per retrying call site.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct RetryConfig {
    #[serde(default)]
    pub request: RetryPolicy,
    #[serde(default)]
    pub reconcile: RetryPolicy,
    #[serde(default)]
    pub scoring: RetryPolicy,
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        Self::parse(&contents).with_context(|| format!("Failed to parse config file: {path}"))
    }

    /// Load from `$LOYALTY_CONFIG`, falling back to `config.toml`.
    pub fn load_default() -> Result<Self> {
        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load(&path)
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(contents)?;
        anyhow::ensure!(config.processing.batch_size > 0, "processing.batch_size must be positive");
        anyhow::ensure!(config.processing.concurrency > 0, "processing.concurrency must be positive");
        anyhow::ensure!(
            config.processing.poll_interval_secs > 0 && config.processing.reconcile_interval_secs > 0,
            "processing intervals must be positive"
        );
        Ok(config)
    }

    /// Resolve an environment variable name to its value.
    pub fn resolve_env(env_name: &str) -> Result<String> {
        std::env::var(env_name)
            .with_context(|| format!("Environment variable not set: {env_name}"))
    }

    pub fn database_url(&self) -> Result<SecretString> {
        Self::resolve_env(&self.database.url_env).map(SecretString::new)
    }
}
