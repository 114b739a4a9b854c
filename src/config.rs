//! Runtime configuration for Waypoint.
//!
//! Environment-driven with validated defaults. `.env` files are loaded by
//! the binary entry point before this runs; every knob also has a working
//! default so a bare `waypoint run` works out of the box.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Result, bail};

/// One inference provider endpoint in the fallback chain.
#[derive(Debug, Clone)]
pub struct ProviderSpec {
    pub name: String,
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
}

/// Application-wide configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub db_path: PathBuf,
    /// Maximum steps in flight per goal.
    pub max_concurrency: usize,
    /// Evaluator confidence threshold gating step success.
    pub pass_threshold: f64,
    /// Retry budget per step.
    pub default_max_retries: u32,
    /// Replans allowed per goal lifetime.
    pub max_replans: u32,
    /// Planner inference attempts (1 + validation retries).
    pub planner_attempts: u32,
    pub inference_timeout: Duration,
    pub capability_timeout: Duration,
    /// SSE heartbeat interval when no event arrives.
    pub heartbeat_interval: Duration,
    /// Ordered provider fallback chain; empty means offline (scripted).
    pub providers: Vec<ProviderSpec>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8600,
            db_path: PathBuf::from("waypoint.db"),
            max_concurrency: 3,
            pass_threshold: 0.6,
            default_max_retries: 3,
            max_replans: 3,
            planner_attempts: 3,
            inference_timeout: Duration::from_secs(30),
            capability_timeout: Duration::from_secs(15),
            heartbeat_interval: Duration::from_secs(30),
            providers: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from `WAYPOINT_*` environment variables,
    /// falling back to defaults for anything unset.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let config = Self {
            port: env_parse("WAYPOINT_PORT", defaults.port)?,
            db_path: std::env::var("WAYPOINT_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            max_concurrency: env_parse("WAYPOINT_MAX_CONCURRENCY", defaults.max_concurrency)?,
            pass_threshold: env_parse("WAYPOINT_PASS_THRESHOLD", defaults.pass_threshold)?,
            default_max_retries: env_parse("WAYPOINT_MAX_RETRIES", defaults.default_max_retries)?,
            max_replans: env_parse("WAYPOINT_MAX_REPLANS", defaults.max_replans)?,
            planner_attempts: env_parse("WAYPOINT_PLANNER_ATTEMPTS", defaults.planner_attempts)?,
            inference_timeout: Duration::from_secs(env_parse(
                "WAYPOINT_INFERENCE_TIMEOUT_SECS",
                defaults.inference_timeout.as_secs(),
            )?),
            capability_timeout: Duration::from_secs(env_parse(
                "WAYPOINT_CAPABILITY_TIMEOUT_SECS",
                defaults.capability_timeout.as_secs(),
            )?),
            heartbeat_interval: Duration::from_secs(env_parse(
                "WAYPOINT_HEARTBEAT_SECS",
                defaults.heartbeat_interval.as_secs(),
            )?),
            providers: load_providers(),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrency == 0 {
            bail!("max_concurrency must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.pass_threshold) {
            bail!(
                "pass_threshold must be within [0, 1], got {}",
                self.pass_threshold
            );
        }
        if self.default_max_retries == 0 {
            bail!("default_max_retries must be at least 1");
        }
        if self.planner_attempts == 0 {
            bail!("planner_attempts must be at least 1");
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => match raw.parse() {
            Ok(value) => Ok(value),
            Err(e) => bail!("Invalid {}={}: {}", key, raw, e),
        },
        Err(_) => Ok(default),
    }
}

/// Read the ordered provider chain from the environment. A provider is
/// configured when its URL and model are both set.
fn load_providers() -> Vec<ProviderSpec> {
    ["PRIMARY", "SECONDARY", "TERTIARY"]
        .iter()
        .filter_map(|tier| {
            let base_url = std::env::var(format!("WAYPOINT_{}_URL", tier)).ok()?;
            let model = std::env::var(format!("WAYPOINT_{}_MODEL", tier)).ok()?;
            Some(ProviderSpec {
                name: tier.to_lowercase(),
                base_url,
                model,
                api_key: std::env::var(format!("WAYPOINT_{}_API_KEY", tier)).ok(),
            })
        })
        .collect()
}
