//! capstore Configuration
//!
//! Every runtime knob of the routing layer lives here; nothing else is hardcoded.
//!
//! ## Sources
//!
//! Configuration is resolved in three layers (later wins):
//!
//! 1. Defaults (`CapstoreConfig::default()`)
//! 2. TOML file (optional, `--config capstore.toml`)
//! 3. `CAPSTORE_*` environment variables
//!
//! ## Example file
//!
//! ```toml
//! data_dir = "/var/lib/capstore/shards"
//! registry_path = "/var/lib/capstore/registry.db"
//! shard_quota_bytes = 21474836480
//! event_capacity = 256
//!
//! [registry]
//! max_mutation_attempts = 3
//!
//! [monitor]
//! high_water_mark_percent = 90.0
//! poll_interval_ms = 30000
//! probe_timeout_ms = 5000
//! unreachable_after_failures = 3
//! stale_warning_after_failures = 3
//!
//! [provisioner]
//! max_attempts = 3
//! retry_backoff_ms = 1000
//! request_queue_capacity = 8
//!
//! [router]
//! read_timeout_ms = 5000
//! write_timeout_ms = 5000
//! max_write_attempts = 5
//! home_cache_capacity = 100000
//! ```
//!
//! ## Environment variables
//!
//! | Variable | Field |
//! |----------|-------|
//! | `CAPSTORE_DATA_DIR` | `data_dir` |
//! | `CAPSTORE_REGISTRY_PATH` | `registry_path` |
//! | `CAPSTORE_SHARD_QUOTA_BYTES` | `shard_quota_bytes` |
//! | `CAPSTORE_MAX_MUTATION_ATTEMPTS` | `registry.max_mutation_attempts` |
//! | `CAPSTORE_HIGH_WATER_MARK` | `monitor.high_water_mark_percent` |
//! | `CAPSTORE_POLL_INTERVAL_MS` | `monitor.poll_interval_ms` |
//! | `CAPSTORE_PROBE_TIMEOUT_MS` | `monitor.probe_timeout_ms` |
//! | `CAPSTORE_MAX_PROVISIONING_ATTEMPTS` | `provisioner.max_attempts` |
//! | `CAPSTORE_REQUEST_QUEUE_CAPACITY` | `provisioner.request_queue_capacity` |
//! | `CAPSTORE_READ_TIMEOUT_MS` | `router.read_timeout_ms` |
//! | `CAPSTORE_WRITE_TIMEOUT_MS` | `router.write_timeout_ms` |
//! | `CAPSTORE_MAX_WRITE_ATTEMPTS` | `router.max_write_attempts` |
//! | `CAPSTORE_HOME_CACHE_CAPACITY` | `router.home_cache_capacity` |

use crate::error::{ConfigError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapstoreConfig {
    /// Directory holding one SQLite file per shard
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// SQLite file holding the durable registry log
    #[serde(default = "default_registry_path")]
    pub registry_path: PathBuf,

    /// Storage quota of each newly allocated shard (default: 20 GiB)
    #[serde(default = "default_shard_quota_bytes")]
    pub shard_quota_bytes: u64,

    /// Buffer of the shard event broadcast channel
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    #[serde(default)]
    pub registry: RegistryConfig,

    #[serde(default)]
    pub monitor: MonitorConfig,

    #[serde(default)]
    pub provisioner: ProvisionerConfig,

    #[serde(default)]
    pub router: RouterConfig,
}

impl Default for CapstoreConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            registry_path: default_registry_path(),
            shard_quota_bytes: default_shard_quota_bytes(),
            event_capacity: default_event_capacity(),
            registry: RegistryConfig::default(),
            monitor: MonitorConfig::default(),
            provisioner: ProvisionerConfig::default(),
            router: RouterConfig::default(),
        }
    }
}

/// Shard registry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Attempts per mutation when another process moved the log head
    #[serde(default = "default_max_mutation_attempts")]
    pub max_mutation_attempts: u32,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_mutation_attempts: default_max_mutation_attempts(),
        }
    }
}

/// Capacity Monitor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Usage percentage of the write target that triggers provisioning
    #[serde(default = "default_high_water_mark")]
    pub high_water_mark_percent: f64,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Timeout of a single shard probe
    #[serde(default = "default_timeout_ms")]
    pub probe_timeout_ms: u64,

    /// Consecutive failed probes before a shard is marked UNREACHABLE
    #[serde(default = "default_unreachable_after_failures")]
    pub unreachable_after_failures: u32,

    /// Consecutive failed refreshes before warning that capacity data is stale
    #[serde(default = "default_stale_warning_after_failures")]
    pub stale_warning_after_failures: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            high_water_mark_percent: default_high_water_mark(),
            poll_interval_ms: default_poll_interval_ms(),
            probe_timeout_ms: default_timeout_ms(),
            unreachable_after_failures: default_unreachable_after_failures(),
            stale_warning_after_failures: default_stale_warning_after_failures(),
        }
    }
}

impl MonitorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

/// Shard Provisioner settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionerConfig {
    /// Attempts per provisioning request before giving up
    #[serde(default = "default_max_provisioning_attempts")]
    pub max_attempts: u32,

    /// Delay between attempts, multiplied by the attempt number
    #[serde(default = "default_provisioning_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Pending requests buffered between the monitor and the provisioner
    #[serde(default = "default_request_queue_capacity")]
    pub request_queue_capacity: usize,
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_provisioning_attempts(),
            retry_backoff_ms: default_provisioning_backoff_ms(),
            request_queue_capacity: default_request_queue_capacity(),
        }
    }
}

impl ProvisionerConfig {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

/// Query Router settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Per-shard read timeout
    #[serde(default = "default_timeout_ms")]
    pub read_timeout_ms: u64,

    /// Per-attempt write timeout
    #[serde(default = "default_timeout_ms")]
    pub write_timeout_ms: u64,

    /// Bounded retry budget for writes (includes the first attempt)
    #[serde(default = "default_max_write_attempts")]
    pub max_write_attempts: u32,

    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Remembered candidate id → home shard entries
    #[serde(default = "default_home_cache_capacity")]
    pub home_cache_capacity: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            read_timeout_ms: default_timeout_ms(),
            write_timeout_ms: default_timeout_ms(),
            max_write_attempts: default_max_write_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            home_cache_capacity: default_home_cache_capacity(),
        }
    }
}

impl RouterConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data/shards")
}

fn default_registry_path() -> PathBuf {
    PathBuf::from("./data/registry.db")
}

fn default_shard_quota_bytes() -> u64 {
    20 * 1024 * 1024 * 1024 // 20 GiB
}

fn default_event_capacity() -> usize {
    256
}

fn default_max_mutation_attempts() -> u32 {
    3
}

fn default_high_water_mark() -> f64 {
    90.0
}

fn default_poll_interval_ms() -> u64 {
    30_000
}

fn default_timeout_ms() -> u64 {
    5_000
}

fn default_unreachable_after_failures() -> u32 {
    3
}

fn default_stale_warning_after_failures() -> u32 {
    3
}

fn default_max_provisioning_attempts() -> u32 {
    3
}

fn default_provisioning_backoff_ms() -> u64 {
    1_000
}

fn default_request_queue_capacity() -> usize {
    8
}

fn default_max_write_attempts() -> u32 {
    5
}

fn default_initial_backoff_ms() -> u64 {
    50
}

fn default_max_backoff_ms() -> u64 {
    2_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_home_cache_capacity() -> usize {
    100_000
}

impl CapstoreConfig {
    /// Load defaults, then the optional TOML file, then `CAPSTORE_*` env vars.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML file; missing keys fall back to defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Apply overrides from an environment lookup function.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("CAPSTORE_DATA_DIR") {
            self.data_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("CAPSTORE_REGISTRY_PATH") {
            self.registry_path = PathBuf::from(v);
        }
        override_parsed(&lookup, "CAPSTORE_SHARD_QUOTA_BYTES", &mut self.shard_quota_bytes)?;
        override_parsed(
            &lookup,
            "CAPSTORE_MAX_MUTATION_ATTEMPTS",
            &mut self.registry.max_mutation_attempts,
        )?;
        override_parsed(
            &lookup,
            "CAPSTORE_HIGH_WATER_MARK",
            &mut self.monitor.high_water_mark_percent,
        )?;
        override_parsed(
            &lookup,
            "CAPSTORE_POLL_INTERVAL_MS",
            &mut self.monitor.poll_interval_ms,
        )?;
        override_parsed(
            &lookup,
            "CAPSTORE_PROBE_TIMEOUT_MS",
            &mut self.monitor.probe_timeout_ms,
        )?;
        override_parsed(
            &lookup,
            "CAPSTORE_MAX_PROVISIONING_ATTEMPTS",
            &mut self.provisioner.max_attempts,
        )?;
        override_parsed(
            &lookup,
            "CAPSTORE_REQUEST_QUEUE_CAPACITY",
            &mut self.provisioner.request_queue_capacity,
        )?;
        override_parsed(
            &lookup,
            "CAPSTORE_READ_TIMEOUT_MS",
            &mut self.router.read_timeout_ms,
        )?;
        override_parsed(
            &lookup,
            "CAPSTORE_WRITE_TIMEOUT_MS",
            &mut self.router.write_timeout_ms,
        )?;
        override_parsed(
            &lookup,
            "CAPSTORE_MAX_WRITE_ATTEMPTS",
            &mut self.router.max_write_attempts,
        )?;
        override_parsed(
            &lookup,
            "CAPSTORE_HOME_CACHE_CAPACITY",
            &mut self.router.home_cache_capacity,
        )?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let hwm = self.monitor.high_water_mark_percent;
        if !(hwm > 0.0 && hwm <= 100.0) {
            return Err(ConfigError::Invalid(format!(
                "monitor.high_water_mark_percent must be in (0, 100], got {}",
                hwm
            )));
        }
        if self.monitor.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "monitor.poll_interval_ms must be > 0".to_string(),
            ));
        }
        if self.monitor.probe_timeout_ms == 0
            || self.router.read_timeout_ms == 0
            || self.router.write_timeout_ms == 0
        {
            return Err(ConfigError::Invalid("timeouts must be > 0".to_string()));
        }
        if self.monitor.unreachable_after_failures == 0 {
            return Err(ConfigError::Invalid(
                "monitor.unreachable_after_failures must be >= 1".to_string(),
            ));
        }
        if self.provisioner.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "provisioner.max_attempts must be >= 1".to_string(),
            ));
        }
        if self.router.max_write_attempts == 0 {
            return Err(ConfigError::Invalid(
                "router.max_write_attempts must be >= 1".to_string(),
            ));
        }
        if self.router.backoff_multiplier < 1.0 {
            return Err(ConfigError::Invalid(
                "router.backoff_multiplier must be >= 1.0".to_string(),
            ));
        }
        if self.registry.max_mutation_attempts == 0 {
            return Err(ConfigError::Invalid(
                "registry.max_mutation_attempts must be >= 1".to_string(),
            ));
        }
        if self.event_capacity == 0
            || self.provisioner.request_queue_capacity == 0
            || self.router.home_cache_capacity == 0
        {
            return Err(ConfigError::Invalid(
                "channel and cache capacities must be > 0".to_string(),
            ));
        }
        if self.shard_quota_bytes == 0 {
            return Err(ConfigError::Invalid(
                "shard_quota_bytes must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

fn override_parsed<F, T>(lookup: &F, key: &str, target: &mut T) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    if let Some(value) = lookup(key) {
        *target = value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
            key: key.to_string(),
            value,
        })?;
    }
    Ok(())
}
