use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Top-level configuration for the depthcap collector.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Extra debug logging for directory setup and counter recovery.
    #[serde(default)]
    pub verbose: bool,

    /// Dataset location, batching and split configuration.
    #[serde(default)]
    pub dataset: DatasetConfig,

    /// Per-tick capture behaviour.
    #[serde(default)]
    pub capture: CaptureConfig,

    /// Persistence worker configuration.
    #[serde(default)]
    pub persist: PersistConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// Dataset location, batching and split configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatasetConfig {
    /// Dataset root directory. Default: "data/depth_dataset".
    #[serde(default = "default_dataset_root")]
    pub root: PathBuf,

    /// Observations per batch file. Default: 500.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Sample every Nth active frame. Default: 10.
    #[serde(default = "default_sample_stride")]
    pub sample_stride: u64,

    /// Train/val/test probabilities. Default: 0.98/0.01/0.01.
    #[serde(default)]
    pub split_ratio: SplitRatio,
}

/// Probabilities used to route a batch to a split.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SplitRatio {
    pub train: f64,
    pub val: f64,
    pub test: f64,
}

/// Per-tick capture behaviour.
#[derive(Debug, Clone, Deserialize)]
pub struct CaptureConfig {
    /// Frames between target visibility checks. Default: 50.
    #[serde(default = "default_visibility_check_interval")]
    pub visibility_check_interval: u64,
}

/// Persistence worker configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PersistConfig {
    /// How long shutdown waits for queued batches. Default: 2s.
    #[serde(default = "default_shutdown_timeout", with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Serve /metrics and /healthz. Default: false.
    #[serde(default)]
    pub enabled: bool,

    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_dataset_root() -> PathBuf {
    PathBuf::from("data/depth_dataset")
}

fn default_batch_size() -> usize {
    500
}

fn default_sample_stride() -> u64 {
    10
}

fn default_visibility_check_interval() -> u64 {
    50
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

// --- Default trait implementations ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            verbose: false,
            dataset: DatasetConfig::default(),
            capture: CaptureConfig::default(),
            persist: PersistConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            root: default_dataset_root(),
            batch_size: default_batch_size(),
            sample_stride: default_sample_stride(),
            split_ratio: SplitRatio::default(),
        }
    }
}

impl Default for SplitRatio {
    fn default() -> Self {
        Self {
            train: 0.98,
            val: 0.01,
            test: 0.01,
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            visibility_check_interval: default_visibility_check_interval(),
        }
    }
}

impl Default for PersistConfig {
    fn default() -> Self {
        Self {
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            addr: default_health_addr(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load and validate configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let cfg = Self::parse_file(path)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Parse a YAML file without validating it.
    pub fn parse_file(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.dataset.root.as_os_str().is_empty() {
            bail!("dataset.root is required");
        }

        if self.dataset.batch_size == 0 {
            bail!("dataset.batch_size must be positive");
        }

        if self.dataset.sample_stride == 0 {
            bail!("dataset.sample_stride must be at least 1");
        }

        let ratio = &self.dataset.split_ratio;
        for (name, value) in [
            ("train", ratio.train),
            ("val", ratio.val),
            ("test", ratio.test),
        ] {
            if !(0.0..=1.0).contains(&value) {
                bail!("dataset.split_ratio.{name} must be within [0, 1], got {value}");
            }
        }

        let sum = ratio.train + ratio.val + ratio.test;
        if (sum - 1.0).abs() > 1e-6 {
            tracing::warn!(
                train = ratio.train,
                val = ratio.val,
                test = ratio.test,
                sum,
                "split ratios do not sum to 1, the remainder goes to test",
            );
        }

        if self.capture.visibility_check_interval == 0 {
            bail!("capture.visibility_check_interval must be positive");
        }

        if self.persist.shutdown_timeout.is_zero() {
            bail!("persist.shutdown_timeout must be positive");
        }

        if self.health.enabled && self.health.addr.is_empty() {
            bail!("health.addr is required when health.enabled is true");
        }

        Ok(())
    }
}
