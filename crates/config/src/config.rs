//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// 2 GiB, used both as the large-file warning threshold and the delivery limit.
pub const TWO_GIB: u64 = 2 * 1024 * 1024 * 1024;

/// Queue-related configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueConfig {
    /// Maximum number of entries per queue (default 20)
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    /// Entries above this size get a LargeFile warning (default 2 GiB)
    #[serde(default = "default_large_file_threshold")]
    pub large_file_threshold_bytes: u64,
    /// A merge needs at least this many entries (default 2)
    #[serde(default = "default_min_entries")]
    pub min_entries_to_merge: usize,
}

fn default_capacity() -> usize {
    20
}

fn default_large_file_threshold() -> u64 {
    TWO_GIB
}

fn default_min_entries() -> usize {
    2
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            large_file_threshold_bytes: default_large_file_threshold(),
            min_entries_to_merge: default_min_entries(),
        }
    }
}

/// Execution pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineConfig {
    /// Concurrent entry downloads per job (0 = auto-derive)
    #[serde(default)]
    pub download_concurrency: u32,
    /// Concurrent external tool runs across all sessions (0 = auto-derive)
    #[serde(default)]
    pub tool_slots: u32,
    /// Seconds the tool gets to quit after a graceful stop request
    #[serde(default = "default_cancel_grace_secs")]
    pub cancel_grace_secs: u64,
    /// Outputs smaller than this are treated as a failed merge
    #[serde(default = "default_min_output_bytes")]
    pub min_output_bytes: u64,
    /// Interval between merge-stage progress estimates
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,
}

fn default_cancel_grace_secs() -> u64 {
    5
}

fn default_min_output_bytes() -> u64 {
    1024
}

fn default_progress_interval_ms() -> u64 {
    500
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            download_concurrency: 0,
            tool_slots: 0,
            cancel_grace_secs: default_cancel_grace_secs(),
            min_output_bytes: default_min_output_bytes(),
            progress_interval_ms: default_progress_interval_ms(),
        }
    }
}

/// External tool locations
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolsConfig {
    #[serde(default = "default_ffmpeg")]
    pub ffmpeg: String,
    #[serde(default = "default_ffprobe")]
    pub ffprobe: String,
    /// Oldest accepted ffmpeg major version
    #[serde(default = "default_min_ffmpeg_major")]
    pub min_ffmpeg_major: u32,
}

fn default_ffmpeg() -> String {
    "ffmpeg".to_string()
}

fn default_ffprobe() -> String {
    "ffprobe".to_string()
}

fn default_min_ffmpeg_major() -> u32 {
    4
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            ffmpeg: default_ffmpeg(),
            ffprobe: default_ffprobe(),
            min_ffmpeg_major: default_min_ffmpeg_major(),
        }
    }
}

/// Delivery channel configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeliveryConfig {
    /// Directory finished artifacts are delivered into
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    /// Largest artifact the channel accepts
    #[serde(default = "default_delivery_max_bytes")]
    pub max_bytes: u64,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("merged")
}

fn default_delivery_max_bytes() -> u64 {
    TWO_GIB
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            max_bytes: default_delivery_max_bytes(),
        }
    }
}

/// Local storage configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StorageConfig {
    /// Base directory for per-job working directories
    #[serde(default = "default_temp_dir")]
    pub temp_dir: PathBuf,
    /// Terminal jobs are archived here as JSON when set
    #[serde(default)]
    pub archive_dir: Option<PathBuf>,
}

fn default_temp_dir() -> PathBuf {
    PathBuf::from("/tmp/clipmerge")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            temp_dir: default_temp_dir(),
            archive_dir: None,
        }
    }
}

/// Metrics endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_bind")]
    pub bind: String,
}

fn default_metrics_bind() -> String {
    "127.0.0.1:7879".to_string()
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: default_metrics_bind(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the config.toml file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - CLIPMERGE_QUEUE_CAPACITY -> queue.capacity
    /// - CLIPMERGE_LARGE_FILE_BYTES -> queue.large_file_threshold_bytes
    /// - CLIPMERGE_DOWNLOAD_CONCURRENCY -> pipeline.download_concurrency
    /// - CLIPMERGE_TOOL_SLOTS -> pipeline.tool_slots
    /// - CLIPMERGE_FFMPEG / CLIPMERGE_FFPROBE -> tools.ffmpeg / tools.ffprobe
    /// - CLIPMERGE_TEMP_DIR -> storage.temp_dir
    /// - CLIPMERGE_OUTPUT_DIR -> delivery.output_dir
    /// - CLIPMERGE_DELIVERY_MAX_BYTES -> delivery.max_bytes
    /// - CLIPMERGE_METRICS_ENABLED -> metrics.enabled
    pub fn apply_env_overrides(&mut self) {
        if let Some(capacity) = env_parse::<usize>("CLIPMERGE_QUEUE_CAPACITY") {
            self.queue.capacity = capacity;
        }

        if let Some(bytes) = env_parse::<u64>("CLIPMERGE_LARGE_FILE_BYTES") {
            self.queue.large_file_threshold_bytes = bytes;
        }

        if let Some(n) = env_parse::<u32>("CLIPMERGE_DOWNLOAD_CONCURRENCY") {
            self.pipeline.download_concurrency = n;
        }

        if let Some(n) = env_parse::<u32>("CLIPMERGE_TOOL_SLOTS") {
            self.pipeline.tool_slots = n;
        }

        if let Ok(val) = env::var("CLIPMERGE_FFMPEG") {
            if !val.trim().is_empty() {
                self.tools.ffmpeg = val;
            }
        }

        if let Ok(val) = env::var("CLIPMERGE_FFPROBE") {
            if !val.trim().is_empty() {
                self.tools.ffprobe = val;
            }
        }

        if let Ok(val) = env::var("CLIPMERGE_TEMP_DIR") {
            if !val.trim().is_empty() {
                self.storage.temp_dir = PathBuf::from(val);
            }
        }

        if let Ok(val) = env::var("CLIPMERGE_OUTPUT_DIR") {
            if !val.trim().is_empty() {
                self.delivery.output_dir = PathBuf::from(val);
            }
        }

        if let Some(bytes) = env_parse::<u64>("CLIPMERGE_DELIVERY_MAX_BYTES") {
            self.delivery.max_bytes = bytes;
        }

        if let Ok(val) = env::var("CLIPMERGE_METRICS_ENABLED") {
            // Accept "true", "1", "yes" as true; "false", "0", "no" as false
            match val.to_lowercase().as_str() {
                "true" | "1" | "yes" => self.metrics.enabled = true,
                "false" | "0" | "no" => self.metrics.enabled = false,
                _ => {} // Invalid value, keep existing
            }
        }
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|val| val.trim().parse::<T>().ok())
}
