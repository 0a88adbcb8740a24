//! studiod configuration types and loading

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Main studiod configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Remote key-value store
    pub kv: KvConfig,

    /// Assistant CLI job family
    pub llm: LlmConfig,

    /// Render job family
    pub render: RenderConfig,

    /// Workflow orchestration
    pub orchestration: OrchestrationConfig,

    /// Scheduler loop tuning
    pub scheduler: SchedulerTickConfig,
}

impl Config {
    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Try project-local config: .studiod.yml
        let local_config = PathBuf::from(".studiod.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        // Try user config: ~/.config/studiod/studiod.yml
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("studiod").join("studiod.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        // No config file found, use defaults
        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }
}

/// Remote key-value store connection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KvConfig {
    /// Store URL; absent means in-memory only (no durability)
    pub url: Option<String>,
}

impl Default for KvConfig {
    fn default() -> Self {
        Self {
            url: Some("redis://127.0.0.1:6379".to_string()),
        }
    }
}

/// Assistant CLI job family
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Executable invoked per job
    pub command: String,

    /// Arguments prepended before per-job flags
    pub args: Vec<String>,

    #[serde(rename = "default-timeout-ms")]
    pub default_timeout_ms: u64,

    #[serde(rename = "max-concurrent")]
    pub max_concurrent: usize,

    #[serde(rename = "max-queue-size")]
    pub max_queue_size: usize,

    /// Transient-failure retries per job
    #[serde(rename = "max-retries")]
    pub max_retries: u32,

    #[serde(rename = "rate-limit-per-minute")]
    pub rate_limit_per_minute: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            command: "claude".to_string(),
            args: vec!["--print".to_string()],
            default_timeout_ms: 300_000,
            max_concurrent: 2,
            max_queue_size: 100,
            max_retries: 2,
            rate_limit_per_minute: 30,
        }
    }
}

/// Render job family
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    #[serde(rename = "max-concurrent")]
    pub max_concurrent: usize,

    #[serde(rename = "max-queue-size")]
    pub max_queue_size: usize,

    #[serde(rename = "max-pattern-length")]
    pub max_pattern_length: usize,

    /// Longest renderable clip in seconds
    #[serde(rename = "max-duration-secs")]
    pub max_duration_secs: f64,

    #[serde(rename = "render-timeout-ms")]
    pub render_timeout_ms: u64,

    #[serde(rename = "encode-timeout-ms")]
    pub encode_timeout_ms: u64,

    /// Remote sample repository base URL
    #[serde(rename = "sample-repo-url")]
    pub sample_repo_url: String,

    /// File cache for decoded samples
    #[serde(rename = "sample-cache-dir")]
    pub sample_cache_dir: PathBuf,

    #[serde(rename = "rate-limit-per-minute")]
    pub rate_limit_per_minute: u32,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 2,
            max_queue_size: 50,
            max_pattern_length: 50_000,
            max_duration_secs: 300.0,
            render_timeout_ms: 60_000,
            encode_timeout_ms: 10_000,
            sample_repo_url: "https://samples.studio.example.com/packs".to_string(),
            sample_cache_dir: std::env::temp_dir().join("studiod-samples"),
            rate_limit_per_minute: 20,
        }
    }
}

/// Workflow orchestration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestrationConfig {
    #[serde(rename = "max-parallel-steps")]
    pub max_parallel_steps: usize,

    #[serde(rename = "default-step-timeout-ms")]
    pub default_step_timeout_ms: u64,
}

impl Default for OrchestrationConfig {
    fn default() -> Self {
        Self {
            max_parallel_steps: 4,
            default_step_timeout_ms: 300_000,
        }
    }
}

/// Scheduler loop tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerTickConfig {
    /// Dispatch loop wake interval
    #[serde(rename = "tick-ms")]
    pub tick_ms: u64,
}

impl Default for SchedulerTickConfig {
    fn default() -> Self {
        Self { tick_ms: 1_000 }
    }
}
