//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/hindsight/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/hindsight/` (~/.config/hindsight/)
//! - Data: `$XDG_DATA_HOME/hindsight/` (~/.local/share/hindsight/)
//! - State/Logs: `$XDG_STATE_HOME/hindsight/` (~/.local/state/hindsight/)

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_DATA_HOME or ~/.local/share
fn xdg_data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Main configuration struct
#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    /// Language model configuration (optional; analysis is unavailable without it)
    #[serde(default)]
    pub llm: Option<LlmConfig>,

    /// Analysis pipeline tuning
    #[serde(default)]
    pub analysis: AnalysisConfig,

    /// Periodic analysis and liveness
    #[serde(default)]
    pub schedule: ScheduleConfig,

    /// Browser history location overrides
    #[serde(default)]
    pub history: HistoryConfig,

    /// Message bus settings
    #[serde(default)]
    pub bus: BusConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// LLM provider configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    /// Provider type
    pub provider: LlmProvider,
    /// Model to use
    pub model: String,
    /// API endpoint (optional, uses default for provider)
    pub endpoint: Option<String>,
    /// API key (can also use env var)
    pub api_key: Option<String>,
    /// HTTP request timeout in seconds
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,
    /// Override for the provider's input window
    pub max_input_tokens: Option<usize>,
    /// Preferred size of a single chunk prompt
    #[serde(default = "default_optimal_chunk_tokens")]
    pub optimal_chunk_tokens: usize,
}

/// Supported LLM providers
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    Ollama,
    Claude,
    OpenAI,
}

impl LlmProvider {
    /// Returns the default endpoint for this provider
    pub fn default_endpoint(&self) -> &'static str {
        match self {
            LlmProvider::Ollama => "http://localhost:11434",
            LlmProvider::Claude => "https://api.anthropic.com",
            LlmProvider::OpenAI => "https://api.openai.com",
        }
    }

    /// Returns a conservative input window for this provider
    pub fn default_max_input_tokens(&self) -> usize {
        match self {
            LlmProvider::Ollama => 8_192,
            LlmProvider::Claude => 200_000,
            LlmProvider::OpenAI => 128_000,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LlmProvider::Ollama => "ollama",
            LlmProvider::Claude => "claude",
            LlmProvider::OpenAI => "openai",
        }
    }
}

fn default_llm_timeout() -> u64 {
    120
}

fn default_optimal_chunk_tokens() -> usize {
    4_000
}

/// Analysis pipeline configuration
#[derive(Debug, Deserialize, Clone)]
pub struct AnalysisConfig {
    /// Max retry attempts for transient provider failures
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,

    /// First backoff delay in milliseconds (doubles per attempt)
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,

    /// Backoff ceiling in milliseconds
    #[serde(default = "default_retry_max_ms")]
    pub retry_max_ms: u64,

    /// Ask the model for activity ranges before falling back to half days
    #[serde(default)]
    pub suggest_ranges: bool,

    /// Upper bound for every list-valued profile field
    #[serde(default = "default_max_list_items")]
    pub max_list_items: usize,

    /// How far back the first scheduled run looks when no watermark exists
    #[serde(default = "default_lookback_hours")]
    pub lookback_hours: u32,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_base_ms: default_retry_base_ms(),
            retry_max_ms: default_retry_max_ms(),
            suggest_ranges: false,
            max_list_items: default_max_list_items(),
            lookback_hours: default_lookback_hours(),
        }
    }
}

impl AnalysisConfig {
    pub fn retry_base(&self) -> Duration {
        Duration::from_millis(self.retry_base_ms)
    }

    pub fn retry_max(&self) -> Duration {
        Duration::from_millis(self.retry_max_ms)
    }
}

fn default_max_retries() -> usize {
    3
}

fn default_retry_base_ms() -> u64 {
    1_000
}

fn default_retry_max_ms() -> u64 {
    30_000
}

fn default_max_list_items() -> usize {
    50
}

fn default_lookback_hours() -> u32 {
    24 * 7
}

/// Scheduling and keepalive configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ScheduleConfig {
    /// Initial value of the scheduled-analysis toggle (the stored toggle wins once set)
    #[serde(default)]
    pub enabled: bool,

    /// Minutes between scheduled analysis runs
    #[serde(default = "default_interval_minutes")]
    pub interval_minutes: u64,

    /// Minutes between checks that the analysis alarm is still armed
    #[serde(default = "default_health_check_minutes")]
    pub health_check_minutes: u64,

    /// Seconds between keepalive heartbeats while a session runs
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_minutes: default_interval_minutes(),
            health_check_minutes: default_health_check_minutes(),
            keepalive_secs: default_keepalive_secs(),
        }
    }
}

impl ScheduleConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_minutes * 60)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_minutes * 60)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }

    /// How long a running session may stay silent before the coordinator
    /// gives up on it: three missed keepalives.
    pub fn session_lease(&self) -> Duration {
        self.keepalive_interval() * 3
    }
}

fn default_interval_minutes() -> u64 {
    60
}

fn default_health_check_minutes() -> u64 {
    10
}

fn default_keepalive_secs() -> u64 {
    20
}

/// Browser history configuration
#[derive(Debug, Deserialize, Default, Clone)]
pub struct HistoryConfig {
    /// Path to a Chromium `History` database (auto-discovered when unset)
    pub chromium_path: Option<PathBuf>,
}

/// Message bus configuration
#[derive(Debug, Deserialize, Clone)]
pub struct BusConfig {
    /// Seconds a request waits for its response
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Mailbox capacity per context
    #[serde(default = "default_mailbox_capacity")]
    pub mailbox_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout(),
            mailbox_capacity: default_mailbox_capacity(),
        }
    }
}

impl BusConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn default_request_timeout() -> u64 {
    10
}

fn default_mailbox_capacity() -> usize {
    64
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Maximum number of log files to keep
    #[serde(default = "default_max_log_files")]
    pub max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_files: default_max_log_files(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_log_files() -> usize {
    5
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            return Ok(Config::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Reject values the orchestrator cannot work with
    pub fn validate(&self) -> Result<()> {
        if let Some(llm) = &self.llm {
            if llm.model.trim().is_empty() {
                return Err(Error::Config("llm.model must not be empty".to_string()));
            }
            if llm.optimal_chunk_tokens == 0 {
                return Err(Error::Config(
                    "llm.optimal_chunk_tokens must be greater than 0".to_string(),
                ));
            }
            if let Some(max) = llm.max_input_tokens {
                if max < llm.optimal_chunk_tokens {
                    return Err(Error::Config(
                        "llm.max_input_tokens must be at least llm.optimal_chunk_tokens"
                            .to_string(),
                    ));
                }
            }
        }
        if self.analysis.retry_base_ms > self.analysis.retry_max_ms {
            return Err(Error::Config(
                "analysis.retry_base_ms must not exceed analysis.retry_max_ms".to_string(),
            ));
        }
        if self.analysis.max_list_items == 0 {
            return Err(Error::Config(
                "analysis.max_list_items must be greater than 0".to_string(),
            ));
        }
        if self.schedule.interval_minutes == 0 || self.schedule.health_check_minutes == 0 {
            return Err(Error::Config(
                "schedule intervals must be greater than 0".to_string(),
            ));
        }
        if self.schedule.keepalive_secs == 0 {
            return Err(Error::Config(
                "schedule.keepalive_secs must be greater than 0".to_string(),
            ));
        }
        if self.bus.mailbox_capacity == 0 {
            return Err(Error::Config(
                "bus.mailbox_capacity must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/hindsight/config.toml` (~/.config/hindsight/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("hindsight").join("config.toml")
    }

    /// Returns the data directory path (for the store database)
    ///
    /// `$XDG_DATA_HOME/hindsight/` (~/.local/share/hindsight/)
    pub fn data_dir() -> PathBuf {
        xdg_data_home().join("hindsight")
    }

    /// Returns the state directory path (for logs)
    ///
    /// `$XDG_STATE_HOME/hindsight/` (~/.local/state/hindsight/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("hindsight")
    }

    /// Returns the store file path
    ///
    /// `$XDG_DATA_HOME/hindsight/store.db` (~/.local/share/hindsight/store.db)
    pub fn store_path() -> PathBuf {
        Self::data_dir().join("store.db")
    }

    /// Ensure XDG base directory environment variables are set.
    ///
    /// This is mainly for CLI binaries that want explicit, stable path behavior
    /// before invoking other components that read these env vars.
    pub fn ensure_xdg_env() {
        let home = home_dir();

        if std::env::var("XDG_DATA_HOME").is_err() {
            std::env::set_var("XDG_DATA_HOME", home.join(".local/share"));
        }

        if std::env::var("XDG_STATE_HOME").is_err() {
            std::env::set_var("XDG_STATE_HOME", home.join(".local/state"));
        }

        if std::env::var("XDG_CONFIG_HOME").is_err() {
            std::env::set_var("XDG_CONFIG_HOME", home.join(".config"));
        }
    }
}
