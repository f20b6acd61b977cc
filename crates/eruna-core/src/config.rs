//! Eruna configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{ErunaError, Result};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErunaConfig {
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
}

impl ErunaConfig {
    /// Load config from the default path (~/.eruna/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ErunaError::Config(format!("Failed to read config: {e}")))?;
        Self::from_toml(&content)
    }

    /// Parse config from TOML text.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| ErunaError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to the given path.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| ErunaError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject values the batch cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.batch.chunk_size == 0 {
            return Err(ErunaError::Config("batch.chunk_size must be at least 1".into()));
        }
        if self.batch.page_size == 0 {
            return Err(ErunaError::Config("batch.page_size must be at least 1".into()));
        }
        if self.batch.job_name.trim().is_empty() {
            return Err(ErunaError::Config("batch.job_name must not be empty".into()));
        }
        if let Some(offset) = self.batch.utc_offset_minutes
            && !(-14 * 60..=14 * 60).contains(&offset)
        {
            return Err(ErunaError::Config(format!(
                "batch.utc_offset_minutes out of range: {offset}"
            )));
        }
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the Eruna home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".eruna")
    }
}

/// Which reader feeds the chunk loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReaderKind {
    /// Day-filtered paged query.
    #[default]
    Paged,
    /// Scan association rows and map matching ones to alarms.
    AssociationScan,
}

/// Per-alarm stage between reader and writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessorKind {
    #[default]
    PassThrough,
    /// Re-read each alarm and skip the ones no longer due today.
    Revalidate,
}

/// Batch job configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    #[serde(default = "default_job_name")]
    pub job_name: String,
    /// `SEC MIN HOUR DOM MON DOW` or `MIN HOUR DOM MON DOW`.
    #[serde(default = "default_cron")]
    pub cron: String,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "bool_true")]
    pub allow_start_if_complete: bool,
    #[serde(default)]
    pub reader: ReaderKind,
    #[serde(default)]
    pub processor: ProcessorKind,
    /// Fixed offset used to compute "today". None = host local time.
    #[serde(default)]
    pub utc_offset_minutes: Option<i32>,
    /// Longest single sleep of the trigger loop.
    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,
}

fn bool_true() -> bool { true }
fn default_job_name() -> String { "readAlarmsJob".into() }
fn default_cron() -> String { "0 0 0 * * *".into() }
fn default_chunk_size() -> usize { 100 }
fn default_page_size() -> usize { 10 }
fn default_check_interval() -> u64 { 30 }

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            job_name: default_job_name(),
            cron: default_cron(),
            chunk_size: default_chunk_size(),
            page_size: default_page_size(),
            allow_start_if_complete: bool_true(),
            reader: ReaderKind::default(),
            processor: ProcessorKind::default(),
            utc_offset_minutes: None,
            check_interval_secs: default_check_interval(),
        }
    }
}

/// Database configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_db_path() -> String { "~/.eruna/eruna.db".into() }

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { path: default_db_path() }
    }
}

impl DatabaseConfig {
    /// Database path with `~` expanded.
    pub fn resolved_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.path).to_string())
    }
}

/// Where resolved alarms are handed off.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Generic HTTP webhook — POST with JSON body.
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default)]
    pub webhook_headers: Vec<(String, String)>,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    /// Record each alarm's fire time in the local fire schedule.
    #[serde(default = "bool_true")]
    pub schedule_fires: bool,
}

fn default_timeout() -> u64 { 10 }

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            webhook_headers: Vec::new(),
            timeout_secs: default_timeout(),
            schedule_fires: bool_true(),
        }
    }
}
