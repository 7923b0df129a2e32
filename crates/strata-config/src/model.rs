use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// File name of the recorder database when no path is configured.
pub const DEFAULT_DATABASE_FILE: &str = "recorder.db";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrataConfig {
    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub purge: PurgeConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub log_level: Option<String>,
}

impl Default for StrataConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            purge: PurgeConfig::default(),
            retry: RetryConfig::default(),
            log_level: Some("info".to_string()),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Recorder database file. Relative paths resolve against the config
    /// directory.
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Migration marker file; defaults to the database path plus
    /// `.migrating`.
    #[serde(default)]
    pub marker_path: Option<PathBuf>,
}

impl DatabaseConfig {
    pub fn resolve_path(&self, config_dir: &Path) -> PathBuf {
        match &self.path {
            Some(path) if path.is_absolute() => path.clone(),
            Some(path) => config_dir.join(path),
            None => config_dir.join(DEFAULT_DATABASE_FILE),
        }
    }

    /// Configured marker path, resolved like [`DatabaseConfig::resolve_path`].
    pub fn resolve_marker_path(&self, config_dir: &Path) -> Option<PathBuf> {
        self.marker_path.as_ref().map(|path| {
            if path.is_absolute() {
                path.clone()
            } else {
                config_dir.join(path)
            }
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PurgeConfig {
    #[serde(default = "default_keep_days")]
    pub keep_days: u32,

    #[serde(default = "default_true")]
    pub auto_purge: bool,

    #[serde(default)]
    pub auto_repack: bool,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for PurgeConfig {
    fn default() -> Self {
        Self {
            keep_days: default_keep_days(),
            auto_purge: default_true(),
            auto_repack: false,
            batch_size: default_batch_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_wait_secs")]
    pub wait_secs: u64,

    #[serde(default = "default_max_step_attempts")]
    pub max_step_attempts: u32,
}

impl RetryConfig {
    pub fn wait(&self) -> Duration {
        Duration::from_secs(self.wait_secs)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            wait_secs: default_wait_secs(),
            max_step_attempts: default_max_step_attempts(),
        }
    }
}

fn default_keep_days() -> u32 {
    10
}

fn default_true() -> bool {
    true
}

fn default_batch_size() -> usize {
    998
}

fn default_wait_secs() -> u64 {
    3
}

fn default_max_step_attempts() -> u32 {
    10
}
