use std::path::{Path, PathBuf};

use strata_common::{Error, Result};
use tracing::info;

use crate::model::StrataConfig;

pub struct ConfigLoader {
    config_dir: PathBuf,
}

impl ConfigLoader {
    pub fn new() -> Result<Self> {
        let config_dir = Self::default_config_dir();
        Ok(Self { config_dir })
    }

    pub fn default_config_dir() -> PathBuf {
        let home_config = dirs::home_dir().map(|h| h.join(".strata"));
        let xdg_config = dirs::config_dir().map(|c| c.join("strata"));

        match (xdg_config, home_config) {
            (Some(xdg), Some(home)) => {
                // An existing legacy home directory wins over a fresh XDG one.
                if !xdg.exists() && home.exists() {
                    home
                } else {
                    xdg
                }
            }
            (Some(xdg), None) => xdg,
            (None, Some(home)) => home,
            (None, None) => PathBuf::from(".strata"),
        }
    }

    pub fn with_dir(config_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
        }
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    /// Returns true if a config file (YAML or TOML) exists on disk.
    pub fn config_file_exists(&self) -> bool {
        self.config_dir.join("config.yml").exists() || self.config_dir.join("config.toml").exists()
    }

    pub fn load(&self) -> Result<StrataConfig> {
        let yaml_path = self.config_dir.join("config.yml");
        let toml_path = self.config_dir.join("config.toml");

        let config: StrataConfig = if yaml_path.exists() {
            info!("loading config from {}", yaml_path.display());
            let contents = std::fs::read_to_string(&yaml_path)?;
            serde_yaml::from_str(&contents)
                .map_err(|e| Error::Config(format!("failed to parse YAML config: {e}")))?
        } else if toml_path.exists() {
            info!("loading config from {}", toml_path.display());
            let contents = std::fs::read_to_string(&toml_path)?;
            toml::from_str(&contents)
                .map_err(|e| Error::Config(format!("failed to parse TOML config: {e}")))?
        } else {
            info!("no config file found, using defaults");
            StrataConfig::default()
        };

        validate(&config)?;
        Ok(config)
    }

    /// Recorder database path from `config`, relative to the config directory.
    pub fn database_path(&self, config: &StrataConfig) -> PathBuf {
        config.database.resolve_path(&self.config_dir)
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        if !self.config_dir.exists() {
            std::fs::create_dir_all(&self.config_dir)?;
        }
        Ok(())
    }
}

fn validate(config: &StrataConfig) -> Result<()> {
    if config.purge.keep_days == 0 {
        return Err(Error::Config(
            "purge.keep_days must be at least 1".to_string(),
        ));
    }
    if config.purge.batch_size == 0 {
        return Err(Error::Config(
            "purge.batch_size must be at least 1".to_string(),
        ));
    }
    if config.retry.max_step_attempts == 0 {
        return Err(Error::Config(
            "retry.max_step_attempts must be at least 1".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::ConfigLoader;
    use std::fs;
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_dir(label: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock should be after unix epoch")
            .as_nanos();
        std::env::temp_dir().join(format!(
            "strata-config-test-{}-{}-{}",
            label,
            std::process::id(),
            nanos
        ))
    }

    #[test]
    fn load_returns_default_when_no_config_exists() {
        let dir = temp_dir("default");
        fs::create_dir_all(&dir).expect("failed to create temp dir");

        let loader = ConfigLoader::with_dir(&dir);
        let config = loader.load().expect("load should succeed");

        assert_eq!(config.purge.keep_days, 10);
        assert_eq!(config.purge.batch_size, 998);
        assert!(config.purge.auto_purge);
        assert!(!config.purge.auto_repack);
        assert_eq!(config.retry.wait_secs, 3);
        assert_eq!(config.retry.max_step_attempts, 10);
        assert_eq!(config.log_level.as_deref(), Some("info"));
        assert_eq!(loader.database_path(&config), dir.join("recorder.db"));

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn load_prefers_yaml_over_toml_when_both_exist() {
        let dir = temp_dir("yaml-precedence");
        fs::create_dir_all(&dir).expect("failed to create temp dir");

        fs::write(dir.join("config.yml"), "purge:\n  keep_days: 30\n")
            .expect("failed to write yaml config");
        fs::write(dir.join("config.toml"), "[purge]\nkeep_days = 5\n")
            .expect("failed to write toml config");

        let loader = ConfigLoader::with_dir(&dir);
        let config = loader.load().expect("load should succeed");

        assert_eq!(config.purge.keep_days, 30);
        assert_eq!(config.purge.batch_size, 998);

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn load_reads_toml_when_yaml_missing() {
        let dir = temp_dir("toml");
        fs::create_dir_all(&dir).expect("failed to create temp dir");

        fs::write(
            dir.join("config.toml"),
            "log_level = \"debug\"\n\n[database]\npath = \"/var/lib/strata/home.db\"\n\n[retry]\nwait_secs = 1\n",
        )
        .expect("failed to write toml config");

        let loader = ConfigLoader::with_dir(&dir);
        let config = loader.load().expect("load should succeed");

        assert_eq!(config.log_level.as_deref(), Some("debug"));
        assert_eq!(
            loader.database_path(&config),
            PathBuf::from("/var/lib/strata/home.db")
        );
        assert_eq!(config.retry.wait_secs, 1);
        assert_eq!(config.retry.max_step_attempts, 10);

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn load_rejects_zero_retention() {
        let dir = temp_dir("zero-retention");
        fs::create_dir_all(&dir).expect("failed to create temp dir");
        fs::write(dir.join("config.yml"), "purge:\n  keep_days: 0\n")
            .expect("failed to write yaml config");

        let err = ConfigLoader::with_dir(&dir)
            .load()
            .expect_err("zero retention should be rejected");
        assert!(err.to_string().contains("keep_days"));

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn load_reports_malformed_yaml() {
        let dir = temp_dir("malformed");
        fs::create_dir_all(&dir).expect("failed to create temp dir");
        fs::write(dir.join("config.yml"), "purge: [unclosed\n")
            .expect("failed to write yaml config");

        let err = ConfigLoader::with_dir(&dir)
            .load()
            .expect_err("malformed yaml should fail");
        assert!(err.to_string().contains("failed to parse YAML config"));

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn ensure_dirs_creates_config_dir() {
        let dir = temp_dir("ensure-dirs");
        let loader = ConfigLoader::with_dir(&dir);

        loader.ensure_dirs().expect("ensure_dirs should succeed");
        assert!(dir.exists());

        let _ = fs::remove_dir_all(dir);
    }
}
