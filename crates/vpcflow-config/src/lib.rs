//! vpcflow engine configuration
//!
//! Finds and loads the YAML file that tunes the engine: worker pool size,
//! poll and sweep intervals, lease TTL, the backup reachability bound and
//! where staging objects and the state file live.

pub mod error;

pub use error::*;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_ENV: &str = "VPCFLOW_CONFIG_PATH";
const CONFIG_FILE: &str = "vpcflow.yaml";
const PROJECT_DIR: &str = ".vpcflow";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Concurrent tasks per stage
    pub workers: usize,

    pub poll_interval_secs: u64,

    pub sweep_interval_secs: u64,

    /// Migration record lease lifetime
    pub lease_ttl_secs: u64,

    /// Reachability checks before the backup instance is given up on
    pub max_reachability_attempts: u32,

    /// Bucket migrated images are staged in
    pub staging_bucket: String,

    pub state_dir: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            poll_interval_secs: 5,
            sweep_interval_secs: 30,
            lease_ttl_secs: 120,
            max_reachability_attempts: 30,
            staging_bucket: "vpcflow-staging".to_string(),
            state_dir: PathBuf::from(PROJECT_DIR),
        }
    }
}

impl EngineConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }

    fn check(self) -> Result<Self> {
        if self.workers == 0 {
            return Err(ConfigError::Invalid("workers must be at least 1".to_string()));
        }
        if self.lease_ttl_secs == 0 {
            return Err(ConfigError::Invalid(
                "lease_ttl_secs must be at least 1".to_string(),
            ));
        }
        if self.staging_bucket.trim().is_empty() {
            return Err(ConfigError::Invalid("staging_bucket is empty".to_string()));
        }
        Ok(self)
    }
}

/// Locate the config file
///
/// Search order:
/// 1. `VPCFLOW_CONFIG_PATH`
/// 2. `./vpcflow.yaml`
/// 3. `./.vpcflow/vpcflow.yaml`
/// 4. `~/.config/vpcflow/config.yaml`
pub fn find_config_file() -> Result<PathBuf> {
    if let Ok(config_path) = std::env::var(CONFIG_ENV) {
        let path = PathBuf::from(config_path);
        if path.exists() {
            return Ok(path);
        }
    }

    let current_dir = std::env::current_dir()?;
    let path = current_dir.join(CONFIG_FILE);
    if path.exists() {
        return Ok(path);
    }

    let path = current_dir.join(PROJECT_DIR).join(CONFIG_FILE);
    if path.exists() {
        return Ok(path);
    }

    if let Some(config_dir) = dirs::config_dir() {
        let global_config = config_dir.join("vpcflow").join("config.yaml");
        if global_config.exists() {
            return Ok(global_config);
        }
    }

    Err(ConfigError::ConfigFileNotFound)
}

pub fn load_config_from(path: &Path) -> Result<EngineConfig> {
    let content = std::fs::read_to_string(path)?;
    let config: EngineConfig = serde_yaml::from_str(&content)?;
    tracing::debug!(path = %path.display(), "Loaded engine config");
    config.check()
}

/// Load the discovered config file, or defaults when there is none
pub fn load_config() -> Result<EngineConfig> {
    match find_config_file() {
        Ok(path) => load_config_from(&path),
        Err(ConfigError::ConfigFileNotFound) => {
            tracing::debug!("No config file found, using defaults");
            Ok(EngineConfig::default())
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::fs;

    #[test]
    fn test_partial_config_keeps_defaults() {
        let config: EngineConfig =
            serde_yaml::from_str("workers: 8\nlease_ttl_secs: 60\n").unwrap();
        assert_eq!(config.workers, 8);
        assert_eq!(config.lease_ttl(), Duration::from_secs(60));
        assert_eq!(config.sweep_interval_secs, 30);
        assert_eq!(config.staging_bucket, "vpcflow-staging");
    }

    #[test]
    fn test_zero_workers_is_rejected() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("vpcflow.yaml");
        fs::write(&path, "workers: 0\n").unwrap();

        let result = load_config_from(&path);
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    #[serial]
    fn test_find_config_file_in_current_dir() {
        let temp_dir = tempfile::tempdir().unwrap();
        let original_dir = std::env::current_dir().unwrap();

        fs::write(temp_dir.path().join("vpcflow.yaml"), "workers: 2\n").unwrap();
        std::env::set_current_dir(&temp_dir).unwrap();

        let result = find_config_file().unwrap();
        assert!(result.ends_with("vpcflow.yaml"));
        assert_eq!(load_config().unwrap().workers, 2);

        std::env::set_current_dir(original_dir).unwrap();
    }

    #[test]
    #[serial]
    fn test_find_config_file_in_project_dir() {
        let temp_dir = tempfile::tempdir().unwrap();
        let original_dir = std::env::current_dir().unwrap();

        let project_dir = temp_dir.path().join(".vpcflow");
        fs::create_dir(&project_dir).unwrap();
        fs::write(project_dir.join("vpcflow.yaml"), "workers: 3\n").unwrap();
        std::env::set_current_dir(&temp_dir).unwrap();

        let result = find_config_file().unwrap();
        assert!(result.ends_with(".vpcflow/vpcflow.yaml"));

        std::env::set_current_dir(original_dir).unwrap();
    }

    #[test]
    #[serial]
    fn test_current_dir_beats_project_dir() {
        let temp_dir = tempfile::tempdir().unwrap();
        let original_dir = std::env::current_dir().unwrap();

        let project_dir = temp_dir.path().join(".vpcflow");
        fs::create_dir(&project_dir).unwrap();
        fs::write(project_dir.join("vpcflow.yaml"), "workers: 3\n").unwrap();
        fs::write(temp_dir.path().join("vpcflow.yaml"), "workers: 5\n").unwrap();
        std::env::set_current_dir(&temp_dir).unwrap();

        assert_eq!(load_config().unwrap().workers, 5);

        std::env::set_current_dir(original_dir).unwrap();
    }

    #[test]
    #[serial]
    fn test_find_config_file_env_var() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config_path = temp_dir.path().join("custom.yaml");
        fs::write(&config_path, "staging_bucket: custom\n").unwrap();

        unsafe {
            std::env::set_var(CONFIG_ENV, config_path.to_str().unwrap());
        }

        let result = find_config_file().unwrap();
        assert_eq!(result, config_path);
        assert_eq!(load_config().unwrap().staging_bucket, "custom");

        unsafe {
            std::env::remove_var(CONFIG_ENV);
        }
    }

    #[test]
    #[serial]
    fn test_missing_file_falls_back_to_defaults() {
        let temp_dir = tempfile::tempdir().unwrap();
        let original_dir = std::env::current_dir().unwrap();
        std::env::set_current_dir(&temp_dir).unwrap();

        // a global config on the host would be picked up here
        if matches!(find_config_file(), Err(ConfigError::ConfigFileNotFound)) {
            assert_eq!(load_config().unwrap(), EngineConfig::default());
        }

        std::env::set_current_dir(original_dir).unwrap();
    }
}
