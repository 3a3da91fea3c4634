//! Configuration Loader
//!
//! Environment-aware configuration loading: `base.yaml`, then the optional
//! `<environment>.yaml`, then `HUNTSMAN__SECTION__KEY` environment variables.

use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use config::{Config, Environment, File, FileFormat};
use tracing::{debug, info};

use super::HuntsmanConfig;
use crate::error::{HuntsmanError, Result};

const ENV_PREFIX: &str = "HUNTSMAN";
const ENV_SEPARATOR: &str = "__";

/// Loaded, validated configuration plus where it came from
#[derive(Debug)]
pub struct ConfigManager {
    config: HuntsmanConfig,
    environment: String,
    config_directory: PathBuf,
}

impl ConfigManager {
    /// Load configuration with environment auto-detection
    pub fn load() -> Result<Arc<ConfigManager>> {
        Self::load_from_directory(None)
    }

    /// Load configuration from a specific directory
    pub fn load_from_directory(config_dir: Option<PathBuf>) -> Result<Arc<ConfigManager>> {
        let environment = crate::logging::get_environment();
        Self::load_from_directory_with_env(config_dir, &environment)
    }

    /// Load configuration from a specific directory with explicit environment
    /// This is useful for testing without modifying global environment variables
    pub fn load_from_directory_with_env(
        config_dir: Option<PathBuf>,
        environment: &str,
    ) -> Result<Arc<ConfigManager>> {
        Self::load_with_env_source(config_dir, environment, None)
    }

    /// Like [`load_from_directory_with_env`](Self::load_from_directory_with_env)
    /// with an explicit set of environment variables instead of the process
    /// environment
    pub fn load_with_env_source(
        config_dir: Option<PathBuf>,
        environment: &str,
        env_source: Option<HashMap<String, String>>,
    ) -> Result<Arc<ConfigManager>> {
        let config_directory = config_dir.unwrap_or_else(Self::default_config_directory);

        debug!(
            environment = %environment,
            directory = %config_directory.display(),
            "Loading configuration"
        );

        let config = Self::load_and_merge_config(&config_directory, environment, env_source)?;
        config.validate()?;

        info!(
            environment = %environment,
            worker_id = %config.worker.worker_id,
            durable_store = config.database.url.is_some(),
            "Configuration loaded successfully"
        );

        Ok(Arc::new(ConfigManager {
            config,
            environment: environment.to_string(),
            config_directory,
        }))
    }

    /// Get the loaded configuration
    pub fn config(&self) -> &HuntsmanConfig {
        &self.config
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn config_directory(&self) -> &Path {
        &self.config_directory
    }

    fn default_config_directory() -> PathBuf {
        env::var("HUNTSMAN_CONFIG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config"))
    }

    fn load_and_merge_config(
        config_directory: &Path,
        environment: &str,
        env_source: Option<HashMap<String, String>>,
    ) -> Result<HuntsmanConfig> {
        let base = config_directory.join("base.yaml");
        if !base.is_file() {
            return Err(HuntsmanError::ConfigurationError(format!(
                "base configuration not found at {}",
                base.display()
            )));
        }

        let overrides = config_directory.join(format!("{environment}.yaml"));
        let environment_source = Environment::with_prefix(ENV_PREFIX)
            .prefix_separator(ENV_SEPARATOR)
            .separator(ENV_SEPARATOR)
            .try_parsing(true)
            .source(env_source);

        Config::builder()
            .add_source(File::from(base).format(FileFormat::Yaml))
            .add_source(
                File::from(overrides)
                    .format(FileFormat::Yaml)
                    .required(false),
            )
            .add_source(environment_source)
            .build()
            .and_then(|config| config.try_deserialize::<HuntsmanConfig>())
            .map_err(|e| HuntsmanError::ConfigurationError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn setup_test_config_dir() -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("base.yaml"),
            "worker:\n  worker_id: base-worker\n  batch_size: 25\ncron:\n  tick_interval_secs: 30\n",
        )
        .unwrap();
        fs::write(
            dir.path().join("test.yaml"),
            "worker:\n  batch_size: 5\n",
        )
        .unwrap();
        dir
    }

    #[test]
    fn test_environment_specific_overrides() {
        let dir = setup_test_config_dir();
        let manager = ConfigManager::load_with_env_source(
            Some(dir.path().to_path_buf()),
            "test",
            Some(HashMap::new()),
        )
        .unwrap();
        assert_eq!(manager.environment(), "test");
        assert_eq!(manager.config().worker.worker_id, "base-worker");
        assert_eq!(manager.config().worker.batch_size, 5);
        assert_eq!(manager.config().cron.tick_interval_secs, 30);
    }

    #[test]
    fn test_missing_environment_file_is_optional() {
        let dir = setup_test_config_dir();
        let manager = ConfigManager::load_with_env_source(
            Some(dir.path().to_path_buf()),
            "staging",
            Some(HashMap::new()),
        )
        .unwrap();
        assert_eq!(manager.config().worker.batch_size, 25);
    }

    #[test]
    fn test_environment_variables_win() {
        let dir = setup_test_config_dir();
        let vars = HashMap::from([
            ("HUNTSMAN__WORKER__BATCH_SIZE".to_string(), "7".to_string()),
            (
                "HUNTSMAN__DATABASE__URL".to_string(),
                "postgres://localhost/huntsman".to_string(),
            ),
        ]);
        let manager =
            ConfigManager::load_with_env_source(Some(dir.path().to_path_buf()), "test", Some(vars))
                .unwrap();
        assert_eq!(manager.config().worker.batch_size, 7);
        assert_eq!(
            manager.config().database.url.as_deref(),
            Some("postgres://localhost/huntsman")
        );
    }

    #[test]
    fn test_missing_base_and_invalid_values() {
        let empty = TempDir::new().unwrap();
        assert!(ConfigManager::load_with_env_source(
            Some(empty.path().to_path_buf()),
            "test",
            Some(HashMap::new())
        )
        .is_err());

        let dir = setup_test_config_dir();
        fs::write(dir.path().join("broken.yaml"), "cron:\n  max_run_history: 0\n").unwrap();
        let err = ConfigManager::load_with_env_source(
            Some(dir.path().to_path_buf()),
            "broken",
            Some(HashMap::new()),
        )
        .unwrap_err();
        assert!(err.to_string().contains("cron.max_run_history"));
    }
}
