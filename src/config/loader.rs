//! Configuration Loader
//!
//! Environment-aware loading of `engine-config.yaml`. The base document is
//! merged with the section named after the detected environment
//! (`development`, `test`, `production`) before deserializing.

use super::error::{ConfigResult, ConfigurationError};
use super::EngineConfig;
use serde_yaml::Value as YamlValue;
use std::env;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};
use tracing::{debug, warn};

const CONFIG_FILE_NAMES: [&str; 2] = ["engine-config.yaml", "engine-config.yml"];
const ENVIRONMENT_SECTIONS: [&str; 3] = ["development", "test", "production"];

/// Loaded configuration together with where it came from
#[derive(Debug)]
pub struct ConfigManager {
    config: EngineConfig,
    environment: String,
    config_directory: PathBuf,
}

impl ConfigManager {
    /// Load configuration with environment auto-detection
    pub fn load() -> ConfigResult<Arc<ConfigManager>> {
        Self::load_from_directory(None)
    }

    /// Load configuration from a specific directory
    pub fn load_from_directory(config_dir: Option<PathBuf>) -> ConfigResult<Arc<ConfigManager>> {
        let environment = detect_environment();
        Self::load_from_directory_with_env(config_dir, &environment)
    }

    /// Load configuration from a specific directory with explicit environment
    pub fn load_from_directory_with_env(
        config_dir: Option<PathBuf>,
        environment: &str,
    ) -> ConfigResult<Arc<ConfigManager>> {
        let config_directory = config_dir.unwrap_or_else(|| PathBuf::from("config"));

        debug!(
            environment = %environment,
            directory = %config_directory.display(),
            "Loading engine configuration"
        );

        let mut config = Self::load_and_merge_config(&config_directory, environment)?;
        config.apply_environment_overrides();
        config.validate()?;

        debug!(
            client_version = %config.client_version,
            endpoint = ?config.engine_endpoint,
            no_retry = config.no_retry,
            "Engine configuration loaded"
        );

        Ok(Arc::new(ConfigManager {
            config,
            environment: environment.to_string(),
            config_directory,
        }))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn config_directory(&self) -> &Path {
        &self.config_directory
    }

    fn fallback() -> ConfigManager {
        warn!("Creating fallback engine configuration with defaults");
        let mut config = EngineConfig::default();
        config.apply_environment_overrides();

        ConfigManager {
            config,
            environment: detect_environment(),
            config_directory: PathBuf::from("config"),
        }
    }

    /// Read a configuration file with a size limit
    fn read_config_file_safely(path: &Path) -> ConfigResult<String> {
        const MAX_CONFIG_FILE_SIZE: u64 = 1024 * 1024;

        let metadata = std::fs::metadata(path)
            .map_err(|e| ConfigurationError::file_read_error(path.display().to_string(), e))?;

        if metadata.len() > MAX_CONFIG_FILE_SIZE {
            return Err(ConfigurationError::invalid_value(
                "file_size",
                metadata.len().to_string(),
                format!("Configuration file too large (limit {MAX_CONFIG_FILE_SIZE} bytes)"),
            ));
        }

        if !metadata.is_file() {
            return Err(ConfigurationError::invalid_value(
                "file_type",
                "directory or special file",
                "Configuration path must point to a regular file",
            ));
        }

        std::fs::read_to_string(path)
            .map_err(|e| ConfigurationError::file_read_error(path.display().to_string(), e))
    }

    fn find_config_file(config_directory: &Path) -> ConfigResult<PathBuf> {
        let mut searched_paths = Vec::new();

        for name in CONFIG_FILE_NAMES {
            let config_path = config_directory.join(name);
            searched_paths.push(config_path.clone());

            if config_path.exists() {
                debug!("Found configuration file: {}", config_path.display());
                return Ok(config_path);
            }
        }

        Err(ConfigurationError::config_file_not_found(searched_paths))
    }

    fn load_and_merge_config(
        config_directory: &Path,
        environment: &str,
    ) -> ConfigResult<EngineConfig> {
        let config_file = Self::find_config_file(config_directory)?;
        let yaml_content = Self::read_config_file_safely(&config_file)?;

        let mut yaml_data: YamlValue = serde_yaml::from_str(&yaml_content)
            .map_err(|e| ConfigurationError::invalid_yaml(config_file.display().to_string(), e))?;

        if let Some(env_overrides) = yaml_data
            .get(YamlValue::String(environment.to_string()))
            .cloned()
        {
            debug!("Applying environment-specific overrides for: {}", environment);
            Self::merge_yaml_values(&mut yaml_data, env_overrides)?;
        }

        if let YamlValue::Mapping(ref mut map) = yaml_data {
            for section in ENVIRONMENT_SECTIONS {
                map.remove(YamlValue::String(section.to_string()));
            }
        }

        serde_yaml::from_value(yaml_data).map_err(|e| {
            ConfigurationError::invalid_yaml(
                config_file.display().to_string(),
                format!("Failed to deserialize configuration: {e}"),
            )
        })
    }

    /// Recursively merge environment overrides into the base document
    fn merge_yaml_values(base: &mut YamlValue, override_value: YamlValue) -> ConfigResult<()> {
        match (&mut *base, override_value) {
            (YamlValue::Mapping(base_map), YamlValue::Mapping(override_map)) => {
                for (key, value) in override_map {
                    if let Some(existing_value) = base_map.get_mut(&key) {
                        Self::merge_yaml_values(existing_value, value)?;
                    } else {
                        base_map.insert(key, value);
                    }
                }
            }
            (YamlValue::Mapping(_), other) => {
                return Err(ConfigurationError::ConfigMergeError {
                    error: format!("cannot merge non-mapping override {other:?} into a mapping"),
                });
            }
            (base_ref, override_val) => {
                *base_ref = override_val;
            }
        }
        Ok(())
    }
}

/// Detect the current environment from environment variables
pub(crate) fn detect_environment() -> String {
    env::var("ENGINE_HOST_ENV")
        .or_else(|_| env::var("APP_ENV"))
        .unwrap_or_else(|_| "development".to_string())
        .to_lowercase()
}

static GLOBAL_CONFIG: OnceLock<Arc<ConfigManager>> = OnceLock::new();
static CONFIG_LOCK: Mutex<()> = Mutex::new(());

impl ConfigManager {
    /// Get or initialize the process-wide configuration
    pub fn global() -> Arc<ConfigManager> {
        GLOBAL_CONFIG
            .get_or_init(|| {
                let _lock = CONFIG_LOCK.lock().unwrap_or_else(|p| p.into_inner());
                ConfigManager::load().unwrap_or_else(|e| {
                    warn!("Engine configuration loading failed, using defaults: {e}");
                    Arc::new(ConfigManager::fallback())
                })
            })
            .clone()
    }

    /// Initialize the process-wide configuration from a directory. First call wins.
    pub fn initialize_global(config_dir: Option<PathBuf>) -> ConfigResult<Arc<ConfigManager>> {
        let _lock = CONFIG_LOCK.lock().unwrap_or_else(|p| p.into_inner());
        let config_manager = ConfigManager::load_from_directory(config_dir)?;
        let _ = GLOBAL_CONFIG.set(config_manager.clone());
        Ok(config_manager)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineLogLevel;
    use std::fs;
    use tempfile::TempDir;

    fn create_test_config_yaml() -> &'static str {
        r#"
datamodel_path: prisma/schema.prisma
client_version: "5.4.0"
log_level: warn
flags:
  - "--enable-experimental"
generator:
  provider: prisma-client-js
  binary_targets:
    - native
datasources:
  - name: db
    url: postgresql://localhost:5432/app

development:
  log_queries: true
  log_level: debug

test:
  engine_endpoint: "http://127.0.0.1:4466"
  generator:
    binary_targets:
      - native
      - debian-openssl-3.0.x

production:
  log_level: error
  show_colors: false
"#
    }

    fn setup_test_config_dir() -> (TempDir, PathBuf) {
        let temp_dir = TempDir::new().unwrap();
        let config_dir = temp_dir.path().to_path_buf();
        fs::write(config_dir.join("engine-config.yaml"), create_test_config_yaml()).unwrap();
        (temp_dir, config_dir)
    }

    #[test]
    fn test_config_file_discovery() {
        let (_temp_dir, config_dir) = setup_test_config_dir();
        let config_file = ConfigManager::find_config_file(&config_dir).unwrap();
        assert_eq!(config_file.file_name().unwrap(), "engine-config.yaml");
    }

    #[test]
    fn test_config_file_not_found() {
        let temp_dir = TempDir::new().unwrap();
        let result = ConfigManager::find_config_file(temp_dir.path());

        if let Err(ConfigurationError::ConfigFileNotFound { searched_paths }) = result {
            assert_eq!(searched_paths.len(), 2);
        } else {
            panic!("Expected ConfigFileNotFound error");
        }
    }

    #[test]
    fn test_base_config_loading() {
        let (_temp_dir, config_dir) = setup_test_config_dir();
        let manager =
            ConfigManager::load_from_directory_with_env(Some(config_dir), "staging").unwrap();
        let config = manager.config();

        assert_eq!(manager.environment(), "staging");
        assert_eq!(config.client_version, "5.4.0");
        assert_eq!(config.log_level, EngineLogLevel::Warn);
        assert_eq!(config.datamodel_path, PathBuf::from("prisma/schema.prisma"));
        assert_eq!(config.flags, vec!["--enable-experimental".to_string()]);
        assert_eq!(config.datasources.len(), 1);
        assert!(config.engine_endpoint.is_none());
    }

    #[test]
    fn test_environment_specific_overrides() {
        let (_temp_dir, config_dir) = setup_test_config_dir();

        let development =
            ConfigManager::load_from_directory_with_env(Some(config_dir.clone()), "development")
                .unwrap();
        assert!(development.config().log_queries);
        assert_eq!(development.config().log_level, EngineLogLevel::Debug);

        let test =
            ConfigManager::load_from_directory_with_env(Some(config_dir.clone()), "test").unwrap();
        assert_eq!(
            test.config().engine_endpoint.as_deref(),
            Some("http://127.0.0.1:4466")
        );
        assert_eq!(test.config().binary_targets().len(), 2);
        assert_eq!(
            test.config().generator.as_ref().unwrap().provider,
            "prisma-client-js"
        );

        let production =
            ConfigManager::load_from_directory_with_env(Some(config_dir), "production").unwrap();
        assert_eq!(production.config().log_level, EngineLogLevel::Error);
        assert!(!production.config().log_queries);
    }

    #[test]
    fn test_invalid_yaml_reports_file() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("engine-config.yml"), "flags: [unclosed").unwrap();

        let result =
            ConfigManager::load_from_directory_with_env(Some(temp_dir.path().to_path_buf()), "test");
        assert!(matches!(result, Err(ConfigurationError::InvalidYaml { .. })));
    }

    #[test]
    fn test_merge_scalar_override() {
        let mut base: YamlValue = serde_yaml::from_str("a: 1\nb: {c: 2}").unwrap();
        let overrides: YamlValue = serde_yaml::from_str("b: {c: 3, d: 4}").unwrap();
        ConfigManager::merge_yaml_values(&mut base, overrides).unwrap();

        assert_eq!(base["a"], YamlValue::from(1));
        assert_eq!(base["b"]["c"], YamlValue::from(3));
        assert_eq!(base["b"]["d"], YamlValue::from(4));
    }
}
