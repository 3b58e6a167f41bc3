//! # Engine Host Configuration
//!
//! `EngineConfig` describes one engine: where its schema lives, how the binary or
//! library is located, which flags and environment it receives and how errors
//! are reported. It can be built in code or loaded from YAML through
//! [`ConfigManager`].

pub mod error;
pub mod loader;

pub use error::{ConfigResult, ConfigurationError};
pub use loader::ConfigManager;

use crate::constants::{env as env_names, limits};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Log level requested from the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineLogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl EngineLogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }
}

/// Datasource URL override handed to the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasourceOverride {
    pub name: String,
    pub url: String,
}

/// Generator settings used for artifact lookup and error hints
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    pub provider: String,
    pub output: Option<PathBuf>,
    pub binary_targets: Vec<String>,
}

/// Configuration of a single engine instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Path of the schema file handed to the engine
    pub datamodel_path: PathBuf,
    /// Inline schema text; read from `datamodel_path` when absent
    pub datamodel: Option<String>,
    pub cwd: PathBuf,
    /// Directory of the generated client package
    pub dirname: Option<PathBuf>,
    /// Explicit path of the engine binary or library
    pub prisma_path: Option<PathBuf>,
    /// Remote engine endpoint; no process is spawned when set
    pub engine_endpoint: Option<String>,
    /// Extra environment for the engine process
    pub env: HashMap<String, String>,
    /// Extra command line flags for the engine process
    pub flags: Vec<String>,
    pub datasources: Vec<DatasourceOverride>,
    pub log_queries: bool,
    pub log_level: EngineLogLevel,
    pub show_colors: bool,
    pub client_version: String,
    pub engine_version: Option<String>,
    /// Platform identifier of the current host
    pub platform: String,
    pub generator: Option<GeneratorConfig>,
    pub enable_debug_logs: bool,
    pub allow_trigger_panic: bool,
    pub tracing_enabled: bool,
    pub ignore_env_var_errors: bool,
    /// Single attempt per request and per start
    pub no_retry: bool,
    pub event_channel_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            datamodel_path: PathBuf::from("schema.prisma"),
            datamodel: None,
            cwd: PathBuf::from("."),
            dirname: None,
            prisma_path: None,
            engine_endpoint: None,
            env: HashMap::new(),
            flags: Vec::new(),
            datasources: Vec::new(),
            log_queries: false,
            log_level: EngineLogLevel::default(),
            show_colors: false,
            client_version: "0.0.0".to_string(),
            engine_version: None,
            platform: "native".to_string(),
            generator: None,
            enable_debug_logs: false,
            allow_trigger_panic: false,
            tracing_enabled: false,
            ignore_env_var_errors: false,
            no_retry: false,
            event_channel_capacity: limits::EVENT_CHANNEL_CAPACITY,
        }
    }
}

impl EngineConfig {
    pub fn new(datamodel_path: impl Into<PathBuf>) -> Self {
        Self {
            datamodel_path: datamodel_path.into(),
            ..Self::default()
        }
    }

    /// Apply overrides taken from the process environment
    pub fn apply_environment_overrides(&mut self) {
        if std::env::var_os(env_names::NO_RETRY).is_some() {
            self.no_retry = true;
        }
    }

    /// Datasource overrides as a name to URL map
    pub fn datasource_overrides(&self) -> HashMap<String, String> {
        self.datasources
            .iter()
            .map(|ds| (ds.name.clone(), ds.url.clone()))
            .collect()
    }

    /// Binary targets declared by the generator, empty when none
    pub fn binary_targets(&self) -> &[String] {
        self.generator
            .as_ref()
            .map(|g| g.binary_targets.as_slice())
            .unwrap_or(&[])
    }

    /// Directory containing the schema file
    pub fn datamodel_dir(&self) -> Option<PathBuf> {
        self.datamodel_path.parent().map(|p| p.to_path_buf())
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.datamodel_path.as_os_str().is_empty() && self.datamodel.is_none() {
            return Err(ConfigurationError::missing_required_field(
                "datamodel_path",
                "engine configuration",
            ));
        }

        if self.client_version.trim().is_empty() {
            return Err(ConfigurationError::missing_required_field(
                "client_version",
                "engine configuration",
            ));
        }

        if self.event_channel_capacity == 0 {
            return Err(ConfigurationError::invalid_value(
                "event_channel_capacity",
                "0",
                "event channel capacity must be greater than zero",
            ));
        }

        if let Some(endpoint) = &self.engine_endpoint {
            if reqwest::Url::parse(endpoint).is_err() {
                return Err(ConfigurationError::invalid_value(
                    "engine_endpoint",
                    endpoint.clone(),
                    "engine endpoint must be an absolute URL",
                ));
            }
        }

        for flag in &self.flags {
            if flag == crate::constants::flags::PORT {
                return Err(ConfigurationError::invalid_value(
                    "flags",
                    flag.clone(),
                    "the port is chosen by the host and cannot be passed as a flag",
                ));
            }
        }

        Ok(())
    }
}
