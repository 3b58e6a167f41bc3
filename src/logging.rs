//! # Structured Logging Module
//!
//! Environment-aware structured logging to the console and a JSON log file.
//! Engine events forwarded by the host end up here as `tracing` records.

use crate::config::loader::detect_environment;
use crate::config::EngineConfig;
use chrono::Utc;
use std::fs;
use std::path::PathBuf;
use std::process;
use std::sync::OnceLock;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize structured logging with environment-specific configuration
pub fn init_structured_logging() {
    init_logging(false);
}

/// Like [`init_structured_logging`], logging this crate at debug level when
/// `enable_debug_logs` is set
pub fn init_structured_logging_for(config: &EngineConfig) {
    init_logging(config.enable_debug_logs);
}

fn init_logging(debug_logs: bool) {
    LOGGER_INITIALIZED.get_or_init(|| {
        let environment = detect_environment();
        let log_level = get_log_level(&environment, debug_logs);

        let console_layer = fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_level(true)
            .with_ansi(true)
            .with_filter(env_filter(log_level, debug_logs));

        let log_dir = PathBuf::from("log");
        let pid = process::id();
        let timestamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
        let log_filename = format!("engine-host.{environment}.{pid}.{timestamp}.log");

        let file_layer = match fs::create_dir_all(&log_dir) {
            Ok(()) => {
                let file_appender = tracing_appender::rolling::never(&log_dir, &log_filename);
                let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
                // The writer flushes on drop; the subscriber lives for the whole process.
                std::mem::forget(guard);
                Some(
                    fmt::layer()
                        .with_writer(file_writer)
                        .with_target(true)
                        .with_thread_ids(true)
                        .with_level(true)
                        .with_ansi(false)
                        .json()
                        .with_filter(env_filter(log_level, debug_logs)),
                )
            }
            Err(e) => {
                eprintln!("engine host: cannot create log directory {}: {e}", log_dir.display());
                None
            }
        };

        let file_enabled = file_layer.is_some();
        if tracing_subscriber::registry()
            .with(console_layer)
            .with(file_layer)
            .try_init()
            .is_err()
        {
            tracing::debug!("Global tracing subscriber already initialized - continuing with existing subscriber");
        }

        tracing::info!(
            pid = pid,
            environment = %environment,
            log_file = %log_dir.join(&log_filename).display(),
            file_enabled = file_enabled,
            debug_logs = debug_logs,
            "🔧 STRUCTURED LOGGING: Initialized"
        );
    });
}

/// `RUST_LOG` wins over the environment default; debug logs of this crate are
/// kept even then
fn env_filter(default_level: &str, debug_logs: bool) -> EnvFilter {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    if !debug_logs {
        return filter;
    }
    match "query_engine_host=debug".parse() {
        Ok(directive) => filter.add_directive(directive),
        Err(_) => filter,
    }
}

/// Get log level based on environment
fn get_log_level(environment: &str, debug_logs: bool) -> &'static str {
    if debug_logs {
        return "debug";
    }
    match environment {
        "test" => "debug",
        "development" => "debug",
        "production" => "info",
        _ => "debug",
    }
}

/// Log a lifecycle transition of an engine
pub fn log_engine_transition(engine_id: &str, engine_type: &str, from: &str, to: &str, event: &str) {
    tracing::info!(
        engine_id = %engine_id,
        engine_type = %engine_type,
        from = %from,
        to = %to,
        event = %event,
        timestamp = %Utc::now().to_rfc3339(),
        "🔁 ENGINE_TRANSITION"
    );
}

/// Log an engine failure with context
pub fn log_engine_error(engine_id: &str, operation: &str, kind: &str, error: &str) {
    tracing::error!(
        engine_id = %engine_id,
        operation = %operation,
        kind = %kind,
        error = %error,
        timestamp = %Utc::now().to_rfc3339(),
        "❌ ENGINE_ERROR"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_detection() {
        std::env::set_var("ENGINE_HOST_ENV", "Test_Override");
        let env = detect_environment();
        assert_eq!(env, "test_override");
        std::env::remove_var("ENGINE_HOST_ENV");
    }

    #[test]
    fn test_log_level_mapping() {
        assert_eq!(get_log_level("test", false), "debug");
        assert_eq!(get_log_level("development", false), "debug");
        assert_eq!(get_log_level("production", false), "info");
        assert_eq!(get_log_level("unknown", false), "debug");
    }

    #[test]
    fn test_debug_logs_raise_the_level() {
        assert_eq!(get_log_level("production", true), "debug");

        let filter = env_filter("info", true).to_string();
        assert!(filter.contains("query_engine_host=debug"));
    }
}
