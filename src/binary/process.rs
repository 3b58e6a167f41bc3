//! Spawning the engine binary and interpreting its exit.

use crate::config::EngineConfig;
use crate::constants::{env as env_names, flags, EXIT_CODE_NOT_EXECUTABLE};
use crate::events::RustError;
use std::collections::HashMap;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use tokio::process::{Child, Command};

/// Command line arguments for the engine binary
pub fn engine_args(config: &EngineConfig, port: u16) -> Vec<String> {
    let mut args: Vec<String> = flags::BASE.iter().map(|f| f.to_string()).collect();
    args.extend(config.flags.iter().cloned());
    if config.allow_trigger_panic {
        args.push(flags::DEBUG.to_string());
    }
    args.push(flags::PORT.to_string());
    args.push(port.to_string());
    args
}

/// Environment of the engine process. Later sources win: caller env, process
/// env, then the variables computed by the host.
pub fn engine_env(
    config: &EngineConfig,
    process_env: impl IntoIterator<Item = (String, String)>,
) -> HashMap<String, String> {
    let mut env = config.env.clone();
    env.extend(process_env);

    let rust_backtrace = env
        .get(env_names::RUST_BACKTRACE)
        .cloned()
        .unwrap_or_else(|| env_names::DEFAULT_RUST_BACKTRACE.to_string());
    let rust_log = env
        .get(env_names::RUST_LOG)
        .cloned()
        .unwrap_or_else(|| env_names::DEFAULT_RUST_LOG.to_string());
    let no_color = env.contains_key(env_names::NO_COLOR);

    env.insert(
        env_names::DML_PATH.to_string(),
        config.datamodel_path.display().to_string(),
    );
    if config.log_queries {
        env.insert(env_names::LOG_QUERIES.to_string(), "true".to_string());
    }
    if !config.datasources.is_empty() {
        if let Ok(datasources) = serde_json::to_string(&config.datasources) {
            env.insert(env_names::OVERWRITE_DATASOURCES.to_string(), datasources);
        }
    }
    if config.show_colors && !no_color {
        env.insert(env_names::CLICOLOR_FORCE.to_string(), "1".to_string());
    }
    env.insert(env_names::RUST_BACKTRACE.to_string(), rust_backtrace);
    env.insert(env_names::RUST_LOG.to_string(), rust_log);
    env
}

/// Spawn the engine with piped output. The child is killed if its handle is dropped.
pub fn spawn_engine(
    binary_path: &Path,
    config: &EngineConfig,
    port: u16,
) -> std::io::Result<Child> {
    Command::new(binary_path)
        .args(engine_args(config, port))
        .env_clear()
        .envs(engine_env(config, std::env::vars()))
        .current_dir(&config.cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
}

/// How the engine process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    Code(i32),
    Signal(i32),
    Unknown,
}

impl ExitKind {
    pub fn from_status(status: &ExitStatus) -> Self {
        if let Some(code) = status.code() {
            return Self::Code(code);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return Self::Signal(signal);
            }
        }
        Self::Unknown
    }
}

#[cfg(unix)]
const SIGABRT: i32 = 6;

pub fn signal_name(signal: i32) -> String {
    match signal {
        1 => "SIGHUP".to_string(),
        2 => "SIGINT".to_string(),
        6 => "SIGABRT".to_string(),
        9 => "SIGKILL".to_string(),
        11 => "SIGSEGV".to_string(),
        15 => "SIGTERM".to_string(),
        other => format!("signal {other}"),
    }
}

/// Error captured purely from the exit status
pub fn exit_error(exit: ExitKind) -> Option<RustError> {
    match exit {
        ExitKind::Code(EXIT_CODE_NOT_EXECUTABLE) => Some(RustError::error(
            "Couldn't start query engine as it's not executable on this operating system. \
             You very likely have the wrong \"binaryTargets\" defined in the schema.prisma file.",
        )),
        #[cfg(unix)]
        ExitKind::Signal(SIGABRT) => Some(RustError::panic("Panic in Query Engine with SIGABRT signal")),
        _ => None,
    }
}

/// Message reported when the engine exits before or after its handshake
pub fn exit_message(
    exit: ExitKind,
    binary_path: &Path,
    captured: Option<&RustError>,
    diagnostics: &[String],
) -> String {
    let details = match captured {
        Some(error) => error.full_message(),
        None => diagnostics.join("\n"),
    };

    match exit {
        ExitKind::Code(code) => format!("Query engine exited with code {code}\n{details}"),
        ExitKind::Signal(signal) => format!(
            "Query engine process killed with signal {} for unknown reason. \
             Make sure that the engine binary at {} is not corrupt.\n{details}",
            signal_name(signal),
            binary_path.display()
        ),
        ExitKind::Unknown => format!("Query engine exited for an unknown reason\n{details}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatasourceOverride;
    use std::path::PathBuf;

    #[test]
    fn test_args_order() {
        let config = EngineConfig {
            flags: vec!["--enable-experimental".to_string()],
            allow_trigger_panic: true,
            ..EngineConfig::default()
        };
        assert_eq!(
            engine_args(&config, 4466),
            vec![
                "--enable-raw-queries",
                "--enable-metrics",
                "--enable-open-telemetry",
                "--enable-experimental",
                "--debug",
                "--port",
                "4466",
            ]
        );
    }

    #[test]
    fn test_env_precedence_and_defaults() {
        let mut config = EngineConfig {
            datamodel_path: PathBuf::from("/app/schema.prisma"),
            log_queries: true,
            show_colors: true,
            datasources: vec![DatasourceOverride {
                name: "db".to_string(),
                url: "file:./dev.db".to_string(),
            }],
            ..EngineConfig::default()
        };
        config.env.insert("SHARED".to_string(), "from-config".to_string());
        config.env.insert("CONFIG_ONLY".to_string(), "yes".to_string());

        let process_env = vec![
            ("SHARED".to_string(), "from-process".to_string()),
            ("RUST_LOG".to_string(), "warn".to_string()),
        ];
        let env = engine_env(&config, process_env);

        assert_eq!(env["SHARED"], "from-process");
        assert_eq!(env["CONFIG_ONLY"], "yes");
        assert_eq!(env["PRISMA_DML_PATH"], "/app/schema.prisma");
        assert_eq!(env["LOG_QUERIES"], "true");
        assert_eq!(env["CLICOLOR_FORCE"], "1");
        assert_eq!(env["RUST_BACKTRACE"], "1");
        assert_eq!(env["RUST_LOG"], "warn");
        assert_eq!(
            env["OVERWRITE_DATASOURCES"],
            r#"[{"name":"db","url":"file:./dev.db"}]"#
        );
    }

    #[test]
    fn test_no_color_disables_forced_colors() {
        let config = EngineConfig {
            show_colors: true,
            ..EngineConfig::default()
        };
        let env = engine_env(&config, vec![("NO_COLOR".to_string(), "1".to_string())]);
        assert!(!env.contains_key("CLICOLOR_FORCE"));
        assert!(!env.contains_key("LOG_QUERIES"));
        assert_eq!(env["RUST_LOG"], "info");
    }

    #[test]
    fn test_exit_messages() {
        let path = Path::new("/engines/query-engine");
        let message = exit_message(ExitKind::Code(1), path, None, &["oh no".to_string()]);
        assert_eq!(message, "Query engine exited with code 1\noh no");

        let captured = RustError::error("schema invalid");
        let message = exit_message(ExitKind::Code(1), path, Some(&captured), &[]);
        assert!(message.ends_with("schema invalid"));

        let message = exit_message(ExitKind::Signal(9), path, None, &[]);
        assert!(message.contains("SIGKILL"));
        assert!(message.contains("/engines/query-engine"));
    }

    #[test]
    fn test_exit_errors() {
        let not_executable = exit_error(ExitKind::Code(126)).unwrap();
        assert!(!not_executable.is_panic);
        assert!(not_executable.message.contains("not executable"));
        assert!(exit_error(ExitKind::Code(1)).is_none());

        #[cfg(unix)]
        assert!(exit_error(ExitKind::Signal(6)).unwrap().is_panic);
    }
}
