//! # Engine Host Constants
//!
//! Limits, environment variable names and wire-level strings shared by the
//! process, library and worker transports.

use std::time::Duration;

/// Restart and retry limits
pub mod limits {
    use super::Duration;

    /// Engine starts allowed before the supervisor reports the engine as stuck
    pub const MAX_STARTS: u32 = 2;
    /// Attempts allowed for a single read request
    pub const MAX_REQUEST_RETRIES: u32 = 2;
    /// Limit used for both of the above when no-retry mode is on
    pub const NO_RETRY_LIMIT: u32 = 1;

    /// Number of live engines before a diagnostic warning is logged
    pub const TOO_MANY_ENGINES: usize = 10;

    /// Polls of the captured-error slot after the restart budget runs out
    pub const STUCK_POLL_ATTEMPTS: u32 = 5;
    pub const STUCK_POLL_INTERVAL: Duration = Duration::from_millis(50);

    /// `GET /status` attempts against a remote engine endpoint
    pub const STATUS_PROBE_ATTEMPTS: u32 = 10;
    pub const STATUS_PROBE_BASE_DELAY: Duration = Duration::from_millis(50);
    pub const STATUS_PROBE_MAX_DELAY: Duration = Duration::from_secs(2);

    /// Capacity of the queue between the native log callback and its consumer
    pub const LOG_QUEUE_CAPACITY: usize = 1024;
    /// Capacity of each engine's event broadcast channel
    pub const EVENT_CHANNEL_CAPACITY: usize = 1000;
    /// Maximum non-JSON stderr lines kept for exit diagnostics
    pub const STDERR_BUFFER_LINES: usize = 200;
}

/// Environment variables read or written by the host
pub mod env {
    /// Any value switches the host into no-retry mode
    pub const NO_RETRY: &str = "PRISMA_CLIENT_NO_RETRY";
    pub const BINARY_PATH: &str = "PRISMA_QUERY_ENGINE_BINARY";
    pub const LIBRARY_PATH: &str = "PRISMA_QUERY_ENGINE_LIBRARY";

    pub const DML_PATH: &str = "PRISMA_DML_PATH";
    pub const LOG_QUERIES: &str = "LOG_QUERIES";
    pub const OVERWRITE_DATASOURCES: &str = "OVERWRITE_DATASOURCES";
    pub const CLICOLOR_FORCE: &str = "CLICOLOR_FORCE";
    pub const NO_COLOR: &str = "NO_COLOR";
    pub const RUST_BACKTRACE: &str = "RUST_BACKTRACE";
    pub const RUST_LOG: &str = "RUST_LOG";

    pub const DEFAULT_RUST_BACKTRACE: &str = "1";
    pub const DEFAULT_RUST_LOG: &str = "info";
}

/// Command line flags passed to the engine binary
pub mod flags {
    pub const BASE: [&str; 3] = [
        "--enable-raw-queries",
        "--enable-metrics",
        "--enable-open-telemetry",
    ];
    pub const DEBUG: &str = "--debug";
    pub const PORT: &str = "--port";
    pub const VERSION: &str = "--version";
}

/// Strings the engine emits on its log stream
pub mod markers {
    pub const READY_LEVEL: &str = "INFO";
    pub const READY_TARGET: &str = "query_engine::server";
    pub const READY_MESSAGE_PREFIX: &str = "Started query engine http server";
    pub const PANIC_MESSAGE: &str = "PANIC";
    pub const FATAL_ERROR: &str = "fatal error";

    /// stderr noise that never belongs in exit diagnostics
    pub const NOISE: [&str; 2] = ["Printing to stderr", "Listening on "];
}

/// HTTP paths and headers of the engine endpoint
pub mod http {
    pub const QUERY_PATH: &str = "/";
    pub const STATUS_PATH: &str = "/status";
    pub const METRICS_PATH: &str = "/metrics";
    pub const TRANSACTION_START_PATH: &str = "/transaction/start";

    pub const TRANSACTION_ID_HEADER: &str = "X-transaction-id";
    pub const TRACEPARENT_HEADER: &str = "traceparent";
    pub const ELAPSED_HEADER: &str = "x-elapsed";

    pub const LOCALHOST: &str = "127.0.0.1";
}

/// Exit code the shell reports when a binary cannot be executed
pub const EXIT_CODE_NOT_EXECUTABLE: i32 = 126;

/// Native error code carried by panics raised inside the engine library
pub const NATIVE_GENERIC_FAILURE: &str = "GenericFailure";
pub const NATIVE_PANIC_PREFIX: &str = "PANIC:";

/// Base URL used for bug report links attached to engine panics
pub const ISSUE_TRACKER_URL: &str = "https://github.com/prisma/prisma/issues/new";

/// Transaction defaults in milliseconds
pub const DEFAULT_TRANSACTION_MAX_WAIT_MS: u64 = 2000;
pub const DEFAULT_TRANSACTION_TIMEOUT_MS: u64 = 5000;
