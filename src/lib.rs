#![allow(clippy::doc_markdown)] // Allow technical terms like DMMF, GraphQL in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Query Engine Host
//!
//! Supervisor and request protocol layer for an external, independently built
//! query engine.
//!
//! ## Overview
//!
//! The engine is reachable in one of three ways, all behind the same
//! [`Engine`] contract:
//!
//! - [`BinaryEngine`] spawns the engine binary as a child process and talks
//!   HTTP to it on an ephemeral local port (or to a remote endpoint).
//! - [`LibraryEngine`] loads the engine's native library into this process.
//! - [`WorkerEngine`] runs a library engine on its own OS thread and proxies
//!   calls to it by message passing.
//!
//! Every transport shares the lifecycle state machine, the request retry
//! policy and the error taxonomy, so application code sees identical behavior
//! whichever transport is configured.
//!
//! ## Module Organization
//!
//! - [`engine`] - The `Engine` contract, request protocol and transactions
//! - [`binary`] - Child process supervision and the HTTP connection pool
//! - [`library`] - Native library binding and its log bridge
//! - [`worker`] - Worker thread isolation proxy
//! - [`resilience`] - Request retry classification
//! - [`state_machine`] - Engine lifecycle states and transitions
//! - [`events`] - Engine log line classification and event fan-out
//! - [`registry`] - Process-wide engine registry and shutdown hooks
//! - [`error`] - Structured error handling
//! - [`config`] - Configuration management
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use query_engine_host::{BinaryEngine, Engine, EngineConfig, RequestOptions};
//!
//! # async fn example() -> Result<(), query_engine_host::EngineError> {
//! let config = EngineConfig::new("prisma/schema.prisma");
//! let engine = BinaryEngine::new(config)?;
//!
//! engine.start().await?;
//! let result = engine
//!     .request(r#"query { findManyUser { id } }"#, RequestOptions::read())
//!     .await?;
//! println!("{}", result.data);
//! engine.stop().await?;
//! # Ok(())
//! # }
//! ```

pub mod binary;
pub mod config;
pub mod constants;
pub mod engine;
pub mod error;
pub mod events;
pub mod library;
pub mod locate;
pub mod logging;
pub mod registry;
pub mod report;
pub mod resilience;
pub mod state_machine;
pub mod worker;

pub use binary::BinaryEngine;
pub use config::{ConfigManager, EngineConfig, EngineLogLevel};
pub use engine::{
    BatchRequest, Engine, EngineType, IsolationLevel, Metrics, MetricsFormat, MetricsOptions,
    QueryResult, RequestHeaders, RequestOptions, TransactionInfo, TransactionOptions,
    TransactionOutcome, TransactionRequest,
};
pub use error::{EngineError, EngineResult, NetworkErrorCode};
pub use events::{EngineEvent, EngineEventLevel, EventPublisher, SpanExporter};
pub use library::LibraryEngine;
pub use logging::{init_structured_logging, init_structured_logging_for};
pub use registry::EngineRegistry;
pub use state_machine::EngineState;
pub use worker::WorkerEngine;
