//! # Resilience Module
//!
//! Request-level retry classification shared by every engine transport.
//!
//! ```rust,no_run
//! use query_engine_host::resilience::{run_with_retries, AsyncErrorSource, RetryPolicy};
//! use query_engine_host::EngineError;
//!
//! struct NoCapturedErrors;
//!
//! impl AsyncErrorSource for NoCapturedErrors {
//!     fn take_async_error(&self) -> Option<EngineError> {
//!         None
//!     }
//!     fn restart_budget_exceeded(&self) -> bool {
//!         false
//!     }
//! }
//!
//! # async fn example() -> Result<(), EngineError> {
//! let policy = RetryPolicy::default();
//! let value = run_with_retries(&policy, false, &NoCapturedErrors, |num_try| async move {
//!     Ok::<u32, EngineError>(num_try)
//! })
//! .await?;
//! # Ok(())
//! # }
//! ```

pub mod retry;

pub use retry::{classify_request_error, run_with_retries, AsyncErrorSource, RetryDecision, RetryPolicy};
