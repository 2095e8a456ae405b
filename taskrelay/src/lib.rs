//! # Taskrelay
//!
//! Resilient execution for automation services that depend on flaky external
//! APIs.
//!
//! Taskrelay provides:
//!
//! - **Retry with backoff**: exponential delays with proportional jitter
//! - **Circuit breaking**: per-operation breakers that fail fast while a
//!   dependency is down
//! - **Batch execution**: sequential or chunked-parallel runs with per-item
//!   error isolation
//! - **Single-flight pipelines**: one task at a time through an ordered list
//!   of stages, with compensation on failure and an idempotent ledger
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use taskrelay::prelude::*;
//!
//! let orchestrator = PipelineOrchestrator::builder(source, ledger)
//!     .stage(download)
//!     .stage(transcode)
//!     .stage(publish.guarded())
//!     .build()?;
//!
//! match orchestrator.run_once() {
//!     TriggerResponse::Accepted { run_id } => println!("started {run_id}"),
//!     TriggerResponse::Busy => println!("already running"),
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod batch;
pub mod cancellation;
pub mod circuit;
pub mod config;
pub mod errors;
pub mod events;
pub mod ledger;
pub mod observability;
pub mod pipeline;
pub mod retry;
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::batch::{BatchExecutor, BatchItem, BatchOptions, BatchSummary};
    pub use crate::cancellation::CancellationToken;
    pub use crate::circuit::{CircuitBreakerConfig, CircuitBreakerRegistry};
    pub use crate::config::{LoggingConfig, TaskrelayConfig};
    pub use crate::errors::{ResilienceError, Result};
    pub use crate::events::{
        CollectingEventSink, EventLevel, EventSink, LoggingEventSink, NoOpEventSink,
        ResilienceEvent, SharedEventSink,
    };
    pub use crate::ledger::{InMemoryLedger, JsonFileLedger, LedgerRecord, ProcessingLedger};
    pub use crate::pipeline::{
        spawn_interval_trigger, FallbackStage, FnStage, OrchestratorStatus, PipelineOrchestrator,
        PipelinePhase, PipelineStage, RunOutcome, StageInput, StageResult, StaticTaskSource, Task,
        TaskSource, TriggerResponse,
    };
    pub use crate::retry::{with_retry, BackoffPolicy, RetryConfig, RetryExecutor};
}
