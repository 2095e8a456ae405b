//! Multi-stage job pipeline.
//!
//! This module provides:
//! - Tasks and the sources that list them
//! - Stages, closure-backed stages and fallback chains
//! - The single-flight orchestrator and its status types
//! - An interval trigger

mod orchestrator;
mod scheduler;
mod stage;
mod state;
mod task;

pub use orchestrator::{PipelineOrchestrator, PipelineOrchestratorBuilder, STOPPED_MESSAGE};
pub use scheduler::spawn_interval_trigger;
pub use stage::{FallbackStage, FnStage, PipelineStage, SharedStage, StageInput, StageResult};
pub use state::{OrchestratorStatus, PipelinePhase, RunOutcome, TriggerResponse};
pub use task::{StaticTaskSource, Task, TaskSource};
