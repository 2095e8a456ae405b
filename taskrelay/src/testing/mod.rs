//! Testing utilities for taskrelay pipelines.
//!
//! This module provides:
//! - Scripted and recording stages
//! - Flaky operations for retry and breaker tests
//! - A pipeline harness over in-memory collaborators
//! - Assertions for run outcomes

mod assertions;
mod fixtures;
mod mocks;

pub use assertions::{assert_failed_at, assert_recorded, assert_stopped, assert_succeeded};
pub use fixtures::{immediate_retry, tasks, FlakyOperation, TestPipeline, TestPipelineBuilder};
pub use mocks::{CallLog, RecordedInput, RecordingStage, ScriptedStage};
