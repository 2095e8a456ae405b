//! Assertions for run outcomes and ledger state.

use crate::ledger::ProcessingLedger;
use crate::pipeline::RunOutcome;

/// Asserts that the run succeeded for `task_id`.
pub fn assert_succeeded(outcome: &RunOutcome, task_id: &str) {
    match outcome {
        RunOutcome::Succeeded { task_id: actual, .. } => assert_eq!(
            actual, task_id,
            "Expected success for '{task_id}', got success for '{actual}'"
        ),
        other => panic!("Expected success for '{task_id}', got {other:?}"),
    }
}

/// Asserts that the run failed at stage `index`.
pub fn assert_failed_at(outcome: &RunOutcome, index: usize) {
    match outcome {
        RunOutcome::Failed { stage_index, stage, .. } => assert_eq!(
            *stage_index, index,
            "Expected failure at stage {index}, got failure at {stage_index} ('{stage}')"
        ),
        other => panic!("Expected failure at stage {index}, got {other:?}"),
    }
}

/// Asserts that the run was stopped.
pub fn assert_stopped(outcome: &RunOutcome) {
    assert!(
        matches!(outcome, RunOutcome::Stopped { .. }),
        "Expected a stopped run, got {outcome:?}"
    );
}

/// Asserts the ledger holds a record for `task_id` with the given success flag.
pub async fn assert_recorded(ledger: &dyn ProcessingLedger, task_id: &str, success: bool) {
    let record = ledger
        .get(task_id)
        .await
        .unwrap_or_else(|e| panic!("Ledger read failed: {e}"));
    match record {
        Some(record) => assert_eq!(
            record.success, success,
            "Expected '{task_id}' recorded with success={success}, got {record:?}"
        ),
        None => panic!("Expected a ledger record for '{task_id}', found none"),
    }
}
