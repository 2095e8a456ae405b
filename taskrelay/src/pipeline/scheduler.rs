//! Periodic trigger for the orchestrator.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use super::{PipelineOrchestrator, TriggerResponse};
use crate::cancellation::CancellationToken;

/// Calls [`PipelineOrchestrator::run_once`] every `period` until `shutdown`
/// is cancelled.
///
/// The first tick fires immediately. Ticks that land while a run is in flight
/// are dropped, not queued.
pub fn spawn_interval_trigger(
    orchestrator: PipelineOrchestrator,
    period: Duration,
    shutdown: Arc<CancellationToken>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(period_ms = period.as_millis() as u64, "Interval trigger started");

        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    info!(reason = ?shutdown.reason(), "Interval trigger stopped");
                    break;
                }
                _ = ticker.tick() => {
                    match orchestrator.run_once() {
                        TriggerResponse::Accepted { run_id } => debug!(%run_id, "Scheduled run started"),
                        TriggerResponse::Busy => debug!("Scheduled tick skipped, run in flight"),
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NoOpEventSink;
    use crate::ledger::{InMemoryLedger, ProcessingLedger};
    use crate::pipeline::{FnStage, StaticTaskSource, Task};

    #[tokio::test(start_paused = true)]
    async fn test_trigger_processes_tasks_until_shutdown() {
        let source = Arc::new(StaticTaskSource::new(vec![
            Task::new("T1", "first"),
            Task::new("T2", "second"),
        ]));
        let ledger = Arc::new(InMemoryLedger::new());
        let orchestrator = PipelineOrchestrator::builder(source, ledger.clone())
            .stage(FnStage::new("noop", |_| async { Ok(serde_json::Value::Null) }))
            .event_sink(Arc::new(NoOpEventSink))
            .build()
            .unwrap();

        let shutdown = Arc::new(CancellationToken::new());
        let handle = spawn_interval_trigger(orchestrator, Duration::from_secs(60), shutdown.clone());

        // Ticks at 0s, 60s and 120s.
        tokio::time::sleep(Duration::from_secs(125)).await;
        shutdown.cancel("test finished");
        handle.await.unwrap();

        assert!(ledger.has_succeeded("T1").await.unwrap());
        assert!(ledger.has_succeeded("T2").await.unwrap());
    }
}
