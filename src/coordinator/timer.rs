//! Fixed-interval trigger source.

use super::{Coordinator, CoordinatorError, RunOutcome};
use crate::run::TriggerKind;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

/// Fire a timer trigger immediately, then every `every`, until the
/// coordinator's shutdown token is cancelled.
///
/// A rejected tick is simply dropped; ticks missed while a long run was in
/// flight are skipped rather than replayed back to back.
pub async fn run_timer_loop(coordinator: Coordinator, every: Duration) -> Result<(), CoordinatorError> {
    info!(interval_sec = every.as_secs(), "timer trigger started");

    let shutdown = coordinator.shutdown_token();
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("timer trigger stopped");
                return Ok(());
            }
            _ = interval.tick() => {}
        }

        match coordinator.request_run(TriggerKind::Timer).await {
            Ok(RunOutcome::Rejected) => debug!("timer tick dropped: run in progress"),
            Ok(outcome) => debug!(outcome = outcome.label(), "timer tick handled"),
            Err(e) => {
                error!(error = %e, "timer trigger stopping");
                return Err(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::{ManualClock, WindowAllocator};
    use crate::evaluator::{EvaluatorAdapter, FnEvaluator};
    use crate::run::{RunStatus, Window};
    use crate::storage::{open_pool, RunLedger};
    use chrono::{TimeZone, Utc};
    use std::sync::Arc;

    fn coordinator(dir: &tempfile::TempDir) -> (Coordinator, Arc<ManualClock>) {
        let t0 = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let ledger = RunLedger::new(open_pool(dir.path().join("ledger.db")).unwrap());
        let clock = Arc::new(ManualClock::new(t0 + chrono::Duration::minutes(10)));
        let evaluator = FnEvaluator::new("noop", |_: Window| async { Ok(None) });
        let c = Coordinator::new(
            ledger.clone(),
            WindowAllocator::new(ledger, t0, chrono::Duration::minutes(5)),
            EvaluatorAdapter::new(Arc::new(evaluator), Duration::from_secs(5)),
            clock.clone(),
        );
        (c, clock)
    }

    #[tokio::test]
    async fn test_first_tick_runs_immediately_and_stops_on_shutdown() {
        let dir = tempfile::TempDir::new().unwrap();
        let (c, _clock) = coordinator(&dir);

        let task = tokio::spawn(run_timer_loop(c.clone(), Duration::from_secs(3600)));
        for _ in 0..200 {
            if !c.ledger().list(1).unwrap().is_empty() && !c.is_busy() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let runs = c.ledger().list(10).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Succeeded);
        assert_eq!(runs[0].trigger_kind, TriggerKind::Timer);

        c.shutdown_token().cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_ticks_without_progress_are_noops() {
        let dir = tempfile::TempDir::new().unwrap();
        let (c, _clock) = coordinator(&dir);

        // Clock never advances: only the first tick can produce a window.
        let task = tokio::spawn(run_timer_loop(c.clone(), Duration::from_millis(10)));
        tokio::time::sleep(Duration::from_millis(150)).await;
        c.shutdown_token().cancel();
        task.await.unwrap().unwrap();

        assert_eq!(c.ledger().list(10).unwrap().len(), 1);
    }
}
