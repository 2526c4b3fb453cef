use super::clock::Clock;
use super::lock::RunLock;
use super::window::{Allocation, WindowAllocator};
use super::{CoordinatorError, NoOpReason, RunOutcome};
use crate::evaluator::EvaluatorAdapter;
use crate::run::{Run, RunStatus, TriggerKind};
use crate::storage::{LedgerError, RunLedger, StatusCounts};
use chrono::{DateTime, SubsecRound, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Point-in-time view of the coordinator for operators.
#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorStatus {
    pub now: DateTime<Utc>,
    pub busy: bool,
    pub halted: bool,
    pub global_start: DateTime<Utc>,
    pub frontier: DateTime<Utc>,
    pub min_window_sec: i64,
    pub next: Allocation,
    pub runs: StatusCounts,
    pub evaluator: String,
}

/// Serializes evaluation runs and keeps the run ledger consistent.
///
/// Every trigger source calls [`Coordinator::request_run`]. At most one run
/// is in flight; overlapping triggers are rejected, never queued. All ledger
/// writes happen while the run lock is held.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

struct Inner {
    ledger: RunLedger,
    allocator: WindowAllocator,
    lock: RunLock,
    evaluator: EvaluatorAdapter,
    clock: Arc<dyn Clock>,
    halted: AtomicBool,
    shutdown: CancellationToken,
}

impl Coordinator {
    pub fn new(
        ledger: RunLedger,
        allocator: WindowAllocator,
        evaluator: EvaluatorAdapter,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                ledger,
                allocator,
                lock: RunLock::new(),
                evaluator,
                clock,
                halted: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn ledger(&self) -> &RunLedger {
        &self.inner.ledger
    }

    pub fn allocator(&self) -> &WindowAllocator {
        &self.inner.allocator
    }

    /// Cancelled when the coordinator halts; trigger sources stop on it.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    pub fn is_halted(&self) -> bool {
        self.inner.halted.load(Ordering::Acquire)
    }

    pub fn is_busy(&self) -> bool {
        self.inner.lock.is_held()
    }

    /// Startup recovery: runs a previous process left `pending`/`running`
    /// become `failed(abandoned)` so their windows are replayed.
    ///
    /// Must be called before any trigger source starts.
    pub fn recover(&self) -> Result<Vec<Run>, CoordinatorError> {
        self.ensure_running()?;
        let guard = self.inner.lock.try_acquire().ok_or(CoordinatorError::Busy)?;

        let recovered = self
            .inner
            .ledger
            .recover_abandoned(self.now())
            .map_err(|e| self.halt(e))?;
        if recovered.is_empty() {
            debug!("no abandoned runs found");
        } else {
            warn!(count = recovered.len(), "recovered abandoned runs; their windows will be retried");
        }

        guard.release();
        Ok(recovered)
    }

    /// Handle one trigger.
    pub async fn request_run(&self, kind: TriggerKind) -> Result<RunOutcome, CoordinatorError> {
        let span = info_span!("trigger", request_id = %Uuid::new_v4(), trigger = %kind);
        self.request_run_inner(kind).instrument(span).await
    }

    async fn request_run_inner(&self, kind: TriggerKind) -> Result<RunOutcome, CoordinatorError> {
        self.ensure_running()?;

        let Some(guard) = self.inner.lock.try_acquire() else {
            debug!("trigger rejected: a run is already in progress");
            return Ok(RunOutcome::Rejected);
        };

        let now = self.now();
        let allocation = self.inner.allocator.allocate(now).map_err(|e| self.halt(e))?;
        let window = match allocation {
            Allocation::Fresh { window } => window,
            Allocation::Retry { window, failed_run_id } => {
                info!(%window, failed_run_id, "retrying failed window");
                window
            }
            Allocation::TooSoon { frontier } => {
                info!(%frontier, %now, "nothing to do: window below minimum size");
                return Ok(RunOutcome::NoOp(NoOpReason::TooSoon { frontier }));
            }
            Allocation::ClockRegression { frontier, now } => {
                warn!(%frontier, %now, "nothing to do: clock regression");
                return Ok(RunOutcome::NoOp(NoOpReason::ClockRegression { frontier, now }));
            }
        };

        let ledger = &self.inner.ledger;
        let mut run = ledger
            .create_pending(window, kind, now)
            .map_err(|e| self.halt(e))?;
        let started_at = self.now();
        ledger
            .mark_running(run.id, started_at)
            .map_err(|e| self.halt(e))?;
        run.status = RunStatus::Running;
        run.started_at = Some(started_at);

        info!(run_id = run.id, %window, evaluator = self.inner.evaluator.name(), "evaluation started");
        let result = self.inner.evaluator.evaluate(window).await;
        let finished_at = self.now();
        run.finished_at = Some(finished_at);

        match result {
            Ok(evaluation) => {
                ledger
                    .mark_succeeded(run.id, finished_at, evaluation.summary.as_deref())
                    .map_err(|e| self.halt(e))?;
                info!(
                    run_id = run.id,
                    %window,
                    elapsed_ms = evaluation.elapsed.as_millis() as u64,
                    "evaluation succeeded"
                );
                run.status = RunStatus::Succeeded;
                run.summary = evaluation.summary;
            }
            Err(e) => {
                let reason = e.to_string();
                ledger
                    .mark_failed(run.id, finished_at, &reason)
                    .map_err(|e| self.halt(e))?;
                warn!(run_id = run.id, %window, %reason, "evaluation failed; window will be retried");
                run.status = RunStatus::Failed;
                run.failure_reason = Some(reason);
            }
        }

        guard.release();
        Ok(RunOutcome::Completed(run))
    }

    /// Snapshot for status endpoints; reads only.
    pub fn status(&self) -> Result<CoordinatorStatus, LedgerError> {
        let now = self.now();
        let allocator = &self.inner.allocator;
        Ok(CoordinatorStatus {
            now,
            busy: self.is_busy(),
            halted: self.is_halted(),
            global_start: allocator.global_start(),
            frontier: allocator.frontier()?,
            min_window_sec: allocator.min_window().num_seconds(),
            next: allocator.allocate(now)?,
            runs: self.inner.ledger.count_by_status()?,
            evaluator: self.inner.evaluator.name().to_string(),
        })
    }

    /// Clock reading at the ledger's microsecond precision, so in-memory
    /// runs and windows match their stored rows exactly.
    fn now(&self) -> DateTime<Utc> {
        self.inner.clock.now().trunc_subsecs(6)
    }

    fn ensure_running(&self) -> Result<(), CoordinatorError> {
        if self.is_halted() {
            Err(CoordinatorError::Halted)
        } else {
            Ok(())
        }
    }

    /// A ledger write failed: the timeline can no longer be vouched for.
    fn halt(&self, e: LedgerError) -> CoordinatorError {
        error!(error = %e, "run ledger failure; halting coordinator");
        self.inner.halted.store(true, Ordering::Release);
        self.inner.shutdown.cancel();
        CoordinatorError::Ledger(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::clock::ManualClock;
    use crate::evaluator::{EvaluationError, EvaluatorAdapter, FnEvaluator};
    use crate::run::{Window, ABANDONED_REASON};
    use crate::storage::open_pool;
    use chrono::{Duration, TimeZone};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration as StdDuration;
    use tokio::sync::Notify;

    fn t(min: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap() + Duration::minutes(min)
    }

    fn w(a: i64, b: i64) -> Window {
        Window::new(t(a), t(b)).unwrap()
    }

    struct Harness {
        _dir: tempfile::TempDir,
        clock: Arc<ManualClock>,
        coordinator: Coordinator,
        calls: Arc<AtomicUsize>,
    }

    /// `fail_first` evaluations fail, the rest succeed.
    fn harness(fail_first: usize) -> Harness {
        let dir = tempfile::TempDir::new().unwrap();
        let ledger = RunLedger::new(open_pool(dir.path().join("ledger.db")).unwrap());
        let clock = Arc::new(ManualClock::new(t(0)));
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let evaluator = FnEvaluator::new("test", move |window: Window| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < fail_first {
                    Err(EvaluationError::failed("evaluator down"))
                } else {
                    Ok(Some(format!("evaluated {window}")))
                }
            }
        });
        let coordinator = Coordinator::new(
            ledger.clone(),
            WindowAllocator::new(ledger, t(0), Duration::minutes(5)),
            EvaluatorAdapter::new(Arc::new(evaluator), StdDuration::from_secs(5)),
            clock.clone(),
        );
        Harness {
            _dir: dir,
            clock,
            coordinator,
            calls,
        }
    }

    fn coordinator_with<F, Fut>(
        clock: Arc<ManualClock>,
        min_window: Duration,
        timeout: StdDuration,
        f: F,
    ) -> (tempfile::TempDir, Coordinator)
    where
        F: Fn(Window) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Option<String>, EvaluationError>> + Send + 'static,
    {
        let dir = tempfile::TempDir::new().unwrap();
        let ledger = RunLedger::new(open_pool(dir.path().join("ledger.db")).unwrap());
        let coordinator = Coordinator::new(
            ledger.clone(),
            WindowAllocator::new(ledger, t(0), min_window),
            EvaluatorAdapter::new(Arc::new(FnEvaluator::new("scripted", f)), timeout),
            clock,
        );
        (dir, coordinator)
    }

    fn completed(outcome: RunOutcome) -> Run {
        match outcome {
            RunOutcome::Completed(run) => run,
            other => panic!("expected a completed run, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_successful_run_advances_frontier() {
        let h = harness(0);
        h.clock.set(t(5));

        let run = completed(h.coordinator.request_run(TriggerKind::Timer).await.unwrap());
        assert_eq!(run.status, RunStatus::Succeeded);
        assert_eq!(run.window, w(0, 5));
        assert_eq!(run.trigger_kind, TriggerKind::Timer);
        assert!(run.summary.unwrap().starts_with("evaluated"));

        assert_eq!(h.coordinator.ledger().get(run.id).unwrap().unwrap().status, RunStatus::Succeeded);
        assert_eq!(h.coordinator.allocator().frontier().unwrap(), t(5));
        assert!(!h.coordinator.is_busy());
    }

    #[tokio::test]
    async fn test_too_soon_creates_no_run() {
        let h = harness(0);
        h.clock.set(t(3));

        let outcome = h.coordinator.request_run(TriggerKind::Request).await.unwrap();
        assert_eq!(outcome, RunOutcome::NoOp(NoOpReason::TooSoon { frontier: t(0) }));
        assert!(h.coordinator.ledger().list(10).unwrap().is_empty());
        assert_eq!(h.calls.load(Ordering::SeqCst), 0);
        assert!(!h.coordinator.is_busy(), "lock released on no-op");
    }

    #[tokio::test]
    async fn test_clock_regression_is_a_noop() {
        let h = harness(0);
        h.clock.set(t(10));
        completed(h.coordinator.request_run(TriggerKind::Timer).await.unwrap());

        h.clock.set(t(2));
        let outcome = h.coordinator.request_run(TriggerKind::Timer).await.unwrap();
        assert!(matches!(outcome, RunOutcome::NoOp(NoOpReason::ClockRegression { .. })));
        assert_eq!(h.coordinator.ledger().list(10).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_run_is_recorded_and_retried() {
        let h = harness(1);
        h.clock.set(t(5));
        let failed = completed(h.coordinator.request_run(TriggerKind::Timer).await.unwrap());
        assert_eq!(failed.status, RunStatus::Failed);
        assert_eq!(failed.failure_reason.as_deref(), Some("evaluator down"));

        h.clock.set(t(10));
        let retry = completed(h.coordinator.request_run(TriggerKind::Request).await.unwrap());
        assert_eq!(retry.window, w(0, 5));
        assert_eq!(retry.status, RunStatus::Succeeded);

        let next = completed(h.coordinator.request_run(TriggerKind::Timer).await.unwrap());
        assert_eq!(next.window, w(5, 10));
    }

    #[tokio::test]
    async fn test_overlapping_trigger_is_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let ledger = RunLedger::new(open_pool(dir.path().join("ledger.db")).unwrap());
        let release = Arc::new(Notify::new());
        let gate = release.clone();
        let evaluator = FnEvaluator::new("gated", move |_| {
            let gate = gate.clone();
            async move {
                gate.notified().await;
                Ok(None)
            }
        });
        let clock = Arc::new(ManualClock::new(t(30)));
        let coordinator = Coordinator::new(
            ledger.clone(),
            WindowAllocator::new(ledger, t(0), Duration::minutes(5)),
            EvaluatorAdapter::new(Arc::new(evaluator), StdDuration::from_secs(5)),
            clock,
        );

        let first = tokio::spawn({
            let c = coordinator.clone();
            async move { c.request_run(TriggerKind::Timer).await }
        });
        while !coordinator.is_busy() {
            tokio::task::yield_now().await;
        }

        assert_eq!(
            coordinator.request_run(TriggerKind::Request).await.unwrap(),
            RunOutcome::Rejected
        );
        let status = coordinator.status().unwrap();
        assert!(status.busy);
        assert_eq!(status.runs.running, 1);

        release.notify_one();
        let run = completed(first.await.unwrap().unwrap());
        assert_eq!(run.status, RunStatus::Succeeded);
        assert_eq!(coordinator.ledger().list(10).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_recover_marks_abandoned_and_retries_window() {
        let h = harness(0);
        let ledger = h.coordinator.ledger();
        let crashed = ledger.create_pending(w(0, 7), TriggerKind::Timer, t(7)).unwrap();
        ledger.mark_running(crashed.id, t(7)).unwrap();

        h.clock.set(t(20));
        let recovered = h.coordinator.recover().unwrap();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].failure_reason.as_deref(), Some(ABANDONED_REASON));

        let retry = completed(h.coordinator.request_run(TriggerKind::Timer).await.unwrap());
        assert_eq!(retry.window, w(0, 7));
    }

    #[tokio::test]
    async fn test_ledger_failure_halts() {
        let h = harness(0);
        h.clock.set(t(5));
        {
            let conn = h.coordinator.ledger().pool().get().unwrap();
            conn.execute_batch("DROP TABLE runs").unwrap();
        }
        let token = h.coordinator.shutdown_token();

        let err = h.coordinator.request_run(TriggerKind::Timer).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::Ledger(_)));
        assert!(h.coordinator.is_halted());
        assert!(token.is_cancelled());

        let err = h.coordinator.request_run(TriggerKind::Request).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::Halted));
        assert!(matches!(h.coordinator.recover().unwrap_err(), CoordinatorError::Halted));
    }

    #[tokio::test]
    async fn test_status_previews_without_recording() {
        let h = harness(0);
        h.clock.set(t(9));
        let status = h.coordinator.status().unwrap();
        assert_eq!(status.frontier, t(0));
        assert_eq!(status.next.window(), Some(w(0, 9)));
        assert_eq!(status.evaluator, "test");
        assert!(!status.busy && !status.halted);
        assert!(h.coordinator.ledger().list(10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_timeout_and_panic_are_recorded_and_replayed() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let clock = Arc::new(ManualClock::new(t(5)));
        let (_dir, c) = coordinator_with(
            clock.clone(),
            Duration::minutes(5),
            StdDuration::from_millis(100),
            move |_| {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    match n {
                        0 => {
                            tokio::time::sleep(StdDuration::from_secs(30)).await;
                            Ok(None)
                        }
                        1 => panic!("evaluator bug"),
                        _ => Ok(Some("done".to_string())),
                    }
                }
            },
        );

        let timed_out = completed(c.request_run(TriggerKind::Timer).await.unwrap());
        assert_eq!(timed_out.status, RunStatus::Failed);
        assert_eq!(timed_out.failure_reason.as_deref(), Some("timeout after 0.100s"));
        assert_eq!(timed_out.window, w(0, 5));
        assert_eq!(c.ledger().get(timed_out.id).unwrap().unwrap(), timed_out);
        assert!(!c.is_busy());

        clock.set(t(12));
        let panicked = completed(c.request_run(TriggerKind::Request).await.unwrap());
        assert_eq!(panicked.status, RunStatus::Failed);
        assert_eq!(panicked.failure_reason.as_deref(), Some("evaluator panicked"));
        assert_eq!(panicked.window, w(0, 5));
        assert_eq!(c.ledger().get(panicked.id).unwrap().unwrap(), panicked);
        assert!(!c.is_busy());
        assert!(!c.is_halted());

        let replayed = completed(c.request_run(TriggerKind::Timer).await.unwrap());
        assert_eq!(replayed.status, RunStatus::Succeeded);
        assert_eq!(replayed.window, w(0, 5));

        let next = completed(c.request_run(TriggerKind::Timer).await.unwrap());
        assert_eq!(next.window, w(5, 12));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_sub_microsecond_clock_matches_ledger() {
        let clock = Arc::new(ManualClock::new(t(5) + Duration::nanoseconds(1_234_567)));
        let (_dir, c) = coordinator_with(clock.clone(), Duration::zero(), StdDuration::from_secs(5), |_| async {
            Ok(None)
        });

        let run = completed(c.request_run(TriggerKind::Timer).await.unwrap());
        assert_eq!(run.window.end, t(5) + Duration::microseconds(1_234));
        assert_eq!(c.ledger().get(run.id).unwrap().unwrap(), run);

        // Still inside the same microsecond: nothing to cover, and no halt.
        clock.advance(Duration::nanoseconds(300));
        let outcome = c.request_run(TriggerKind::Timer).await.unwrap();
        assert_eq!(
            outcome,
            RunOutcome::NoOp(NoOpReason::TooSoon {
                frontier: t(5) + Duration::microseconds(1_234)
            })
        );
        assert!(!c.is_halted());
    }
}
