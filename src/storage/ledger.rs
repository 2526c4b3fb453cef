//! Run ledger -- the durable, append/update-only history of evaluation runs.
//!
//! The ledger is the sole source of truth for which part of the timeline has
//! been covered. Writers are serialized by the coordinator's run lock; readers
//! may query at any time since terminal rows are never modified again.

use super::Pool;
use crate::run::{format_ts, Run, RunStatus, TriggerKind, Window, ABANDONED_REASON};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("run {id} is not {expected}; transition to {target} not applied")]
    Transition {
        id: i64,
        expected: RunStatus,
        target: RunStatus,
    },

    #[error("corrupt ledger row {id}: {detail}")]
    Corrupt { id: i64, detail: String },
}

/// Number of runs in each status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pending: i64,
    pub running: i64,
    pub succeeded: i64,
    pub failed: i64,
}

const RUN_COLUMNS: &str = "id, window_start, window_end, status, trigger_kind, created_at, \
                           started_at, finished_at, failure_reason, summary";

/// Raw column values, converted into a [`Run`] outside the rusqlite row callback.
struct RunRow {
    id: i64,
    window_start: String,
    window_end: String,
    status: String,
    trigger_kind: String,
    created_at: String,
    started_at: Option<String>,
    finished_at: Option<String>,
    failure_reason: Option<String>,
    summary: Option<String>,
}

impl RunRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            window_start: row.get(1)?,
            window_end: row.get(2)?,
            status: row.get(3)?,
            trigger_kind: row.get(4)?,
            created_at: row.get(5)?,
            started_at: row.get(6)?,
            finished_at: row.get(7)?,
            failure_reason: row.get(8)?,
            summary: row.get(9)?,
        })
    }

    fn into_run(self) -> Result<Run, LedgerError> {
        let id = self.id;
        let corrupt = |detail: String| LedgerError::Corrupt { id, detail };
        let ts = |s: &str| parse_ts(s).map_err(|e| corrupt(format!("bad timestamp '{s}': {e}")));
        let opt_ts = |s: Option<String>| s.as_deref().map(ts).transpose();

        let start = ts(&self.window_start)?;
        let end = ts(&self.window_end)?;
        let window = Window::new(start, end)
            .ok_or_else(|| corrupt(format!("empty window {} .. {}", self.window_start, self.window_end)))?;

        Ok(Run {
            id,
            window,
            status: self.status.parse().map_err(|e| corrupt(format!("{e}")))?,
            trigger_kind: self.trigger_kind.parse().map_err(|e| corrupt(format!("{e}")))?,
            created_at: ts(&self.created_at)?,
            started_at: opt_ts(self.started_at)?,
            finished_at: opt_ts(self.finished_at)?,
            failure_reason: self.failure_reason,
            summary: self.summary,
        })
    }
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(s).map(|dt| dt.with_timezone(&Utc))
}

/// Persistent record of every run attempt.
#[derive(Clone)]
pub struct RunLedger {
    pool: Pool,
}

impl RunLedger {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Insert a new run in `pending` for the given window.
    pub fn create_pending(
        &self,
        window: Window,
        trigger_kind: TriggerKind,
        now: DateTime<Utc>,
    ) -> Result<Run, LedgerError> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO runs (window_start, window_end, status, trigger_kind, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                format_ts(window.start),
                format_ts(window.end),
                RunStatus::Pending.as_str(),
                trigger_kind.as_str(),
                format_ts(now),
            ],
        )?;
        let id = conn.last_insert_rowid();
        debug!(run_id = id, %window, trigger = %trigger_kind, "run recorded as pending");

        Ok(Run {
            id,
            window,
            status: RunStatus::Pending,
            trigger_kind,
            created_at: now,
            started_at: None,
            finished_at: None,
            failure_reason: None,
            summary: None,
        })
    }

    /// `pending` -> `running`.
    pub fn mark_running(&self, id: i64, started_at: DateTime<Utc>) -> Result<(), LedgerError> {
        let conn = self.pool.get()?;
        let changed = conn.execute(
            "UPDATE runs SET status = ?1, started_at = ?2 WHERE id = ?3 AND status = ?4",
            params![
                RunStatus::Running.as_str(),
                format_ts(started_at),
                id,
                RunStatus::Pending.as_str()
            ],
        )?;
        expect_one(changed, id, RunStatus::Pending, RunStatus::Running)
    }

    /// `running` -> `succeeded`.
    pub fn mark_succeeded(
        &self,
        id: i64,
        finished_at: DateTime<Utc>,
        summary: Option<&str>,
    ) -> Result<(), LedgerError> {
        let conn = self.pool.get()?;
        let changed = conn.execute(
            "UPDATE runs SET status = ?1, finished_at = ?2, summary = ?3 WHERE id = ?4 AND status = ?5",
            params![
                RunStatus::Succeeded.as_str(),
                format_ts(finished_at),
                summary,
                id,
                RunStatus::Running.as_str()
            ],
        )?;
        expect_one(changed, id, RunStatus::Running, RunStatus::Succeeded)
    }

    /// `running` -> `failed`.
    pub fn mark_failed(
        &self,
        id: i64,
        finished_at: DateTime<Utc>,
        reason: &str,
    ) -> Result<(), LedgerError> {
        let conn = self.pool.get()?;
        let changed = conn.execute(
            "UPDATE runs SET status = ?1, finished_at = ?2, failure_reason = ?3
             WHERE id = ?4 AND status = ?5",
            params![
                RunStatus::Failed.as_str(),
                format_ts(finished_at),
                reason,
                id,
                RunStatus::Running.as_str()
            ],
        )?;
        expect_one(changed, id, RunStatus::Running, RunStatus::Failed)
    }

    /// End of the latest succeeded window, if any run has succeeded.
    pub fn latest_succeeded_end(&self) -> Result<Option<DateTime<Utc>>, LedgerError> {
        let conn = self.pool.get()?;
        let end: Option<String> = conn.query_row(
            "SELECT MAX(window_end) FROM runs WHERE status = ?1",
            [RunStatus::Succeeded.as_str()],
            |row| row.get(0),
        )?;
        end.map(|s| {
            parse_ts(&s).map_err(|e| LedgerError::Corrupt {
                id: -1,
                detail: format!("bad succeeded window_end '{s}': {e}"),
            })
        })
        .transpose()
    }

    /// Earliest failed run whose window starts at or after `from`.
    ///
    /// Ties on `window_start` resolve to the oldest attempt.
    pub fn earliest_failed_from(&self, from: DateTime<Utc>) -> Result<Option<Run>, LedgerError> {
        let conn = self.pool.get()?;
        let row = conn
            .query_row(
                &format!(
                    "SELECT {RUN_COLUMNS} FROM runs
                     WHERE status = ?1 AND window_start >= ?2
                     ORDER BY window_start ASC, id ASC
                     LIMIT 1"
                ),
                params![RunStatus::Failed.as_str(), format_ts(from)],
                RunRow::from_row,
            )
            .optional()?;
        row.map(RunRow::into_run).transpose()
    }

    /// Mark every run a previous process left `pending` or `running` as
    /// `failed` with reason `abandoned`, returning the updated runs.
    pub fn recover_abandoned(&self, now: DateTime<Utc>) -> Result<Vec<Run>, LedgerError> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;

        let rows: Vec<RunRow> = {
            let mut stmt = tx.prepare(&format!(
                "SELECT {RUN_COLUMNS} FROM runs WHERE status IN (?1, ?2) ORDER BY id"
            ))?;
            let rows = stmt
                .query_map(
                    params![RunStatus::Pending.as_str(), RunStatus::Running.as_str()],
                    RunRow::from_row,
                )?
                .collect::<Result<_, _>>()?;
            rows
        };

        let finished_at = format_ts(now);
        let mut recovered = Vec::with_capacity(rows.len());
        for raw in rows {
            let mut run = raw.into_run()?;
            tx.execute(
                "UPDATE runs SET status = ?1, finished_at = ?2, failure_reason = ?3 WHERE id = ?4",
                params![RunStatus::Failed.as_str(), finished_at, ABANDONED_REASON, run.id],
            )?;
            warn!(run_id = run.id, window = %run.window, previous = %run.status, "abandoned run marked failed");
            run.status = RunStatus::Failed;
            run.finished_at = Some(now);
            run.failure_reason = Some(ABANDONED_REASON.to_string());
            recovered.push(run);
        }

        tx.commit()?;
        Ok(recovered)
    }

    pub fn get(&self, id: i64) -> Result<Option<Run>, LedgerError> {
        let conn = self.pool.get()?;
        let row = conn
            .query_row(
                &format!("SELECT {RUN_COLUMNS} FROM runs WHERE id = ?1"),
                [id],
                RunRow::from_row,
            )
            .optional()?;
        row.map(RunRow::into_run).transpose()
    }

    /// Most recent runs first.
    pub fn list(&self, limit: usize) -> Result<Vec<Run>, LedgerError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {RUN_COLUMNS} FROM runs ORDER BY id DESC LIMIT ?1"
        ))?;
        let rows: Vec<RunRow> = stmt
            .query_map([limit as i64], RunRow::from_row)?
            .collect::<Result<_, _>>()?;
        rows.into_iter().map(RunRow::into_run).collect()
    }

    pub fn count_by_status(&self) -> Result<StatusCounts, LedgerError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM runs GROUP BY status")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;

        let mut counts = StatusCounts::default();
        for r in rows {
            let (status, n) = r?;
            match status.parse::<RunStatus>() {
                Ok(RunStatus::Pending) => counts.pending = n,
                Ok(RunStatus::Running) => counts.running = n,
                Ok(RunStatus::Succeeded) => counts.succeeded = n,
                Ok(RunStatus::Failed) => counts.failed = n,
                Err(e) => {
                    return Err(LedgerError::Corrupt {
                        id: -1,
                        detail: e.to_string(),
                    })
                }
            }
        }
        Ok(counts)
    }
}

fn expect_one(
    changed: usize,
    id: i64,
    expected: RunStatus,
    target: RunStatus,
) -> Result<(), LedgerError> {
    if changed == 1 {
        debug!(run_id = id, status = %target, "run transitioned");
        Ok(())
    } else {
        Err(LedgerError::Transition { id, expected, target })
    }
}
