//! Window allocator -- decides which `[start, end)` span the next run covers.
//!
//! The frontier is the end of the latest succeeded window (or the configured
//! global start). Failed windows at or beyond the frontier are replayed oldest
//! first before the frontier is allowed to advance, so the succeeded windows
//! always form a gap-free prefix of the timeline.

use crate::run::Window;
use crate::storage::{LedgerError, RunLedger};
use chrono::{DateTime, SubsecRound, Utc};
use serde::Serialize;
use tracing::{debug, warn};

/// Result of asking for the next window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Allocation {
    /// Extend coverage from the frontier up to `now`.
    Fresh { window: Window },
    /// Replay a previously failed window.
    Retry { window: Window, failed_run_id: i64 },
    /// Less than the minimum window has elapsed since the frontier.
    TooSoon { frontier: DateTime<Utc> },
    /// The clock reads earlier than the frontier.
    ClockRegression {
        frontier: DateTime<Utc>,
        now: DateTime<Utc>,
    },
}

impl Allocation {
    pub fn window(&self) -> Option<Window> {
        match self {
            Allocation::Fresh { window } | Allocation::Retry { window, .. } => Some(*window),
            Allocation::TooSoon { .. } | Allocation::ClockRegression { .. } => None,
        }
    }
}

#[derive(Clone)]
pub struct WindowAllocator {
    ledger: RunLedger,
    global_start: DateTime<Utc>,
    min_window: chrono::Duration,
}

impl WindowAllocator {
    pub fn new(ledger: RunLedger, global_start: DateTime<Utc>, min_window: chrono::Duration) -> Self {
        Self {
            ledger,
            global_start: global_start.trunc_subsecs(6),
            min_window,
        }
    }

    pub fn global_start(&self) -> DateTime<Utc> {
        self.global_start
    }

    pub fn min_window(&self) -> chrono::Duration {
        self.min_window
    }

    /// End of covered timeline: latest succeeded `window_end`, never before `global_start`.
    pub fn frontier(&self) -> Result<DateTime<Utc>, LedgerError> {
        Ok(self
            .ledger
            .latest_succeeded_end()?
            .map_or(self.global_start, |end| end.max(self.global_start)))
    }

    /// Compute the next allocation. Read-only: calling it repeatedly without an
    /// intervening ledger write yields the same answer.
    pub fn allocate(&self, now: DateTime<Utc>) -> Result<Allocation, LedgerError> {
        let frontier = self.frontier()?;

        if let Some(failed) = self.ledger.earliest_failed_from(frontier)? {
            debug!(run_id = failed.id, window = %failed.window, "re-offering failed window");
            return Ok(Allocation::Retry {
                window: failed.window,
                failed_run_id: failed.id,
            });
        }

        if now < frontier {
            warn!(%frontier, %now, "clock is behind the covered frontier; no window allocated");
            return Ok(Allocation::ClockRegression { frontier, now });
        }

        if now - frontier < self.min_window {
            debug!(%frontier, %now, min_window_sec = self.min_window.num_seconds(), "window below minimum size");
            return Ok(Allocation::TooSoon { frontier });
        }

        match Window::new(frontier, now) {
            Some(window) => Ok(Allocation::Fresh { window }),
            // Only reachable with a zero minimum window and now == frontier.
            None => Ok(Allocation::TooSoon { frontier }),
        }
    }

    pub fn next_window(&self, now: DateTime<Utc>) -> Result<Option<Window>, LedgerError> {
        Ok(self.allocate(now)?.window())
    }
}
