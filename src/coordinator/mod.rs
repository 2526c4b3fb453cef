//! Trigger-and-window coordination: when a run happens, what span it covers,
//! and how runs are serialized and recovered.

pub mod clock;
pub mod engine;
pub mod lock;
pub mod timer;
pub mod window;

pub use self::clock::{Clock, ManualClock, SystemClock};
pub use self::engine::{Coordinator, CoordinatorStatus};
pub use self::lock::{RunLock, RunLockGuard};
pub use self::timer::run_timer_loop;
pub use self::window::{Allocation, WindowAllocator};

use crate::run::Run;
use crate::storage::LedgerError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("run ledger failure; coordinator halted: {0}")]
    Ledger(#[from] LedgerError),

    #[error("coordinator halted after a run ledger failure")]
    Halted,

    #[error("a run is already in progress")]
    Busy,
}

/// Why a trigger did not produce a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum NoOpReason {
    TooSoon { frontier: DateTime<Utc> },
    ClockRegression { frontier: DateTime<Utc>, now: DateTime<Utc> },
}

/// What happened to one trigger.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// A run was recorded and evaluated; see its status.
    Completed(Run),
    /// Nothing to evaluate yet; no run recorded.
    NoOp(NoOpReason),
    /// Another run was in flight; the trigger was dropped.
    Rejected,
}

impl RunOutcome {
    /// Short label used in API responses and logs.
    pub fn label(&self) -> &'static str {
        match self {
            RunOutcome::Completed(run) => run.status.as_str(),
            RunOutcome::NoOp(_) => "no_op",
            RunOutcome::Rejected => "rejected",
        }
    }
}
