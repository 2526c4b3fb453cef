//! Run data model: evaluation windows, run records, and their status.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Failure reason recorded for runs left in flight by a crashed process.
pub const ABANDONED_REASON: &str = "abandoned";

/// Half-open time interval `[start, end)` covered by one evaluation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Window {
    /// Build a window, returning `None` unless `start < end`.
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn duration(&self) -> chrono::Duration {
        self.end - self.start
    }

    /// True if the two windows share any instant.
    pub fn overlaps(&self, other: &Window) -> bool {
        self.start < other.end && other.start < self.end
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", format_ts(self.start), format_ts(self.end))
    }
}

/// Lifecycle state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
        }
    }

    /// Succeeded and failed runs are never modified again (except by crash recovery,
    /// which only touches non-terminal runs).
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Succeeded | RunStatus::Failed)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RunStatus::Pending),
            "running" => Ok(RunStatus::Running),
            "succeeded" => Ok(RunStatus::Succeeded),
            "failed" => Ok(RunStatus::Failed),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

/// Which trigger source asked for the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Timer,
    Request,
}

impl TriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerKind::Timer => "timer",
            TriggerKind::Request => "request",
        }
    }
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TriggerKind {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "timer" => Ok(TriggerKind::Timer),
            "request" => Ok(TriggerKind::Request),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

/// A stored column held a value outside the known set.
#[derive(Debug, thiserror::Error)]
#[error("unknown variant '{0}'")]
pub struct UnknownVariant(pub String);

/// One evaluation attempt as recorded in the run ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: i64,
    pub window: Window,
    pub status: RunStatus,
    pub trigger_kind: TriggerKind,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    pub summary: Option<String>,
}

impl Run {
    /// Wall-clock runtime, once the run has both started and finished.
    pub fn elapsed(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.finished_at) {
            (Some(s), Some(f)) => Some(f - s),
            _ => None,
        }
    }
}

/// Fixed-width UTC timestamp; lexicographic order matches chronological order.
pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(min: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap() + chrono::Duration::minutes(min)
    }

    #[test]
    fn test_window_rejects_empty_and_negative() {
        assert!(Window::new(t(5), t(5)).is_none());
        assert!(Window::new(t(5), t(1)).is_none());
        assert_eq!(Window::new(t(0), t(5)).unwrap().duration(), chrono::Duration::minutes(5));
    }

    #[test]
    fn test_adjacent_windows_do_not_overlap() {
        let a = Window::new(t(0), t(5)).unwrap();
        let b = Window::new(t(5), t(10)).unwrap();
        let c = Window::new(t(4), t(6)).unwrap();
        assert!(!a.overlaps(&b));
        assert!(a.overlaps(&c));
        assert!(b.overlaps(&c));
    }

    #[test]
    fn test_status_parse() {
        for s in [RunStatus::Pending, RunStatus::Running, RunStatus::Succeeded, RunStatus::Failed] {
            assert_eq!(s.as_str().parse::<RunStatus>().unwrap(), s);
        }
        assert!("done".parse::<RunStatus>().is_err());
        assert!("cron".parse::<TriggerKind>().is_err());
    }

    #[test]
    fn test_timestamp_format_sorts_chronologically() {
        let early = format_ts(t(0));
        let late = format_ts(t(0) + chrono::Duration::microseconds(1));
        assert_eq!(early.len(), late.len());
        assert!(early < late);
        assert!(early.ends_with('Z'));
    }
}
