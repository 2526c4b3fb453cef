//! Database schema and migrations.

use anyhow::Result;
use rusqlite::Connection;

/// Current schema version recorded in `schema_version`.
pub const SCHEMA_VERSION: i64 = 1;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS runs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            window_start TEXT NOT NULL,
            window_end TEXT NOT NULL,
            status TEXT NOT NULL
                CHECK (status IN ('pending', 'running', 'succeeded', 'failed')),
            trigger_kind TEXT NOT NULL CHECK (trigger_kind IN ('timer', 'request')),
            created_at TEXT NOT NULL,
            started_at TEXT,
            finished_at TEXT,
            failure_reason TEXT,
            summary TEXT,
            CHECK (window_start < window_end)
        );

        CREATE INDEX IF NOT EXISTS idx_runs_status_start ON runs(status, window_start);
        CREATE INDEX IF NOT EXISTS idx_runs_status_end ON runs(status, window_end);",
    )?;

    conn.execute(
        "INSERT OR IGNORE INTO schema_version (version) VALUES (?1)",
        [SCHEMA_VERSION],
    )?;

    Ok(())
}
