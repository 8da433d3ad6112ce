use rusqlite::{Connection, Result};
use std::time::Duration;

pub fn migrate(conn: &Connection) -> Result<()> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.busy_timeout(Duration::from_secs(5))?;

    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS jobs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            action_name TEXT NOT NULL,
            event_data TEXT NOT NULL,
            status TEXT NOT NULL CHECK(status IN ('pending','running','completed','failed')),
            created_at INTEGER NOT NULL,
            started_at INTEGER,
            completed_at INTEGER,
            error TEXT,
            log_file TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_jobs_status_created ON jobs(status, created_at);

        CREATE TRIGGER IF NOT EXISTS jobs_event_data_immutable
        BEFORE UPDATE OF event_data ON jobs
        BEGIN
            SELECT RAISE(ABORT, 'jobs.event_data is immutable');
        END;
        ",
    )?;

    Ok(())
}
