//! Durable job table.
//!
//! Every state transition is a single guarded SQL statement, so concurrent
//! dispatch ticks (or a second process sharing the database file) can never
//! double-claim a job or overwrite a terminal state.

pub mod schema;

use crate::events::Event;
use anyhow::{Context, Result, anyhow, bail};
use chrono::Utc;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::Serialize;
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};

pub type JobId = i64;

const MS_PER_DAY: i64 = 24 * 60 * 60 * 1000;
const JOB_COLUMNS: &str =
    "id, action_name, event_data, status, created_at, started_at, completed_at, error, log_file";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => bail!("unknown job status `{other}`"),
        }
    }
}

impl ToSql for JobStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for JobStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let raw = value.as_str()?;
        raw.parse()
            .map_err(|e: anyhow::Error| FromSqlError::Other(e.to_string().into()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Job {
    pub id: JobId,
    pub action_name: String,
    pub event_data: String,
    pub status: JobStatus,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub error: Option<String>,
    pub log_file: Option<String>,
}

impl Job {
    /// Decodes the event snapshot taken at enqueue time.
    pub fn event(&self) -> Result<Event> {
        serde_json::from_str(&self.event_data)
            .with_context(|| format!("decode event snapshot of job {}", self.id))
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            action_name: row.get(1)?,
            event_data: row.get(2)?,
            status: row.get(3)?,
            created_at: row.get(4)?,
            started_at: row.get(5)?,
            completed_at: row.get(6)?,
            error: row.get(7)?,
            log_file: row.get(8)?,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
}

pub struct JobStore {
    conn: Mutex<Connection>,
}

impl JobStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create db parent dir {}", parent.display()))?;
        }
        let conn =
            Connection::open(path).with_context(|| format!("open sqlite db {}", path.display()))?;
        schema::migrate(&conn).with_context(|| format!("migrate {}", path.display()))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        schema::migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("job store connection mutex poisoned"))
    }

    pub fn enqueue(&self, action_name: &str, event: &Event) -> Result<JobId> {
        let event_data = serde_json::to_string(event).context("serialize event snapshot")?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO jobs (action_name, event_data, status, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![action_name, event_data, JobStatus::Pending, now_ms()],
        )
        .with_context(|| format!("enqueue job for action `{action_name}`"))?;
        Ok(conn.last_insert_rowid())
    }

    /// Requeues every job a previous process left `running`. Call once at
    /// startup, before the first dispatch.
    pub fn reset_stuck_jobs(&self) -> Result<usize> {
        let changed = self.conn()?.execute(
            "UPDATE jobs SET status = 'pending', started_at = NULL WHERE status = 'running'",
            [],
        )?;
        Ok(changed)
    }

    pub fn count_running(&self) -> Result<usize> {
        let count: i64 = self.conn()?.query_row(
            "SELECT COUNT(*) FROM jobs WHERE status = 'running'",
            [],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(count)?)
    }

    /// Oldest pending jobs first, at most `limit` of them.
    pub fn fetch_pending_candidates(&self, limit: usize) -> Result<Vec<Job>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE status = 'pending'
             ORDER BY created_at ASC, id ASC LIMIT ?1"
        ))?;
        let jobs = stmt
            .query_map(params![i64::try_from(limit)?], Job::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(jobs)
    }

    /// `pending -> running`. Returns false when the job was not pending, i.e.
    /// somebody else claimed it first; the caller must not dispatch it.
    pub fn claim_running(&self, id: JobId) -> Result<bool> {
        let changed = self.conn()?.execute(
            "UPDATE jobs SET status = 'running', started_at = ?2
             WHERE id = ?1 AND status = 'pending'",
            params![id, now_ms()],
        )?;
        Ok(changed == 1)
    }

    pub fn mark_completed(&self, id: JobId, log_file: &Path) -> Result<bool> {
        let changed = self.conn()?.execute(
            "UPDATE jobs SET status = 'completed', completed_at = ?2, log_file = ?3, error = NULL
             WHERE id = ?1 AND status = 'running'",
            params![id, now_ms(), log_file.display().to_string()],
        )?;
        Ok(changed == 1)
    }

    pub fn mark_failed(&self, id: JobId, error: &str, log_file: Option<&Path>) -> Result<bool> {
        let changed = self.conn()?.execute(
            "UPDATE jobs SET status = 'failed', completed_at = ?2, error = ?3, log_file = ?4
             WHERE id = ?1 AND status = 'running'",
            params![
                id,
                now_ms(),
                error,
                log_file.map(|p| p.display().to_string())
            ],
        )?;
        Ok(changed == 1)
    }

    /// `running -> pending` for a job that cannot proceed right now. The
    /// original `created_at` is kept so the job keeps its place in line.
    pub fn reset_to_pending(&self, id: JobId) -> Result<bool> {
        let changed = self.conn()?.execute(
            "UPDATE jobs SET status = 'pending', started_at = NULL
             WHERE id = ?1 AND status = 'running'",
            params![id],
        )?;
        Ok(changed == 1)
    }

    pub fn stats(&self) -> Result<JobStats> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM jobs GROUP BY status")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, JobStatus>(0)?, row.get::<_, i64>(1)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut stats = JobStats::default();
        for (status, count) in rows {
            let count = usize::try_from(count)?;
            match status {
                JobStatus::Pending => stats.pending = count,
                JobStatus::Running => stats.running = count,
                JobStatus::Completed => stats.completed = count,
                JobStatus::Failed => stats.failed = count,
            }
        }
        Ok(stats)
    }

    pub fn purge_older_than(&self, days: u32) -> Result<usize> {
        self.purge_older_than_at(days, now_ms())
    }

    /// Deletes terminal jobs whose `completed_at` is strictly before
    /// `now_ms - days`, along with their log files. A row exactly at the
    /// cutoff is kept.
    pub fn purge_older_than_at(&self, days: u32, now_ms: i64) -> Result<usize> {
        let cutoff = now_ms - i64::from(days) * MS_PER_DAY;
        let (removed, log_files) = {
            let mut conn = self.conn()?;
            let tx = conn.transaction()?;
            let log_files = {
                let mut stmt = tx.prepare(
                    "SELECT log_file FROM jobs
                     WHERE status IN ('completed', 'failed') AND completed_at < ?1
                       AND log_file IS NOT NULL",
                )?;
                stmt.query_map(params![cutoff], |row| row.get::<_, String>(0))?
                    .collect::<rusqlite::Result<Vec<_>>>()?
            };
            let removed = tx.execute(
                "DELETE FROM jobs
                 WHERE status IN ('completed', 'failed') AND completed_at < ?1",
                params![cutoff],
            )?;
            tx.commit().context("commit purge")?;
            (removed, log_files)
        };

        for log_file in log_files {
            match fs::remove_file(&log_file) {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => {
                    tracing::warn!(log_file = %log_file, error = %err, "could not remove job log")
                }
            }
        }
        Ok(removed)
    }

    pub fn get_job(&self, id: JobId) -> Result<Option<Job>> {
        self.conn()?
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                params![id],
                Job::from_row,
            )
            .optional()
            .map_err(Into::into)
    }

    /// Newest first, optionally restricted to one status.
    pub fn list_jobs(&self, status: Option<JobStatus>, limit: usize) -> Result<Vec<Job>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE (?1 IS NULL OR status = ?1)
             ORDER BY id DESC LIMIT ?2"
        ))?;
        let jobs = stmt
            .query_map(params![status, i64::try_from(limit)?], Job::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(jobs)
    }
}

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}
