//! Shell-command actions.

mod runner;

use crate::dispatch::{DispatchedJob, ExecutionOutcome, JobExecutor, LockQuery};
use crate::locks::{LockGuard, WorkdirLocks};
use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_ACTION_TIMEOUT_SECS: u64 = 1800;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionCommand {
    pub command: String,
    pub timeout: Duration,
    pub workdir: Option<PathBuf>,
}

/// Runs each job's configured command, one log file per job.
pub struct ShellExecutor {
    actions: BTreeMap<String, ActionCommand>,
    log_dir: PathBuf,
    locks: Option<Arc<WorkdirLocks>>,
}

impl ShellExecutor {
    pub fn new(
        actions: BTreeMap<String, ActionCommand>,
        log_dir: impl Into<PathBuf>,
        locks: Option<Arc<WorkdirLocks>>,
    ) -> Self {
        Self {
            actions,
            log_dir: log_dir.into(),
            locks,
        }
    }

    pub fn log_path(&self, job: &DispatchedJob) -> PathBuf {
        self.log_dir
            .join(format!("job-{}-{}.log", job.id, sanitize(&job.action_name)))
    }

    fn event_path(&self, job: &DispatchedJob) -> PathBuf {
        self.log_dir.join(format!("job-{}-event.json", job.id))
    }

    /// `Ok(None)` means the resource is held elsewhere. Events without a
    /// lockable resource run unlocked.
    fn lock_for(&self, job: &DispatchedJob) -> Result<Option<Option<LockGuard>>> {
        let Some(locks) = &self.locks else {
            return Ok(Some(None));
        };
        let Some(key) = locks.resource_key_for(&job.event)? else {
            tracing::debug!(job_id = job.id, "no lockable resource; running unlocked");
            return Ok(Some(None));
        };
        Ok(locks.acquire(&key, job.id)?.map(Some))
    }
}

impl JobExecutor for ShellExecutor {
    fn execute(&self, job: &DispatchedJob) -> Result<ExecutionOutcome> {
        let Some(action) = self.actions.get(&job.action_name) else {
            return Ok(ExecutionOutcome::Failed {
                error: format!("unknown action `{}`", job.action_name),
                log_file: None,
            });
        };

        let Some(_guard) = self.lock_for(job)? else {
            return Ok(ExecutionOutcome::Deferred {
                reason: "work directory locked by another job".to_string(),
            });
        };

        fs::create_dir_all(&self.log_dir)
            .with_context(|| format!("create log dir {}", self.log_dir.display()))?;
        let log_file = self.log_path(job);
        let event_file = self.event_path(job);
        fs::write(&event_file, serde_json::to_string_pretty(&job.event)?)
            .with_context(|| format!("write event file {}", event_file.display()))?;
        write_header(&log_file, job, action)?;

        let env = [
            ("HOOKQ_JOB_ID", job.id.to_string()),
            ("HOOKQ_ACTION", job.action_name.clone()),
            ("HOOKQ_EVENT_TYPE", job.event.event_type.clone()),
            ("HOOKQ_EVENT_FILE", event_file.display().to_string()),
        ];
        let run = runner::run_logged(
            &action.command,
            action.workdir.as_deref(),
            &env,
            &log_file,
            action.timeout,
        );
        if let Err(err) = fs::remove_file(&event_file) {
            tracing::warn!(job_id = job.id, error = %err, "could not remove event file");
        }
        let run = run?;
        tracing::debug!(
            job_id = job.id,
            elapsed_ms = run.elapsed.as_millis() as u64,
            timed_out = run.timed_out,
            "action command finished"
        );

        if run.ok() {
            return Ok(ExecutionOutcome::Completed { log_file });
        }
        let error = if run.timed_out {
            format!("timed out after {}s", action.timeout.as_secs())
        } else {
            match run.status.code() {
                Some(code) => format!("exited with status {code}"),
                None => "terminated by signal".to_string(),
            }
        };
        Ok(ExecutionOutcome::Failed {
            error,
            log_file: Some(log_file),
        })
    }
}

fn write_header(log: &Path, job: &DispatchedJob, action: &ActionCommand) -> Result<()> {
    let mut file = fs::File::create(log).with_context(|| format!("create job log {}", log.display()))?;
    writeln!(
        file,
        "# job {} action {} event {} ({})",
        job.id, job.action_name, job.event.id, job.event.event_type
    )?;
    writeln!(file, "# $ {}", action.command)?;
    Ok(())
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}
