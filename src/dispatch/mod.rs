//! Concurrency-bounded job dispatch.
//!
//! A tick computes the free slots, pulls the oldest admissible pending jobs,
//! claims each one in the store and hands it to the executor on its own
//! thread. The tick waits for the claims, never for the executions.

pub mod admission;
mod r#loop;

pub use admission::{LockOwner, LockQuery};
pub use r#loop::{DispatchTrigger, DispatcherHandle};

use crate::events::Event;
use crate::store::{Job, JobId, JobStore};
use anyhow::{Context, Result, anyhow};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Candidates fetched per free slot, to absorb lock-based rejections.
pub const CANDIDATE_OVERFETCH: usize = 3;

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub max_concurrent: usize,
    pub poll_interval: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 2,
            poll_interval: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DispatchedJob {
    pub id: JobId,
    pub action_name: String,
    pub event: Event,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Completed {
        log_file: PathBuf,
    },
    Failed {
        error: String,
        log_file: Option<PathBuf>,
    },
    /// The job could not start for a transient reason (e.g. its work
    /// directory got locked after the claim) and goes back to `pending`.
    Deferred {
        reason: String,
    },
}

/// Runs one claimed job to completion. Called on a dedicated thread; an `Err`
/// or a panic marks the job failed.
pub trait JobExecutor: Send + Sync {
    fn execute(&self, job: &DispatchedJob) -> Result<ExecutionOutcome>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub slots: usize,
    pub candidates: usize,
    pub admitted: usize,
    pub dispatched: Vec<JobId>,
    pub lost_races: usize,
    /// Claim errors (job left pending) and post-claim errors (job failed).
    pub failed: Vec<JobId>,
}

pub struct Dispatcher {
    store: Arc<JobStore>,
    executor: Arc<dyn JobExecutor>,
    locks: Option<Arc<dyn LockQuery>>,
    cfg: DispatcherConfig,
    tick_gate: Mutex<()>,
    inflight: Mutex<Vec<JoinHandle<()>>>,
}

enum Claim {
    Spawned,
    LostRace,
}

impl Dispatcher {
    pub fn new(
        store: Arc<JobStore>,
        executor: Arc<dyn JobExecutor>,
        locks: Option<Arc<dyn LockQuery>>,
        cfg: DispatcherConfig,
    ) -> Self {
        Self {
            store,
            executor,
            locks,
            cfg,
            tick_gate: Mutex::new(()),
            inflight: Mutex::new(Vec::new()),
        }
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.cfg
    }

    /// One scheduling pass. Concurrent callers are serialized, so the running
    /// count a tick reads cannot be raised by another tick until it returns.
    pub fn tick(&self) -> Result<TickReport> {
        let _gate = self
            .tick_gate
            .lock()
            .map_err(|_| anyhow!("dispatcher tick gate poisoned"))?;
        self.reap_finished();

        let mut report = TickReport::default();
        let running = self.store.count_running()?;
        report.slots = self.cfg.max_concurrent.saturating_sub(running);
        if report.slots == 0 {
            return Ok(report);
        }

        let candidates = self
            .store
            .fetch_pending_candidates(report.slots * CANDIDATE_OVERFETCH)?;
        report.candidates = candidates.len();
        let admitted = admission::admit(candidates, report.slots, self.locks.as_deref());
        report.admitted = admitted.len();

        for job in admitted {
            let id = job.id;
            match self.dispatch_one(job) {
                Ok(Claim::Spawned) => report.dispatched.push(id),
                Ok(Claim::LostRace) => report.lost_races += 1,
                Err(_) => report.failed.push(id),
            }
        }
        Ok(report)
    }

    fn dispatch_one(&self, job: Job) -> Result<Claim> {
        let claimed = self.store.claim_running(job.id).inspect_err(|err| {
            tracing::error!(
                job_id = job.id,
                error = %format!("{err:#}"),
                "claim failed; job left pending"
            );
        })?;
        if !claimed {
            tracing::debug!(job_id = job.id, "job claimed elsewhere; skipping");
            return Ok(Claim::LostRace);
        }

        if let Err(err) = self.spawn_execution(&job) {
            let message = format!("{err:#}");
            tracing::error!(job_id = job.id, error = %message, "dispatch failed after claim");
            if let Err(mark_err) = self.store.mark_failed(job.id, &message, None) {
                tracing::error!(
                    job_id = job.id,
                    error = %format!("{mark_err:#}"),
                    "could not record dispatch failure"
                );
            }
            return Err(err);
        }
        Ok(Claim::Spawned)
    }

    fn spawn_execution(&self, job: &Job) -> Result<()> {
        let dispatched = DispatchedJob {
            id: job.id,
            action_name: job.action_name.clone(),
            event: job.event()?,
        };
        let store = Arc::clone(&self.store);
        let executor = Arc::clone(&self.executor);
        let handle = thread::Builder::new()
            .name(format!("hookq-job-{}", job.id))
            .spawn(move || run_execution(&store, executor.as_ref(), &dispatched))
            .with_context(|| format!("spawn execution thread for job {}", job.id))?;

        tracing::info!(job_id = job.id, action = %job.action_name, "job dispatched");
        if let Ok(mut inflight) = self.inflight.lock() {
            inflight.push(handle);
        }
        Ok(())
    }

    fn reap_finished(&self) {
        if let Ok(mut inflight) = self.inflight.lock() {
            inflight.retain(|handle| !handle.is_finished());
        }
    }

    /// Blocks until every execution spawned so far has recorded its outcome.
    pub fn wait_for_inflight(&self) {
        let handles = match self.inflight.lock() {
            Ok(mut inflight) => std::mem::take(&mut *inflight),
            Err(_) => return,
        };
        for handle in handles {
            let _ = handle.join();
        }
    }
}

fn run_execution(store: &JobStore, executor: &dyn JobExecutor, job: &DispatchedJob) {
    let started = Instant::now();
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| executor.execute(job)))
        .unwrap_or_else(|payload| Err(anyhow!("executor panicked: {}", panic_message(&payload))));
    let elapsed_ms = started.elapsed().as_millis() as u64;

    let recorded = match outcome {
        Ok(ExecutionOutcome::Completed { log_file }) => {
            tracing::info!(job_id = job.id, action = %job.action_name, elapsed_ms, "job completed");
            store.mark_completed(job.id, &log_file)
        }
        Ok(ExecutionOutcome::Failed { error, log_file }) => {
            tracing::warn!(job_id = job.id, action = %job.action_name, elapsed_ms, error = %error, "job failed");
            store.mark_failed(job.id, &error, log_file.as_deref())
        }
        Ok(ExecutionOutcome::Deferred { reason }) => {
            tracing::debug!(job_id = job.id, reason = %reason, "job deferred; back to pending");
            store.reset_to_pending(job.id)
        }
        Err(err) => {
            let message = format!("{err:#}");
            tracing::warn!(job_id = job.id, action = %job.action_name, elapsed_ms, error = %message, "job failed");
            store.mark_failed(job.id, &message, None)
        }
    };

    match recorded {
        Ok(true) => {}
        Ok(false) => {
            tracing::warn!(job_id = job.id, "job was no longer running; outcome not recorded")
        }
        Err(err) => tracing::error!(
            job_id = job.id,
            error = %format!("{err:#}"),
            "could not record job outcome"
        ),
    }
}

fn panic_message(payload: &Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
