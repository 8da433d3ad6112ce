use crate::events::Event;
use crate::store::{Job, JobId};
use anyhow::Result;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockOwner {
    pub job_id: JobId,
    pub timestamp: i64,
}

/// Read side of the work-directory lock manager, as seen by the dispatcher.
pub trait LockQuery: Send + Sync {
    /// `None` when the event names nothing lockable; such jobs are admitted.
    fn resource_key_for(&self, event: &Event) -> Result<Option<String>>;
    fn is_locked(&self, key: &str) -> Result<bool>;
    /// Diagnostics only.
    fn lock_owner(&self, key: &str) -> Result<Option<LockOwner>>;
}

/// Keeps candidates whose resource is free, in order, until `limit` are
/// admitted. A job whose lock check errors is admitted (fail-open).
pub fn admit(candidates: Vec<Job>, limit: usize, locks: Option<&dyn LockQuery>) -> Vec<Job> {
    let Some(locks) = locks else {
        return candidates.into_iter().take(limit).collect();
    };

    let mut admitted = Vec::with_capacity(limit.min(candidates.len()));
    for job in candidates {
        if admitted.len() >= limit {
            break;
        }
        match check(locks, &job) {
            Ok(Check::Unkeyed) => {
                tracing::debug!(job_id = job.id, "no lockable resource; admitting job");
                admitted.push(job);
            }
            Ok(Check::Free) => admitted.push(job),
            Ok(Check::Locked(key)) => {
                let owner = locks.lock_owner(&key).ok().flatten();
                tracing::debug!(
                    job_id = job.id,
                    key = %key,
                    owner = ?owner,
                    "resource locked; job stays pending"
                );
            }
            Err(err) => {
                tracing::warn!(
                    job_id = job.id,
                    error = %format!("{err:#}"),
                    "lock check failed; admitting job"
                );
                admitted.push(job);
            }
        }
    }
    admitted
}

enum Check {
    Unkeyed,
    Free,
    Locked(String),
}

fn check(locks: &dyn LockQuery, job: &Job) -> Result<Check> {
    let event = job.event()?;
    let Some(key) = locks.resource_key_for(&event)? else {
        return Ok(Check::Unkeyed);
    };
    Ok(if locks.is_locked(&key)? {
        Check::Locked(key)
    } else {
        Check::Free
    })
}
