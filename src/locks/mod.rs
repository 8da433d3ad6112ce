//! Work-directory locks backed by lease files.
//!
//! One JSON lease per resource key under the lock directory. A lease is held
//! while its file exists and the owning process is alive; a lease left behind
//! by a dead process is stale and gets replaced by the next acquirer.
//!
//! A lease naming this process's own PID is live only if this lock manager
//! handed it out. A restarted service often gets the PID of the run that
//! crashed (PID 1 in a container), so PID liveness alone cannot tell them
//! apart.

use crate::dispatch::{LockOwner, LockQuery};
use crate::events::Event;
use crate::store::{JobId, now_ms};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex, MutexGuard};

pub(crate) const LOCK_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LockRecord {
    version: u32,
    key: String,
    job_id: JobId,
    owner_pid: u32,
    acquired_at: i64,
}

/// Keys currently leased through one `WorkdirLocks`, with the holding job.
type HeldLeases = Arc<Mutex<HashMap<String, JobId>>>;

#[derive(Debug, Clone)]
pub struct WorkdirLocks {
    dir: PathBuf,
    held: HeldLeases,
}

/// Held lease. Dropping it releases the lock.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    key: String,
    job_id: JobId,
    held: HeldLeases,
}

impl LockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        {
            let mut held = lock_held(&self.held);
            if held.get(&self.key) == Some(&self.job_id) {
                held.remove(&self.key);
            }
        }
        match read_record(&self.path) {
            Ok(Some(record)) if record.job_id == self.job_id => {
                if let Err(err) = fs::remove_file(&self.path) {
                    tracing::warn!(key = %self.key, error = %err, "could not release lock");
                }
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(key = %self.key, error = %format!("{err:#}"), "could not read lock on release")
            }
        }
    }
}

impl WorkdirLocks {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            held: HeldLeases::default(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn lease_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", sha256_hex(key)))
    }

    /// Takes the lease for `key` on behalf of `job_id`. `None` means another
    /// live owner holds it.
    pub fn acquire(&self, key: &str, job_id: JobId) -> Result<Option<LockGuard>> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("create lock dir {}", self.dir.display()))?;
        let path = self.lease_path(key);
        let record = LockRecord {
            version: LOCK_SCHEMA_VERSION,
            key: key.to_string(),
            job_id,
            owner_pid: std::process::id(),
            acquired_at: now_ms(),
        };

        for _ in 0..2 {
            if create_exclusive(&path, &record)? {
                lock_held(&self.held).insert(key.to_string(), job_id);
                tracing::debug!(key, job_id, "lock acquired");
                return Ok(Some(LockGuard {
                    path,
                    key: key.to_string(),
                    job_id,
                    held: Arc::clone(&self.held),
                }));
            }
            match read_record(&path)? {
                None => continue,
                Some(existing) if self.owner_live(&existing) => return Ok(None),
                Some(existing) => {
                    tracing::info!(
                        key,
                        stale_job_id = existing.job_id,
                        stale_pid = existing.owner_pid,
                        "replacing stale lock"
                    );
                    match fs::remove_file(&path) {
                        Ok(()) => {}
                        Err(err) if err.kind() == ErrorKind::NotFound => {}
                        Err(err) => {
                            return Err(err)
                                .with_context(|| format!("remove stale lock {}", path.display()));
                        }
                    }
                }
            }
        }
        Ok(None)
    }

    fn live_record(&self, key: &str) -> Result<Option<LockRecord>> {
        Ok(read_record(&self.lease_path(key))?.filter(|r| self.owner_live(r)))
    }

    fn owner_live(&self, record: &LockRecord) -> bool {
        if record.owner_pid == std::process::id() {
            return lock_held(&self.held).get(&record.key) == Some(&record.job_id);
        }
        process_alive(record.owner_pid)
    }
}

fn lock_held(held: &Mutex<HashMap<String, JobId>>) -> MutexGuard<'_, HashMap<String, JobId>> {
    held.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl LockQuery for WorkdirLocks {
    fn resource_key_for(&self, event: &Event) -> Result<Option<String>> {
        Ok(event.repository.clone().filter(|r| !r.trim().is_empty()))
    }

    fn is_locked(&self, key: &str) -> Result<bool> {
        Ok(self.live_record(key)?.is_some())
    }

    fn lock_owner(&self, key: &str) -> Result<Option<LockOwner>> {
        Ok(self.live_record(key)?.map(|r| LockOwner {
            job_id: r.job_id,
            timestamp: r.acquired_at,
        }))
    }
}

/// Writes the full record to a temp file, then links it into place so the
/// lease appears complete or not at all. Returns false if it already exists.
fn create_exclusive(path: &Path, record: &LockRecord) -> Result<bool> {
    let tmp = path.with_extension(format!("tmp-{}-{}", std::process::id(), record.job_id));
    fs::write(&tmp, serde_json::to_string_pretty(record)?)
        .with_context(|| format!("write temp lock {}", tmp.display()))?;
    let linked = fs::hard_link(&tmp, path);
    let _ = fs::remove_file(&tmp);
    match linked {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == ErrorKind::AlreadyExists => Ok(false),
        Err(err) => Err(err).with_context(|| format!("create lock {}", path.display())),
    }
}

fn read_record(path: &Path) -> Result<Option<LockRecord>> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err).with_context(|| format!("read lock {}", path.display())),
    };
    let record = serde_json::from_str(&raw)
        .with_context(|| format!("parse lock JSON {}", path.display()))?;
    Ok(Some(record))
}

pub(crate) fn process_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    let mut cmd = Command::new("kill");
    cmd.arg("-0")
        .arg(pid.to_string())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    cmd.status().map(|status| status.success()).unwrap_or(false)
}

pub(crate) fn sha256_hex(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}
