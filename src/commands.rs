//! CLI command bodies. Each one wires the core components from a loaded
//! config and prints human-readable output on stdout.

use crate::actions::ShellExecutor;
use crate::config::{self, DEFAULT_CONFIG_PATH, HookqConfig};
use crate::dispatch::{Dispatcher, DispatcherHandle, LockQuery};
use crate::events::Event;
use crate::locks::WorkdirLocks;
use crate::matcher::find_matching_mappings;
use crate::router::{EventRouter, QueueSink, RouteReport};
use crate::store::{Job, JobId, JobStatus, JobStore};
use anyhow::{Context, Result, bail};
use chrono::DateTime;
use std::io::{self, BufRead, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

pub struct Session {
    pub config: HookqConfig,
}

impl Session {
    /// An explicit `--config` must exist. The default path is optional, and
    /// a missing file yields an empty config with default storage paths.
    pub fn load(config_path: Option<&Path>, state_db: Option<PathBuf>) -> Result<Self> {
        let mut config = match config_path {
            Some(path) => config::load_config(path)?,
            None => {
                let path = Path::new(DEFAULT_CONFIG_PATH);
                if path.exists() {
                    config::load_config(path)?
                } else {
                    tracing::debug!(path = %path.display(), "no config file; using defaults");
                    HookqConfig::default()
                }
            }
        };
        if let Some(db) = state_db {
            config.storage.state_db = db;
        }
        Ok(Self { config })
    }

    fn open_store(&self) -> Result<Arc<JobStore>> {
        Ok(Arc::new(JobStore::open(&self.config.storage.state_db)?))
    }

    fn router(&self, store: &Arc<JobStore>) -> EventRouter {
        EventRouter::new(
            self.config.mappings.clone(),
            Arc::new(QueueSink::new(Arc::clone(store))),
        )
    }
}

pub fn serve(session: &Session, route_stdin: bool) -> Result<()> {
    let cfg = &session.config;
    let store = session.open_store()?;
    if let Some(days) = cfg.dispatcher.retention_days {
        let removed = store.purge_older_than(days)?;
        if removed > 0 {
            tracing::info!(removed, days, "purged finished jobs past retention");
        }
    }

    let locks = Arc::new(WorkdirLocks::new(&cfg.storage.lock_dir));
    let executor = Arc::new(ShellExecutor::new(
        cfg.action_commands(),
        &cfg.storage.log_dir,
        Some(Arc::clone(&locks)),
    ));
    let lock_query: Arc<dyn LockQuery> = locks;
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&store),
        executor,
        Some(lock_query),
        cfg.dispatcher_config(),
    ));
    let handle = dispatcher.start()?;

    if !route_stdin {
        return handle.join();
    }

    let router = session.router(&store).with_trigger(handle.trigger_handle());
    let routed = route_lines(io::stdin().lock(), &router);
    tracing::info!(routed, "end of event input; draining queue");

    let drained = wait_until_drained(&store, &handle);
    handle.shutdown();
    drained
}

/// Routes one JSON event per line. Undecodable lines are skipped with a
/// warning; a read error ends the input. Returns the number of events routed.
fn route_lines(mut reader: impl BufRead, router: &EventRouter) -> usize {
    let mut routed = 0;
    let mut buf = Vec::new();
    for line_no in 1.. {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {}
            Err(err) => {
                tracing::error!(line = line_no, error = %err, "could not read event input; stopping");
                break;
            }
        }
        let line = match std::str::from_utf8(&buf) {
            Ok(line) => line.trim(),
            Err(err) => {
                tracing::warn!(line = line_no, error = %err, "skipping event line that is not UTF-8");
                continue;
            }
        };
        if line.is_empty() {
            continue;
        }
        let event = match serde_json::from_str::<Event>(line) {
            Ok(event) => event,
            Err(err) => {
                tracing::warn!(line = line_no, error = %err, "skipping undecodable event");
                continue;
            }
        };
        match router.route(&event) {
            Ok(_) => routed += 1,
            Err(err) => tracing::error!(event_id = %event.id, error = %err, "event not routed"),
        }
    }
    routed
}

/// Keeps the loop running until nothing is pending or running.
fn wait_until_drained(store: &JobStore, handle: &DispatcherHandle) -> Result<()> {
    let interval = handle.dispatcher().config().poll_interval;
    loop {
        let stats = store.stats()?;
        if stats.pending == 0 && stats.running == 0 {
            return Ok(());
        }
        handle.trigger();
        thread::sleep(interval.min(Duration::from_millis(200)));
    }
}

pub fn ingest(session: &Session, source: &Path) -> Result<()> {
    let event = read_event(source)?;
    let store = session.open_store()?;
    let report = session.router(&store).route(&event)?;
    print_route_report(&event, &report);
    if !report.failed.is_empty() {
        bail!("{} action(s) could not be queued", report.failed.len());
    }
    Ok(())
}

pub fn match_event(session: &Session, source: &Path) -> Result<()> {
    let event = read_event(source)?;
    let matched = find_matching_mappings(&event, &session.config.mappings)?;
    if matched.is_empty() {
        println!("No mapping matches event {} ({})", event.id, event.event_type);
        return Ok(());
    }
    for mapping in matched {
        println!("{}: {}", mapping.label(), mapping.actions.join(", "));
    }
    Ok(())
}

pub fn stats(session: &Session) -> Result<()> {
    let stats = session.open_store()?.stats()?;
    println!("pending: {}", stats.pending);
    println!("running: {}", stats.running);
    println!("completed: {}", stats.completed);
    println!("failed: {}", stats.failed);
    Ok(())
}

pub fn jobs(session: &Session, status: Option<JobStatus>, limit: usize) -> Result<()> {
    let jobs = session.open_store()?.list_jobs(status, limit)?;
    if jobs.is_empty() {
        println!("No jobs");
        return Ok(());
    }
    for job in jobs {
        println!(
            "{}\t{}\t{}\t{}",
            job.id,
            job.status,
            job.action_name,
            format_ms(job.created_at)
        );
    }
    Ok(())
}

pub fn show(session: &Session, id: JobId) -> Result<()> {
    let Some(job) = session.open_store()?.get_job(id)? else {
        bail!("job {id} not found");
    };
    print_job(&job)
}

pub fn purge(session: &Session, older_than_days: u32) -> Result<()> {
    let removed = session.open_store()?.purge_older_than(older_than_days)?;
    println!("Purged {removed} job(s) finished more than {older_than_days} day(s) ago");
    Ok(())
}

fn read_event(source: &Path) -> Result<Event> {
    let raw = if source == Path::new("-") {
        let mut buf = String::new();
        io::stdin()
            .read_to_string(&mut buf)
            .context("read event from stdin")?;
        buf
    } else {
        std::fs::read_to_string(source)
            .with_context(|| format!("read event {}", source.display()))?
    };
    serde_json::from_str(&raw).with_context(|| format!("parse event {}", source.display()))
}

fn print_route_report(event: &Event, report: &RouteReport) {
    if report.matched_mappings.is_empty() {
        println!("No mapping matches event {} ({})", event.id, event.event_type);
        return;
    }
    for (action, job_id) in &report.queued {
        println!("queued job {job_id}: {action}");
    }
    for (action, error) in &report.failed {
        println!("failed to queue {action}: {error}");
    }
}

fn print_job(job: &Job) -> Result<()> {
    println!("id: {}", job.id);
    println!("action: {}", job.action_name);
    println!("status: {}", job.status);
    println!("created_at: {}", format_ms(job.created_at));
    if let Some(ts) = job.started_at {
        println!("started_at: {}", format_ms(ts));
    }
    if let Some(ts) = job.completed_at {
        println!("completed_at: {}", format_ms(ts));
    }
    if let Some(error) = &job.error {
        println!("error: {error}");
    }
    if let Some(log_file) = &job.log_file {
        println!("log_file: {log_file}");
    }
    let event = serde_json::to_string_pretty(&job.event()?)?;
    println!("event:\n{event}");
    Ok(())
}

fn format_ms(ms: i64) -> String {
    DateTime::from_timestamp_millis(ms)
        .map(|ts| ts.to_rfc3339())
        .unwrap_or_else(|| ms.to_string())
}
