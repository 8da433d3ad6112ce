//! Turns an inbound event into queued jobs.

use crate::dispatch::DispatchTrigger;
use crate::events::Event;
use crate::matcher::{EventMapping, FilterError, find_matching_mappings};
use crate::store::{JobId, JobStore};
use anyhow::Result;
use std::sync::Arc;

/// Receives one (action, event) pair per matched action.
pub trait ActionSink: Send + Sync {
    fn submit(&self, action: &str, event: &Event) -> Result<JobId>;
}

/// Sink that persists each submission as a pending job.
pub struct QueueSink {
    store: Arc<JobStore>,
}

impl QueueSink {
    pub fn new(store: Arc<JobStore>) -> Self {
        Self { store }
    }
}

impl ActionSink for QueueSink {
    fn submit(&self, action: &str, event: &Event) -> Result<JobId> {
        self.store.enqueue(action, event)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteReport {
    pub matched_mappings: Vec<String>,
    pub queued: Vec<(String, JobId)>,
    pub failed: Vec<(String, String)>,
}

pub struct EventRouter {
    mappings: Vec<EventMapping>,
    sink: Arc<dyn ActionSink>,
    trigger: Option<DispatchTrigger>,
}

impl EventRouter {
    pub fn new(mappings: Vec<EventMapping>, sink: Arc<dyn ActionSink>) -> Self {
        Self {
            mappings,
            sink,
            trigger: None,
        }
    }

    pub fn with_trigger(mut self, trigger: DispatchTrigger) -> Self {
        self.trigger = Some(trigger);
        self
    }

    /// Submits every action of every matching mapping, in order. A failed
    /// submission is logged and recorded; the remaining actions still run.
    pub fn route(&self, event: &Event) -> Result<RouteReport, FilterError> {
        let matched = find_matching_mappings(event, &self.mappings)?;
        let mut report = RouteReport::default();

        for mapping in matched {
            report.matched_mappings.push(mapping.label().to_string());
            for action in &mapping.actions {
                match self.sink.submit(action, event) {
                    Ok(job_id) => {
                        tracing::info!(
                            job_id,
                            action = %action,
                            mapping = mapping.label(),
                            event_id = %event.id,
                            "job queued"
                        );
                        report.queued.push((action.clone(), job_id));
                    }
                    Err(err) => {
                        let message = format!("{err:#}");
                        tracing::error!(
                            action = %action,
                            mapping = mapping.label(),
                            event_id = %event.id,
                            error = %message,
                            "could not queue action"
                        );
                        report.failed.push((action.clone(), message));
                    }
                }
            }
        }

        if !report.queued.is_empty()
            && let Some(trigger) = &self.trigger
            && !trigger.trigger()
        {
            tracing::debug!("dispatcher not running; jobs wait for the next start");
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::JobStatus;
    use anyhow::bail;
    use serde_json::json;

    fn mapping(event: &str, actions: &[&str]) -> EventMapping {
        serde_json::from_value(json!({ "event": event, "actions": actions })).unwrap()
    }

    struct FlakySink {
        store: Arc<JobStore>,
    }

    impl ActionSink for FlakySink {
        fn submit(&self, action: &str, event: &Event) -> Result<JobId> {
            if action == "broken" {
                bail!("sink rejected `{action}`");
            }
            self.store.enqueue(action, event)
        }
    }

    #[test]
    fn queues_every_action_of_every_match() {
        let store = Arc::new(JobStore::open_in_memory().unwrap());
        let router = EventRouter::new(
            vec![
                mapping("issue.*", &["triage", "label"]),
                mapping("push", &["build"]),
                mapping("*", &["audit"]),
            ],
            Arc::new(QueueSink::new(Arc::clone(&store))),
        );
        let report = router
            .route(&Event::new("issue.opened", "octocat", Some("acme/widgets")))
            .unwrap();
        let actions = report
            .queued
            .iter()
            .map(|(a, _)| a.as_str())
            .collect::<Vec<_>>();
        assert_eq!(actions, vec!["triage", "label", "audit"]);
        assert_eq!(store.stats().unwrap().pending, 3);
    }

    #[test]
    fn one_failed_action_does_not_stop_siblings() {
        let store = Arc::new(JobStore::open_in_memory().unwrap());
        let router = EventRouter::new(
            vec![mapping("push", &["broken", "build"])],
            Arc::new(FlakySink {
                store: Arc::clone(&store),
            }),
        );
        let report = router.route(&Event::new("push", "a", None)).unwrap();
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.queued.len(), 1);
        let jobs = store.list_jobs(Some(JobStatus::Pending), 10).unwrap();
        assert_eq!(jobs[0].action_name, "build");
    }

    #[test]
    fn unmatched_event_queues_nothing() {
        let store = Arc::new(JobStore::open_in_memory().unwrap());
        let router = EventRouter::new(
            vec![mapping("push", &["build"])],
            Arc::new(QueueSink::new(Arc::clone(&store))),
        );
        let report = router.route(&Event::new("issue.opened", "a", None)).unwrap();
        assert!(report.matched_mappings.is_empty());
        assert_eq!(store.stats().unwrap().pending, 0);
    }
}
