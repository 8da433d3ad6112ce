//! Event-to-action matching.
//!
//! Pure functions: no state, no I/O. A mapping matches an event when its type
//! pattern accepts the event type, every filter accepts the event, and the
//! optional repository equals the event's repository.

pub mod filter;

pub use filter::{
    FilterError, FilterExpression, LegacyFilter, PathFilter, Predicate, evaluate_filter,
};

use crate::events::Event;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct EventMapping {
    #[serde(default)]
    pub name: Option<String>,
    pub event: String,
    #[serde(default)]
    pub filters: Vec<FilterExpression>,
    #[serde(default)]
    pub repository: Option<String>,
    pub actions: Vec<String>,
}

impl EventMapping {
    /// Label used in logs: the configured name, else the event pattern.
    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.event)
    }
}

/// Every mapping, in input order, that matches `event`.
pub fn find_matching_mappings<'a>(
    event: &Event,
    mappings: &'a [EventMapping],
) -> Result<Vec<&'a EventMapping>, FilterError> {
    let mut matched = Vec::new();
    for mapping in mappings {
        if matches(event, mapping)? {
            matched.push(mapping);
        }
    }
    if matched.is_empty() {
        tracing::debug!(
            event_id = %event.id,
            event_type = %event.event_type,
            "no mapping matched event"
        );
    }
    Ok(matched)
}

pub fn matches(event: &Event, mapping: &EventMapping) -> Result<bool, FilterError> {
    if !event_type_matches(&mapping.event, &event.event_type) {
        return Ok(false);
    }
    for filter in &mapping.filters {
        if !evaluate_filter(event, filter)? {
            return Ok(false);
        }
    }
    if let Some(repository) = mapping.repository.as_deref()
        && event.repository.as_deref() != Some(repository)
    {
        return Ok(false);
    }
    Ok(true)
}

/// `*` matches everything, `prefix.*` matches any type starting with `prefix.`,
/// anything else must be equal. Case-sensitive.
pub fn event_type_matches(pattern: &str, event_type: &str) -> bool {
    if pattern == "*" || pattern == event_type {
        return true;
    }
    match pattern.strip_suffix(".*") {
        Some(prefix) => event_type
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('.')),
        None => false,
    }
}
