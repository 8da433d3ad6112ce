use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::borrow::Cow;
use uuid::Uuid;

/// A normalized GitHub/Jira occurrence.
///
/// The typed fields are the ones the dispatcher core relies on. Everything else
/// the source adapter produced (`issue`, `pullRequest`, arbitrary payload) is
/// kept verbatim in `data` and reached through [`Event::lookup`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    #[serde(default = "new_event_id")]
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default)]
    pub actor: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
    #[serde(flatten)]
    pub data: Map<String, Value>,
}

fn new_event_id() -> String {
    Uuid::new_v4().to_string()
}

impl Event {
    pub fn new(event_type: &str, actor: &str, repository: Option<&str>) -> Self {
        Self {
            id: new_event_id(),
            event_type: event_type.to_string(),
            source: None,
            actor: actor.to_string(),
            repository: repository.map(ToString::to_string),
            data: Map::new(),
        }
    }

    pub fn with_data(mut self, key: &str, value: Value) -> Self {
        self.data.insert(key.to_string(), value);
        self
    }

    /// Resolves a dot-separated path against the event.
    ///
    /// Returns `None` when any segment is missing or null. Numeric segments
    /// index into arrays. Typed top-level fields are scalars, so a path that
    /// continues past one of them resolves to nothing.
    pub fn lookup(&self, path: &str) -> Option<Cow<'_, Value>> {
        let mut segments = path.split('.');
        let head = segments.next()?;
        let root = match head {
            "id" => Cow::Owned(Value::String(self.id.clone())),
            "type" => Cow::Owned(Value::String(self.event_type.clone())),
            "actor" => Cow::Owned(Value::String(self.actor.clone())),
            "source" => Cow::Owned(Value::String(self.source.clone()?)),
            "repository" => Cow::Owned(Value::String(self.repository.clone()?)),
            other => Cow::Borrowed(self.data.get(other)?),
        };

        let rest = segments.collect::<Vec<_>>();
        if rest.is_empty() {
            return (!root.is_null()).then_some(root);
        }
        match root {
            Cow::Borrowed(value) => walk(value, &rest).map(Cow::Borrowed),
            Cow::Owned(_) => None,
        }
    }
}

fn walk<'a>(mut current: &'a Value, segments: &[&str]) -> Option<&'a Value> {
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(*segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
        if current.is_null() {
            return None;
        }
    }
    Some(current)
}
