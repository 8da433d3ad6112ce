use crate::events::Event;
use regex::Regex;
use serde::Deserialize;
use serde_json::{Map, Value};

/// Predicate keys in the order they are looked up. A path filter that carries
/// several of them is evaluated with the first one found.
const PREDICATE_KEYS: [&str; 11] = [
    "equals",
    "contains",
    "matches",
    "startsWith",
    "endsWith",
    "exists",
    "in",
    "greaterThan",
    "lessThan",
    "any",
    "all",
];

#[derive(Debug, thiserror::Error)]
pub enum FilterError {
    #[error("invalid regex `{pattern}` in `matches` filter on `{path}`: {source}")]
    InvalidRegex {
        path: String,
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("unrecognized filter shape: {0}")]
    UnknownShape(String),
    #[error("`{predicate}` filter on `{path}` expects {expected}")]
    InvalidOperand {
        path: String,
        predicate: &'static str,
        expected: &'static str,
    },
}

/// One filter of a mapping. Path-shaped when the raw object has a `path` key,
/// legacy-shaped otherwise.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(from = "Map<String, Value>")]
pub enum FilterExpression {
    Path(PathFilter),
    Legacy(LegacyFilter),
    Unknown(Map<String, Value>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PathFilter {
    pub path: String,
    pub predicate: Predicate,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Equals(Value),
    Contains(Value),
    Matches(Value),
    StartsWith(Value),
    EndsWith(Value),
    Exists(Value),
    In(Value),
    GreaterThan(Value),
    LessThan(Value),
    Any(Value),
    All(Value),
}

#[derive(Debug, Clone, PartialEq)]
pub enum LegacyFilter {
    Label(Value),
    State(Value),
    Author(Value),
    Draft(Value),
}

impl From<Map<String, Value>> for FilterExpression {
    fn from(raw: Map<String, Value>) -> Self {
        match raw.get("path") {
            Some(Value::String(path)) => match Predicate::from_raw(&raw) {
                Some(predicate) => FilterExpression::Path(PathFilter {
                    path: path.clone(),
                    predicate,
                }),
                None => FilterExpression::Unknown(raw),
            },
            Some(_) => FilterExpression::Unknown(raw),
            None => match LegacyFilter::from_raw(&raw) {
                Some(legacy) => FilterExpression::Legacy(legacy),
                None => FilterExpression::Unknown(raw),
            },
        }
    }
}

impl Predicate {
    fn from_raw(raw: &Map<String, Value>) -> Option<Self> {
        PREDICATE_KEYS.iter().find_map(|key| {
            let operand = raw.get(*key)?.clone();
            Some(match *key {
                "equals" => Predicate::Equals(operand),
                "contains" => Predicate::Contains(operand),
                "matches" => Predicate::Matches(operand),
                "startsWith" => Predicate::StartsWith(operand),
                "endsWith" => Predicate::EndsWith(operand),
                "exists" => Predicate::Exists(operand),
                "in" => Predicate::In(operand),
                "greaterThan" => Predicate::GreaterThan(operand),
                "lessThan" => Predicate::LessThan(operand),
                "any" => Predicate::Any(operand),
                _ => Predicate::All(operand),
            })
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Predicate::Equals(_) => "equals",
            Predicate::Contains(_) => "contains",
            Predicate::Matches(_) => "matches",
            Predicate::StartsWith(_) => "startsWith",
            Predicate::EndsWith(_) => "endsWith",
            Predicate::Exists(_) => "exists",
            Predicate::In(_) => "in",
            Predicate::GreaterThan(_) => "greaterThan",
            Predicate::LessThan(_) => "lessThan",
            Predicate::Any(_) => "any",
            Predicate::All(_) => "all",
        }
    }

    /// Tests a resolved (present, non-null) value.
    fn test(&self, path: &str, value: &Value) -> Result<bool, FilterError> {
        Ok(match self {
            Predicate::Equals(expected) => values_equal(value, expected),
            Predicate::Contains(needle) => both_str(value, needle, |v, n| v.contains(n)),
            Predicate::Matches(pattern) => {
                let Some(pattern) = pattern.as_str() else {
                    return Ok(false);
                };
                let re = compile(path, pattern)?;
                value.as_str().is_some_and(|v| re.is_match(v))
            }
            Predicate::StartsWith(prefix) => both_str(value, prefix, |v, p| v.starts_with(p)),
            Predicate::EndsWith(suffix) => both_str(value, suffix, |v, s| v.ends_with(s)),
            Predicate::Exists(expected) => expected.as_bool() == Some(true),
            Predicate::In(options) => options
                .as_array()
                .is_some_and(|options| options.iter().any(|o| values_equal(value, o))),
            Predicate::GreaterThan(bound) => both_f64(value, bound, |v, b| v > b),
            Predicate::LessThan(bound) => both_f64(value, bound, |v, b| v < b),
            Predicate::Any(matcher) => value
                .as_array()
                .is_some_and(|items| items.iter().any(|item| element_matches(item, matcher))),
            Predicate::All(matcher) => value
                .as_array()
                .is_some_and(|items| items.iter().all(|item| element_matches(item, matcher))),
        })
    }

    fn validate(&self, path: &str) -> Result<(), FilterError> {
        let invalid = |expected: &'static str| FilterError::InvalidOperand {
            path: path.to_string(),
            predicate: self.name(),
            expected,
        };
        match self {
            Predicate::Contains(v) | Predicate::StartsWith(v) | Predicate::EndsWith(v)
                if !v.is_string() =>
            {
                Err(invalid("a string"))
            }
            Predicate::Matches(v) => match v.as_str() {
                Some(pattern) => compile(path, pattern).map(|_| ()),
                None => Err(invalid("a regex string")),
            },
            Predicate::Exists(v) if !v.is_boolean() => Err(invalid("a boolean")),
            Predicate::In(v) if !v.is_array() => Err(invalid("a list")),
            Predicate::GreaterThan(v) | Predicate::LessThan(v) if !v.is_number() => {
                Err(invalid("a number"))
            }
            _ => Ok(()),
        }
    }
}

impl LegacyFilter {
    fn from_raw(raw: &Map<String, Value>) -> Option<Self> {
        if let Some(v) = raw.get("label") {
            return Some(LegacyFilter::Label(v.clone()));
        }
        if let Some(v) = raw.get("state") {
            return Some(LegacyFilter::State(v.clone()));
        }
        if let Some(v) = raw.get("author") {
            return Some(LegacyFilter::Author(v.clone()));
        }
        raw.get("draft").map(|v| LegacyFilter::Draft(v.clone()))
    }

    fn test(&self, event: &Event) -> bool {
        match self {
            LegacyFilter::Label(expected) => {
                let Some(expected) = expected.as_str() else {
                    return false;
                };
                ["issue.labels", "pullRequest.labels"]
                    .iter()
                    .filter_map(|path| event.lookup(path))
                    .any(|labels| {
                        labels
                            .as_array()
                            .is_some_and(|labels| labels.iter().any(|l| label_name(l) == Some(expected)))
                    })
            }
            LegacyFilter::State(expected) => event
                .lookup("issue.state")
                .or_else(|| event.lookup("pullRequest.state"))
                .is_some_and(|state| values_equal(&state, expected)),
            LegacyFilter::Author(expected) => expected.as_str() == Some(event.actor.as_str()),
            LegacyFilter::Draft(expected) => event
                .lookup("pullRequest.draft")
                .is_some_and(|draft| values_equal(&draft, expected)),
        }
    }
}

impl FilterExpression {
    /// Load-time check: unknown shapes, mistyped operands and bad regexes are
    /// configuration errors.
    pub fn validate(&self) -> Result<(), FilterError> {
        match self {
            FilterExpression::Path(f) => f.predicate.validate(&f.path),
            FilterExpression::Legacy(LegacyFilter::Draft(v)) if !v.is_boolean() => {
                Err(FilterError::InvalidOperand {
                    path: "pullRequest.draft".to_string(),
                    predicate: "draft",
                    expected: "a boolean",
                })
            }
            FilterExpression::Legacy(_) => Ok(()),
            FilterExpression::Unknown(raw) => Err(FilterError::UnknownShape(
                Value::Object(raw.clone()).to_string(),
            )),
        }
    }
}

pub fn evaluate_filter(event: &Event, filter: &FilterExpression) -> Result<bool, FilterError> {
    match filter {
        FilterExpression::Path(f) => match event.lookup(&f.path) {
            Some(value) => f.predicate.test(&f.path, &value),
            None => Ok(matches!(&f.predicate, Predicate::Exists(v) if v.as_bool() == Some(false))),
        },
        FilterExpression::Legacy(f) => Ok(f.test(event)),
        FilterExpression::Unknown(raw) => {
            let shape = Value::Object(raw.clone());
            tracing::warn!(
                filter = %shape,
                event_id = %event.id,
                "unrecognized filter shape; treating as non-matching"
            );
            Ok(false)
        }
    }
}

fn compile(path: &str, pattern: &str) -> Result<Regex, FilterError> {
    Regex::new(pattern).map_err(|source| FilterError::InvalidRegex {
        path: path.to_string(),
        pattern: pattern.to_string(),
        source,
    })
}

fn both_str(value: &Value, operand: &Value, f: impl Fn(&str, &str) -> bool) -> bool {
    match (value.as_str(), operand.as_str()) {
        (Some(v), Some(o)) => f(v, o),
        _ => false,
    }
}

fn both_f64(value: &Value, operand: &Value, f: impl Fn(f64, f64) -> bool) -> bool {
    match (value, operand) {
        (Value::Number(v), Value::Number(o)) => match (v.as_f64(), o.as_f64()) {
            (Some(v), Some(o)) => f(v, o),
            _ => false,
        },
        _ => false,
    }
}

/// Object matchers compare key by key, one level deep; anything else is
/// compared directly.
fn element_matches(item: &Value, matcher: &Value) -> bool {
    match matcher {
        Value::Object(expected) => item.as_object().is_some_and(|item| {
            expected
                .iter()
                .all(|(k, v)| item.get(k).is_some_and(|actual| values_equal(actual, v)))
        }),
        other => values_equal(item, other),
    }
}

fn label_name(label: &Value) -> Option<&str> {
    match label {
        Value::String(name) => Some(name),
        Value::Object(obj) => obj.get("name").and_then(Value::as_str),
        _ => None,
    }
}

/// JSON equality where numbers compare by value, so `1` equals `1.0`.
pub(crate) fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        },
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(x, y)| values_equal(x, y))
        }
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x
                    .iter()
                    .all(|(k, v)| y.get(k).is_some_and(|other| values_equal(v, other)))
        }
        _ => a == b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn filter(raw: Value) -> FilterExpression {
        serde_json::from_value(raw).unwrap()
    }

    fn eval(ev: &Event, raw: Value) -> bool {
        evaluate_filter(ev, &filter(raw)).unwrap()
    }

    fn pr_event() -> Event {
        Event::new("pull_request.opened", "octocat", Some("acme/widgets")).with_data(
            "pullRequest",
            json!({
                "number": 12,
                "title": "Fix flaky retry loop",
                "labels": [{"name": "bug"}, {"name": "ci"}],
                "draft": false,
                "state": "open",
                "additions": 120,
                "reviewers": [
                    {"login": "hubot", "state": "approved"},
                    {"login": "monalisa", "state": "pending"}
                ]
            }),
        )
    }

    #[test]
    fn shape_is_decided_by_path_key() {
        assert!(matches!(
            filter(json!({"path": "actor", "equals": "x"})),
            FilterExpression::Path(_)
        ));
        assert!(matches!(
            filter(json!({"label": "bug"})),
            FilterExpression::Legacy(LegacyFilter::Label(_))
        ));
        assert!(matches!(
            filter(json!({"path": "actor", "sounds_like": "x"})),
            FilterExpression::Unknown(_)
        ));
        assert!(matches!(
            filter(json!({"colour": "red"})),
            FilterExpression::Unknown(_)
        ));
    }

    #[test]
    fn string_predicates() {
        let ev = pr_event();
        assert!(eval(&ev, json!({"path": "pullRequest.title", "contains": "retry"})));
        assert!(eval(&ev, json!({"path": "pullRequest.title", "startsWith": "Fix"})));
        assert!(eval(&ev, json!({"path": "pullRequest.title", "endsWith": "loop"})));
        assert!(eval(&ev, json!({"path": "pullRequest.title", "matches": "^Fix .* loop$"})));
        assert!(!eval(&ev, json!({"path": "pullRequest.number", "contains": "1"})));
        assert!(!eval(&ev, json!({"path": "pullRequest.number", "matches": "12"})));
    }

    #[test]
    fn numeric_predicates_require_numbers() {
        let ev = pr_event();
        assert!(eval(&ev, json!({"path": "pullRequest.additions", "greaterThan": 100})));
        assert!(eval(&ev, json!({"path": "pullRequest.additions", "lessThan": 120.5})));
        assert!(!eval(&ev, json!({"path": "pullRequest.additions", "greaterThan": 120})));
        assert!(!eval(&ev, json!({"path": "pullRequest.title", "greaterThan": 1})));
        assert!(eval(&ev, json!({"path": "pullRequest.number", "equals": 12.0})));
    }

    #[test]
    fn exists_and_absent_paths() {
        let ev = pr_event();
        assert!(eval(&ev, json!({"path": "pullRequest.draft", "exists": true})));
        assert!(eval(&ev, json!({"path": "issue.number", "exists": false})));
        assert!(!eval(&ev, json!({"path": "issue.number", "exists": true})));
        assert!(!eval(&ev, json!({"path": "issue.number", "equals": null})));
        assert!(!eval(&ev, json!({"path": "issue.labels", "all": "bug"})));
    }

    #[test]
    fn membership_and_array_predicates() {
        let ev = pr_event();
        assert!(eval(&ev, json!({"path": "pullRequest.state", "in": ["open", "reopened"]})));
        assert!(!eval(&ev, json!({"path": "pullRequest.state", "in": ["closed"]})));
        assert!(eval(
            &ev,
            json!({"path": "pullRequest.reviewers", "any": {"state": "approved"}})
        ));
        assert!(!eval(
            &ev,
            json!({"path": "pullRequest.reviewers", "all": {"state": "approved"}})
        ));
        assert!(!eval(
            &ev,
            json!({"path": "pullRequest.labels", "all": {"name": "bug"}})
        ));
        assert!(!eval(&ev, json!({"path": "pullRequest.title", "any": "F"})));
    }

    #[test]
    fn object_matcher_is_shallow() {
        let ev = Event::new("x", "a", None).with_data(
            "items",
            json!([{"meta": {"k": 1, "extra": true}}]),
        );
        assert!(!eval(&ev, json!({"path": "items", "any": {"meta": {"k": 1}}})));
        assert!(eval(
            &ev,
            json!({"path": "items", "any": {"meta": {"k": 1, "extra": true}}})
        ));
    }

    #[test]
    fn legacy_filters() {
        let ev = pr_event();
        assert!(eval(&ev, json!({"label": "bug"})));
        assert!(!eval(&ev, json!({"label": "docs"})));
        assert!(eval(&ev, json!({"state": "open"})));
        assert!(eval(&ev, json!({"author": "octocat"})));
        assert!(!eval(&ev, json!({"author": "hubot"})));
        assert!(eval(&ev, json!({"draft": false})));
        assert!(!eval(&ev, json!({"draft": true})));
    }

    #[test]
    fn legacy_state_prefers_issue() {
        let ev = pr_event().with_data("issue", json!({"state": "closed"}));
        assert!(eval(&ev, json!({"state": "closed"})));
        assert!(!eval(&ev, json!({"state": "open"})));
    }

    #[test]
    fn unknown_shape_is_false_not_error() {
        let ev = pr_event();
        assert!(!eval(&ev, json!({"path": "actor", "like": "octo"})));
        assert!(!eval(&ev, json!({"reviewer": "hubot"})));
    }

    #[test]
    fn first_predicate_key_wins() {
        let ev = pr_event();
        // `equals` precedes `contains` in lookup order.
        assert!(!eval(
            &ev,
            json!({"path": "pullRequest.title", "contains": "retry", "equals": "nope"})
        ));
    }

    #[test]
    fn validate_rejects_bad_operands_and_shapes() {
        let bad = [
            json!({"path": "a", "contains": 3}),
            json!({"path": "a", "exists": "yes"}),
            json!({"path": "a", "in": "open"}),
            json!({"path": "a", "greaterThan": "5"}),
            json!({"path": "a", "matches": "(["}),
            json!({"path": "a"}),
            json!({"draft": "no"}),
            json!({"milestone": "v1"}),
        ];
        for raw in bad {
            assert!(filter(raw.clone()).validate().is_err(), "{raw} should be rejected");
        }
        assert!(filter(json!({"path": "a", "matches": "^v\\d+$"})).validate().is_ok());
        assert!(filter(json!({"label": "bug"})).validate().is_ok());
    }
}
