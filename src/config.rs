use crate::actions::{ActionCommand, DEFAULT_ACTION_TIMEOUT_SECS};
use crate::dispatch::DispatcherConfig;
use crate::matcher::{EventMapping, FilterExpression};
use anyhow::{Context, Result, anyhow, bail};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = ".hookq/config.toml";
const CONFIG_VERSION: u32 = 1;

#[derive(Debug, Clone)]
pub struct HookqConfig {
    pub version: u32,
    pub dispatcher: DispatcherSettings,
    pub storage: StorageConfig,
    pub actions: BTreeMap<String, ActionConfig>,
    pub mappings: Vec<EventMapping>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherSettings {
    pub max_concurrent: usize,
    pub poll_interval_secs: u64,
    pub retention_days: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageConfig {
    pub state_db: PathBuf,
    pub log_dir: PathBuf,
    pub lock_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionConfig {
    pub command: String,
    pub timeout_secs: u64,
    pub workdir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawConfig {
    version: Option<u32>,
    dispatcher: Option<RawDispatcherConfig>,
    storage: Option<RawStorageConfig>,
    actions: Option<BTreeMap<String, RawActionConfig>>,
    mappings: Option<Vec<RawMapping>>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawDispatcherConfig {
    max_concurrent: Option<i64>,
    poll_interval_secs: Option<i64>,
    retention_days: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawStorageConfig {
    state_db: Option<String>,
    log_dir: Option<String>,
    lock_dir: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawActionConfig {
    command: Option<String>,
    timeout_secs: Option<i64>,
    workdir: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawMapping {
    name: Option<String>,
    event: Option<String>,
    repository: Option<String>,
    actions: Option<Vec<String>>,
    filters: Option<Vec<FilterExpression>>,
}

impl Default for HookqConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            dispatcher: DispatcherSettings::default(),
            storage: validate_storage(None),
            actions: BTreeMap::new(),
            mappings: Vec::new(),
        }
    }
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            max_concurrent: 2,
            poll_interval_secs: 5,
            retention_days: None,
        }
    }
}

impl HookqConfig {
    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            max_concurrent: self.dispatcher.max_concurrent,
            poll_interval: Duration::from_secs(self.dispatcher.poll_interval_secs),
        }
    }

    pub fn action_commands(&self) -> BTreeMap<String, ActionCommand> {
        self.actions
            .iter()
            .map(|(name, action)| {
                (
                    name.clone(),
                    ActionCommand {
                        command: action.command.clone(),
                        timeout: Duration::from_secs(action.timeout_secs),
                        workdir: action.workdir.clone(),
                    },
                )
            })
            .collect()
    }
}

pub fn load_config(path: &Path) -> Result<HookqConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read config {}", path.display()))?;
    parse_config(&raw, path)
}

pub fn parse_config(raw: &str, path: &Path) -> Result<HookqConfig> {
    let parsed: RawConfig =
        toml::from_str(raw).with_context(|| format!("parse {}", path.display()))?;
    validate_config(parsed, path)
}

fn validate_config(raw: RawConfig, path: &Path) -> Result<HookqConfig> {
    let version = raw
        .version
        .ok_or_else(|| anyhow!("{} missing required `version`", path.display()))?;
    if version != CONFIG_VERSION {
        bail!(
            "{} has unsupported version {version}; expected version = {CONFIG_VERSION}",
            path.display()
        );
    }

    let dispatcher = validate_dispatcher(raw.dispatcher, path)?;
    let storage = validate_storage(raw.storage);

    let mut actions = BTreeMap::new();
    for (name, action) in raw.actions.unwrap_or_default() {
        actions.insert(name.clone(), validate_action(&name, action, path)?);
    }

    let mut mappings = Vec::new();
    for (idx, mapping) in raw.mappings.unwrap_or_default().into_iter().enumerate() {
        mappings.push(validate_mapping(mapping, &actions, path, idx)?);
    }

    Ok(HookqConfig {
        version,
        dispatcher,
        storage,
        actions,
        mappings,
    })
}

fn validate_dispatcher(raw: Option<RawDispatcherConfig>, path: &Path) -> Result<DispatcherSettings> {
    let Some(raw) = raw else {
        return Ok(DispatcherSettings::default());
    };
    let max_concurrent = positive(raw.max_concurrent, 2, "[dispatcher].max_concurrent", path)?;
    let poll_interval_secs =
        positive(raw.poll_interval_secs, 5, "[dispatcher].poll_interval_secs", path)?;
    let retention_days = raw
        .retention_days
        .map(|days| {
            u32::try_from(days).map_err(|_| {
                anyhow!(
                    "{} has invalid `[dispatcher].retention_days = {days}`; expected a non-negative integer",
                    path.display()
                )
            })
        })
        .transpose()?;

    Ok(DispatcherSettings {
        max_concurrent: usize::try_from(max_concurrent)?,
        poll_interval_secs,
        retention_days,
    })
}

fn positive(value: Option<i64>, default: u64, key: &str, path: &Path) -> Result<u64> {
    match value {
        None => Ok(default),
        Some(v) if v >= 1 => Ok(v as u64),
        Some(v) => bail!("{} has invalid `{key} = {v}`; expected >= 1", path.display()),
    }
}

fn validate_storage(raw: Option<RawStorageConfig>) -> StorageConfig {
    let raw = raw.unwrap_or(RawStorageConfig {
        state_db: None,
        log_dir: None,
        lock_dir: None,
    });
    let state_dir = default_state_dir();
    StorageConfig {
        state_db: sanitize_path(raw.state_db).unwrap_or_else(|| state_dir.join("state.db")),
        log_dir: sanitize_path(raw.log_dir).unwrap_or_else(|| state_dir.join("logs")),
        lock_dir: sanitize_path(raw.lock_dir).unwrap_or_else(|| state_dir.join("locks")),
    }
}

fn validate_action(name: &str, raw: RawActionConfig, path: &Path) -> Result<ActionConfig> {
    if name.trim().is_empty() {
        bail!("{} has an action with an empty name", path.display());
    }
    let command = sanitize_optional(raw.command).ok_or_else(|| {
        anyhow!(
            "{} missing `command` for `[actions.{name}]`",
            path.display()
        )
    })?;
    let timeout_secs = positive(
        raw.timeout_secs,
        DEFAULT_ACTION_TIMEOUT_SECS,
        &format!("[actions.{name}].timeout_secs"),
        path,
    )?;
    Ok(ActionConfig {
        command,
        timeout_secs,
        workdir: sanitize_path(raw.workdir),
    })
}

fn validate_mapping(
    raw: RawMapping,
    actions: &BTreeMap<String, ActionConfig>,
    path: &Path,
    idx: usize,
) -> Result<EventMapping> {
    let event = sanitize_optional(raw.event).ok_or_else(|| {
        anyhow!(
            "{} missing `event` for `[[mappings]]` at index {idx}",
            path.display()
        )
    })?;
    let action_names = raw.actions.unwrap_or_default();
    if action_names.is_empty() {
        bail!(
            "{} has empty `actions` for `[[mappings]]` at index {idx}",
            path.display()
        );
    }
    if let Some(unknown) = action_names.iter().find(|a| !actions.contains_key(*a)) {
        bail!(
            "{} references undefined action `{unknown}` in `[[mappings]]` at index {idx}",
            path.display()
        );
    }

    let filters = raw.filters.unwrap_or_default();
    for (filter_idx, filter) in filters.iter().enumerate() {
        filter.validate().with_context(|| {
            format!(
                "{} invalid filter {filter_idx} in `[[mappings]]` at index {idx}",
                path.display()
            )
        })?;
    }

    Ok(EventMapping {
        name: sanitize_optional(raw.name),
        event,
        filters,
        repository: sanitize_optional(raw.repository),
        actions: action_names,
    })
}

/// `$XDG_STATE_HOME/hookq`, falling back to `~/.local/state/hookq`, then to
/// `.hookq/state` under the working directory.
pub fn default_state_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os("XDG_STATE_HOME").filter(|v| !v.is_empty()) {
        return PathBuf::from(dir).join("hookq");
    }
    if let Some(home) = std::env::var_os("HOME").filter(|v| !v.is_empty()) {
        return PathBuf::from(home).join(".local").join("state").join("hookq");
    }
    PathBuf::from(".hookq").join("state")
}

fn sanitize_optional(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn sanitize_path(value: Option<String>) -> Option<PathBuf> {
    sanitize_optional(value).map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::{FilterExpression, Predicate};
    use tempfile::tempdir;

    fn parse(raw: &str) -> Result<HookqConfig> {
        parse_config(raw, Path::new("config.toml"))
    }

    const FULL: &str = r#"
version = 1

[dispatcher]
max_concurrent = 4
poll_interval_secs = 2
retention_days = 30

[storage]
state_db = "/var/lib/hookq/state.db"
log_dir = "/var/log/hookq"
lock_dir = "/var/lib/hookq/locks"

[actions.triage]
command = "./scripts/triage.sh"
timeout_secs = 600

[actions.audit]
command = "echo audit"
workdir = "/srv/checkouts"

[[mappings]]
name = "bugs"
event = "issue.opened"
repository = "acme/widgets"
actions = ["triage", "audit"]
filters = [{ path = "issue.labels", any = "bug" }, { label = "p1" }]

[[mappings]]
event = "*"
actions = ["audit"]
"#;

    #[test]
    fn parses_full_config() {
        let cfg = parse(FULL).unwrap();
        assert_eq!(cfg.version, 1);
        assert_eq!(
            cfg.dispatcher,
            DispatcherSettings {
                max_concurrent: 4,
                poll_interval_secs: 2,
                retention_days: Some(30),
            }
        );
        assert_eq!(cfg.storage.log_dir, PathBuf::from("/var/log/hookq"));
        assert_eq!(cfg.actions["triage"].timeout_secs, 600);
        assert_eq!(cfg.actions["audit"].timeout_secs, DEFAULT_ACTION_TIMEOUT_SECS);
        assert_eq!(
            cfg.actions["audit"].workdir,
            Some(PathBuf::from("/srv/checkouts"))
        );

        assert_eq!(cfg.mappings.len(), 2);
        let bugs = &cfg.mappings[0];
        assert_eq!(bugs.label(), "bugs");
        assert_eq!(bugs.repository.as_deref(), Some("acme/widgets"));
        assert!(matches!(
            &bugs.filters[0],
            FilterExpression::Path(f) if matches!(f.predicate, Predicate::Any(_))
        ));
        assert!(matches!(bugs.filters[1], FilterExpression::Legacy(_)));
        assert_eq!(cfg.mappings[1].label(), "*");

        let dispatcher = cfg.dispatcher_config();
        assert_eq!(dispatcher.max_concurrent, 4);
        assert_eq!(dispatcher.poll_interval, Duration::from_secs(2));
        assert_eq!(
            cfg.action_commands()["triage"].timeout,
            Duration::from_secs(600)
        );
    }

    #[test]
    fn minimal_config_uses_defaults() {
        let cfg = parse("version = 1").unwrap();
        assert_eq!(cfg.dispatcher.max_concurrent, 2);
        assert_eq!(cfg.dispatcher.poll_interval_secs, 5);
        assert!(cfg.dispatcher.retention_days.is_none());
        assert!(cfg.storage.state_db.ends_with("state.db"));
        assert!(cfg.mappings.is_empty());
    }

    #[test]
    fn rejects_missing_or_wrong_version() {
        let err = parse("[dispatcher]\nmax_concurrent = 1").unwrap_err();
        assert!(format!("{err}").contains("missing required `version`"));
        let err = parse("version = 2").unwrap_err();
        assert!(format!("{err}").contains("unsupported version"));
    }

    #[test]
    fn rejects_non_positive_limits() {
        let err = parse("version = 1\n[dispatcher]\nmax_concurrent = 0").unwrap_err();
        assert!(format!("{err}").contains("max_concurrent = 0"));
        let err = parse("version = 1\n[dispatcher]\npoll_interval_secs = -1").unwrap_err();
        assert!(format!("{err}").contains("poll_interval_secs = -1"));
    }

    #[test]
    fn rejects_undefined_action_reference() {
        let err = parse(
            r#"
version = 1
[[mappings]]
event = "push"
actions = ["deploy"]
"#,
        )
        .unwrap_err();
        assert!(format!("{err}").contains("undefined action `deploy`"));
    }

    #[test]
    fn rejects_mapping_without_actions_or_event() {
        let err = parse(
            r#"
version = 1
[actions.build]
command = "make"
[[mappings]]
event = "push"
actions = []
"#,
        )
        .unwrap_err();
        assert!(format!("{err}").contains("empty `actions`"));

        let err = parse(
            r#"
version = 1
[actions.build]
command = "make"
[[mappings]]
event = "  "
actions = ["build"]
"#,
        )
        .unwrap_err();
        assert!(format!("{err}").contains("missing `event`"));
    }

    #[test]
    fn rejects_unknown_filter_shape_and_bad_regex() {
        let base = r#"
version = 1
[actions.build]
command = "make"
[[mappings]]
event = "push"
actions = ["build"]
"#;
        let err = parse(&format!("{base}filters = [{{ path = \"ref\", near = 1 }}]")).unwrap_err();
        assert!(format!("{err:#}").contains("unrecognized filter shape"));

        let err =
            parse(&format!("{base}filters = [{{ path = \"ref\", matches = \"(\" }}]")).unwrap_err();
        assert!(format!("{err:#}").contains("invalid regex"));
    }

    #[test]
    fn rejects_action_without_command() {
        let err = parse("version = 1\n[actions.build]\ntimeout_secs = 5").unwrap_err();
        assert!(format!("{err}").contains("missing `command` for `[actions.build]`"));
    }

    #[test]
    fn load_reads_from_disk() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join(".hookq").join("config.toml");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, FULL).unwrap();
        assert_eq!(load_config(&path).unwrap().mappings.len(), 2);
        assert!(load_config(&tmp.path().join("missing.toml")).is_err());
    }
}
