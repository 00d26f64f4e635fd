//! Master configuration.

use crate::canceller::{CancelRule, CancellerConfig};
use crate::coordinator::{BuilderConfig, CoordinatorConfig, PolicySettings, WorkerConfig};
use crate::cron::Recurrence;
use crate::filter::{AlwaysImportant, ChangeFilter, ChangeFilterConfig, FileImportance, ImportantFiles};
use crate::schedulers::{
    AnyBranchScheduler, BaseConfig, CodebaseConfig, DependentScheduler, NightlyScheduler,
    PeriodicScheduler, Scheduler, SingleBranchScheduler, TriggerableScheduler, TryJobdirScheduler,
    TryUserpassScheduler,
};
use crate::supervisor::validate_schedulers;
use bosun_core::properties::Properties;
use bosun_core::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Complete master configuration, as loaded from YAML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MasterConfig {
    pub master: MasterSection,
    pub database: DatabaseSection,
    pub api: ApiSection,
    pub executor: ExecutorSection,
    pub logging: LoggingSection,
    pub workers: Vec<WorkerConfig>,
    pub builders: Vec<BuilderConfig>,
    pub coordinator: PolicySettings,
    pub schedulers: Vec<SchedulerConfig>,
    pub canceller: CancellerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MasterSection {
    pub name: String,
    /// Claims older than this are released by any master.
    pub claim_timeout_secs: u64,
    pub reclaim_interval_secs: u64,
    pub expiry_check_interval_secs: u64,
}

impl Default for MasterSection {
    fn default() -> Self {
        Self {
            name: "bosun".to_string(),
            claim_timeout_secs: 300,
            reclaim_interval_secs: 60,
            expiry_check_interval_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DatabaseSection {
    /// PostgreSQL URL. Absent means an in-process store.
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ApiSection {
    pub listen: SocketAddr,
}

impl Default for ApiSection {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 8010)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExecutorSection {
    /// Build assignments are POSTed here. Absent means builds are only
    /// logged.
    pub webhook_url: Option<String>,
    pub timeout_secs: u64,
}

impl Default for ExecutorSection {
    fn default() -> Self {
        Self {
            webhook_url: None,
            timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingSection {
    pub format: LogFormat,
    /// `EnvFilter` directives; `RUST_LOG` wins when set.
    pub filter: Option<String>,
}

/// Fields every scheduler entry carries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommonConfig {
    pub name: String,
    pub builder_names: Vec<String>,
    #[serde(default)]
    pub properties: BTreeMap<String, Value>,
    #[serde(default)]
    pub codebases: BTreeMap<String, CodebaseConfig>,
}

impl CommonConfig {
    fn base(&self) -> BaseConfig {
        BaseConfig::new(self.name.clone(), self.builder_names.clone())
            .with_properties(Properties::from_values(self.properties.clone(), "Scheduler"))
            .with_codebases(self.codebases.clone())
    }
}

/// How a scheduler decides which changes matter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImportanceConfig {
    /// A change is important iff any of its files matches one of these.
    #[serde(default)]
    pub important_files: Option<Vec<String>>,
    #[serde(default)]
    pub only_important: bool,
}

impl ImportanceConfig {
    fn build(&self) -> Result<Arc<dyn FileImportance>> {
        Ok(match &self.important_files {
            Some(patterns) => Arc::new(ImportantFiles::new(patterns)?),
            None => Arc::new(AlwaysImportant),
        })
    }
}

/// Longest configurable interval. Timers are added to change timestamps, so
/// the bound keeps that arithmetic in range.
const MAX_INTERVAL_SECS: u64 = 100 * 365 * 24 * 60 * 60;

fn seconds(field: &str, secs: u64) -> Result<chrono::Duration> {
    if secs > MAX_INTERVAL_SECS {
        return Err(Error::InvalidConfig(format!(
            "{field} out of range: {secs} (at most {MAX_INTERVAL_SECS})"
        )));
    }
    i64::try_from(secs)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .ok_or_else(|| Error::InvalidConfig(format!("{field} out of range: {secs}")))
}

fn change_filter(config: &Option<ChangeFilterConfig>) -> Result<ChangeFilter> {
    config
        .as_ref()
        .map_or_else(|| Ok(ChangeFilter::all()), ChangeFilterConfig::build)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SingleBranchConfig {
    #[serde(flatten)]
    pub common: CommonConfig,
    #[serde(default)]
    pub change_filter: Option<ChangeFilterConfig>,
    /// Absent means fire on every important change.
    #[serde(default)]
    pub tree_stable_timer_secs: Option<u64>,
    #[serde(flatten)]
    pub importance: ImportanceConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnyBranchConfig {
    #[serde(flatten)]
    pub common: CommonConfig,
    #[serde(default)]
    pub change_filter: Option<ChangeFilterConfig>,
    /// Absent means every branch.
    #[serde(default)]
    pub branches: Option<Vec<String>>,
    #[serde(default)]
    pub tree_stable_timer_secs: Option<u64>,
    #[serde(flatten)]
    pub importance: ImportanceConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NightlyConfig {
    #[serde(flatten)]
    pub common: CommonConfig,
    #[serde(default)]
    pub schedule: Recurrence,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub change_filter: Option<ChangeFilterConfig>,
    #[serde(default)]
    pub only_if_changed: bool,
    #[serde(default)]
    pub important_files: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeriodicConfig {
    #[serde(flatten)]
    pub common: CommonConfig,
    pub period_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependentConfig {
    #[serde(flatten)]
    pub common: CommonConfig,
    pub upstream: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerableConfig {
    #[serde(flatten)]
    pub common: CommonConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TryJobdirConfig {
    #[serde(flatten)]
    pub common: CommonConfig,
    pub jobdir: PathBuf,
    #[serde(default)]
    pub poll_interval_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserPass {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TryUserpassConfig {
    #[serde(flatten)]
    pub common: CommonConfig,
    pub userpass: Vec<UserPass>,
}

/// One entry of the `schedulers:` list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SchedulerConfig {
    SingleBranch(SingleBranchConfig),
    AnyBranch(AnyBranchConfig),
    Nightly(NightlyConfig),
    Periodic(PeriodicConfig),
    Dependent(DependentConfig),
    Triggerable(TriggerableConfig),
    TryJobdir(TryJobdirConfig),
    TryUserpass(TryUserpassConfig),
}

impl SchedulerConfig {
    pub fn common(&self) -> &CommonConfig {
        match self {
            SchedulerConfig::SingleBranch(c) => &c.common,
            SchedulerConfig::AnyBranch(c) => &c.common,
            SchedulerConfig::Nightly(c) => &c.common,
            SchedulerConfig::Periodic(c) => &c.common,
            SchedulerConfig::Dependent(c) => &c.common,
            SchedulerConfig::Triggerable(c) => &c.common,
            SchedulerConfig::TryJobdir(c) => &c.common,
            SchedulerConfig::TryUserpass(c) => &c.common,
        }
    }

    pub fn name(&self) -> &str {
        &self.common().name
    }

    pub fn build(&self) -> Result<Box<dyn Scheduler>> {
        let scheduler: Box<dyn Scheduler> = match self {
            SchedulerConfig::SingleBranch(c) => {
                let mut s = SingleBranchScheduler::new(c.common.base(), change_filter(&c.change_filter)?)
                    .with_importance(c.importance.build()?)
                    .with_only_important(c.importance.only_important);
                if let Some(secs) = c.tree_stable_timer_secs {
                    s = s.with_tree_stable_timer(seconds("tree_stable_timer_secs", secs)?);
                }
                Box::new(s)
            }
            SchedulerConfig::AnyBranch(c) => {
                let mut s = AnyBranchScheduler::new(c.common.base(), change_filter(&c.change_filter)?)
                    .with_importance(c.importance.build()?)
                    .with_only_important(c.importance.only_important);
                if let Some(branches) = &c.branches {
                    s = s.with_branches(branches.clone());
                }
                if let Some(secs) = c.tree_stable_timer_secs {
                    s = s.with_tree_stable_timer(seconds("tree_stable_timer_secs", secs)?);
                }
                Box::new(s)
            }
            SchedulerConfig::Nightly(c) => {
                c.schedule.validate()?;
                let mut s = NightlyScheduler::new(c.common.base(), c.schedule.clone())
                    .with_filter(change_filter(&c.change_filter)?)
                    .with_only_if_changed(c.only_if_changed);
                if let Some(branch) = &c.branch {
                    s = s.with_branch(branch.clone());
                }
                if let Some(patterns) = &c.important_files {
                    s = s.with_importance(Arc::new(ImportantFiles::new(patterns)?));
                }
                Box::new(s)
            }
            SchedulerConfig::Periodic(c) => Box::new(PeriodicScheduler::new(
                c.common.base(),
                seconds("period_secs", c.period_secs)?,
            )?),
            SchedulerConfig::Dependent(c) => {
                Box::new(DependentScheduler::new(c.common.base(), c.upstream.clone()))
            }
            SchedulerConfig::Triggerable(c) => Box::new(TriggerableScheduler::new(c.common.base())),
            SchedulerConfig::TryJobdir(c) => {
                let mut s = TryJobdirScheduler::new(c.common.base(), c.jobdir.clone());
                if let Some(secs) = c.poll_interval_secs {
                    s = s.with_poll_interval(seconds("poll_interval_secs", secs)?);
                }
                Box::new(s)
            }
            SchedulerConfig::TryUserpass(c) => Box::new(TryUserpassScheduler::new(
                c.common.base(),
                c.userpass
                    .iter()
                    .map(|u| (u.username.clone(), u.password.clone()))
                    .collect(),
            )),
        };
        Ok(scheduler)
    }
}

fn find_duplicate<'a>(names: impl IntoIterator<Item = &'a str>) -> Option<&'a str> {
    let mut seen = HashSet::new();
    names.into_iter().find(|n| !seen.insert(*n))
}

impl MasterConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
            .map_err(|e| Error::InvalidConfig(format!("{}: {e}", path.display())))
    }

    pub fn from_yaml(contents: &str) -> Result<Self> {
        serde_yaml::from_str(contents).map_err(|e| Error::InvalidConfig(e.to_string()))
    }

    /// Check everything that can be checked without starting the master.
    pub fn validate(&self) -> Result<()> {
        if let Some(name) = find_duplicate(self.workers.iter().map(|w| w.name.as_str())) {
            return Err(Error::InvalidConfig(format!("duplicate worker '{name}'")));
        }
        if let Some(name) = find_duplicate(self.builders.iter().map(|b| b.name.as_str())) {
            return Err(Error::InvalidConfig(format!("duplicate builder '{name}'")));
        }

        let workers: HashSet<&str> = self.workers.iter().map(|w| w.name.as_str()).collect();
        for builder in &self.builders {
            if let Some(w) = builder.workers.iter().find(|w| !workers.contains(w.as_str())) {
                return Err(Error::InvalidConfig(format!(
                    "builder '{}' uses unknown worker '{w}'",
                    builder.name
                )));
            }
        }

        let builders: HashSet<&str> = self.builders.iter().map(|b| b.name.as_str()).collect();
        for scheduler in &self.schedulers {
            let common = scheduler.common();
            if let Some(b) = common
                .builder_names
                .iter()
                .find(|b| !builders.contains(b.as_str()))
            {
                return Err(Error::InvalidConfig(format!(
                    "scheduler '{}' names unknown builder '{b}'",
                    common.name
                )));
            }
        }
        for rule in &self.canceller.rules {
            if let Some(b) = rule.builders.iter().find(|b| !builders.contains(b.as_str())) {
                return Err(Error::InvalidConfig(format!(
                    "canceller rule names unknown builder '{b}'"
                )));
            }
        }

        self.canceller.build()?;
        self.build_schedulers()?;
        Ok(())
    }

    /// Instantiate and validate every configured scheduler.
    pub fn build_schedulers(&self) -> Result<Vec<Box<dyn Scheduler>>> {
        let schedulers = self
            .schedulers
            .iter()
            .map(|config| {
                config.build().map_err(|e| match e {
                    Error::InvalidConfig(msg) => {
                        Error::InvalidConfig(format!("scheduler '{}': {msg}", config.name()))
                    }
                    other => other,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        validate_schedulers(&schedulers)?;
        Ok(schedulers)
    }

    pub fn canceller_rules(&self) -> Result<Vec<CancelRule>> {
        self.canceller.build()
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            claim_timeout: Duration::from_secs(self.master.claim_timeout_secs),
            reclaim_interval: Duration::from_secs(self.master.reclaim_interval_secs.max(1)),
            expiry_check_interval: Duration::from_secs(self.master.expiry_check_interval_secs.max(1)),
            loop_delay: Duration::ZERO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedulers::SchedulerKind;

    const SAMPLE: &str = r#"
master:
  name: m1
workers:
  - name: w1
    max_builds: 2
builders:
  - name: b1
    workers: [w1]
  - name: b2
    workers: [w1]
    priority: 5
coordinator:
  next_worker: least_loaded
schedulers:
  - type: single_branch
    name: main
    builder_names: [b1]
    change_filter:
      branch: main
    tree_stable_timer_secs: 60
    important_files: ['^src/']
  - type: any_branch
    name: features
    builder_names: [b1]
    branches: [feature-a, feature-b]
  - type: dependent
    name: downstream
    upstream: main
    builder_names: [b2]
    properties:
      stage: deploy
  - type: nightly
    name: nightly
    builder_names: [b1, b2]
    schedule:
      hour: 3
      minute: 0
    only_if_changed: true
  - type: triggerable
    name: trig
    builder_names: [b2]
  - type: try_userpass
    name: try
    builder_names: [b1, b2]
    userpass:
      - username: alice
        password: secret
canceller:
  rules:
    - builders: [b1]
      filter:
        branch_eq: feature-a
"#;

    #[test]
    fn test_parse_sample() {
        let config = MasterConfig::from_yaml(SAMPLE).unwrap();
        assert_eq!(config.master.name, "m1");
        assert_eq!(config.master.claim_timeout_secs, 300);
        assert_eq!(config.workers[0].max_builds, 2);
        assert!(!config.workers[0].online);
        assert_eq!(config.schedulers.len(), 6);
        config.validate().unwrap();

        let schedulers = config.build_schedulers().unwrap();
        let kinds: Vec<SchedulerKind> = schedulers.iter().map(|s| s.kind()).collect();
        assert_eq!(
            kinds,
            vec![
                SchedulerKind::SingleBranch,
                SchedulerKind::AnyBranch,
                SchedulerKind::Dependent,
                SchedulerKind::Nightly,
                SchedulerKind::Triggerable,
                SchedulerKind::TryUserpass,
            ]
        );
        assert_eq!(config.canceller_rules().unwrap().len(), 1);
    }

    #[test]
    fn test_defaults() {
        let config = MasterConfig::from_yaml("{}").unwrap();
        assert_eq!(config.api.listen.port(), 8010);
        assert_eq!(config.logging.format, LogFormat::Text);
        assert!(config.database.url.is_none());
        config.validate().unwrap();
    }

    #[test]
    fn test_unknown_builder_is_rejected() {
        let yaml = r#"
schedulers:
  - type: triggerable
    name: t
    builder_names: [nope]
"#;
        let err = MasterConfig::from_yaml(yaml).unwrap().validate().unwrap_err();
        assert!(err.to_string().contains("nope"));
    }

    #[test]
    fn test_bad_regex_names_scheduler() {
        let yaml = r#"
workers: [{ name: w1 }]
builders: [{ name: b1, workers: [w1] }]
schedulers:
  - type: single_branch
    name: broken
    builder_names: [b1]
    change_filter:
      branch_re: '('
"#;
        let err = MasterConfig::from_yaml(yaml).unwrap().validate().unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
        assert!(err.to_string().contains("broken"));
    }

    #[test]
    fn test_dependency_cycle_is_rejected() {
        let yaml = r#"
workers: [{ name: w1 }]
builders: [{ name: b1, workers: [w1] }]
schedulers:
  - { type: dependent, name: a, upstream: b, builder_names: [b1] }
  - { type: dependent, name: b, upstream: a, builder_names: [b1] }
"#;
        let err = MasterConfig::from_yaml(yaml).unwrap().validate().unwrap_err();
        assert!(matches!(err, Error::DependencyCycle(_)));
    }

    #[test]
    fn test_invalid_schedule_is_rejected() {
        let yaml = r#"
workers: [{ name: w1 }]
builders: [{ name: b1, workers: [w1] }]
schedulers:
  - type: nightly
    name: n
    builder_names: [b1]
    schedule: { hour: 25 }
"#;
        assert!(MasterConfig::from_yaml(yaml).unwrap().validate().is_err());
    }

    #[test]
    fn test_huge_timer_is_rejected() {
        for secs in [u64::MAX, i64::MAX as u64] {
            let yaml = format!(
                r#"
workers: [{{ name: w1 }}]
builders: [{{ name: b1, workers: [w1] }}]
schedulers:
  - type: single_branch
    name: slow
    builder_names: [b1]
    tree_stable_timer_secs: {secs}
"#
            );
            let err = MasterConfig::from_yaml(&yaml).unwrap().validate().unwrap_err();
            assert!(matches!(err, Error::InvalidConfig(_)));
            assert!(err.to_string().contains("slow"));
            assert!(err.to_string().contains("tree_stable_timer_secs"));
        }
    }

    #[test]
    fn test_unknown_top_level_key_is_rejected() {
        assert!(MasterConfig::from_yaml("bogus: 1").is_err());
    }
}
