//! Change filtering and file importance.
//!
//! A [`ChangeFilter`] ANDs the checks configured for each change attribute.
//! An attribute with no checks does not constrain the change.

use bosun_core::change::Change;
use bosun_core::sourcestamp::SourceStamp;
use bosun_core::{Error, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::warn;

/// Predicate over a single, possibly null, attribute value.
pub type ValuePredicate = Arc<dyn Fn(Option<&str>) -> bool + Send + Sync>;

/// Predicate over a whole change.
pub type ChangePredicate = Arc<dyn Fn(&Change) -> bool + Send + Sync>;

/// One value or a list of values in configuration. A `~` entry in a list
/// stands for a null value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany {
    One(String),
    Many(Vec<Option<String>>),
}

impl OneOrMany {
    fn into_values(self) -> Vec<Option<String>> {
        match self {
            OneOrMany::One(v) => vec![Some(v)],
            OneOrMany::Many(vs) => vs,
        }
    }
}

/// Checks applied to one attribute.
#[derive(Clone, Default)]
pub struct ValueFilter {
    eq: Option<Vec<Option<String>>>,
    not_eq: Option<Vec<Option<String>>>,
    regex: Option<Regex>,
    not_regex: Option<Regex>,
    predicate: Option<ValuePredicate>,
}

impl fmt::Debug for ValueFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValueFilter")
            .field("eq", &self.eq)
            .field("not_eq", &self.not_eq)
            .field("regex", &self.regex.as_ref().map(Regex::as_str))
            .field("not_regex", &self.not_regex.as_ref().map(Regex::as_str))
            .field("predicate", &self.predicate.is_some())
            .finish()
    }
}

/// Compile a pattern anchored at the start of the value.
fn anchored(pattern: &str) -> Result<Regex> {
    Regex::new(&format!("^(?:{pattern})"))
        .map_err(|e| Error::InvalidConfig(format!("bad regex '{pattern}': {e}")))
}

impl ValueFilter {
    pub fn any() -> Self {
        Self::default()
    }

    /// Match a single non-null value.
    pub fn eq(value: impl Into<String>) -> Self {
        Self::one_of([Some(value.into())])
    }

    /// Match only a null value.
    pub fn null() -> Self {
        Self::one_of([None])
    }

    pub fn one_of(values: impl IntoIterator<Item = Option<String>>) -> Self {
        Self {
            eq: Some(values.into_iter().collect()),
            ..Default::default()
        }
    }

    pub fn regex(pattern: &str) -> Result<Self> {
        Ok(Self {
            regex: Some(anchored(pattern)?),
            ..Default::default()
        })
    }

    pub fn with_not_eq(mut self, values: impl IntoIterator<Item = Option<String>>) -> Self {
        self.not_eq = Some(values.into_iter().collect());
        self
    }

    pub fn with_regex(mut self, pattern: &str) -> Result<Self> {
        self.regex = Some(anchored(pattern)?);
        Ok(self)
    }

    pub fn with_not_regex(mut self, pattern: &str) -> Result<Self> {
        self.not_regex = Some(anchored(pattern)?);
        Ok(self)
    }

    pub fn with_predicate(mut self, predicate: ValuePredicate) -> Self {
        self.predicate = Some(predicate);
        self
    }

    /// Whether any check is configured.
    pub fn is_constrained(&self) -> bool {
        self.eq.is_some()
            || self.not_eq.is_some()
            || self.regex.is_some()
            || self.not_regex.is_some()
            || self.predicate.is_some()
    }

    pub fn matches(&self, value: Option<&str>) -> bool {
        if let Some(eq) = &self.eq {
            if !eq.iter().any(|v| v.as_deref() == value) {
                return false;
            }
        }
        if let Some(not_eq) = &self.not_eq {
            if not_eq.iter().any(|v| v.as_deref() == value) {
                return false;
            }
        }
        if let Some(re) = &self.regex {
            match value {
                Some(v) if re.is_match(v) => {}
                _ => return false,
            }
        }
        if let Some(re) = &self.not_regex {
            if value.is_some_and(|v| re.is_match(v)) {
                return false;
            }
        }
        if let Some(predicate) = &self.predicate {
            if !predicate(value) {
                return false;
            }
        }
        true
    }

    fn from_config(
        eq: Option<OneOrMany>,
        not_eq: Option<OneOrMany>,
        re: Option<&str>,
        not_re: Option<&str>,
    ) -> Result<Self> {
        let mut filter = Self {
            eq: eq.map(OneOrMany::into_values),
            not_eq: not_eq.map(OneOrMany::into_values),
            ..Default::default()
        };
        if let Some(re) = re {
            filter = filter.with_regex(re)?;
        }
        if let Some(re) = not_re {
            filter = filter.with_not_regex(re)?;
        }
        Ok(filter)
    }
}

/// Selects the changes a scheduler reacts to.
#[derive(Clone, Default)]
pub struct ChangeFilter {
    pub project: ValueFilter,
    pub repository: ValueFilter,
    pub branch: ValueFilter,
    pub category: ValueFilter,
    pub codebase: ValueFilter,
    predicate: Option<ChangePredicate>,
}

impl fmt::Debug for ChangeFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeFilter")
            .field("project", &self.project)
            .field("repository", &self.repository)
            .field("branch", &self.branch)
            .field("category", &self.category)
            .field("codebase", &self.codebase)
            .field("predicate", &self.predicate.is_some())
            .finish()
    }
}

impl ChangeFilter {
    /// A filter accepting every change.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_project(mut self, filter: ValueFilter) -> Self {
        self.project = filter;
        self
    }

    pub fn with_repository(mut self, filter: ValueFilter) -> Self {
        self.repository = filter;
        self
    }

    pub fn with_branch(mut self, filter: ValueFilter) -> Self {
        self.branch = filter;
        self
    }

    pub fn with_category(mut self, filter: ValueFilter) -> Self {
        self.category = filter;
        self
    }

    pub fn with_codebase(mut self, filter: ValueFilter) -> Self {
        self.codebase = filter;
        self
    }

    pub fn with_predicate(mut self, predicate: ChangePredicate) -> Self {
        self.predicate = Some(predicate);
        self
    }

    pub fn matches(&self, change: &Change) -> bool {
        self.project.matches(Some(&change.project))
            && self.repository.matches(Some(&change.repository))
            && self.branch.matches(change.branch.as_deref())
            && self.category.matches(change.category.as_deref())
            && self.codebase.matches(Some(&change.codebase))
            && self.predicate.as_ref().is_none_or(|p| p(change))
    }
}

/// Declarative change filter as written in configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ChangeFilterConfig {
    pub project: Option<OneOrMany>,
    pub project_not: Option<OneOrMany>,
    pub project_re: Option<String>,
    pub project_not_re: Option<String>,
    pub repository: Option<OneOrMany>,
    pub repository_not: Option<OneOrMany>,
    pub repository_re: Option<String>,
    pub repository_not_re: Option<String>,
    pub branch: Option<OneOrMany>,
    pub branch_not: Option<OneOrMany>,
    pub branch_re: Option<String>,
    pub branch_not_re: Option<String>,
    pub category: Option<OneOrMany>,
    pub category_not: Option<OneOrMany>,
    pub category_re: Option<String>,
    pub category_not_re: Option<String>,
    pub codebase: Option<OneOrMany>,
    pub codebase_re: Option<String>,
}

impl ChangeFilterConfig {
    pub fn build(&self) -> Result<ChangeFilter> {
        Ok(ChangeFilter {
            project: ValueFilter::from_config(
                self.project.clone(),
                self.project_not.clone(),
                self.project_re.as_deref(),
                self.project_not_re.as_deref(),
            )?,
            repository: ValueFilter::from_config(
                self.repository.clone(),
                self.repository_not.clone(),
                self.repository_re.as_deref(),
                self.repository_not_re.as_deref(),
            )?,
            branch: ValueFilter::from_config(
                self.branch.clone(),
                self.branch_not.clone(),
                self.branch_re.as_deref(),
                self.branch_not_re.as_deref(),
            )?,
            category: ValueFilter::from_config(
                self.category.clone(),
                self.category_not.clone(),
                self.category_re.as_deref(),
                self.category_not_re.as_deref(),
            )?,
            codebase: ValueFilter::from_config(
                self.codebase.clone(),
                None,
                self.codebase_re.as_deref(),
                None,
            )?,
            predicate: None,
        })
    }
}

/// Filter over source stamps, used by the old-build canceller.
#[derive(Debug, Clone, Default)]
pub struct SourceStampFilter {
    pub project: ValueFilter,
    pub codebase: ValueFilter,
    pub repository: ValueFilter,
    pub branch: ValueFilter,
}

impl SourceStampFilter {
    pub fn matches(&self, ss: &SourceStamp) -> bool {
        self.project.matches(Some(&ss.project))
            && self.codebase.matches(Some(&ss.codebase))
            && self.repository.matches(Some(&ss.repository))
            && self.branch.matches(ss.branch.as_deref())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SourceStampFilterConfig {
    pub project_eq: Option<OneOrMany>,
    pub project_not_eq: Option<OneOrMany>,
    pub project_re: Option<String>,
    pub project_not_re: Option<String>,
    pub codebase_eq: Option<OneOrMany>,
    pub codebase_not_eq: Option<OneOrMany>,
    pub codebase_re: Option<String>,
    pub codebase_not_re: Option<String>,
    pub repository_eq: Option<OneOrMany>,
    pub repository_not_eq: Option<OneOrMany>,
    pub repository_re: Option<String>,
    pub repository_not_re: Option<String>,
    pub branch_eq: Option<OneOrMany>,
    pub branch_not_eq: Option<OneOrMany>,
    pub branch_re: Option<String>,
    pub branch_not_re: Option<String>,
}

impl SourceStampFilterConfig {
    pub fn build(&self) -> Result<SourceStampFilter> {
        Ok(SourceStampFilter {
            project: ValueFilter::from_config(
                self.project_eq.clone(),
                self.project_not_eq.clone(),
                self.project_re.as_deref(),
                self.project_not_re.as_deref(),
            )?,
            codebase: ValueFilter::from_config(
                self.codebase_eq.clone(),
                self.codebase_not_eq.clone(),
                self.codebase_re.as_deref(),
                self.codebase_not_re.as_deref(),
            )?,
            repository: ValueFilter::from_config(
                self.repository_eq.clone(),
                self.repository_not_eq.clone(),
                self.repository_re.as_deref(),
                self.repository_not_re.as_deref(),
            )?,
            branch: ValueFilter::from_config(
                self.branch_eq.clone(),
                self.branch_not_eq.clone(),
                self.branch_re.as_deref(),
                self.branch_not_re.as_deref(),
            )?,
        })
    }
}

/// Decides whether a change should move a scheduler's timer.
pub trait FileImportance: Send + Sync {
    fn is_important(&self, change: &Change) -> anyhow::Result<bool>;
}

impl<F> FileImportance for F
where
    F: Fn(&Change) -> anyhow::Result<bool> + Send + Sync,
{
    fn is_important(&self, change: &Change) -> anyhow::Result<bool> {
        self(change)
    }
}

/// Every change is important.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysImportant;

impl FileImportance for AlwaysImportant {
    fn is_important(&self, _change: &Change) -> anyhow::Result<bool> {
        Ok(true)
    }
}

/// A change is important iff any of its files matches one of the patterns.
#[derive(Debug, Clone)]
pub struct ImportantFiles {
    patterns: Vec<Regex>,
}

impl ImportantFiles {
    pub fn new(patterns: &[String]) -> Result<Self> {
        let patterns = patterns
            .iter()
            .map(|p| anchored(p))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { patterns })
    }
}

impl FileImportance for ImportantFiles {
    fn is_important(&self, change: &Change) -> anyhow::Result<bool> {
        Ok(change
            .files
            .iter()
            .any(|f| self.patterns.iter().any(|p| p.is_match(f))))
    }
}

/// Evaluate importance, treating a failing predicate as "not important".
pub fn classify(importance: &dyn FileImportance, scheduler: &str, change: &Change) -> bool {
    match importance.is_important(change) {
        Ok(important) => important,
        Err(e) => {
            warn!(
                scheduler = %scheduler,
                change = change.number,
                error = %e,
                "File importance check failed; treating change as unimportant"
            );
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bosun_core::change::NewChange;
    use chrono::Utc;

    fn change(branch: Option<&str>) -> Change {
        let mut c = NewChange::new("dev")
            .with_project("proj")
            .with_repository("git://repo")
            .with_files(&["src/main.rs", "README.md"]);
        c.branch = branch.map(String::from);
        c.into_change(1, Utc::now())
    }

    #[test]
    fn test_empty_filter_matches_everything() {
        assert!(ChangeFilter::all().matches(&change(None)));
        assert!(ChangeFilter::all().matches(&change(Some("main"))));
    }

    #[test]
    fn test_branch_is_three_valued() {
        let any = ChangeFilter::all();
        let null_only = ChangeFilter::all().with_branch(ValueFilter::null());
        let main_only = ChangeFilter::all().with_branch(ValueFilter::eq("main"));

        assert!(any.matches(&change(None)));
        assert!(null_only.matches(&change(None)));
        assert!(!null_only.matches(&change(Some("main"))));
        assert!(main_only.matches(&change(Some("main"))));
        assert!(!main_only.matches(&change(None)));
    }

    #[test]
    fn test_regex_is_anchored_at_start() {
        let filter = ChangeFilter::all().with_branch(ValueFilter::regex("release/").unwrap());
        assert!(filter.matches(&change(Some("release/1.0"))));
        assert!(!filter.matches(&change(Some("hotfix/release/1.0"))));
        assert!(!filter.matches(&change(None)));
    }

    #[test]
    fn test_checks_are_anded() {
        let filter = ChangeFilter::all()
            .with_branch(
                ValueFilter::one_of([Some("main".into()), Some("dev".into())])
                    .with_regex("m")
                    .unwrap(),
            )
            .with_project(ValueFilter::eq("proj"));
        assert!(filter.matches(&change(Some("main"))));
        assert!(!filter.matches(&change(Some("dev"))));
    }

    #[test]
    fn test_predicates() {
        let filter = ChangeFilter::all()
            .with_branch(ValueFilter::any().with_predicate(Arc::new(|b| b != Some("skip"))))
            .with_predicate(Arc::new(|c: &Change| c.files.len() > 1));
        assert!(filter.matches(&change(Some("main"))));
        assert!(!filter.matches(&change(Some("skip"))));
    }

    #[test]
    fn test_config_null_branch_in_list() {
        let cfg: ChangeFilterConfig = serde_yaml::from_str("branch: [main, ~]").unwrap();
        let filter = cfg.build().unwrap();
        assert!(filter.matches(&change(None)));
        assert!(filter.matches(&change(Some("main"))));
        assert!(!filter.matches(&change(Some("dev"))));

        let cfg: ChangeFilterConfig = serde_yaml::from_str("branch: main").unwrap();
        assert!(!cfg.build().unwrap().matches(&change(None)));
    }

    #[test]
    fn test_config_bad_regex_is_rejected() {
        let cfg = ChangeFilterConfig {
            branch_re: Some("(".into()),
            ..Default::default()
        };
        assert!(matches!(cfg.build(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_important_files() {
        let importance = ImportantFiles::new(&["src/".to_string()]).unwrap();
        assert!(importance.is_important(&change(None)).unwrap());
        let docs = ImportantFiles::new(&["docs/".to_string()]).unwrap();
        assert!(!docs.is_important(&change(None)).unwrap());
    }

    #[test]
    fn test_failing_importance_is_contained() {
        let failing = |_: &Change| -> anyhow::Result<bool> { anyhow::bail!("boom") };
        assert!(!classify(&failing, "s", &change(None)));
    }
}
