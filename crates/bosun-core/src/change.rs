//! Change events produced by change sources.

use crate::properties::Properties;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A numbered, immutable change. Numbers are assigned by the change store in
/// arrival order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    pub number: u64,
    pub who: String,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub comments: String,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub revision: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub project: String,
    #[serde(default)]
    pub repository: String,
    #[serde(default)]
    pub codebase: String,
    pub when: DateTime<Utc>,
    #[serde(default)]
    pub properties: Properties,
}

/// A change as reported by a change source, before the store numbers it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewChange {
    pub who: String,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub comments: String,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub revision: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub project: String,
    #[serde(default)]
    pub repository: String,
    #[serde(default)]
    pub codebase: String,
    /// Defaults to the time the store records the change.
    #[serde(default)]
    pub when: Option<DateTime<Utc>>,
    #[serde(default)]
    pub properties: Properties,
}

impl NewChange {
    pub fn new(who: impl Into<String>) -> Self {
        Self {
            who: who.into(),
            ..Default::default()
        }
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }

    pub fn with_revision(mut self, revision: impl Into<String>) -> Self {
        self.revision = Some(revision.into());
        self
    }

    pub fn with_files(mut self, files: &[&str]) -> Self {
        self.files = files.iter().map(|f| f.to_string()).collect();
        self
    }

    pub fn with_repository(mut self, repository: impl Into<String>) -> Self {
        self.repository = repository.into();
        self
    }

    pub fn with_project(mut self, project: impl Into<String>) -> Self {
        self.project = project.into();
        self
    }

    pub fn with_codebase(mut self, codebase: impl Into<String>) -> Self {
        self.codebase = codebase.into();
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn at(mut self, when: DateTime<Utc>) -> Self {
        self.when = Some(when);
        self
    }

    /// Assign a number, producing the immutable change.
    pub fn into_change(self, number: u64, now: DateTime<Utc>) -> Change {
        Change {
            number,
            who: self.who,
            files: self.files,
            comments: self.comments,
            branch: self.branch,
            revision: self.revision,
            category: self.category,
            project: self.project,
            repository: self.repository,
            codebase: self.codebase,
            when: self.when.unwrap_or(now),
            properties: self.properties,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_into_change_defaults_when() {
        let now = Utc::now();
        let change = NewChange::new("dev")
            .with_branch("main")
            .into_change(7, now);
        assert_eq!(change.number, 7);
        assert_eq!(change.when, now);
        assert_eq!(change.branch.as_deref(), Some("main"));
    }

    #[test]
    fn test_change_deserializes_with_defaults() {
        let json = r#"{"number": 1, "who": "dev", "when": "2024-01-01T00:00:00Z"}"#;
        let change: Change = serde_json::from_str(json).unwrap();
        assert!(change.files.is_empty());
        assert_eq!(change.branch, None);
        assert_eq!(change.codebase, "");
    }
}
