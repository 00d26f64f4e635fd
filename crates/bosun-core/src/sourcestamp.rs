//! Source stamps: an immutable description of what source to build.

use crate::change::Change;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// A patch applied on top of a revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patch {
    pub level: u32,
    pub body: String,
    #[serde(default)]
    pub subdir: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceStamp {
    #[serde(default)]
    pub codebase: String,
    #[serde(default)]
    pub repository: String,
    #[serde(default)]
    pub project: String,
    #[serde(default)]
    pub branch: Option<String>,
    /// `None` means "latest".
    #[serde(default)]
    pub revision: Option<String>,
    #[serde(default)]
    pub patch: Option<Patch>,
    #[serde(default)]
    pub changes: Vec<Change>,
}

impl SourceStamp {
    pub fn new(codebase: impl Into<String>) -> Self {
        Self {
            codebase: codebase.into(),
            ..Default::default()
        }
    }

    /// Derive a stamp from changes in arrival order. Branch, revision,
    /// project and repository come from the last change.
    pub fn from_changes(codebase: impl Into<String>, changes: Vec<Change>) -> Result<Self> {
        let last = changes
            .last()
            .ok_or_else(|| Error::InvalidInput("source stamp needs at least one change".into()))?;
        Ok(Self {
            codebase: codebase.into(),
            repository: last.repository.clone(),
            project: last.project.clone(),
            branch: last.branch.clone(),
            revision: last.revision.clone(),
            patch: None,
            changes,
        })
    }

    pub fn with_repository(mut self, repository: impl Into<String>) -> Self {
        self.repository = repository.into();
        self
    }

    pub fn with_project(mut self, project: impl Into<String>) -> Self {
        self.project = project.into();
        self
    }

    pub fn with_branch(mut self, branch: Option<String>) -> Self {
        self.branch = branch;
        self
    }

    pub fn with_revision(mut self, revision: Option<String>) -> Self {
        self.revision = revision;
        self
    }

    pub fn with_patch(mut self, patch: Patch) -> Self {
        self.patch = Some(patch);
        self
    }

    /// Whether a single build of `self` would also satisfy `other`.
    ///
    /// Patched stamps never merge. Stamps carrying changes merge only with
    /// other stamps carrying changes; the result accumulates them.
    pub fn can_be_merged_with(&self, other: &SourceStamp) -> bool {
        if self.codebase != other.codebase
            || self.repository != other.repository
            || self.branch != other.branch
            || self.project != other.project
        {
            return false;
        }
        if self.patch.is_some() || other.patch.is_some() {
            return false;
        }
        match (self.changes.is_empty(), other.changes.is_empty()) {
            (false, false) => true,
            (true, true) => self.revision == other.revision,
            _ => false,
        }
    }

    /// Merge `others` into a copy of this stamp. Every element of `others`
    /// must be mergeable with `self`.
    pub fn merge_with(&self, others: &[SourceStamp]) -> Result<SourceStamp> {
        let mut merged = self.clone();
        for other in others {
            if !self.can_be_merged_with(other) {
                return Err(Error::Unmergeable(format!(
                    "codebase '{}' branch {:?} cannot absorb branch {:?} revision {:?}",
                    self.codebase, self.branch, other.branch, other.revision
                )));
            }
            merged.changes.extend(other.changes.iter().cloned());
        }
        Ok(merged)
    }

    /// Pin this stamp to the revision actually checked out.
    pub fn absolute(&self, got_revision: impl Into<String>) -> SourceStamp {
        SourceStamp {
            revision: Some(got_revision.into()),
            ..self.clone()
        }
    }

    pub fn change_numbers(&self) -> Vec<u64> {
        self.changes.iter().map(|c| c.number).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::NewChange;
    use chrono::Utc;
    use pretty_assertions::assert_eq;

    fn change(number: u64, branch: &str, revision: &str) -> Change {
        NewChange::new("dev")
            .with_repository("git://repo")
            .with_branch(branch)
            .with_revision(revision)
            .into_change(number, Utc::now())
    }

    fn stamp(revision: Option<&str>) -> SourceStamp {
        SourceStamp::new("")
            .with_repository("git://repo")
            .with_branch(Some("main".into()))
            .with_revision(revision.map(String::from))
    }

    #[test]
    fn test_from_changes_uses_last_change() {
        let ss =
            SourceStamp::from_changes("", vec![change(1, "main", "aaa"), change(2, "main", "bbb")])
                .unwrap();
        assert_eq!(ss.revision.as_deref(), Some("bbb"));
        assert_eq!(ss.repository, "git://repo");
        assert_eq!(ss.change_numbers(), vec![1, 2]);
    }

    #[test]
    fn test_from_changes_rejects_empty() {
        assert!(SourceStamp::from_changes("", vec![]).is_err());
    }

    #[test]
    fn test_revision_mergeability_is_symmetric() {
        let a = stamp(Some("abc"));
        let b = stamp(Some("abc"));
        let c = stamp(Some("def"));
        assert!(a.can_be_merged_with(&b) && b.can_be_merged_with(&a));
        assert!(!a.can_be_merged_with(&c) && !c.can_be_merged_with(&a));
        assert!(stamp(None).can_be_merged_with(&stamp(None)));
    }

    #[test]
    fn test_patch_never_merges() {
        let patch = Patch {
            level: 1,
            body: "diff".into(),
            subdir: None,
        };
        let patched = stamp(Some("abc")).with_patch(patch);
        assert!(!patched.can_be_merged_with(&stamp(Some("abc"))));
        assert!(!stamp(Some("abc")).can_be_merged_with(&patched));
        assert!(!patched.can_be_merged_with(&patched.clone()));

        let mut with_changes = patched.clone();
        with_changes.changes.push(change(1, "main", "abc"));
        assert!(!with_changes.can_be_merged_with(&with_changes.clone()));
    }

    #[test]
    fn test_changes_merge_only_with_changes() {
        let a = SourceStamp::from_changes("", vec![change(1, "main", "a")]).unwrap();
        let b = SourceStamp::from_changes("", vec![change(2, "main", "b")]).unwrap();
        assert!(a.can_be_merged_with(&b));
        assert!(!a.can_be_merged_with(&stamp(Some("a"))));
    }

    #[test]
    fn test_branch_mismatch_never_merges() {
        let a = stamp(None);
        let b = stamp(None).with_branch(Some("release".into()));
        assert!(!a.can_be_merged_with(&b));
    }

    #[test]
    fn test_merge_accumulates_changes_in_order() {
        let a = SourceStamp::from_changes("", vec![change(1, "main", "a")]).unwrap();
        let b = SourceStamp::from_changes("", vec![change(2, "main", "b")]).unwrap();
        let c =
            SourceStamp::from_changes("", vec![change(3, "main", "c"), change(4, "main", "d")])
                .unwrap();

        let merged = a.merge_with(&[b, c]).unwrap();
        assert_eq!(merged.change_numbers(), vec![1, 2, 3, 4]);
        assert_eq!(merged.revision.as_deref(), Some("a"));
    }

    #[test]
    fn test_merge_guard_rejects_unmergeable() {
        let err = stamp(Some("a")).merge_with(&[stamp(Some("b"))]).unwrap_err();
        assert!(matches!(err, Error::Unmergeable(_)));
    }

    #[test]
    fn test_absolute_keeps_location() {
        let ss = stamp(None).absolute("cafe");
        assert_eq!(ss.revision.as_deref(), Some("cafe"));
        assert_eq!(ss.branch.as_deref(), Some("main"));
        assert_eq!(ss.repository, "git://repo");
    }
}
