//! Buildsets and the per-builder build requests they expand into.

use crate::ids::*;
use crate::properties::Properties;
use crate::sourcestamp::SourceStamp;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Outcome of a build request, build or buildset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Results {
    Success,
    Warnings,
    Failure,
    Skipped,
    Exception,
    Retry,
    Cancelled,
}

impl Results {
    /// Position in the aggregation order; the worst result wins.
    fn severity(self) -> u8 {
        match self {
            Results::Skipped => 0,
            Results::Success => 1,
            Results::Warnings => 2,
            Results::Failure => 3,
            Results::Exception => 4,
            Results::Retry => 5,
            Results::Cancelled => 6,
        }
    }

    pub fn worst(self, other: Results) -> Results {
        if other.severity() > self.severity() {
            other
        } else {
            self
        }
    }

    /// Aggregate a set of results. An empty set is a success.
    pub fn worst_of(results: impl IntoIterator<Item = Results>) -> Results {
        results
            .into_iter()
            .reduce(Results::worst)
            .unwrap_or(Results::Success)
    }

    pub fn is_successful(&self) -> bool {
        matches!(self, Results::Success | Results::Warnings)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Results::Success => "success",
            Results::Warnings => "warnings",
            Results::Failure => "failure",
            Results::Skipped => "skipped",
            Results::Exception => "exception",
            Results::Retry => "retry",
            Results::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Results> {
        Some(match s {
            "success" => Results::Success,
            "warnings" => Results::Warnings,
            "failure" => Results::Failure,
            "skipped" => Results::Skipped,
            "exception" => Results::Exception,
            "retry" => Results::Retry,
            "cancelled" => Results::Cancelled,
            _ => return None,
        })
    }
}

impl fmt::Display for Results {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildSet {
    pub id: BuildSetId,
    /// Scheduler that submitted this buildset, if any.
    pub scheduler_name: Option<String>,
    /// One stamp per codebase.
    pub sourcestamps: Vec<SourceStamp>,
    pub reason: String,
    pub properties: Properties,
    pub builder_names: Vec<String>,
    pub external_idstring: Option<String>,
    pub parent_build_id: Option<BuildId>,
    pub submitted_at: DateTime<Utc>,
    pub complete: bool,
    pub complete_at: Option<DateTime<Utc>>,
    pub results: Option<Results>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    Unclaimed,
    Claimed,
    Complete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildRequest {
    pub id: BuildRequestId,
    pub buildset_id: BuildSetId,
    pub builder_name: String,
    /// Higher runs first under the priority ordering.
    pub priority: i32,
    pub submitted_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub claimed_by: Option<MasterId>,
    pub complete: bool,
    pub complete_at: Option<DateTime<Utc>>,
    pub results: Option<Results>,
}

impl BuildRequest {
    pub fn state(&self) -> RequestState {
        if self.complete {
            RequestState::Complete
        } else if self.claimed_by.is_some() {
            RequestState::Claimed
        } else {
            RequestState::Unclaimed
        }
    }

    pub fn is_claimed_by(&self, master: MasterId) -> bool {
        !self.complete && self.claimed_by == Some(master)
    }
}

/// Everything needed to create a buildset and its requests.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildSetSubmission {
    #[serde(default)]
    pub scheduler_name: Option<String>,
    pub sourcestamps: Vec<SourceStamp>,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub properties: Properties,
    /// Repeating a builder name requests several builds on it.
    pub builder_names: Vec<String>,
    #[serde(default)]
    pub external_idstring: Option<String>,
    #[serde(default)]
    pub parent_build_id: Option<BuildId>,
    #[serde(default)]
    pub priority: i32,
}

impl BuildSetSubmission {
    pub fn new(builder_names: Vec<String>, sourcestamps: Vec<SourceStamp>) -> Self {
        Self {
            builder_names,
            sourcestamps,
            ..Default::default()
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }

    pub fn with_properties(mut self, properties: Properties) -> Self {
        self.properties = properties;
        self
    }

    pub fn with_scheduler(mut self, name: impl Into<String>) -> Self {
        self.scheduler_name = Some(name.into());
        self
    }

    pub fn with_external_idstring(mut self, idstring: impl Into<String>) -> Self {
        self.external_idstring = Some(idstring.into());
        self
    }

    pub fn with_parent_build(mut self, build_id: BuildId) -> Self {
        self.parent_build_id = Some(build_id);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// Identifiers assigned by the store for a new buildset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildSetCreated {
    pub buildset_id: BuildSetId,
    /// `(builder name, request id)` in submission order.
    pub requests: Vec<(String, BuildRequestId)>,
}

impl BuildSetCreated {
    pub fn request_for(&self, builder: &str) -> Option<BuildRequestId> {
        self.requests
            .iter()
            .find(|(name, _)| name == builder)
            .map(|(_, id)| *id)
    }

    pub fn request_ids(&self) -> Vec<BuildRequestId> {
        self.requests.iter().map(|(_, id)| *id).collect()
    }
}

/// Query over build requests. Unset fields match everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildRequestFilter {
    #[serde(default)]
    pub builder_name: Option<String>,
    #[serde(default)]
    pub buildset_id: Option<BuildSetId>,
    #[serde(default)]
    pub claimed: Option<bool>,
    #[serde(default)]
    pub complete: Option<bool>,
    #[serde(default)]
    pub claimed_by: Option<MasterId>,
}

impl BuildRequestFilter {
    pub fn unclaimed_for(builder: impl Into<String>) -> Self {
        Self {
            builder_name: Some(builder.into()),
            claimed: Some(false),
            complete: Some(false),
            ..Default::default()
        }
    }

    pub fn matches(&self, request: &BuildRequest) -> bool {
        if let Some(builder) = &self.builder_name {
            if &request.builder_name != builder {
                return false;
            }
        }
        if let Some(bsid) = self.buildset_id {
            if request.buildset_id != bsid {
                return false;
            }
        }
        if let Some(claimed) = self.claimed {
            if request.claimed_by.is_some() != claimed {
                return false;
            }
        }
        if let Some(complete) = self.complete {
            if request.complete != complete {
                return false;
            }
        }
        if let Some(master) = self.claimed_by {
            if request.claimed_by != Some(master) {
                return false;
            }
        }
        true
    }
}

/// A buildset that became complete as a side effect of completing requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedBuildSet {
    pub buildset_id: BuildSetId,
    pub scheduler_name: Option<String>,
    pub results: Results,
    pub complete_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> BuildRequest {
        BuildRequest {
            id: BuildRequestId::new(),
            buildset_id: BuildSetId::new(),
            builder_name: "b1".into(),
            priority: 0,
            submitted_at: Utc::now(),
            claimed_at: None,
            claimed_by: None,
            complete: false,
            complete_at: None,
            results: None,
        }
    }

    #[test]
    fn test_worst_result_ordering() {
        assert_eq!(Results::Success.worst(Results::Warnings), Results::Warnings);
        assert_eq!(Results::Failure.worst(Results::Success), Results::Failure);
        assert_eq!(
            Results::worst_of([Results::Success, Results::Cancelled]),
            Results::Cancelled
        );
        assert_eq!(
            Results::worst_of([Results::Skipped, Results::Success]),
            Results::Success
        );
        assert_eq!(Results::worst_of([]), Results::Success);
    }

    #[test]
    fn test_results_string_round_trip() {
        for r in [Results::Retry, Results::Exception, Results::Skipped] {
            assert_eq!(Results::parse(r.as_str()), Some(r));
        }
        assert_eq!(Results::parse("bogus"), None);
    }

    #[test]
    fn test_request_state() {
        let mut req = request();
        assert_eq!(req.state(), RequestState::Unclaimed);
        let master = MasterId::new();
        req.claimed_by = Some(master);
        assert_eq!(req.state(), RequestState::Claimed);
        assert!(req.is_claimed_by(master));
        req.complete = true;
        assert_eq!(req.state(), RequestState::Complete);
        assert!(!req.is_claimed_by(master));
    }

    #[test]
    fn test_filter_matches() {
        let req = request();
        assert!(BuildRequestFilter::unclaimed_for("b1").matches(&req));
        assert!(!BuildRequestFilter::unclaimed_for("b2").matches(&req));
        let claimed = BuildRequestFilter {
            claimed: Some(true),
            ..Default::default()
        };
        assert!(!claimed.matches(&req));
    }

    #[test]
    fn test_request_for_duplicate_builders() {
        let first = BuildRequestId::new();
        let created = BuildSetCreated {
            buildset_id: BuildSetId::new(),
            requests: vec![("b1".into(), first), ("b1".into(), BuildRequestId::new())],
        };
        assert_eq!(created.request_for("b1"), Some(first));
        assert_eq!(created.request_ids().len(), 2);
    }
}
