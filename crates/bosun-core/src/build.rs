//! Build assignments handed to the execution layer.

use crate::ids::*;
use crate::properties::Properties;
use crate::sourcestamp::SourceStamp;
use serde::{Deserialize, Serialize};

/// One build about to start: a merged group of requests on a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildAssignment {
    pub build_id: BuildId,
    pub builder: String,
    pub worker: String,
    /// All requests satisfied by this build, primary first.
    pub request_ids: Vec<BuildRequestId>,
    pub sourcestamps: Vec<SourceStamp>,
    pub properties: Properties,
    pub reason: String,
}

/// Response of the execution layer to a start request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StartOutcome {
    Started,
    /// The worker cannot take this build now; requests go back to the pool.
    Rejected { reason: String },
}
