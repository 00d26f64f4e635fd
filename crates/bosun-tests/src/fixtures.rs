//! Test fixtures: a recording executor and sample inputs.

use async_trait::async_trait;
use bosun_core::build::{BuildAssignment, StartOutcome};
use bosun_core::change::NewChange;
use bosun_core::ids::BuildId;
use bosun_core::ports::BuildExecutor;
use bosun_core::sourcestamp::SourceStamp;
use bosun_core::Result;
use parking_lot::Mutex;

/// Executor that accepts every build and records what it was asked to do.
#[derive(Default)]
pub struct RecordingExecutor {
    started: Mutex<Vec<BuildAssignment>>,
    cancelled: Mutex<Vec<(BuildId, String)>>,
}

impl RecordingExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn started(&self) -> Vec<BuildAssignment> {
        self.started.lock().clone()
    }

    pub fn started_count(&self) -> usize {
        self.started.lock().len()
    }

    pub fn cancelled(&self) -> Vec<(BuildId, String)> {
        self.cancelled.lock().clone()
    }
}

#[async_trait]
impl BuildExecutor for RecordingExecutor {
    async fn start_build(&self, assignment: &BuildAssignment) -> Result<StartOutcome> {
        self.started.lock().push(assignment.clone());
        Ok(StartOutcome::Started)
    }

    async fn cancel_build(&self, build_id: BuildId, reason: &str) -> Result<()> {
        self.cancelled.lock().push((build_id, reason.to_string()));
        Ok(())
    }
}

/// Factory for sample changes.
pub struct ChangeFixture;

impl ChangeFixture {
    /// An important change on `branch` touching one source file.
    pub fn on_branch(branch: &str) -> NewChange {
        NewChange::new("dev")
            .with_branch(branch)
            .with_revision("abc123")
            .with_files(&["src/lib.rs"])
    }
}

/// Factory for sample source stamps.
pub struct StampFixture;

impl StampFixture {
    /// The latest revision of `branch` in the default codebase.
    pub fn latest(branch: &str) -> SourceStamp {
        SourceStamp {
            branch: Some(branch.to_string()),
            ..SourceStamp::new("")
        }
    }
}
