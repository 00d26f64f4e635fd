//! Error types for Bosun.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    // Lookup errors
    #[error("Buildset not found: {0}")]
    BuildSetNotFound(String),

    #[error("Build request not found: {0}")]
    BuildRequestNotFound(String),

    #[error("Change not found: {0}")]
    ChangeNotFound(u64),

    #[error("Scheduler not found: {0}")]
    SchedulerNotFound(String),

    #[error("Build not found: {0}")]
    BuildNotFound(String),

    // Claim contention
    #[error("Build request already claimed: {0}")]
    AlreadyClaimed(String),

    #[error("Build request not claimed: {0}")]
    NotClaimed(String),

    #[error("Claim lost for build request: {0}")]
    ClaimLost(String),

    #[error("Build request already complete: {0}")]
    AlreadyComplete(String),

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Builder {builder} is not allowed by scheduler {scheduler}")]
    BuilderNotAllowed { scheduler: String, builder: String },

    #[error("Duplicate scheduler name: {0}")]
    DuplicateScheduler(String),

    #[error("Dependent schedulers form a cycle through: {0}")]
    DependencyCycle(String),

    // Input errors
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Malformed try job: {0}")]
    MalformedJob(String),

    #[error("Source stamps cannot be merged: {0}")]
    Unmergeable(String),

    #[error("Authentication failed for {0}")]
    AuthenticationFailed(String),

    #[error("Scheduler {0} does not accept triggers")]
    NotTriggerable(String),

    // Lifecycle errors
    #[error("Scheduler stopped: {0}")]
    SchedulerStopped(String),

    #[error("Operation cancelled")]
    Cancelled,

    // Infrastructure errors
    #[error("Database error: {0}")]
    Database(String),

    #[error("Event bus error: {0}")]
    EventBus(String),

    #[error("Executor error: {0}")]
    Executor(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    // Generic
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Claim races and lost ownership. These are re-evaluated by the next
    /// coordinator pass and never surfaced to users.
    pub fn is_contention(&self) -> bool {
        matches!(
            self,
            Error::AlreadyClaimed(_)
                | Error::NotClaimed(_)
                | Error::ClaimLost(_)
                | Error::AlreadyComplete(_)
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::BuildSetNotFound(_)
                | Error::BuildRequestNotFound(_)
                | Error::ChangeNotFound(_)
                | Error::SchedulerNotFound(_)
                | Error::BuildNotFound(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}
