//! Repository implementations for PostgreSQL.

mod buildrequest;
mod change;
mod state;

pub use buildrequest::PgBuildRequestRepository;
pub use change::PgChangeRepository;
pub use state::PgSchedulerStateRepository;
