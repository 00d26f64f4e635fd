//! Test infrastructure for Bosun.
//!
//! Scenario tests run a full [`bosun_scheduler::Master`] on the in-process
//! store with a recording executor. Integration tests (feature
//! `integration`) run the PostgreSQL repositories against a testcontainers
//! database.
//!
//! # Usage
//!
//! ```ignore
//! use bosun_tests::MasterHarness;
//!
//! #[tokio::test]
//! async fn test_something() {
//!     let harness = MasterHarness::start(CONFIG).await.unwrap();
//!     // Use harness.master, harness.executor, etc.
//! }
//! ```

pub mod containers;
pub mod context;
pub mod fixtures;
pub mod helpers;

pub use context::{MasterHarness, PgContext};
pub use fixtures::*;
pub use helpers::*;

/// Initialize test logging (call once per test binary).
pub fn init_test_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warn,bosun_scheduler=debug")),
        )
        .with_test_writer()
        .try_init();
}
