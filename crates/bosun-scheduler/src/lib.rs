//! Build scheduling and request coordination for Bosun.
//!
//! Changes flow through [`schedulers`] into buildsets; the [`coordinator`]
//! claims the resulting build requests and hands them to workers; the
//! [`canceller`] stops work that newer changes have made obsolete. A
//! [`master::Master`] wires all of them to one store and one event bus.

pub mod bus;
pub mod canceller;
pub mod config;
pub mod coordinator;
pub mod cron;
pub mod debounce;
pub mod filter;
pub mod master;
pub mod schedulers;
pub mod submit;
pub mod supervisor;

pub use bus::LocalEventBus;
pub use canceller::{CancelRule, OldBuildCanceller, WorkCanceller};
pub use config::MasterConfig;
pub use coordinator::{Coordinator, CoordinatorConfig, Policies};
pub use filter::{ChangeFilter, SourceStampFilter};
pub use master::{Master, TriggerHandle};
pub use schedulers::{Scheduler, SchedulerKind, TriggerRequest, TryCredentials, TryJob};
pub use submit::{Stores, Submitter};
pub use supervisor::SchedulerSupervisor;
