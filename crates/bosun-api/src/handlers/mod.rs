//! Request handlers organized by resource.

pub mod buildrequests;
pub mod builds;
pub mod buildsets;
pub mod changes;
pub mod health;
pub mod schedulers;
pub mod try_rpc;
pub mod workers;
