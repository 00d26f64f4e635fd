//! Bosun Core
//!
//! Core domain types, port traits, and error handling for the Bosun build
//! coordinator. This crate has minimal dependencies and defines the shared
//! vocabulary (changes, source stamps, buildsets, build requests, lifecycle
//! events) used across all other crates.

pub mod build;
pub mod buildset;
pub mod change;
pub mod error;
pub mod events;
pub mod ids;
pub mod ports;
pub mod properties;
pub mod sourcestamp;

pub use error::{Error, Result};
pub use ids::*;
