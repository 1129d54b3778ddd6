//! bootcache - boot-time kernel cache maintenance
//!
//! Tracks whether per-volume boot caches are in step with their sources,
//! assembles multi-architecture cache artifacts, and serializes rebuilders
//! through an advisory per-volume lock.

pub mod builder;
pub mod cli;
pub mod config;
pub mod container;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod lock;
pub mod manifest;
pub mod privilege;
pub mod staleness;
pub mod ui;
pub mod update;
pub mod volume;

pub use error::{BootcacheError, BootcacheResult};
