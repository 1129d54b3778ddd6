//! CLI command implementations

pub mod build;
pub mod check;
pub mod config;
pub mod daemon;
pub mod inspect;
pub mod update;

pub use build::execute as build;
pub use check::execute as check;
pub use config::execute as config;
pub use daemon::execute as daemon;
pub use inspect::execute as inspect;
pub use update::execute as update;
