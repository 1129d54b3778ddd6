//! Terminal output for the CLI
//!
//! Styled with `console`; spinners and per-architecture build progress use
//! `indicatif`. When stdout is not a terminal (pipes, CI, launchd) every
//! helper falls back to plain `[OK]`/`[WARN]`/`[FAIL]` lines.
//!
//! # Example
//!
//! ```rust,ignore
//! use bootcache::ui::{self, UiContext, TaskSpinner};
//!
//! let ctx = UiContext::detect();
//!
//! ui::section(&ctx, "Macintosh HD");
//! let mut spinner = TaskSpinner::new(&ctx);
//! spinner.start("Evaluating stamps...");
//! spinner.stop("2 stale entries");
//! ui::step_warn_hint(&ctx, "mkext out of date", "Run: bootcache update /");
//! ```

mod context;
mod output;
mod progress;

pub use context::UiContext;
pub use output::{
    key_value, key_value_status, outro_error, outro_success, outro_warn, remark, section,
    step_error, step_info, step_ok, step_ok_detail, step_warn, step_warn_hint,
};
pub use progress::{ArchProgress, TaskSpinner};
