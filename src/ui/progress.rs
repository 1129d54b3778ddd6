//! Progress indicators with CI fallback

use super::context::UiContext;
use crate::builder::BuildObserver;
use crate::container::ArchId;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

const TICK_CHARS: &str = "⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏ ";

/// A task spinner with CI fallback
pub struct TaskSpinner {
    spinner: Option<ProgressBar>,
    interactive: bool,
}

impl TaskSpinner {
    pub fn new(ctx: &UiContext) -> Self {
        Self {
            spinner: None,
            interactive: ctx.use_fancy_output(),
        }
    }

    /// Start the spinner with a message
    pub fn start(&mut self, message: &str) {
        if self.interactive {
            let spinner = ProgressBar::new_spinner();
            if let Ok(s) = ProgressStyle::default_spinner().template("  {spinner:.cyan} {msg}") {
                spinner.set_style(s.tick_chars(TICK_CHARS));
            }
            spinner.set_message(message.to_string());
            spinner.enable_steady_tick(Duration::from_millis(120));
            self.spinner = Some(spinner);
        } else {
            println!("{} {}", style("...").dim(), message);
        }
    }

    /// Stop with success message
    pub fn stop(&mut self, message: &str) {
        self.finish();
        if self.interactive {
            println!("  {} {}", style("✓").green(), message);
        } else {
            println!("{} {}", style("[OK]").green(), message);
        }
    }

    /// Stop with error message
    pub fn stop_error(&mut self, message: &str) {
        self.finish();
        if self.interactive {
            println!("  {} {}", style("✗").red(), message);
        } else {
            println!("{} {}", style("[FAIL]").red(), message);
        }
    }

    /// Stop with warning message
    pub fn stop_warn(&mut self, message: &str) {
        self.finish();
        if self.interactive {
            println!("  {} {}", style("!").yellow(), message);
        } else {
            println!("{} {}", style("[WARN]").yellow(), message);
        }
    }

    fn finish(&mut self) {
        if let Some(spinner) = self.spinner.take() {
            spinner.finish_and_clear();
        }
    }
}

/// Per-architecture progress for one artifact build.
///
/// Shows an indicatif bar in interactive mode, one line per slice otherwise.
pub struct ArchProgress {
    bar: Option<ProgressBar>,
}

impl ArchProgress {
    pub fn new(ctx: &UiContext, label: &str) -> Self {
        let bar = if ctx.use_fancy_output() {
            let bar = ProgressBar::new(0);
            if let Ok(s) = ProgressStyle::default_bar().template(
                "  {spinner:.cyan} Building {prefix}  {bar:20.cyan/dim} {pos}/{len} {msg:.dim}  {elapsed:.dim}",
            ) {
                bar.set_style(s.tick_chars(TICK_CHARS).progress_chars("━╸─"));
            }
            bar.set_prefix(label.to_string());
            bar.enable_steady_tick(Duration::from_millis(120));
            Some(bar)
        } else {
            println!("Building {}...", label);
            None
        };
        Self { bar }
    }

    /// Finish and clear the progress bar
    pub fn finish(&self) {
        if let Some(ref bar) = self.bar {
            bar.disable_steady_tick();
            bar.finish_and_clear();
        }
    }
}

impl BuildObserver for ArchProgress {
    fn arch_started(&self, arch: ArchId, index: usize, total: usize) {
        if let Some(ref bar) = self.bar {
            bar.set_length(total as u64);
            bar.set_position(index as u64);
            bar.set_message(arch.to_string());
        }
    }

    fn arch_finished(&self, arch: ArchId, reused: bool) {
        match self.bar {
            Some(ref bar) => bar.inc(1),
            None => {
                let how = if reused { "reused" } else { "built" };
                println!("  {} {} ({})", style("[OK]").green(), arch, how);
            }
        }
    }
}

impl Drop for ArchProgress {
    fn drop(&mut self) {
        self.finish();
    }
}
