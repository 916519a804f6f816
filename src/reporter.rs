// Console reporter
//
// Status lines for the user plus a scoped "in progress" spinner. Purely
// cosmetic: structured logs go through tracing independently.

use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Mutex;
use std::time::Duration;

/// Sink for user-facing status messages
pub trait Reporter: Send + Sync {
    /// Print one status line
    fn print(&self, message: &str);

    /// Start an in-progress indicator
    fn begin_status(&self, message: &str);

    /// Stop the in-progress indicator started by `begin_status`
    fn end_status(&self);
}

/// Scoped status indicator; ends when dropped
pub struct StatusGuard<'a> {
    reporter: &'a dyn Reporter,
}

impl<'a> StatusGuard<'a> {
    pub fn new(reporter: &'a dyn Reporter, message: &str) -> Self {
        reporter.begin_status(message);
        Self { reporter }
    }
}

impl Drop for StatusGuard<'_> {
    fn drop(&mut self) {
        self.reporter.end_status();
    }
}

/// Terminal reporter backed by an indicatif spinner
pub struct ConsoleReporter {
    spinner: Mutex<Option<ProgressBar>>,
}

impl ConsoleReporter {
    pub fn new() -> Self {
        Self {
            spinner: Mutex::new(None),
        }
    }
}

impl Default for ConsoleReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl Reporter for ConsoleReporter {
    fn print(&self, message: &str) {
        let spinner = self.spinner.lock().unwrap_or_else(|e| e.into_inner());
        match spinner.as_ref() {
            // Print above the spinner so it doesn't get overwritten
            Some(bar) => bar.println(message),
            None => println!("{}", message),
        }
    }

    fn begin_status(&self, message: &str) {
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {msg} [{elapsed_precise}]")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        bar.set_message(message.to_string());
        bar.enable_steady_tick(Duration::from_millis(120));

        let mut spinner = self.spinner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = spinner.replace(bar) {
            previous.finish_and_clear();
        }
    }

    fn end_status(&self) {
        let mut spinner = self.spinner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(bar) = spinner.take() {
            bar.finish_and_clear();
        }
    }
}
