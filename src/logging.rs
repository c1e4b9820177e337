use std::fmt;

/// Run-scoped logger for the backfill engine.
///
/// Every message carries the run identifier so interleaved runs can be told
/// apart in the log stream. The logger borrows the identifier and cannot
/// outlive the run that created it.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RunLog<'a> {
    run_id: &'a str,
}

impl<'a> RunLog<'a> {
    /// Creates a logger for one run.
    pub(crate) fn new(run_id: &'a str) -> Self {
        Self { run_id }
    }

    /// Returns the run identifier.
    pub fn run_id(&self) -> &str {
        self.run_id
    }

    /// Logs an info-level message with the run identifier.
    pub fn info(&self, args: fmt::Arguments<'_>) {
        tracing::info!(target: "activity_backfill", run_id = %self.run_id, "{}", args);
    }

    /// Logs a warning-level message with the run identifier.
    pub fn warn(&self, args: fmt::Arguments<'_>) {
        tracing::warn!(target: "activity_backfill", run_id = %self.run_id, "{}", args);
    }

    /// Logs an error-level message with the run identifier.
    pub fn error(&self, args: fmt::Arguments<'_>) {
        tracing::error!(target: "activity_backfill", run_id = %self.run_id, "{}", args);
    }

    /// Logs a debug-level message with the run identifier.
    pub fn debug(&self, args: fmt::Arguments<'_>) {
        tracing::debug!(target: "activity_backfill", run_id = %self.run_id, "{}", args);
    }
}
