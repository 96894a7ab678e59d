//! Terminal-failure reporting.

use crate::error::ErrorKind;
use parking_lot::Mutex;
use tracing::error;

/// What reached a terminal failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// A record will not be delivered again without a new local write.
    PermanentFailure,
    /// A batch job was resolved as failed.
    JobFailure,
}

/// A terminal failure handed to the [`ErrorSink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureReport {
    /// What failed.
    pub kind: FailureKind,
    /// Record key or job identifier.
    pub context: String,
    /// Classification of the last error.
    pub error_kind: ErrorKind,
    /// Message of the last error.
    pub message: String,
    /// Number of failed attempts, including the first.
    pub attempts: u32,
}

/// Receives every Failed/permanent-failure transition exactly once.
pub trait ErrorSink: Send + Sync {
    /// Reports a terminal failure.
    fn report(&self, report: FailureReport);
}

/// Error sink that logs through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingErrorSink;

impl ErrorSink for TracingErrorSink {
    fn report(&self, report: FailureReport) {
        error!(
            kind = ?report.kind,
            context = %report.context,
            error_kind = ?report.error_kind,
            attempts = report.attempts,
            "{}",
            report.message
        );
    }
}

/// Error sink that keeps every report in memory, for tests.
#[derive(Debug, Default)]
pub struct MemoryErrorSink {
    reports: Mutex<Vec<FailureReport>>,
}

impl MemoryErrorSink {
    /// Creates an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// All reports received so far.
    pub fn reports(&self) -> Vec<FailureReport> {
        self.reports.lock().clone()
    }

    /// Reports whose context matches `context`.
    pub fn reports_for(&self, context: &str) -> Vec<FailureReport> {
        self.reports
            .lock()
            .iter()
            .filter(|r| r.context == context)
            .cloned()
            .collect()
    }
}

impl ErrorSink for MemoryErrorSink {
    fn report(&self, report: FailureReport) {
        self.reports.lock().push(report);
    }
}
