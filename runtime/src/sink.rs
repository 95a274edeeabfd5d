//! Host error sink.
//!
//! Launch-time input errors are not returned to the caller; they are reported
//! to the context's sink and the operation becomes a no-op.

use parking_lot::Mutex;
use tracing::error;

/// Category of a reported error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum ErrorKind {
    /// The script was invoked with arguments it cannot run on.
    BadScript,
    BadValue,
    Driver,
}

pub trait ErrorSink: Send + Sync {
    fn report_error(&self, kind: ErrorKind, message: &str);
}

/// Logs every report at `error` level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl ErrorSink for TracingSink {
    fn report_error(&self, kind: ErrorKind, message: &str) {
        error!(error.kind = %kind, "{message}");
    }
}

/// Keeps every report for later inspection.
#[derive(Debug, Default)]
pub struct RecordingSink {
    reports: Mutex<Vec<(ErrorKind, String)>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reports(&self) -> Vec<(ErrorKind, String)> {
        self.reports.lock().clone()
    }

    pub fn take(&self) -> Vec<(ErrorKind, String)> {
        std::mem::take(&mut *self.reports.lock())
    }
}

impl ErrorSink for RecordingSink {
    fn report_error(&self, kind: ErrorKind, message: &str) {
        self.reports.lock().push((kind, message.to_string()));
    }
}
