//! Diagnostic output: log verbosity and the error sink.
//!
//! Operations report failures through a [`DiagnosticSink`] exactly once per
//! failed operation, unless the operation was created with errors suppressed
//! (see [`OperationHandle::without_errors`](crate::operation::OperationHandle::without_errors)).
//! Progress messages ("bundle loaded", "file patched") go straight to
//! `tracing` and are gated by [`LogMode`].

use std::cell::RefCell;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::PatchError;

// ---------------------------------------------------------------------------
// LogMode
// ---------------------------------------------------------------------------

/// How chatty the pipeline is about successful work.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogMode {
    /// Log progress at `info` as well as errors.
    #[default]
    All,
    /// Only errors reach the log.
    JustErrors,
}

impl LogMode {
    /// Whether progress messages should be emitted.
    pub fn is_verbose(self) -> bool {
        self == LogMode::All
    }
}

// ---------------------------------------------------------------------------
// DiagnosticSink
// ---------------------------------------------------------------------------

/// Receives operation failures that were not suppressed.
pub trait DiagnosticSink {
    /// Report that the operation described by `origin` failed with `error`.
    fn emit(&self, origin: &str, error: &PatchError);
}

/// Default sink: forwards failures to `tracing` at error level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl DiagnosticSink for TracingSink {
    fn emit(&self, origin: &str, error: &PatchError) {
        tracing::error!(operation = origin, error = %error, "patch operation failed");
    }
}

/// Sink that keeps every message in memory.
///
/// Clones share the same buffer, so a host (or test) can keep one clone and
/// hand the other to a [`PatchSystem`](crate::system::PatchSystem).
#[derive(Debug, Clone, Default)]
pub struct CollectingSink {
    messages: Rc<RefCell<Vec<String>>>,
}

impl CollectingSink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// All messages emitted so far, oldest first.
    pub fn messages(&self) -> Vec<String> {
        self.messages.borrow().clone()
    }

    /// Number of messages emitted so far.
    pub fn len(&self) -> usize {
        self.messages.borrow().len()
    }

    /// Whether nothing has been emitted.
    pub fn is_empty(&self) -> bool {
        self.messages.borrow().is_empty()
    }

    /// Forget all collected messages.
    pub fn clear(&self) {
        self.messages.borrow_mut().clear();
    }
}

impl DiagnosticSink for CollectingSink {
    fn emit(&self, origin: &str, error: &PatchError) {
        self.messages.borrow_mut().push(format!("{origin}: {error}"));
    }
}
