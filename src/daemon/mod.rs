//! Compiler daemon contract.
//!
//! A daemon is a long-lived worker that performs the actual compilation for
//! one runtime version. This module defines the handle contract the
//! orchestrator talks to and the factory used by the [`registry`] to start
//! daemons lazily. The concrete transport (external process, embedded
//! compiler component) lives behind these traits and is not part of this
//! crate.
//!
//! Expected failure modes are data, not errors: `compile` returns a
//! [`CompilationResult`] variant for every outcome, so no error type ever
//! crosses the daemon boundary for a failure the pipeline knows how to
//! classify.

pub mod registry;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::request::{CompilationContext, CompilationUnit};

/// Outcome of one compilation request.
///
/// Exactly one variant describes each finished request; the value is
/// immutable once produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompilationResult {
    /// The daemon produced output artifacts in the request's output
    /// directory.
    Success,
    /// The daemon for the required runtime version could not be created or
    /// reached.
    DaemonStartFailure {
        /// Rendered cause of the start failure.
        cause: String,
    },
    /// The daemon replied with a structured failure code.
    DaemonError {
        /// Daemon-defined failure code.
        code: i32,
    },
    /// A failure surfaced while preparing or dispatching the request.
    RequestException {
        /// Rendered cause of the failure.
        cause: String,
    },
    /// The request was cancelled before producing output.
    Aborted {
        /// Rendered cause of the abort, when one is known.
        cause: Option<String>,
    },
}

impl CompilationResult {
    /// Returns true if the daemon produced output artifacts.
    pub fn is_success(&self) -> bool {
        matches!(self, CompilationResult::Success)
    }

    /// Returns true if the request was cancelled.
    ///
    /// Aborts are expected (the user is mid-edit); they are not failures and
    /// produce no user-visible notification.
    pub fn is_aborted(&self) -> bool {
        matches!(self, CompilationResult::Aborted { .. })
    }

    /// Returns true for any outcome other than success or abort.
    pub fn is_failure(&self) -> bool {
        !self.is_success() && !self.is_aborted()
    }

    /// Short human-readable summary suitable for a build notification.
    ///
    /// Returns `None` for aborted requests, which are never surfaced.
    pub fn summary(&self, duration: Duration) -> Option<String> {
        match self {
            CompilationResult::Success => {
                Some(format!("Preview build completed in {:.1}s", duration.as_secs_f64()))
            }
            CompilationResult::Aborted { .. } => None,
            _ => Some(format!("Preview build failed after {:.1}s", duration.as_secs_f64())),
        }
    }
}

/// Handle to one running compiler daemon.
///
/// A handle is shared read-only by concurrent callers; the orchestrator
/// serializes compilation so at most one `compile` runs on a handle at a
/// time. The handle itself does not enforce that.
pub trait CompilerDaemon: Send + Sync {
    /// Non-blocking liveness probe.
    fn is_running(&self) -> bool;

    /// Compiles the given units into `output_dir`.
    ///
    /// Must poll `cancel` at its own suspension points and return
    /// [`CompilationResult::Aborted`] once cancellation is observed. Expected
    /// failures are returned as result variants, never panicked or thrown
    /// across the boundary.
    fn compile<'a>(
        &'a self,
        units: &'a [CompilationUnit],
        context: &'a CompilationContext,
        output_dir: &'a Path,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, CompilationResult>;

    /// Releases the daemon's resources. Idempotent.
    fn dispose(&self);
}

/// Starts daemons on demand for the [`registry::DaemonRegistry`].
///
/// The returned future is `'static` so the registry can drive creation on a
/// background task; implementations clone what they need up front.
pub trait DaemonFactory: Send + Sync {
    /// Starts a daemon for the given runtime version.
    fn create(
        &self,
        version: &str,
    ) -> BoxFuture<'static, Result<Arc<dyn CompilerDaemon>, DaemonStartError>>;
}

/// A daemon could not be started.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("failed to start compiler daemon for runtime {version}: {message}")]
pub struct DaemonStartError {
    /// Runtime version the daemon was requested for.
    pub version: String,
    /// Rendered cause of the failure.
    pub message: String,
}

impl DaemonStartError {
    /// Creates a start error for the given version.
    pub fn new(version: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_classification_helpers() {
        assert!(CompilationResult::Success.is_success());
        assert!(!CompilationResult::Success.is_failure());

        let aborted = CompilationResult::Aborted { cause: None };
        assert!(aborted.is_aborted());
        assert!(!aborted.is_failure());

        let daemon_error = CompilationResult::DaemonError { code: 1 };
        assert!(daemon_error.is_failure());
        assert!(!daemon_error.is_aborted());
    }

    #[test]
    fn test_summary_skips_aborted() {
        let duration = Duration::from_millis(1500);

        assert!(CompilationResult::Success.summary(duration).is_some());
        assert!(CompilationResult::Aborted { cause: None }
            .summary(duration)
            .is_none());

        let failed = CompilationResult::RequestException {
            cause: "boom".to_string(),
        };
        assert!(failed.summary(duration).unwrap().contains("failed"));
    }
}
