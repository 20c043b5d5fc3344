//! Host collaborator contracts.
//!
//! The orchestrator consumes a few narrow interfaces from the host build
//! integration. None of them are implemented here beyond trivial defaults:
//! the build graph, the environment's power state, and whatever caches a
//! successful build must invalidate all live outside this crate.

use thiserror::Error;

use crate::request::CompilationContext;
use crate::retry::FailureClass;

/// Resolves the runtime version a context must be compiled against.
///
/// Implementations read build-graph state that a concurrent write can
/// invalidate mid-read, so the orchestrator runs this under bounded retry.
pub trait VersionLocator: Send + Sync {
    /// Resolves the runtime version for the given context.
    fn runtime_version(&self, context: &CompilationContext) -> Result<String, VersionError>;
}

/// Failure while resolving a runtime version.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VersionError {
    /// The build graph changed under the read; the read may be re-run.
    #[error("build graph invalidated while resolving the runtime version")]
    GraphInvalidated,

    /// The module has no runtime version configured.
    #[error("no runtime version configured for module {module}")]
    NotFound {
        /// Module that lacks a version.
        module: String,
    },
}

impl VersionError {
    /// Retry classification for the bounded-retry wrapper.
    pub fn class(&self) -> FailureClass {
        match self {
            VersionError::GraphInvalidated => FailureClass::Transient,
            VersionError::NotFound { .. } => FailureClass::Fatal,
        }
    }
}

/// External environment flag consulted by availability checks.
pub trait PowerSaveSignal: Send + Sync {
    /// Returns true while the host is in power save mode.
    fn is_active(&self) -> bool;
}

/// Power save signal for hosts without one; never active.
pub struct NoPowerSave;

impl PowerSaveSignal for NoPowerSave {
    fn is_active(&self) -> bool {
        false
    }
}

/// Collaborator notified after every successful compilation.
///
/// The host uses this to drop state derived from the previous build, such as
/// remapped constant tables, that a fresh set of artifacts invalidates.
pub trait SuccessListener: Send + Sync {
    /// Called once per successful compilation, after artifacts are written.
    fn compilation_succeeded(&self);
}
