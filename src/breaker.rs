//! Circuit breaker state for the fast preview pipeline.
//!
//! When the compiler keeps failing on input it cannot handle, the pipeline
//! disables itself instead of burning builds on every keystroke. This module
//! holds the state machine's vocabulary: the circuit is either `Enabled` or
//! `Disabled(reason)`, transitions to `Disabled` happen automatically on
//! classified failures or manually, and only an explicit user action brings
//! it back.

use crate::daemon::CompilationResult;

/// Message prefixes that mark a plain analysis error the user is likely
/// still typing through. These must never disable the feature.
const ANALYSIS_ERROR_PREFIXES: &[&str] = &["syntax error", "compilation error"];

/// Why the pipeline was disabled.
///
/// The title is short and always present; the description carries the longer
/// detail worth surfacing to the user, and the cause the rendered failure
/// that triggered the disable. A reason with a description that did not come
/// from the user is kept session-only: it is not persisted, so the feature
/// comes back on the next session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisableReason {
    title: String,
    description: Option<String>,
    cause: Option<String>,
    manual: bool,
}

impl DisableReason {
    /// The user switched the feature off.
    pub fn user_requested() -> Self {
        Self {
            title: "disabled by user".to_string(),
            description: None,
            cause: None,
            manual: true,
        }
    }

    /// The compiler daemon could not be started.
    pub fn daemon_start_failure(cause: impl Into<String>) -> Self {
        Self {
            title: "unable to start the compiler daemon".to_string(),
            description: Some(
                "The compiler daemon for the project's runtime version could not \
                 be started. Preview builds are disabled for this session."
                    .to_string(),
            ),
            cause: Some(cause.into()),
            manual: false,
        }
    }

    /// The daemon replied with a structured failure code.
    ///
    /// No raw detail is carried: daemon failure codes are internal.
    pub fn compiler_error() -> Self {
        Self {
            title: "unable to compile (compiler error)".to_string(),
            description: None,
            cause: None,
            manual: false,
        }
    }

    /// A failure surfaced while preparing or dispatching the request.
    pub fn request_exception(cause: impl Into<String>) -> Self {
        let cause = cause.into();
        Self {
            title: "unable to send the compilation request".to_string(),
            description: Some(format!(
                "An unexpected failure occurred while dispatching the preview \
                 build: {cause}"
            )),
            cause: Some(cause),
            manual: false,
        }
    }

    /// Short reason title.
    pub fn title(&self) -> &str {
        &self.title
    }

    /// Longer detail, when the reason carries one.
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Rendered failure that triggered the disable, when one is known.
    pub fn cause(&self) -> Option<&str> {
        self.cause.as_deref()
    }

    /// Returns true if the disable came from an explicit user action.
    pub fn is_manual(&self) -> bool {
        self.manual
    }

    /// Returns true if this disable lives for the session only.
    ///
    /// Automatic disables that carry a long description are not persisted;
    /// manual disables and bare automatic ones are.
    pub fn is_session_only(&self) -> bool {
        !self.manual && self.description.is_some()
    }

    /// Classifies a compilation outcome into an auto-disable reason.
    ///
    /// Returns `None` for outcomes that never disable the feature: success,
    /// aborts (the user is mid-edit), and request failures whose message is a
    /// plain analysis error.
    pub fn classify(result: &CompilationResult) -> Option<Self> {
        match result {
            CompilationResult::Success | CompilationResult::Aborted { .. } => None,
            CompilationResult::DaemonStartFailure { cause } => {
                Some(Self::daemon_start_failure(cause))
            }
            CompilationResult::DaemonError { .. } => Some(Self::compiler_error()),
            CompilationResult::RequestException { cause } => {
                if is_analysis_error(cause) {
                    None
                } else {
                    Some(Self::request_exception(cause))
                }
            }
        }
    }
}

/// The pipeline's kill-switch state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CircuitState {
    /// Preview builds may run.
    Enabled,
    /// Preview builds are switched off for the given reason.
    Disabled(DisableReason),
}

impl CircuitState {
    /// Returns true if preview builds may run.
    pub fn is_enabled(&self) -> bool {
        matches!(self, CircuitState::Enabled)
    }

    /// The disable reason, when disabled.
    pub fn reason(&self) -> Option<&DisableReason> {
        match self {
            CircuitState::Enabled => None,
            CircuitState::Disabled(reason) => Some(reason),
        }
    }
}

/// Returns true if the message reads as a plain analysis error.
fn is_analysis_error(message: &str) -> bool {
    let message = message.trim_start().to_ascii_lowercase();
    ANALYSIS_ERROR_PREFIXES
        .iter()
        .any(|prefix| message.starts_with(prefix))
}
