//! Compilation orchestrator.
//!
//! The orchestrator is the top-level entry point of the fast preview
//! pipeline. It owns every other component by composition and wires them
//! into the request flow:
//!
//! ```text
//! caller ──► compile_request
//!               │
//!               ▼
//!         RequestTracker ── cached / joined ──► result
//!               │ (new)
//!               ▼
//!         compile mutex (one build at a time, globally)
//!               │
//!               ▼
//!         VersionLocator ──► DaemonRegistry ──► CompilerDaemon
//!               (retried)        (single-flight)      │
//!                                                     ▼
//!         circuit breaker ◄── classify ◄───── CompilationResult
//! ```
//!
//! The compile mutex is intentional and global: the embedded compiler
//! collaborator is not safely reentrant, so exactly one physical compilation
//! runs at a time regardless of fingerprint. Joining an in-flight request
//! never touches the mutex.
//!
//! Expected failures never cross `compile_request` as errors; every outcome
//! is a [`CompilationResult`] variant. Classified failures trip the circuit
//! breaker (see [`crate::breaker`]) unless auto-disable is switched off.

pub mod stats;
pub mod traits;

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::breaker::{CircuitState, DisableReason};
use crate::cache::{CompletedRequest, RequestTracker, Submission, TrackerStats};
use crate::daemon::registry::DaemonRegistry;
use crate::daemon::{CompilationResult, DaemonFactory};
use crate::events::{EventChannel, PreviewEvent};
use crate::request::{CompilationContext, CompilationUnit, RequestId};
use crate::retry::{RetryError, RetryingInvoker};
use crate::settings::SettingsStore;

use self::stats::{CompileSnapshot, CompileStats};
use self::traits::{NoPowerSave, PowerSaveSignal, SuccessListener, VersionError, VersionLocator};

/// Configuration for the orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Whether classified failures may disable the pipeline automatically.
    pub auto_disable: bool,
    /// Bound on retained successful results.
    pub result_cache_capacity: usize,
    /// Bound on a single daemon creation.
    pub daemon_creation_timeout: Duration,
    /// Attempt budget for lock-contention retries.
    pub retry_attempts: u32,
    /// Capacity of the lifecycle event channel.
    pub event_capacity: usize,
    /// Root directory for per-request output directories.
    pub output_root: PathBuf,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            auto_disable: true,
            result_cache_capacity: crate::cache::DEFAULT_RESULT_CAPACITY,
            daemon_creation_timeout: crate::daemon::registry::DEFAULT_CREATION_TIMEOUT,
            retry_attempts: crate::retry::DEFAULT_MAX_ATTEMPTS,
            event_capacity: crate::events::DEFAULT_EVENT_CAPACITY,
            output_root: std::env::temp_dir().join("fastpreview"),
        }
    }
}

impl OrchestratorConfig {
    /// Switches automatic disabling on classified failures on or off.
    pub fn with_auto_disable(mut self, auto_disable: bool) -> Self {
        self.auto_disable = auto_disable;
        self
    }

    /// Overrides the root directory for request output.
    pub fn with_output_root(mut self, output_root: impl Into<PathBuf>) -> Self {
        self.output_root = output_root.into();
        self
    }

    /// Overrides the daemon creation timeout.
    pub fn with_daemon_creation_timeout(mut self, timeout: Duration) -> Self {
        self.daemon_creation_timeout = timeout;
        self
    }
}

/// Circuit state plus the session-only marker, guarded together.
struct BreakerState {
    circuit: CircuitState,
    /// True while a non-persisted (session-only) disable is in effect.
    session_only: bool,
}

/// Top-level coordinator of the fast preview pipeline.
///
/// Constructed once per workspace session; owns the daemon registry, the
/// request tracker, the circuit state, and the event channel. Cheap to share
/// behind an `Arc`, which [`compile_request`](Self::compile_request)
/// requires so it can detach compile work onto background tasks.
pub struct CompilationOrchestrator {
    config: OrchestratorConfig,
    registry: DaemonRegistry,
    tracker: RequestTracker,
    events: EventChannel,
    settings: Arc<dyn SettingsStore>,
    version_locator: Arc<dyn VersionLocator>,
    power_save: Arc<dyn PowerSaveSignal>,
    success_listener: Option<Arc<dyn SuccessListener>>,
    retry: RetryingInvoker,
    state: Mutex<BreakerState>,
    /// Serializes all real compilation work across all requests.
    compile_lock: tokio::sync::Mutex<()>,
    stats: CompileStats,
    /// Parent token for every in-flight compile; cancelled on shutdown.
    shutdown_token: CancellationToken,
}

impl CompilationOrchestrator {
    /// Creates an orchestrator over the given collaborators.
    ///
    /// The initial circuit state comes from the persisted enabled flag.
    pub fn new(
        config: OrchestratorConfig,
        factory: Arc<dyn DaemonFactory>,
        settings: Arc<dyn SettingsStore>,
        version_locator: Arc<dyn VersionLocator>,
    ) -> Self {
        let circuit = if settings.is_enabled() {
            CircuitState::Enabled
        } else {
            CircuitState::Disabled(DisableReason::user_requested())
        };

        Self {
            registry: DaemonRegistry::new(factory)
                .with_creation_timeout(config.daemon_creation_timeout),
            tracker: RequestTracker::new(config.result_cache_capacity),
            events: EventChannel::new(config.event_capacity),
            settings,
            version_locator,
            power_save: Arc::new(NoPowerSave),
            success_listener: None,
            retry: RetryingInvoker::new(config.retry_attempts),
            state: Mutex::new(BreakerState {
                circuit,
                session_only: false,
            }),
            compile_lock: tokio::sync::Mutex::new(()),
            stats: CompileStats::default(),
            shutdown_token: CancellationToken::new(),
            config,
        }
    }

    /// Wires in the host's power save signal.
    pub fn with_power_save_signal(mut self, signal: Arc<dyn PowerSaveSignal>) -> Self {
        self.power_save = signal;
        self
    }

    /// Wires in the collaborator notified after successful builds.
    pub fn with_success_listener(mut self, listener: Arc<dyn SuccessListener>) -> Self {
        self.success_listener = Some(listener);
        self
    }

    /// Registers a lifecycle event subscriber.
    pub fn subscribe(&self) -> broadcast::Receiver<PreviewEvent> {
        self.events.subscribe()
    }

    /// Returns true if the circuit breaker permits preview builds.
    pub fn is_enabled(&self) -> bool {
        self.state.lock().unwrap().circuit.is_enabled()
    }

    /// Returns true if preview builds may run right now.
    ///
    /// Derived, never stored: enabled and not in power save mode.
    pub fn is_available(&self) -> bool {
        self.is_enabled() && !self.power_save.is_active()
    }

    /// The current disable reason, when disabled.
    pub fn disable_reason(&self) -> Option<DisableReason> {
        self.state.lock().unwrap().circuit.reason().cloned()
    }

    /// Compilation metrics snapshot.
    pub fn stats(&self) -> CompileSnapshot {
        self.stats.snapshot()
    }

    /// Request dedup statistics snapshot.
    pub fn tracker_stats(&self) -> TrackerStats {
        self.tracker.stats()
    }

    /// Compiles the given units, or joins an identical in-flight request.
    ///
    /// Returns the outcome and the directory artifacts were (or would have
    /// been) written to. Expected failures come back as result variants;
    /// this method never returns an error.
    ///
    /// Cancelling `cancel` while joined to another caller's build abandons
    /// only this caller's wait. Cancelling as the first caller aborts the
    /// underlying build only if nobody else has joined it; otherwise the
    /// build is detached and runs to completion for the joiners.
    pub async fn compile_request(
        self: &Arc<Self>,
        units: Vec<CompilationUnit>,
        context: CompilationContext,
        cancel: CancellationToken,
    ) -> (CompilationResult, PathBuf) {
        let id = RequestId::of(&units, &context);
        let output_dir = self.config.output_root.join(id.to_string());
        self.stats.record_request();

        match self.tracker.register(id) {
            Submission::Cached(done) => (done.result, done.output_dir),

            Submission::Joined(mut rx) => {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!(%id, "caller cancelled while joined to an in-flight build");
                        (
                            CompilationResult::Aborted {
                                cause: Some("cancelled while waiting for an in-flight build".to_string()),
                            },
                            output_dir,
                        )
                    }
                    received = rx.recv() => match received {
                        Ok(done) => (done.result, done.output_dir),
                        Err(_) => (
                            CompilationResult::Aborted {
                                cause: Some("in-flight build was cancelled".to_string()),
                            },
                            output_dir,
                        ),
                    },
                }
            }

            Submission::Owner { .. } => {
                // Run the build on a detached task so a cancelled caller does
                // not tear down work that joiners still depend on.
                let compile_cancel = self.shutdown_token.child_token();
                let mut task = tokio::spawn(Arc::clone(self).run_compile(
                    id,
                    units,
                    context,
                    output_dir.clone(),
                    compile_cancel.clone(),
                ));

                tokio::select! {
                    finished = &mut task => match finished {
                        Ok(done) => (done.result, done.output_dir),
                        Err(err) => {
                            // A panic in the compile task would leave joiners
                            // waiting forever; close the request out.
                            error!(%id, error = %err, "compilation task failed");
                            self.tracker.cancel(id);
                            (
                                CompilationResult::RequestException {
                                    cause: format!("compilation task failed: {err}"),
                                },
                                output_dir,
                            )
                        }
                    },
                    _ = cancel.cancelled() => {
                        if self.tracker.waiter_count(id) == 0 {
                            debug!(%id, "sole caller cancelled, aborting the in-flight build");
                            compile_cancel.cancel();
                        } else {
                            debug!(%id, "caller cancelled, build continues for joined waiters");
                        }
                        (
                            CompilationResult::Aborted {
                                cause: Some("cancelled by the caller".to_string()),
                            },
                            output_dir,
                        )
                    }
                }
            }
        }
    }

    /// Produces one compilation result and completes the tracked request.
    async fn run_compile(
        self: Arc<Self>,
        id: RequestId,
        units: Vec<CompilationUnit>,
        context: CompilationContext,
        output_dir: PathBuf,
        cancel: CancellationToken,
    ) -> CompletedRequest {
        let started = Instant::now();
        let file_count = units.len();

        let result = self.execute(id, &units, &context, &output_dir, &cancel).await;
        let duration = started.elapsed();

        if self.config.auto_disable && result.is_failure() {
            if let Some(reason) = DisableReason::classify(&result) {
                self.disable(reason);
            }
        }

        self.stats.record_outcome(&result, duration, file_count);
        if result.is_success() {
            if let Some(listener) = &self.success_listener {
                listener.compilation_succeeded();
            }
            info!(%id, ?duration, files = file_count, "compilation succeeded");
        } else if result.is_aborted() {
            debug!(%id, "compilation aborted");
        } else {
            warn!(%id, ?duration, "compilation failed");
        }

        self.events.publish(PreviewEvent::CompilationComplete {
            request_id: id,
            result: result.clone(),
            duration,
            file_count,
        });

        let done = CompletedRequest { result, output_dir };
        self.tracker.complete(id, done.clone());
        done
    }

    /// Runs one compilation under the global compile mutex.
    ///
    /// The mutex wait is the sole blocking point that gates real compilation;
    /// every suspension point below observes the cancellation token.
    async fn execute(
        &self,
        id: RequestId,
        units: &[CompilationUnit],
        context: &CompilationContext,
        output_dir: &std::path::Path,
        cancel: &CancellationToken,
    ) -> CompilationResult {
        let _serial = tokio::select! {
            guard = self.compile_lock.lock() => guard,
            _ = cancel.cancelled() => {
                return CompilationResult::Aborted {
                    cause: Some("cancelled while waiting for the compile slot".to_string()),
                };
            }
        };

        // The runtime version comes from build-graph state that a concurrent
        // write can invalidate mid-read; re-run the read under the bounded
        // retry policy.
        let locator = Arc::clone(&self.version_locator);
        let retry_context = context.clone();
        let resolved = self
            .retry
            .retry(
                cancel,
                |err: &VersionError| err.class(),
                move || {
                    let locator = Arc::clone(&locator);
                    let context = retry_context.clone();
                    async move { locator.runtime_version(&context) }
                },
            )
            .await;
        let version = match resolved {
            Ok(version) => version,
            Err(RetryError::Cancelled) => {
                return CompilationResult::Aborted {
                    cause: Some("cancelled while resolving the runtime version".to_string()),
                };
            }
            Err(err) => {
                return CompilationResult::RequestException {
                    cause: err.to_string(),
                };
            }
        };

        let daemon = tokio::select! {
            created = self.registry.get_or_create(&version) => match created {
                Ok(daemon) => daemon,
                Err(err) => {
                    return CompilationResult::DaemonStartFailure {
                        cause: err.to_string(),
                    };
                }
            },
            _ = cancel.cancelled() => {
                return CompilationResult::Aborted {
                    cause: Some("cancelled while starting the compiler daemon".to_string()),
                };
            }
        };

        self.events.publish(PreviewEvent::CompilationStarted {
            request_id: id,
            file_count: units.len(),
        });
        info!(%id, version = %version, files = units.len(), "compilation started");

        if let Err(err) = std::fs::create_dir_all(output_dir) {
            return CompilationResult::RequestException {
                cause: format!("failed to create output directory: {err}"),
            };
        }

        if cancel.is_cancelled() {
            return CompilationResult::Aborted {
                cause: Some("cancelled before dispatching to the daemon".to_string()),
            };
        }

        daemon.compile(units, context, output_dir, cancel).await
    }

    /// Disables preview builds for the given reason. Idempotent.
    ///
    /// A session-only reason (see [`DisableReason::is_session_only`]) leaves
    /// the persisted flag untouched; any other reason persists the disable.
    /// Publishes a status change only on an actual Enabled to Disabled
    /// transition; re-disabling updates the stored reason silently.
    pub fn disable(&self, reason: DisableReason) {
        let session_only = reason.is_session_only();
        let transitioned = {
            let mut state = self.state.lock().unwrap();
            let transitioned = state.circuit.is_enabled();
            state.session_only = session_only;
            state.circuit = CircuitState::Disabled(reason.clone());
            transitioned
        };

        if !session_only {
            self.settings.set_enabled(false);
        }

        if let Some(description) = reason.description() {
            // The only place the raw failure detail is surfaced.
            warn!(
                title = reason.title(),
                description,
                cause = ?reason.cause(),
                "fast preview disabled"
            );
        }

        if transitioned {
            info!(reason = reason.title(), "fast preview disabled");
            self.events.publish(PreviewEvent::StatusChanged {
                enabled: false,
                reason: Some(reason.title().to_string()),
            });
        }
    }

    /// Re-enables preview builds. Idempotent.
    ///
    /// Clears the disable reason and the session-only marker, persists the
    /// enabled flag, and publishes a status change only on an actual
    /// transition.
    pub fn enable(&self) {
        let transitioned = {
            let mut state = self.state.lock().unwrap();
            let transitioned = !state.circuit.is_enabled();
            state.circuit = CircuitState::Enabled;
            state.session_only = false;
            transitioned
        };

        self.settings.set_enabled(true);

        if transitioned {
            info!("fast preview enabled");
            self.events.publish(PreviewEvent::StatusChanged {
                enabled: true,
                reason: None,
            });
        }
    }

    /// Cancels every in-flight compile and disposes all daemons.
    pub fn shutdown(&self) {
        info!("shutting down fast preview orchestrator");
        self.shutdown_token.cancel();
        self.registry.stop_all();
    }
}
