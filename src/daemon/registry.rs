//! Daemon registry with single-flight creation.
//!
//! The registry owns the map of runtime version to daemon handle. Daemons are
//! created lazily and exactly once per version even under concurrent demand:
//! the first caller for a version starts creation on a background task, and
//! every concurrent caller for the same version subscribes to the same
//! outcome instead of starting a second daemon.
//!
//! Uses `DashMap` for atomic check-and-insert on the slot map and a tokio
//! broadcast channel to fan one creation outcome out to all waiters.

use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::{CompilerDaemon, DaemonFactory, DaemonStartError};

/// Default bound on how long a single daemon creation may take.
pub const DEFAULT_CREATION_TIMEOUT: Duration = Duration::from_secs(10);

/// Outcome of one daemon creation, fanned out to every waiter.
type CreationOutcome = Result<Arc<dyn CompilerDaemon>, RegistryError>;

/// Errors surfaced by [`DaemonRegistry::get_or_create`].
///
/// Cloneable so a single creation failure can be delivered to every
/// concurrent waiter.
#[derive(Debug, Clone, Error)]
pub enum RegistryError {
    /// The factory failed to start the daemon.
    #[error(transparent)]
    Start(#[from] DaemonStartError),

    /// The daemon did not start within the configured bound.
    #[error("compiler daemon for runtime {version} did not start within {timeout:?}")]
    Timeout {
        /// Runtime version the daemon was requested for.
        version: String,
        /// The bound that was exceeded.
        timeout: Duration,
    },

    /// The registry was shut down while the daemon was starting.
    #[error("daemon registry shut down while starting runtime {version}")]
    Shutdown {
        /// Runtime version the daemon was requested for.
        version: String,
    },
}

/// One slot in the registry: either a live daemon or an in-flight creation.
enum Slot {
    Ready(Arc<dyn CompilerDaemon>),
    Starting(broadcast::Sender<CreationOutcome>),
}

/// What `get_or_create` decided under the slot entry lock.
enum Claim {
    Join(broadcast::Receiver<CreationOutcome>),
    Create {
        tx: broadcast::Sender<CreationOutcome>,
        rx: broadcast::Receiver<CreationOutcome>,
    },
}

/// Registry of compiler daemons, one per runtime version.
pub struct DaemonRegistry {
    factory: Arc<dyn DaemonFactory>,
    /// Slot map shared with background creation tasks.
    slots: Arc<DashMap<String, Slot>>,
    creation_timeout: Duration,
}

impl DaemonRegistry {
    /// Creates a registry backed by the given factory.
    pub fn new(factory: Arc<dyn DaemonFactory>) -> Self {
        Self {
            factory,
            slots: Arc::new(DashMap::new()),
            creation_timeout: DEFAULT_CREATION_TIMEOUT,
        }
    }

    /// Overrides the daemon creation timeout.
    pub fn with_creation_timeout(mut self, timeout: Duration) -> Self {
        self.creation_timeout = timeout;
        self
    }

    /// Returns the daemon for `version`, starting one if needed.
    ///
    /// Concurrent callers for the same version share a single creation; a
    /// creation failure is delivered to every waiter, and the version is
    /// eligible for a fresh attempt on the next call. A registered daemon
    /// whose liveness probe fails is disposed and replaced.
    pub async fn get_or_create(
        &self,
        version: &str,
    ) -> Result<Arc<dyn CompilerDaemon>, RegistryError> {
        // Decide under the entry lock, then await outside it.
        let claim = match self.slots.entry(version.to_string()) {
            Entry::Occupied(mut entry) => {
                let live = match entry.get() {
                    Slot::Ready(daemon) if daemon.is_running() => {
                        return Ok(Arc::clone(daemon));
                    }
                    Slot::Ready(_) => None,
                    Slot::Starting(tx) => Some(Claim::Join(tx.subscribe())),
                };
                match live {
                    Some(claim) => claim,
                    None => {
                        let (tx, rx) = broadcast::channel(8);
                        if let Slot::Ready(dead) = entry.insert(Slot::Starting(tx.clone())) {
                            warn!(version, "compiler daemon is no longer running, restarting");
                            dead.dispose();
                        }
                        Claim::Create { tx, rx }
                    }
                }
            }
            Entry::Vacant(entry) => {
                let (tx, rx) = broadcast::channel(8);
                entry.insert(Slot::Starting(tx.clone()));
                Claim::Create { tx, rx }
            }
        };

        let mut rx = match claim {
            Claim::Join(rx) => {
                debug!(version, "joining in-flight daemon creation");
                rx
            }
            Claim::Create { tx, rx } => {
                info!(version, "starting compiler daemon");
                self.spawn_creation(version.to_string(), tx);
                rx
            }
        };

        match rx.recv().await {
            Ok(outcome) => outcome,
            // Sender dropped without an outcome: the registry was drained.
            Err(_) => Err(RegistryError::Shutdown {
                version: version.to_string(),
            }),
        }
    }

    /// Drives one daemon creation to completion on a background task.
    fn spawn_creation(&self, version: String, tx: broadcast::Sender<CreationOutcome>) {
        let future = self.factory.create(&version);
        let slots = Arc::clone(&self.slots);
        let timeout = self.creation_timeout;

        tokio::spawn(async move {
            let outcome = match tokio::time::timeout(timeout, future).await {
                Ok(Ok(daemon)) => Ok(daemon),
                Ok(Err(err)) => Err(RegistryError::Start(err)),
                Err(_) => Err(RegistryError::Timeout {
                    version: version.clone(),
                    timeout,
                }),
            };

            match &outcome {
                Ok(daemon) => {
                    // A creation that finishes after stop_all() drained the
                    // map re-registers here; stop_all is documented as not
                    // linearizable with subsequent creations.
                    slots.insert(version.clone(), Slot::Ready(Arc::clone(daemon)));
                    info!(version = %version, "compiler daemon ready");
                }
                Err(err) => {
                    slots.remove_if(&version, |_, slot| matches!(slot, Slot::Starting(_)));
                    warn!(version = %version, error = %err, "compiler daemon creation failed");
                }
            }

            let _ = tx.send(outcome);
        });
    }

    /// Number of live daemons currently registered.
    pub fn daemon_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|entry| matches!(entry.value(), Slot::Ready(_)))
            .count()
    }

    /// Drains the registry and disposes every live daemon.
    ///
    /// Waiters on an in-flight creation observe [`RegistryError::Shutdown`]
    /// unless the creation task delivers its outcome first. Safe to call
    /// concurrently with `get_or_create`; a daemon registered after the drain
    /// snapshot is not torn down by this call.
    pub fn stop_all(&self) {
        let versions: Vec<String> = self.slots.iter().map(|entry| entry.key().clone()).collect();
        let mut disposed = 0usize;

        for version in versions {
            if let Some((_, slot)) = self.slots.remove(&version) {
                match slot {
                    Slot::Ready(daemon) => {
                        daemon.dispose();
                        disposed += 1;
                    }
                    Slot::Starting(tx) => drop(tx),
                }
            }
        }

        info!(disposed, "stopped all compiler daemons");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::CompilationResult;
    use crate::request::{CompilationContext, CompilationUnit};
    use futures::future::BoxFuture;
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio_util::sync::CancellationToken;

    struct StubDaemon {
        running: AtomicBool,
        disposals: AtomicUsize,
    }

    impl StubDaemon {
        fn new() -> Self {
            Self {
                running: AtomicBool::new(true),
                disposals: AtomicUsize::new(0),
            }
        }
    }

    impl CompilerDaemon for StubDaemon {
        fn is_running(&self) -> bool {
            self.running.load(Ordering::SeqCst)
        }

        fn compile<'a>(
            &'a self,
            _units: &'a [CompilationUnit],
            _context: &'a CompilationContext,
            _output_dir: &'a Path,
            _cancel: &'a CancellationToken,
        ) -> BoxFuture<'a, CompilationResult> {
            Box::pin(async { CompilationResult::Success })
        }

        fn dispose(&self) {
            self.running.store(false, Ordering::SeqCst);
            self.disposals.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Factory that counts invocations and optionally sleeps or fails.
    struct CountingFactory {
        created: Arc<AtomicUsize>,
        delay: Duration,
        fail: Arc<AtomicBool>,
    }

    impl CountingFactory {
        fn new(delay: Duration) -> Self {
            Self {
                created: Arc::new(AtomicUsize::new(0)),
                delay,
                fail: Arc::new(AtomicBool::new(false)),
            }
        }
    }

    impl DaemonFactory for CountingFactory {
        fn create(
            &self,
            version: &str,
        ) -> BoxFuture<'static, Result<Arc<dyn CompilerDaemon>, DaemonStartError>> {
            let created = Arc::clone(&self.created);
            let fail = Arc::clone(&self.fail);
            let delay = self.delay;
            let version = version.to_string();

            Box::pin(async move {
                tokio::time::sleep(delay).await;
                created.fetch_add(1, Ordering::SeqCst);
                if fail.load(Ordering::SeqCst) {
                    Err(DaemonStartError::new(version, "stub failure"))
                } else {
                    Ok(Arc::new(StubDaemon::new()) as Arc<dyn CompilerDaemon>)
                }
            })
        }
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_creation() {
        let factory = Arc::new(CountingFactory::new(Duration::from_millis(100)));
        let created = Arc::clone(&factory.created);
        let registry = Arc::new(DaemonRegistry::new(factory));

        let mut handles = vec![];
        for _ in 0..5 {
            let registry = Arc::clone(&registry);
            handles.push(tokio::spawn(async move {
                registry.get_or_create("1.2.0").await
            }));
        }

        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }

        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert_eq!(registry.daemon_count(), 1);
    }

    #[tokio::test]
    async fn test_distinct_versions_get_distinct_daemons() {
        let factory = Arc::new(CountingFactory::new(Duration::from_millis(5)));
        let created = Arc::clone(&factory.created);
        let registry = DaemonRegistry::new(factory);

        registry.get_or_create("1.2.0").await.unwrap();
        registry.get_or_create("1.3.0").await.unwrap();

        assert_eq!(created.load(Ordering::SeqCst), 2);
        assert_eq!(registry.daemon_count(), 2);
    }

    #[tokio::test]
    async fn test_creation_failure_reaches_all_waiters_and_is_retriable() {
        let factory = Arc::new(CountingFactory::new(Duration::from_millis(50)));
        factory.fail.store(true, Ordering::SeqCst);
        let created = Arc::clone(&factory.created);
        let fail = Arc::clone(&factory.fail);
        let registry = Arc::new(DaemonRegistry::new(factory));

        let mut handles = vec![];
        for _ in 0..3 {
            let registry = Arc::clone(&registry);
            handles.push(tokio::spawn(async move {
                registry.get_or_create("1.2.0").await
            }));
        }

        for handle in handles {
            let outcome = handle.await.unwrap();
            assert!(matches!(outcome, Err(RegistryError::Start(_))));
        }
        assert_eq!(created.load(Ordering::SeqCst), 1);

        // The version is eligible again once the failed creation is cleared.
        fail.store(false, Ordering::SeqCst);
        assert!(registry.get_or_create("1.2.0").await.is_ok());
        assert_eq!(created.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_creation_timeout_is_bounded() {
        let factory = Arc::new(CountingFactory::new(Duration::from_secs(60)));
        let registry =
            DaemonRegistry::new(factory).with_creation_timeout(Duration::from_millis(50));

        let outcome = registry.get_or_create("1.2.0").await;

        assert!(matches!(outcome, Err(RegistryError::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_stop_all_disposes_live_daemons() {
        let factory = Arc::new(CountingFactory::new(Duration::from_millis(5)));
        let registry = DaemonRegistry::new(factory);

        let daemon = registry.get_or_create("1.2.0").await.unwrap();
        assert!(daemon.is_running());

        registry.stop_all();

        assert!(!daemon.is_running());
        assert_eq!(registry.daemon_count(), 0);
    }

    #[tokio::test]
    async fn test_dead_daemon_is_replaced_on_next_lookup() {
        let factory = Arc::new(CountingFactory::new(Duration::from_millis(5)));
        let created = Arc::clone(&factory.created);
        let registry = DaemonRegistry::new(factory);

        let first = registry.get_or_create("1.2.0").await.unwrap();
        first.dispose();
        assert!(!first.is_running());

        let second = registry.get_or_create("1.2.0").await.unwrap();

        assert!(second.is_running());
        assert_eq!(created.load(Ordering::SeqCst), 2);
    }
}
