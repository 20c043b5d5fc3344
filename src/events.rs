//! Typed lifecycle events.
//!
//! The orchestrator is the sole producer of [`PreviewEvent`]s; anything that
//! wants to observe the pipeline (an editor surface, a status widget, a test)
//! subscribes to the channel. There is no global bus: the channel is owned by
//! the orchestrator and handed out by subscription only.

use std::time::Duration;

use tokio::sync::broadcast;
use tracing::trace;

use crate::daemon::CompilationResult;
use crate::request::RequestId;

/// Default capacity of the event channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 64;

/// Lifecycle event emitted by the orchestrator.
#[derive(Debug, Clone)]
pub enum PreviewEvent {
    /// A compilation left the queue and started on a daemon.
    CompilationStarted {
        /// Fingerprint of the request.
        request_id: RequestId,
        /// Number of source units in the request.
        file_count: usize,
    },
    /// A compilation finished with the given outcome.
    CompilationComplete {
        /// Fingerprint of the request.
        request_id: RequestId,
        /// Outcome of the compilation.
        result: CompilationResult,
        /// Wall-clock duration of the compilation.
        duration: Duration,
        /// Number of source units in the request.
        file_count: usize,
    },
    /// The pipeline was enabled or disabled.
    StatusChanged {
        /// Whether preview builds may now run.
        enabled: bool,
        /// Title of the disable reason, when disabling.
        reason: Option<String>,
    },
}

/// Broadcast channel for [`PreviewEvent`]s.
///
/// Publishing never blocks and never fails: events are fire-and-forget, and
/// a send with no live subscribers is simply dropped.
pub struct EventChannel {
    tx: broadcast::Sender<PreviewEvent>,
}

impl EventChannel {
    /// Creates a channel retaining up to `capacity` undelivered events per
    /// subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Registers a new subscriber.
    pub fn subscribe(&self) -> broadcast::Receiver<PreviewEvent> {
        self.tx.subscribe()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Publishes an event to every subscriber.
    pub(crate) fn publish(&self, event: PreviewEvent) {
        trace!(?event, "publishing preview event");
        let _ = self.tx.send(event);
    }
}

impl Default for EventChannel {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{CompilationContext, CompilationUnit};

    fn request_id() -> RequestId {
        RequestId::of(
            &[CompilationUnit::new("a.kt", 1)],
            &CompilationContext::new("app", 1),
        )
    }

    #[tokio::test]
    async fn test_subscribers_receive_published_events() {
        let channel = EventChannel::default();
        let mut rx = channel.subscribe();

        channel.publish(PreviewEvent::CompilationStarted {
            request_id: request_id(),
            file_count: 2,
        });

        match rx.recv().await.unwrap() {
            PreviewEvent::CompilationStarted { file_count, .. } => assert_eq!(file_count, 2),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_dropped() {
        let channel = EventChannel::default();

        // Must not panic or block.
        channel.publish(PreviewEvent::StatusChanged {
            enabled: false,
            reason: Some("disabled by user".to_string()),
        });

        assert_eq!(channel.subscriber_count(), 0);
    }
}
