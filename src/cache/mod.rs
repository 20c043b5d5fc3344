//! Request-level cache and coalescing.
//!
//! When several preview refreshes ask for the same compilation (identical
//! units, identical build-graph state), only one build may actually run. The
//! [`RequestTracker`] enforces that: the first caller for a [`RequestId`]
//! becomes the producer, every later caller joins the in-flight request and
//! awaits the same broadcast result.
//!
//! ```text
//! Preview refresh A ─┐
//!                    │                             one
//! Preview refresh B ─┼──► RequestTracker ───────► compile
//!                    │        │                      │
//! Preview refresh C ─┘        │                      │
//!                             ▼                      ▼
//!                       [A, B, C all            [result kept
//!                        share result]◄──────────in cache]
//! ```
//!
//! Completed successes stay in a small bounded cache (insertion order, oldest
//! out first). Every other outcome is dropped the moment it completes:
//! a failed or aborted request must never be served stale to a second caller,
//! so an identical request afterwards re-executes from scratch.
//!
//! The index is guarded by a single mutex, held only for map operations and
//! never across a compile. This lock is always released before the
//! orchestrator's compile mutex is acquired, so joining an in-flight request
//! never blocks on a running build.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::daemon::CompilationResult;
use crate::request::RequestId;

/// Default bound on retained successful results.
pub const DEFAULT_RESULT_CAPACITY: usize = 5;

/// A finished request: the outcome plus where its artifacts were written.
#[derive(Debug, Clone)]
pub struct CompletedRequest {
    /// Outcome of the compilation.
    pub result: CompilationResult,
    /// Directory the daemon wrote artifacts to.
    pub output_dir: PathBuf,
}

/// What `register` decided for a caller.
pub enum Submission {
    /// A completed success was already cached for this id.
    Cached(CompletedRequest),
    /// Another caller is already producing this id; await the receiver.
    Joined(broadcast::Receiver<CompletedRequest>),
    /// This caller is the producer and must call [`RequestTracker::complete`]
    /// (or [`RequestTracker::cancel`]) for the id.
    Owner {
        /// The id the caller now owns.
        id: RequestId,
    },
}

impl Submission {
    /// Returns true if the caller became the producer.
    pub fn is_owner(&self) -> bool {
        matches!(self, Submission::Owner { .. })
    }
}

/// Index state, guarded by one mutex.
struct TrackerIndex {
    /// In-flight requests: id -> broadcast sender for the result.
    in_flight: HashMap<RequestId, broadcast::Sender<CompletedRequest>>,
    /// Completed successes in insertion order, oldest first.
    completed: VecDeque<(RequestId, CompletedRequest)>,
}

/// Tracks in-flight and recently completed compilation requests.
pub struct RequestTracker {
    index: Mutex<TrackerIndex>,
    capacity: usize,
    total_requests: AtomicU64,
    coalesced_requests: AtomicU64,
    new_requests: AtomicU64,
    cache_hits: AtomicU64,
}

/// Snapshot of tracker statistics.
#[derive(Debug, Default, Clone)]
pub struct TrackerStats {
    /// Total requests registered.
    pub total_requests: u64,
    /// Requests that joined an in-flight build.
    pub coalesced_requests: u64,
    /// Requests that became producers.
    pub new_requests: u64,
    /// Requests served from the completed cache.
    pub cache_hits: u64,
}

impl TrackerStats {
    /// Fraction of requests that avoided a fresh build (0.0 to 1.0).
    pub fn dedup_ratio(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            (self.coalesced_requests + self.cache_hits) as f64 / self.total_requests as f64
        }
    }
}

impl RequestTracker {
    /// Creates a tracker retaining at most `capacity` successful results.
    pub fn new(capacity: usize) -> Self {
        Self {
            index: Mutex::new(TrackerIndex {
                in_flight: HashMap::new(),
                completed: VecDeque::new(),
            }),
            capacity,
            total_requests: AtomicU64::new(0),
            coalesced_requests: AtomicU64::new(0),
            new_requests: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
        }
    }

    /// Registers a request for `id`.
    ///
    /// At most one caller becomes the producer for a given id at any time;
    /// everyone else receives either the cached result or a receiver for the
    /// in-flight one.
    pub fn register(&self, id: RequestId) -> Submission {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        let mut index = self.index.lock().unwrap();

        if let Some(hit) = index
            .completed
            .iter()
            .find(|(key, _)| *key == id)
            .map(|(_, done)| done.clone())
        {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            debug!(%id, "serving compilation result from cache");
            return Submission::Cached(hit);
        }

        if let Some(tx) = index.in_flight.get(&id) {
            self.coalesced_requests.fetch_add(1, Ordering::Relaxed);
            debug!(%id, "coalescing with in-flight compilation");
            return Submission::Joined(tx.subscribe());
        }

        // Capacity 16 covers the typical couple of concurrent joiners.
        let (tx, _rx) = broadcast::channel(16);
        index.in_flight.insert(id, tx);
        self.new_requests.fetch_add(1, Ordering::Relaxed);
        debug!(%id, "new compilation request");
        Submission::Owner { id }
    }

    /// Completes an in-flight request, waking every joined waiter.
    ///
    /// A `Success` enters the bounded result cache (evicting the oldest entry
    /// over capacity); any other outcome is dropped immediately so an
    /// identical request re-executes from scratch.
    pub fn complete(&self, id: RequestId, done: CompletedRequest) {
        let mut index = self.index.lock().unwrap();
        let Some(tx) = index.in_flight.remove(&id) else {
            return;
        };

        if done.result.is_success() {
            index.completed.push_back((id, done.clone()));
            while index.completed.len() > self.capacity {
                if let Some((evicted, _)) = index.completed.pop_front() {
                    debug!(id = %evicted, "evicted cached compilation result");
                }
            }
        }
        drop(index);

        let waiters = tx.receiver_count();
        let _ = tx.send(done);
        if waiters > 0 {
            debug!(%id, waiters, "broadcast compilation result to joined waiters");
        }
    }

    /// Cancels an in-flight request without a result.
    ///
    /// Dropping the sender closes the channel; joined waiters observe the
    /// closure and treat the request as aborted.
    pub fn cancel(&self, id: RequestId) {
        let removed = self.index.lock().unwrap().in_flight.remove(&id);
        if removed.is_some() {
            debug!(%id, "cancelled in-flight compilation request");
        }
    }

    /// Drops a cached result, forcing the next identical request to rebuild.
    pub fn invalidate(&self, id: RequestId) {
        self.index
            .lock()
            .unwrap()
            .completed
            .retain(|(key, _)| *key != id);
    }

    /// Number of waiters currently joined to an in-flight request.
    ///
    /// The producer holds no receiver, so this counts joiners only.
    pub fn waiter_count(&self, id: RequestId) -> usize {
        self.index
            .lock()
            .unwrap()
            .in_flight
            .get(&id)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }

    /// Number of requests currently in flight.
    pub fn in_flight_count(&self) -> usize {
        self.index.lock().unwrap().in_flight.len()
    }

    /// Number of cached successful results.
    pub fn cached_count(&self) -> usize {
        self.index.lock().unwrap().completed.len()
    }

    /// Returns a snapshot of the current statistics.
    pub fn stats(&self) -> TrackerStats {
        TrackerStats {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            coalesced_requests: self.coalesced_requests.load(Ordering::Relaxed),
            new_requests: self.new_requests.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
        }
    }

    /// Logs current statistics.
    pub fn log_stats(&self) {
        let stats = self.stats();
        info!(
            total = stats.total_requests,
            coalesced = stats.coalesced_requests,
            new = stats.new_requests,
            cache_hits = stats.cache_hits,
            in_flight = self.in_flight_count(),
            dedup_ratio = format!("{:.1}%", stats.dedup_ratio() * 100.0),
            "request tracker statistics"
        );
    }
}

impl Default for RequestTracker {
    fn default() -> Self {
        Self::new(DEFAULT_RESULT_CAPACITY)
    }
}
