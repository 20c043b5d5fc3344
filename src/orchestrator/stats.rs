//! Compilation metrics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::daemon::CompilationResult;

/// Lock-free counters for compilation outcomes.
#[derive(Debug, Default)]
pub struct CompileStats {
    requests: AtomicU64,
    compiles: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    aborts: AtomicU64,
    files_compiled: AtomicU64,
    total_duration_ms: AtomicU64,
    last_duration_ms: AtomicU64,
}

impl CompileStats {
    /// Records one incoming request, before dedup.
    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    /// Records one finished compilation.
    pub fn record_outcome(&self, result: &CompilationResult, duration: Duration, files: usize) {
        self.compiles.fetch_add(1, Ordering::Relaxed);
        self.files_compiled.fetch_add(files as u64, Ordering::Relaxed);

        let millis = duration.as_millis() as u64;
        self.total_duration_ms.fetch_add(millis, Ordering::Relaxed);
        self.last_duration_ms.store(millis, Ordering::Relaxed);

        if result.is_success() {
            self.successes.fetch_add(1, Ordering::Relaxed);
        } else if result.is_aborted() {
            self.aborts.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Returns a point-in-time snapshot.
    pub fn snapshot(&self) -> CompileSnapshot {
        CompileSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            compiles: self.compiles.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            aborts: self.aborts.load(Ordering::Relaxed),
            files_compiled: self.files_compiled.load(Ordering::Relaxed),
            total_duration: Duration::from_millis(self.total_duration_ms.load(Ordering::Relaxed)),
            last_duration: Duration::from_millis(self.last_duration_ms.load(Ordering::Relaxed)),
        }
    }
}

/// A point-in-time snapshot of compilation metrics.
#[derive(Debug, Clone)]
pub struct CompileSnapshot {
    /// Requests received, before dedup.
    pub requests: u64,
    /// Compilations actually executed.
    pub compiles: u64,
    /// Compilations that produced artifacts.
    pub successes: u64,
    /// Compilations that failed.
    pub failures: u64,
    /// Compilations that were cancelled.
    pub aborts: u64,
    /// Source units across all executed compilations.
    pub files_compiled: u64,
    /// Total wall-clock time spent compiling.
    pub total_duration: Duration,
    /// Duration of the most recent compilation.
    pub last_duration: Duration,
}

impl CompileSnapshot {
    /// Mean compilation duration, or zero before the first compile.
    pub fn average_duration(&self) -> Duration {
        if self.compiles == 0 {
            Duration::ZERO
        } else {
            self.total_duration / self.compiles as u32
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcomes_are_bucketed() {
        let stats = CompileStats::default();

        stats.record_request();
        stats.record_request();
        stats.record_outcome(&CompilationResult::Success, Duration::from_millis(100), 2);
        stats.record_outcome(
            &CompilationResult::DaemonError { code: 1 },
            Duration::from_millis(50),
            1,
        );
        stats.record_outcome(
            &CompilationResult::Aborted { cause: None },
            Duration::from_millis(10),
            1,
        );

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.requests, 2);
        assert_eq!(snapshot.compiles, 3);
        assert_eq!(snapshot.successes, 1);
        assert_eq!(snapshot.failures, 1);
        assert_eq!(snapshot.aborts, 1);
        assert_eq!(snapshot.files_compiled, 4);
        assert_eq!(snapshot.last_duration, Duration::from_millis(10));
    }

    #[test]
    fn test_average_duration_before_first_compile_is_zero() {
        let stats = CompileStats::default();

        assert_eq!(stats.snapshot().average_duration(), Duration::ZERO);
    }
}
