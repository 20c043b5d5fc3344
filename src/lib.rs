//! FastPreview - background compile-daemon orchestration for incremental preview builds.
//!
//! This library coordinates a pool of long-lived compiler daemons (one per
//! required runtime version) behind a single orchestrator that deduplicates
//! concurrent requests, caches recent results, retries lock-contention
//! failures, and auto-disables itself when the compiler keeps failing on
//! input it cannot handle.
//!
//! # High-Level API
//!
//! The [`orchestrator`] module provides the entry point:
//!
//! ```ignore
//! use std::sync::Arc;
//! use fastpreview::orchestrator::{CompilationOrchestrator, OrchestratorConfig};
//! use fastpreview::settings::MemorySettingsStore;
//! use tokio_util::sync::CancellationToken;
//!
//! let orchestrator = Arc::new(CompilationOrchestrator::new(
//!     OrchestratorConfig::default(),
//!     daemon_factory,
//!     Arc::new(MemorySettingsStore::default()),
//!     version_locator,
//! ));
//!
//! let (result, output_dir) = orchestrator
//!     .compile_request(units, context, CancellationToken::new())
//!     .await;
//! ```

pub mod breaker;
pub mod cache;
pub mod daemon;
pub mod events;
pub mod logging;
pub mod orchestrator;
pub mod request;
pub mod retry;
pub mod settings;

/// Version of the FastPreview library.
///
/// The version is defined in `Cargo.toml` and injected at compile time.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
