//! Persisted pipeline settings.
//!
//! The only persisted knob is the fast-preview-enabled flag, default `true`.
//! The orchestrator reads it once at construction and writes it when the user
//! enables or disables the feature; session-only disables never touch it.
//!
//! [`SettingsStore`] abstracts the host's key-value store. Two
//! implementations are provided: an in-memory store for tests and embedding,
//! and an INI-file-backed store.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use ini::Ini;
use tracing::warn;

const SECTION: &str = "preview";
const ENABLED_KEY: &str = "enabled";

/// Host-facing handle to the persisted settings.
pub trait SettingsStore: Send + Sync {
    /// Reads the persisted fast-preview-enabled flag. Defaults to `true`
    /// when nothing has been persisted yet.
    fn is_enabled(&self) -> bool;

    /// Persists the fast-preview-enabled flag.
    fn set_enabled(&self, enabled: bool);
}

/// In-memory settings, lost on drop.
pub struct MemorySettingsStore {
    enabled: AtomicBool,
}

impl MemorySettingsStore {
    /// Creates a store with the given initial flag.
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled: AtomicBool::new(enabled),
        }
    }
}

impl Default for MemorySettingsStore {
    fn default() -> Self {
        Self::new(true)
    }
}

impl SettingsStore for MemorySettingsStore {
    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }
}

/// Settings persisted to an INI file.
///
/// A missing or unreadable file reads as the defaults; write failures are
/// logged and otherwise swallowed, since losing the flag only costs one
/// extra enable/disable next session.
pub struct FileSettingsStore {
    path: PathBuf,
}

impl FileSettingsStore {
    /// Creates a store backed by the given file.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl SettingsStore for FileSettingsStore {
    fn is_enabled(&self) -> bool {
        Ini::load_from_file(&self.path)
            .ok()
            .and_then(|ini| {
                ini.get_from(Some(SECTION), ENABLED_KEY)
                    .map(|value| value != "false")
            })
            .unwrap_or(true)
    }

    fn set_enabled(&self, enabled: bool) {
        let mut ini = Ini::load_from_file(&self.path).unwrap_or_else(|_| Ini::new());
        ini.with_section(Some(SECTION))
            .set(ENABLED_KEY, if enabled { "true" } else { "false" });
        if let Err(err) = ini.write_to_file(&self.path) {
            warn!(path = %self.path.display(), error = %err, "failed to persist preview settings");
        }
    }
}
