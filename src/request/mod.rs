//! Compilation request identity.
//!
//! A compilation request is identified by the source units it covers and the
//! build-graph state it was captured against. [`RequestId`] is a deterministic
//! fingerprint over both, used by the request tracker to coalesce concurrent
//! identical requests and to serve recent results from cache.

use std::fmt;
use std::path::{Path, PathBuf};

use xxhash_rust::xxh3::Xxh3;

/// One source artifact to compile.
///
/// Captures the path and a modification marker (typically the file's
/// modification stamp or an editor document revision). Immutable once
/// captured; a change to the underlying file produces a new unit with a new
/// stamp rather than mutating an existing one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CompilationUnit {
    path: PathBuf,
    modification_stamp: u64,
}

impl CompilationUnit {
    /// Creates a unit for the given path at the given modification stamp.
    pub fn new(path: impl Into<PathBuf>, modification_stamp: u64) -> Self {
        Self {
            path: path.into(),
            modification_stamp,
        }
    }

    /// Path of the source artifact.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Modification marker the unit was captured at.
    pub fn modification_stamp(&self) -> u64 {
        self.modification_stamp
    }
}

/// Build-graph scope for a batch of compilation units.
///
/// The modification count is a monotonically increasing counter bumped by the
/// host whenever the module's structure (dependencies, compiler settings)
/// changes, so that requests captured before a structural change never alias
/// requests captured after it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompilationContext {
    module_name: String,
    modification_count: u64,
}

impl CompilationContext {
    /// Creates a context for the given module at the given structural
    /// modification count.
    pub fn new(module_name: impl Into<String>, modification_count: u64) -> Self {
        Self {
            module_name: module_name.into(),
            modification_count,
        }
    }

    /// Name of the module the units belong to.
    pub fn module_name(&self) -> &str {
        &self.module_name
    }

    /// Structural modification count the context was captured at.
    pub fn modification_count(&self) -> u64 {
        self.modification_count
    }
}

/// Deterministic fingerprint of a compilation request.
///
/// Computed over the sorted list of (path, modification stamp) pairs plus the
/// context's module name and modification count. A pure function of its
/// inputs: two requests with identical units and identical context state
/// always produce the same id, across processes and runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(u64);

impl RequestId {
    /// Computes the fingerprint for the given units and context.
    pub fn of(units: &[CompilationUnit], context: &CompilationContext) -> Self {
        // Sort so that unit ordering never affects the fingerprint.
        let mut keys: Vec<(&Path, u64)> = units
            .iter()
            .map(|unit| (unit.path(), unit.modification_stamp()))
            .collect();
        keys.sort();

        let mut hasher = Xxh3::new();
        for (path, stamp) in keys {
            hasher.update(path.as_os_str().as_encoded_bytes());
            hasher.update(&[0]);
            hasher.update(&stamp.to_le_bytes());
        }
        hasher.update(context.module_name().as_bytes());
        hasher.update(&[0]);
        hasher.update(&context.modification_count().to_le_bytes());

        Self(hasher.digest())
    }

    /// Raw fingerprint value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(path: &str, stamp: u64) -> CompilationUnit {
        CompilationUnit::new(path, stamp)
    }

    #[test]
    fn test_identical_inputs_produce_identical_ids() {
        let units = vec![unit("src/a.kt", 10), unit("src/b.kt", 20)];
        let context = CompilationContext::new("app", 3);

        let first = RequestId::of(&units, &context);
        let second = RequestId::of(&units, &context);

        assert_eq!(first, second);
    }

    #[test]
    fn test_unit_order_does_not_affect_id() {
        let context = CompilationContext::new("app", 3);
        let forward = vec![unit("src/a.kt", 10), unit("src/b.kt", 20)];
        let backward = vec![unit("src/b.kt", 20), unit("src/a.kt", 10)];

        assert_eq!(
            RequestId::of(&forward, &context),
            RequestId::of(&backward, &context)
        );
    }

    #[test]
    fn test_modification_stamp_changes_id() {
        let context = CompilationContext::new("app", 3);
        let before = vec![unit("src/a.kt", 10)];
        let after = vec![unit("src/a.kt", 11)];

        assert_ne!(
            RequestId::of(&before, &context),
            RequestId::of(&after, &context)
        );
    }

    #[test]
    fn test_context_modification_count_changes_id() {
        let units = vec![unit("src/a.kt", 10)];

        assert_ne!(
            RequestId::of(&units, &CompilationContext::new("app", 3)),
            RequestId::of(&units, &CompilationContext::new("app", 4))
        );
    }

    #[test]
    fn test_module_name_changes_id() {
        let units = vec![unit("src/a.kt", 10)];

        assert_ne!(
            RequestId::of(&units, &CompilationContext::new("app", 3)),
            RequestId::of(&units, &CompilationContext::new("lib", 3))
        );
    }

    #[test]
    fn test_display_is_fixed_width_hex() {
        let id = RequestId::of(
            &[unit("src/a.kt", 1)],
            &CompilationContext::new("app", 0),
        );
        let rendered = id.to_string();

        assert_eq!(rendered.len(), 16);
        assert!(rendered.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
