//! Entity identifiers and the per-boot id allocator.
//!
//! An [`EntityId`] is an opaque string. Ids produced by [`IdProvider`] have
//! the form `<boot-stamp>-<counter>` in lowercase hex. The boot stamp is part
//! of the string itself, so the bare id stored on disk is enough to tell ids
//! from different boots apart.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// A unique entity identifier.
///
/// Ids are immutable once assigned and double as file stems under the
/// entities directory, so only ASCII alphanumerics, `-` and `_` are valid.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    /// Wrap a raw id string. No validation is performed; see
    /// [`EntityId::is_valid`].
    #[must_use]
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Returns the raw id string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns `true` if the id is non-empty and safe to use as a file stem.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        !self.0.is_empty()
            && self
                .0
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
    }
}

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityId {
    fn from(raw: &str) -> Self {
        Self(raw.to_string())
    }
}

impl From<String> for EntityId {
    fn from(raw: String) -> Self {
        Self(raw)
    }
}

impl AsRef<str> for EntityId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Allocates entity ids for the lifetime of one process boot.
///
/// The counter is atomic, so a single provider can be shared between tasks
/// without a lock. Ids are never recycled; an id consumed by a creation that
/// later fails is simply skipped.
#[derive(Debug)]
pub struct IdProvider {
    boot_stamp: u64,
    next: AtomicU64,
}

impl IdProvider {
    /// Creates a provider stamped with the current wall-clock time in
    /// milliseconds.
    #[must_use]
    pub fn new() -> Self {
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        Self::with_boot_stamp(stamp)
    }

    /// Creates a provider with an explicit boot stamp.
    #[must_use]
    pub fn with_boot_stamp(boot_stamp: u64) -> Self {
        Self {
            boot_stamp,
            next: AtomicU64::new(0),
        }
    }

    /// The stamp shared by every id of this boot.
    #[must_use]
    pub fn boot_stamp(&self) -> u64 {
        self.boot_stamp
    }

    /// Returns a fresh id. No two calls on the same provider return equal
    /// values.
    pub fn generate_id(&self) -> EntityId {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        EntityId(format!("{:x}-{:x}", self.boot_stamp, n))
    }

    /// Returns the number of ids handed out so far.
    #[must_use]
    pub fn count(&self) -> u64 {
        self.next.load(Ordering::Relaxed)
    }
}

impl Default for IdProvider {
    fn default() -> Self {
        Self::new()
    }
}
