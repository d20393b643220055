//! Atomic file primitives on top of `tokio::fs`.
//!
//! Temporary files live next to their target as `.<target>.<uuid>.tmp` so
//! that `rename` and `hard_link` never cross a filesystem boundary.

use std::io;
use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::warn;
use uuid::Uuid;

fn temp_path(target: &Path) -> PathBuf {
    let stem = target
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("entry");
    target.with_file_name(format!(".{stem}.{}.tmp", Uuid::new_v4().simple()))
}

async fn discard(tmp: &Path) {
    if let Err(e) = fs::remove_file(tmp).await
        && e.kind() != io::ErrorKind::NotFound
    {
        warn!(path = %tmp.display(), %e, "failed to remove temporary file");
    }
}

/// Replace `target` with `bytes`. Readers see either the old or the new
/// content, never a partial write.
pub(crate) async fn write_atomic(target: &Path, bytes: &[u8]) -> io::Result<()> {
    let tmp = temp_path(target);
    if let Err(e) = fs::write(&tmp, bytes).await {
        discard(&tmp).await;
        return Err(e);
    }
    if let Err(e) = fs::rename(&tmp, target).await {
        discard(&tmp).await;
        return Err(e);
    }
    Ok(())
}

/// Create `target` holding `bytes` only if it does not exist yet.
///
/// Returns `Ok(false)` if the target already exists. The content is written
/// to a temporary file first and then hard-linked into place; the link is
/// the atomic, exclusive step, so among concurrent callers for the same
/// target exactly one gets `Ok(true)`.
pub(crate) async fn write_exclusive(target: &Path, bytes: &[u8]) -> io::Result<bool> {
    let tmp = temp_path(target);
    if let Err(e) = fs::write(&tmp, bytes).await {
        discard(&tmp).await;
        return Err(e);
    }
    let linked = fs::hard_link(&tmp, target).await;
    discard(&tmp).await;
    match linked {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(e),
    }
}

/// Read `path`, mapping a missing file to `None`.
pub(crate) async fn read_optional(path: &Path) -> io::Result<Option<Vec<u8>>> {
    match fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Remove `path`. Returns `false` if it did not exist.
pub(crate) async fn remove_optional(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}
