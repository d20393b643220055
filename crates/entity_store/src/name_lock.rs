//! Persisted, exclusive reservation of unique names.
//!
//! A name is reserved iff its lock file exists:
//!
//! ```text
//! <names>/<category>/<encoded-name>.json  →  { "id": "...", "passwordHash"?: "..." }
//! ```
//!
//! [`NameLock::save`] is the only concurrency primitive the engine relies
//! on. It creates the lock file exclusively, so among any number of
//! concurrent reservations of one `(name, category)` exactly one succeeds.
//!
//! Names are case-folded before encoding; `Bob` and `bob` are the same name.

use std::fmt::Write as _;
use std::path::PathBuf;

use entity_model::{EntityId, NameCategory};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::error::StoreError;
use crate::files;

/// Longest encoded file stem accepted. Keeps lock paths under common
/// filesystem name limits.
pub const MAX_ENCODED_NAME_LEN: usize = 200;

/// Content of a name-lock file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NameLockRecord {
    /// The entity owning the name.
    pub id: EntityId,
    /// Secret stored alongside the reservation (account password hash).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_hash: Option<String>,
}

/// Case-fold a name for comparison and storage.
#[must_use]
pub fn fold_name(name: &str) -> String {
    name.to_lowercase()
}

/// Encode a name into a file stem.
///
/// The name is case-folded, then every byte except ASCII alphanumerics,
/// `-`, `_` and `@` is written as `%XX`.
///
/// # Errors
///
/// [`StoreError::Invalid`] for empty names or names whose encoding exceeds
/// [`MAX_ENCODED_NAME_LEN`].
pub fn encode_name(name: &str) -> Result<String, StoreError> {
    if name.is_empty() {
        return Err(StoreError::Invalid("name must not be empty".to_string()));
    }

    let folded = fold_name(name);
    let mut out = String::with_capacity(folded.len());
    for byte in folded.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'@') {
            out.push(byte as char);
        } else {
            let _ = write!(out, "%{byte:02X}");
        }
    }

    if out.len() > MAX_ENCODED_NAME_LEN {
        return Err(StoreError::Invalid(format!(
            "name is too long ({} bytes encoded)",
            out.len()
        )));
    }
    Ok(out)
}

/// Name reservations under one directory.
#[derive(Debug, Clone)]
pub struct NameLock {
    root: PathBuf,
}

impl NameLock {
    /// Create a name lock rooted at `root` (the names directory).
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The lock file path for `name` in `category`.
    ///
    /// # Errors
    ///
    /// See [`encode_name`].
    pub fn path_for(&self, name: &str, category: NameCategory) -> Result<PathBuf, StoreError> {
        let stem = encode_name(name)?;
        Ok(self
            .root
            .join(category.as_str())
            .join(format!("{stem}.json")))
    }

    /// Returns `true` if `name` is reserved in `category`. A name that
    /// cannot be encoded can never be reserved, so it reports `false`.
    pub async fn exists(&self, name: &str, category: NameCategory) -> Result<bool, StoreError> {
        let path = match self.path_for(name, category) {
            Ok(path) => path,
            Err(StoreError::Invalid(reason)) => {
                debug!(name, %category, %reason, "unencodable name is never taken");
                return Ok(false);
            }
            Err(e) => return Err(e),
        };
        tokio::fs::try_exists(&path)
            .await
            .map_err(|e| StoreError::io(path, e))
    }

    /// Reserve `name` in `category` for `id`.
    ///
    /// Returns `Ok(false)` if the name is already reserved; the existing
    /// reservation is left untouched.
    pub async fn save(
        &self,
        id: &EntityId,
        name: &str,
        category: NameCategory,
        secret: Option<&str>,
    ) -> Result<bool, StoreError> {
        let path = self.path_for(name, category)?;
        let dir = self.root.join(category.as_str());
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| StoreError::io(&dir, e))?;

        let record = NameLockRecord {
            id: id.clone(),
            password_hash: secret.map(str::to_string),
        };
        let bytes = serde_json::to_vec_pretty(&record)?;

        let created = files::write_exclusive(&path, &bytes).await.map_err(|e| {
            error!(path = %path.display(), %e, "failed to write name lock");
            StoreError::io(&path, e)
        })?;

        if created {
            debug!(%id, name, %category, "name reserved");
        } else {
            debug!(%id, name, %category, "name already reserved");
        }
        Ok(created)
    }

    /// Read the reservation for `name` in `category`.
    ///
    /// # Errors
    ///
    /// [`StoreError::NameNotFound`] if the name is free,
    /// [`StoreError::Corrupt`] for an unreadable record,
    /// [`StoreError::Io`] on disk errors.
    pub async fn load(&self, name: &str, category: NameCategory) -> Result<NameLockRecord, StoreError> {
        let path = self.path_for(name, category)?;
        let bytes = match files::read_optional(&path).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                return Err(StoreError::NameNotFound {
                    name: name.to_string(),
                    category,
                });
            }
            Err(e) => {
                error!(path = %path.display(), %e, "failed to read name lock");
                return Err(StoreError::io(path, e));
            }
        };

        let record: NameLockRecord = serde_json::from_slice(&bytes).map_err(|e| {
            error!(path = %path.display(), %e, "corrupt name lock");
            StoreError::corrupt(&path, e.to_string())
        })?;
        if !record.id.is_valid() {
            error!(path = %path.display(), id = %record.id, "name lock holds invalid id");
            return Err(StoreError::corrupt(&path, format!("invalid id '{}'", record.id)));
        }
        Ok(record)
    }

    /// Release the reservation. Returns `false` if the name was not
    /// reserved.
    pub async fn delete(&self, name: &str, category: NameCategory) -> Result<bool, StoreError> {
        let path = self.path_for(name, category)?;
        let removed = files::remove_optional(&path)
            .await
            .map_err(|e| StoreError::io(&path, e))?;
        if removed {
            debug!(name, %category, "name released");
        }
        Ok(removed)
    }
}
