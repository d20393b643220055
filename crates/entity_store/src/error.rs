//! Store error types.

use std::path::PathBuf;

use entity_model::{CodecError, EntityId, NameCategory};

/// Coarse classification callers branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The id or name does not exist. Expected; not logged as an error.
    NotFound,
    /// The name is reserved by another entity. Expected.
    NameTaken,
    /// The named prototype does not exist.
    PrototypeMissing,
    /// A stored schema version differs from the class's current version.
    VersionMismatch,
    /// Malformed JSON, a missing property, or an inconsistent link.
    Corrupt,
    /// The disk said no.
    IoFailure,
    /// The request itself was invalid.
    Rejected,
}

/// Errors that can occur during store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("entity {0} not found")]
    EntityNotFound(EntityId),

    #[error("no {category} named '{name}'")]
    NameNotFound { name: String, category: NameCategory },

    #[error("{category} name '{name}' is already taken")]
    NameTaken { name: String, category: NameCategory },

    #[error("prototype '{0}' does not exist")]
    PrototypeMissing(String),

    #[error("{path}: entity {id} of class '{class}' has version {found}, expected {expected}")]
    VersionMismatch {
        path: PathBuf,
        id: EntityId,
        class: String,
        found: u32,
        expected: u32,
    },

    #[error("{path}: corrupt data: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("I/O failure on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Encoding an in-memory value failed.
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("failed to encode name lock: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("entity {id} still has {count} descendant(s)")]
    HasDescendants { id: EntityId, count: usize },

    #[error("invalid request: {0}")]
    Invalid(String),
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Corrupt {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Attach the file a decode error came from.
    pub(crate) fn from_codec(path: impl Into<PathBuf>, err: CodecError) -> Self {
        match err {
            CodecError::Corrupt(reason) => Self::corrupt(path, reason),
            CodecError::VersionMismatch {
                id,
                class,
                found,
                expected,
            } => Self::VersionMismatch {
                path: path.into(),
                id,
                class,
                found,
                expected,
            },
            other => Self::Codec(other),
        }
    }

    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::EntityNotFound(_) | Self::NameNotFound { .. } => ErrorKind::NotFound,
            Self::NameTaken { .. } => ErrorKind::NameTaken,
            Self::PrototypeMissing(_) => ErrorKind::PrototypeMissing,
            Self::VersionMismatch { .. } => ErrorKind::VersionMismatch,
            Self::Corrupt { .. } | Self::Codec(_) | Self::Encode(_) => ErrorKind::Corrupt,
            Self::Io { .. } => ErrorKind::IoFailure,
            Self::HasDescendants { .. } | Self::Invalid(_) => ErrorKind::Rejected,
        }
    }

    /// `true` for outcomes callers routinely branch on (`NotFound`,
    /// `NameTaken`).
    #[must_use]
    pub fn is_expected(&self) -> bool {
        matches!(self.kind(), ErrorKind::NotFound | ErrorKind::NameTaken)
    }
}
