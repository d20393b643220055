//! Model-layer error types.

use crate::id::EntityId;

/// Errors raised while encoding, decoding, or cataloguing entities.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// An entity could not be encoded to JSON.
    #[error("failed to encode entity {id}: {source}")]
    Encode {
        id: EntityId,
        #[source]
        source: serde_json::Error,
    },

    /// Malformed JSON or a missing required property.
    #[error("corrupt entity data: {0}")]
    Corrupt(String),

    /// The stored schema version differs from the class's current version.
    #[error("entity {id} of class '{class}' has version {found}, expected {expected}")]
    VersionMismatch {
        id: EntityId,
        class: String,
        found: u32,
        expected: u32,
    },

    /// Two classes were registered under the same name.
    #[error("duplicate entity class '{0}'")]
    DuplicateClass(String),

    /// A class declares the same field twice.
    #[error("duplicate field '{field}' in class '{class}'")]
    DuplicateField { class: String, field: String },

    /// A class catalogue file could not be parsed.
    #[error("invalid class catalogue: {0}")]
    Catalogue(#[source] serde_json::Error),

    #[error("unknown name category '{0}'")]
    UnknownCategory(String),
}
