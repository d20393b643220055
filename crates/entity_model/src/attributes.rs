//! Per-field visibility rules.
//!
//! Every field carries a [`FieldAttributes`] record saying in which
//! [`SerializationMode`]s it is written. Undeclared fields get the default
//! record, which is hidden everywhere.

use serde::{Deserialize, Serialize};

/// Destination of a serialised entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SerializationMode {
    /// Written to the entity's file under the data directory.
    SaveToFile,
    /// Sent to a game client.
    SendToClient,
    /// Sent to another server process.
    SendToServer,
}

impl SerializationMode {
    /// All modes, in declaration order.
    pub const ALL: [Self; 3] = [Self::SaveToFile, Self::SendToClient, Self::SendToServer];
}

/// Visibility of one field per serialisation mode. Defaults to all `false`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FieldAttributes {
    /// Written by [`SerializationMode::SaveToFile`].
    pub saved: bool,
    /// Written by [`SerializationMode::SendToClient`].
    pub sent_to_client: bool,
    /// Written by [`SerializationMode::SendToServer`].
    pub sent_to_server: bool,
}

impl FieldAttributes {
    /// Never serialised.
    pub const HIDDEN: Self = Self::new(false, false, false);

    #[must_use]
    pub const fn new(saved: bool, sent_to_client: bool, sent_to_server: bool) -> Self {
        Self {
            saved,
            sent_to_client,
            sent_to_server,
        }
    }

    /// Saved to disk only.
    #[must_use]
    pub const fn persistent() -> Self {
        Self::new(true, false, false)
    }

    /// Saved to disk and shared with other servers, never with clients.
    #[must_use]
    pub const fn internal() -> Self {
        Self::new(true, false, true)
    }

    /// Saved and sent in every mode.
    #[must_use]
    pub const fn everywhere() -> Self {
        Self::new(true, true, true)
    }

    /// Returns `true` if a field with these attributes is written in `mode`.
    #[must_use]
    pub const fn includes(self, mode: SerializationMode) -> bool {
        match mode {
            SerializationMode::SaveToFile => self.saved,
            SerializationMode::SendToClient => self.sent_to_client,
            SerializationMode::SendToServer => self.sent_to_server,
        }
    }
}
