//! Name categories.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CodecError;

/// A namespace for unique names. The same name may be reserved once per
/// category.
///
/// [`NameCategory::Prototype`] is reserved for prototype entities and is
/// disjoint from every instance category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NameCategory {
    Account,
    Character,
    World,
    Area,
    Room,
    Prototype,
}

impl NameCategory {
    pub const ALL: [Self; 6] = [
        Self::Account,
        Self::Character,
        Self::World,
        Self::Area,
        Self::Room,
        Self::Prototype,
    ];

    /// Directory name used under the names directory.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Account => "account",
            Self::Character => "character",
            Self::World => "world",
            Self::Area => "area",
            Self::Room => "room",
            Self::Prototype => "prototype",
        }
    }

    /// Returns `true` for categories holding instance entities.
    #[must_use]
    pub const fn is_instance_category(self) -> bool {
        !matches!(self, Self::Prototype)
    }
}

impl std::fmt::Display for NameCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NameCategory {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| CodecError::UnknownCategory(s.to_string()))
    }
}
