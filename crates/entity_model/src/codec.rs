//! Mode-filtered JSON encoding of entities.
//!
//! The same entity is written differently depending on where it goes. A
//! property or field appears in the output iff its [`FieldAttributes`] flag
//! for the requested [`SerializationMode`] is set. Header properties have a
//! fixed table ([`HEADER_ATTRIBUTES`]); fields take their attributes from the
//! entity's [`EntityClass`]. Field values live under `"fields"` so they can
//! never shadow a header key.
//!
//! Decoding is version-guarded: a stored `version` that differs from the
//! class's current version is reported as [`CodecError::VersionMismatch`],
//! never coerced.

use std::collections::BTreeSet;

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::attributes::{FieldAttributes, SerializationMode};
use crate::category::NameCategory;
use crate::class::{ClassRegistry, EntityClass};
use crate::entity::Entity;
use crate::error::CodecError;
use crate::id::EntityId;

/// Key under which field values are nested.
pub const FIELDS_KEY: &str = "fields";

/// Visibility of the header properties every entity carries.
pub const HEADER_ATTRIBUTES: [(&str, FieldAttributes); 8] = [
    ("id", FieldAttributes::everywhere()),
    ("className", FieldAttributes::internal()),
    ("name", FieldAttributes::everywhere()),
    ("nameCategory", FieldAttributes::internal()),
    ("prototypeId", FieldAttributes::internal()),
    ("isPrototype", FieldAttributes::internal()),
    ("descendantIds", FieldAttributes::persistent()),
    ("version", FieldAttributes::internal()),
];

/// On-disk / server-to-server shape accepted by the decoder.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredEntity {
    id: EntityId,
    class_name: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    name_category: Option<NameCategory>,
    #[serde(default)]
    prototype_id: Option<EntityId>,
    #[serde(default)]
    is_prototype: bool,
    #[serde(default)]
    descendant_ids: BTreeSet<EntityId>,
    version: u32,
    #[serde(default)]
    fields: Map<String, Value>,
}

impl StoredEntity {
    fn into_entity(self) -> Entity {
        Entity::from_parts(
            self.id,
            self.class_name,
            self.name,
            self.name_category,
            self.prototype_id,
            self.is_prototype,
            self.descendant_ids,
            self.version,
            self.fields,
        )
    }
}

/// Encodes and decodes entities for the three serialisation modes.
#[derive(Debug, Clone)]
pub struct SerializationPolicy {
    pretty_files: bool,
}

impl SerializationPolicy {
    #[must_use]
    pub fn new() -> Self {
        Self { pretty_files: true }
    }

    /// Write entity files as compact JSON instead of pretty-printed.
    #[must_use]
    pub fn compact_files(mut self) -> Self {
        self.pretty_files = false;
        self
    }

    /// Build the JSON object for `entity` in `mode`.
    #[must_use]
    pub fn to_value(&self, entity: &Entity, class: &EntityClass, mode: SerializationMode) -> Value {
        let mut out = Map::new();
        for (key, attributes) in HEADER_ATTRIBUTES {
            if !attributes.includes(mode) {
                continue;
            }
            if let Some(value) = header_value(entity, key) {
                out.insert(key.to_string(), value);
            }
        }

        let fields: Map<String, Value> = entity
            .own_fields()
            .filter(|(name, _)| class.attributes(name).includes(mode))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        out.insert(FIELDS_KEY.to_string(), Value::Object(fields));

        Value::Object(out)
    }

    /// Serialise `entity` to UTF-8 JSON bytes for `mode`.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Encode`] if JSON encoding fails.
    pub fn serialize(
        &self,
        entity: &Entity,
        class: &EntityClass,
        mode: SerializationMode,
    ) -> Result<Vec<u8>, CodecError> {
        let value = self.to_value(entity, class, mode);
        let encoded = if self.pretty_files && mode == SerializationMode::SaveToFile {
            serde_json::to_vec_pretty(&value)
        } else {
            serde_json::to_vec(&value)
        };
        encoded.map_err(|source| CodecError::Encode {
            id: entity.id.clone(),
            source,
        })
    }

    /// Decode an entity whose class is expected at `expected_version`.
    ///
    /// # Errors
    ///
    /// [`CodecError::Corrupt`] for malformed input,
    /// [`CodecError::VersionMismatch`] if the stored version differs.
    pub fn deserialize(&self, bytes: &[u8], expected_version: u32) -> Result<Entity, CodecError> {
        let stored = parse(bytes)?;
        check_version(&stored, expected_version)?;
        Ok(stored.into_entity())
    }

    /// Decode an entity, taking the expected version from its declared class
    /// in `classes`.
    ///
    /// # Errors
    ///
    /// As [`SerializationPolicy::deserialize`]; an unregistered class is
    /// [`CodecError::Corrupt`].
    pub fn decode(&self, bytes: &[u8], classes: &ClassRegistry) -> Result<Entity, CodecError> {
        let stored = parse(bytes)?;
        let class = classes.get(&stored.class_name).ok_or_else(|| {
            CodecError::Corrupt(format!(
                "entity {} declares unknown class '{}'",
                stored.id, stored.class_name
            ))
        })?;
        check_version(&stored, class.version)?;
        Ok(stored.into_entity())
    }
}

impl Default for SerializationPolicy {
    fn default() -> Self {
        Self::new()
    }
}

fn header_value(entity: &Entity, key: &str) -> Option<Value> {
    match key {
        "id" => Some(Value::from(entity.id.as_str())),
        "className" => Some(Value::from(entity.class_name.as_str())),
        "name" => entity.name.as_deref().map(Value::from),
        "nameCategory" => entity.name_category.map(|c| Value::from(c.as_str())),
        "prototypeId" => entity.prototype_id.as_ref().map(|id| Value::from(id.as_str())),
        "isPrototype" => Some(Value::Bool(entity.is_prototype)),
        "descendantIds" => Some(Value::Array(
            entity
                .descendant_ids
                .iter()
                .map(|id| Value::from(id.as_str()))
                .collect(),
        )),
        "version" => Some(Value::from(entity.version)),
        _ => None,
    }
}

fn parse(bytes: &[u8]) -> Result<StoredEntity, CodecError> {
    let stored: StoredEntity =
        serde_json::from_slice(bytes).map_err(|e| CodecError::Corrupt(e.to_string()))?;

    if !stored.id.is_valid() {
        return Err(CodecError::Corrupt(format!("invalid entity id '{}'", stored.id)));
    }
    if let Some(prototype_id) = &stored.prototype_id
        && !prototype_id.is_valid()
    {
        return Err(CodecError::Corrupt(format!(
            "entity {} has invalid prototype id '{prototype_id}'",
            stored.id
        )));
    }
    if stored.prototype_id.as_ref() == Some(&stored.id) {
        return Err(CodecError::Corrupt(format!(
            "entity {} is its own prototype",
            stored.id
        )));
    }
    Ok(stored)
}

fn check_version(stored: &StoredEntity, expected: u32) -> Result<(), CodecError> {
    if stored.version == expected {
        Ok(())
    } else {
        Err(CodecError::VersionMismatch {
            id: stored.id.clone(),
            class: stored.class_name.clone(),
            found: stored.version,
            expected,
        })
    }
}
