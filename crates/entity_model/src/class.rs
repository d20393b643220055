//! Entity classes and the class catalogue.
//!
//! An [`EntityClass`] names a kind of entity, its schema version, and the
//! visibility of each of its fields. The [`ClassRegistry`] is built once at
//! startup and handed to the store; there is no process-wide class table.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::attributes::FieldAttributes;
use crate::error::CodecError;

/// One declared field of a class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDef {
    pub name: String,
    #[serde(default)]
    pub attributes: FieldAttributes,
    /// Value given to the class's root prototype when it is first created.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

impl FieldDef {
    #[must_use]
    pub fn new(name: impl Into<String>, attributes: FieldAttributes) -> Self {
        Self {
            name: name.into(),
            attributes,
            default: None,
        }
    }

    #[must_use]
    pub fn with_default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }
}

/// A registered entity class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityClass {
    /// Class name. Also the name of the class's root prototype.
    pub name: String,
    /// Current schema version. Stored files must match it exactly.
    pub version: u32,
    #[serde(default)]
    pub fields: Vec<FieldDef>,
}

impl EntityClass {
    #[must_use]
    pub fn new(name: impl Into<String>, version: u32) -> Self {
        Self {
            name: name.into(),
            version,
            fields: Vec::new(),
        }
    }

    /// Declare a field.
    #[must_use]
    pub fn field(mut self, field: FieldDef) -> Self {
        self.fields.push(field);
        self
    }

    #[must_use]
    pub fn get_field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Attributes of `field`; undeclared fields are hidden in every mode.
    #[must_use]
    pub fn attributes(&self, field: &str) -> FieldAttributes {
        self.get_field(field)
            .map(|f| f.attributes)
            .unwrap_or_default()
    }

    /// Declared default values, keyed by field name.
    #[must_use]
    pub fn defaults(&self) -> Map<String, Value> {
        self.fields
            .iter()
            .filter_map(|f| f.default.clone().map(|v| (f.name.clone(), v)))
            .collect()
    }

    fn validate(&self) -> Result<(), CodecError> {
        let mut seen = HashSet::new();
        for field in &self.fields {
            if !seen.insert(field.name.as_str()) {
                return Err(CodecError::DuplicateField {
                    class: self.name.clone(),
                    field: field.name.clone(),
                });
            }
        }
        Ok(())
    }
}

/// The catalogue of entity classes known to one store.
///
/// Classes are kept in registration order so that boot-time work (creating
/// root prototypes) is deterministic.
#[derive(Debug, Clone, Default)]
pub struct ClassRegistry {
    classes: Vec<EntityClass>,
    index: HashMap<String, usize>,
}

impl ClassRegistry {
    #[must_use]
    pub fn builder() -> ClassRegistryBuilder {
        ClassRegistryBuilder::default()
    }

    /// Parse a JSON array of class definitions.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Catalogue`] for malformed JSON and the
    /// duplicate errors of [`ClassRegistryBuilder::build`].
    pub fn from_json(bytes: &[u8]) -> Result<Self, CodecError> {
        let classes: Vec<EntityClass> =
            serde_json::from_slice(bytes).map_err(CodecError::Catalogue)?;
        classes
            .into_iter()
            .fold(Self::builder(), ClassRegistryBuilder::class)
            .build()
    }

    /// The stock classes of the game server.
    #[must_use]
    pub fn game_defaults() -> Self {
        let description = || {
            FieldDef::new("description", FieldAttributes::everywhere()).with_default(Value::from(""))
        };
        let session_token = || FieldDef::new("sessionToken", FieldAttributes::HIDDEN);

        Self::from_classes(vec![
            EntityClass::new("Account", 1)
                .field(
                    FieldDef::new("characterNames", FieldAttributes::internal())
                        .with_default(Value::Array(Vec::new())),
                )
                .field(FieldDef::new("lastLoginAt", FieldAttributes::internal()))
                .field(session_token()),
            EntityClass::new("Character", 1)
                .field(description())
                .field(
                    FieldDef::new("hitPoints", FieldAttributes::everywhere())
                        .with_default(Value::from(100)),
                )
                .field(FieldDef::new("accountId", FieldAttributes::internal()))
                .field(FieldDef::new("location", FieldAttributes::internal()))
                .field(session_token()),
            EntityClass::new("World", 1)
                .field(description())
                .field(FieldDef::new("motd", FieldAttributes::everywhere())),
            EntityClass::new("Area", 1).field(description()),
            EntityClass::new("Room", 1)
                .field(
                    FieldDef::new("description", FieldAttributes::everywhere())
                        .with_default(Value::from("An empty room.")),
                )
                .field(
                    FieldDef::new("exits", FieldAttributes::everywhere())
                        .with_default(Value::Object(Map::new())),
                )
                .field(
                    FieldDef::new("contents", FieldAttributes::internal())
                        .with_default(Value::Array(Vec::new())),
                ),
            EntityClass::new("Item", 1)
                .field(description())
                .field(FieldDef::new("weight", FieldAttributes::everywhere()).with_default(Value::from(0))),
        ])
    }

    // Later duplicates replace earlier ones; callers needing rejection go
    // through the builder.
    fn from_classes(classes: Vec<EntityClass>) -> Self {
        let index = classes
            .iter()
            .enumerate()
            .map(|(i, c)| (c.name.clone(), i))
            .collect();
        Self { classes, index }
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&EntityClass> {
        self.index.get(name).map(|&i| &self.classes[i])
    }

    /// Iterate classes in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &EntityClass> {
        self.classes.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.classes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}

/// Builder for [`ClassRegistry`].
#[derive(Debug, Default)]
pub struct ClassRegistryBuilder {
    classes: Vec<EntityClass>,
}

impl ClassRegistryBuilder {
    /// Register a class.
    #[must_use]
    pub fn class(mut self, class: EntityClass) -> Self {
        self.classes.push(class);
        self
    }

    /// Finish the catalogue.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::DuplicateClass`] or
    /// [`CodecError::DuplicateField`] if names collide.
    pub fn build(self) -> Result<ClassRegistry, CodecError> {
        let mut seen = HashSet::new();
        for class in &self.classes {
            if !seen.insert(class.name.as_str()) {
                return Err(CodecError::DuplicateClass(class.name.clone()));
            }
            class.validate()?;
        }
        Ok(ClassRegistry::from_classes(self.classes))
    }
}
