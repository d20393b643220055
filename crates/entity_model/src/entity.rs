//! The persisted entity.
//!
//! An [`Entity`] stores only the fields it has overridden. Reading a field it
//! does not hold means walking `prototype_id` links through the store; that
//! walk happens at read time and is never baked into the stored data, so a
//! change to a prototype is seen by every descendant that did not override
//! the field.
//!
//! Cross-entity references (`prototype_id`, `descendant_ids`) are plain ids.

use std::collections::BTreeSet;

use serde_json::{Map, Value};

use crate::category::NameCategory;
use crate::class::EntityClass;
use crate::id::EntityId;

#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    /// Immutable id.
    pub id: EntityId,
    /// Name of the [`EntityClass`] this entity belongs to.
    pub class_name: String,
    /// Human-readable name, if any.
    pub name: Option<String>,
    /// Category the name is reserved in. `None` for unreserved names.
    pub name_category: Option<NameCategory>,
    /// The entity unset fields are delegated to. `None` only for root
    /// prototypes.
    pub prototype_id: Option<EntityId>,
    /// Whether other entities may use this one as their prototype.
    pub is_prototype: bool,
    /// Ids of entities created with this one as their prototype.
    pub descendant_ids: BTreeSet<EntityId>,
    /// Schema version of the class at the time of writing.
    pub version: u32,
    fields: Map<String, Value>,
}

impl Entity {
    /// The root prototype of `class`, seeded with the class's declared
    /// defaults.
    #[must_use]
    pub fn root_prototype(id: EntityId, class: &EntityClass) -> Self {
        Self {
            id,
            class_name: class.name.clone(),
            name: Some(class.name.clone()),
            name_category: Some(NameCategory::Prototype),
            prototype_id: None,
            is_prototype: true,
            descendant_ids: BTreeSet::new(),
            version: class.version,
            fields: class.defaults(),
        }
    }

    /// A new entity delegating to `prototype`, with no overrides.
    #[must_use]
    pub fn descendant_of(id: EntityId, prototype: &Entity, is_prototype: bool) -> Self {
        Self {
            id,
            class_name: prototype.class_name.clone(),
            name: None,
            name_category: None,
            prototype_id: Some(prototype.id.clone()),
            is_prototype,
            descendant_ids: BTreeSet::new(),
            version: prototype.version,
            fields: Map::new(),
        }
    }

    /// Used by the decoder; every property is supplied verbatim.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_parts(
        id: EntityId,
        class_name: String,
        name: Option<String>,
        name_category: Option<NameCategory>,
        prototype_id: Option<EntityId>,
        is_prototype: bool,
        descendant_ids: BTreeSet<EntityId>,
        version: u32,
        fields: Map<String, Value>,
    ) -> Self {
        Self {
            id,
            class_name,
            name,
            name_category,
            prototype_id,
            is_prototype,
            descendant_ids,
            version,
            fields,
        }
    }

    /// Set the human-readable name and the category it is reserved in.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>, category: Option<NameCategory>) -> Self {
        self.name = Some(name.into());
        self.name_category = category;
        self
    }

    /// Returns `true` for a root prototype (no ancestor).
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.prototype_id.is_none()
    }

    /// This entity's own value for `field`, ignoring prototypes.
    #[must_use]
    pub fn own_field(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    #[must_use]
    pub fn has_own_field(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }

    /// Override `field`, returning the previous own value.
    pub fn set_field(&mut self, field: impl Into<String>, value: Value) -> Option<Value> {
        self.fields.insert(field.into(), value)
    }

    /// Drop the override for `field`, so reads delegate to the prototype
    /// again.
    pub fn clear_field(&mut self, field: &str) -> Option<Value> {
        self.fields.remove(field)
    }

    /// Iterate own fields.
    pub fn own_fields(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.fields.iter()
    }

    /// Record `id` as a descendant. Returns `false` if it already was one.
    pub fn add_descendant(&mut self, id: EntityId) -> bool {
        self.descendant_ids.insert(id)
    }

    /// Forget a descendant. Returns `true` if it was present.
    pub fn remove_descendant(&mut self, id: &EntityId) -> bool {
        self.descendant_ids.remove(id)
    }
}
