//! The entity store.
//!
//! [`EntityStore`] owns the arena of loaded entities and composes the id
//! provider, the name lock, the serialisation policy, and the prototype
//! registry. Entities reference each other only by id; every cross-entity
//! hop is a lookup in the arena, loading from disk on a miss.
//!
//! ## Concurrency
//!
//! The store is `Send + Sync` and meant to be shared behind an `Arc`. The
//! only hard guarantee across tasks is the atomicity of name reservation.
//! Saves of one id are serialised by a per-id async mutex, and the bytes
//! are produced under that mutex, so the last save to finish always
//! writes the newest in-memory state. No `DashMap` guard is held across an
//! `.await`.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use entity_model::{
    ClassRegistry, Entity, EntityClass, EntityId, IdProvider, NameCategory, SerializationMode,
    SerializationPolicy,
};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::files;
use crate::name_lock::NameLock;
use crate::prototype::PrototypeRegistry;

/// What to create in [`EntityStore::create_instance_entity`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceSpec {
    /// Name of the prototype to derive from.
    pub prototype: String,
    /// Human-readable name.
    pub name: Option<String>,
    /// Category to reserve `name` in. Requires `name`.
    pub category: Option<NameCategory>,
    /// Secret stored with the reservation.
    pub secret: Option<String>,
}

impl InstanceSpec {
    /// An unnamed instance of `prototype`.
    #[must_use]
    pub fn new(prototype: impl Into<String>) -> Self {
        Self {
            prototype: prototype.into(),
            name: None,
            category: None,
            secret: None,
        }
    }

    /// Give the instance a name without reserving it.
    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Give the instance a name and reserve it in `category`.
    #[must_use]
    pub fn unique(mut self, name: impl Into<String>, category: NameCategory) -> Self {
        self.name = Some(name.into());
        self.category = Some(category);
        self
    }

    /// Store `secret` (e.g. a password hash) with the reservation.
    #[must_use]
    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }
}

/// Name reservation requested for a new descendant.
#[derive(Debug, Clone)]
pub(crate) struct NameClaim {
    pub(crate) name: String,
    pub(crate) category: NameCategory,
    pub(crate) secret: Option<String>,
}

/// Outcome of one hop of a prototypal read.
enum Lookup {
    Found(Value),
    Next(Option<EntityId>),
}

impl Lookup {
    fn of(entity: &Entity, field: &str) -> Self {
        match entity.own_field(field) {
            Some(value) => Self::Found(value.clone()),
            None => Self::Next(entity.prototype_id.clone()),
        }
    }
}

/// File-backed entity store.
#[derive(Debug)]
pub struct EntityStore {
    config: StoreConfig,
    classes: ClassRegistry,
    policy: SerializationPolicy,
    ids: IdProvider,
    names: NameLock,
    prototypes: PrototypeRegistry,
    entities: DashMap<EntityId, Entity>,
    write_locks: DashMap<EntityId, Arc<Mutex<()>>>,
}

impl EntityStore {
    /// Open (and create if needed) the data directory described by
    /// `config`.
    ///
    /// Prototypes are not loaded until [`EntityStore::init_prototypes`].
    ///
    /// # Errors
    ///
    /// [`StoreError::Io`] if the directories cannot be created.
    pub async fn open(config: StoreConfig, classes: ClassRegistry) -> Result<Self, StoreError> {
        for dir in [config.entities_path(), config.names_path()] {
            tokio::fs::create_dir_all(&dir).await.map_err(|e| {
                error!(path = %dir.display(), %e, "failed to create data directory");
                StoreError::io(&dir, e)
            })?;
        }

        let policy = if config.pretty_files {
            SerializationPolicy::new()
        } else {
            SerializationPolicy::new().compact_files()
        };

        info!(
            data_dir = %config.data_dir.display(),
            classes = classes.len(),
            "entity store opened"
        );

        Ok(Self {
            names: NameLock::new(config.names_path()),
            config,
            classes,
            policy,
            ids: IdProvider::new(),
            prototypes: PrototypeRegistry::new(),
            entities: DashMap::new(),
            write_locks: DashMap::new(),
        })
    }

    /// Replace the id provider, e.g. to pin the boot stamp.
    #[must_use]
    pub fn with_id_provider(mut self, ids: IdProvider) -> Self {
        self.ids = ids;
        self
    }

    #[must_use]
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    #[must_use]
    pub fn classes(&self) -> &ClassRegistry {
        &self.classes
    }

    #[must_use]
    pub fn ids(&self) -> &IdProvider {
        &self.ids
    }

    #[must_use]
    pub fn names(&self) -> &NameLock {
        &self.names
    }

    #[must_use]
    pub fn prototypes(&self) -> &PrototypeRegistry {
        &self.prototypes
    }

    #[must_use]
    pub fn policy(&self) -> &SerializationPolicy {
        &self.policy
    }

    /// Path of the file backing `id`.
    #[must_use]
    pub fn entity_path(&self, id: &EntityId) -> PathBuf {
        self.config.entities_path().join(format!("{id}.json"))
    }

    // -- Prototypes --

    /// Create or load every root prototype and the trees below them. See
    /// [`PrototypeRegistry::init`].
    pub async fn init_prototypes(&self) -> Result<usize, StoreError> {
        self.prototypes.init(self).await
    }

    /// See [`PrototypeRegistry::create_descendant`].
    pub async fn create_descendant_prototype(
        &self,
        ancestor_name: &str,
        new_prototype_name: &str,
    ) -> Result<Entity, StoreError> {
        self.prototypes
            .create_descendant(self, ancestor_name, new_prototype_name)
            .await
    }

    // -- Creation --

    /// Create a new instance entity derived from `spec.prototype`.
    ///
    /// Steps, stopping at the first failure:
    ///
    /// 1. Resolve the prototype by name.
    /// 2. Generate an id. A creation that fails later still consumes it.
    /// 3. If a category is given, reserve the name; a conflict is
    ///    [`StoreError::NameTaken`].
    /// 4. Link the new entity to the prototype and persist the prototype's
    ///    updated descendant set.
    /// 5. Persist the new entity.
    ///
    /// If step 4 or 5 fails, the reservation and the descendant link are
    /// rolled back; only the id stays consumed.
    pub async fn create_instance_entity(&self, spec: InstanceSpec) -> Result<Entity, StoreError> {
        if spec.category.is_some() && spec.name.is_none() {
            return Err(StoreError::Invalid(
                "a name category requires a name".to_string(),
            ));
        }
        if spec.category == Some(NameCategory::Prototype) {
            return Err(StoreError::Invalid(
                "the prototype category is reserved for prototypes".to_string(),
            ));
        }

        let prototype_id = self.prototypes.resolve(self, &spec.prototype).await?;
        let id = self.ids.generate_id();

        let claim = match (spec.category, &spec.name) {
            (Some(category), Some(name)) => Some(NameClaim {
                name: name.clone(),
                category,
                secret: spec.secret.clone(),
            }),
            _ => None,
        };

        let entity = self
            .spawn_descendant(&prototype_id, id, spec.name, claim, false)
            .await?;
        info!(
            id = %entity.id,
            prototype = %spec.prototype,
            name = entity.name.as_deref().unwrap_or(""),
            "instance entity created"
        );
        Ok(entity)
    }

    /// Steps 3 to 5 of the creation pipeline, shared with descendant
    /// prototypes.
    pub(crate) async fn spawn_descendant(
        &self,
        prototype_id: &EntityId,
        id: EntityId,
        name: Option<String>,
        claim: Option<NameClaim>,
        is_prototype: bool,
    ) -> Result<Entity, StoreError> {
        let prototype = self
            .load_entity_by_id(prototype_id)
            .await
            .map_err(|e| match e {
                StoreError::EntityNotFound(_) => StoreError::PrototypeMissing(prototype_id.to_string()),
                other => other,
            })?;

        if let Some(claim) = &claim
            && !self
                .names
                .save(&id, &claim.name, claim.category, claim.secret.as_deref())
                .await?
        {
            debug!(%id, name = %claim.name, category = %claim.category, "name taken, id discarded");
            return Err(StoreError::NameTaken {
                name: claim.name.clone(),
                category: claim.category,
            });
        }

        let mut entity = Entity::descendant_of(id.clone(), &prototype, is_prototype);
        if let Some(name) = name {
            entity = entity.with_name(name, claim.as_ref().map(|c| c.category));
        }

        if let Some(mut prototype) = self.entities.get_mut(prototype_id) {
            prototype.add_descendant(id.clone());
        }
        self.entities.insert(id.clone(), entity.clone());

        let persisted = match self.save_entity(prototype_id).await {
            Ok(()) => self.save_entity(&id).await,
            Err(e) => Err(e),
        };
        if let Err(err) = persisted {
            error!(%id, prototype = %prototype_id, %err, "failed to persist new entity, rolling back");
            self.roll_back_spawn(prototype_id, &id, claim.as_ref()).await;
            return Err(err);
        }

        Ok(entity)
    }

    async fn release_claim(&self, id: &EntityId, claim: Option<&NameClaim>) -> Result<(), StoreError> {
        if let Some(claim) = claim {
            self.release_if_owned(id, &claim.name, claim.category).await?;
        }
        Ok(())
    }

    async fn roll_back_spawn(&self, prototype_id: &EntityId, id: &EntityId, claim: Option<&NameClaim>) {
        self.entities.remove(id);
        self.write_locks.remove(id);

        let path = self.entity_path(id);
        if let Err(e) = files::remove_optional(&path).await {
            warn!(path = %path.display(), %e, "rollback could not remove entity file");
        }

        let detached = self
            .entities
            .get_mut(prototype_id)
            .map(|mut p| p.remove_descendant(id))
            .unwrap_or(false);
        if detached && let Err(e) = self.save_entity(prototype_id).await {
            warn!(prototype = %prototype_id, %e, "rollback could not persist prototype");
        }

        if let Err(e) = self.release_claim(id, claim).await {
            warn!(%id, %e, "rollback could not release name");
        }
    }

    /// Put a freshly built entity into the arena. Used for root prototypes.
    pub(crate) fn insert_new(&self, entity: Entity) {
        self.entities.insert(entity.id.clone(), entity);
    }

    /// Drop an entity from memory without touching disk.
    pub(crate) fn forget(&self, id: &EntityId) {
        self.entities.remove(id);
        self.write_locks.remove(id);
    }

    // -- Loading --

    /// Load an entity, reading its file on the first request.
    ///
    /// The prototype is not loaded; it is resolved lazily on the first
    /// inherited read or by [`EntityStore::resolve_prototype`]. Repeated
    /// calls return the in-memory entity.
    ///
    /// # Errors
    ///
    /// [`StoreError::EntityNotFound`], [`StoreError::Corrupt`],
    /// [`StoreError::VersionMismatch`], [`StoreError::Io`].
    pub async fn load_entity_by_id(&self, id: &EntityId) -> Result<Entity, StoreError> {
        if let Some(entity) = self.entities.get(id) {
            return Ok(entity.clone());
        }
        if !id.is_valid() {
            debug!(%id, "rejecting invalid entity id");
            return Err(StoreError::EntityNotFound(id.clone()));
        }

        let path = self.entity_path(id);
        let bytes = match files::read_optional(&path).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                debug!(%id, "entity file not found");
                return Err(StoreError::EntityNotFound(id.clone()));
            }
            Err(e) => {
                error!(path = %path.display(), %e, "failed to read entity file");
                return Err(StoreError::io(path, e));
            }
        };

        let entity = self.policy.decode(&bytes, &self.classes).map_err(|e| {
            let err = StoreError::from_codec(&path, e);
            error!(%id, %err, "failed to decode entity file");
            err
        })?;
        if entity.id != *id {
            error!(%id, found = %entity.id, "entity file holds a different id");
            return Err(StoreError::corrupt(
                path,
                format!("file holds entity {}", entity.id),
            ));
        }

        debug!(%id, class = %entity.class_name, "entity loaded");
        let entity = self.entities.entry(id.clone()).or_insert(entity).clone();
        Ok(entity)
    }

    /// Load the entity owning `name` in `category`.
    ///
    /// # Errors
    ///
    /// [`StoreError::NameNotFound`] if no lock exists, otherwise as
    /// [`EntityStore::load_entity_by_id`].
    pub async fn load_entity_by_name(
        &self,
        name: &str,
        category: NameCategory,
    ) -> Result<Entity, StoreError> {
        let record = self.names.load(name, category).await?;
        match self.load_entity_by_id(&record.id).await {
            Err(StoreError::EntityNotFound(id)) => {
                warn!(name, %category, %id, "name lock points at a missing entity");
                Err(StoreError::EntityNotFound(id))
            }
            other => other,
        }
    }

    /// In-memory snapshot of a loaded entity.
    #[must_use]
    pub fn get_entity(&self, id: &EntityId) -> Option<Entity> {
        self.entities.get(id).map(|e| e.clone())
    }

    /// Returns `true` if `id` is in memory.
    #[must_use]
    pub fn is_loaded(&self, id: &EntityId) -> bool {
        self.entities.contains_key(id)
    }

    /// Number of entities in memory.
    #[must_use]
    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    // -- Saving --

    /// Persist the in-memory state of `id` with
    /// [`SerializationMode::SaveToFile`].
    ///
    /// # Errors
    ///
    /// [`StoreError::EntityNotFound`] if `id` is not loaded,
    /// [`StoreError::Io`] on disk errors.
    pub async fn save_entity(&self, id: &EntityId) -> Result<(), StoreError> {
        let lock = Arc::clone(self.write_locks.entry(id.clone()).or_default().value());
        let _guard = lock.lock().await;

        let bytes = {
            let entity = self
                .entities
                .get(id)
                .ok_or_else(|| StoreError::EntityNotFound(id.clone()))?;
            let class = self.class_of(&entity)?;
            self.policy
                .serialize(&entity, class, SerializationMode::SaveToFile)?
        };

        let path = self.entity_path(id);
        files::write_atomic(&path, &bytes).await.map_err(|e| {
            error!(path = %path.display(), %e, "failed to write entity file");
            StoreError::io(&path, e)
        })?;
        debug!(%id, bytes = bytes.len(), "entity saved");
        Ok(())
    }

    fn class_of(&self, entity: &Entity) -> Result<&EntityClass, StoreError> {
        self.classes.get(&entity.class_name).ok_or_else(|| {
            StoreError::corrupt(
                self.entity_path(&entity.id),
                format!("unknown class '{}'", entity.class_name),
            )
        })
    }

    // -- Names --

    /// Returns `true` if `name` is reserved in `category`.
    pub async fn is_entity_name_taken(
        &self,
        name: &str,
        category: NameCategory,
    ) -> Result<bool, StoreError> {
        self.names.exists(name, category).await
    }

    /// Release the reservation of `name` in `category`, whoever holds it.
    pub async fn release_name(&self, name: &str, category: NameCategory) -> Result<(), StoreError> {
        self.names.delete(name, category).await?;
        if category == NameCategory::Prototype {
            self.prototypes.unregister(name);
        }
        Ok(())
    }

    /// Release `name` only if the reservation still belongs to `id`.
    async fn release_if_owned(
        &self,
        id: &EntityId,
        name: &str,
        category: NameCategory,
    ) -> Result<bool, StoreError> {
        match self.names.load(name, category).await {
            Ok(record) if record.id == *id => self.names.delete(name, category).await,
            Ok(record) => {
                debug!(%id, owner = %record.id, name, %category, "name owned by another entity, not released");
                Ok(false)
            }
            Err(StoreError::NameNotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    // -- Destruction --

    /// Destroy an entity: remove its file, release its name, and detach it
    /// from its prototype's descendant set. The name stays reserved if the
    /// file cannot be removed.
    ///
    /// # Errors
    ///
    /// [`StoreError::HasDescendants`] if other entities still derive from
    /// it; otherwise load and I/O errors.
    pub async fn destroy_entity(&self, id: &EntityId) -> Result<(), StoreError> {
        let entity = self.load_entity_by_id(id).await?;
        if !entity.descendant_ids.is_empty() {
            return Err(StoreError::HasDescendants {
                id: id.clone(),
                count: entity.descendant_ids.len(),
            });
        }

        {
            let lock = Arc::clone(self.write_locks.entry(id.clone()).or_default().value());
            let _guard = lock.lock().await;
            let path = self.entity_path(id);
            files::remove_optional(&path).await.map_err(|e| {
                error!(path = %path.display(), %e, "failed to remove entity file");
                StoreError::io(&path, e)
            })?;
            self.entities.remove(id);
        }
        self.write_locks.remove(id);

        if let (Some(name), Some(category)) = (&entity.name, entity.name_category) {
            if self.release_if_owned(id, name, category).await? && category == NameCategory::Prototype {
                self.prototypes.unregister(name);
            }
        }

        if let Some(parent) = &entity.prototype_id {
            match self.load_entity_by_id(parent).await {
                Ok(_) => {
                    if let Some(mut prototype) = self.entities.get_mut(parent) {
                        prototype.remove_descendant(id);
                    }
                    self.save_entity(parent).await?;
                }
                Err(StoreError::EntityNotFound(_)) => {
                    warn!(%id, prototype = %parent, "destroyed entity's prototype is missing");
                }
                Err(e) => return Err(e),
            }
        }

        info!(%id, class = %entity.class_name, "entity destroyed");
        Ok(())
    }

    // -- Fields --

    /// Override `field` on a loaded entity. Call
    /// [`EntityStore::save_entity`] to persist.
    pub fn set_field(
        &self,
        id: &EntityId,
        field: &str,
        value: Value,
    ) -> Result<Option<Value>, StoreError> {
        let mut entity = self
            .entities
            .get_mut(id)
            .ok_or_else(|| StoreError::EntityNotFound(id.clone()))?;
        Ok(entity.set_field(field, value))
    }

    /// Remove the override of `field` so reads delegate again.
    pub fn clear_field(&self, id: &EntityId, field: &str) -> Result<Option<Value>, StoreError> {
        let mut entity = self
            .entities
            .get_mut(id)
            .ok_or_else(|| StoreError::EntityNotFound(id.clone()))?;
        Ok(entity.clear_field(field))
    }

    /// Read `field` of `id`, walking prototype links until an entity that
    /// holds the field is found. Missing ancestors are loaded on the way.
    ///
    /// # Errors
    ///
    /// [`StoreError::EntityNotFound`] if `id` itself is missing,
    /// [`StoreError::PrototypeMissing`] for a dangling prototype link,
    /// [`StoreError::Corrupt`] for a prototype cycle.
    pub async fn resolve_field(&self, id: &EntityId, field: &str) -> Result<Option<Value>, StoreError> {
        let mut current = id.clone();
        let mut visited = HashSet::new();

        loop {
            if !visited.insert(current.clone()) {
                error!(%id, at = %current, "prototype cycle");
                return Err(StoreError::corrupt(
                    self.entity_path(&current),
                    format!("prototype cycle through {current}"),
                ));
            }

            let lookup = match self.lookup(&current, field).await {
                Ok(lookup) => lookup,
                Err(StoreError::EntityNotFound(missing)) if missing != *id => {
                    warn!(%id, prototype = %missing, "dangling prototype link");
                    return Err(StoreError::PrototypeMissing(missing.to_string()));
                }
                Err(e) => return Err(e),
            };

            match lookup {
                Lookup::Found(value) => return Ok(Some(value)),
                Lookup::Next(Some(next)) => current = next,
                Lookup::Next(None) => return Ok(None),
            }
        }
    }

    async fn lookup(&self, id: &EntityId, field: &str) -> Result<Lookup, StoreError> {
        if let Some(entity) = self.entities.get(id) {
            return Ok(Lookup::of(&entity, field));
        }
        let entity = self.load_entity_by_id(id).await?;
        Ok(Lookup::of(&entity, field))
    }

    /// Ensure the prototype of `id` is in memory and return its id.
    pub async fn resolve_prototype(&self, id: &EntityId) -> Result<Option<EntityId>, StoreError> {
        let entity = self.load_entity_by_id(id).await?;
        let Some(prototype_id) = entity.prototype_id else {
            return Ok(None);
        };
        match self.load_entity_by_id(&prototype_id).await {
            Ok(_) => Ok(Some(prototype_id)),
            Err(StoreError::EntityNotFound(_)) => {
                warn!(%id, prototype = %prototype_id, "dangling prototype link");
                Err(StoreError::PrototypeMissing(prototype_id.to_string()))
            }
            Err(e) => Err(e),
        }
    }

    // -- Serialisation --

    /// Serialise the entity's own fields for `mode`.
    pub async fn serialize(&self, id: &EntityId, mode: SerializationMode) -> Result<Vec<u8>, StoreError> {
        let entity = self.load_entity_by_id(id).await?;
        let class = self.class_of(&entity)?;
        Ok(self.policy.serialize(&entity, class, mode)?)
    }

    /// Serialise the entity with every declared class field resolved
    /// through the prototype chain.
    pub async fn serialize_resolved(
        &self,
        id: &EntityId,
        mode: SerializationMode,
    ) -> Result<Vec<u8>, StoreError> {
        let mut entity = self.load_entity_by_id(id).await?;
        let class = self.class_of(&entity)?;

        for field in &class.fields {
            if entity.has_own_field(&field.name) || !field.attributes.includes(mode) {
                continue;
            }
            if let Some(value) = self.resolve_field(id, &field.name).await? {
                entity.set_field(field.name.clone(), value);
            }
        }
        Ok(self.policy.serialize(&entity, class, mode)?)
    }
}

#[cfg(test)]
mod tests {
    use entity_model::{EntityClass, FieldAttributes, FieldDef};
    use serde_json::json;

    use super::*;
    use crate::error::ErrorKind;

    fn classes() -> ClassRegistry {
        ClassRegistry::builder()
            .class(
                EntityClass::new("Character", 1)
                    .field(FieldDef::new("title", FieldAttributes::everywhere()).with_default(json!("nobody")))
                    .field(FieldDef::new("sessionToken", FieldAttributes::HIDDEN)),
            )
            .class(EntityClass::new("Room", 1).field(
                FieldDef::new("description", FieldAttributes::everywhere()).with_default(json!("dark")),
            ))
            .build()
            .unwrap()
    }

    async fn open(dir: &std::path::Path) -> EntityStore {
        let store = EntityStore::open(StoreConfig::new(dir), classes()).await.unwrap();
        store.init_prototypes().await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_create_links_prototype() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path()).await;

        let bob = store
            .create_instance_entity(InstanceSpec::new("Character").unique("Bob", NameCategory::Character))
            .await
            .unwrap();
        let proto_id = store.prototypes().get("Character").unwrap();
        assert_eq!(bob.prototype_id.as_ref(), Some(&proto_id));
        assert!(!bob.is_prototype);
        assert!(store.get_entity(&proto_id).unwrap().descendant_ids.contains(&bob.id));
        assert!(store.entity_path(&bob.id).exists());
    }

    #[tokio::test]
    async fn test_missing_prototype() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path()).await;
        let before = store.ids().count();
        let err = store
            .create_instance_entity(InstanceSpec::new("Dragon"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PrototypeMissing);
        assert_eq!(store.ids().count(), before, "no id is consumed before the prototype resolves");
    }

    #[tokio::test]
    async fn test_name_taken_wastes_an_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path()).await;
        let spec = InstanceSpec::new("Character").unique("Bob", NameCategory::Character);

        store.create_instance_entity(spec.clone()).await.unwrap();
        let before = store.ids().count();
        let err = store.create_instance_entity(spec).await.unwrap_err();
        assert!(matches!(err, StoreError::NameTaken { .. }));
        assert_eq!(store.ids().count(), before + 1);

        let proto_id = store.prototypes().get("Character").unwrap();
        assert_eq!(store.get_entity(&proto_id).unwrap().descendant_ids.len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_specs_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path()).await;

        let mut spec = InstanceSpec::new("Character");
        spec.category = Some(NameCategory::Character);
        assert_eq!(
            store.create_instance_entity(spec).await.unwrap_err().kind(),
            ErrorKind::Rejected
        );

        let spec = InstanceSpec::new("Character").unique("Sneaky", NameCategory::Prototype);
        assert_eq!(
            store.create_instance_entity(spec).await.unwrap_err().kind(),
            ErrorKind::Rejected
        );
    }

    #[tokio::test]
    async fn test_delegation_sees_later_prototype_changes() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path()).await;
        let room = store
            .create_instance_entity(InstanceSpec::new("Room"))
            .await
            .unwrap();
        let proto_id = store.prototypes().get("Room").unwrap();

        assert_eq!(store.resolve_field(&room.id, "description").await.unwrap(), Some(json!("dark")));

        store.set_field(&proto_id, "description", json!("bright")).unwrap();
        assert_eq!(store.resolve_field(&room.id, "description").await.unwrap(), Some(json!("bright")));

        store.set_field(&room.id, "description", json!("mine")).unwrap();
        assert_eq!(store.resolve_field(&room.id, "description").await.unwrap(), Some(json!("mine")));

        store.clear_field(&room.id, "description").unwrap();
        assert_eq!(store.resolve_field(&room.id, "description").await.unwrap(), Some(json!("bright")));

        assert_eq!(store.resolve_field(&room.id, "nothing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_inherited_values_are_not_baked_into_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path()).await;
        let room = store
            .create_instance_entity(InstanceSpec::new("Room"))
            .await
            .unwrap();
        let raw: Value = serde_json::from_slice(&std::fs::read(store.entity_path(&room.id)).unwrap()).unwrap();
        assert!(raw["fields"].as_object().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_lazy_prototype_resolution() {
        let dir = tempfile::tempdir().unwrap();
        let (room_id, proto_id) = {
            let store = open(dir.path()).await;
            let room = store.create_instance_entity(InstanceSpec::new("Room")).await.unwrap();
            (room.id, store.prototypes().get("Room").unwrap())
        };

        // Fresh store, no prototype init: loading the room must not need its prototype.
        let store = EntityStore::open(StoreConfig::new(dir.path()), classes()).await.unwrap();
        store.load_entity_by_id(&room_id).await.unwrap();
        assert!(!store.is_loaded(&proto_id));

        assert_eq!(store.resolve_field(&room_id, "description").await.unwrap(), Some(json!("dark")));
        assert!(store.is_loaded(&proto_id));

        let store = EntityStore::open(StoreConfig::new(dir.path()), classes()).await.unwrap();
        assert_eq!(store.resolve_prototype(&room_id).await.unwrap(), Some(proto_id.clone()));
        assert!(store.is_loaded(&proto_id));
        assert_eq!(store.resolve_prototype(&proto_id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_dangling_prototype_link() {
        let dir = tempfile::tempdir().unwrap();
        let store = EntityStore::open(StoreConfig::new(dir.path()), classes()).await.unwrap();
        let path = store.entity_path(&EntityId::new("x-1"));
        std::fs::write(
            &path,
            br#"{"id": "x-1", "className": "Room", "prototypeId": "x-0", "version": 1}"#,
        )
        .unwrap();

        let err = store.resolve_field(&EntityId::new("x-1"), "description").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PrototypeMissing);
    }

    #[tokio::test]
    async fn test_prototype_cycle_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let store = EntityStore::open(StoreConfig::new(dir.path()), classes()).await.unwrap();
        for (id, proto) in [("c-1", "c-2"), ("c-2", "c-1")] {
            std::fs::write(
                store.entity_path(&EntityId::new(id)),
                format!(r#"{{"id": "{id}", "className": "Room", "prototypeId": "{proto}", "version": 1}}"#),
            )
            .unwrap();
        }
        let err = store.resolve_field(&EntityId::new("c-1"), "description").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Corrupt);
    }

    #[tokio::test]
    async fn test_load_is_idempotent_and_prefers_memory() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path()).await;
        let bob = store
            .create_instance_entity(InstanceSpec::new("Character").named("Bob"))
            .await
            .unwrap();
        store.set_field(&bob.id, "title", json!("unsaved")).unwrap();

        let first = store.load_entity_by_id(&bob.id).await.unwrap();
        let second = store.load_entity_by_id(&bob.id).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.own_field("title"), Some(&json!("unsaved")));
    }

    #[tokio::test]
    async fn test_load_errors() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path()).await;

        let err = store.load_entity_by_id(&EntityId::new("nope-1")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        let err = store.load_entity_by_id(&EntityId::new("../escape")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        std::fs::write(store.entity_path(&EntityId::new("bad-1")), b"{ nope").unwrap();
        let err = store.load_entity_by_id(&EntityId::new("bad-1")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Corrupt);

        std::fs::write(
            store.entity_path(&EntityId::new("moved-1")),
            br#"{"id": "moved-2", "className": "Room", "version": 1}"#,
        )
        .unwrap();
        let err = store.load_entity_by_id(&EntityId::new("moved-1")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Corrupt);

        let err = store
            .load_entity_by_name("nobody", NameCategory::Character)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NameNotFound { .. }));
    }

    #[tokio::test]
    async fn test_destroy_detaches_and_releases() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path()).await;
        let bob = store
            .create_instance_entity(InstanceSpec::new("Character").unique("Bob", NameCategory::Character))
            .await
            .unwrap();
        let proto_id = store.prototypes().get("Character").unwrap();

        store.destroy_entity(&bob.id).await.unwrap();

        assert!(!store.get_entity(&proto_id).unwrap().descendant_ids.contains(&bob.id));
        assert!(!store.is_entity_name_taken("Bob", NameCategory::Character).await.unwrap());
        assert!(!store.entity_path(&bob.id).exists());
        assert!(!store.is_loaded(&bob.id));

        let reloaded = EntityStore::open(StoreConfig::new(dir.path()), classes()).await.unwrap();
        let proto = reloaded.load_entity_by_id(&proto_id).await.unwrap();
        assert!(proto.descendant_ids.is_empty());
    }

    #[tokio::test]
    async fn test_destroy_keeps_name_reserved_by_someone_else() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path()).await;
        let bob = store
            .create_instance_entity(InstanceSpec::new("Character").unique("Bob", NameCategory::Character))
            .await
            .unwrap();
        store.release_name("Bob", NameCategory::Character).await.unwrap();
        let new_bob = store
            .create_instance_entity(InstanceSpec::new("Character").unique("Bob", NameCategory::Character))
            .await
            .unwrap();

        store.destroy_entity(&bob.id).await.unwrap();
        let owner = store.load_entity_by_name("bob", NameCategory::Character).await.unwrap();
        assert_eq!(owner.id, new_bob.id);
    }

    #[tokio::test]
    async fn test_destroy_refuses_prototype_with_descendants() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path()).await;
        store.create_instance_entity(InstanceSpec::new("Room")).await.unwrap();
        let proto_id = store.prototypes().get("Room").unwrap();
        let err = store.destroy_entity(&proto_id).await.unwrap_err();
        assert!(matches!(err, StoreError::HasDescendants { count: 1, .. }));
    }

    #[tokio::test]
    async fn test_serialize_resolved_fills_inherited_fields() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path()).await;
        let bob = store
            .create_instance_entity(InstanceSpec::new("Character").named("Bob"))
            .await
            .unwrap();
        store.set_field(&bob.id, "sessionToken", json!("xyz")).unwrap();

        let own: Value =
            serde_json::from_slice(&store.serialize(&bob.id, SerializationMode::SendToClient).await.unwrap()).unwrap();
        assert!(own["fields"].get("title").is_none());

        let resolved: Value = serde_json::from_slice(
            &store
                .serialize_resolved(&bob.id, SerializationMode::SendToClient)
                .await
                .unwrap(),
        )
        .unwrap();
        assert_eq!(resolved["fields"]["title"], "nobody");
        assert!(resolved["fields"].get("sessionToken").is_none());
        assert_eq!(resolved["name"], "Bob");
    }

    #[tokio::test]
    async fn test_field_edits_need_a_loaded_entity() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path()).await;
        let err = store.set_field(&EntityId::new("x-9"), "title", json!(1)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(store.save_entity(&EntityId::new("x-9")).await.is_err());
    }

    fn block_with_directory(path: &std::path::Path) {
        std::fs::create_dir_all(path).unwrap();
        std::fs::write(path.join("keep"), b"x").unwrap();
    }

    #[tokio::test]
    async fn test_failed_write_rolls_back_reservation_and_link() {
        let dir = tempfile::tempdir().unwrap();
        let store = EntityStore::open(StoreConfig::new(dir.path()), classes())
            .await
            .unwrap()
            .with_id_provider(IdProvider::with_boot_stamp(1));
        store.init_prototypes().await.unwrap();
        let proto_id = store.prototypes().get("Character").unwrap();

        // Roots took 1-0 and 1-1; the next entity file cannot be written.
        block_with_directory(&store.entity_path(&EntityId::new("1-2")));

        let err = store
            .create_instance_entity(InstanceSpec::new("Character").unique("Bob", NameCategory::Character))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IoFailure);
        assert_eq!(store.ids().count(), 3);

        assert!(!store.is_entity_name_taken("Bob", NameCategory::Character).await.unwrap());
        assert!(!store.is_loaded(&EntityId::new("1-2")));
        assert!(store.get_entity(&proto_id).unwrap().descendant_ids.is_empty());
        let raw: Value = serde_json::from_slice(&std::fs::read(store.entity_path(&proto_id)).unwrap()).unwrap();
        assert_eq!(raw["descendantIds"], json!([]));

        // The name is free again for the next attempt.
        let bob = store
            .create_instance_entity(InstanceSpec::new("Character").unique("Bob", NameCategory::Character))
            .await
            .unwrap();
        assert_eq!(bob.id, EntityId::new("1-3"));
    }

    #[tokio::test]
    async fn test_failed_destroy_keeps_name_reserved() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path()).await;
        let bob = store
            .create_instance_entity(InstanceSpec::new("Character").unique("Bob", NameCategory::Character))
            .await
            .unwrap();
        let proto_id = store.prototypes().get("Character").unwrap();

        let path = store.entity_path(&bob.id);
        std::fs::remove_file(&path).unwrap();
        block_with_directory(&path);

        let err = store.destroy_entity(&bob.id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IoFailure);
        assert!(store.is_entity_name_taken("Bob", NameCategory::Character).await.unwrap());
        assert!(store.is_loaded(&bob.id));
        assert!(store.get_entity(&proto_id).unwrap().descendant_ids.contains(&bob.id));
    }

    #[tokio::test]
    async fn test_unencodable_name_is_not_taken() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path()).await;
        assert!(!store.is_entity_name_taken("", NameCategory::Character).await.unwrap());
        assert!(
            !store
                .is_entity_name_taken(&"a".repeat(500), NameCategory::Account)
                .await
                .unwrap()
        );
    }
}
