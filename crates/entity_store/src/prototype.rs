//! Prototype registry.
//!
//! Every class has one root prototype, reserved under the class name in
//! the `prototype` name category. Descendant prototypes are created by
//! tooling and reserved in the same category, which no instance may use.
//! The registry is only a name index; the prototype entities themselves
//! live in the store's arena like any other entity.

use std::collections::HashSet;

use dashmap::DashMap;
use entity_model::{Entity, EntityClass, EntityId, NameCategory};
use tracing::{debug, error, info, warn};

use crate::error::StoreError;
use crate::name_lock::fold_name;
use crate::store::{EntityStore, NameClaim};

/// Prototype name → id index.
#[derive(Debug, Default)]
pub struct PrototypeRegistry {
    by_name: DashMap<String, EntityId>,
}

impl PrototypeRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Id of the prototype called `name`, if it has been loaded.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<EntityId> {
        self.by_name.get(&fold_name(name)).map(|id| id.clone())
    }

    /// Loaded prototype names, case-folded and sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.by_name.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    pub(crate) fn register(&self, name: &str, id: EntityId) {
        self.by_name.insert(fold_name(name), id);
    }

    pub(crate) fn unregister(&self, name: &str) {
        self.by_name.remove(&fold_name(name));
    }

    /// Load or create the root prototype of every class, then walk the
    /// descendant sets to load the whole forest.
    ///
    /// The walk follows `descendant_ids` from the roots, so the result does
    /// not depend on the order files were written in. Instances are loaded
    /// along with prototypes. A descendant id with no file is logged and
    /// skipped. Returns the number of entities loaded.
    ///
    /// # Errors
    ///
    /// [`StoreError::Corrupt`] if a root reservation points at something
    /// that is not that class's root; otherwise load and I/O errors.
    pub async fn init(&self, store: &EntityStore) -> Result<usize, StoreError> {
        let mut visited = HashSet::new();
        let mut pending = Vec::new();
        let mut loaded = 0;

        for class in store.classes().iter() {
            let root = match store.names().load(&class.name, NameCategory::Prototype).await {
                Ok(record) => store.load_entity_by_id(&record.id).await?,
                Err(StoreError::NameNotFound { .. }) => self.create_root(store, class).await?,
                Err(e) => return Err(e),
            };
            validate_root(store, class, &root)?;

            self.register(&class.name, root.id.clone());
            visited.insert(root.id.clone());
            loaded += 1;
            pending.extend(root.descendant_ids.iter().cloned());
        }

        while let Some(id) = pending.pop() {
            if !visited.insert(id.clone()) {
                continue;
            }
            let entity = match store.load_entity_by_id(&id).await {
                Ok(entity) => entity,
                Err(StoreError::EntityNotFound(_)) => {
                    warn!(%id, "descendant listed but not on disk, skipping");
                    continue;
                }
                Err(e) => return Err(e),
            };
            loaded += 1;
            if entity.is_prototype
                && entity.name_category == Some(NameCategory::Prototype)
                && let Some(name) = &entity.name
            {
                self.register_if_reserved(store, name, &entity.id).await?;
            }
            pending.extend(entity.descendant_ids.iter().cloned());
        }

        info!(
            prototypes = self.len(),
            entities = loaded,
            "prototype forest loaded"
        );
        Ok(loaded)
    }

    /// Index `id` under `name` only while the name lock still names it.
    async fn register_if_reserved(
        &self,
        store: &EntityStore,
        name: &str,
        id: &EntityId,
    ) -> Result<(), StoreError> {
        match store.names().load(name, NameCategory::Prototype).await {
            Ok(record) if record.id == *id => {
                self.register(name, id.clone());
                Ok(())
            }
            Ok(record) => {
                warn!(%id, owner = %record.id, name, "prototype name now reserved by another entity, not indexed");
                Ok(())
            }
            Err(StoreError::NameNotFound { .. } | StoreError::Invalid(_)) => {
                warn!(%id, name, "prototype name was released, not indexed");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn create_root(&self, store: &EntityStore, class: &EntityClass) -> Result<Entity, StoreError> {
        let id = store.ids().generate_id();
        if !store
            .names()
            .save(&id, &class.name, NameCategory::Prototype, None)
            .await?
        {
            // Lost a race with another initializer; use the winner's root.
            let record = store.names().load(&class.name, NameCategory::Prototype).await?;
            return store.load_entity_by_id(&record.id).await;
        }

        let root = Entity::root_prototype(id.clone(), class);
        store.insert_new(root.clone());
        if let Err(err) = store.save_entity(&id).await {
            error!(%id, class = %class.name, %err, "failed to persist root prototype");
            store.forget(&id);
            if let Err(e) = store.names().delete(&class.name, NameCategory::Prototype).await {
                warn!(class = %class.name, %e, "could not release root prototype name");
            }
            return Err(err);
        }

        info!(%id, class = %class.name, version = class.version, "root prototype created");
        Ok(root)
    }

    /// Create a prototype called `new_name` deriving from `ancestor_name`.
    ///
    /// # Errors
    ///
    /// [`StoreError::PrototypeMissing`] if the ancestor is unknown,
    /// [`StoreError::NameTaken`] if `new_name` is already a prototype.
    pub async fn create_descendant(
        &self,
        store: &EntityStore,
        ancestor_name: &str,
        new_name: &str,
    ) -> Result<Entity, StoreError> {
        let ancestor_id = self.resolve(store, ancestor_name).await?;
        let id = store.ids().generate_id();
        let claim = NameClaim {
            name: new_name.to_string(),
            category: NameCategory::Prototype,
            secret: None,
        };

        let prototype = store
            .spawn_descendant(&ancestor_id, id, Some(new_name.to_string()), Some(claim), true)
            .await?;
        self.register(new_name, prototype.id.clone());

        info!(
            id = %prototype.id,
            ancestor = ancestor_name,
            name = new_name,
            "descendant prototype created"
        );
        Ok(prototype)
    }

    /// Find the prototype called `name` and make sure it is in memory.
    ///
    /// Falls back to the name lock for prototypes created after
    /// [`PrototypeRegistry::init`] by another store on the same data
    /// directory.
    pub(crate) async fn resolve(&self, store: &EntityStore, name: &str) -> Result<EntityId, StoreError> {
        let missing = || StoreError::PrototypeMissing(name.to_string());

        let id = match self.get(name) {
            Some(id) => id,
            None => match store.names().load(name, NameCategory::Prototype).await {
                Ok(record) => record.id,
                Err(StoreError::NameNotFound { .. } | StoreError::Invalid(_)) => {
                    debug!(name, "unknown prototype");
                    return Err(missing());
                }
                Err(e) => return Err(e),
            },
        };

        let entity = match store.load_entity_by_id(&id).await {
            Ok(entity) => entity,
            Err(StoreError::EntityNotFound(_)) => {
                warn!(name, %id, "prototype reservation points at a missing entity");
                return Err(missing());
            }
            Err(e) => return Err(e),
        };
        if !entity.is_prototype {
            warn!(name, %id, "reserved prototype name belongs to an instance");
            return Err(missing());
        }

        self.register(name, id.clone());
        Ok(id)
    }
}

fn validate_root(store: &EntityStore, class: &EntityClass, root: &Entity) -> Result<(), StoreError> {
    if root.class_name == class.name && root.is_prototype && root.is_root() {
        return Ok(());
    }
    error!(id = %root.id, class = %class.name, "root prototype reservation points at the wrong entity");
    Err(StoreError::corrupt(
        store.entity_path(&root.id),
        format!("not the root prototype of class '{}'", class.name),
    ))
}

#[cfg(test)]
mod tests {
    use entity_model::{ClassRegistry, FieldAttributes, FieldDef, IdProvider};
    use serde_json::json;

    use super::*;
    use crate::config::StoreConfig;
    use crate::error::ErrorKind;
    use crate::store::InstanceSpec;

    fn classes() -> ClassRegistry {
        ClassRegistry::builder()
            .class(EntityClass::new("Room", 1).field(
                FieldDef::new("description", FieldAttributes::everywhere()).with_default(json!("A room.")),
            ))
            .class(EntityClass::new("Item", 3))
            .build()
            .unwrap()
    }

    async fn store(dir: &std::path::Path) -> EntityStore {
        EntityStore::open(StoreConfig::new(dir), classes()).await.unwrap()
    }

    #[tokio::test]
    async fn test_first_boot_creates_roots() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path()).await;
        assert_eq!(store.init_prototypes().await.unwrap(), 2);

        let room_id = store.prototypes().get("room").unwrap();
        let room = store.get_entity(&room_id).unwrap();
        assert!(room.is_root());
        assert!(room.is_prototype);
        assert_eq!(room.own_field("description"), Some(&json!("A room.")));
        assert_eq!(store.prototypes().names(), vec!["item".to_string(), "room".to_string()]);

        let item = store.get_entity(&store.prototypes().get("Item").unwrap()).unwrap();
        assert_eq!(item.version, 3);
    }

    #[tokio::test]
    async fn test_second_boot_reuses_roots() {
        let dir = tempfile::tempdir().unwrap();
        let first = store(dir.path()).await;
        first.init_prototypes().await.unwrap();
        let room_id = first.prototypes().get("Room").unwrap();

        let second = store(dir.path()).await;
        second.init_prototypes().await.unwrap();
        assert_eq!(second.prototypes().get("Room"), Some(room_id));
    }

    #[tokio::test]
    async fn test_create_descendant_prototype() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path()).await;
        store.init_prototypes().await.unwrap();

        let system = store.create_descendant_prototype("Room", "SystemRoom").await.unwrap();
        let room_id = store.prototypes().get("Room").unwrap();
        assert!(system.is_prototype);
        assert_eq!(system.prototype_id.as_ref(), Some(&room_id));
        assert_eq!(system.name_category, Some(NameCategory::Prototype));
        assert!(store.get_entity(&room_id).unwrap().descendant_ids.contains(&system.id));
        assert_eq!(store.prototypes().get("systemroom"), Some(system.id.clone()));

        let err = store.create_descendant_prototype("Room", "SystemRoom").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NameTaken);

        let err = store.create_descendant_prototype("Nowhere", "X").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PrototypeMissing);
    }

    #[tokio::test]
    async fn test_instance_is_not_a_prototype() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path()).await;
        store.init_prototypes().await.unwrap();
        store
            .create_instance_entity(InstanceSpec::new("Room").unique("Hall", NameCategory::Room))
            .await
            .unwrap();

        let err = store
            .create_instance_entity(InstanceSpec::new("Hall"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PrototypeMissing);
    }

    #[tokio::test]
    async fn test_dangling_descendant_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let room_id = {
            let store = store(dir.path()).await;
            store.init_prototypes().await.unwrap();
            let hall = store.create_instance_entity(InstanceSpec::new("Room")).await.unwrap();
            std::fs::remove_file(store.entity_path(&hall.id)).unwrap();
            store.prototypes().get("Room").unwrap()
        };

        let store = store(dir.path()).await;
        assert_eq!(store.init_prototypes().await.unwrap(), 2);
        assert_eq!(store.prototypes().get("Room"), Some(room_id));
    }

    #[tokio::test]
    async fn test_wrong_root_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = store(dir.path()).await;
            store.init_prototypes().await.unwrap();
            let hall = store.create_instance_entity(InstanceSpec::new("Room")).await.unwrap();
            store.names().delete("Room", NameCategory::Prototype).await.unwrap();
            store
                .names()
                .save(&hall.id, "Room", NameCategory::Prototype, None)
                .await
                .unwrap();
        }

        let store = store(dir.path()).await;
        let err = store.init_prototypes().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Corrupt);
    }

    #[tokio::test]
    async fn test_reboot_indexes_current_reservation_owner() {
        let dir = tempfile::tempdir().unwrap();
        let (old_id, new_id) = {
            let store = store(dir.path()).await;
            store.init_prototypes().await.unwrap();
            let old = store.create_descendant_prototype("Room", "Mid").await.unwrap();
            store.release_name("Mid", NameCategory::Prototype).await.unwrap();
            assert!(store.prototypes().get("Mid").is_none());
            let new = store.create_descendant_prototype("Room", "Mid").await.unwrap();
            (old.id, new.id)
        };

        let store = store(dir.path())
            .await
            .with_id_provider(IdProvider::with_boot_stamp(1));
        store.init_prototypes().await.unwrap();
        assert_eq!(store.prototypes().get("Mid"), Some(new_id.clone()));
        assert!(store.is_loaded(&old_id));

        let instance = store
            .create_instance_entity(InstanceSpec::new("Mid"))
            .await
            .unwrap();
        assert_eq!(instance.prototype_id, Some(new_id));
    }

    #[tokio::test]
    async fn test_released_prototype_is_not_indexed_after_reboot() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = store(dir.path()).await;
            store.init_prototypes().await.unwrap();
            store.create_descendant_prototype("Room", "Cellar").await.unwrap();
            store.release_name("Cellar", NameCategory::Prototype).await.unwrap();
        }

        let store = store(dir.path()).await;
        store.init_prototypes().await.unwrap();
        assert!(store.prototypes().get("Cellar").is_none());
        let err = store
            .create_instance_entity(InstanceSpec::new("Cellar"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PrototypeMissing);
    }
}
