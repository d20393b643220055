//! File-backed entity persistence for the game server.
//!
//! This crate provides:
//! - [`EntityStore`]: the arena of loaded entities, creation, loading,
//!   saving, destruction, and prototypal field reads
//! - [`NameLock`]: exclusive, persisted reservation of unique names
//! - [`PrototypeRegistry`]: the root prototype of every class and the
//!   descendant trees below them
//! - [`StoreConfig`]: where and how data is written
//!
//! ## Example
//!
//! ```ignore
//! use entity_store::{ClassRegistry, EntityStore, InstanceSpec, NameCategory, StoreConfig};
//!
//! let store = EntityStore::open(StoreConfig::from_env(), ClassRegistry::game_defaults()).await?;
//! store.init_prototypes().await?;
//!
//! let bob = store
//!     .create_instance_entity(InstanceSpec::new("Character").unique("Bob", NameCategory::Character))
//!     .await?;
//! ```

pub mod config;
pub mod error;
mod files;
pub mod name_lock;
pub mod prototype;
pub mod store;

pub use config::StoreConfig;
pub use error::{ErrorKind, StoreError};
pub use name_lock::{NameLock, NameLockRecord};
pub use prototype::PrototypeRegistry;
pub use store::{EntityStore, InstanceSpec};

pub use entity_model::{
    ClassRegistry, Entity, EntityClass, EntityId, FieldAttributes, FieldDef, IdProvider,
    NameCategory, SerializationMode, SerializationPolicy,
};
