//! # entity_model
//!
//! The data model of the persistence engine. Nothing in this crate touches
//! the disk; it defines what an entity is and how it is turned into bytes.
//!
//! This crate provides:
//!
//! - [`EntityId`] and [`IdProvider`]: opaque string ids, unique per boot.
//! - [`NameCategory`]: namespaces for uniquely named entities.
//! - [`FieldAttributes`] / [`SerializationMode`]: per-field visibility.
//! - [`EntityClass`] / [`ClassRegistry`]: the injected catalogue of entity
//!   classes, their schema versions and field tables.
//! - [`Entity`]: an override map plus prototype link and descendant set.
//! - [`SerializationPolicy`]: mode-filtered JSON encoding and the
//!   version-guarded decoder.

pub mod attributes;
pub mod category;
pub mod class;
pub mod codec;
pub mod entity;
pub mod error;
pub mod id;

pub use attributes::{FieldAttributes, SerializationMode};
pub use category::NameCategory;
pub use class::{ClassRegistry, ClassRegistryBuilder, EntityClass, FieldDef};
pub use codec::SerializationPolicy;
pub use entity::Entity;
pub use error::CodecError;
pub use id::{EntityId, IdProvider};
