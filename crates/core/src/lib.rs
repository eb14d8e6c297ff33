//! `commitbox-core`: identity and versioning primitives shared by every crate.
//!
//! This crate contains **pure domain** building blocks (no storage concerns).

pub mod entity;
pub mod error;
pub mod id;
pub mod identity;
pub mod value_object;
pub mod version;

pub use entity::Entity;
pub use error::{DomainError, DomainResult};
pub use id::{EntityId, InstanceKey};
pub use identity::{EntityState, Tracked};
pub use value_object::ValueObject;
pub use version::ExpectedVersion;
