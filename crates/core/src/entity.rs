//! Entity trait: the business payload of a stored row.

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Business state of an aggregate that can be persisted by a unit of work.
///
/// Identity (`id`, `version`) lives in [`crate::Tracked`], not in the entity
/// itself. The core never looks inside the fields; it only serializes them.
pub trait Entity: Clone + core::fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Logical table this entity's rows are written to (e.g. "riders").
    const TABLE: &'static str;
}
