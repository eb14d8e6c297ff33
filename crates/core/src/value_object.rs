//! Value object trait: equality by value, not identity.

/// Marker trait for value objects.
///
/// Value objects carry no identity and are immutable; two instances with the
/// same attributes are interchangeable. Contrast with [`crate::Tracked`]
/// entities, which are the same entity across changes to their fields.
pub trait ValueObject: Clone + PartialEq + core::fmt::Debug {}
