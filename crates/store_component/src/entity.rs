//! Entity identifier type.
//!
//! An [`EntityId`] is a lightweight `u64` identifier with no inherent data.
//! Ids are dense: the manager hands them out from a free list of recycled
//! slots first, then from a monotonically growing high-water mark, so every
//! id below the high-water mark is either live or queued for reuse.

use serde::{Deserialize, Serialize};

/// A unique entity identifier.
///
/// An entity is nothing but its id; all of its data lives in the component
/// stores it is attached to. An `EntityId` says nothing about liveness: a
/// deleted entity's id is recycled, and reference handles detect staleness
/// through the slot generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId(pub u64);

impl EntityId {
    /// Create an entity id from a raw `u64`.
    #[must_use]
    pub const fn from_raw(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw `u64` identifier.
    #[must_use]
    pub const fn id(self) -> u64 {
        self.0
    }

    /// Returns the id as a table index.
    ///
    /// Ids are dense, so they double as direct indexes into slot tables and
    /// dense component stores.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "entity {}", self.0)
    }
}

impl From<u64> for EntityId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_id_roundtrip() {
        let e = EntityId::from_raw(42);
        assert_eq!(e.id(), 42);
        assert_eq!(e.index(), 42);
    }

    #[test]
    fn test_entity_id_ordering() {
        assert!(EntityId(1) < EntityId(2));
        assert_eq!(EntityId(7), EntityId::from(7));
    }

    #[test]
    fn test_entity_id_display() {
        assert_eq!(EntityId(3).to_string(), "entity 3");
    }

    #[test]
    fn test_entity_id_serde_roundtrip() {
        let e = EntityId(999);
        let json = serde_json::to_string(&e).unwrap();
        let restored: EntityId = serde_json::from_str(&json).unwrap();
        assert_eq!(e, restored);
    }
}
