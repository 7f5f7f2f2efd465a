//! Sparse hash-map-backed component storage.

use std::collections::HashMap;

use crate::component::Component;
use crate::entity::EntityId;
use crate::store::ComponentStore;

/// Hash map store keyed by entity id.
///
/// O(1) amortized per-id operations, no backing array to extend, and
/// iteration visits only present entries — its iteration cost is the entry
/// count. Best for components held by a small fraction of entities.
#[derive(Debug)]
pub struct SparseStore<C> {
    entries: HashMap<EntityId, C>,
}

impl<C: Component> SparseStore<C> {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<C: Component> Default for SparseStore<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Component> ComponentStore<C> for SparseStore<C> {
    fn get(&self, id: EntityId, into: &mut C) -> bool {
        match self.entries.get(&id) {
            Some(value) => {
                into.clone_from(value);
                true
            }
            None => false,
        }
    }

    fn set(&mut self, id: EntityId, value: &C) -> bool {
        self.entries.insert(id, value.clone()).is_none()
    }

    fn remove(&mut self, id: EntityId) -> Option<C> {
        self.entries.remove(&id)
    }

    fn extend(&mut self, _capacity: usize) {
        // Map-backed storage needs no pre-sizing.
    }

    fn iteration_cost(&self) -> usize {
        self.entries.len()
    }

    fn contains(&self, id: EntityId) -> bool {
        self.entries.contains_key(&id)
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn ids(&self) -> Vec<EntityId> {
        self.entries.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Default, PartialEq)]
    struct Tag {
        label: String,
    }

    impl Component for Tag {
        fn type_name() -> &'static str {
            "Tag"
        }
    }

    #[test]
    fn test_set_reports_fresh_then_update() {
        let mut store = SparseStore::new();
        assert!(store.set(
            EntityId(7),
            &Tag {
                label: "a".to_string()
            }
        ));
        assert!(!store.set(
            EntityId(7),
            &Tag {
                label: "b".to_string()
            }
        ));

        let mut out = Tag::default();
        assert!(store.get(EntityId(7), &mut out));
        assert_eq!(out.label, "b");
    }

    #[test]
    fn test_get_copies_out() {
        let mut store = SparseStore::new();
        store.set(
            EntityId(1),
            &Tag {
                label: "stored".to_string(),
            },
        );

        let mut copy = Tag::default();
        store.get(EntityId(1), &mut copy);
        copy.label.push_str("-mutated");

        let mut fresh = Tag::default();
        store.get(EntityId(1), &mut fresh);
        assert_eq!(fresh.label, "stored");
    }

    #[test]
    fn test_remove_present_and_absent() {
        let mut store = SparseStore::new();
        store.set(
            EntityId(3),
            &Tag {
                label: "x".to_string(),
            },
        );

        assert!(store.remove(EntityId(3)).is_some());
        assert!(store.remove(EntityId(3)).is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn test_iteration_cost_is_entry_count() {
        let mut store = SparseStore::new();
        store.extend(1000);
        store.set(EntityId(500), &Tag::default());
        store.set(EntityId(900), &Tag::default());
        assert_eq!(store.iteration_cost(), 2);
    }

    #[test]
    fn test_ids_cover_entries() {
        let mut store = SparseStore::new();
        store.set(EntityId(4), &Tag::default());
        store.set(EntityId(2), &Tag::default());

        let mut ids = store.ids();
        ids.sort();
        assert_eq!(ids, vec![EntityId(2), EntityId(4)]);
    }
}
