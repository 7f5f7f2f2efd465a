//! Dense array-backed component storage.

use crate::capacity::plan_capacity;
use crate::component::Component;
use crate::entity::EntityId;
use crate::store::ComponentStore;

/// Array store indexed directly by entity id.
///
/// Every operation is O(1). The backing array keeps one slot per entity id
/// up to its capacity, so iteration has to walk holes; the iteration cost is
/// therefore the capacity, not the number of present values. Best for
/// components held by most entities.
#[derive(Debug)]
pub struct DenseStore<C> {
    slots: Vec<Option<C>>,
    len: usize,
}

impl<C: Component> DenseStore<C> {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            len: 0,
        }
    }

    /// Create an empty store with room for ids below `capacity`.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let mut store = Self::new();
        store.grow_to(capacity);
        store
    }

    /// Current slot capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn grow_to(&mut self, capacity: usize) {
        if capacity > self.slots.len() {
            self.slots.resize_with(capacity, || None);
        }
    }
}

impl<C: Component> Default for DenseStore<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Component> ComponentStore<C> for DenseStore<C> {
    fn get(&self, id: EntityId, into: &mut C) -> bool {
        match self.slots.get(id.index()) {
            Some(Some(value)) => {
                into.clone_from(value);
                true
            }
            _ => false,
        }
    }

    fn set(&mut self, id: EntityId, value: &C) -> bool {
        let index = id.index();
        if index >= self.slots.len() {
            // The manager extends stores ahead of use; standalone callers
            // still get the planned growth policy instead of a panic.
            let planned = plan_capacity(self.slots.len(), index + 1);
            self.grow_to(planned);
        }
        let slot = &mut self.slots[index];
        let fresh = slot.is_none();
        *slot = Some(value.clone());
        if fresh {
            self.len += 1;
        }
        fresh
    }

    fn remove(&mut self, id: EntityId) -> Option<C> {
        let removed = self.slots.get_mut(id.index()).and_then(Option::take);
        if removed.is_some() {
            self.len -= 1;
        }
        removed
    }

    fn extend(&mut self, capacity: usize) {
        self.grow_to(capacity);
    }

    fn iteration_cost(&self) -> usize {
        self.slots.len()
    }

    fn contains(&self, id: EntityId) -> bool {
        matches!(self.slots.get(id.index()), Some(Some(_)))
    }

    fn len(&self) -> usize {
        self.len
    }

    fn ids(&self) -> Vec<EntityId> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.as_ref().map(|_| EntityId(index as u64)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Default, PartialEq)]
    struct Position {
        x: f32,
        y: f32,
    }

    impl Component for Position {
        fn type_name() -> &'static str {
            "Position"
        }
    }

    #[test]
    fn test_set_reports_fresh_then_update() {
        let mut store = DenseStore::new();
        let p = Position { x: 1.0, y: 2.0 };
        assert!(store.set(EntityId(0), &p));
        assert!(!store.set(EntityId(0), &Position { x: 3.0, y: 4.0 }));
        assert_eq!(store.len(), 1);

        let mut out = Position::default();
        assert!(store.get(EntityId(0), &mut out));
        assert_eq!(out, Position { x: 3.0, y: 4.0 });
    }

    #[test]
    fn test_get_copies_out() {
        let mut store = DenseStore::new();
        store.set(EntityId(2), &Position { x: 5.0, y: 6.0 });

        let mut copy = Position::default();
        assert!(store.get(EntityId(2), &mut copy));
        // Mutating the copy must not touch stored state.
        copy.x = 100.0;

        let mut fresh = Position::default();
        store.get(EntityId(2), &mut fresh);
        assert_eq!(fresh.x, 5.0);
    }

    #[test]
    fn test_get_absent_leaves_into_untouched() {
        let store: DenseStore<Position> = DenseStore::with_capacity(4);
        let mut out = Position { x: 9.0, y: 9.0 };
        assert!(!store.get(EntityId(1), &mut out));
        assert_eq!(out, Position { x: 9.0, y: 9.0 });
    }

    #[test]
    fn test_remove_present_and_absent() {
        let mut store = DenseStore::new();
        store.set(EntityId(1), &Position { x: 1.0, y: 1.0 });

        assert_eq!(store.remove(EntityId(1)), Some(Position { x: 1.0, y: 1.0 }));
        assert_eq!(store.remove(EntityId(1)), None);
        assert_eq!(store.remove(EntityId(99)), None);
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn test_iteration_cost_is_capacity() {
        let mut store: DenseStore<Position> = DenseStore::new();
        store.extend(32);
        store.set(EntityId(0), &Position::default());
        assert_eq!(store.iteration_cost(), 32);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_ids_skip_holes() {
        let mut store = DenseStore::new();
        store.extend(8);
        store.set(EntityId(1), &Position::default());
        store.set(EntityId(5), &Position::default());
        store.set(EntityId(3), &Position::default());
        store.remove(EntityId(3));

        assert_eq!(store.ids(), vec![EntityId(1), EntityId(5)]);
    }

    #[test]
    fn test_set_beyond_capacity_grows() {
        let mut store = DenseStore::with_capacity(2);
        assert!(store.set(EntityId(10), &Position::default()));
        assert!(store.capacity() >= 11);
        assert!(store.contains(EntityId(10)));
    }

    #[test]
    fn test_extend_never_shrinks() {
        let mut store: DenseStore<Position> = DenseStore::with_capacity(16);
        store.extend(4);
        assert_eq!(store.capacity(), 16);
    }
}
