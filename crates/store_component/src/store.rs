//! Store contract shared by every storage layout.
//!
//! All stores obey copy-in/copy-out: `get` copies the stored value into a
//! caller-supplied instance and `set` copies the caller's value into storage,
//! so a caller can never mutate stored state through a retrieved value. The
//! [`ErasedStore`] surface is what the entity manager holds once the
//! component type has been erased; [`ErasedStore::as_any`] recovers the typed
//! store.

use std::any::Any;

use crate::component::{Component, ComponentTypeId};
use crate::entity::EntityId;

/// Storage layout selection for a component type.
///
/// Dense storage indexes directly by entity id and is cheap to probe but
/// iterates over holes; sparse storage hashes ids and iterates only present
/// entries. Pick sparse for components held by a small fraction of entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreLayout {
    /// Array indexed by entity id; iteration cost equals capacity.
    Dense,
    /// Hash map keyed by entity id; iteration cost equals entry count.
    Sparse,
}

/// Per-type storage mapping entity id to component value.
///
/// The iteration-cost metric is the store's own estimate of how expensive a
/// full scan is, used to pick the driving store for multi-component
/// iteration: capacity for dense stores (scans must skip holes), entry count
/// for sparse stores.
pub trait ComponentStore<C: Component>: Send + Sync {
    /// Copy the stored value for `id` into `into`.
    ///
    /// Returns whether a value was present. When absent, `into` is left
    /// untouched.
    fn get(&self, id: EntityId, into: &mut C) -> bool;

    /// Copy `value` into storage for `id`, creating the entry if absent.
    ///
    /// Returns `true` when this was a fresh insert, `false` when an existing
    /// entry was overwritten.
    fn set(&mut self, id: EntityId, value: &C) -> bool;

    /// Detach and return the stored value for `id`, if any.
    fn remove(&mut self, id: EntityId) -> Option<C>;

    /// Grow backing storage to hold ids below `capacity`.
    ///
    /// A no-op for map-backed stores and whenever `capacity` is already
    /// covered.
    fn extend(&mut self, capacity: usize);

    /// Relative cost of a full scan over this store.
    fn iteration_cost(&self) -> usize;

    /// Returns whether a value is stored for `id`.
    fn contains(&self, id: EntityId) -> bool;

    /// Number of stored values.
    fn len(&self) -> usize;

    /// Returns whether the store holds no values.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids of all present entries, in the store's own scan order.
    fn ids(&self) -> Vec<EntityId>;

    /// Copy the stored value for `id` out into a fresh instance.
    fn get_owned(&self, id: EntityId) -> Option<C> {
        let mut value = C::default();
        if self.get(id, &mut value) {
            Some(value)
        } else {
            None
        }
    }
}

/// Type-erased view of a locked store, as held by the entity manager.
///
/// Every method takes `&self`: the erased surface is only implemented by the
/// locking wrapper, which serializes access internally. Entity deletion and
/// table growth go through this trait without knowing component types.
pub trait ErasedStore: Send + Sync {
    /// The stored component type id.
    ///
    /// Named like [`Component::component_type_id`]; a bare `type_id` through
    /// a `Box` or `Arc` resolves to `Any::type_id` on the pointer instead.
    fn component_type_id(&self) -> ComponentTypeId;

    /// The stored component type name.
    fn type_name(&self) -> &'static str;

    /// The layout this store was registered with.
    fn layout(&self) -> StoreLayout;

    /// Remove and drop any value stored for `id`.
    ///
    /// Returns whether a value was present.
    fn discard(&self, id: EntityId) -> bool;

    /// Returns whether `value` is an instance of the stored component type.
    ///
    /// Commit verification uses this to reject a mistyped staged write
    /// before anything has been applied.
    fn accepts(&self, value: &(dyn Any + Send + Sync)) -> bool;

    /// Copy a type-erased `value` into storage for `id`.
    ///
    /// Returns `Some(fresh)` like the typed `set`, or `None` when `value` is
    /// not an instance of the stored component type (nothing is written).
    fn set_erased(&self, id: EntityId, value: &(dyn Any + Send + Sync)) -> Option<bool>;

    /// Grow backing storage to hold ids below `capacity`.
    fn extend(&self, capacity: usize);

    /// Returns whether a value is stored for `id`.
    fn contains(&self, id: EntityId) -> bool;

    /// Relative cost of a full scan over this store.
    fn iteration_cost(&self) -> usize;

    /// Number of stored values.
    fn len(&self) -> usize;

    /// Ids of all present entries.
    fn ids(&self) -> Vec<EntityId>;

    /// Downcast support; yields the concrete locked store.
    fn as_any(&self) -> &dyn Any;
}
