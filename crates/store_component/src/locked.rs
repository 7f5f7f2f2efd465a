//! Locking wrapper over a component store.
//!
//! [`LockedStore`] makes each single get/set/remove atomic with an internal
//! mutex so the store can be shared across threads behind `&self`. It does
//! **not** make compound read-modify-write sequences atomic: two threads that
//! each get, modify, and set the same entry can still lose one update. Such
//! sequences belong in a transaction.

use std::any::Any;

use parking_lot::Mutex;

use crate::component::{Component, ComponentTypeId};
use crate::dense::DenseStore;
use crate::entity::EntityId;
use crate::sparse::SparseStore;
use crate::store::{ComponentStore, ErasedStore, StoreLayout};

/// Thread-safe wrapper around a dense or sparse store.
///
/// This is the store form the entity manager registers: the typed surface
/// (inherent methods, all `&self`) serves per-component access, and the
/// [`ErasedStore`] impl serves type-agnostic bookkeeping — deletion, growth,
/// iteration-cost ranking.
pub struct LockedStore<C: Component> {
    type_id: ComponentTypeId,
    type_name: &'static str,
    layout: StoreLayout,
    inner: Mutex<Box<dyn ComponentStore<C>>>,
}

impl<C: Component> LockedStore<C> {
    /// Create a locked store with a fresh backing store of the given layout.
    #[must_use]
    pub fn new(layout: StoreLayout, capacity: usize) -> Self {
        let inner: Box<dyn ComponentStore<C>> = match layout {
            StoreLayout::Dense => Box::new(DenseStore::with_capacity(capacity)),
            StoreLayout::Sparse => Box::new(SparseStore::new()),
        };
        Self::wrap(layout, inner)
    }

    /// Wrap an existing backing store.
    #[must_use]
    pub fn wrap(layout: StoreLayout, store: Box<dyn ComponentStore<C>>) -> Self {
        Self {
            type_id: C::component_type_id(),
            type_name: C::type_name(),
            layout,
            inner: Mutex::new(store),
        }
    }

    /// Copy the stored value for `id` into `into`. Atomic.
    pub fn get(&self, id: EntityId, into: &mut C) -> bool {
        self.inner.lock().get(id, into)
    }

    /// Copy the stored value for `id` out into a fresh instance. Atomic.
    #[must_use]
    pub fn get_owned(&self, id: EntityId) -> Option<C> {
        self.inner.lock().get_owned(id)
    }

    /// Copy `value` into storage for `id`. Atomic. Returns `true` on a fresh
    /// insert.
    pub fn set(&self, id: EntityId, value: &C) -> bool {
        self.inner.lock().set(id, value)
    }

    /// Detach and return the stored value for `id`. Atomic.
    pub fn remove(&self, id: EntityId) -> Option<C> {
        self.inner.lock().remove(id)
    }

    /// Returns whether a value is stored for `id`. Atomic.
    pub fn contains(&self, id: EntityId) -> bool {
        self.inner.lock().contains(id)
    }
}

impl<C: Component> std::fmt::Debug for LockedStore<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockedStore")
            .field("type_name", &self.type_name)
            .field("layout", &self.layout)
            .finish()
    }
}

impl<C: Component> ComponentStore<C> for LockedStore<C> {
    fn get(&self, id: EntityId, into: &mut C) -> bool {
        LockedStore::get(self, id, into)
    }

    fn set(&mut self, id: EntityId, value: &C) -> bool {
        LockedStore::set(self, id, value)
    }

    fn remove(&mut self, id: EntityId) -> Option<C> {
        LockedStore::remove(self, id)
    }

    fn extend(&mut self, capacity: usize) {
        ErasedStore::extend(self, capacity);
    }

    fn iteration_cost(&self) -> usize {
        ErasedStore::iteration_cost(self)
    }

    fn contains(&self, id: EntityId) -> bool {
        ErasedStore::contains(self, id)
    }

    fn len(&self) -> usize {
        ErasedStore::len(self)
    }

    fn ids(&self) -> Vec<EntityId> {
        ErasedStore::ids(self)
    }
}

impl<C: Component> ErasedStore for LockedStore<C> {
    fn component_type_id(&self) -> ComponentTypeId {
        self.type_id
    }

    fn type_name(&self) -> &'static str {
        self.type_name
    }

    fn layout(&self) -> StoreLayout {
        self.layout
    }

    fn discard(&self, id: EntityId) -> bool {
        self.inner.lock().remove(id).is_some()
    }

    fn accepts(&self, value: &(dyn Any + Send + Sync)) -> bool {
        value.is::<C>()
    }

    fn set_erased(&self, id: EntityId, value: &(dyn Any + Send + Sync)) -> Option<bool> {
        let value = value.downcast_ref::<C>()?;
        Some(self.inner.lock().set(id, value))
    }

    fn extend(&self, capacity: usize) {
        self.inner.lock().extend(capacity);
    }

    fn contains(&self, id: EntityId) -> bool {
        self.inner.lock().contains(id)
    }

    fn iteration_cost(&self) -> usize {
        self.inner.lock().iteration_cost()
    }

    fn len(&self) -> usize {
        self.inner.lock().len()
    }

    fn ids(&self) -> Vec<EntityId> {
        self.inner.lock().ids()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
