//! Entity manager: id lifecycle, store registry, and multi-component
//! iteration.
//!
//! The manager owns the entity slot table and one locked store per
//! registered component type. Simple per-id operations run under the
//! structural read lock; table growth and entity deletion take the write
//! lock. A per-entity mutex serializes writers of one entity against
//! mid-commit applies.
//!
//! Lock order everywhere: per-entity lock, then the structural lock, then
//! the free list. Paths needing both first peek under a read lock to clone
//! the entity lock handle, drop the read guard, lock the entity, then
//! re-acquire and re-validate.

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use store_component::{
    plan_capacity, Component, ComponentDescriptor, ComponentTypeId, DescriptorError,
    DescriptorRegistry, EntityId, ErasedStore, LockedStore, StoreLayout,
};

use crate::entity_ref::EntityRef;
use crate::error::WorldError;
use crate::events::{ComponentsChanged, EntityCreated, EntityDeleted, EventBus, LIFECYCLE};
use crate::pipeline::{PipelineTable, TransactionInterceptor, TransactionStage};
use crate::transaction::Transaction;

/// Result of an upsert-style component write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOutcome {
    /// The component was not present before.
    Added,
    /// An existing value was overwritten.
    Updated,
}

impl SetOutcome {
    /// Returns whether the write created the component.
    #[must_use]
    pub fn is_added(self) -> bool {
        matches!(self, Self::Added)
    }
}

/// Diagnostic summary of one registered store.
#[derive(Debug, Clone)]
pub struct StoreInfo {
    /// Stored component type id.
    pub type_id: ComponentTypeId,
    /// Stored component type name.
    pub type_name: &'static str,
    /// Registered layout.
    pub layout: StoreLayout,
    /// Number of stored values.
    pub len: usize,
    /// Relative full-scan cost.
    pub iteration_cost: usize,
}

/// One slot of the entity table.
struct EntitySlot {
    /// Whether the slot currently hosts a live entity.
    live: AtomicBool,
    /// Mutation counter; the sole input to conflict detection.
    revision: AtomicU64,
    /// Tenant counter; bumped on delete so stale handles read as dead.
    /// Written only under the structural write lock.
    generation: u64,
    /// Serializes writers of this entity against mid-commit applies.
    lock: Arc<Mutex<()>>,
}

impl EntitySlot {
    fn new() -> Self {
        Self {
            live: AtomicBool::new(false),
            revision: AtomicU64::new(0),
            generation: 0,
            lock: Arc::new(Mutex::new(())),
        }
    }
}

/// Entity table plus the per-type store map; the structural state guarded by
/// the manager's reader/writer lock.
struct Structure {
    slots: Vec<EntitySlot>,
    /// High-water mark of handed-out ids. Slots at or beyond it are
    /// pre-grown capacity, not allocated entities.
    next_id: u64,
    stores: HashMap<ComponentTypeId, Box<dyn ErasedStore>>,
}

impl Structure {
    /// Bounds- and liveness-check an id, optionally pinning the tenant
    /// generation a reference handle observed.
    fn live_slot(
        &self,
        id: EntityId,
        expected_generation: Option<u64>,
    ) -> Result<&EntitySlot, WorldError> {
        if id.0 >= self.next_id {
            return Err(WorldError::EntityNotFound(id));
        }
        let slot = &self.slots[id.index()];
        if !slot.live.load(Ordering::Acquire) {
            return Err(WorldError::EntityDeleted(id));
        }
        if let Some(expected) = expected_generation {
            if slot.generation != expected {
                return Err(WorldError::EntityDeleted(id));
            }
        }
        Ok(slot)
    }

    fn typed_store<C: Component>(&self) -> Result<&LockedStore<C>, WorldError> {
        let type_id = C::component_type_id();
        let erased = self
            .stores
            .get(&type_id)
            .ok_or(WorldError::UnknownComponentType(type_id))?;
        erased
            .as_any()
            .downcast_ref::<LockedStore<C>>()
            .ok_or(WorldError::UnknownComponentType(type_id))
    }

    /// Grow the slot table and every registered store to at least
    /// `capacity`. Requires the write lock.
    fn grow(&mut self, capacity: usize) {
        if capacity <= self.slots.len() {
            return;
        }
        self.slots.resize_with(capacity, EntitySlot::new);
        for store in self.stores.values() {
            store.extend(capacity);
        }
        debug!(capacity, "entity table grown");
    }
}

pub(crate) struct ManagerInner {
    structure: RwLock<Structure>,
    free: Mutex<Vec<EntityId>>,
    live_count: AtomicU64,
    registry: RwLock<DescriptorRegistry>,
    events: EventBus,
    pipeline: PipelineTable,
    next_tx_id: AtomicU64,
}

/// Handle to the entity manager.
///
/// Cheap to clone; all clones address the same world. Entity references and
/// transactions carry one of these handles internally.
#[derive(Clone)]
pub struct EntityManager {
    inner: Arc<ManagerInner>,
}

impl EntityManager {
    /// Create an empty manager with no registered component types.
    #[must_use]
    pub fn new() -> Self {
        Self::with_initial_capacity(0)
    }

    /// Start building a manager with up-front registrations.
    #[must_use]
    pub fn builder() -> EntityManagerBuilder {
        EntityManagerBuilder::new()
    }

    fn with_initial_capacity(capacity: usize) -> Self {
        let manager = Self {
            inner: Arc::new(ManagerInner {
                structure: RwLock::new(Structure {
                    slots: Vec::new(),
                    next_id: 0,
                    stores: HashMap::new(),
                }),
                free: Mutex::new(Vec::new()),
                live_count: AtomicU64::new(0),
                registry: RwLock::new(DescriptorRegistry::new()),
                events: EventBus::new(),
                pipeline: PipelineTable::new(),
                next_tx_id: AtomicU64::new(1),
            }),
        };
        if capacity > 0 {
            manager.inner.structure.write().grow(capacity);
        }
        manager.register_builtin_events();
        manager
    }

    fn register_builtin_events(&self) {
        let events = self.events();
        events.register_group(LIFECYCLE, &[]);
        events.register_event::<EntityCreated>(&[LIFECYCLE]);
        events.register_event::<EntityDeleted>(&[LIFECYCLE]);
        events.register_event::<ComponentsChanged>(&[LIFECYCLE]);
    }

    // -- Component type registration --

    /// Register a store for component type `C` with an auto-generated
    /// descriptor (no properties).
    pub fn register_component<C: Component>(&self, layout: StoreLayout) -> Result<(), WorldError> {
        self.register_component_with::<C>(layout, ComponentDescriptor::of::<C>())
    }

    /// Register a store for component type `C` together with its descriptor.
    ///
    /// The descriptor's property table is what recipe materialization uses
    /// to rewrite entity-reference properties.
    pub fn register_component_with<C: Component>(
        &self,
        layout: StoreLayout,
        descriptor: ComponentDescriptor,
    ) -> Result<(), WorldError> {
        let type_id = C::component_type_id();
        if descriptor.component_type_id() != type_id {
            return Err(WorldError::Descriptor(
                DescriptorError::ComponentTypeMismatch {
                    expected: C::type_name(),
                },
            ));
        }
        let mut structure = self.inner.structure.write();
        if structure.stores.contains_key(&type_id) {
            return Err(WorldError::ComponentAlreadyRegistered(C::type_name()));
        }
        let capacity = structure.slots.len();
        structure
            .stores
            .insert(type_id, Box::new(LockedStore::<C>::new(layout, capacity)));
        self.inner.registry.write().register(descriptor);
        debug!(component = C::type_name(), ?layout, "registered component store");
        Ok(())
    }

    /// Look up the descriptor registered for a component type.
    #[must_use]
    pub fn descriptor(&self, type_id: ComponentTypeId) -> Option<Arc<ComponentDescriptor>> {
        self.inner.registry.read().get(type_id)
    }

    /// Diagnostic summaries of every registered store, ordered by type id.
    #[must_use]
    pub fn stores(&self) -> Vec<StoreInfo> {
        let structure = self.inner.structure.read();
        let mut infos: Vec<StoreInfo> = structure
            .stores
            .values()
            .map(|store| StoreInfo {
                type_id: store.component_type_id(),
                type_name: store.type_name(),
                layout: store.layout(),
                len: store.len(),
                iteration_cost: store.iteration_cost(),
            })
            .collect();
        infos.sort_by_key(|info| info.type_id);
        infos
    }

    // -- Entity lifecycle --

    /// Create a live entity and return its reference handle.
    ///
    /// Recycles an id from the free list when one is available, otherwise
    /// takes a fresh id, growing the entity table (and every store) as
    /// needed.
    pub fn create_entity(&self) -> EntityRef {
        let (id, generation) = self.allocate();
        EntityRef::live(self.clone(), id, generation)
    }

    /// Number of currently live entities.
    #[must_use]
    pub fn size(&self) -> usize {
        self.inner.live_count.load(Ordering::Relaxed) as usize
    }

    /// Returns whether `id` addresses a live entity.
    #[must_use]
    pub fn contains(&self, id: EntityId) -> bool {
        self.inner.structure.read().live_slot(id, None).is_ok()
    }

    /// Build a reference handle for a live entity id.
    pub fn entity_ref(&self, id: EntityId) -> Result<EntityRef, WorldError> {
        let structure = self.inner.structure.read();
        let slot = structure.live_slot(id, None)?;
        Ok(EntityRef::live(self.clone(), id, slot.generation))
    }

    // -- Direct component access (reduced-consistency mode) --
    //
    // Each call is individually atomic and still advances the entity
    // revision, so transactions detect direct writes as conflicts. Compound
    // read-modify-write sequences are NOT protected here; use a transaction.

    /// Copy the component of type `C` on entity `id` into `into`.
    pub fn get_component<C: Component>(
        &self,
        id: EntityId,
        into: &mut C,
    ) -> Result<bool, WorldError> {
        self.get_component_checked(id, None, into)
    }

    /// Copy the component of type `C` on entity `id` into a fresh value.
    pub fn get_component_owned<C: Component>(
        &self,
        id: EntityId,
    ) -> Result<Option<C>, WorldError> {
        self.get_owned_checked(id, None)
    }

    /// Upsert the component of type `C` on entity `id`.
    pub fn set_component<C: Component>(
        &self,
        id: EntityId,
        value: &C,
    ) -> Result<SetOutcome, WorldError> {
        self.set_component_checked(id, None, value)
    }

    /// Add a component the entity must not already have.
    pub fn add_component<C: Component>(&self, id: EntityId, value: &C) -> Result<(), WorldError> {
        self.add_component_checked(id, None, value)
    }

    /// Remove a component the entity must have; returns the removed value.
    pub fn remove_component<C: Component>(&self, id: EntityId) -> Result<C, WorldError> {
        self.remove_component_checked(id, None)
    }

    /// Remove a component if present; `None` when the entity lacks it.
    pub fn take_component<C: Component>(&self, id: EntityId) -> Result<Option<C>, WorldError> {
        self.take_component_checked(id, None)
    }

    /// Returns whether the entity has a component of type `C`.
    pub fn contains_component<C: Component>(&self, id: EntityId) -> Result<bool, WorldError> {
        self.contains_component_checked::<C>(id, None)
    }

    // -- Iteration --

    /// Entities holding every requested component type.
    ///
    /// The requested stores are ranked by iteration cost and the cheapest
    /// drives; remaining stores are probed per candidate and the first miss
    /// short-circuits. Argument order never changes the result set, only
    /// which store does the scanning. An empty request yields all live
    /// entities.
    pub fn iterate(&self, types: &[ComponentTypeId]) -> Result<Vec<EntityRef>, WorldError> {
        let structure = self.inner.structure.read();

        if types.is_empty() {
            let mut all = Vec::with_capacity(self.size());
            for (index, slot) in structure.slots.iter().enumerate() {
                if (index as u64) < structure.next_id && slot.live.load(Ordering::Acquire) {
                    all.push(EntityRef::live(
                        self.clone(),
                        EntityId(index as u64),
                        slot.generation,
                    ));
                }
            }
            return Ok(all);
        }

        let mut stores = Vec::with_capacity(types.len());
        for type_id in types {
            let store = structure
                .stores
                .get(type_id)
                .ok_or(WorldError::UnknownComponentType(*type_id))?;
            stores.push(store.as_ref());
        }
        stores.sort_by_key(|store| store.iteration_cost());
        let Some((driver, probes)) = stores.split_first() else {
            return Ok(Vec::new());
        };

        let mut matches = Vec::new();
        'candidates: for id in driver.ids() {
            let Ok(slot) = structure.live_slot(id, None) else {
                continue;
            };
            for probe in probes {
                if !probe.contains(id) {
                    continue 'candidates;
                }
            }
            matches.push(EntityRef::live(self.clone(), id, slot.generation));
        }
        Ok(matches)
    }

    // -- Transactions, events, pipeline --

    /// Begin a transaction against this manager.
    #[must_use]
    pub fn begin(&self) -> Transaction {
        Transaction::begin(self.clone(), false)
    }

    /// The event bus of this manager.
    #[must_use]
    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// Register a pipeline interceptor for one stage.
    ///
    /// Interceptors of a stage run in registration order. Lock acquisition
    /// and verification precede their stage's interceptors; the
    /// `PROCESS_COMMIT` apply follows its interceptors, so a failing
    /// interceptor there still aborts with nothing written. Interceptors in
    /// the bracketed stages run while entity locks are held and must not
    /// touch entity data directly; stage such work through a follow-up
    /// transaction instead.
    pub fn register_interceptor(
        &self,
        stage: TransactionStage,
        interceptor: Arc<dyn TransactionInterceptor>,
    ) {
        self.inner.pipeline.register(stage, interceptor);
    }

    pub(crate) fn pipeline(&self) -> &PipelineTable {
        &self.inner.pipeline
    }

    pub(crate) fn next_transaction_id(&self) -> u64 {
        self.inner.next_tx_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    // -- Internals shared with the transaction pipeline --

    /// Allocate a live entity id, recycling before growing.
    pub(crate) fn allocate(&self) -> (EntityId, u64) {
        {
            let structure = self.inner.structure.read();
            let recycled = self.inner.free.lock().pop();
            if let Some(id) = recycled {
                let slot = &structure.slots[id.index()];
                slot.live.store(true, Ordering::Release);
                self.inner.live_count.fetch_add(1, Ordering::Relaxed);
                debug!(entity = id.0, recycled = true, "created entity");
                return (id, slot.generation);
            }
        }

        let mut structure = self.inner.structure.write();
        let id = EntityId(structure.next_id);
        structure.next_id += 1;
        if id.index() >= structure.slots.len() {
            let planned = plan_capacity(structure.slots.len(), id.index() + 1);
            structure.grow(planned);
        }
        let slot = &structure.slots[id.index()];
        slot.live.store(true, Ordering::Release);
        self.inner.live_count.fetch_add(1, Ordering::Relaxed);
        debug!(entity = id.0, recycled = false, "created entity");
        (id, slot.generation)
    }

    /// Record the revision of a live entity and hand back its lock.
    pub(crate) fn observe_entity(
        &self,
        id: EntityId,
        expected_generation: u64,
    ) -> Result<(u64, Arc<Mutex<()>>), WorldError> {
        let structure = self.inner.structure.read();
        let slot = structure.live_slot(id, Some(expected_generation))?;
        Ok((slot.revision.load(Ordering::Acquire), Arc::clone(&slot.lock)))
    }

    /// Authoritative revision of an id, live or not.
    pub(crate) fn current_revision(&self, id: EntityId) -> Result<u64, WorldError> {
        let structure = self.inner.structure.read();
        if id.0 >= structure.next_id {
            return Err(WorldError::EntityNotFound(id));
        }
        Ok(structure.slots[id.index()].revision.load(Ordering::Acquire))
    }

    /// Advance an entity's revision by one committed mutation.
    pub(crate) fn bump_revision(&self, id: EntityId) {
        let structure = self.inner.structure.read();
        if let Some(slot) = structure.slots.get(id.index()) {
            slot.revision.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Returns whether a store exists for the type.
    pub(crate) fn store_registered(&self, type_id: ComponentTypeId) -> bool {
        self.inner.structure.read().stores.contains_key(&type_id)
    }

    /// Returns whether the store for `type_id` would accept `value`.
    pub(crate) fn store_accepts(
        &self,
        type_id: ComponentTypeId,
        value: &(dyn Any + Send + Sync),
    ) -> Result<bool, WorldError> {
        let structure = self.inner.structure.read();
        let store = structure
            .stores
            .get(&type_id)
            .ok_or(WorldError::UnknownComponentType(type_id))?;
        Ok(store.accepts(value))
    }

    /// Apply a type-erased write. Caller holds the entity lock.
    pub(crate) fn apply_boxed_write(
        &self,
        id: EntityId,
        type_id: ComponentTypeId,
        value: &(dyn Any + Send + Sync),
    ) -> Result<bool, WorldError> {
        let structure = self.inner.structure.read();
        let store = structure
            .stores
            .get(&type_id)
            .ok_or(WorldError::UnknownComponentType(type_id))?;
        store
            .set_erased(id, value)
            .ok_or_else(|| {
                WorldError::Descriptor(DescriptorError::ComponentTypeMismatch {
                    expected: store.type_name(),
                })
            })
    }

    /// Drop a component by type id. Caller holds the entity lock.
    pub(crate) fn discard_component_id(
        &self,
        id: EntityId,
        type_id: ComponentTypeId,
    ) -> Result<bool, WorldError> {
        let structure = self.inner.structure.read();
        let store = structure
            .stores
            .get(&type_id)
            .ok_or(WorldError::UnknownComponentType(type_id))?;
        Ok(store.discard(id))
    }

    /// Presence probe by type id; dead entities and unknown types read as
    /// absent. Used by event delivery filters.
    pub(crate) fn contains_component_id(&self, id: EntityId, type_id: ComponentTypeId) -> bool {
        let structure = self.inner.structure.read();
        if structure.live_slot(id, None).is_err() {
            return false;
        }
        structure
            .stores
            .get(&type_id)
            .is_some_and(|store| store.contains(id))
    }

    /// Delete an entity, taking its lock first.
    pub(crate) fn delete_entity(
        &self,
        id: EntityId,
        expected_generation: u64,
    ) -> Result<Vec<ComponentTypeId>, WorldError> {
        let lock = self.peek_entity_lock(id, Some(expected_generation))?;
        let _guard = lock.lock();
        self.delete_locked(id, expected_generation)
    }

    /// Delete an entity whose lock the caller already holds: strip its
    /// components from every store, retire the slot, and free the id.
    pub(crate) fn delete_locked(
        &self,
        id: EntityId,
        expected_generation: u64,
    ) -> Result<Vec<ComponentTypeId>, WorldError> {
        let mut structure = self.inner.structure.write();
        structure.live_slot(id, Some(expected_generation))?;

        let mut removed = Vec::new();
        for store in structure.stores.values() {
            if store.discard(id) {
                removed.push(store.component_type_id());
            }
        }
        removed.sort();

        let slot = &mut structure.slots[id.index()];
        slot.live.store(false, Ordering::Release);
        slot.generation += 1;
        slot.revision.fetch_add(1, Ordering::AcqRel);
        self.inner.free.lock().push(id);
        self.inner.live_count.fetch_sub(1, Ordering::Relaxed);
        debug!(entity = id.0, components = removed.len(), "deleted entity");
        Ok(removed)
    }

    fn peek_entity_lock(
        &self,
        id: EntityId,
        expected_generation: Option<u64>,
    ) -> Result<Arc<Mutex<()>>, WorldError> {
        let structure = self.inner.structure.read();
        let slot = structure.live_slot(id, expected_generation)?;
        Ok(Arc::clone(&slot.lock))
    }

    pub(crate) fn get_component_checked<C: Component>(
        &self,
        id: EntityId,
        expected_generation: Option<u64>,
        into: &mut C,
    ) -> Result<bool, WorldError> {
        let lock = self.peek_entity_lock(id, expected_generation)?;
        let _guard = lock.lock();
        let structure = self.inner.structure.read();
        structure.live_slot(id, expected_generation)?;
        let store = structure.typed_store::<C>()?;
        Ok(store.get(id, into))
    }

    pub(crate) fn get_owned_checked<C: Component>(
        &self,
        id: EntityId,
        expected_generation: Option<u64>,
    ) -> Result<Option<C>, WorldError> {
        let mut value = C::default();
        Ok(
            if self.get_component_checked(id, expected_generation, &mut value)? {
                Some(value)
            } else {
                None
            },
        )
    }

    pub(crate) fn set_component_checked<C: Component>(
        &self,
        id: EntityId,
        expected_generation: Option<u64>,
        value: &C,
    ) -> Result<SetOutcome, WorldError> {
        let lock = self.peek_entity_lock(id, expected_generation)?;
        let _guard = lock.lock();
        let structure = self.inner.structure.read();
        let slot = structure.live_slot(id, expected_generation)?;
        let store = structure.typed_store::<C>()?;
        let fresh = store.set(id, value);
        slot.revision.fetch_add(1, Ordering::AcqRel);
        Ok(if fresh {
            SetOutcome::Added
        } else {
            SetOutcome::Updated
        })
    }

    pub(crate) fn add_component_checked<C: Component>(
        &self,
        id: EntityId,
        expected_generation: Option<u64>,
        value: &C,
    ) -> Result<(), WorldError> {
        let lock = self.peek_entity_lock(id, expected_generation)?;
        let _guard = lock.lock();
        let structure = self.inner.structure.read();
        let slot = structure.live_slot(id, expected_generation)?;
        let store = structure.typed_store::<C>()?;
        if store.contains(id) {
            return Err(WorldError::ComponentAlreadyPresent {
                entity: id,
                component: C::type_name(),
            });
        }
        store.set(id, value);
        slot.revision.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    pub(crate) fn remove_component_checked<C: Component>(
        &self,
        id: EntityId,
        expected_generation: Option<u64>,
    ) -> Result<C, WorldError> {
        let lock = self.peek_entity_lock(id, expected_generation)?;
        let _guard = lock.lock();
        let structure = self.inner.structure.read();
        let slot = structure.live_slot(id, expected_generation)?;
        let store = structure.typed_store::<C>()?;
        match store.remove(id) {
            Some(value) => {
                slot.revision.fetch_add(1, Ordering::AcqRel);
                Ok(value)
            }
            None => Err(WorldError::ComponentMissing {
                entity: id,
                component: C::type_name(),
            }),
        }
    }

    pub(crate) fn take_component_checked<C: Component>(
        &self,
        id: EntityId,
        expected_generation: Option<u64>,
    ) -> Result<Option<C>, WorldError> {
        let lock = self.peek_entity_lock(id, expected_generation)?;
        let _guard = lock.lock();
        let structure = self.inner.structure.read();
        let slot = structure.live_slot(id, expected_generation)?;
        let store = structure.typed_store::<C>()?;
        let removed = store.remove(id);
        if removed.is_some() {
            slot.revision.fetch_add(1, Ordering::AcqRel);
        }
        Ok(removed)
    }

    pub(crate) fn contains_component_checked<C: Component>(
        &self,
        id: EntityId,
        expected_generation: Option<u64>,
    ) -> Result<bool, WorldError> {
        let structure = self.inner.structure.read();
        structure.live_slot(id, expected_generation)?;
        let store = structure.typed_store::<C>()?;
        Ok(store.contains(id))
    }
}

impl Default for EntityManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EntityManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityManager")
            .field("size", &self.size())
            .finish_non_exhaustive()
    }
}

/// Builder for an [`EntityManager`] with up-front registrations.
pub struct EntityManagerBuilder {
    initial_capacity: usize,
    registrations: Vec<Box<dyn FnOnce(&EntityManager) -> Result<(), WorldError>>>,
}

impl EntityManagerBuilder {
    fn new() -> Self {
        Self {
            initial_capacity: 0,
            registrations: Vec::new(),
        }
    }

    /// Pre-size the entity table.
    #[must_use]
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.initial_capacity = capacity;
        self
    }

    /// Register component type `C` with an auto-generated descriptor.
    #[must_use]
    pub fn with_component<C: Component>(mut self, layout: StoreLayout) -> Self {
        self.registrations
            .push(Box::new(move |manager| manager.register_component::<C>(layout)));
        self
    }

    /// Register component type `C` with an explicit descriptor.
    #[must_use]
    pub fn with_component_described<C: Component>(
        mut self,
        layout: StoreLayout,
        descriptor: ComponentDescriptor,
    ) -> Self {
        self.registrations.push(Box::new(move |manager| {
            manager.register_component_with::<C>(layout, descriptor)
        }));
        self
    }

    /// Build the manager and run every registration.
    pub fn build(self) -> Result<EntityManager, WorldError> {
        let manager = EntityManager::with_initial_capacity(self.initial_capacity);
        for registration in self.registrations {
            registration(&manager)?;
        }
        Ok(manager)
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

    #[derive(Debug, Clone, Default, PartialEq)]
    struct Health {
        current: f32,
    }

    impl Component for Health {
        fn type_name() -> &'static str {
            "Health"
        }
    }

    #[derive(Debug, Clone, Default, PartialEq)]
    struct Rare {
        payload: u64,
    }

    impl Component for Rare {
        fn type_name() -> &'static str {
            "Rare"
        }
    }

    fn test_manager() -> EntityManager {
        EntityManager::builder()
            .with_capacity(4)
            .with_component::<Position>(StoreLayout::Dense)
            .with_component::<Health>(StoreLayout::Dense)
            .with_component::<Rare>(StoreLayout::Sparse)
            .build()
            .unwrap()
    }

    #[test]
    fn test_size_tracks_create_and_delete() {
        let manager = test_manager();
        assert_eq!(manager.size(), 0);

        let mut a = manager.create_entity();
        let b = manager.create_entity();
        assert_eq!(manager.size(), 2);

        a.delete().unwrap();
        assert_eq!(manager.size(), 1);
        assert!(manager.contains(b.id().unwrap()));
    }

    #[test]
    fn test_ids_are_recycled_not_duplicated() {
        let manager = test_manager();
        let mut a = manager.create_entity();
        let a_id = a.id().unwrap();
        let b = manager.create_entity();

        a.delete().unwrap();
        let c = manager.create_entity();
        // The freed id comes back before a fresh one is minted.
        assert_eq!(c.id().unwrap(), a_id);
        assert_ne!(c.id().unwrap(), b.id().unwrap());
        assert_eq!(manager.size(), 2);
    }

    #[test]
    fn test_set_reports_added_then_updated() {
        let manager = test_manager();
        let e = manager.create_entity();
        let id = e.id().unwrap();

        let outcome = manager.set_component(id, &Position { x: 1.0, y: 2.0 }).unwrap();
        assert_eq!(outcome, SetOutcome::Added);

        let outcome = manager.set_component(id, &Position { x: 3.0, y: 4.0 }).unwrap();
        assert_eq!(outcome, SetOutcome::Updated);

        let mut out = Position::default();
        assert!(manager.get_component(id, &mut out).unwrap());
        assert_eq!(out, Position { x: 3.0, y: 4.0 });
    }

    #[test]
    fn test_strict_add_and_remove() {
        let manager = test_manager();
        let e = manager.create_entity();
        let id = e.id().unwrap();

        manager.add_component(id, &Health { current: 10.0 }).unwrap();
        let err = manager.add_component(id, &Health { current: 20.0 }).unwrap_err();
        assert!(matches!(err, WorldError::ComponentAlreadyPresent { .. }));

        let removed = manager.remove_component::<Health>(id).unwrap();
        assert_eq!(removed.current, 10.0);
        let err = manager.remove_component::<Health>(id).unwrap_err();
        assert!(matches!(err, WorldError::ComponentMissing { .. }));

        // take is the lenient form.
        assert!(manager.take_component::<Health>(id).unwrap().is_none());
    }

    #[test]
    fn test_unregistered_type_is_an_error() {
        #[derive(Debug, Clone, Default)]
        struct Unregistered;
        impl Component for Unregistered {
            fn type_name() -> &'static str {
                "Unregistered"
            }
        }

        let manager = test_manager();
        let e = manager.create_entity();
        let err = manager
            .set_component(e.id().unwrap(), &Unregistered)
            .unwrap_err();
        assert!(matches!(err, WorldError::UnknownComponentType(_)));
    }

    #[test]
    fn test_duplicate_registration_is_an_error() {
        let manager = test_manager();
        let err = manager
            .register_component::<Position>(StoreLayout::Sparse)
            .unwrap_err();
        assert!(matches!(
            err,
            WorldError::ComponentAlreadyRegistered("Position")
        ));
    }

    #[test]
    fn test_registration_after_entities_extends_store() {
        let manager = test_manager();
        for _ in 0..20 {
            manager.create_entity();
        }

        #[derive(Debug, Clone, Default, PartialEq)]
        struct Late {
            v: u8,
        }
        impl Component for Late {
            fn type_name() -> &'static str {
                "Late"
            }
        }

        manager.register_component::<Late>(StoreLayout::Dense).unwrap();
        let outcome = manager.set_component(EntityId(19), &Late { v: 7 }).unwrap();
        assert_eq!(outcome, SetOutcome::Added);
    }

    #[test]
    fn test_iterate_is_order_independent() {
        let manager = test_manager();
        let mut with_both = Vec::new();
        for i in 0..10u64 {
            let e = manager.create_entity();
            let id = e.id().unwrap();
            manager.set_component(id, &Position::default()).unwrap();
            if i % 3 == 0 {
                manager.set_component(id, &Rare { payload: i }).unwrap();
                with_both.push(id);
            }
        }

        let ab = manager
            .iterate(&[Position::component_type_id(), Rare::component_type_id()])
            .unwrap();
        let ba = manager
            .iterate(&[Rare::component_type_id(), Position::component_type_id()])
            .unwrap();

        let mut ab_ids: Vec<EntityId> = ab.iter().filter_map(EntityRef::id).collect();
        let mut ba_ids: Vec<EntityId> = ba.iter().filter_map(EntityRef::id).collect();
        ab_ids.sort();
        ba_ids.sort();
        assert_eq!(ab_ids, ba_ids);
        assert_eq!(ab_ids, with_both);
    }

    #[test]
    fn test_iterate_empty_request_yields_all_live() {
        let manager = test_manager();
        let a = manager.create_entity();
        let mut b = manager.create_entity();
        let c = manager.create_entity();
        b.delete().unwrap();

        let mut ids: Vec<EntityId> = manager
            .iterate(&[])
            .unwrap()
            .iter()
            .filter_map(EntityRef::id)
            .collect();
        ids.sort();
        assert_eq!(ids, vec![a.id().unwrap(), c.id().unwrap()]);
    }

    #[test]
    fn test_iterate_unknown_type_is_an_error() {
        let manager = test_manager();
        let err = manager
            .iterate(&[ComponentTypeId::from_name("Nope")])
            .unwrap_err();
        assert!(matches!(err, WorldError::UnknownComponentType(_)));
    }

    #[test]
    fn test_deleted_entity_operations_fail() {
        let manager = test_manager();
        let mut e = manager.create_entity();
        let id = e.id().unwrap();
        manager.set_component(id, &Position::default()).unwrap();
        e.delete().unwrap();

        let err = manager.set_component(id, &Position::default()).unwrap_err();
        assert!(matches!(err, WorldError::EntityDeleted(_)));
        let err = manager.entity_ref(id).unwrap_err();
        assert!(matches!(err, WorldError::EntityDeleted(_)));
    }

    #[test]
    fn test_delete_strips_all_stores() {
        let manager = test_manager();
        let mut e = manager.create_entity();
        let id = e.id().unwrap();
        manager.set_component(id, &Position::default()).unwrap();
        manager.set_component(id, &Rare { payload: 1 }).unwrap();

        e.delete().unwrap();
        // The recycled tenant starts with no components.
        let fresh = manager.create_entity();
        assert_eq!(fresh.id().unwrap(), id);
        assert!(!manager.contains_component::<Position>(id).unwrap());
        assert!(!manager.contains_component::<Rare>(id).unwrap());
    }

    #[test]
    fn test_store_infos_expose_layout_and_cost() {
        let manager = test_manager();
        let e = manager.create_entity();
        manager
            .set_component(e.id().unwrap(), &Rare { payload: 2 })
            .unwrap();

        let infos = manager.stores();
        assert_eq!(infos.len(), 3);
        let rare = infos
            .iter()
            .find(|info| info.type_name == "Rare")
            .unwrap();
        assert_eq!(rare.type_id, Rare::component_type_id());
        assert_eq!(rare.layout, StoreLayout::Sparse);
        assert_eq!(rare.len, 1);
        assert_eq!(rare.iteration_cost, 1);

        // Every summary carries its own store's domain id, so the set of
        // ids matches the set of registered component types.
        let mut ids: Vec<_> = infos.iter().map(|info| info.type_id).collect();
        ids.dedup();
        assert_eq!(ids.len(), 3);
    }

    #[test]
    fn test_not_found_vs_deleted() {
        let manager = test_manager();
        let err = manager.get_component_owned::<Position>(EntityId(99)).unwrap_err();
        assert!(matches!(err, WorldError::EntityNotFound(_)));

        let mut e = manager.create_entity();
        let id = e.id().unwrap();
        e.delete().unwrap();
        let err = manager.get_component_owned::<Position>(id).unwrap_err();
        assert!(matches!(err, WorldError::EntityDeleted(_)));
    }
}
