//! Copy-in/copy-out transactions.
//!
//! A [`Transaction`] never mutates shared state before commit. Reads copy
//! committed values out (or serve the transaction's own staged writes);
//! writes, removes, and deletes are recorded locally. Committing runs the
//! staged effects through the pipeline in [`crate::pipeline`], which verifies
//! that no touched entity changed revision since it was first observed and
//! then applies everything under the per-entity locks.
//!
//! Transactions are thread-affine: a handle can neither be sent to nor
//! shared with another thread. Dropping one without committing discards the
//! staged effects.

use std::any::Any;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use store_component::{BoxedValue, Component, ComponentTypeId, DescriptorError, EntityId};

use crate::entity_ref::{EntityRef, PendingSlot, RefState};
use crate::error::{CommitError, WorldError};
use crate::manager::EntityManager;
use crate::pipeline::{self, CommitEffects};

/// One staged component mutation on an existing entity.
pub(crate) enum StagedWrite {
    Put(BoxedValue),
    Remove,
}

/// Staging record for an existing entity the transaction has read or
/// written.
pub(crate) struct TouchedEntity {
    pub(crate) generation: u64,
    /// Revision observed on first touch; commit verification fails if the
    /// entity has moved past it since.
    pub(crate) revision_at_first_touch: u64,
    pub(crate) lock: Arc<Mutex<()>>,
    pub(crate) writes: HashMap<ComponentTypeId, StagedWrite>,
    pub(crate) deleted: bool,
}

/// Staging record for an entity created inside the transaction.
pub(crate) struct PendingEntity {
    pub(crate) slot: Arc<PendingSlot>,
    pub(crate) writes: HashMap<ComponentTypeId, BoxedValue>,
    pub(crate) cancelled: bool,
}

/// An isolated unit of entity and component mutations.
pub struct Transaction {
    pub(crate) manager: EntityManager,
    pub(crate) id: u64,
    pub(crate) touched: HashMap<EntityId, TouchedEntity>,
    pub(crate) pending: Vec<PendingEntity>,
    /// Quiet transactions skip lifecycle event dispatch after commit. Used
    /// for the event handlers' own follow-up transaction so a handler's
    /// mutations cannot recurse into another round of dispatch.
    pub(crate) quiet: bool,
    _not_send: PhantomData<*mut ()>,
}

impl Transaction {
    pub(crate) fn begin(manager: EntityManager, quiet: bool) -> Self {
        let id = manager.next_transaction_id();
        let tx = Self {
            manager,
            id,
            touched: HashMap::new(),
            pending: Vec::new(),
            quiet,
            _not_send: PhantomData,
        };
        debug!(transaction = tx.id, quiet = tx.quiet, "transaction started");
        pipeline::run_pre_transaction(&tx);
        tx
    }

    /// The manager this transaction runs against.
    #[must_use]
    pub fn manager(&self) -> &EntityManager {
        &self.manager
    }

    /// Unique id of this transaction within its manager.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Returns whether committing would change anything.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.touched
            .values()
            .all(|touched| !touched.deleted && touched.writes.is_empty())
            && self.pending.iter().all(|pending| pending.cancelled)
    }

    /// Stage the creation of a new entity and return its pending reference.
    ///
    /// The reference has no id until commit; clones of it shared with other
    /// code all become live together when the transaction commits.
    pub fn create_entity(&mut self) -> EntityRef {
        let index = self.pending.len();
        let slot = Arc::new(PendingSlot::new(self.id, index));
        self.pending.push(PendingEntity {
            slot: Arc::clone(&slot),
            writes: HashMap::new(),
            cancelled: false,
        });
        debug!(transaction = self.id, pending = index, "staged entity creation");
        EntityRef::pending(self.manager.clone(), slot)
    }

    /// Copy the component of type `C` on `entity` into `into`.
    ///
    /// Staged writes of this transaction are visible; committed state is
    /// copied out otherwise. The first access to an entity records its
    /// revision for commit-time verification.
    pub fn read<C: Component>(
        &mut self,
        entity: &EntityRef,
        into: &mut C,
    ) -> Result<bool, WorldError> {
        match &entity.state {
            RefState::Absent => Err(WorldError::AbsentReference),
            RefState::Pending { manager, slot } if slot.assigned.get().is_none() => {
                self.check_context(manager, slot)?;
                let pending = self
                    .pending
                    .get(slot.index)
                    .ok_or(WorldError::ForeignReference)?;
                if pending.cancelled {
                    return Ok(false);
                }
                match pending.writes.get(&C::component_type_id()) {
                    Some(value) => {
                        clone_staged(value.as_ref(), into)?;
                        Ok(true)
                    }
                    None => Ok(false),
                }
            }
            _ => {
                let (manager, id, generation) = entity.resolve()?;
                self.check_manager(manager)?;
                let touched = self.touch(id, generation)?;
                if touched.deleted {
                    return Ok(false);
                }
                match touched.writes.get(&C::component_type_id()) {
                    Some(StagedWrite::Put(value)) => {
                        clone_staged(value.as_ref(), into)?;
                        return Ok(true);
                    }
                    Some(StagedWrite::Remove) => return Ok(false),
                    None => {}
                }
                self.manager.get_component_checked(id, Some(generation), into)
            }
        }
    }

    /// Copy the component of type `C` on `entity` into a fresh value.
    pub fn read_owned<C: Component>(
        &mut self,
        entity: &EntityRef,
    ) -> Result<Option<C>, WorldError> {
        let mut value = C::default();
        Ok(if self.read(entity, &mut value)? {
            Some(value)
        } else {
            None
        })
    }

    /// Returns whether `entity` has a component of type `C`, staged writes
    /// included.
    pub fn contains<C: Component>(&mut self, entity: &EntityRef) -> Result<bool, WorldError> {
        let type_id = C::component_type_id();
        match &entity.state {
            RefState::Absent => Err(WorldError::AbsentReference),
            RefState::Pending { manager, slot } if slot.assigned.get().is_none() => {
                self.check_context(manager, slot)?;
                let pending = self
                    .pending
                    .get(slot.index)
                    .ok_or(WorldError::ForeignReference)?;
                Ok(!pending.cancelled && pending.writes.contains_key(&type_id))
            }
            _ => {
                let (manager, id, generation) = entity.resolve()?;
                self.check_manager(manager)?;
                let underlying = self
                    .manager
                    .contains_component_checked::<C>(id, Some(generation))?;
                let touched = self.touch(id, generation)?;
                if touched.deleted {
                    return Ok(false);
                }
                Ok(match touched.writes.get(&type_id) {
                    Some(StagedWrite::Put(_)) => true,
                    Some(StagedWrite::Remove) => false,
                    None => underlying,
                })
            }
        }
    }

    /// Stage an upsert of a component on `entity`.
    ///
    /// The component type must be registered; unknown types fail here, at
    /// staging time, not at commit.
    pub fn write<C: Component>(&mut self, entity: &EntityRef, value: &C) -> Result<(), WorldError> {
        self.write_boxed(entity, C::component_type_id(), Box::new(value.clone()))
    }

    pub(crate) fn write_boxed(
        &mut self,
        entity: &EntityRef,
        type_id: ComponentTypeId,
        value: BoxedValue,
    ) -> Result<(), WorldError> {
        if !self.manager.store_registered(type_id) {
            return Err(WorldError::UnknownComponentType(type_id));
        }
        match &entity.state {
            RefState::Absent => Err(WorldError::AbsentReference),
            RefState::Pending { manager, slot } if slot.assigned.get().is_none() => {
                self.check_context(manager, slot)?;
                let pending = self
                    .pending
                    .get_mut(slot.index)
                    .ok_or(WorldError::ForeignReference)?;
                if pending.cancelled {
                    return Err(WorldError::AbsentReference);
                }
                pending.writes.insert(type_id, value);
                Ok(())
            }
            _ => {
                let (manager, id, generation) = entity.resolve()?;
                self.check_manager(manager)?;
                let touched = self.touch(id, generation)?;
                if touched.deleted {
                    return Err(WorldError::EntityDeleted(id));
                }
                touched.writes.insert(type_id, StagedWrite::Put(value));
                Ok(())
            }
        }
    }

    /// Stage the removal of a component the entity must have.
    ///
    /// The presence check honors this transaction's staged writes, so
    /// removing a component twice in one transaction is an error even
    /// before commit.
    pub fn remove<C: Component>(&mut self, entity: &EntityRef) -> Result<(), WorldError> {
        let type_id = C::component_type_id();
        if !self.manager.store_registered(type_id) {
            return Err(WorldError::UnknownComponentType(type_id));
        }
        match &entity.state {
            RefState::Absent => Err(WorldError::AbsentReference),
            RefState::Pending { manager, slot } if slot.assigned.get().is_none() => {
                self.check_context(manager, slot)?;
                let pending = self
                    .pending
                    .get_mut(slot.index)
                    .ok_or(WorldError::ForeignReference)?;
                if pending.cancelled {
                    return Err(WorldError::AbsentReference);
                }
                match pending.writes.remove(&type_id) {
                    Some(_) => Ok(()),
                    None => Err(WorldError::ComponentNotStaged(C::type_name())),
                }
            }
            _ => {
                let (manager, id, generation) = entity.resolve()?;
                self.check_manager(manager)?;
                let underlying = self
                    .manager
                    .contains_component_checked::<C>(id, Some(generation))?;
                let touched = self.touch(id, generation)?;
                if touched.deleted {
                    return Err(WorldError::EntityDeleted(id));
                }
                let present = match touched.writes.get(&type_id) {
                    Some(StagedWrite::Put(_)) => true,
                    Some(StagedWrite::Remove) => false,
                    None => underlying,
                };
                if !present {
                    return Err(WorldError::ComponentMissing {
                        entity: id,
                        component: C::type_name(),
                    });
                }
                touched.writes.insert(type_id, StagedWrite::Remove);
                Ok(())
            }
        }
    }

    /// Stage the deletion of `entity`.
    ///
    /// Deleting a pending entity cancels its creation instead.
    pub fn delete(&mut self, entity: &EntityRef) -> Result<(), WorldError> {
        match &entity.state {
            RefState::Absent => Err(WorldError::AbsentReference),
            RefState::Pending { manager, slot } if slot.assigned.get().is_none() => {
                self.check_context(manager, slot)?;
                let pending = self
                    .pending
                    .get_mut(slot.index)
                    .ok_or(WorldError::ForeignReference)?;
                pending.cancelled = true;
                pending.writes.clear();
                Ok(())
            }
            _ => {
                let (manager, id, generation) = entity.resolve()?;
                self.check_manager(manager)?;
                let touched = self.touch(id, generation)?;
                touched.deleted = true;
                touched.writes.clear();
                Ok(())
            }
        }
    }

    /// Run the staged effects through the commit pipeline.
    ///
    /// On a verification conflict every staged effect is discarded and the
    /// error reports [`CommitError::RolledBack`]; the caller retries with a
    /// fresh transaction. [`CommitError::PostCommit`] means the commit DID
    /// apply and only post-commit stages failed.
    pub fn commit(self) -> Result<CommitEffects, CommitError> {
        pipeline::commit(self)
    }

    /// Discard every staged effect, notifying rollback interceptors.
    pub fn rollback(self) {
        pipeline::roll_back(self, None);
    }

    /// Drop the transaction without running any interceptor.
    pub(crate) fn discard(self) {
        debug!(transaction = self.id, "transaction discarded");
    }

    /// Record an existing entity on first contact: capture its revision and
    /// clone its lock handle for the commit bracket.
    fn touch(&mut self, id: EntityId, generation: u64) -> Result<&mut TouchedEntity, WorldError> {
        match self.touched.entry(id) {
            std::collections::hash_map::Entry::Occupied(entry) => {
                if entry.get().generation != generation {
                    return Err(WorldError::EntityDeleted(id));
                }
                Ok(entry.into_mut())
            }
            std::collections::hash_map::Entry::Vacant(entry) => {
                let (revision, lock) = self.manager.observe_entity(id, generation)?;
                Ok(entry.insert(TouchedEntity {
                    generation,
                    revision_at_first_touch: revision,
                    lock,
                    writes: HashMap::new(),
                    deleted: false,
                }))
            }
        }
    }

    fn check_manager(&self, manager: &EntityManager) -> Result<(), WorldError> {
        if self.manager.ptr_eq(manager) {
            Ok(())
        } else {
            Err(WorldError::ForeignReference)
        }
    }

    fn check_context(
        &self,
        manager: &EntityManager,
        slot: &PendingSlot,
    ) -> Result<(), WorldError> {
        self.check_manager(manager)?;
        if slot.tx_id != self.id {
            return Err(WorldError::ForeignReference);
        }
        Ok(())
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("touched", &self.touched.len())
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

fn clone_staged<C: Component>(
    value: &(dyn Any + Send + Sync),
    into: &mut C,
) -> Result<(), WorldError> {
    match value.downcast_ref::<C>() {
        Some(staged) => {
            into.clone_from(staged);
            Ok(())
        }
        None => Err(WorldError::Descriptor(
            DescriptorError::ComponentTypeMismatch {
                expected: C::type_name(),
            },
        )),
    }
}
