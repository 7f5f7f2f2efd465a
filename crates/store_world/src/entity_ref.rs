//! Tagged entity reference handles.
//!
//! An [`EntityRef`] is a value, not a pointer: it can be absent, pending
//! (created inside a transaction that has not committed yet), or live. Every
//! component access re-validates the target, so a reference held across a
//! delete reports [`WorldError::EntityDeleted`] instead of silently reading
//! whatever entity was recycled into the same id.

use std::fmt;
use std::sync::{Arc, OnceLock};

use store_component::{Component, EntityId};

use crate::error::WorldError;
use crate::manager::{EntityManager, SetOutcome};

/// Shared assignment cell for an entity created inside a transaction.
///
/// Every clone of the pending reference sees the same cell; when the
/// transaction commits, the allocated id and generation are published here
/// and all clones become live at once.
pub(crate) struct PendingSlot {
    /// Transaction that owns this pending entity.
    pub(crate) tx_id: u64,
    /// Position in the transaction's pending list.
    pub(crate) index: usize,
    /// Set exactly once, at commit.
    pub(crate) assigned: OnceLock<(EntityId, u64)>,
}

impl PendingSlot {
    pub(crate) fn new(tx_id: u64, index: usize) -> Self {
        Self {
            tx_id,
            index,
            assigned: OnceLock::new(),
        }
    }
}

#[derive(Clone, Default)]
pub(crate) enum RefState {
    /// Deliberately points at nothing.
    #[default]
    Absent,
    /// Points at an entity that existed when the reference was built.
    Live {
        manager: EntityManager,
        id: EntityId,
        generation: u64,
    },
    /// Created in a transaction; becomes live when the slot is assigned.
    Pending {
        manager: EntityManager,
        slot: Arc<PendingSlot>,
    },
}

/// Handle to an entity, safe to store inside components.
///
/// `Default` is the absent reference, which lets components holding
/// references derive `Default` like any other component.
#[derive(Clone, Default)]
pub struct EntityRef {
    pub(crate) state: RefState,
}

impl EntityRef {
    /// The reference that points at nothing.
    #[must_use]
    pub fn absent() -> Self {
        Self {
            state: RefState::Absent,
        }
    }

    pub(crate) fn live(manager: EntityManager, id: EntityId, generation: u64) -> Self {
        Self {
            state: RefState::Live {
                manager,
                id,
                generation,
            },
        }
    }

    pub(crate) fn pending(manager: EntityManager, slot: Arc<PendingSlot>) -> Self {
        Self {
            state: RefState::Pending { manager, slot },
        }
    }

    /// The referenced entity id, once one exists.
    ///
    /// `None` for absent references and for pending references whose
    /// transaction has not committed.
    #[must_use]
    pub fn id(&self) -> Option<EntityId> {
        match &self.state {
            RefState::Absent => None,
            RefState::Live { id, .. } => Some(*id),
            RefState::Pending { slot, .. } => slot.assigned.get().map(|(id, _)| *id),
        }
    }

    /// Returns whether this is the absent reference.
    #[must_use]
    pub fn is_absent(&self) -> bool {
        matches!(self.state, RefState::Absent)
    }

    /// Returns whether this reference still awaits id assignment.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        match &self.state {
            RefState::Pending { slot, .. } => slot.assigned.get().is_none(),
            _ => false,
        }
    }

    /// Returns whether the referenced entity currently exists.
    ///
    /// False for absent and unassigned pending references, and for
    /// references whose entity has since been deleted.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        match self.resolve() {
            Ok((manager, id, generation)) => manager.observe_entity(id, generation).is_ok(),
            Err(_) => false,
        }
    }

    /// The manager this reference belongs to, if any.
    #[must_use]
    pub fn manager(&self) -> Option<&EntityManager> {
        match &self.state {
            RefState::Absent => None,
            RefState::Live { manager, .. } | RefState::Pending { manager, .. } => Some(manager),
        }
    }

    /// Resolve to `(manager, id, generation)` or explain why that is not
    /// possible yet.
    pub(crate) fn resolve(&self) -> Result<(&EntityManager, EntityId, u64), WorldError> {
        match &self.state {
            RefState::Absent => Err(WorldError::AbsentReference),
            RefState::Live {
                manager,
                id,
                generation,
            } => Ok((manager, *id, *generation)),
            RefState::Pending { manager, slot } => match slot.assigned.get() {
                Some((id, generation)) => Ok((manager, *id, *generation)),
                None => Err(WorldError::PendingReference),
            },
        }
    }

    // -- Direct component access through the reference --

    /// Copy the component of type `C` into `into`.
    pub fn get<C: Component>(&self, into: &mut C) -> Result<bool, WorldError> {
        let (manager, id, generation) = self.resolve()?;
        manager.get_component_checked(id, Some(generation), into)
    }

    /// Copy the component of type `C` into a fresh value.
    pub fn get_owned<C: Component>(&self) -> Result<Option<C>, WorldError> {
        let (manager, id, generation) = self.resolve()?;
        manager.get_owned_checked(id, Some(generation))
    }

    /// Upsert a component on the referenced entity.
    pub fn set<C: Component>(&self, value: &C) -> Result<SetOutcome, WorldError> {
        let (manager, id, generation) = self.resolve()?;
        manager.set_component_checked(id, Some(generation), value)
    }

    /// Add a component the entity must not already have.
    pub fn add<C: Component>(&self, value: &C) -> Result<(), WorldError> {
        let (manager, id, generation) = self.resolve()?;
        manager.add_component_checked(id, Some(generation), value)
    }

    /// Remove a component the entity must have; returns the removed value.
    pub fn remove<C: Component>(&self) -> Result<C, WorldError> {
        let (manager, id, generation) = self.resolve()?;
        manager.remove_component_checked(id, Some(generation))
    }

    /// Remove a component if present.
    pub fn take<C: Component>(&self) -> Result<Option<C>, WorldError> {
        let (manager, id, generation) = self.resolve()?;
        manager.take_component_checked(id, Some(generation))
    }

    /// Returns whether the entity has a component of type `C`.
    pub fn contains<C: Component>(&self) -> Result<bool, WorldError> {
        let (manager, id, generation) = self.resolve()?;
        manager.contains_component_checked::<C>(id, Some(generation))
    }

    /// Delete the referenced entity and turn this handle absent.
    ///
    /// Other clones of the reference are not rewritten; they report
    /// [`WorldError::EntityDeleted`] from then on.
    pub fn delete(&mut self) -> Result<(), WorldError> {
        let (manager, id, generation) = {
            let (manager, id, generation) = self.resolve()?;
            (manager.clone(), id, generation)
        };
        manager.delete_entity(id, generation)?;
        self.state = RefState::Absent;
        Ok(())
    }
}

impl PartialEq for EntityRef {
    /// Equality is by manager, id, and generation, so a stale reference is
    /// never equal to a reference at the same recycled id. Two clones of an
    /// unassigned pending reference compare equal through their shared slot.
    fn eq(&self, other: &Self) -> bool {
        if let (RefState::Pending { slot: sa, .. }, RefState::Pending { slot: sb, .. }) =
            (&self.state, &other.state)
        {
            if Arc::ptr_eq(sa, sb) {
                return true;
            }
        }
        match (self.resolve().ok(), other.resolve().ok()) {
            (Some((ma, ia, ga)), Some((mb, ib, gb))) => {
                ma.ptr_eq(mb) && ia == ib && ga == gb
            }
            (None, None) => self.is_absent() && other.is_absent(),
            _ => false,
        }
    }
}

impl Eq for EntityRef {}

impl fmt::Debug for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.state {
            RefState::Absent => write!(f, "EntityRef(absent)"),
            RefState::Live { id, generation, .. } => {
                write!(f, "EntityRef({id}, generation {generation})")
            }
            RefState::Pending { slot, .. } => match slot.assigned.get() {
                Some((id, generation)) => write!(f, "EntityRef({id}, generation {generation})"),
                None => write!(
                    f,
                    "EntityRef(pending #{} in transaction {})",
                    slot.index, slot.tx_id
                ),
            },
        }
    }
}
