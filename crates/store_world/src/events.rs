//! Ordered, component-filtered event dispatch.
//!
//! Handlers subscribe to a concrete event type or to an event group; group
//! membership is declared explicitly when an event type is registered, and
//! group-level handlers are replayed onto every member list, so dispatch
//! only ever walks the one list belonging to the event's exact type. Within
//! a list, order is registration order, adjusted by `before` requests at
//! insertion time.
//!
//! Registry mutation is serialized by a reader/writer lock and dispatch
//! holds the read side for the whole handler chain, so a send never races a
//! concurrent (un)registration. The read is taken recursively, so a handler
//! may send further events from inside its callback; what a handler must
//! not do is register or unregister handlers, which needs the write side
//! and would deadlock against its own chain.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use store_component::{fnv1a_64, Component, ComponentTypeId};

use crate::entity_ref::EntityRef;
use crate::manager::EntityManager;
use crate::transaction::Transaction;

/// Identifier of an event type or event group, derived from its name with
/// the same FNV-1a hash components use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventTypeId(pub u64);

impl EventTypeId {
    /// Compute the id for an event or group name.
    #[must_use]
    pub const fn from_name(name: &str) -> Self {
        Self(fnv1a_64(name))
    }
}

impl std::fmt::Display for EventTypeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

/// Group holding the built-in entity lifecycle events.
pub const LIFECYCLE: EventTypeId = EventTypeId::from_name("EntityLifecycle");

/// An event payload.
///
/// Like components, events are identified by their string name rather than
/// by Rust type identity.
pub trait Event: Send + Sync + 'static {
    /// A human-readable name for this event type.
    fn type_name() -> &'static str
    where
        Self: Sized;

    /// Returns the [`EventTypeId`] for this event type.
    fn event_type_id() -> EventTypeId
    where
        Self: Sized,
    {
        EventTypeId::from_name(Self::type_name())
    }
}

/// Sent after a commit for every entity the commit materialized.
#[derive(Debug, Clone, Copy)]
pub struct EntityCreated;

impl Event for EntityCreated {
    fn type_name() -> &'static str {
        "EntityCreated"
    }
}

/// Sent after a commit for every entity the commit deleted.
#[derive(Debug, Clone, Copy)]
pub struct EntityDeleted;

impl Event for EntityDeleted {
    fn type_name() -> &'static str {
        "EntityDeleted"
    }
}

/// Sent after a commit for every existing entity whose components changed.
/// The triggering component set names the changed types.
#[derive(Debug, Clone, Copy)]
pub struct ComponentsChanged;

impl Event for ComponentsChanged {
    fn type_name() -> &'static str {
        "ComponentsChanged"
    }
}

/// What a handler tells the dispatcher to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    /// Keep invoking later handlers.
    Continue,
    /// Stop dispatch; the event is handled.
    Complete,
    /// Stop dispatch; the event is rejected.
    Cancel,
}

type HandlerFn =
    dyn Fn(&EntityRef, &(dyn Any + Send + Sync), &mut Transaction) -> EventOutcome + Send + Sync;

/// How a handler wants to be filtered and ordered.
#[derive(Debug, Clone, Default)]
pub struct HandlerRegistration {
    provider: String,
    required: Vec<ComponentTypeId>,
    before: Vec<String>,
}

impl HandlerRegistration {
    /// Start a registration under a provider name. The name identifies the
    /// handler in logs, in `before` requests of later registrations, and in
    /// [`EventBus::unregister_provider`].
    #[must_use]
    pub fn new(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            required: Vec::new(),
            before: Vec::new(),
        }
    }

    /// Only deliver when the entity has a component of type `C`.
    #[must_use]
    pub fn requires<C: Component>(self) -> Self {
        self.requires_id(C::component_type_id())
    }

    /// Only deliver when the entity has a component with this type id.
    #[must_use]
    pub fn requires_id(mut self, type_id: ComponentTypeId) -> Self {
        self.required.push(type_id);
        self
    }

    /// Insert ahead of the first already-registered handler from `provider`.
    #[must_use]
    pub fn before(mut self, provider: impl Into<String>) -> Self {
        self.before.push(provider.into());
        self
    }
}

#[derive(Clone)]
struct HandlerEntry {
    provider: String,
    required: Vec<ComponentTypeId>,
    callback: Arc<HandlerFn>,
}

#[derive(Default)]
struct Registry {
    /// Handler chains keyed by concrete event type.
    handlers: HashMap<EventTypeId, Vec<HandlerEntry>>,
    /// Group id -> transitive parent groups.
    group_parents: HashMap<EventTypeId, Vec<EventTypeId>>,
    /// Concrete event -> every group it belongs to, transitively.
    event_groups: HashMap<EventTypeId, Vec<EventTypeId>>,
    /// Group -> member concrete events.
    group_members: HashMap<EventTypeId, Vec<EventTypeId>>,
    /// Group-level registrations, replayed onto later member events.
    group_handlers: HashMap<EventTypeId, Vec<(HandlerEntry, Vec<String>)>>,
}

impl Registry {
    fn transitive_groups(&self, groups: &[EventTypeId]) -> Vec<EventTypeId> {
        let mut closure = Vec::new();
        let mut stack: Vec<EventTypeId> = groups.to_vec();
        while let Some(group) = stack.pop() {
            if closure.contains(&group) {
                continue;
            }
            closure.push(group);
            if let Some(parents) = self.group_parents.get(&group) {
                stack.extend(parents.iter().copied());
            }
        }
        closure
    }
}

fn insert_ordered(list: &mut Vec<HandlerEntry>, entry: HandlerEntry, before: &[String]) {
    let position = if before.is_empty() {
        None
    } else {
        list.iter()
            .position(|existing| before.iter().any(|name| existing.provider == *name))
    };
    match position {
        Some(index) => list.insert(index, entry),
        None => list.push(entry),
    }
}

/// The per-manager event registry and dispatcher.
pub struct EventBus {
    registry: RwLock<Registry>,
}

impl EventBus {
    pub(crate) fn new() -> Self {
        Self {
            registry: RwLock::new(Registry::default()),
        }
    }

    /// Declare an event group, naming the groups it belongs to in turn.
    ///
    /// Groups form the explicit supertype table: membership is declared
    /// here, once, not discovered from the types at dispatch time.
    pub fn register_group(&self, group: EventTypeId, parents: &[EventTypeId]) {
        let mut registry = self.registry.write();
        let closure = registry.transitive_groups(parents);
        debug!(group = %group, parents = closure.len(), "registered event group");
        registry.group_parents.insert(group, closure);
    }

    /// Register an event type as a member of zero or more groups.
    ///
    /// Handlers already registered against any of those groups (or their
    /// parents) apply to this event from now on. Registering the same event
    /// type again keeps the existing handler chain untouched.
    pub fn register_event<E: Event>(&self, groups: &[EventTypeId]) {
        let type_id = E::event_type_id();
        let mut registry = self.registry.write();
        if registry.event_groups.contains_key(&type_id) {
            return;
        }
        let closure = registry.transitive_groups(groups);
        debug!(event = E::type_name(), groups = closure.len(), "registered event type");

        registry.handlers.entry(type_id).or_default();
        for group in &closure {
            registry
                .group_members
                .entry(*group)
                .or_default()
                .push(type_id);
            let replayed: Vec<(HandlerEntry, Vec<String>)> = registry
                .group_handlers
                .get(group)
                .cloned()
                .unwrap_or_default();
            for (entry, before) in replayed {
                if let Some(list) = registry.handlers.get_mut(&type_id) {
                    insert_ordered(list, entry, &before);
                }
            }
        }
        registry.event_groups.insert(type_id, closure);
    }

    /// Register a typed handler for event type `E`.
    ///
    /// Delivery rules: a handler with required components fires only when
    /// the entity currently has all of them and, for sends scoped by
    /// triggering components, at least one required type is among them. A
    /// handler with no requirements always fires.
    pub fn register_handler<E, F>(&self, registration: HandlerRegistration, handler: F)
    where
        E: Event,
        F: Fn(&EntityRef, &E, &mut Transaction) -> EventOutcome + Send + Sync + 'static,
    {
        let callback: Arc<HandlerFn> = Arc::new(
            move |entity: &EntityRef, event: &(dyn Any + Send + Sync), tx: &mut Transaction| {
                match event.downcast_ref::<E>() {
                    Some(typed) => handler(entity, typed, tx),
                    None => EventOutcome::Continue,
                }
            },
        );
        self.register_erased(E::event_type_id(), registration, callback);
    }

    /// Register an untyped handler for an event type or a whole group.
    ///
    /// Group-level handlers apply to every member event, including ones
    /// registered after this call.
    pub fn register_handler_erased<F>(
        &self,
        target: EventTypeId,
        registration: HandlerRegistration,
        handler: F,
    ) where
        F: Fn(&EntityRef, &(dyn Any + Send + Sync), &mut Transaction) -> EventOutcome
            + Send
            + Sync
            + 'static,
    {
        self.register_erased(target, registration, Arc::new(handler));
    }

    fn register_erased(
        &self,
        target: EventTypeId,
        registration: HandlerRegistration,
        callback: Arc<HandlerFn>,
    ) {
        let HandlerRegistration {
            provider,
            required,
            before,
        } = registration;
        let entry = HandlerEntry {
            provider,
            required,
            callback,
        };
        let mut registry = self.registry.write();
        if registry.group_parents.contains_key(&target) {
            let members = registry
                .group_members
                .get(&target)
                .cloned()
                .unwrap_or_default();
            debug!(
                group = %target,
                provider = entry.provider.as_str(),
                members = members.len(),
                "registered group handler"
            );
            for member in members {
                if let Some(list) = registry.handlers.get_mut(&member) {
                    insert_ordered(list, entry.clone(), &before);
                }
            }
            registry
                .group_handlers
                .entry(target)
                .or_default()
                .push((entry, before));
        } else {
            debug!(event = %target, provider = entry.provider.as_str(), "registered handler");
            let list = registry.handlers.entry(target).or_default();
            insert_ordered(list, entry, &before);
        }
    }

    /// Remove every handler registered under `provider`.
    ///
    /// Returns how many entries were removed from concrete event chains.
    pub fn unregister_provider(&self, provider: &str) -> usize {
        let mut registry = self.registry.write();
        let mut removed = 0;
        for list in registry.handlers.values_mut() {
            let len_before = list.len();
            list.retain(|entry| entry.provider != provider);
            removed += len_before - list.len();
        }
        for templates in registry.group_handlers.values_mut() {
            templates.retain(|(entry, _)| entry.provider != provider);
        }
        debug!(provider, removed, "unregistered provider");
        removed
    }

    pub(crate) fn has_handlers(&self, type_id: EventTypeId) -> bool {
        self.registry
            .read()
            .handlers
            .get(&type_id)
            .is_some_and(|list| !list.is_empty())
    }

    /// Walk the handler chain of the event's exact type.
    ///
    /// The first non-[`EventOutcome::Continue`] result halts the chain and
    /// becomes the send's result; all-continue chains complete.
    pub(crate) fn dispatch(
        &self,
        manager: &EntityManager,
        entity: &EntityRef,
        type_id: EventTypeId,
        event: &(dyn Any + Send + Sync),
        tx: &mut Transaction,
        triggering: &[ComponentTypeId],
    ) -> EventOutcome {
        // Recursive read: a handler may re-enter dispatch on this thread,
        // and a plain read would deadlock behind a queued writer.
        let registry = self.registry.read_recursive();
        let Some(handlers) = registry.handlers.get(&type_id) else {
            return EventOutcome::Complete;
        };
        for entry in handlers {
            if !entry.required.is_empty() {
                let Some(id) = entity.id() else {
                    continue;
                };
                if !entry
                    .required
                    .iter()
                    .all(|required| manager.contains_component_id(id, *required))
                {
                    continue;
                }
                if !triggering.is_empty()
                    && !entry
                        .required
                        .iter()
                        .any(|required| triggering.contains(required))
                {
                    continue;
                }
            }
            let outcome = (entry.callback)(entity, event, tx);
            if outcome != EventOutcome::Continue {
                debug!(
                    event = %type_id,
                    provider = entry.provider.as_str(),
                    ?outcome,
                    "dispatch halted"
                );
                return outcome;
            }
        }
        EventOutcome::Complete
    }
}

impl EntityManager {
    /// Send `event` at `entity`, invoking handlers in chain order.
    ///
    /// `triggering` scopes delivery to handlers whose required components
    /// intersect it; pass an empty slice to deliver on presence alone.
    /// Handlers stage their reactions into `tx`.
    pub fn send_event<E: Event>(
        &self,
        entity: &EntityRef,
        event: &E,
        tx: &mut Transaction,
        triggering: &[ComponentTypeId],
    ) -> EventOutcome {
        self.events()
            .dispatch(self, entity, E::event_type_id(), event, tx, triggering)
    }
}
