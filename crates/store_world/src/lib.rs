//! # store_world
//!
//! The entity manager and everything that runs through it: transactional
//! mutation with optimistic conflict detection, ordered component-filtered
//! event dispatch, and declarative recipe materialization.
//!
//! This crate provides:
//!
//! - [`EntityManager`] — entity allocation, per-type stores, direct access,
//!   and multi-component iteration.
//! - [`EntityRef`] — the tagged entity handle: absent, pending, or live,
//!   checked at every access.
//! - [`Transaction`] — staged copy-in/copy-out mutation batches committed
//!   through the staged pipeline, with caller-driven retry on conflict.
//! - [`TransactionInterceptor`] / [`TransactionStage`] — hooks into the
//!   commit pipeline's stages.
//! - [`EventBus`] — handler registration with required-component filters,
//!   explicit event groups, and `before` ordering.
//! - [`Recipe`] / [`RecipeGraph`] / [`RecipeLibrary`] — entity templates
//!   with transactional sibling-reference resolution.

pub mod entity_ref;
pub mod error;
pub mod events;
pub mod manager;
pub mod pipeline;
pub mod recipe;
pub mod transaction;

pub use entity_ref::EntityRef;
pub use error::{CommitError, PostCommitErrors, RecipeError, TransactionError, WorldError};
pub use events::{
    ComponentsChanged, EntityCreated, EntityDeleted, Event, EventBus, EventOutcome, EventTypeId,
    HandlerRegistration, LIFECYCLE,
};
pub use manager::{EntityManager, EntityManagerBuilder, SetOutcome, StoreInfo};
pub use pipeline::{
    CommitEffects, EntityChange, FnInterceptor, StageContext, TransactionInterceptor,
    TransactionStage,
};
pub use recipe::{Recipe, RecipeGraph, RecipeLibrary};
pub use transaction::Transaction;

pub use store_component::{Component, ComponentTypeId, EntityId, StoreLayout};
