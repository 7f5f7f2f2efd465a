//! # store_component
//!
//! Component-level primitives for the entity data store — what a component
//! is, how its type is described, and how per-type stores hold it.
//!
//! This crate provides:
//!
//! - [`Component`] trait — the contract all stored data must satisfy.
//! - [`ComponentTypeId`] / [`EntityId`] — deterministic type ids and
//!   lightweight entity ids.
//! - [`ComponentDescriptor`] — construct/copy/property-accessor tables
//!   consumed by prefab materialization.
//! - [`DenseStore`] / [`SparseStore`] / [`LockedStore`] — the storage
//!   layouts and the thread-safe wrapper, sharing one
//!   [`ComponentStore`] contract.
//! - [`plan_capacity`] — the shared growth policy for array-backed storage.

pub mod capacity;
pub mod component;
pub mod dense;
pub mod descriptor;
pub mod entity;
pub mod locked;
pub mod sparse;
pub mod store;

pub use capacity::plan_capacity;
pub use component::{fnv1a_64, Component, ComponentTypeId};
pub use dense::DenseStore;
pub use descriptor::{
    BoxedValue, ComponentDescriptor, DescriptorError, DescriptorRegistry, PropertyAccessor,
};
pub use entity::EntityId;
pub use locked::LockedStore;
pub use sparse::SparseStore;
pub use store::{ComponentStore, ErasedStore, StoreLayout};
