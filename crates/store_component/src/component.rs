//! Core [`Component`] trait and component type identity.
//!
//! Every value held in a component store implements [`Component`]. The trait
//! requires `Clone` because stores never hand out live aliases: reads copy
//! the stored value into a caller-supplied instance and writes copy the
//! caller's value into storage. `Default` gives descriptors a parameterless
//! constructor for prefab materialization.

use serde::{Deserialize, Serialize};

/// FNV-1a 64-bit hash of a name.
///
/// The shared identity scheme for every name-derived id in the store
/// (component types, event types).
///
/// ```text
/// hash = 0xcbf29ce484222325          (offset basis)
/// for each byte in name.as_bytes():
///     hash = hash XOR byte
///     hash = hash * 0x00000100000001b3  (prime)
/// return hash
/// ```
#[must_use]
pub const fn fnv1a_64(name: &str) -> u64 {
    const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
    const FNV_PRIME: u64 = 0x0100_0000_01b3;

    let bytes = name.as_bytes();
    let mut hash = FNV_OFFSET_BASIS;
    let mut i = 0;
    while i < bytes.len() {
        hash ^= bytes[i] as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
        i += 1;
    }
    hash
}

/// A unique identifier for a component type, derived from its string name
/// using the FNV-1a 64-bit hash algorithm.
///
/// The id is deterministic: any two runs (or any two processes) that register
/// a component under the same name agree on its `ComponentTypeId`, which is
/// what lets external layers persist component snapshots keyed by type id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct ComponentTypeId(pub u64);

impl ComponentTypeId {
    /// Compute the [`ComponentTypeId`] from a component's string name using
    /// [`fnv1a_64`].
    #[must_use]
    pub const fn from_name(name: &str) -> Self {
        Self(fnv1a_64(name))
    }

    /// Compute the [`ComponentTypeId`] for a Rust component type `C`.
    ///
    /// Hashes `C::type_name()` with FNV-1a, producing the same result as
    /// [`ComponentTypeId::from_name`] with the same string.
    #[must_use]
    pub fn of<C: Component>() -> Self {
        Self::from_name(C::type_name())
    }
}

impl std::fmt::Display for ComponentTypeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

/// The core component trait.
///
/// Components are plain, copyable values associated with at most one entity
/// per type. `Clone` backs the copy-in/copy-out store contract, `Default`
/// backs descriptor construction, and `Send + Sync` lets stores be shared
/// across threads behind the locking wrapper.
///
/// # Examples
///
/// ```rust
/// use store_component::Component;
///
/// #[derive(Debug, Clone, Default, PartialEq)]
/// struct Health {
///     current: f32,
///     max: f32,
/// }
///
/// impl Component for Health {
///     fn type_name() -> &'static str { "Health" }
/// }
/// ```
pub trait Component: Clone + Default + Send + Sync + 'static {
    /// A human-readable name for this component type.
    ///
    /// The name is the source of the type id; two component types must not
    /// share a name within one manager.
    fn type_name() -> &'static str;

    /// Returns the [`ComponentTypeId`] for this component type.
    fn component_type_id() -> ComponentTypeId {
        ComponentTypeId::from_name(Self::type_name())
    }
}
