//! Component type descriptors.
//!
//! A [`ComponentDescriptor`] is the narrow surface the store consumes from
//! whatever layer defines component classes: a parameterless constructor, a
//! copy function, and a table of named property accessors. Descriptors are
//! built once when a component type is registered and never re-derived at
//! use sites; the accessor table is what lets prefab materialization rewrite
//! entity-reference properties without knowing the concrete component type.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

use crate::component::{Component, ComponentTypeId};

/// A type-erased component value, as produced and consumed by descriptors.
pub type BoxedValue = Box<dyn Any + Send + Sync>;

/// Errors from descriptor-mediated access.
#[derive(Debug, Error)]
pub enum DescriptorError {
    /// The value passed in was not an instance of the descriptor's type.
    #[error("value is not a `{expected}` component")]
    ComponentTypeMismatch {
        /// Name of the component type the descriptor describes.
        expected: &'static str,
    },
    /// No accessor with the requested name exists on this type.
    #[error("component `{component}` has no property `{property}`")]
    UnknownProperty {
        /// Component type name.
        component: &'static str,
        /// The property that was requested.
        property: String,
    },
    /// The supplied property value had the wrong type.
    #[error("property `{component}.{property}` rejected value of the wrong type")]
    PropertyTypeMismatch {
        /// Component type name.
        component: &'static str,
        /// The property being assigned.
        property: &'static str,
    },
}

/// A named get/set pair over one property of a component type.
///
/// Accessors are statically typed at construction and erased for storage;
/// the getter returns a boxed copy of the property value, the setter consumes
/// a boxed value and fails cleanly on a type mismatch.
pub struct PropertyAccessor {
    name: &'static str,
    component: &'static str,
    get: Box<dyn Fn(&dyn Any) -> Option<BoxedValue> + Send + Sync>,
    set: Box<dyn Fn(&mut dyn Any, BoxedValue) -> Result<(), DescriptorError> + Send + Sync>,
}

impl PropertyAccessor {
    /// Build an accessor for property `name` of component `C`.
    ///
    /// `get` copies the property out of a component; `set` stores a new value
    /// into it. The property value type `T` must be clonable because the
    /// getter hands out copies, never aliases.
    pub fn new<C, T>(
        name: &'static str,
        get: impl Fn(&C) -> T + Send + Sync + 'static,
        set: impl Fn(&mut C, T) + Send + Sync + 'static,
    ) -> Self
    where
        C: Component,
        T: Clone + Send + Sync + 'static,
    {
        Self {
            name,
            component: C::type_name(),
            get: Box::new(move |value| {
                value
                    .downcast_ref::<C>()
                    .map(|component| Box::new(get(component)) as BoxedValue)
            }),
            set: Box::new(move |value, new| {
                let component = value.downcast_mut::<C>().ok_or(
                    DescriptorError::ComponentTypeMismatch {
                        expected: C::type_name(),
                    },
                )?;
                let new = new
                    .downcast::<T>()
                    .map_err(|_| DescriptorError::PropertyTypeMismatch {
                        component: C::type_name(),
                        property: name,
                    })?;
                set(component, *new);
                Ok(())
            }),
        }
    }

    /// The property name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl std::fmt::Debug for PropertyAccessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PropertyAccessor")
            .field("component", &self.component)
            .field("name", &self.name)
            .finish()
    }
}

/// Per-type construct/copy/property-access table.
pub struct ComponentDescriptor {
    type_id: ComponentTypeId,
    type_name: &'static str,
    construct: Box<dyn Fn() -> BoxedValue + Send + Sync>,
    clone_value: Box<dyn Fn(&dyn Any) -> Option<BoxedValue> + Send + Sync>,
    properties: Vec<PropertyAccessor>,
    by_name: HashMap<&'static str, usize>,
}

impl ComponentDescriptor {
    /// Build the base descriptor for component type `C` with an empty
    /// property table.
    #[must_use]
    pub fn of<C: Component>() -> Self {
        Self {
            type_id: C::component_type_id(),
            type_name: C::type_name(),
            construct: Box::new(|| Box::new(C::default()) as BoxedValue),
            clone_value: Box::new(|value| {
                value
                    .downcast_ref::<C>()
                    .map(|component| Box::new(component.clone()) as BoxedValue)
            }),
            properties: Vec::new(),
            by_name: HashMap::new(),
        }
    }

    /// Add a property accessor, builder style.
    #[must_use]
    pub fn with_property(mut self, accessor: PropertyAccessor) -> Self {
        self.by_name.insert(accessor.name, self.properties.len());
        self.properties.push(accessor);
        self
    }

    /// The described component type id.
    ///
    /// Named like [`Component::component_type_id`]; a bare `type_id` through
    /// the registry's `Arc` resolves to `Any::type_id` on the pointer
    /// instead.
    #[must_use]
    pub fn component_type_id(&self) -> ComponentTypeId {
        self.type_id
    }

    /// The described component type name.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Construct a default-initialized instance of the component.
    #[must_use]
    pub fn construct(&self) -> BoxedValue {
        (self.construct)()
    }

    /// Copy a component value.
    ///
    /// Fails if `value` is not an instance of the described type.
    pub fn clone_value(&self, value: &dyn Any) -> Result<BoxedValue, DescriptorError> {
        (self.clone_value)(value).ok_or(DescriptorError::ComponentTypeMismatch {
            expected: self.type_name,
        })
    }

    /// Returns whether a property with the given name exists.
    #[must_use]
    pub fn has_property(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    /// Iterate property names in declaration order.
    pub fn property_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.properties.iter().map(|p| p.name)
    }

    /// Read a property, returning a boxed copy of its value.
    pub fn get_property(&self, value: &dyn Any, name: &str) -> Result<BoxedValue, DescriptorError> {
        let accessor = self.accessor(name)?;
        (accessor.get)(value).ok_or(DescriptorError::ComponentTypeMismatch {
            expected: self.type_name,
        })
    }

    /// Write a property from a boxed value.
    pub fn set_property(
        &self,
        value: &mut dyn Any,
        name: &str,
        new: BoxedValue,
    ) -> Result<(), DescriptorError> {
        let accessor = self.accessor(name)?;
        (accessor.set)(value, new)
    }

    fn accessor(&self, name: &str) -> Result<&PropertyAccessor, DescriptorError> {
        self.by_name
            .get(name)
            .map(|&idx| &self.properties[idx])
            .ok_or_else(|| DescriptorError::UnknownProperty {
                component: self.type_name,
                property: name.to_string(),
            })
    }
}

impl std::fmt::Debug for ComponentDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentDescriptor")
            .field("type_id", &self.type_id)
            .field("type_name", &self.type_name)
            .field("properties", &self.properties)
            .finish()
    }
}

/// Registry of component descriptors, keyed by type id.
///
/// Populated once at registration time; lookups share the descriptor through
/// an [`Arc`] so callers can hold it across store operations.
#[derive(Default)]
pub struct DescriptorRegistry {
    by_id: HashMap<ComponentTypeId, Arc<ComponentDescriptor>>,
}

impl DescriptorRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a descriptor, replacing any previous one for the same type.
    pub fn register(&mut self, descriptor: ComponentDescriptor) -> Arc<ComponentDescriptor> {
        let type_id = descriptor.component_type_id();
        let descriptor = Arc::new(descriptor);
        self.by_id.insert(type_id, Arc::clone(&descriptor));
        descriptor
    }

    /// Register component type `C` with an empty property table.
    pub fn register_type<C: Component>(&mut self) -> Arc<ComponentDescriptor> {
        self.register(ComponentDescriptor::of::<C>())
    }

    /// Look up a descriptor by type id.
    #[must_use]
    pub fn get(&self, type_id: ComponentTypeId) -> Option<Arc<ComponentDescriptor>> {
        self.by_id.get(&type_id).cloned()
    }

    /// Returns whether a descriptor is registered for the type id.
    #[must_use]
    pub fn contains(&self, type_id: ComponentTypeId) -> bool {
        self.by_id.contains_key(&type_id)
    }

    /// Number of registered descriptors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    /// Returns whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Default, PartialEq)]
    struct Follow {
        target: u64,
        distance: f32,
    }

    impl Component for Follow {
        fn type_name() -> &'static str {
            "Follow"
        }
    }

    fn follow_descriptor() -> ComponentDescriptor {
        ComponentDescriptor::of::<Follow>()
            .with_property(PropertyAccessor::new::<Follow, u64>(
                "target",
                |c| c.target,
                |c, v| c.target = v,
            ))
            .with_property(PropertyAccessor::new::<Follow, f32>(
                "distance",
                |c| c.distance,
                |c, v| c.distance = v,
            ))
    }

    #[test]
    fn test_construct_builds_default() {
        let descriptor = follow_descriptor();
        let value = descriptor.construct();
        let follow = value.downcast_ref::<Follow>().unwrap();
        assert_eq!(*follow, Follow::default());
    }

    #[test]
    fn test_clone_value_copies() {
        let descriptor = follow_descriptor();
        let original = Follow {
            target: 9,
            distance: 2.5,
        };
        let copy = descriptor.clone_value(&original).unwrap();
        assert_eq!(*copy.downcast_ref::<Follow>().unwrap(), original);
    }

    #[test]
    fn test_clone_value_rejects_foreign_type() {
        let descriptor = follow_descriptor();
        let err = descriptor.clone_value(&42u64).unwrap_err();
        assert!(matches!(
            err,
            DescriptorError::ComponentTypeMismatch { expected: "Follow" }
        ));
    }

    #[test]
    fn test_property_get_set_roundtrip() {
        let descriptor = follow_descriptor();
        let mut follow = Follow::default();

        descriptor
            .set_property(&mut follow, "target", Box::new(17u64))
            .unwrap();
        assert_eq!(follow.target, 17);

        let value = descriptor.get_property(&follow, "target").unwrap();
        assert_eq!(*value.downcast_ref::<u64>().unwrap(), 17);
    }

    #[test]
    fn test_unknown_property_is_an_error() {
        let descriptor = follow_descriptor();
        let follow = Follow::default();
        let err = descriptor.get_property(&follow, "speed").unwrap_err();
        assert!(matches!(err, DescriptorError::UnknownProperty { .. }));
    }

    #[test]
    fn test_property_value_type_mismatch() {
        let descriptor = follow_descriptor();
        let mut follow = Follow::default();
        // "target" takes a u64; a string must be rejected without mutating.
        let err = descriptor
            .set_property(&mut follow, "target", Box::new("nope".to_string()))
            .unwrap_err();
        assert!(matches!(err, DescriptorError::PropertyTypeMismatch { .. }));
        assert_eq!(follow.target, 0);
    }

    #[test]
    fn test_property_names_in_declaration_order() {
        let descriptor = follow_descriptor();
        let names: Vec<_> = descriptor.property_names().collect();
        assert_eq!(names, vec!["target", "distance"]);
    }

    #[test]
    fn test_registry_register_and_lookup() {
        let mut registry = DescriptorRegistry::new();
        registry.register(follow_descriptor());

        let id = Follow::component_type_id();
        assert!(registry.contains(id));
        let descriptor = registry.get(id).unwrap();
        assert_eq!(descriptor.type_name(), "Follow");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_registry_keys_descriptors_by_component_type() {
        #[derive(Debug, Clone, Default)]
        struct Waypoint {
            _order: u32,
        }
        impl Component for Waypoint {
            fn type_name() -> &'static str {
                "Waypoint"
            }
        }

        let mut registry = DescriptorRegistry::new();
        let follow = registry.register(follow_descriptor());
        let waypoint = registry.register_type::<Waypoint>();

        // Each registration lands under its own domain key, read back
        // through the shared Arc the registry hands out.
        assert_eq!(follow.component_type_id(), Follow::component_type_id());
        assert_eq!(waypoint.component_type_id(), Waypoint::component_type_id());
        assert_ne!(follow.component_type_id(), waypoint.component_type_id());
        assert_eq!(registry.len(), 2);
        assert!(registry.contains(Follow::component_type_id()));
        assert!(registry.contains(Waypoint::component_type_id()));
    }
}
