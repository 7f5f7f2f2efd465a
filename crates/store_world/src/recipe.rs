//! Declarative entity recipes.
//!
//! A [`Recipe`] names one entity and the component values it starts with; a
//! [`RecipeGraph`] bundles sibling recipes that may reference each other by
//! name, in either direction. Materializing a graph runs inside a single
//! transaction: every sibling gets a pending reference up front, reference
//! properties are rewritten through the component descriptors, and the
//! commit makes the whole family live at once.
//!
//! Reference resolution is deliberately lenient. A link naming a sibling
//! that does not exist, or a property the descriptor does not know, is
//! logged and the property is left pointing at the absent sentinel; the
//! rest of the graph still materializes.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, warn};

use store_component::{BoxedValue, Component, ComponentTypeId};

use crate::entity_ref::EntityRef;
use crate::error::{RecipeError, WorldError};
use crate::manager::EntityManager;
use crate::transaction::Transaction;

/// One component value a recipe stamps onto its entity, plus the property
/// links to rewrite with sibling references at materialization time.
struct RecipeComponent {
    type_id: ComponentTypeId,
    type_name: &'static str,
    value: BoxedValue,
    links: Vec<(String, String)>,
}

/// A named template for one entity.
pub struct Recipe {
    name: String,
    components: Vec<RecipeComponent>,
}

impl Recipe {
    /// Start building a recipe for an entity called `name` within its graph.
    #[must_use]
    pub fn builder(name: impl Into<String>) -> RecipeBuilder {
        RecipeBuilder {
            name: name.into(),
            components: Vec::new(),
        }
    }

    /// The sibling name this recipe answers to.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of component values the recipe carries.
    #[must_use]
    pub fn component_count(&self) -> usize {
        self.components.len()
    }
}

impl std::fmt::Debug for Recipe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Recipe")
            .field("name", &self.name)
            .field("components", &self.components.len())
            .finish()
    }
}

/// Builder for [`Recipe`].
pub struct RecipeBuilder {
    name: String,
    components: Vec<RecipeComponent>,
}

impl RecipeBuilder {
    /// Add a component value.
    #[must_use]
    pub fn with_component<C: Component>(self, value: C) -> Self {
        self.with_linked_component(value, &[])
    }

    /// Add a component value whose named properties should be rewritten to
    /// sibling references. Each link pairs a property name on `C` with the
    /// name of a sibling recipe in the same graph.
    #[must_use]
    pub fn with_linked_component<C: Component>(
        mut self,
        value: C,
        links: &[(&str, &str)],
    ) -> Self {
        self.components.push(RecipeComponent {
            type_id: C::component_type_id(),
            type_name: C::type_name(),
            value: Box::new(value),
            links: links
                .iter()
                .map(|(property, sibling)| ((*property).to_owned(), (*sibling).to_owned()))
                .collect(),
        });
        self
    }

    /// Finish the recipe.
    #[must_use]
    pub fn finish(self) -> Recipe {
        Recipe {
            name: self.name,
            components: self.components,
        }
    }
}

/// A named bundle of recipes materialized together.
///
/// The first recipe added is the graph's root: it is the one returned by
/// [`EntityManager::create_from_recipe`].
pub struct RecipeGraph {
    name: String,
    recipes: Vec<Recipe>,
}

impl RecipeGraph {
    /// Start building a graph called `name`.
    #[must_use]
    pub fn builder(name: impl Into<String>) -> RecipeGraphBuilder {
        RecipeGraphBuilder {
            name: name.into(),
            recipes: Vec::new(),
        }
    }

    /// Wrap a single recipe as a graph of one, reusing the recipe's name.
    #[must_use]
    pub fn single(recipe: Recipe) -> Self {
        Self {
            name: recipe.name.clone(),
            recipes: vec![recipe],
        }
    }

    /// The graph's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of entities this graph materializes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.recipes.len()
    }

    /// Returns whether the graph holds no recipes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.recipes.is_empty()
    }

    fn root_name(&self) -> Option<&str> {
        self.recipes.first().map(Recipe::name)
    }
}

impl std::fmt::Debug for RecipeGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecipeGraph")
            .field("name", &self.name)
            .field("recipes", &self.recipes.len())
            .finish()
    }
}

/// Builder for [`RecipeGraph`].
pub struct RecipeGraphBuilder {
    name: String,
    recipes: Vec<Recipe>,
}

impl RecipeGraphBuilder {
    /// Add a recipe. A recipe with the same name as an earlier one replaces
    /// it in place, keeping the earlier position in root ordering.
    #[must_use]
    pub fn with_recipe(mut self, recipe: Recipe) -> Self {
        match self.recipes.iter_mut().find(|r| r.name == recipe.name) {
            Some(existing) => *existing = recipe,
            None => self.recipes.push(recipe),
        }
        self
    }

    /// Finish the graph.
    #[must_use]
    pub fn finish(self) -> RecipeGraph {
        RecipeGraph {
            name: self.name,
            recipes: self.recipes,
        }
    }
}

impl EntityManager {
    /// Materialize a recipe graph and return the root recipe's entity.
    pub fn create_from_recipe(&self, graph: &RecipeGraph) -> Result<EntityRef, RecipeError> {
        let refs = self.create_all_from_recipe(graph)?;
        graph
            .root_name()
            .and_then(|name| refs.get(name).cloned())
            .ok_or_else(|| RecipeError::EmptyGraph(graph.name().to_owned()))
    }

    /// Materialize every recipe in the graph inside one transaction.
    ///
    /// Returns the sibling-name to entity map. Sibling references resolve in
    /// both directions because all entities of the graph are pending in the
    /// same transaction while properties are rewritten.
    pub fn create_all_from_recipe(
        &self,
        graph: &RecipeGraph,
    ) -> Result<HashMap<String, EntityRef>, RecipeError> {
        if graph.is_empty() {
            return Err(RecipeError::EmptyGraph(graph.name().to_owned()));
        }
        let mut tx = self.begin();
        let mut refs = HashMap::with_capacity(graph.len());
        for recipe in &graph.recipes {
            refs.insert(recipe.name.clone(), tx.create_entity());
        }
        match stage_graph(self, graph, &refs, &mut tx) {
            Ok(()) => {
                tx.commit()?;
                debug!(
                    graph = graph.name(),
                    entities = refs.len(),
                    "materialized recipe graph"
                );
                Ok(refs)
            }
            Err(error) => {
                tx.rollback();
                Err(error)
            }
        }
    }
}

/// Stage every recipe's components, rewriting reference links through the
/// registered descriptors.
fn stage_graph(
    manager: &EntityManager,
    graph: &RecipeGraph,
    refs: &HashMap<String, EntityRef>,
    tx: &mut Transaction,
) -> Result<(), RecipeError> {
    for recipe in &graph.recipes {
        let Some(target) = refs.get(&recipe.name) else {
            continue;
        };
        for component in &recipe.components {
            let descriptor = manager
                .descriptor(component.type_id)
                .ok_or(WorldError::UnknownComponentType(component.type_id))?;
            let mut value = descriptor
                .clone_value(component.value.as_ref())
                .map_err(WorldError::from)?;
            for (property, sibling) in &component.links {
                let resolved = match refs.get(sibling) {
                    Some(reference) => reference.clone(),
                    None => {
                        warn!(
                            graph = graph.name(),
                            recipe = recipe.name.as_str(),
                            component = component.type_name,
                            property = property.as_str(),
                            sibling = sibling.as_str(),
                            "dangling recipe reference, using the absent sentinel"
                        );
                        EntityRef::absent()
                    }
                };
                if let Err(error) =
                    descriptor.set_property(value.as_mut(), property, Box::new(resolved))
                {
                    warn!(
                        graph = graph.name(),
                        recipe = recipe.name.as_str(),
                        component = component.type_name,
                        property = property.as_str(),
                        %error,
                        "recipe reference link skipped"
                    );
                }
            }
            tx.write_boxed(target, component.type_id, value)?;
        }
    }
    Ok(())
}

/// A shared, concurrently accessible collection of recipe graphs.
#[derive(Default)]
pub struct RecipeLibrary {
    graphs: DashMap<String, Arc<RecipeGraph>>,
}

impl RecipeLibrary {
    /// Create an empty library.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a graph under its own name, replacing any previous version.
    pub fn register(&self, graph: RecipeGraph) -> Arc<RecipeGraph> {
        let graph = Arc::new(graph);
        debug!(graph = graph.name(), recipes = graph.len(), "registered recipe graph");
        self.graphs
            .insert(graph.name().to_owned(), Arc::clone(&graph));
        graph
    }

    /// Look up a graph by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<RecipeGraph>> {
        self.graphs.get(name).map(|entry| Arc::clone(entry.value()))
    }

    /// Returns whether a graph with this name is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.graphs.contains_key(name)
    }

    /// Number of registered graphs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.graphs.len()
    }

    /// Returns whether the library is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.graphs.is_empty()
    }

    /// Materialize a registered graph, returning its root entity.
    pub fn create(&self, manager: &EntityManager, name: &str) -> Result<EntityRef, RecipeError> {
        let graph = self
            .get(name)
            .ok_or_else(|| RecipeError::GraphNotFound(name.to_owned()))?;
        manager.create_from_recipe(&graph)
    }

    /// Materialize a registered graph, returning the full name map.
    pub fn create_all(
        &self,
        manager: &EntityManager,
        name: &str,
    ) -> Result<HashMap<String, EntityRef>, RecipeError> {
        let graph = self
            .get(name)
            .ok_or_else(|| RecipeError::GraphNotFound(name.to_owned()))?;
        manager.create_all_from_recipe(&graph)
    }
}

impl std::fmt::Debug for RecipeLibrary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecipeLibrary")
            .field("graphs", &self.graphs.len())
            .finish()
    }
}
