//! # store_demo
//!
//! End-to-end walkthrough of the entity store: component registration with
//! property descriptors, recipe materialization with sibling references,
//! transactional mutation with conflict retry, pipeline interceptors, and
//! component-filtered event dispatch.
//!
//! Run with `RUST_LOG=store_demo=info,store_world=debug` to watch the
//! pipeline stages fire.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use store_component::{ComponentDescriptor, PropertyAccessor, StoreLayout};
use store_world::{
    CommitError, Component, EntityId, EntityManager, EntityRef, Event, EventOutcome,
    FnInterceptor, HandlerRegistration, Recipe, RecipeGraph, RecipeLibrary, TransactionError,
    TransactionStage,
};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
struct Position {
    x: f32,
    y: f32,
}

impl Component for Position {
    fn type_name() -> &'static str {
        "Position"
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
struct Health {
    current: f32,
    max: f32,
}

impl Component for Health {
    fn type_name() -> &'static str {
        "Health"
    }
}

#[derive(Debug, Clone, Default)]
struct Shielded;

impl Component for Shielded {
    fn type_name() -> &'static str {
        "Shielded"
    }
}

/// A guard entity watches another entity; the recipe graph fills in the
/// `watching` reference from a sibling.
#[derive(Debug, Clone, Default)]
struct Guard {
    watching: EntityRef,
    radius: f32,
}

impl Component for Guard {
    fn type_name() -> &'static str {
        "Guard"
    }
}

fn guard_descriptor() -> ComponentDescriptor {
    ComponentDescriptor::of::<Guard>()
        .with_property(PropertyAccessor::new::<Guard, EntityRef>(
            "watching",
            |g| g.watching.clone(),
            |g, v| g.watching = v,
        ))
        .with_property(PropertyAccessor::new::<Guard, f32>(
            "radius",
            |g| g.radius,
            |g, v| g.radius = v,
        ))
}

#[derive(Debug, Clone, Copy)]
struct Damaged {
    amount: f32,
}

impl Event for Damaged {
    fn type_name() -> &'static str {
        "Damaged"
    }
}

#[derive(Serialize)]
struct StoreRow {
    component: &'static str,
    layout: String,
    stored: usize,
    scan_cost: usize,
}

/// What an external persistence layer would write out for one entity.
#[derive(Serialize)]
struct EntitySnapshot {
    entity: EntityId,
    position: Position,
    health: Health,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("store_demo=info".parse()?))
        .init();

    info!("store demo starting");

    let manager = EntityManager::builder()
        .with_capacity(32)
        .with_component::<Position>(StoreLayout::Dense)
        .with_component::<Health>(StoreLayout::Dense)
        .with_component::<Shielded>(StoreLayout::Sparse)
        .with_component_described::<Guard>(StoreLayout::Sparse, guard_descriptor())
        .build()?;

    register_handlers(&manager);
    let frozen = install_freeze_window(&manager);

    // -- Recipes: a guard watching a sibling beacon --

    let library = RecipeLibrary::new();
    library.register(sentry_graph());

    let posts = library.create_all(&manager, "sentry pair")?;
    let guard = posts
        .get("guard")
        .cloned()
        .context("recipe output is missing the guard")?;
    let beacon = posts
        .get("beacon")
        .cloned()
        .context("recipe output is missing the beacon")?;

    let watcher = guard
        .get_owned::<Guard>()?
        .context("guard entity lost its Guard component")?;
    info!(
        guard = ?guard.id(),
        beacon = ?beacon.id(),
        watching = ?watcher.watching.id(),
        "sentry pair materialized, forward reference resolved"
    );

    // -- Optimistic concurrency: conflict, then retry with fresh reads --

    let mut first = manager.begin();
    let mut second = manager.begin();

    let mut seen_by_first = Health::default();
    first.read(&guard, &mut seen_by_first)?;
    let mut seen_by_second = Health::default();
    second.read(&guard, &mut seen_by_second)?;

    first.write(
        &guard,
        &Health {
            current: seen_by_first.current - 10.0,
            ..seen_by_first
        },
    )?;
    first.commit()?;
    info!("first transaction committed");

    second.write(
        &guard,
        &Health {
            current: seen_by_second.current - 25.0,
            ..seen_by_second
        },
    )?;
    let Err(CommitError::RolledBack(cause)) = second.commit() else {
        bail!("the second commit should have conflicted");
    };
    info!(%cause, "second transaction rolled back, retrying");

    apply_damage_with_retry(&manager, &guard, 25.0)?;
    let health = guard
        .get_owned::<Health>()?
        .context("guard entity lost its Health component")?;
    info!(current = health.current, max = health.max, "health after retry");

    // -- Interceptors: a PRE_COMMIT gate rejecting commits while frozen --

    frozen.store(true, Ordering::Release);
    let mut blocked = manager.begin();
    blocked.write(&beacon, &Position { x: 9.0, y: 9.0 })?;
    let Err(CommitError::RolledBack(cause)) = blocked.commit() else {
        bail!("the freeze window should have rejected the commit");
    };
    info!(%cause, "commit rejected during the freeze window");
    frozen.store(false, Ordering::Release);

    // -- Events: shielded entities cancel incoming damage --

    guard.add(&Shielded)?;
    let mut tx = manager.begin();
    let outcome = manager.send_event(&guard, &Damaged { amount: 40.0 }, &mut tx, &[]);
    info!(?outcome, "damage event against a shielded guard");
    if tx.is_empty() {
        tx.rollback();
    } else {
        tx.commit()?;
    }

    // -- Queries and the snapshot --

    let patrol = manager.iterate(&[
        Position::component_type_id(),
        Health::component_type_id(),
    ])?;
    info!(matches = patrol.len(), "entities with Position and Health");

    let rows: Vec<StoreRow> = manager
        .stores()
        .into_iter()
        .map(|store| StoreRow {
            component: store.type_name,
            layout: format!("{:?}", store.layout),
            stored: store.len,
            scan_cost: store.iteration_cost,
        })
        .collect();
    println!("{}", serde_json::to_string_pretty(&rows)?);

    let snapshot = EntitySnapshot {
        entity: guard.id().context("guard has no id")?,
        position: guard
            .get_owned::<Position>()?
            .context("guard entity lost its Position component")?,
        health: guard
            .get_owned::<Health>()?
            .context("guard entity lost its Health component")?,
    };
    println!("{}", serde_json::to_string_pretty(&snapshot)?);

    info!(entities = manager.size(), "store demo finished");
    Ok(())
}

fn sentry_graph() -> RecipeGraph {
    RecipeGraph::builder("sentry pair")
        .with_recipe(
            Recipe::builder("guard")
                .with_component(Position { x: 4.0, y: 2.0 })
                .with_component(Health {
                    current: 80.0,
                    max: 100.0,
                })
                .with_linked_component(
                    Guard {
                        watching: EntityRef::absent(),
                        radius: 6.0,
                    },
                    &[("watching", "beacon")],
                )
                .finish(),
        )
        .with_recipe(
            Recipe::builder("beacon")
                .with_component(Position { x: 0.0, y: 0.0 })
                .finish(),
        )
        .finish()
}

fn register_handlers(manager: &EntityManager) {
    let events = manager.events();
    events.register_event::<Damaged>(&[]);

    events.register_handler::<Damaged, _>(
        HandlerRegistration::new("shield block").requires::<Shielded>(),
        |_entity, event, _tx| {
            info!(amount = event.amount, "damage blocked by shield");
            EventOutcome::Cancel
        },
    );
    events.register_handler::<Damaged, _>(
        HandlerRegistration::new("apply damage").requires::<Health>(),
        |entity, event, tx| {
            let mut health = Health::default();
            match tx.read(entity, &mut health) {
                Ok(true) => {}
                Ok(false) | Err(_) => return EventOutcome::Continue,
            }
            health.current -= event.amount;
            if tx.write(entity, &health).is_err() {
                return EventOutcome::Continue;
            }
            EventOutcome::Complete
        },
    );

    events.register_handler::<store_world::EntityCreated, _>(
        HandlerRegistration::new("spawn audit"),
        |entity, _event, _tx| {
            info!(entity = ?entity.id(), "entity created");
            EventOutcome::Continue
        },
    );
}

/// Install a PRE_COMMIT interceptor that rejects every commit while the
/// returned flag is set.
fn install_freeze_window(manager: &EntityManager) -> Arc<AtomicBool> {
    let frozen = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&frozen);
    manager.register_interceptor(
        TransactionStage::PreCommit,
        Arc::new(FnInterceptor::new("freeze window", move |ctx| {
            if flag.load(Ordering::Acquire) {
                return Err(TransactionError::interceptor(
                    ctx.stage(),
                    "freeze window",
                    "the store is frozen for maintenance",
                ));
            }
            Ok(())
        })),
    );
    frozen
}

/// Retry a health deduction until it commits without a conflict.
fn apply_damage_with_retry(
    manager: &EntityManager,
    entity: &EntityRef,
    amount: f32,
) -> Result<()> {
    loop {
        let mut tx = manager.begin();
        let mut health = Health::default();
        if !tx.read(entity, &mut health)? {
            bail!("entity has no Health component");
        }
        health.current -= amount;
        tx.write(entity, &health)?;
        match tx.commit() {
            Ok(_) => return Ok(()),
            Err(CommitError::RolledBack(cause))
                if matches!(cause.as_ref(), TransactionError::Conflict { .. }) =>
            {
                info!(%cause, "commit conflicted, retrying with fresh reads");
            }
            Err(error) => return Err(error.into()),
        }
    }
}
