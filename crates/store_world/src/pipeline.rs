//! Staged commit pipeline with per-stage interceptors.
//!
//! Every commit walks the same fixed stage order:
//!
//! ```text
//! PRE_COMMIT -> OBTAIN_LOCKS -> VERIFY_COMMIT -> PROCESS_COMMIT
//!            -> RELEASE_LOCKS -> UPDATE_INDEXES -> POST_COMMIT -> POST_TRANSACTION
//! ```
//!
//! `OBTAIN_LOCKS` through `PROCESS_COMMIT` form the bracketed region: the
//! per-entity locks of every touched entity are held across it and released
//! before anything else runs, whether the region succeeded or failed. A
//! failure inside the bracket rolls the transaction back
//! (`POST_ROLLBACK -> POST_TRANSACTION`) with nothing applied. Failures in
//! the stages after the apply are collected and reported together once all
//! remaining stages have run; the committed data stays committed.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::{ArcMutexGuard, RawMutex, RwLock};
use tracing::{debug, warn};

use store_component::{ComponentTypeId, EntityId};

use crate::entity_ref::EntityRef;
use crate::error::{CommitError, PostCommitErrors, TransactionError};
use crate::events::{ComponentsChanged, EntityCreated, EntityDeleted, Event};
use crate::manager::EntityManager;
use crate::transaction::{StagedWrite, Transaction};

/// The stages a transaction can pass through, in pipeline order.
///
/// `PostRollback` replaces the post-commit stages when a transaction is
/// rolled back instead of committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionStage {
    PreTransaction,
    PreCommit,
    ObtainLocks,
    VerifyCommit,
    ProcessCommit,
    ReleaseLocks,
    UpdateIndexes,
    PostCommit,
    PostTransaction,
    PostRollback,
}

impl fmt::Display for TransactionStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::PreTransaction => "PRE_TRANSACTION",
            Self::PreCommit => "PRE_COMMIT",
            Self::ObtainLocks => "OBTAIN_LOCKS",
            Self::VerifyCommit => "VERIFY_COMMIT",
            Self::ProcessCommit => "PROCESS_COMMIT",
            Self::ReleaseLocks => "RELEASE_LOCKS",
            Self::UpdateIndexes => "UPDATE_INDEXES",
            Self::PostCommit => "POST_COMMIT",
            Self::PostTransaction => "POST_TRANSACTION",
            Self::PostRollback => "POST_ROLLBACK",
        };
        f.write_str(name)
    }
}

/// One entity's contribution to a committed transaction.
#[derive(Debug, Clone)]
pub struct EntityChange {
    /// The affected entity.
    pub entity: EntityRef,
    /// Component types written or removed, ascending by type id.
    pub components: Vec<ComponentTypeId>,
}

/// Everything a committed transaction did, grouped by kind of change.
#[derive(Debug, Clone, Default)]
pub struct CommitEffects {
    /// Entities materialized by this commit.
    pub created: Vec<EntityChange>,
    /// Existing entities whose components were written or removed.
    pub updated: Vec<EntityChange>,
    /// Entities deleted by this commit.
    pub deleted: Vec<EntityChange>,
}

impl CommitEffects {
    /// Returns whether the commit changed anything at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }
}

/// What an interceptor gets to see about the stage it runs in.
pub struct StageContext<'a> {
    stage: TransactionStage,
    transaction: &'a Transaction,
    effects: Option<&'a CommitEffects>,
    error: Option<&'a TransactionError>,
}

impl<'a> StageContext<'a> {
    /// The stage currently executing.
    #[must_use]
    pub fn stage(&self) -> TransactionStage {
        self.stage
    }

    /// The transaction passing through the pipeline.
    #[must_use]
    pub fn transaction(&self) -> &Transaction {
        self.transaction
    }

    /// The manager the transaction runs against.
    #[must_use]
    pub fn manager(&self) -> &EntityManager {
        self.transaction.manager()
    }

    /// Id of the transaction passing through the pipeline.
    #[must_use]
    pub fn transaction_id(&self) -> u64 {
        self.transaction.id()
    }

    /// The applied changes; present from `RELEASE_LOCKS` onward.
    #[must_use]
    pub fn effects(&self) -> Option<&CommitEffects> {
        self.effects
    }

    /// The failure that caused a rollback; present during `POST_ROLLBACK`
    /// and the `POST_TRANSACTION` that follows it.
    #[must_use]
    pub fn error(&self) -> Option<&TransactionError> {
        self.error
    }
}

/// A pluggable stage observer.
pub trait TransactionInterceptor: Send + Sync {
    /// Name used in logs and aggregated error reports.
    fn name(&self) -> &str;

    /// Called when the subscribed stage executes.
    fn invoke(&self, ctx: &StageContext<'_>) -> Result<(), TransactionError>;
}

/// Adapter turning a closure into a named interceptor.
pub struct FnInterceptor<F> {
    name: String,
    callback: F,
}

impl<F> FnInterceptor<F>
where
    F: Fn(&StageContext<'_>) -> Result<(), TransactionError> + Send + Sync,
{
    pub fn new(name: impl Into<String>, callback: F) -> Self {
        Self {
            name: name.into(),
            callback,
        }
    }
}

impl<F> TransactionInterceptor for FnInterceptor<F>
where
    F: Fn(&StageContext<'_>) -> Result<(), TransactionError> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn invoke(&self, ctx: &StageContext<'_>) -> Result<(), TransactionError> {
        (self.callback)(ctx)
    }
}

/// Per-stage interceptor lists.
pub(crate) struct PipelineTable {
    stages: RwLock<HashMap<TransactionStage, Vec<Arc<dyn TransactionInterceptor>>>>,
}

impl PipelineTable {
    pub(crate) fn new() -> Self {
        Self {
            stages: RwLock::new(HashMap::new()),
        }
    }

    pub(crate) fn register(
        &self,
        stage: TransactionStage,
        interceptor: Arc<dyn TransactionInterceptor>,
    ) {
        debug!(%stage, interceptor = interceptor.name(), "registered interceptor");
        self.stages.write().entry(stage).or_default().push(interceptor);
    }

    /// Clone out the interceptor list so invocation happens without the
    /// registry lock held.
    fn snapshot(&self, stage: TransactionStage) -> Vec<Arc<dyn TransactionInterceptor>> {
        self.stages
            .read()
            .get(&stage)
            .cloned()
            .unwrap_or_default()
    }
}

pub(crate) fn run_pre_transaction(tx: &Transaction) {
    run_stage_logged(tx.manager(), TransactionStage::PreTransaction, tx, None);
}

pub(crate) fn commit(mut tx: Transaction) -> Result<CommitEffects, CommitError> {
    let manager = tx.manager().clone();
    debug!(
        transaction = tx.id(),
        touched = tx.touched.len(),
        pending = tx.pending.len(),
        "committing transaction"
    );

    if let Err(error) = run_stage_strict(&manager, TransactionStage::PreCommit, &tx) {
        return Err(roll_back_failed(tx, error));
    }

    let mut held: Vec<ArcMutexGuard<RawMutex, ()>> = Vec::new();
    let bracket = bracketed_region(&manager, &mut tx, &mut held);
    // RELEASE_LOCKS: the guards drop before anything else runs, whether the
    // bracket succeeded or not.
    held.clear();

    let effects = match bracket {
        Ok(effects) => effects,
        Err(error) => {
            // The stage still fires after a failed bracket, so interceptors
            // that acquired at OBTAIN_LOCKS get their paired release.
            run_stage_logged(&manager, TransactionStage::ReleaseLocks, &tx, Some(&error));
            return Err(roll_back_failed(tx, error));
        }
    };

    let mut post_errors: Vec<(TransactionStage, TransactionError)> = Vec::new();
    run_stage_collect(&manager, TransactionStage::ReleaseLocks, &tx, &effects, &mut post_errors);
    run_stage_collect(&manager, TransactionStage::UpdateIndexes, &tx, &effects, &mut post_errors);

    if !tx.quiet {
        dispatch_lifecycle(&manager, &effects, &mut post_errors);
    }
    run_stage_collect(&manager, TransactionStage::PostCommit, &tx, &effects, &mut post_errors);
    run_stage_collect(&manager, TransactionStage::PostTransaction, &tx, &effects, &mut post_errors);

    debug!(
        transaction = tx.id(),
        created = effects.created.len(),
        updated = effects.updated.len(),
        deleted = effects.deleted.len(),
        "transaction committed"
    );

    if post_errors.is_empty() {
        Ok(effects)
    } else {
        warn!(
            transaction = tx.id(),
            failures = post_errors.len(),
            "post-commit stage failures; commit stands"
        );
        Err(CommitError::PostCommit(PostCommitErrors::new(post_errors)))
    }
}

pub(crate) fn roll_back(tx: Transaction, cause: Option<&TransactionError>) {
    let manager = tx.manager().clone();
    match cause {
        Some(error) => warn!(transaction = tx.id(), %error, "transaction rolled back"),
        None => debug!(transaction = tx.id(), "transaction rolled back"),
    }
    run_stage_logged(&manager, TransactionStage::PostRollback, &tx, cause);
    run_stage_logged(&manager, TransactionStage::PostTransaction, &tx, cause);
}

fn roll_back_failed(tx: Transaction, error: TransactionError) -> CommitError {
    roll_back(tx, Some(&error));
    CommitError::RolledBack(Box::new(error))
}

/// The lock-holding half of the pipeline. The caller owns the guard vector
/// so the locks outlive this function only as long as it decides.
fn bracketed_region(
    manager: &EntityManager,
    tx: &mut Transaction,
    held: &mut Vec<ArcMutexGuard<RawMutex, ()>>,
) -> Result<CommitEffects, TransactionError> {
    // OBTAIN_LOCKS: ascending id order keeps concurrent commits from
    // deadlocking each other.
    let mut ids: Vec<EntityId> = tx.touched.keys().copied().collect();
    ids.sort_unstable();
    for id in &ids {
        if let Some(touched) = tx.touched.get(id) {
            held.push(touched.lock.lock_arc());
        }
    }
    run_stage_strict(manager, TransactionStage::ObtainLocks, tx)?;

    verify(manager, tx)?;
    run_stage_strict(manager, TransactionStage::VerifyCommit, tx)?;

    // PROCESS_COMMIT: interceptors first, so a failure here still aborts
    // with nothing written; the apply itself cannot fail.
    run_stage_strict(manager, TransactionStage::ProcessCommit, tx)?;
    Ok(apply(manager, tx))
}

/// VERIFY_COMMIT: every touched entity must still be at the revision the
/// transaction first observed, and staged values must fit their stores.
fn verify(manager: &EntityManager, tx: &Transaction) -> Result<(), TransactionError> {
    let mut ids: Vec<EntityId> = tx.touched.keys().copied().collect();
    ids.sort_unstable();
    for id in ids {
        let Some(touched) = tx.touched.get(&id) else {
            continue;
        };
        let found = manager.current_revision(id)?;
        if found != touched.revision_at_first_touch {
            return Err(TransactionError::Conflict {
                entity: id,
                expected: touched.revision_at_first_touch,
                found,
            });
        }
        for (type_id, write) in &touched.writes {
            if let StagedWrite::Put(value) = write {
                if !manager.store_accepts(*type_id, value.as_ref())? {
                    return Err(TransactionError::InvalidStagedWrite {
                        entity: id,
                        component: *type_id,
                    });
                }
            }
        }
    }
    Ok(())
}

/// PROCESS_COMMIT: materialize pending entities, then apply writes and
/// deletes to existing ones in ascending id order.
fn apply(manager: &EntityManager, tx: &mut Transaction) -> CommitEffects {
    let mut effects = CommitEffects::default();

    for pending in &mut tx.pending {
        if pending.cancelled {
            continue;
        }
        let (id, generation) = manager.allocate();
        let mut writes: Vec<_> = std::mem::take(&mut pending.writes).into_iter().collect();
        writes.sort_by_key(|(type_id, _)| *type_id);

        let mut components = Vec::with_capacity(writes.len());
        for (type_id, value) in writes {
            match manager.apply_boxed_write(id, type_id, value.as_ref()) {
                Ok(_) => components.push(type_id),
                Err(error) => warn!(
                    transaction = tx.id,
                    entity = id.0,
                    component = %type_id,
                    %error,
                    "staged write skipped"
                ),
            }
        }
        // Publishing the assignment is what activates every clone of the
        // pending reference, so it happens after the components are in.
        if pending.slot.assigned.set((id, generation)).is_err() {
            warn!(transaction = tx.id, entity = id.0, "pending assignment already published");
        }
        effects.created.push(EntityChange {
            entity: EntityRef::live(manager.clone(), id, generation),
            components,
        });
    }

    let mut ids: Vec<EntityId> = tx.touched.keys().copied().collect();
    ids.sort_unstable();
    for id in ids {
        let Some(touched) = tx.touched.get_mut(&id) else {
            continue;
        };
        if touched.deleted {
            match manager.delete_locked(id, touched.generation) {
                Ok(removed) => effects.deleted.push(EntityChange {
                    entity: EntityRef::live(manager.clone(), id, touched.generation),
                    components: removed,
                }),
                Err(error) => warn!(
                    transaction = tx.id,
                    entity = id.0,
                    %error,
                    "staged delete skipped"
                ),
            }
            continue;
        }
        if touched.writes.is_empty() {
            continue;
        }

        let mut writes: Vec<_> = std::mem::take(&mut touched.writes).into_iter().collect();
        writes.sort_by_key(|(type_id, _)| *type_id);

        let mut components = Vec::with_capacity(writes.len());
        for (type_id, write) in writes {
            let applied = match write {
                StagedWrite::Put(value) => manager.apply_boxed_write(id, type_id, value.as_ref()),
                StagedWrite::Remove => manager.discard_component_id(id, type_id),
            };
            match applied {
                Ok(_) => components.push(type_id),
                Err(error) => warn!(
                    transaction = tx.id,
                    entity = id.0,
                    component = %type_id,
                    %error,
                    "staged write skipped"
                ),
            }
        }
        manager.bump_revision(id);
        effects.updated.push(EntityChange {
            entity: EntityRef::live(manager.clone(), id, touched.generation),
            components,
        });
    }

    effects
}

/// Built-in POST_COMMIT action: tell lifecycle event handlers what changed.
///
/// Handlers stage their reactions into one shared follow-up transaction,
/// which commits quietly so handler mutations do not fan out into another
/// round of dispatch.
fn dispatch_lifecycle(
    manager: &EntityManager,
    effects: &CommitEffects,
    post_errors: &mut Vec<(TransactionStage, TransactionError)>,
) {
    let events = manager.events();
    let listened = (!effects.created.is_empty()
        && events.has_handlers(EntityCreated::event_type_id()))
        || (!effects.updated.is_empty()
            && events.has_handlers(ComponentsChanged::event_type_id()))
        || (!effects.deleted.is_empty() && events.has_handlers(EntityDeleted::event_type_id()));
    if !listened {
        return;
    }
    let mut follow_up = Transaction::begin(manager.clone(), true);
    for change in &effects.created {
        let _ = manager.send_event(&change.entity, &EntityCreated, &mut follow_up, &change.components);
    }
    for change in &effects.updated {
        let _ = manager.send_event(&change.entity, &ComponentsChanged, &mut follow_up, &change.components);
    }
    for change in &effects.deleted {
        let _ = manager.send_event(&change.entity, &EntityDeleted, &mut follow_up, &change.components);
    }

    if follow_up.is_empty() {
        follow_up.discard();
        return;
    }
    if let Err(error) = follow_up.commit() {
        match error {
            CommitError::RolledBack(inner) => {
                post_errors.push((TransactionStage::PostCommit, *inner));
            }
            CommitError::PostCommit(aggregate) => {
                post_errors.extend(aggregate.into_errors());
            }
        }
    }
}

fn run_stage_strict(
    manager: &EntityManager,
    stage: TransactionStage,
    tx: &Transaction,
) -> Result<(), TransactionError> {
    for interceptor in manager.pipeline().snapshot(stage) {
        let ctx = StageContext {
            stage,
            transaction: tx,
            effects: None,
            error: None,
        };
        if let Err(error) = interceptor.invoke(&ctx) {
            warn!(
                transaction = tx.id,
                %stage,
                interceptor = interceptor.name(),
                %error,
                "interceptor failed"
            );
            return Err(error);
        }
    }
    Ok(())
}

fn run_stage_collect(
    manager: &EntityManager,
    stage: TransactionStage,
    tx: &Transaction,
    effects: &CommitEffects,
    errors: &mut Vec<(TransactionStage, TransactionError)>,
) {
    for interceptor in manager.pipeline().snapshot(stage) {
        let ctx = StageContext {
            stage,
            transaction: tx,
            effects: Some(effects),
            error: None,
        };
        if let Err(error) = interceptor.invoke(&ctx) {
            warn!(
                transaction = tx.id,
                %stage,
                interceptor = interceptor.name(),
                %error,
                "post-commit interceptor failed"
            );
            errors.push((stage, error));
        }
    }
}

fn run_stage_logged(
    manager: &EntityManager,
    stage: TransactionStage,
    tx: &Transaction,
    error: Option<&TransactionError>,
) {
    for interceptor in manager.pipeline().snapshot(stage) {
        let ctx = StageContext {
            stage,
            transaction: tx,
            effects: None,
            error,
        };
        if let Err(stage_error) = interceptor.invoke(&ctx) {
            warn!(
                transaction = tx.id,
                %stage,
                interceptor = interceptor.name(),
                error = %stage_error,
                "interceptor failed outside commit"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::WorldError;
    use parking_lot::Mutex;
    use store_component::{Component, StoreLayout};

    #[derive(Debug, Clone, Default, PartialEq)]
    struct Marker {
        value: i64,
    }

    impl Component for Marker {
        fn type_name() -> &'static str {
            "Marker"
        }
    }

    fn test_manager() -> EntityManager {
        EntityManager::builder()
            .with_component::<Marker>(StoreLayout::Dense)
            .build()
            .unwrap()
    }

    fn recording_interceptor(
        name: &str,
        log: Arc<Mutex<Vec<String>>>,
    ) -> Arc<dyn TransactionInterceptor> {
        let tag = name.to_owned();
        Arc::new(FnInterceptor::new(name, move |_ctx: &StageContext<'_>| {
            log.lock().push(tag.clone());
            Ok(())
        }))
    }

    fn failing_interceptor(name: &str, stage: TransactionStage) -> Arc<dyn TransactionInterceptor> {
        let tag = name.to_owned();
        Arc::new(FnInterceptor::new(name, move |_ctx: &StageContext<'_>| {
            Err(TransactionError::interceptor(stage, &tag, "refused"))
        }))
    }

    #[test]
    fn test_stage_names_are_shout_case() {
        assert_eq!(TransactionStage::PreTransaction.to_string(), "PRE_TRANSACTION");
        assert_eq!(TransactionStage::ObtainLocks.to_string(), "OBTAIN_LOCKS");
        assert_eq!(TransactionStage::VerifyCommit.to_string(), "VERIFY_COMMIT");
        assert_eq!(TransactionStage::ProcessCommit.to_string(), "PROCESS_COMMIT");
        assert_eq!(TransactionStage::UpdateIndexes.to_string(), "UPDATE_INDEXES");
        assert_eq!(TransactionStage::PostRollback.to_string(), "POST_ROLLBACK");
    }

    #[test]
    fn test_interceptors_run_in_registration_order_through_all_stages() {
        let manager = test_manager();
        let log = Arc::new(Mutex::new(Vec::new()));
        for stage in [
            TransactionStage::PreTransaction,
            TransactionStage::PreCommit,
            TransactionStage::ObtainLocks,
            TransactionStage::VerifyCommit,
            TransactionStage::ProcessCommit,
            TransactionStage::ReleaseLocks,
            TransactionStage::UpdateIndexes,
            TransactionStage::PostCommit,
            TransactionStage::PostTransaction,
        ] {
            manager.register_interceptor(
                stage,
                recording_interceptor(&stage.to_string(), Arc::clone(&log)),
            );
        }
        manager.register_interceptor(
            TransactionStage::PreCommit,
            recording_interceptor("PRE_COMMIT second", Arc::clone(&log)),
        );

        let e = manager.create_entity();
        let mut tx = manager.begin();
        tx.write(&e, &Marker { value: 1 }).unwrap();
        tx.commit().unwrap();

        assert_eq!(
            *log.lock(),
            vec![
                "PRE_TRANSACTION",
                "PRE_COMMIT",
                "PRE_COMMIT second",
                "OBTAIN_LOCKS",
                "VERIFY_COMMIT",
                "PROCESS_COMMIT",
                "RELEASE_LOCKS",
                "UPDATE_INDEXES",
                "POST_COMMIT",
                "POST_TRANSACTION",
            ]
        );
    }

    #[test]
    fn test_pre_commit_failure_rolls_back_with_nothing_applied() {
        let manager = test_manager();
        manager.register_interceptor(
            TransactionStage::PreCommit,
            failing_interceptor("gate", TransactionStage::PreCommit),
        );
        let rollback_seen = Arc::new(Mutex::new(Vec::new()));
        {
            let rollback_seen = Arc::clone(&rollback_seen);
            manager.register_interceptor(
                TransactionStage::PostRollback,
                Arc::new(FnInterceptor::new("observer", move |ctx: &StageContext<'_>| {
                    rollback_seen.lock().push(ctx.error().is_some());
                    Ok(())
                })),
            );
        }

        let e = manager.create_entity();
        let mut tx = manager.begin();
        tx.write(&e, &Marker { value: 7 }).unwrap();
        let err = tx.commit().unwrap_err();

        assert!(matches!(err, CommitError::RolledBack(_)));
        assert!(!err.is_committed());
        assert_eq!(e.get_owned::<Marker>().unwrap(), None);
        assert_eq!(*rollback_seen.lock(), vec![true]);
    }

    #[test]
    fn test_process_commit_interceptor_aborts_before_apply() {
        let manager = test_manager();
        manager.register_interceptor(
            TransactionStage::ProcessCommit,
            failing_interceptor("veto", TransactionStage::ProcessCommit),
        );

        let e = manager.create_entity();
        let mut tx = manager.begin();
        tx.write(&e, &Marker { value: 3 }).unwrap();
        let created = tx.create_entity();
        let err = tx.commit().unwrap_err();

        assert!(matches!(err, CommitError::RolledBack(_)));
        assert_eq!(e.get_owned::<Marker>().unwrap(), None);
        assert!(created.is_pending());
        assert_eq!(manager.size(), 1);
    }

    #[test]
    fn test_post_commit_failures_aggregate_and_commit_stands() {
        let manager = test_manager();
        manager.register_interceptor(
            TransactionStage::UpdateIndexes,
            failing_interceptor("indexer", TransactionStage::UpdateIndexes),
        );
        manager.register_interceptor(
            TransactionStage::PostCommit,
            failing_interceptor("notifier", TransactionStage::PostCommit),
        );
        let log = Arc::new(Mutex::new(Vec::new()));
        manager.register_interceptor(
            TransactionStage::PostTransaction,
            recording_interceptor("cleanup", Arc::clone(&log)),
        );

        let e = manager.create_entity();
        let mut tx = manager.begin();
        tx.write(&e, &Marker { value: 9 }).unwrap();
        let err = tx.commit().unwrap_err();

        match err {
            CommitError::PostCommit(aggregate) => {
                assert!(err_stages(&aggregate)
                    .eq([TransactionStage::UpdateIndexes, TransactionStage::PostCommit]));
            }
            other => panic!("expected aggregated post-commit error, got {other:?}"),
        }
        // The data mutation is not undone, and later stages still ran.
        assert_eq!(e.get_owned::<Marker>().unwrap(), Some(Marker { value: 9 }));
        assert_eq!(*log.lock(), vec!["cleanup"]);
    }

    fn err_stages(aggregate: &PostCommitErrors) -> impl Iterator<Item = TransactionStage> + '_ {
        aggregate.errors().iter().map(|(stage, _)| *stage)
    }

    #[test]
    fn test_effects_visible_from_release_locks_onward() {
        let manager = test_manager();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for stage in [TransactionStage::VerifyCommit, TransactionStage::ReleaseLocks] {
            let seen = Arc::clone(&seen);
            manager.register_interceptor(
                stage,
                Arc::new(FnInterceptor::new("effects probe", move |ctx: &StageContext<'_>| {
                    seen.lock()
                        .push((ctx.stage(), ctx.effects().map(|e| e.updated.len())));
                    Ok(())
                })),
            );
        }

        let e = manager.create_entity();
        let mut tx = manager.begin();
        tx.write(&e, &Marker { value: 5 }).unwrap();
        tx.commit().unwrap();

        assert_eq!(
            *seen.lock(),
            vec![
                (TransactionStage::VerifyCommit, None),
                (TransactionStage::ReleaseLocks, Some(1)),
            ]
        );
    }

    #[test]
    fn test_commit_effects_classify_changes() {
        let manager = test_manager();
        let keep = manager.create_entity();
        let doomed = manager.create_entity();
        doomed.set(&Marker { value: 1 }).unwrap();
        let doomed_ref = manager.entity_ref(doomed.id().unwrap()).unwrap();

        let mut tx = manager.begin();
        tx.write(&keep, &Marker { value: 2 }).unwrap();
        tx.delete(&doomed_ref).unwrap();
        let created = tx.create_entity();
        tx.write(&created, &Marker { value: 3 }).unwrap();
        let effects = tx.commit().unwrap();

        assert_eq!(effects.created.len(), 1);
        assert_eq!(effects.created[0].components, vec![Marker::component_type_id()]);
        assert_eq!(effects.created[0].entity, created);

        assert_eq!(effects.updated.len(), 1);
        assert_eq!(effects.updated[0].entity, keep);

        assert_eq!(effects.deleted.len(), 1);
        assert_eq!(effects.deleted[0].components, vec![Marker::component_type_id()]);
    }

    #[test]
    fn test_locks_release_after_failed_commit() {
        let manager = test_manager();
        let e = manager.create_entity();
        e.set(&Marker { value: 1 }).unwrap();

        let mut loser = manager.begin();
        let mut out = Marker::default();
        loser.read(&e, &mut out).unwrap();
        loser.write(&e, &Marker { value: 2 }).unwrap();
        e.set(&Marker { value: 10 }).unwrap();
        assert!(loser.commit().is_err());

        // Direct access still works, so the failed commit let go of the
        // entity lock.
        e.set(&Marker { value: 11 }).unwrap();
        assert_eq!(e.get_owned::<Marker>().unwrap(), Some(Marker { value: 11 }));
    }

    #[test]
    fn test_release_locks_stage_runs_after_failed_bracket() {
        let manager = test_manager();
        let log = Arc::new(Mutex::new(Vec::new()));
        for stage in [
            TransactionStage::ObtainLocks,
            TransactionStage::ReleaseLocks,
            TransactionStage::PostRollback,
            TransactionStage::PostTransaction,
        ] {
            manager.register_interceptor(
                stage,
                recording_interceptor(&stage.to_string(), Arc::clone(&log)),
            );
        }

        let e = manager.create_entity();
        e.set(&Marker { value: 1 }).unwrap();

        let mut loser = manager.begin();
        let mut out = Marker::default();
        loser.read(&e, &mut out).unwrap();
        loser.write(&e, &Marker { value: 2 }).unwrap();
        // The direct write bumps the revision, so the bracket fails at
        // verification, after its locks were taken.
        e.set(&Marker { value: 10 }).unwrap();
        let err = loser.commit().unwrap_err();

        let CommitError::RolledBack(cause) = err else {
            panic!("expected a rollback error");
        };
        assert!(matches!(*cause, TransactionError::Conflict { .. }));
        // An interceptor that paired an acquisition at OBTAIN_LOCKS with a
        // release at RELEASE_LOCKS sees both, then the rollback stages.
        assert_eq!(
            *log.lock(),
            vec!["OBTAIN_LOCKS", "RELEASE_LOCKS", "POST_ROLLBACK", "POST_TRANSACTION"]
        );
    }

    #[test]
    fn test_release_locks_sees_the_failure_cause() {
        let manager = test_manager();
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = Arc::clone(&seen);
            manager.register_interceptor(
                TransactionStage::ReleaseLocks,
                Arc::new(FnInterceptor::new("release audit", move |ctx: &StageContext<'_>| {
                    seen.lock()
                        .push((ctx.error().is_some(), ctx.effects().is_some()));
                    Ok(())
                })),
            );
        }

        let e = manager.create_entity();
        e.set(&Marker { value: 1 }).unwrap();

        // Failed commit: the stage runs with the cause and no effects.
        let mut loser = manager.begin();
        let mut out = Marker::default();
        loser.read(&e, &mut out).unwrap();
        loser.write(&e, &Marker { value: 2 }).unwrap();
        e.set(&Marker { value: 3 }).unwrap();
        assert!(loser.commit().is_err());

        // Successful commit: effects and no error.
        let mut winner = manager.begin();
        winner.write(&e, &Marker { value: 4 }).unwrap();
        winner.commit().unwrap();

        assert_eq!(*seen.lock(), vec![(true, false), (false, true)]);
    }

    #[test]
    fn test_rollback_runs_post_rollback_then_post_transaction() {
        let manager = test_manager();
        let log = Arc::new(Mutex::new(Vec::new()));
        manager.register_interceptor(
            TransactionStage::PostRollback,
            recording_interceptor("rollback", Arc::clone(&log)),
        );
        manager.register_interceptor(
            TransactionStage::PostTransaction,
            recording_interceptor("after", Arc::clone(&log)),
        );

        let e = manager.create_entity();
        let mut tx = manager.begin();
        tx.write(&e, &Marker { value: 4 }).unwrap();
        tx.rollback();

        assert_eq!(*log.lock(), vec!["rollback", "after"]);
        assert_eq!(e.get_owned::<Marker>().unwrap(), None);
    }

    #[test]
    fn test_interceptor_error_helper_formats_stage_and_name() {
        let err = TransactionError::interceptor(TransactionStage::VerifyCommit, "audit", "denied");
        let text = err.to_string();
        assert!(text.contains("VERIFY_COMMIT"));
        assert!(text.contains("audit"));
        assert!(text.contains("denied"));
    }

    #[test]
    fn test_conflict_error_carries_world_error_conversions() {
        let world: TransactionError = WorldError::EntityNotFound(EntityId(3)).into();
        assert!(matches!(world, TransactionError::World(_)));
    }
}
