//! Error types for the world crate.

use store_component::{ComponentTypeId, DescriptorError, EntityId};
use thiserror::Error;

use crate::pipeline::TransactionStage;

/// Errors from entity and component operations.
#[derive(Debug, Error)]
pub enum WorldError {
    /// The id was never allocated by this manager.
    #[error("{0} not found")]
    EntityNotFound(EntityId),
    /// The entity was deleted (or its id was recycled to a new tenant).
    #[error("{0} is deleted")]
    EntityDeleted(EntityId),
    /// No store is registered for the component type.
    #[error("component type {0} is not registered")]
    UnknownComponentType(ComponentTypeId),
    /// A store for the component type already exists.
    #[error("component type `{0}` is already registered")]
    ComponentAlreadyRegistered(&'static str),
    /// Strict add on a component the entity already has.
    #[error("component `{component}` already present on {entity}")]
    ComponentAlreadyPresent {
        /// The target entity.
        entity: EntityId,
        /// The component type name.
        component: &'static str,
    },
    /// Strict remove of a component the entity does not have.
    #[error("component `{component}` missing on {entity}")]
    ComponentMissing {
        /// The target entity.
        entity: EntityId,
        /// The component type name.
        component: &'static str,
    },
    /// Read of a component that was never staged on a pending entity.
    #[error("component `{0}` is not staged on the pending entity")]
    ComponentNotStaged(&'static str),
    /// Operation through the absent reference.
    #[error("entity reference is absent")]
    AbsentReference,
    /// Operation through a pending reference before its id was assigned.
    #[error("entity reference is still pending id assignment")]
    PendingReference,
    /// A pending reference was used with a transaction other than its own.
    #[error("entity reference belongs to a different transaction or manager")]
    ForeignReference,
    /// Descriptor-mediated access failed.
    #[error(transparent)]
    Descriptor(#[from] DescriptorError),
}

/// Errors raised while running the transaction pipeline.
#[derive(Debug, Error)]
pub enum TransactionError {
    /// Optimistic-concurrency check failed for one touched entity.
    #[error("revision conflict on {entity}: read at revision {expected}, now at {found}")]
    Conflict {
        /// The conflicting entity.
        entity: EntityId,
        /// Revision observed at the transaction's first touch.
        expected: u64,
        /// Authoritative revision at verify time.
        found: u64,
    },
    /// A staged write would not be accepted by its target store.
    #[error("staged write for component type {component} on {entity} has the wrong value type")]
    InvalidStagedWrite {
        /// The target entity.
        entity: EntityId,
        /// The staged component type.
        component: ComponentTypeId,
    },
    /// A world-level failure inside a stage.
    #[error(transparent)]
    World(#[from] WorldError),
    /// An interceptor reported a failure.
    #[error("interceptor `{name}` failed during {stage}: {message}")]
    Interceptor {
        /// The stage the interceptor ran in.
        stage: TransactionStage,
        /// The interceptor's name.
        name: String,
        /// The interceptor's own description of the failure.
        message: String,
    },
}

impl TransactionError {
    /// Convenience constructor for interceptor failures.
    #[must_use]
    pub fn interceptor(
        stage: TransactionStage,
        name: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Interceptor {
            stage,
            name: name.into(),
            message: message.into(),
        }
    }
}

/// Outcome errors of [`Transaction::commit`](crate::Transaction::commit).
#[derive(Debug, Error)]
pub enum CommitError {
    /// The transaction was discarded; no changes were applied.
    #[error("transaction rolled back: {0}")]
    RolledBack(#[source] Box<TransactionError>),
    /// The commit itself succeeded; one or more later stages failed.
    #[error("{0}")]
    PostCommit(PostCommitErrors),
}

impl CommitError {
    /// Returns whether the data mutation was applied despite the error.
    #[must_use]
    pub fn is_committed(&self) -> bool {
        matches!(self, Self::PostCommit(_))
    }
}

/// Failures collected from the stages that run after a successful commit.
///
/// Every post-commit stage runs to completion even when an earlier one
/// failed; the individual errors are reported together here. The data
/// mutation itself is never undone.
#[derive(Debug)]
pub struct PostCommitErrors {
    errors: Vec<(TransactionStage, TransactionError)>,
}

impl PostCommitErrors {
    pub(crate) fn new(errors: Vec<(TransactionStage, TransactionError)>) -> Self {
        Self { errors }
    }

    /// The collected stage failures, in stage order.
    #[must_use]
    pub fn errors(&self) -> &[(TransactionStage, TransactionError)] {
        &self.errors
    }

    /// Consume the aggregate, yielding the collected failures.
    #[must_use]
    pub fn into_errors(self) -> Vec<(TransactionStage, TransactionError)> {
        self.errors
    }

    /// Number of collected failures.
    #[must_use]
    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// Returns whether nothing was collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }
}

impl std::fmt::Display for PostCommitErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} post-commit stage failure(s), commit not undone: ",
            self.errors.len()
        )?;
        for (i, (stage, error)) in self.errors.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "[{stage}] {error}")?;
        }
        Ok(())
    }
}

impl std::error::Error for PostCommitErrors {}

/// Errors from recipe-graph instantiation.
#[derive(Debug, Error)]
pub enum RecipeError {
    /// No graph registered under the requested name.
    #[error("recipe graph `{0}` not found")]
    GraphNotFound(String),
    /// The graph contains no recipes to instantiate.
    #[error("recipe graph `{0}` is empty")]
    EmptyGraph(String),
    /// A world-level failure while staging recipe components.
    #[error(transparent)]
    World(#[from] WorldError),
    /// The materializing transaction failed.
    #[error(transparent)]
    Commit(#[from] CommitError),
}
