use thiserror::Error;

use super::coordinator::RunStats;
use crate::db::DbError;

/// Errors that end a retention run.
///
/// Per-entity failures never surface here; they are recorded as `Failed`
/// outcomes and the run continues.
#[derive(Debug, Error)]
pub enum RetentionError {
    #[error("datastore setup failed: {0}")]
    Setup(#[source] DbError),

    #[error("required collections missing: {}", .0.join(", "))]
    MissingCollections(Vec<String>),

    #[error("invalid plan: {0}")]
    InvalidPlan(String),

    #[error("failed to read entities from '{collection}': {source}")]
    Cursor {
        collection: String,
        #[source]
        source: DbError,
    },

    #[error("entity '{0}' not found")]
    EntityNotFound(String),
}

/// A run that ended on a fatal error, with the counters accumulated before it.
///
/// `stats.incomplete` is always set.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct RunFailure {
    #[source]
    pub error: RetentionError,
    pub stats: RunStats,
}

impl RunFailure {
    pub fn new(error: RetentionError, mut stats: RunStats) -> Self {
        stats.incomplete = true;
        Self { error, stats }
    }
}

/// Errors building one entity's cascade plan.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    #[error("entity field '{0}' is missing")]
    MissingField(String),

    #[error("lookup in '{collection}' failed: {message}")]
    Lookup { collection: String, message: String },
}

/// Malformed template in plan configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    #[error("unknown placeholder {0:?}")]
    UnknownPlaceholder(String),

    #[error("placeholders must make up the whole value: {0:?}")]
    Embedded(String),
}
