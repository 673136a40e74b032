//! Retention cascade engine.
//!
//! Periodically sweeps an entity collection and retires every entity whose
//! membership has ended:
//! 1. [`EligibilityEvaluator`] decides from the entity's end period
//! 2. [`Planner`] renders the configured cascade into a [`CascadePlan`]
//! 3. [`TransactionExecutor`] applies the plan atomically
//! 4. [`BatchCoordinator`] pages through the population, isolates per-entity
//!    failures and paces batches
//! 5. [`AuditReporter`] keeps the per-entity outcome log and renders the report
//!
//! All writes for one entity happen in a single transaction, and dry-run
//! mode plans without writing.

mod coordinator;
mod eligibility;
mod error;
mod executor;
mod plan;
mod report;
mod worker;

pub use coordinator::{
    BatchCoordinator, CollectionCursor, CoordinatorOptions, EntitySource, RunStats, SingleEntity,
};
pub use eligibility::EligibilityEvaluator;
pub use error::{PlanError, RetentionError, RunFailure, TemplateError};
pub use executor::{Aborted, Committed, TransactionExecutor};
pub use plan::{
    CascadePlan, CascadeStep, Planner, RenderContext, StepAction, Template, resolve_collections,
};
pub use report::{AuditReporter, Outcome, OutcomeCounts, OutcomeRecord};
pub use worker::{
    RunOptions, create_plan_collections, run_and_log, run_once, start_retention_worker,
    verify_collections,
};
