//! Retention job driver.
//!
//! Wires configuration, the datastore and the engine components together for
//! one run, and provides the scheduled loop used by `schedule` mode.

use std::{collections::BTreeMap, sync::Arc};

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use super::{
    coordinator::{
        BatchCoordinator, CollectionCursor, CoordinatorOptions, EntitySource, RunStats,
        SingleEntity,
    },
    eligibility::EligibilityEvaluator,
    error::{RetentionError, RunFailure},
    executor::TransactionExecutor,
    plan::{Planner, resolve_collections},
    report::AuditReporter,
};
use crate::{
    config::{PlanDefinition, RetentionConfig},
    db::DocumentStore,
    models::{Document, Filter},
    observability::metrics,
};

/// Per-invocation run settings.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Evaluation time; defaults to the wall clock at run start.
    pub now: Option<DateTime<Utc>>,
    /// Process only the entity with this identifier.
    pub entity: Option<String>,
    /// Fired to stop the run before its next entity.
    pub cancel: CancellationToken,
}

/// Confirm the datastore is reachable and every collection the plan
/// references exists, returning the physical name chosen for each.
pub async fn verify_collections(
    store: &dyn DocumentStore,
    plan: &PlanDefinition,
) -> Result<BTreeMap<String, String>, RetentionError> {
    let existing = store
        .list_collections()
        .await
        .map_err(RetentionError::Setup)?;
    let resolved = resolve_collections(plan, &existing)?;

    for (reference, physical) in &resolved {
        if reference != physical {
            tracing::info!(alias = %reference, collection = %physical, "Resolved collection alias");
        }
    }
    Ok(resolved)
}

/// Create every collection the plan references that is not present yet,
/// using the first configured alternative for each.
pub async fn create_plan_collections(
    store: &dyn DocumentStore,
    plan: &PlanDefinition,
) -> Result<Vec<String>, RetentionError> {
    let existing = store
        .list_collections()
        .await
        .map_err(RetentionError::Setup)?;

    let mut created = Vec::new();
    for reference in plan.referenced_collections() {
        let alternatives = plan.alternatives(&reference);
        if alternatives.iter().any(|name| existing.contains(name)) {
            continue;
        }
        if let Some(first) = alternatives.first() {
            store
                .create_collection(first)
                .await
                .map_err(RetentionError::Setup)?;
            created.push(first.clone());
        }
    }
    Ok(created)
}

/// Run the plan once over the whole population (or a single entity) and
/// write the report.
///
/// The report is written on every path, including fatal errors; a failure
/// to write it is logged and does not change the result.
pub async fn run_once(
    store: Arc<dyn DocumentStore>,
    config: &RetentionConfig,
    plan: &PlanDefinition,
    options: RunOptions,
) -> Result<RunStats, RunFailure> {
    let now = options.now.unwrap_or_else(Utc::now);
    let mut reporter = AuditReporter::new(plan.name.clone(), now);

    let run_id = Uuid::new_v4();
    let span = tracing::info_span!("retention_run", %run_id, plan = %plan.name);
    let result = execute_run(store, config, plan, &options, &mut reporter, now)
        .instrument(span)
        .await;

    if result.is_err() {
        reporter.mark_incomplete();
        metrics::record_run_error(&plan.name);
    }
    match reporter.write_to(&config.report_path).await {
        Ok(()) => tracing::info!(path = %config.report_path.display(), "Report written"),
        Err(e) => tracing::error!(
            path = %config.report_path.display(),
            error = %e,
            "Failed to write retention report"
        ),
    }

    result
}

async fn execute_run(
    store: Arc<dyn DocumentStore>,
    config: &RetentionConfig,
    plan: &PlanDefinition,
    options: &RunOptions,
    reporter: &mut AuditReporter,
    now: DateTime<Utc>,
) -> Result<RunStats, RunFailure> {
    let fatal = |error: RetentionError| RunFailure::new(error, RunStats::default());

    let collections = verify_collections(store.as_ref(), plan)
        .await
        .map_err(fatal)?;
    let planner = Planner::new(plan, &collections, Arc::clone(&store)).map_err(fatal)?;

    let mut source: Box<dyn EntitySource> = match &options.entity {
        Some(id) => {
            let doc = find_entity(store.as_ref(), &planner, id)
                .await
                .map_err(fatal)?;
            Box::new(SingleEntity::new(planner.collection(), doc))
        }
        None => Box::new(CollectionCursor::new(
            Arc::clone(&store),
            planner.collection(),
        )),
    };

    let safety = &config.safety;
    tracing::info!(
        plan = %plan.name,
        collection = %planner.collection(),
        batch_size = safety.batch_size,
        batch_delay_ms = safety.batch_delay_ms,
        dry_run = safety.dry_run,
        "Starting retention run{}",
        if safety.dry_run { " (DRY RUN)" } else { "" }
    );

    let coordinator = BatchCoordinator::new(
        EligibilityEvaluator::new(&config.eligibility),
        planner,
        TransactionExecutor::new(store),
        CoordinatorOptions::from(safety),
        options.cancel.clone(),
    );
    coordinator.run(source.as_mut(), reporter, now).await
}

/// Look up one entity by identifier, trying the string form first and then
/// numeric and ObjectId encodings.
async fn find_entity(
    store: &dyn DocumentStore,
    planner: &Planner,
    id: &str,
) -> Result<Document, RetentionError> {
    let mut candidates = vec![serde_json::Value::String(id.to_string())];
    if let Ok(n) = id.parse::<i64>() {
        candidates.push(n.into());
    }
    candidates.push(serde_json::json!({ "$oid": id }));

    for candidate in candidates {
        let filter = Filter::new().eq(planner.id_field(), candidate);
        if let Some(doc) = store
            .find_one(planner.collection(), &filter)
            .await
            .map_err(RetentionError::Setup)?
        {
            return Ok(doc);
        }
    }
    Err(RetentionError::EntityNotFound(id.to_string()))
}

fn log_run_result(result: &Result<RunStats, RunFailure>, dry_run: bool) {
    let dry_run_msg = if dry_run { " (DRY RUN)" } else { "" };
    match result {
        Ok(stats) => tracing::info!(
            processed = stats.processed,
            retired = stats.retired,
            skipped = stats.skipped,
            failed = stats.failed,
            batches = stats.batches,
            incomplete = stats.incomplete,
            "Retention run complete{}",
            dry_run_msg
        ),
        Err(failure) => tracing::error!(
            error = %failure.error,
            processed = failure.stats.processed,
            retired = failure.stats.retired,
            failed = failure.stats.failed,
            "Retention run aborted"
        ),
    }
}

/// Run once and log the outcome.
pub async fn run_and_log(
    store: Arc<dyn DocumentStore>,
    config: &RetentionConfig,
    plan: &PlanDefinition,
    options: RunOptions,
) -> Result<RunStats, RunFailure> {
    let result = run_once(store, config, plan, options).await;
    log_run_result(&result, config.safety.dry_run);
    result
}

/// Starts the retention worker loop.
///
/// Runs the plan every `interval_hours` until `cancel` fires. A failed run
/// is logged and retried at the next interval.
pub async fn start_retention_worker(
    store: Arc<dyn DocumentStore>,
    config: RetentionConfig,
    plan: PlanDefinition,
    cancel: CancellationToken,
) {
    if !config.enabled {
        tracing::info!("Retention worker disabled by configuration");
        return;
    }

    tracing::info!(
        plan = %plan.name,
        interval_hours = config.interval_hours,
        dry_run = config.safety.dry_run,
        "Starting retention worker"
    );

    let interval = config.interval();

    loop {
        let options = RunOptions {
            cancel: cancel.clone(),
            ..Default::default()
        };
        let _ = run_and_log(Arc::clone(&store), &config, &plan, options).await;

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = cancel.cancelled() => {
                tracing::info!("Retention worker stopping");
                return;
            }
        }
    }
}
