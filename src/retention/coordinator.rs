//! Batched traversal of the entity population.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use super::{
    eligibility::EligibilityEvaluator,
    error::{RetentionError, RunFailure},
    executor::TransactionExecutor,
    plan::Planner,
    report::{AuditReporter, Outcome, OutcomeRecord},
};
use crate::{
    config::RetentionSafety,
    db::{DbResult, DocumentStore, Seq},
    models::{Document, document},
    observability::metrics,
};

const INELIGIBLE: &str = "does not meet retirement criteria";
const ALREADY_RETIRED: &str = "already retired";
const DRY_RUN: &str = "dry run: eligible for retirement";

/// Counters for one run.
///
/// `processed == retired + failed + skipped` holds at every point.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunStats {
    pub processed: u64,
    pub retired: u64,
    pub failed: u64,
    pub skipped: u64,
    /// Non-empty windows pulled from the cursor.
    pub batches: u64,
    /// Records deleted, updated or inserted, by physical collection.
    pub records_affected: BTreeMap<String, u64>,
    /// The run stopped before exhausting the population.
    pub incomplete: bool,
}

impl RunStats {
    fn count(&mut self, outcome: Outcome) {
        self.processed += 1;
        match outcome {
            Outcome::Retired => self.retired += 1,
            Outcome::Skipped => self.skipped += 1,
            Outcome::Failed => self.failed += 1,
        }
    }
}

/// Resumable source of entity documents.
#[async_trait]
pub trait EntitySource: Send {
    /// Collection name for logs and errors.
    fn collection(&self) -> &str;

    /// Up to `limit` further documents. An empty window means exhausted.
    async fn next_window(&mut self, limit: u32) -> DbResult<Vec<Document>>;
}

/// Keyset cursor over a whole collection, in insertion order.
pub struct CollectionCursor {
    store: Arc<dyn DocumentStore>,
    collection: String,
    after: Option<Seq>,
}

impl CollectionCursor {
    pub fn new(store: Arc<dyn DocumentStore>, collection: impl Into<String>) -> Self {
        Self {
            store,
            collection: collection.into(),
            after: None,
        }
    }
}

#[async_trait]
impl EntitySource for CollectionCursor {
    fn collection(&self) -> &str {
        &self.collection
    }

    async fn next_window(&mut self, limit: u32) -> DbResult<Vec<Document>> {
        let page = self
            .store
            .fetch_page(&self.collection, self.after, limit)
            .await?;
        if let Some(last) = page.last() {
            self.after = Some(last.seq);
        }
        Ok(page.into_iter().map(|d| d.body).collect())
    }
}

/// A single, already-fetched entity.
pub struct SingleEntity {
    collection: String,
    doc: Option<Document>,
}

impl SingleEntity {
    pub fn new(collection: impl Into<String>, doc: Document) -> Self {
        Self {
            collection: collection.into(),
            doc: Some(doc),
        }
    }
}

#[async_trait]
impl EntitySource for SingleEntity {
    fn collection(&self) -> &str {
        &self.collection
    }

    async fn next_window(&mut self, _limit: u32) -> DbResult<Vec<Document>> {
        Ok(self.doc.take().into_iter().collect())
    }
}

/// Batching and safety knobs.
#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    pub batch_size: u32,
    pub batch_delay: Duration,
    pub dry_run: bool,
    pub entity_limit: Option<u64>,
}

impl From<&RetentionSafety> for CoordinatorOptions {
    fn from(safety: &RetentionSafety) -> Self {
        Self {
            batch_size: safety.batch_size.max(1),
            batch_delay: safety.batch_delay(),
            dry_run: safety.dry_run,
            entity_limit: safety.entity_limit(),
        }
    }
}

/// Drives evaluation and execution over every entity a source yields.
pub struct BatchCoordinator {
    evaluator: EligibilityEvaluator,
    planner: Planner,
    executor: TransactionExecutor,
    options: CoordinatorOptions,
    cancel: CancellationToken,
}

impl BatchCoordinator {
    pub fn new(
        evaluator: EligibilityEvaluator,
        planner: Planner,
        executor: TransactionExecutor,
        options: CoordinatorOptions,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            evaluator,
            planner,
            executor,
            options,
            cancel,
        }
    }

    pub fn planner(&self) -> &Planner {
        &self.planner
    }

    /// Process every entity from `source` in windows of `batch_size`,
    /// pausing `batch_delay` after each full window.
    ///
    /// Entity-level failures are recorded and never end the run. A cursor
    /// failure does, returning the partial counters; outcomes recorded so
    /// far stay in `reporter`. Cancellation stops before the next entity.
    pub async fn run(
        &self,
        source: &mut dyn EntitySource,
        reporter: &mut AuditReporter,
        now: DateTime<Utc>,
    ) -> Result<RunStats, RunFailure> {
        let mut stats = RunStats::default();
        let batch_size = self.options.batch_size.max(1);

        'windows: loop {
            if self.cancel.is_cancelled() {
                tracing::warn!(processed = stats.processed, "Run cancelled");
                stats.incomplete = true;
                break;
            }

            let requested = match self.options.entity_limit {
                Some(limit) if stats.processed >= limit => {
                    tracing::info!(limit, "Entity limit reached, ending run");
                    stats.incomplete = true;
                    break;
                }
                Some(limit) => {
                    let remaining = u32::try_from(limit - stats.processed).unwrap_or(u32::MAX);
                    batch_size.min(remaining)
                }
                None => batch_size,
            };

            let window = match source.next_window(requested).await {
                Ok(window) => window,
                Err(source_err) => {
                    reporter.mark_incomplete();
                    return Err(RunFailure::new(
                        RetentionError::Cursor {
                            collection: source.collection().to_string(),
                            source: source_err,
                        },
                        stats,
                    ));
                }
            };
            if window.is_empty() {
                break;
            }

            stats.batches += 1;
            let full = window.len() == requested as usize;
            tracing::debug!(
                batch = stats.batches,
                size = window.len(),
                collection = source.collection(),
                "Processing window"
            );

            for doc in window {
                if self.cancel.is_cancelled() {
                    tracing::warn!(processed = stats.processed, "Run cancelled mid-window");
                    stats.incomplete = true;
                    break 'windows;
                }

                let record = self.process(doc, now, &mut stats).await;
                stats.count(record.outcome);
                metrics::record_outcome(self.planner.name(), record.outcome.as_str());
                reporter.record(record);
            }

            if !full {
                break;
            }
            // The cap check at the top of the loop ends the run without a pause.
            if self
                .options
                .entity_limit
                .is_some_and(|limit| stats.processed >= limit)
            {
                continue;
            }

            if !self.options.batch_delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(self.options.batch_delay) => {}
                    _ = self.cancel.cancelled() => {
                        tracing::warn!(
                            processed = stats.processed,
                            "Run cancelled during batch delay"
                        );
                        stats.incomplete = true;
                        break;
                    }
                }
            }
        }

        if stats.incomplete {
            reporter.mark_incomplete();
        }
        Ok(stats)
    }

    async fn process(
        &self,
        doc: Document,
        now: DateTime<Utc>,
        stats: &mut RunStats,
    ) -> OutcomeRecord {
        let label = id_label(&doc, self.planner.id_field());

        let entity = match self.planner.entity_from(doc) {
            Ok(entity) => entity,
            Err(e) => {
                tracing::warn!(entity_id = %label, error = %e, "Unreadable entity");
                return OutcomeRecord::failed(label, e.to_string());
            }
        };

        if !self.evaluator.is_eligible(&entity, now) {
            return OutcomeRecord::skipped(entity.id, INELIGIBLE);
        }
        if self.planner.already_retired(&entity) {
            return OutcomeRecord::skipped(entity.id, ALREADY_RETIRED);
        }

        let plan = match self.planner.build_plan(&entity, now).await {
            Ok(plan) => plan,
            Err(e) => {
                tracing::warn!(entity_id = %entity.id, error = %e, "Failed to build cascade plan");
                return OutcomeRecord::failed(entity.id, e.to_string());
            }
        };

        if self.options.dry_run {
            tracing::info!(
                entity_id = %entity.id,
                steps = plan.steps.len(),
                omitted = plan.omitted.len(),
                "DRY RUN: would retire entity"
            );
            return OutcomeRecord::skipped(entity.id, DRY_RUN);
        }

        match self.executor.execute(&plan).await {
            Ok(committed) => {
                for (collection, count) in committed.records_affected {
                    metrics::record_records_affected(&collection, count);
                    *stats.records_affected.entry(collection).or_default() += count;
                }
                tracing::debug!(entity_id = %entity.id, steps = plan.steps.len(), "Entity retired");
                OutcomeRecord::retired(entity.id)
            }
            Err(aborted) => {
                tracing::warn!(entity_id = %entity.id, error = %aborted, "Cascade aborted");
                OutcomeRecord::failed(entity.id, aborted.to_string())
            }
        }
    }
}

/// Best-effort identifier for an entity that could not be parsed.
fn id_label(doc: &Document, id_field: &str) -> String {
    match document::get_path(doc, id_field) {
        Some(serde_json::Value::String(s)) if !s.is_empty() => s.clone(),
        Some(serde_json::Value::Null) | None => "<missing id>".to_string(),
        Some(other) => other.to_string(),
    }
}
