use std::{collections::BTreeMap, sync::Arc};

use thiserror::Error;

use super::plan::{CascadePlan, CascadeStep, StepAction};
use crate::{
    db::{DbError, DbResult, DocumentStore, DocumentTx},
    models::document,
};

/// A plan whose steps were all applied and committed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Committed {
    /// Records deleted, updated or inserted, by physical collection.
    pub records_affected: BTreeMap<String, u64>,
}

/// A plan that was rolled back. Nothing it did is visible.
#[derive(Debug, Error)]
#[error("{context}: {source}")]
pub struct Aborted {
    pub context: String,
    #[source]
    pub source: DbError,
}

/// Applies one entity's cascade plan inside a single transaction.
pub struct TransactionExecutor {
    store: Arc<dyn DocumentStore>,
}

impl TransactionExecutor {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Apply every step in order, then commit.
    ///
    /// The first failing step rolls the whole plan back. The transaction is
    /// released on every path: committed, rolled back, or discarded on drop.
    pub async fn execute(&self, plan: &CascadePlan) -> Result<Committed, Aborted> {
        let mut tx = self.store.begin().await.map_err(|source| Aborted {
            context: "failed to open transaction".to_string(),
            source,
        })?;

        let mut committed = Committed::default();
        for (index, step) in plan.steps.iter().enumerate() {
            match apply_step(tx.as_mut(), step).await {
                Ok(0) => {}
                Ok(affected) => {
                    let collection = match &step.action {
                        StepAction::ArchiveCopy { target, .. } => target,
                        _ => &step.collection,
                    };
                    *committed
                        .records_affected
                        .entry(collection.clone())
                        .or_default() += affected;
                }
                Err(source) => {
                    if let Err(e) = tx.rollback().await {
                        tracing::warn!(
                            entity_id = %plan.entity_id,
                            error = %e,
                            "Rollback failed; transaction discarded"
                        );
                    }
                    return Err(Aborted {
                        context: format!(
                            "step {} ({} on '{}') failed",
                            index + 1,
                            step.action.name(),
                            step.collection
                        ),
                        source,
                    });
                }
            }
        }

        tx.commit().await.map_err(|source| Aborted {
            context: "commit failed".to_string(),
            source,
        })?;

        Ok(committed)
    }
}

async fn apply_step(tx: &mut dyn DocumentTx, step: &CascadeStep) -> DbResult<u64> {
    match &step.action {
        StepAction::HardDelete => tx.delete_many(&step.collection, &step.filter).await,
        StepAction::SoftDelete { set } => {
            tx.set_fields(&step.collection, &step.filter, set).await
        }
        StepAction::PullReference { field, value } => {
            tx.pull_value(&step.collection, &step.filter, field, value)
                .await
        }
        StepAction::ArchiveCopy {
            target,
            wrap_field,
            extra,
        } => {
            let originals = tx.find_many(&step.collection, &step.filter).await?;
            let copies = originals.len() as u64;
            for original in originals {
                let mut copy = match wrap_field {
                    Some(path) => {
                        let mut wrapped = document::Document::new();
                        document::set_path(&mut wrapped, path, original.into());
                        wrapped
                    }
                    None => original,
                };
                for (path, value) in extra {
                    document::set_path(&mut copy, path, value.clone());
                }
                tx.insert_one(target, copy).await?;
            }
            Ok(copies)
        }
    }
}
