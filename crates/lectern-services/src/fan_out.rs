//! Uniform mutation of a record set in bounded atomic groups

use crate::error::FanOutError;
use lectern_core::models::AnalyticsIncrement;
use lectern_db::{BatchOp, DocumentStore, FieldChange, RecordFilter};
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;

/// Which records a fan-out touches.
#[derive(Debug, Clone, PartialEq)]
pub struct FanOutSelector {
    pub collection: String,
    pub filter: RecordFilter,
}

impl FanOutSelector {
    pub fn all(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            filter: RecordFilter::All,
        }
    }

    pub fn matching(collection: impl Into<String>, filter: RecordFilter) -> Self {
        Self {
            collection: collection.into(),
            filter,
        }
    }
}

/// Mutation applied identically to every selected record.
#[derive(Debug, Clone, PartialEq)]
pub struct FanOutUpdate {
    pub increment: AnalyticsIncrement,
    /// Field set to the commit time of each group.
    pub timestamp_field: Option<String>,
}

impl FanOutUpdate {
    pub fn increment(increment: AnalyticsIncrement) -> Self {
        Self {
            increment,
            timestamp_field: None,
        }
    }

    pub fn with_timestamp(mut self, field: impl Into<String>) -> Self {
        self.timestamp_field = Some(field.into());
        self
    }

    fn changes(&self) -> Vec<FieldChange> {
        let mut changes = vec![FieldChange::Increment {
            field: self.increment.field_key.clone(),
            delta: self.increment.delta,
        }];
        if let Some(field) = &self.timestamp_field {
            changes.push(FieldChange::Set {
                field: field.clone(),
                value: Value::String(chrono::Utc::now().to_rfc3339()),
            });
        }
        changes
    }
}

/// Summary of a completed fan-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FanOutReport {
    pub updated: usize,
    pub commits: usize,
}

pub struct FanOutBatchWriter {
    store: Arc<dyn DocumentStore>,
    max_batch_ops: usize,
}

impl FanOutBatchWriter {
    /// `max_batch_ops` is further capped by the store's own ceiling.
    pub fn new(store: Arc<dyn DocumentStore>, max_batch_ops: usize) -> Result<Self, FanOutError> {
        if max_batch_ops == 0 || store.max_batch_ops() == 0 {
            return Err(FanOutError::InvalidBatchSize);
        }
        let max_batch_ops = max_batch_ops.min(store.max_batch_ops());
        Ok(Self {
            store,
            max_batch_ops,
        })
    }

    pub fn max_batch_ops(&self) -> usize {
        self.max_batch_ops
    }

    /// Apply `update` to every record matching `selector`.
    ///
    /// Groups commit one after another. A failed group leaves the earlier
    /// groups applied and is reported with the count already updated.
    #[tracing::instrument(skip_all, fields(collection = %selector.collection, field = %update.increment.field_key))]
    pub async fn apply(
        &self,
        selector: &FanOutSelector,
        update: &FanOutUpdate,
    ) -> Result<FanOutReport, FanOutError> {
        let start = Instant::now();
        let targets = self
            .store
            .query(&selector.collection, &selector.filter)
            .await
            .map_err(FanOutError::Query)?;

        let mut report = FanOutReport {
            updated: 0,
            commits: 0,
        };
        for (group_index, group) in targets.chunks(self.max_batch_ops).enumerate() {
            let changes = update.changes();
            let ops = group
                .iter()
                .map(|doc| BatchOp {
                    collection: doc.collection.clone(),
                    id: doc.id.clone(),
                    changes: changes.clone(),
                })
                .collect::<Vec<_>>();

            self.store
                .commit_batch(ops)
                .await
                .map_err(|source| FanOutError::Commit {
                    group_index,
                    updated: report.updated,
                    source,
                })?;

            report.updated += group.len();
            report.commits += 1;
            tracing::debug!(group_index = group_index, ops = group.len(), "Fan-out group committed");
        }

        tracing::info!(
            updated = report.updated,
            commits = report.commits,
            duration_ms = start.elapsed().as_millis() as u64,
            "Fan-out applied"
        );
        Ok(report)
    }
}
