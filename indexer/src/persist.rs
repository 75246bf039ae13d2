use crate::kinds;
use crate::model::{PersistOutcome, RecordKind, Row};
use async_trait::async_trait;
use chrono::FixedOffset;
use fleet_sync_core::Result;
use metrics::counter;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error, instrument, warn};

/// Storage seam for upserts keyed by natural id.
#[async_trait]
pub trait RowWriter: Send + Sync {
    /// Insert `row`, or apply its update policy when the key already exists.
    async fn upsert(&self, row: &Row) -> Result<()>;
}

pub struct Persister {
    writer: Arc<dyn RowWriter>,
    display_tz: FixedOffset,
}

impl Persister {
    pub fn new(writer: Arc<dyn RowWriter>, display_tz: FixedOffset) -> Self {
        Self { writer, display_tz }
    }

    /// Upserts every record independently. A record that cannot be mapped or
    /// written is counted as failed and does not affect its neighbours; only a
    /// lost database connection aborts the batch.
    #[instrument(skip(self, records), fields(kind = %kind, records = records.len()))]
    pub async fn persist(&self, kind: RecordKind, records: &[Value]) -> Result<PersistOutcome> {
        let descriptor = kinds::descriptor(kind);
        let mut outcome = PersistOutcome::default();

        for record in records {
            let row = match descriptor.map(record, &self.display_tz) {
                Ok(Some(row)) => row,
                Ok(None) => {
                    outcome.skipped += 1;
                    continue;
                }
                Err(e) => {
                    warn!(
                        record_id = %descriptor.record_id(record),
                        error = %e,
                        "Record cannot be mapped, skipping"
                    );
                    outcome.failed += 1;
                    continue;
                }
            };

            match self.writer.upsert(&row).await {
                Ok(()) => {
                    outcome.succeeded += 1;
                    *outcome.per_table.entry(row.table).or_default() += 1;
                }
                Err(e) if e.is_connection_failure() => {
                    error!(
                        record_id = row.key,
                        table = row.table,
                        error = %e,
                        "Lost database connection, aborting batch"
                    );
                    return Err(e);
                }
                Err(e) => {
                    warn!(
                        record_id = row.key,
                        table = row.table,
                        error = %e,
                        "Failed to persist record"
                    );
                    outcome.failed += 1;
                }
            }
        }

        counter!("fleet_sync_records_total", "kind" => kind.as_str(), "result" => "succeeded")
            .increment(outcome.succeeded as u64);
        counter!("fleet_sync_records_total", "kind" => kind.as_str(), "result" => "failed")
            .increment(outcome.failed as u64);
        counter!("fleet_sync_records_total", "kind" => kind.as_str(), "result" => "skipped")
            .increment(outcome.skipped as u64);

        debug!(
            succeeded = outcome.succeeded,
            failed = outcome.failed,
            skipped = outcome.skipped,
            "Persisted batch"
        );

        Ok(outcome)
    }
}
