use crate::cursor::{self, Cursor};
use crate::cursor_store::{self, CursorStore};
use crate::ingest::{Authenticator, FetchSource};
use crate::kinds;
use crate::model::{CursorAdvance, FetchedBatch, PersistOutcome, RecordKind, RunReport};
use crate::persist::Persister;
use crate::window::Window;
use chrono::{DateTime, Utc};
use fleet_sync_core::backoff::retry_with_backoff;
use fleet_sync_core::config::{Config, DrainMode};
use fleet_sync_core::{record_metric, Error, Result};
use futures::future::join_all;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, info_span, instrument, warn, Instrument};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub quantity: u32,
    pub drain_mode: DrainMode,
    pub max_pages_per_run: u32,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
}

impl From<&Config> for EngineSettings {
    fn from(config: &Config) -> Self {
        Self {
            quantity: config.api.quantity,
            drain_mode: config.sync.drain_mode,
            max_pages_per_run: config.sync.max_pages_per_run,
            max_retries: config.sync.max_retries,
            retry_base_delay_ms: config.sync.retry_base_delay_ms,
        }
    }
}

/// Cycle states. Persisting and Advancing carry the page being handled.
enum Phase {
    Fetching,
    Persisting(FetchedBatch),
    Advancing(FetchedBatch),
    Done,
}

/// Incremental sync engine: drives one fetch-persist-advance cycle per kind
/// and owns every cursor transition.
pub struct SyncEngine {
    source: Arc<dyn FetchSource>,
    auth: Arc<dyn Authenticator>,
    cursors: Arc<dyn CursorStore>,
    persister: Persister,
    window: Window,
    settings: EngineSettings,
    locks: HashMap<RecordKind, Mutex<()>>,
}

impl SyncEngine {
    pub fn new(
        source: Arc<dyn FetchSource>,
        auth: Arc<dyn Authenticator>,
        cursors: Arc<dyn CursorStore>,
        persister: Persister,
        window: Window,
        settings: EngineSettings,
    ) -> Self {
        let locks = [RecordKind::Trips, RecordKind::Events, RecordKind::Drivers]
            .into_iter()
            .map(|kind| (kind, Mutex::new(())))
            .collect();

        Self {
            source,
            auth,
            cursors,
            persister,
            window,
            settings,
            locks,
        }
    }

    fn claim(&self, kind: RecordKind) -> Result<MutexGuard<'_, ()>> {
        self.locks
            .get(&kind)
            .ok_or_else(|| Error::Internal(format!("no cycle lock for {kind}")))?
            .try_lock()
            .map_err(|_| Error::CycleInProgress(kind.to_string()))
    }

    /// Runs one poll cycle for an incremental kind. On any fetch or
    /// credential failure the stored cursor is left exactly as it was.
    pub async fn run(&self, kind: RecordKind) -> Result<RunReport> {
        if !kind.is_incremental() {
            return Err(Error::Validation(format!(
                "{kind} has no since-token endpoint; use a snapshot refresh"
            )));
        }
        let _guard = self.claim(kind)?;

        let cycle_id = Uuid::new_v4();
        let span = info_span!("sync_cycle", kind = %kind, cycle_id = %cycle_id);
        let started = Instant::now();
        let result = self.drain(kind).instrument(span).await;

        let outcome = match &result {
            Ok(_) => "ok",
            Err(e) => e.kind(),
        };
        record_metric!(counter, "fleet_sync_cycles_total", 1, "kind" = kind.as_str(), "outcome" = outcome);

        match &result {
            Ok(report) => log_report(report, self.window.now(), started.elapsed()),
            Err(e) => error!(kind = %kind, cycle_id = %cycle_id, error = %e, "Sync cycle failed"),
        }

        result
    }

    async fn drain(&self, kind: RecordKind) -> Result<RunReport> {
        // Idle: credential first so a rejected login never touches the cursor.
        let credential = self.auth.authenticate().await?;
        let cursor_before =
            cursor_store::load_or_default(self.cursors.as_ref(), &self.window, kind).await?;

        let mut cursor = cursor_before.clone();
        let mut report = RunReport {
            kind,
            cursor_before,
            cursor_after: cursor.clone(),
            pages: 0,
            fetched: 0,
            outcome: PersistOutcome::default(),
            advance: CursorAdvance::Held,
            has_more: false,
        };

        let mut phase = Phase::Fetching;
        loop {
            phase = match phase {
                Phase::Fetching => {
                    if let Some(age) = self.window.check(Some(&cursor)).age {
                        record_metric!(gauge, "fleet_sync_cursor_age_seconds", age.num_seconds(), "kind" = kind.as_str());
                    }
                    debug!(cursor = %cursor, page = report.pages + 1, "Requesting page");

                    let batch = self
                        .source
                        .fetch_since(&credential, kind, &cursor, self.settings.quantity)
                        .await?;
                    report.pages += 1;
                    report.fetched += batch.records.len();
                    debug!(
                        source = self.source.source_id(),
                        records = batch.records.len(),
                        bytes = ?batch.bytes_downloaded,
                        has_more = batch.has_more,
                        "Page received"
                    );
                    Phase::Persisting(batch)
                }
                Phase::Persisting(batch) => {
                    let outcome = self.persister.persist(kind, &batch.records).await?;
                    report.outcome.merge(outcome);
                    Phase::Advancing(batch)
                }
                Phase::Advancing(batch) => {
                    report.has_more = batch.has_more;

                    if let Some(token) = &batch.next_cursor {
                        if let (Some(next), Some(current)) = (token.instant(), cursor.instant()) {
                            if next < current {
                                warn!(
                                    request = %cursor,
                                    token = %token,
                                    "Server token is earlier than the request cursor"
                                );
                            }
                        }
                        self.save_cursor(kind, token).await?;
                        cursor = token.clone();
                        report.advance = CursorAdvance::ServerToken;
                    }

                    if !batch.has_more {
                        let fresh = self.window.default_cursor();
                        info!(replacement = %fresh, "Caught up, resetting cursor to default lookback");
                        record_metric!(counter, "fleet_sync_cursor_resets_total", 1, "kind" = kind.as_str(), "reason" = "caught_up");
                        self.save_cursor(kind, &fresh).await?;
                        cursor = fresh;
                        report.advance = CursorAdvance::CaughtUp;
                        Phase::Done
                    } else if batch.next_cursor.is_none() {
                        warn!(
                            cursor = %cursor,
                            "Server reports more data but sent no token, holding cursor"
                        );
                        self.save_cursor(kind, &cursor).await?;
                        report.advance = CursorAdvance::Held;
                        Phase::Done
                    } else if self.settings.drain_mode == DrainMode::Continuous
                        && report.pages < self.settings.max_pages_per_run
                    {
                        Phase::Fetching
                    } else {
                        info!(
                            pages = report.pages,
                            "More data pending, leaving it for the next cycle"
                        );
                        Phase::Done
                    }
                }
                Phase::Done => break,
            };
        }

        report.cursor_after = cursor;
        Ok(report)
    }

    async fn save_cursor(&self, kind: RecordKind, cursor: &Cursor) -> Result<()> {
        retry_with_backoff(
            || self.cursors.save(kind, cursor),
            self.settings.max_retries,
            self.settings.retry_base_delay_ms,
            "save_cursor",
        )
        .await
    }

    /// Runs every kind concurrently; one kind's failure does not stop the others.
    pub async fn run_all(&self, kinds: &[RecordKind]) -> Vec<(RecordKind, Result<RunReport>)> {
        let results = join_all(kinds.iter().map(|kind| self.run(*kind))).await;
        kinds.iter().copied().zip(results).collect()
    }

    /// Fetches and upserts the whole collection of a non-incremental kind.
    #[instrument(skip(self), fields(kind = %kind))]
    pub async fn refresh_snapshot(&self, kind: RecordKind) -> Result<PersistOutcome> {
        if kind.is_incremental() {
            return Err(Error::Validation(format!(
                "{kind} is synced incrementally; use a sync cycle"
            )));
        }
        let _guard = self.claim(kind)?;

        let credential = self.auth.authenticate().await?;
        let records = self.source.fetch_all(&credential, kind).await?;
        let outcome = self.persister.persist(kind, &records).await?;

        info!(
            fetched = records.len(),
            succeeded = outcome.succeeded,
            failed = outcome.failed,
            "Snapshot refreshed"
        );
        Ok(outcome)
    }

    /// Polls `kinds` every `interval` until `shutdown` resolves. A cycle in
    /// flight always finishes before the loop exits.
    pub async fn watch<S>(&self, kinds: &[RecordKind], interval: Duration, shutdown: S) -> Result<()>
    where
        S: Future<Output = ()>,
    {
        info!(kinds = ?kinds, interval_secs = interval.as_secs(), "Starting watch loop");

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutting down watch loop");
                    break;
                }

                _ = ticker.tick() => {
                    for (kind, result) in self.run_all(kinds).await {
                        if let Err(e) = result {
                            if e.is_fatal() {
                                return Err(e);
                            }
                            warn!(kind = %kind, error = %e, "Cycle failed, retrying next interval");
                        }
                    }
                }
            }
        }

        Ok(())
    }
}

fn log_report(report: &RunReport, now: DateTime<Utc>, elapsed: Duration) {
    for (table, count) in &report.outcome.per_table {
        match kinds::EVENT_TYPES.iter().find(|t| t.table == *table) {
            Some(event_type) => info!(table, label = event_type.label, count, "Stored records"),
            None => info!(table, count, "Stored records"),
        }
    }

    info!(
        kind = %report.kind,
        pages = report.pages,
        fetched = report.fetched,
        succeeded = report.outcome.succeeded,
        failed = report.outcome.failed,
        skipped = report.outcome.skipped,
        has_more = report.has_more,
        advance = ?report.advance,
        cursor_before = %report.cursor_before,
        cursor_after = %report.cursor_after,
        age = %report
            .cursor_after
            .instant()
            .map(|t| cursor::format_age(now - t))
            .unwrap_or_else(|| cursor::INVALID_MARKER.to_string()),
        duration_ms = elapsed.as_millis() as u64,
        "Sync cycle complete"
    );
}
