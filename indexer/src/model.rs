use crate::cursor::Cursor;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Category of ingested entity. Each incremental kind owns one cursor slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Trips,
    Events,
    Drivers,
}

impl RecordKind {
    pub const INCREMENTAL: [RecordKind; 2] = [RecordKind::Trips, RecordKind::Events];

    /// Stable key used for the cursor slot and the API path segment.
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Trips => "trips",
            RecordKind::Events => "events",
            RecordKind::Drivers => "drivers",
        }
    }

    /// Whether the kind is fetched with a since-token.
    pub fn is_incremental(&self) -> bool {
        !matches!(self, RecordKind::Drivers)
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trips" => Ok(RecordKind::Trips),
            "events" => Ok(RecordKind::Events),
            "drivers" => Ok(RecordKind::Drivers),
            other => Err(format!("unknown record kind '{other}'")),
        }
    }
}

/// One page returned by the fetch client.
#[derive(Debug, Clone, Default)]
pub struct FetchedBatch {
    pub records: Vec<serde_json::Value>,
    /// `HasMoreItems`, already parsed into a real boolean.
    pub has_more: bool,
    /// `GetSinceToken`, when the server sent one.
    pub next_cursor: Option<Cursor>,
    pub bytes_downloaded: Option<u64>,
}

/// A typed, nullable column value ready to bind.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
    BigInt(Option<i64>),
    Double(Option<f64>),
    Text(Option<String>),
    Bool(Option<bool>),
    Timestamp(Option<NaiveDateTime>),
    Json(Option<serde_json::Value>),
}

/// What an upsert may change when the natural key already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdatePolicy {
    /// Insert-or-ignore; stored rows are immutable.
    Immutable,
    /// Every non-key column is refreshed from the latest payload.
    AllColumns,
}

/// A storage row keyed by its natural identifier.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub table: &'static str,
    pub key_column: &'static str,
    pub key: i64,
    pub update: UpdatePolicy,
    /// All columns including the key column, in insert order.
    pub columns: Vec<(&'static str, ColumnValue)>,
}

/// Per-batch tally produced by the persister.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersistOutcome {
    pub succeeded: usize,
    pub failed: usize,
    /// Records with an unrecognised discriminator.
    pub skipped: usize,
    pub per_table: BTreeMap<&'static str, usize>,
}

impl PersistOutcome {
    pub fn merge(&mut self, other: PersistOutcome) {
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        self.skipped += other.skipped;
        for (table, count) in other.per_table {
            *self.per_table.entry(table).or_default() += count;
        }
    }
}

/// How a run left the cursor slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorAdvance {
    /// Stored the server's continuation token.
    ServerToken,
    /// Caught up; reset to a default-lookback cursor.
    CaughtUp,
    /// More data remains but the server sent no token; the request cursor was kept.
    Held,
}

/// Summary of one `SyncEngine::run` for a kind.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub kind: RecordKind,
    pub cursor_before: Cursor,
    pub cursor_after: Cursor,
    pub pages: u32,
    pub fetched: usize,
    pub outcome: PersistOutcome,
    pub advance: CursorAdvance,
    /// Server still reports pending data when the run ended.
    pub has_more: bool,
}
