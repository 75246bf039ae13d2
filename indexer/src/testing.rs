//! In-memory collaborators for engine and persister tests.

use crate::cursor::Cursor;
use crate::cursor_store::CursorStore;
use crate::ingest::{Authenticator, BearerToken, FetchSource};
use crate::model::{ColumnValue, FetchedBatch, RecordKind, Row, UpdatePolicy};
use crate::persist::RowWriter;
use async_trait::async_trait;
use fleet_sync_core::{Error, Result};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

type StoredRow = Vec<(&'static str, ColumnValue)>;

#[derive(Default)]
pub struct MemoryWriter {
    rows: Mutex<BTreeMap<(&'static str, i64), StoredRow>>,
    rejected_keys: HashSet<i64>,
    disconnected: AtomicBool,
}

impl MemoryWriter {
    /// Fails every upsert for the given keys with a constraint violation.
    pub fn rejecting(keys: impl IntoIterator<Item = i64>) -> Self {
        Self {
            rejected_keys: keys.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn disconnect(&self) {
        self.disconnected.store(true, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> BTreeMap<(&'static str, i64), StoredRow> {
        self.rows.lock().unwrap().clone()
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.rows.lock().unwrap().keys().filter(|(t, _)| *t == table).count()
    }

    pub fn column(&self, table: &str, key: i64, column: &str) -> Option<ColumnValue> {
        let rows = self.rows.lock().unwrap();
        let (_, row) = rows.iter().find(|((t, k), _)| *t == table && *k == key)?;
        row.iter().find(|(c, _)| *c == column).map(|(_, v)| v.clone())
    }
}

#[async_trait]
impl RowWriter for MemoryWriter {
    async fn upsert(&self, row: &Row) -> Result<()> {
        if self.disconnected.load(Ordering::SeqCst) {
            return Err(Error::Database(sqlx::Error::PoolTimedOut));
        }
        if self.rejected_keys.contains(&row.key) {
            return Err(Error::Validation(format!("constraint violated for key {}", row.key)));
        }

        let mut rows = self.rows.lock().unwrap();
        let slot = (row.table, row.key);
        match (rows.contains_key(&slot), row.update) {
            (true, UpdatePolicy::Immutable) => {}
            _ => {
                rows.insert(slot, row.columns.clone());
            }
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryCursorStore {
    slots: Mutex<HashMap<RecordKind, Cursor>>,
    saves: Mutex<Vec<(RecordKind, Cursor)>>,
}

impl MemoryCursorStore {
    pub fn with(kind: RecordKind, cursor: &str) -> Self {
        let store = Self::default();
        store.slots.lock().unwrap().insert(kind, Cursor::new(cursor));
        store
    }

    pub fn get(&self, kind: RecordKind) -> Option<Cursor> {
        self.slots.lock().unwrap().get(&kind).cloned()
    }

    pub fn saves(&self) -> Vec<(RecordKind, Cursor)> {
        self.saves.lock().unwrap().clone()
    }
}

#[async_trait]
impl CursorStore for MemoryCursorStore {
    async fn load(&self, kind: RecordKind) -> Result<Option<Cursor>> {
        Ok(self.get(kind))
    }

    async fn save(&self, kind: RecordKind, cursor: &Cursor) -> Result<()> {
        self.slots.lock().unwrap().insert(kind, cursor.clone());
        self.saves.lock().unwrap().push((kind, cursor.clone()));
        Ok(())
    }

    fn location(&self, kind: RecordKind) -> String {
        format!("memory:{kind}")
    }
}

/// Replays queued responses in order; an exhausted script is a 503.
#[derive(Default)]
pub struct ScriptedSource {
    pages: Mutex<VecDeque<Result<FetchedBatch>>>,
    collection: Vec<Value>,
    requests: Mutex<Vec<(RecordKind, Cursor, u32)>>,
}

impl ScriptedSource {
    pub fn new(pages: impl IntoIterator<Item = Result<FetchedBatch>>) -> Self {
        Self {
            pages: Mutex::new(pages.into_iter().collect()),
            ..Self::default()
        }
    }

    pub fn with_collection(collection: Vec<Value>) -> Self {
        Self {
            collection,
            ..Self::default()
        }
    }

    pub fn requests(&self) -> Vec<(RecordKind, Cursor, u32)> {
        self.requests.lock().unwrap().clone()
    }
}

pub fn page(records: Vec<Value>, has_more: bool, next: Option<&str>) -> Result<FetchedBatch> {
    Ok(FetchedBatch {
        records,
        has_more,
        next_cursor: next.map(Cursor::new),
        bytes_downloaded: None,
    })
}

#[async_trait]
impl FetchSource for ScriptedSource {
    async fn fetch_since(
        &self,
        _credential: &BearerToken,
        kind: RecordKind,
        cursor: &Cursor,
        quantity: u32,
    ) -> Result<FetchedBatch> {
        self.requests
            .lock()
            .unwrap()
            .push((kind, cursor.clone(), quantity));
        self.pages
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| {
                Err(Error::RemoteUnavailable {
                    status: Some(503),
                    details: "script exhausted".into(),
                })
            })
    }

    async fn fetch_all(&self, _credential: &BearerToken, _kind: RecordKind) -> Result<Vec<Value>> {
        Ok(self.collection.clone())
    }

    fn source_id(&self) -> &str {
        "scripted"
    }
}

pub struct StaticAuth {
    pub reject: bool,
}

#[async_trait]
impl Authenticator for StaticAuth {
    async fn authenticate(&self) -> Result<BearerToken> {
        if self.reject {
            Err(Error::Auth("invalid_grant".into()))
        } else {
            Ok(BearerToken::new("tok"))
        }
    }
}
