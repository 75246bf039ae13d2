use crate::cursor::Cursor;
use crate::model::RecordKind;
use crate::window::Window;
use async_trait::async_trait;
use fleet_sync_core::{Error, Result};
use std::io::ErrorKind;
use std::path::PathBuf;
use tracing::{debug, instrument};

/// Durable, one-slot-per-kind storage of the last acknowledged cursor.
#[async_trait]
pub trait CursorStore: Send + Sync {
    async fn load(&self, kind: RecordKind) -> Result<Option<Cursor>>;

    async fn save(&self, kind: RecordKind, cursor: &Cursor) -> Result<()>;

    /// Human-readable slot location for diagnostics.
    fn location(&self, kind: RecordKind) -> String;
}

/// Loads the slot for `kind`, replacing an absent or out-of-window cursor
/// with the default-lookback cursor.
pub async fn load_or_default(store: &dyn CursorStore, window: &Window, kind: RecordKind) -> Result<Cursor> {
    let stored = store.load(kind).await?;
    Ok(window.ensure_within_window(kind, stored))
}

/// Stores each kind's cursor as `since_token_<kind>.txt` under one directory.
pub struct FileCursorStore {
    dir: PathBuf,
}

impl FileCursorStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn slot_path(&self, kind: RecordKind) -> PathBuf {
        self.dir.join(format!("since_token_{}.txt", kind.as_str()))
    }
}

#[async_trait]
impl CursorStore for FileCursorStore {
    #[instrument(skip(self))]
    async fn load(&self, kind: RecordKind) -> Result<Option<Cursor>> {
        match tokio::fs::read_to_string(self.slot_path(kind)).await {
            Ok(contents) => {
                let token = contents.trim();
                Ok((!token.is_empty()).then(|| Cursor::new(token)))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::CursorStore(format!(
                "failed to read {}: {}",
                self.slot_path(kind).display(),
                e
            ))),
        }
    }

    #[instrument(skip(self))]
    async fn save(&self, kind: RecordKind, cursor: &Cursor) -> Result<()> {
        let path = self.slot_path(kind);
        let staging = path.with_extension("txt.tmp");

        tokio::fs::create_dir_all(&self.dir).await?;
        tokio::fs::write(&staging, cursor.as_str()).await?;
        tokio::fs::rename(&staging, &path).await?;

        debug!(kind = %kind, cursor = %cursor, path = %path.display(), "Saved cursor");
        Ok(())
    }

    fn location(&self, kind: RecordKind) -> String {
        self.slot_path(kind).display().to_string()
    }
}
