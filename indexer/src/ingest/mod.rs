pub mod auth;
pub mod http_source;

use crate::cursor::Cursor;
use crate::model::{FetchedBatch, RecordKind};
use async_trait::async_trait;
use fleet_sync_core::Result;

pub use auth::{Authenticator, BearerToken, PasswordGrantAuthenticator};
pub use http_source::HttpSource;

#[async_trait]
pub trait FetchSource: Send + Sync {
    /// Fetch at most `quantity` records created after `cursor`. Exactly one request.
    async fn fetch_since(
        &self,
        credential: &BearerToken,
        kind: RecordKind,
        cursor: &Cursor,
        quantity: u32,
    ) -> Result<FetchedBatch>;

    /// Fetch the whole collection of a kind that has no since-token endpoint.
    async fn fetch_all(
        &self,
        credential: &BearerToken,
        kind: RecordKind,
    ) -> Result<Vec<serde_json::Value>>;

    /// Get the source identifier
    fn source_id(&self) -> &str;
}
