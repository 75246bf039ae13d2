use crate::cursor::Cursor;
use crate::cursor_store::CursorStore;
use crate::model::{ColumnValue, RecordKind, Row, UpdatePolicy};
use crate::persist::RowWriter;
use async_trait::async_trait;
use chrono::Utc;
use fleet_sync_core::Result;
use metrics::counter;
use sqlx::postgres::PgArguments;
use sqlx::query::Query;
use sqlx::{PgPool, Postgres};
use tracing::{debug, info, instrument};

pub struct Store {
    pool: PgPool,
}

impl Store {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");
        sqlx::migrate!("../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| fleet_sync_core::Error::Database(e.into()))?;
        info!("Migrations completed successfully");
        Ok(())
    }

    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

/// Builds the single-row upsert statement for `row`.
pub(crate) fn upsert_sql(row: &Row) -> String {
    let columns: Vec<&str> = row.columns.iter().map(|(name, _)| *name).collect();
    let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("${}", i)).collect();

    let conflict = match row.update {
        UpdatePolicy::Immutable => "DO NOTHING".to_string(),
        UpdatePolicy::AllColumns => {
            let assignments: Vec<String> = columns
                .iter()
                .filter(|c| **c != row.key_column)
                .map(|c| format!("{c} = EXCLUDED.{c}"))
                .collect();
            if assignments.is_empty() {
                "DO NOTHING".to_string()
            } else {
                format!("DO UPDATE SET {}", assignments.join(", "))
            }
        }
    };

    format!(
        "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT ({}) {}",
        row.table,
        columns.join(", "),
        placeholders.join(", "),
        row.key_column,
        conflict
    )
}

fn bind_value<'q>(
    query: Query<'q, Postgres, PgArguments>,
    value: &ColumnValue,
) -> Query<'q, Postgres, PgArguments> {
    match value.clone() {
        ColumnValue::BigInt(v) => query.bind(v),
        ColumnValue::Double(v) => query.bind(v),
        ColumnValue::Text(v) => query.bind(v),
        ColumnValue::Bool(v) => query.bind(v),
        ColumnValue::Timestamp(v) => query.bind(v),
        ColumnValue::Json(v) => query.bind(v),
    }
}

#[async_trait]
impl RowWriter for Store {
    async fn upsert(&self, row: &Row) -> Result<()> {
        let sql = upsert_sql(row);
        let mut query = sqlx::query(&sql);
        for (_, value) in &row.columns {
            query = bind_value(query, value);
        }
        query.execute(&self.pool).await?;
        Ok(())
    }
}

/// Cursor slots in the `sync_cursors` table, one row per kind.
#[async_trait]
impl CursorStore for Store {
    #[instrument(skip(self))]
    async fn load(&self, kind: RecordKind) -> Result<Option<Cursor>> {
        let cursor: Option<String> =
            sqlx::query_scalar("SELECT cursor FROM sync_cursors WHERE kind = $1")
                .bind(kind.as_str())
                .fetch_optional(&self.pool)
                .await?;

        Ok(cursor
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .map(Cursor::new))
    }

    #[instrument(skip(self))]
    async fn save(&self, kind: RecordKind, cursor: &Cursor) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_cursors (kind, cursor, updated_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (kind) DO UPDATE SET
                cursor = EXCLUDED.cursor,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(kind.as_str())
        .bind(cursor.as_str())
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        counter!("fleet_sync_cursor_saves_total", "kind" => kind.as_str()).increment(1);
        debug!(kind = %kind, cursor = %cursor, "Saved cursor");

        Ok(())
    }

    fn location(&self, kind: RecordKind) -> String {
        format!("sync_cursors[kind = '{}']", kind.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn row(update: UpdatePolicy) -> Row {
        Row {
            table: "trips",
            key_column: "trip_id",
            key: 7,
            update,
            columns: vec![
                ("trip_id", ColumnValue::BigInt(Some(7))),
                ("distance", ColumnValue::Double(None)),
                ("end_time", ColumnValue::Timestamp(None)),
            ],
        }
    }

    #[test]
    fn updatable_rows_refresh_every_non_key_column() {
        assert_eq!(
            upsert_sql(&row(UpdatePolicy::AllColumns)),
            "INSERT INTO trips (trip_id, distance, end_time) VALUES ($1, $2, $3) \
             ON CONFLICT (trip_id) DO UPDATE SET distance = EXCLUDED.distance, end_time = EXCLUDED.end_time"
        );
    }

    #[test]
    fn immutable_rows_ignore_conflicts() {
        assert_eq!(
            upsert_sql(&row(UpdatePolicy::Immutable)),
            "INSERT INTO trips (trip_id, distance, end_time) VALUES ($1, $2, $3) \
             ON CONFLICT (trip_id) DO NOTHING"
        );
    }

    #[test]
    fn key_only_row_never_emits_empty_update() {
        let mut row = row(UpdatePolicy::AllColumns);
        row.columns.truncate(1);
        assert!(upsert_sql(&row).ends_with("ON CONFLICT (trip_id) DO NOTHING"));
    }
}
