use async_trait::async_trait;
use serde_json::{json, Value};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::{Postgres, Row, Transaction};
use std::time::Duration;
use tracing::{debug, info, instrument};

use crate::error::{Result, SpikeError};
use crate::persistence::store::{DocumentStore, Fields};

/// PostgreSQL document store.
///
/// Every collection lives in one `documents` table keyed by
/// `(collection, id)` with the body in a JSONB column.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Create a new PostgreSQL store
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await
            .map_err(|e| SpikeError::PersistenceUnavailable(e.to_string()))?;

        info!("Connected to PostgreSQL");
        Ok(Self { pool })
    }

    /// Create a store from an existing connection pool
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations completed");
        Ok(())
    }

    /// Get the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply field updates to many rows with one statement.
    ///
    /// Existing rows are updated in place under their row locks; ids with no
    /// row are inserted. A row created concurrently between the two steps
    /// gets the new top-level fields merged over it.
    async fn apply_rows(&self, collection: &str, updates: &[(String, Fields)]) -> Result<u64> {
        let result = sqlx::query(
            r#"
            WITH patch AS (
                SELECT p.id, p.fields
                FROM jsonb_to_recordset($2) AS p(id TEXT, fields JSONB)
            ),
            updated AS (
                UPDATE documents d SET
                    doc = documents_apply_fields(d.doc, patch.fields),
                    updated_at = NOW()
                FROM patch
                WHERE d.collection = $1 AND d.id = patch.id
                RETURNING d.id
            )
            INSERT INTO documents (collection, id, doc, updated_at)
            SELECT $1, patch.id, documents_apply_fields('{}'::jsonb, patch.fields), NOW()
            FROM patch
            WHERE patch.id NOT IN (SELECT id FROM updated)
            ON CONFLICT (collection, id) DO UPDATE SET
                doc = documents.doc || EXCLUDED.doc,
                updated_at = NOW()
            "#,
        )
        .bind(collection)
        .bind(Json(field_rows(updates)))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn upsert_in_tx(
        tx: &mut Transaction<'_, Postgres>,
        collection: &str,
        id: &str,
        doc: &Value,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO documents (collection, id, doc, updated_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (collection, id) DO UPDATE SET
                doc = EXCLUDED.doc,
                updated_at = NOW()
            "#,
        )
        .bind(collection)
        .bind(id)
        .bind(Json(doc))
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}

/// `[{id, fields}]` rows for `jsonb_to_recordset`
fn field_rows(updates: &[(String, Fields)]) -> Value {
    Value::Array(
        updates
            .iter()
            .map(|(id, fields)| json!({"id": id, "fields": fields}))
            .collect(),
    )
}

/// Split a dotted path into the text[] form used by `#>`
fn path_segments(path: &str) -> Vec<String> {
    path.split('.').map(str::to_string).collect()
}

/// Index names only carry identifier-safe characters
fn index_name(collection: &str, path: &str) -> String {
    let raw = format!("idx_documents_{}_{}", collection, path);
    raw.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect()
}

fn sql_literal(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

/// DDL for an index on a dotted path.
///
/// A plain path gets a btree expression index. A `*` segment matches any key,
/// so the object above it gets a GIN containment index instead.
fn index_statement(collection: &str, path: &str) -> String {
    let segments: Vec<String> = path_segments(path)
        .iter()
        .map(|s| s.replace(['{', '}', ',', '\'', '"'], ""))
        .collect();

    match segments.iter().position(|s| s == "*") {
        Some(wildcard) => format!(
            "CREATE INDEX IF NOT EXISTS {} ON documents USING GIN ((doc #> '{{{}}}') jsonb_path_ops) WHERE collection = {}",
            index_name(collection, path),
            segments[..wildcard].join(","),
            sql_literal(collection),
        ),
        None => format!(
            "CREATE INDEX IF NOT EXISTS {} ON documents ((doc #> '{{{}}}')) WHERE collection = {}",
            index_name(collection, path),
            segments.join(","),
            sql_literal(collection),
        ),
    }
}

#[async_trait]
impl DocumentStore for PostgresStore {
    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| SpikeError::PersistenceUnavailable(e.to_string()))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>> {
        let row = sqlx::query(
            r#"
            SELECT doc FROM documents
            WHERE collection = $1 AND id = $2
            "#,
        )
        .bind(collection)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.get::<Json<Value>, _>("doc").0))
    }

    #[instrument(skip(self))]
    async fn find_all(&self, collection: &str) -> Result<Vec<(String, Value)>> {
        let rows = sqlx::query(
            r#"
            SELECT id, doc FROM documents
            WHERE collection = $1
            ORDER BY id
            "#,
        )
        .bind(collection)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| (r.get("id"), r.get::<Json<Value>, _>("doc").0))
            .collect())
    }

    #[instrument(skip(self, value))]
    async fn find_by_field(
        &self,
        collection: &str,
        path: &str,
        value: &Value,
    ) -> Result<Vec<(String, Value)>> {
        let rows = sqlx::query(
            r#"
            SELECT id, doc FROM documents
            WHERE collection = $1 AND doc #> $2 = $3
            ORDER BY id
            "#,
        )
        .bind(collection)
        .bind(path_segments(path))
        .bind(Json(value))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| (r.get("id"), r.get::<Json<Value>, _>("doc").0))
            .collect())
    }

    #[instrument(skip(self, fields))]
    async fn update_fields(&self, collection: &str, id: &str, fields: &Fields) -> Result<()> {
        self.apply_rows(collection, &[(id.to_string(), fields.clone())])
            .await?;
        Ok(())
    }

    /// One statement, one round trip
    #[instrument(skip(self, updates), fields(count = updates.len()))]
    async fn bulk_update(&self, collection: &str, updates: &[(String, Fields)]) -> Result<()> {
        if updates.is_empty() {
            return Ok(());
        }

        let written = self.apply_rows(collection, updates).await?;
        debug!("Bulk wrote {} documents to {}", written, collection);
        Ok(())
    }

    #[instrument(skip(self, doc))]
    async fn replace(&self, collection: &str, id: &str, doc: &Value) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        Self::upsert_in_tx(&mut tx, collection, id, doc).await?;
        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete(&self, collection: &str, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM documents WHERE collection = $1 AND id = $2")
            .bind(collection)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    #[instrument(skip(self, ids), fields(count = ids.len()))]
    async fn delete_many(&self, collection: &str, ids: &[String]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        let result = sqlx::query("DELETE FROM documents WHERE collection = $1 AND id = ANY($2)")
            .bind(collection)
            .bind(ids)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Index on one JSON path, scoped to the collection
    async fn create_index(&self, collection: &str, path: &str) -> Result<()> {
        sqlx::query(&index_statement(collection, path))
            .execute(&self.pool)
            .await?;

        debug!("Ensured index on {}.{}", collection, path);
        Ok(())
    }
}
