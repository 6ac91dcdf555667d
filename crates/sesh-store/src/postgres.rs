//! PostgreSQL-backed transactional document store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sesh_core::{Collection, DocKey, ReadStamp, StoreError, TxStore, VersionedDoc, WriteOp};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};

/// Single-table document store with a global version sequence.
///
/// Versions come from one sequence rather than a per-row counter so a
/// delete-and-recreate can never hand a stale reader a matching version.
/// Commits run SERIALIZABLE; Postgres turns write skew and phantom inserts
/// into serialization failures, which map to `StoreError::Conflict` and are
/// retried by the caller.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await
            .map_err(|e| StoreError::Backend(format!("postgres connect failed: {e}")))?;
        Ok(Self { pool })
    }

    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query("CREATE SEQUENCE IF NOT EXISTS sesh_document_versions")
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(format!("postgres schema create failed: {e}")))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sesh_documents (
                collection TEXT NOT NULL,
                doc_id TEXT NOT NULL,
                payload JSONB NOT NULL,
                version BIGINT NOT NULL DEFAULT nextval('sesh_document_versions'),
                PRIMARY KEY (collection, doc_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(format!("postgres schema create failed: {e}")))?;

        // Sweep scan index over (status, expires_at) for the bounty collection.
        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_sesh_documents_bounty_sweep
                ON sesh_documents ((payload->>'status'), (payload->>'expires_at'))
                WHERE collection = 'bounties'
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(format!("postgres index create failed: {e}")))?;

        Ok(())
    }
}

fn map_sqlx(err: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db) = &err {
        if let Some(code) = db.code() {
            // serialization_failure / deadlock_detected
            if code.as_ref() == "40001" || code.as_ref() == "40P01" {
                return StoreError::Conflict;
            }
        }
    }
    StoreError::Backend(format!("postgres error: {err}"))
}

fn version_from_row(version: i64) -> Result<u64, StoreError> {
    version
        .try_into()
        .map_err(|_| StoreError::Backend("negative document version in storage".to_string()))
}

fn version_to_db(version: u64) -> Result<i64, StoreError> {
    version
        .try_into()
        .map_err(|_| StoreError::Backend("document version exceeds BIGINT range".to_string()))
}

#[async_trait]
impl TxStore for PostgresStore {
    async fn get(&self, key: &DocKey) -> Result<Option<VersionedDoc>, StoreError> {
        let row = sqlx::query(
            "SELECT payload, version FROM sesh_documents WHERE collection = $1 AND doc_id = $2",
        )
        .bind(key.collection.name())
        .bind(&key.id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?;

        match row {
            None => Ok(None),
            Some(row) => {
                let value: serde_json::Value = row.try_get("payload").map_err(map_sqlx)?;
                let version: i64 = row.try_get("version").map_err(map_sqlx)?;
                Ok(Some(VersionedDoc {
                    value,
                    version: version_from_row(version)?,
                }))
            }
        }
    }

    async fn commit(&self, reads: &[ReadStamp], writes: &[WriteOp]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;

        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;

        for stamp in reads {
            let row = sqlx::query(
                "SELECT version FROM sesh_documents WHERE collection = $1 AND doc_id = $2",
            )
            .bind(stamp.key.collection.name())
            .bind(&stamp.key.id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(map_sqlx)?;

            let current: Option<i64> = match row {
                Some(row) => Some(row.try_get("version").map_err(map_sqlx)?),
                None => None,
            };
            let stamped: Option<i64> = match stamp.version {
                Some(version) => Some(version_to_db(version)?),
                None => None,
            };
            if current != stamped {
                return Err(StoreError::Conflict);
            }
        }

        for write in writes {
            match write {
                WriteOp::Put { key, value } => {
                    sqlx::query(
                        r#"
                        INSERT INTO sesh_documents (collection, doc_id, payload, version)
                        VALUES ($1, $2, $3, nextval('sesh_document_versions'))
                        ON CONFLICT (collection, doc_id) DO UPDATE
                            SET payload = EXCLUDED.payload,
                                version = nextval('sesh_document_versions')
                        "#,
                    )
                    .bind(key.collection.name())
                    .bind(&key.id)
                    .bind(value)
                    .execute(&mut *tx)
                    .await
                    .map_err(map_sqlx)?;
                }
                WriteOp::Delete { key } => {
                    sqlx::query(
                        "DELETE FROM sesh_documents WHERE collection = $1 AND doc_id = $2",
                    )
                    .bind(key.collection.name())
                    .bind(&key.id)
                    .execute(&mut *tx)
                    .await
                    .map_err(map_sqlx)?;
                }
            }
        }

        tx.commit().await.map_err(map_sqlx)
    }

    async fn scan(&self, collection: Collection) -> Result<Vec<(String, VersionedDoc)>, StoreError> {
        let rows = sqlx::query(
            "SELECT doc_id, payload, version FROM sesh_documents WHERE collection = $1 ORDER BY doc_id",
        )
        .bind(collection.name())
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;

        let mut docs = Vec::with_capacity(rows.len());
        for row in rows {
            let doc_id: String = row.try_get("doc_id").map_err(map_sqlx)?;
            let value: serde_json::Value = row.try_get("payload").map_err(map_sqlx)?;
            let version: i64 = row.try_get("version").map_err(map_sqlx)?;
            docs.push((
                doc_id,
                VersionedDoc {
                    value,
                    version: version_from_row(version)?,
                },
            ));
        }
        Ok(docs)
    }

    async fn expired_open_bounties(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<String>, StoreError> {
        let limit: i64 = limit.min(i64::MAX as usize) as i64;
        let rows = sqlx::query(
            r#"
            SELECT doc_id FROM sesh_documents
            WHERE collection = 'bounties'
              AND payload->>'status' = 'open'
              AND (payload->>'expires_at')::timestamptz <= $1
            ORDER BY (payload->>'expires_at')::timestamptz ASC, doc_id ASC
            LIMIT $2
            "#,
        )
        .bind(cutoff)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;

        let mut ids = Vec::with_capacity(rows.len());
        for row in rows {
            ids.push(row.try_get("doc_id").map_err(map_sqlx)?);
        }
        Ok(ids)
    }

    fn backend_label(&self) -> &'static str {
        "postgres"
    }
}
