//! Postgres-backed document store.
//!
//! Every document lives in one `documents` table, keyed by collection and
//! id, with its body as JSONB and its version in a separate column so the
//! conditional update can filter on it.
//!
//! ## Error Mapping
//!
//! | SQLx error | PostgreSQL code | StoreError |
//! |------------|-----------------|------------|
//! | Database (unique violation) | `23505` | `Duplicate` |
//! | Database (check / not-null violation, bad input) | `23514`, `23502`, `22P02` | `InvalidState` |
//! | Database (query cancelled) | `57014` | `Cancelled` |
//! | RowNotFound | N/A | `NotFound` |
//! | PoolTimedOut | N/A | `Timeout` |
//! | anything else | N/A | [`classify_driver_error`] on the message |

use std::marker::PhantomData;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use sqlx::postgres::PgDatabaseError;
use sqlx::{PgPool, Row};
use tracing::instrument;

use super::{Document, DocumentStore, StoreError, classify_driver_error};

pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS documents (
    collection TEXT NOT NULL,
    id TEXT NOT NULL,
    version BIGINT NOT NULL CHECK (version >= 0),
    body JSONB NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    PRIMARY KEY (collection, id)
)
"#;

#[derive(Debug, Clone)]
pub struct PostgresDocumentStore<D> {
    pool: PgPool,
    _document: PhantomData<fn() -> D>,
}

impl<D> PostgresDocumentStore<D> {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            _document: PhantomData,
        }
    }

    /// Create the `documents` table if it does not exist yet.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("documents", "schema", e))?;
        Ok(())
    }
}

#[async_trait]
impl<D> DocumentStore<D> for PostgresDocumentStore<D>
where
    D: Document + Serialize + DeserializeOwned,
{
    #[instrument(skip(self), fields(collection = D::COLLECTION, id = %id), err)]
    async fn find_by_id(&self, id: &D::Id) -> Result<D, StoreError> {
        let key = id.to_string();
        let row = sqlx::query(
            r#"
            SELECT body
            FROM documents
            WHERE collection = $1 AND id = $2
            "#,
        )
        .bind(D::COLLECTION)
        .bind(&key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error(D::COLLECTION, &key, e))?
        .ok_or_else(|| StoreError::not_found(D::COLLECTION, &key))?;

        let body: JsonValue = row
            .try_get("body")
            .map_err(|e| map_sqlx_error(D::COLLECTION, &key, e))?;
        serde_json::from_value(body).map_err(|e| StoreError::InvalidState {
            entity: D::COLLECTION.to_string(),
            details: format!("stored body of {key} does not decode: {e}"),
        })
    }

    #[instrument(skip_all, fields(collection = D::COLLECTION, id = %document.id()), err)]
    async fn insert(&self, document: &D) -> Result<(), StoreError> {
        let key = document.id().to_string();
        let (body, version) = encode(document, &key)?;

        sqlx::query(
            r#"
            INSERT INTO documents (collection, id, version, body)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(D::COLLECTION)
        .bind(&key)
        .bind(version)
        .bind(body)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error(D::COLLECTION, &key, e))?;
        Ok(())
    }

    #[instrument(skip_all, fields(collection = D::COLLECTION, id = %document.id(), expected_version = expected_version), err)]
    async fn update_if_version(&self, document: &D, expected_version: u64) -> Result<u64, StoreError> {
        let key = document.id().to_string();
        let (body, version) = encode(document, &key)?;
        let expected = to_db_version(expected_version, &key)?;

        let result = sqlx::query(
            r#"
            UPDATE documents
            SET body = $3, version = $4, updated_at = NOW()
            WHERE collection = $1 AND id = $2 AND version = $5
            "#,
        )
        .bind(D::COLLECTION)
        .bind(&key)
        .bind(body)
        .bind(version)
        .bind(expected)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error(D::COLLECTION, &key, e))?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self), fields(collection = D::COLLECTION, id = %id), err)]
    async fn remove(&self, id: &D::Id) -> Result<(), StoreError> {
        let key = id.to_string();
        let result = sqlx::query("DELETE FROM documents WHERE collection = $1 AND id = $2")
            .bind(D::COLLECTION)
            .bind(&key)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error(D::COLLECTION, &key, e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::not_found(D::COLLECTION, &key));
        }
        Ok(())
    }
}

fn encode<D: Document + Serialize>(document: &D, key: &str) -> Result<(JsonValue, i64), StoreError> {
    let body = serde_json::to_value(document).map_err(|e| StoreError::InvalidState {
        entity: D::COLLECTION.to_string(),
        details: format!("{key} does not encode: {e}"),
    })?;
    Ok((body, to_db_version(document.version(), key)?))
}

fn to_db_version(version: u64, key: &str) -> Result<i64, StoreError> {
    i64::try_from(version).map_err(|_| StoreError::InvalidState {
        entity: "documents".to_string(),
        details: format!("version {version} of {key} is out of range"),
    })
}

fn map_sqlx_error(entity: &str, key: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            // Postgres keeps the offending key in the detail, not the message.
            let detail = db_err
                .try_downcast_ref::<PgDatabaseError>()
                .and_then(PgDatabaseError::detail)
                .map(str::to_string);
            let message = match &detail {
                Some(detail) => format!("{} {}", db_err.message(), detail),
                None => db_err.message().to_string(),
            };

            match db_err.code().as_deref() {
                Some("23505") => classify_driver_error(&format!("duplicate key {message}"), entity, key),
                Some("23514") | Some("23502") | Some("22P02") => StoreError::InvalidState {
                    entity: entity.to_string(),
                    details: message,
                },
                Some("57014") => StoreError::Cancelled {
                    entity: entity.to_string(),
                    key: key.to_string(),
                },
                _ => classify_driver_error(&message, entity, key),
            }
        }
        sqlx::Error::RowNotFound => StoreError::not_found(entity, key),
        sqlx::Error::PoolTimedOut => StoreError::Timeout {
            entity: entity.to_string(),
            key: key.to_string(),
        },
        other => classify_driver_error(&other.to_string(), entity, key),
    }
}
