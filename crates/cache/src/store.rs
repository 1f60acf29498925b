//! Keyed, versioned record store.
//!
//! Each record is a JSON document tagged with the schema version its writer
//! used. Readers name the version they understand; anything else is refused
//! instead of being half-parsed.

use crate::Database;
use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::SqlitePool;
use time::OffsetDateTime;

#[derive(sqlx::FromRow)]
struct ProgressRow {
    key: String,
    schema_version: i64,
    payload: String,
    updated_at: i64,
}

/// A record read back from the store, with its bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct Stored<T> {
    pub record: T,
    pub updated_at: OffsetDateTime,
}

/// Durable mirror of discovery progress.
///
/// Every save is an upsert in its own transaction, so a crash leaves either
/// the previous or the new record, never a mix.
#[derive(Debug, Clone)]
pub struct ProgressStore {
    pool: SqlitePool,
    dry_run: bool,
}
impl From<&Database> for ProgressStore {
    fn from(db: &Database) -> Self {
        Self { pool: db.pool().clone(), dry_run: false }
    }
}
impl ProgressStore {
    /// Create a new store with the given connection pool.
    pub fn new(pool: SqlitePool, dry_run: bool) -> Self {
        Self { pool, dry_run }
    }

    /// Load the record stored under `key`.
    ///
    /// Returns [`ErrorKind::UnsupportedVersion`] if the record was written
    /// with a different schema version than `schema_version`.
    pub async fn load<T: DeserializeOwned>(&self, key: &str, schema_version: u32) -> Result<Option<Stored<T>>> {
        let row: Option<ProgressRow> = sqlx::query_as(include_str!("../queries/get_progress.sql"))
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        let Some(row) = row else {
            return Ok(None);
        };
        let found = u32::try_from(row.schema_version).or_raise(|| ErrorKind::InvalidData("schema version"))?;
        if found != schema_version {
            exn::bail!(ErrorKind::UnsupportedVersion {
                key: row.key,
                found,
                expected: schema_version,
            });
        }
        let record = serde_json::from_str(&row.payload).or_raise(|| ErrorKind::InvalidData("payload"))?;
        let updated_at =
            OffsetDateTime::from_unix_timestamp(row.updated_at).or_raise(|| ErrorKind::InvalidData("updated at"))?;
        Ok(Some(Stored { record, updated_at }))
    }

    /// Insert or replace the record stored under `key`.
    pub async fn save<T: Serialize>(&self, key: &str, schema_version: u32, record: &T) -> Result<()> {
        if self.dry_run {
            return Ok(());
        }
        let payload = serde_json::to_string(record).or_raise(|| ErrorKind::InvalidData("payload"))?;
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let mut tx = self.pool.begin().await.or_raise(|| ErrorKind::Database)?;
        sqlx::query(include_str!("../queries/upsert_progress.sql"))
            .bind(key)
            .bind(i64::from(schema_version))
            .bind(payload)
            .bind(now)
            .execute(&mut *tx)
            .await
            .or_raise(|| ErrorKind::Database)?;
        tx.commit().await.or_raise(|| ErrorKind::Database)?;
        Ok(())
    }

    /// Remove the record stored under `key`. Returns `true` if one existed.
    pub async fn clear(&self, key: &str) -> Result<bool> {
        if self.dry_run {
            return Ok(false);
        }
        let result = sqlx::query(include_str!("../queries/delete_progress.sql"))
            .bind(key)
            .execute(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(result.rows_affected() > 0)
    }

    /// All keys currently stored, sorted.
    pub async fn keys(&self) -> Result<Vec<String>> {
        let keys: Vec<String> = sqlx::query_scalar(include_str!("../queries/list_progress_keys.sql"))
            .fetch_all(&self.pool)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(keys)
    }
}
