//! Record Index: the queryable mirror of every source's public resources.
//!
//! Records are keyed by (user_id, identifier). Writes are upserts, deletes are
//! tombstones; rows are never physically removed.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use crossfeed_common::{Cursor, Record, ResourceKind, SourceId, UserId};
use sqlx::PgPool;

#[async_trait]
pub trait RecordIndex: Send + Sync {
    /// Insert or fully replace the record at (user_id, identifier).
    async fn upsert(&self, record: Record) -> Result<()>;

    /// Mark a record deleted, keeping its payload. Returns false if no record
    /// exists at that key.
    async fn tombstone(&self, user: &UserId, identifier: &str, cursor: &Cursor) -> Result<bool>;

    async fn get_by_identifier(&self, user: &UserId, identifier: &str) -> Result<Option<Record>>;

    /// Non-tombstoned records of a user, ordered by identifier.
    async fn list_active(&self, user: &UserId) -> Result<Vec<Record>>;
}

// ---------------------------------------------------------------------------
// PgRecordIndex (production)
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct PgRecordIndex {
    pool: PgPool,
}

impl PgRecordIndex {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// A row from the records table.
#[derive(Debug, sqlx::FromRow)]
struct RecordRow {
    user_id: String,
    identifier: String,
    source_id: String,
    kind: String,
    payload: serde_json::Value,
    fingerprint: Option<String>,
    tombstoned: bool,
    cursor: String,
}

impl TryFrom<RecordRow> for Record {
    type Error = anyhow::Error;

    fn try_from(row: RecordRow) -> Result<Self> {
        let kind: ResourceKind = row.kind.parse().map_err(|e: String| anyhow!(e))?;
        Ok(Record {
            user_id: UserId::new(row.user_id),
            identifier: row.identifier,
            source_id: SourceId::new(row.source_id),
            kind,
            payload: row.payload,
            fingerprint: row.fingerprint,
            tombstoned: row.tombstoned,
            cursor: Cursor::new(row.cursor),
        })
    }
}

#[async_trait]
impl RecordIndex for PgRecordIndex {
    async fn upsert(&self, record: Record) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO records
                (user_id, identifier, source_id, kind, payload, fingerprint, tombstoned, cursor)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (user_id, identifier) DO UPDATE SET
                source_id   = EXCLUDED.source_id,
                kind        = EXCLUDED.kind,
                payload     = EXCLUDED.payload,
                fingerprint = EXCLUDED.fingerprint,
                tombstoned  = EXCLUDED.tombstoned,
                cursor      = EXCLUDED.cursor,
                updated_at  = now()
            "#,
        )
        .bind(record.user_id.as_str())
        .bind(&record.identifier)
        .bind(record.source_id.as_str())
        .bind(record.kind.as_str())
        .bind(&record.payload)
        .bind(&record.fingerprint)
        .bind(record.tombstoned)
        .bind(record.cursor.as_str())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn tombstone(&self, user: &UserId, identifier: &str, cursor: &Cursor) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE records
            SET tombstoned = TRUE, cursor = $3, updated_at = now()
            WHERE user_id = $1 AND identifier = $2
            "#,
        )
        .bind(user.as_str())
        .bind(identifier)
        .bind(cursor.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn get_by_identifier(&self, user: &UserId, identifier: &str) -> Result<Option<Record>> {
        let row = sqlx::query_as::<_, RecordRow>(
            r#"
            SELECT user_id, identifier, source_id, kind, payload, fingerprint, tombstoned, cursor
            FROM records
            WHERE user_id = $1 AND identifier = $2
            "#,
        )
        .bind(user.as_str())
        .bind(identifier)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Record::try_from).transpose()
    }

    async fn list_active(&self, user: &UserId) -> Result<Vec<Record>> {
        let rows = sqlx::query_as::<_, RecordRow>(
            r#"
            SELECT user_id, identifier, source_id, kind, payload, fingerprint, tombstoned, cursor
            FROM records
            WHERE user_id = $1 AND NOT tombstoned
            ORDER BY identifier ASC
            "#,
        )
        .bind(user.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Record::try_from).collect()
    }
}

// ---------------------------------------------------------------------------
// MemoryRecordIndex (tests, database-less runs)
// ---------------------------------------------------------------------------

type RecordKey = (UserId, String);

#[derive(Default)]
pub struct MemoryRecordIndex {
    records: Mutex<BTreeMap<RecordKey, Record>>,
}

impl MemoryRecordIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<RecordKey, Record>>> {
        self.records
            .lock()
            .map_err(|_| anyhow!("record index lock poisoned"))
    }

    /// Every record including tombstones, in key order (for test assertions).
    pub fn all(&self) -> Result<Vec<Record>> {
        Ok(self.lock()?.values().cloned().collect())
    }
}

#[async_trait]
impl RecordIndex for MemoryRecordIndex {
    async fn upsert(&self, record: Record) -> Result<()> {
        let key = (record.user_id.clone(), record.identifier.clone());
        self.lock()?.insert(key, record);
        Ok(())
    }

    async fn tombstone(&self, user: &UserId, identifier: &str, cursor: &Cursor) -> Result<bool> {
        let mut records = self.lock()?;
        match records.get_mut(&(user.clone(), identifier.to_string())) {
            Some(record) => {
                record.tombstoned = true;
                record.cursor = cursor.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn get_by_identifier(&self, user: &UserId, identifier: &str) -> Result<Option<Record>> {
        Ok(self
            .lock()?
            .get(&(user.clone(), identifier.to_string()))
            .cloned())
    }

    async fn list_active(&self, user: &UserId) -> Result<Vec<Record>> {
        Ok(self
            .lock()?
            .values()
            .filter(|r| &r.user_id == user && !r.tombstoned)
            .cloned()
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Arc<I> blanket
// ---------------------------------------------------------------------------

#[async_trait]
impl<I: RecordIndex + ?Sized> RecordIndex for Arc<I> {
    async fn upsert(&self, record: Record) -> Result<()> {
        (**self).upsert(record).await
    }

    async fn tombstone(&self, user: &UserId, identifier: &str, cursor: &Cursor) -> Result<bool> {
        (**self).tombstone(user, identifier, cursor).await
    }

    async fn get_by_identifier(&self, user: &UserId, identifier: &str) -> Result<Option<Record>> {
        (**self).get_by_identifier(user, identifier).await
    }

    async fn list_active(&self, user: &UserId) -> Result<Vec<Record>> {
        (**self).list_active(user).await
    }
}
