//! Cursor Store: the last fully-applied feed position per (source, user).
//!
//! `set` is atomic per key. Nothing spans keys: a poller commits each of its
//! users' cursors independently once the whole batch has been applied.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use crossfeed_common::{Cursor, SourceId, UserId};
use sqlx::PgPool;

#[async_trait]
pub trait CursorStore: Send + Sync {
    async fn get(&self, source: &SourceId, user: &UserId) -> Result<Option<Cursor>>;

    /// Store a cursor. Callers only pass values the source returned for this user.
    async fn set(&self, source: &SourceId, user: &UserId, cursor: &Cursor) -> Result<()>;

    /// Forget the cursor so the next poll resyncs this user from the beginning.
    async fn reset(&self, source: &SourceId, user: &UserId) -> Result<()>;

    /// Drop every cursor held for a source (deregistration).
    async fn drop_source(&self, source: &SourceId) -> Result<()>;
}

// ---------------------------------------------------------------------------
// PgCursorStore (production)
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct PgCursorStore {
    pool: PgPool,
}

impl PgCursorStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CursorStore for PgCursorStore {
    async fn get(&self, source: &SourceId, user: &UserId) -> Result<Option<Cursor>> {
        let row = sqlx::query_scalar::<_, String>(
            r#"
            SELECT cursor FROM cursors
            WHERE source_id = $1 AND user_id = $2
            "#,
        )
        .bind(source.as_str())
        .bind(user.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Cursor::new))
    }

    async fn set(&self, source: &SourceId, user: &UserId, cursor: &Cursor) -> Result<()> {
        // Single-statement upsert: atomic per (source_id, user_id).
        sqlx::query(
            r#"
            INSERT INTO cursors (source_id, user_id, cursor)
            VALUES ($1, $2, $3)
            ON CONFLICT (source_id, user_id)
            DO UPDATE SET cursor = EXCLUDED.cursor, updated_at = now()
            "#,
        )
        .bind(source.as_str())
        .bind(user.as_str())
        .bind(cursor.as_str())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn reset(&self, source: &SourceId, user: &UserId) -> Result<()> {
        sqlx::query("DELETE FROM cursors WHERE source_id = $1 AND user_id = $2")
            .bind(source.as_str())
            .bind(user.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn drop_source(&self, source: &SourceId) -> Result<()> {
        sqlx::query("DELETE FROM cursors WHERE source_id = $1")
            .bind(source.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryCursorStore (tests, database-less runs)
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryCursorStore {
    cursors: Mutex<HashMap<(SourceId, UserId), Cursor>>,
}

impl MemoryCursorStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<(SourceId, UserId), Cursor>>> {
        self.cursors
            .lock()
            .map_err(|_| anyhow!("cursor store lock poisoned"))
    }

    /// Every stored cursor (for test assertions).
    pub fn snapshot(&self) -> Result<HashMap<(SourceId, UserId), Cursor>> {
        Ok(self.lock()?.clone())
    }
}

#[async_trait]
impl CursorStore for MemoryCursorStore {
    async fn get(&self, source: &SourceId, user: &UserId) -> Result<Option<Cursor>> {
        Ok(self.lock()?.get(&(source.clone(), user.clone())).cloned())
    }

    async fn set(&self, source: &SourceId, user: &UserId, cursor: &Cursor) -> Result<()> {
        self.lock()?
            .insert((source.clone(), user.clone()), cursor.clone());
        Ok(())
    }

    async fn reset(&self, source: &SourceId, user: &UserId) -> Result<()> {
        self.lock()?.remove(&(source.clone(), user.clone()));
        Ok(())
    }

    async fn drop_source(&self, source: &SourceId) -> Result<()> {
        self.lock()?.retain(|(s, _), _| s != source);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Arc<S> blanket, so tests can keep a handle for assertions
// ---------------------------------------------------------------------------

#[async_trait]
impl<S: CursorStore + ?Sized> CursorStore for Arc<S> {
    async fn get(&self, source: &SourceId, user: &UserId) -> Result<Option<Cursor>> {
        (**self).get(source, user).await
    }

    async fn set(&self, source: &SourceId, user: &UserId, cursor: &Cursor) -> Result<()> {
        (**self).set(source, user, cursor).await
    }

    async fn reset(&self, source: &SourceId, user: &UserId) -> Result<()> {
        (**self).reset(source, user).await
    }

    async fn drop_source(&self, source: &SourceId) -> Result<()> {
        (**self).drop_source(source).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> (SourceId, UserId) {
        (SourceId::new("home-1"), UserId::new("userA"))
    }

    #[tokio::test]
    async fn missing_cursor_is_none() {
        let store = MemoryCursorStore::new();
        let (source, user) = key();
        assert_eq!(store.get(&source, &user).await.unwrap(), None);
    }

    #[tokio::test]
    async fn set_replaces_previous_value() {
        let store = MemoryCursorStore::new();
        let (source, user) = key();
        store.set(&source, &user, &Cursor::new("5")).await.unwrap();
        store.set(&source, &user, &Cursor::new("6")).await.unwrap();
        assert_eq!(
            store.get(&source, &user).await.unwrap(),
            Some(Cursor::new("6"))
        );
    }

    #[tokio::test]
    async fn reset_forces_full_resync() {
        let store = MemoryCursorStore::new();
        let (source, user) = key();
        store.set(&source, &user, &Cursor::new("5")).await.unwrap();
        store.reset(&source, &user).await.unwrap();
        assert_eq!(store.get(&source, &user).await.unwrap(), None);
    }

    #[tokio::test]
    async fn drop_source_keeps_other_sources() {
        let store = MemoryCursorStore::new();
        let user = UserId::new("userA");
        store
            .set(&SourceId::new("a"), &user, &Cursor::new("1"))
            .await
            .unwrap();
        store
            .set(&SourceId::new("b"), &user, &Cursor::new("2"))
            .await
            .unwrap();

        store.drop_source(&SourceId::new("a")).await.unwrap();

        assert_eq!(store.get(&SourceId::new("a"), &user).await.unwrap(), None);
        assert_eq!(
            store.get(&SourceId::new("b"), &user).await.unwrap(),
            Some(Cursor::new("2"))
        );
    }

    #[tokio::test]
    async fn concurrent_sets_on_distinct_users_all_land() {
        let store = Arc::new(MemoryCursorStore::new());
        let source = SourceId::new("home-1");

        let mut handles = Vec::new();
        for i in 0..32 {
            let store = store.clone();
            let source = source.clone();
            handles.push(tokio::spawn(async move {
                let user = UserId::new(format!("user{i}"));
                store
                    .set(&source, &user, &Cursor::new(i.to_string()))
                    .await
                    .unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(store.snapshot().unwrap().len(), 32);
    }
}
