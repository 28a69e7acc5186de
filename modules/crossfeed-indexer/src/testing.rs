//! Test doubles: an in-memory source feed and a record index that fails on
//! demand. No network, no database.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use crossfeed_common::{
    hash_id, split_uri, Cursor, EventKind, IndexerError, RawEvent, Record, SourceId, UserId,
};
use crossfeed_store::{MemoryRecordIndex, RecordIndex};

use crate::registry::Source;
use crate::stream::{SourceClient, StreamBatch};

// ---------------------------------------------------------------------------
// FakeSourceClient
// ---------------------------------------------------------------------------

/// One fetch as the source saw it.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchRequest {
    pub source: SourceId,
    pub users: Vec<(UserId, Option<Cursor>)>,
}

#[derive(Default)]
struct FeedState {
    feeds: HashMap<SourceId, Vec<RawEvent>>,
    next_cursor: HashMap<SourceId, u64>,
    bodies: HashMap<(SourceId, String), Vec<u8>>,
    unreachable: HashSet<SourceId>,
    requests: Vec<FetchRequest>,
}

/// Simulates sources with an append-only feed and numeric cursors.
///
/// `fetch_events` returns, in feed order, every event after each requested
/// user's cursor, exactly like a real source would.
#[derive(Default)]
pub struct FakeSourceClient {
    state: Mutex<FeedState>,
}

impl FakeSourceClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, FeedState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append a write and serve `body` at `uri`. Returns the event's cursor.
    pub fn put(&self, source: &SourceId, uri: &str, body: serde_json::Value) -> Cursor {
        let bytes = body.to_string().into_bytes();
        let fingerprint = hash_id(&bytes);
        let mut state = self.state();
        state
            .bodies
            .insert((source.clone(), uri.to_string()), bytes);
        Self::append(&mut state, source, EventKind::Write, uri, Some(fingerprint))
    }

    /// Append a delete and stop serving `uri`. Returns the event's cursor.
    pub fn delete(&self, source: &SourceId, uri: &str) -> Cursor {
        let mut state = self.state();
        state.bodies.remove(&(source.clone(), uri.to_string()));
        Self::append(&mut state, source, EventKind::Delete, uri, None)
    }

    fn append(
        state: &mut FeedState,
        source: &SourceId,
        kind: EventKind,
        uri: &str,
        content_hash: Option<String>,
    ) -> Cursor {
        let counter = state.next_cursor.entry(source.clone()).or_insert(0);
        *counter += 1;
        let cursor = Cursor::new(counter.to_string());
        let user = split_uri(uri)
            .map(|(user, _)| user)
            .unwrap_or_else(|| UserId::new(""));

        state.feeds.entry(source.clone()).or_default().push(RawEvent {
            kind,
            uri: uri.to_string(),
            user,
            cursor: cursor.clone(),
            content_hash,
        });
        cursor
    }

    pub fn set_unreachable(&self, source: &SourceId, unreachable: bool) {
        let mut state = self.state();
        if unreachable {
            state.unreachable.insert(source.clone());
        } else {
            state.unreachable.remove(source);
        }
    }

    pub fn requests(&self) -> Vec<FetchRequest> {
        self.state().requests.clone()
    }
}

#[async_trait]
impl SourceClient for FakeSourceClient {
    async fn fetch_events(
        &self,
        source: &Source,
        users: &[(UserId, Option<Cursor>)],
    ) -> Result<StreamBatch, IndexerError> {
        let mut state = self.state();
        state.requests.push(FetchRequest {
            source: source.id.clone(),
            users: users.to_vec(),
        });

        if state.unreachable.contains(&source.id) {
            return Err(IndexerError::SourceUnreachable {
                source_id: source.id.to_string(),
                reason: "connection refused".to_string(),
            });
        }

        let after: HashMap<&UserId, Option<&Cursor>> =
            users.iter().map(|(u, c)| (u, c.as_ref())).collect();

        let events = state
            .feeds
            .get(&source.id)
            .map(|feed| {
                feed.iter()
                    .filter(|e| match after.get(&e.user) {
                        Some(Some(cursor)) => e.cursor.is_after(cursor),
                        Some(None) => true,
                        None => false,
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        Ok(StreamBatch::from_events(source, users, events))
    }

    async fn fetch_resource(
        &self,
        source: &Source,
        user: &UserId,
        path: &str,
    ) -> Result<Vec<u8>, IndexerError> {
        let state = self.state();
        if state.unreachable.contains(&source.id) {
            return Err(IndexerError::SourceUnreachable {
                source_id: source.id.to_string(),
                reason: "connection refused".to_string(),
            });
        }
        let uri = format!("pubky://{user}{path}");
        state
            .bodies
            .get(&(source.id.clone(), uri.clone()))
            .cloned()
            .ok_or(IndexerError::ResourceGone { uri })
    }
}

// ---------------------------------------------------------------------------
// FlakyRecordIndex
// ---------------------------------------------------------------------------

/// Memory index that rejects upserts once a budget of successful ones is spent.
pub struct FlakyRecordIndex {
    inner: Arc<MemoryRecordIndex>,
    remaining: AtomicUsize,
}

impl FlakyRecordIndex {
    /// Allow `successes` upserts, then fail every following one.
    pub fn failing_after(inner: Arc<MemoryRecordIndex>, successes: usize) -> Self {
        Self {
            inner,
            remaining: AtomicUsize::new(successes),
        }
    }

    /// Stop failing.
    pub fn heal(&self) {
        self.remaining.store(usize::MAX, Ordering::SeqCst);
    }
}

#[async_trait]
impl RecordIndex for FlakyRecordIndex {
    async fn upsert(&self, record: Record) -> Result<()> {
        let allowed = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if !allowed {
            return Err(anyhow!("index rejected write for {}", record.identifier));
        }
        self.inner.upsert(record).await
    }

    async fn tombstone(&self, user: &UserId, identifier: &str, cursor: &Cursor) -> Result<bool> {
        self.inner.tombstone(user, identifier, cursor).await
    }

    async fn get_by_identifier(&self, user: &UserId, identifier: &str) -> Result<Option<Record>> {
        self.inner.get_by_identifier(user, identifier).await
    }

    async fn list_active(&self, user: &UserId) -> Result<Vec<Record>> {
        self.inner.list_active(user).await
    }
}
