//! Apply Engine: idempotent upsert / tombstone of normalized events.
//!
//! Applying the same event twice leaves the index exactly as applying it once:
//! records are keyed by (user, identifier), never appended, and hash
//! identifiers are recomputed from content rather than minted.

use std::sync::Arc;

use crossfeed_common::{
    canonical_hash_id, decode_timestamp_id, encode_timestamp_id, hash_id, Event, EventKind,
    IdFamily, IndexerError, Record, ResourceKind, SoftDeleteConfig, SourceId,
};
use crossfeed_store::RecordIndex;
use serde_json::Value;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Upserted,
    /// Feed-level delete of an indexed record.
    Tombstoned,
    /// A write carrying the deletion sentinel.
    SoftDeleted,
    /// Delete for a record that was never indexed.
    NotIndexed,
    /// Write whose body was already gone when fetched.
    Vanished,
}

// ---------------------------------------------------------------------------
// Soft-delete policy
// ---------------------------------------------------------------------------

/// Decides whether a written payload is really a deletion.
///
/// A resource whose real content happens to equal the sentinel is
/// indistinguishable from a deletion under this policy.
#[derive(Debug, Clone)]
pub struct SoftDeletePolicy {
    sentinel: String,
    fields: Vec<String>,
}

impl SoftDeletePolicy {
    pub fn new(sentinel: impl Into<String>, fields: Vec<String>) -> Self {
        Self {
            sentinel: sentinel.into(),
            fields,
        }
    }

    pub fn from_config(config: &SoftDeleteConfig) -> Self {
        Self::new(config.sentinel.clone(), config.fields.clone())
    }

    pub fn is_soft_deleted(&self, payload: &Value) -> bool {
        self.fields
            .iter()
            .any(|field| payload.get(field).and_then(Value::as_str) == Some(self.sentinel.as_str()))
    }
}

impl Default for SoftDeletePolicy {
    fn default() -> Self {
        Self::from_config(&SoftDeleteConfig::default())
    }
}

// ---------------------------------------------------------------------------
// ApplyEngine
// ---------------------------------------------------------------------------

pub struct ApplyEngine {
    index: Arc<dyn RecordIndex>,
    policy: SoftDeletePolicy,
}

impl ApplyEngine {
    pub fn new(index: Arc<dyn RecordIndex>, policy: SoftDeletePolicy) -> Self {
        Self { index, policy }
    }

    /// Apply one event. `body` is the fetched resource content for writes.
    ///
    /// `ApplyFailure` means the index rejected the write and the batch must be
    /// retried; every other error is a per-event skip.
    pub async fn apply(
        &self,
        source: &SourceId,
        event: &Event,
        body: Option<&[u8]>,
    ) -> Result<ApplyOutcome, IndexerError> {
        match event.kind {
            EventKind::Write => {
                let body = body.ok_or_else(|| IndexerError::MalformedPayload {
                    uri: event.uri.clone(),
                    reason: "write without a body".to_string(),
                })?;
                let payload: Value =
                    serde_json::from_slice(body).map_err(|e| IndexerError::MalformedPayload {
                        uri: event.uri.clone(),
                        reason: e.to_string(),
                    })?;
                self.apply_write(source, event, payload).await
            }
            EventKind::Delete => self.apply_delete(event).await,
        }
    }

    /// Apply a write whose body the source no longer serves. The resource was
    /// deleted after the event was emitted, so it is recorded as a tombstone.
    pub async fn apply_vanished(
        &self,
        source: &SourceId,
        event: &Event,
    ) -> Result<ApplyOutcome, IndexerError> {
        let identifier = resolve_identifier(event, None)?;
        self.tombstone_or_insert(source, event, &identifier, Value::Null)
            .await?;
        debug!(user = %event.user, identifier = %identifier, "Write vanished before fetch");
        Ok(ApplyOutcome::Vanished)
    }

    async fn tombstone_or_insert(
        &self,
        source: &SourceId,
        event: &Event,
        identifier: &str,
        payload: Value,
    ) -> Result<(), IndexerError> {
        let existed = self
            .index
            .tombstone(&event.user, identifier, &event.cursor)
            .await
            .map_err(apply_failure)?;
        // Never seen before: keep a tombstone so later references resolve.
        if !existed {
            self.index
                .upsert(Record {
                    user_id: event.user.clone(),
                    identifier: identifier.to_string(),
                    source_id: source.clone(),
                    kind: event.resource.kind,
                    payload,
                    fingerprint: event.fingerprint.clone(),
                    tombstoned: true,
                    cursor: event.cursor.clone(),
                })
                .await
                .map_err(apply_failure)?;
        }
        Ok(())
    }

    async fn apply_write(
        &self,
        source: &SourceId,
        event: &Event,
        payload: Value,
    ) -> Result<ApplyOutcome, IndexerError> {
        let identifier = resolve_identifier(event, Some(&payload))?;

        if self.policy.is_soft_deleted(&payload) {
            self.tombstone_or_insert(source, event, &identifier, payload)
                .await?;
            debug!(user = %event.user, identifier = %identifier, "Soft-deleted via sentinel");
            return Ok(ApplyOutcome::SoftDeleted);
        }

        self.index
            .upsert(Record {
                user_id: event.user.clone(),
                identifier: identifier.clone(),
                source_id: source.clone(),
                kind: event.resource.kind,
                payload,
                fingerprint: event.fingerprint.clone(),
                tombstoned: false,
                cursor: event.cursor.clone(),
            })
            .await
            .map_err(apply_failure)?;

        debug!(user = %event.user, identifier = %identifier, kind = %event.resource.kind, "Upserted record");
        Ok(ApplyOutcome::Upserted)
    }

    async fn apply_delete(&self, event: &Event) -> Result<ApplyOutcome, IndexerError> {
        let identifier = resolve_identifier(event, None)?;
        let existed = self
            .index
            .tombstone(&event.user, &identifier, &event.cursor)
            .await
            .map_err(apply_failure)?;

        if existed {
            debug!(user = %event.user, identifier = %identifier, "Tombstoned record");
            Ok(ApplyOutcome::Tombstoned)
        } else {
            debug!(user = %event.user, identifier = %identifier, "Delete for a record that was never indexed");
            Ok(ApplyOutcome::NotIndexed)
        }
    }
}

fn apply_failure(e: anyhow::Error) -> IndexerError {
    IndexerError::ApplyFailure(format!("{e:#}"))
}

// ---------------------------------------------------------------------------
// Identifier resolution
// ---------------------------------------------------------------------------

/// Canonical record identifier for an event.
///
/// Timestamp ids are decoded and re-encoded and hash ids are respelled, so
/// folded spellings map to one key. Hash ids are also recomputed from the
/// payload when there is one and must match the path; deletes carry no
/// payload, so only the shape is checked.
pub fn resolve_identifier(event: &Event, payload: Option<&Value>) -> Result<String, IndexerError> {
    let path_id = &event.resource.id;
    match event.resource.kind.family() {
        IdFamily::Timestamp => Ok(encode_timestamp_id(decode_timestamp_id(path_id)?)),
        IdFamily::Hash => {
            let canonical = canonical_hash_id(path_id)?;
            if let Some(payload) = payload {
                let computed = hash_id(identity_bytes(event, payload)?.as_bytes());
                if computed != canonical {
                    return Err(IndexerError::MalformedId(format!(
                        "{path_id} does not match content (expected {computed})"
                    )));
                }
            }
            Ok(canonical)
        }
        IdFamily::Singleton => Ok(path_id.clone()),
    }
}

/// Canonical serialization of the identity-bearing fields of a hash-identified
/// resource.
fn identity_bytes(event: &Event, payload: &Value) -> Result<String, IndexerError> {
    let field = |name: &str| {
        payload
            .get(name)
            .and_then(Value::as_str)
            .ok_or_else(|| IndexerError::MalformedPayload {
                uri: event.uri.clone(),
                reason: format!("missing string field {name:?}"),
            })
    };

    match event.resource.kind {
        ResourceKind::Tag => Ok(format!("{}:{}", field("uri")?, field("label")?)),
        ResourceKind::Bookmark => Ok(field("uri")?.to_string()),
        other => Err(IndexerError::UnrecognizedResourceKind(format!(
            "{other} is not hash-identified"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossfeed_common::{Cursor, ResourceRef, UserId};
    use crossfeed_store::MemoryRecordIndex;
    use serde_json::json;

    const POST_ID: &str = "0032SSN7Q4EVG";

    fn event(kind: EventKind, resource: ResourceKind, id: &str, cursor: &str) -> Event {
        let collection = match resource {
            ResourceKind::Post => "posts",
            ResourceKind::File => "files",
            ResourceKind::Tag => "tags",
            ResourceKind::Bookmark => "bookmarks",
            ResourceKind::Profile => "profile.json",
        };
        let path = format!("/pub/pubky.app/{collection}/{id}");
        Event {
            kind,
            user: UserId::new("userA"),
            uri: format!("pubky://userA{path}"),
            path,
            resource: ResourceRef {
                kind: resource,
                app: "pubky.app".to_string(),
                id: id.to_string(),
            },
            cursor: Cursor::new(cursor),
            fingerprint: matches!(kind, EventKind::Write).then(|| format!("h{cursor}")),
        }
    }

    fn engine() -> (ApplyEngine, Arc<MemoryRecordIndex>) {
        let index = Arc::new(MemoryRecordIndex::new());
        (
            ApplyEngine::new(index.clone(), SoftDeletePolicy::default()),
            index,
        )
    }

    fn source() -> SourceId {
        SourceId::new("home-1")
    }

    #[tokio::test]
    async fn write_upserts_record() {
        let (engine, index) = engine();
        let body = json!({ "content": "hello" }).to_string();

        let outcome = engine
            .apply(
                &source(),
                &event(EventKind::Write, ResourceKind::Post, POST_ID, "5"),
                Some(body.as_bytes()),
            )
            .await
            .unwrap();

        assert_eq!(outcome, ApplyOutcome::Upserted);
        let record = index
            .get_by_identifier(&UserId::new("userA"), POST_ID)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.payload, json!({ "content": "hello" }));
        assert_eq!(record.fingerprint.as_deref(), Some("h5"));
        assert_eq!(record.kind, ResourceKind::Post);
        assert!(!record.tombstoned);
    }

    #[tokio::test]
    async fn write_then_delete_tombstones() {
        let (engine, index) = engine();
        let body = json!({ "content": "hello" }).to_string();
        engine
            .apply(
                &source(),
                &event(EventKind::Write, ResourceKind::Post, POST_ID, "5"),
                Some(body.as_bytes()),
            )
            .await
            .unwrap();

        let outcome = engine
            .apply(
                &source(),
                &event(EventKind::Delete, ResourceKind::Post, POST_ID, "6"),
                None,
            )
            .await
            .unwrap();

        assert_eq!(outcome, ApplyOutcome::Tombstoned);
        let record = index
            .get_by_identifier(&UserId::new("userA"), POST_ID)
            .await
            .unwrap()
            .unwrap();
        assert!(record.tombstoned);
        assert_eq!(record.payload, json!({ "content": "hello" }));
        assert_eq!(record.cursor, Cursor::new("6"));
    }

    #[tokio::test]
    async fn sentinel_title_produces_tombstone() {
        let (engine, index) = engine();
        let body = json!({ "title": "[DELETED]" }).to_string();

        let outcome = engine
            .apply(
                &source(),
                &event(EventKind::Write, ResourceKind::Post, POST_ID, "5"),
                Some(body.as_bytes()),
            )
            .await
            .unwrap();

        assert_eq!(outcome, ApplyOutcome::SoftDeleted);
        let record = index
            .get_by_identifier(&UserId::new("userA"), POST_ID)
            .await
            .unwrap()
            .unwrap();
        assert!(record.tombstoned);
        assert!(index
            .list_active(&UserId::new("userA"))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn sentinel_keeps_previous_content() {
        let (engine, index) = engine();
        let original = json!({ "content": "hello" }).to_string();
        let deleted = json!({ "content": "[DELETED]" }).to_string();
        engine
            .apply(
                &source(),
                &event(EventKind::Write, ResourceKind::Post, POST_ID, "5"),
                Some(original.as_bytes()),
            )
            .await
            .unwrap();
        engine
            .apply(
                &source(),
                &event(EventKind::Write, ResourceKind::Post, POST_ID, "6"),
                Some(deleted.as_bytes()),
            )
            .await
            .unwrap();

        let record = index
            .get_by_identifier(&UserId::new("userA"), POST_ID)
            .await
            .unwrap()
            .unwrap();
        assert!(record.tombstoned);
        assert_eq!(record.payload, json!({ "content": "hello" }));
    }

    #[test]
    fn policy_only_checks_configured_fields() {
        let policy = SoftDeletePolicy::new("[GONE]", vec!["title".to_string()]);
        assert!(policy.is_soft_deleted(&json!({ "title": "[GONE]" })));
        assert!(!policy.is_soft_deleted(&json!({ "content": "[GONE]" })));
        assert!(!policy.is_soft_deleted(&json!({ "title": "[GONE] but not really" })));
        assert!(!policy.is_soft_deleted(&json!(["[GONE]"])));
    }

    #[tokio::test]
    async fn tag_identifier_must_match_content() {
        let (engine, index) = engine();
        let uri = "pubky://userB/pub/pubky.app/posts/0032SSN7Q4EVG";
        let id = hash_id(format!("{uri}:rust").as_bytes());
        let body = json!({ "uri": uri, "label": "rust" }).to_string();

        let outcome = engine
            .apply(
                &source(),
                &event(EventKind::Write, ResourceKind::Tag, &id, "1"),
                Some(body.as_bytes()),
            )
            .await
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Upserted);

        let wrong = json!({ "uri": uri, "label": "go" }).to_string();
        let err = engine
            .apply(
                &source(),
                &event(EventKind::Write, ResourceKind::Tag, &id, "2"),
                Some(wrong.as_bytes()),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, IndexerError::MalformedId(_)));

        let record = index
            .get_by_identifier(&UserId::new("userA"), &id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.payload["label"], "rust");
    }

    #[tokio::test]
    async fn bookmark_identifier_is_hash_of_uri() {
        let (engine, _) = engine();
        let uri = "pubky://userB/pub/pubky.app/posts/0032SSN7Q4EVG";
        let id = hash_id(uri.as_bytes());
        let body = json!({ "uri": uri }).to_string();

        let outcome = engine
            .apply(
                &source(),
                &event(EventKind::Write, ResourceKind::Bookmark, &id, "1"),
                Some(body.as_bytes()),
            )
            .await
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Upserted);
    }

    #[tokio::test]
    async fn folded_hash_spelling_maps_to_one_record() {
        let (engine, index) = engine();
        let uri = "pubky://userB/pub/pubky.app/posts/0032SSN7Q4EVG";
        let id = hash_id(format!("{uri}:rust").as_bytes());
        let sloppy: String = id
            .chars()
            .map(|c| match c {
                '0' => 'O',
                '1' => 'I',
                other => other.to_ascii_lowercase(),
            })
            .collect();
        let body = json!({ "uri": uri, "label": "rust" }).to_string();

        let outcome = engine
            .apply(
                &source(),
                &event(EventKind::Write, ResourceKind::Tag, &sloppy, "1"),
                Some(body.as_bytes()),
            )
            .await
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Upserted);

        let outcome = engine
            .apply(
                &source(),
                &event(EventKind::Delete, ResourceKind::Tag, &id, "2"),
                None,
            )
            .await
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Tombstoned);

        let all = index.all().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].identifier, id);
        assert!(all[0].tombstoned);
    }

    #[tokio::test]
    async fn malformed_timestamp_id_is_rejected() {
        let (engine, index) = engine();
        let body = json!({ "content": "x" }).to_string();

        let err = engine
            .apply(
                &source(),
                &event(EventKind::Write, ResourceKind::Post, "0001AAAA", "1"),
                Some(body.as_bytes()),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, IndexerError::MalformedId(_)));
        assert!(!err.is_transient());
        assert!(index.all().unwrap().is_empty());
    }

    #[tokio::test]
    async fn folded_timestamp_spelling_maps_to_one_record() {
        let (engine, index) = engine();
        let body = json!({ "content": "x" }).to_string();
        engine
            .apply(
                &source(),
                &event(EventKind::Write, ResourceKind::Post, "0032ssn7q4evg", "1"),
                Some(body.as_bytes()),
            )
            .await
            .unwrap();
        engine
            .apply(
                &source(),
                &event(EventKind::Delete, ResourceKind::Post, POST_ID, "2"),
                None,
            )
            .await
            .unwrap();

        let all = index.all().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].identifier, POST_ID);
        assert!(all[0].tombstoned);
    }

    #[tokio::test]
    async fn non_json_body_is_malformed_payload() {
        let (engine, _) = engine();
        let err = engine
            .apply(
                &source(),
                &event(EventKind::Write, ResourceKind::Post, POST_ID, "1"),
                Some(b"\x89PNG"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, IndexerError::MalformedPayload { .. }));
    }

    #[tokio::test]
    async fn delete_of_unknown_record_is_not_indexed() {
        let (engine, index) = engine();
        let outcome = engine
            .apply(
                &source(),
                &event(EventKind::Delete, ResourceKind::Post, POST_ID, "1"),
                None,
            )
            .await
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::NotIndexed);
        assert!(index.all().unwrap().is_empty());
    }

    #[tokio::test]
    async fn vanished_write_leaves_tombstone() {
        let (engine, index) = engine();
        let write = event(EventKind::Write, ResourceKind::Post, POST_ID, "5");

        let outcome = engine.apply_vanished(&source(), &write).await.unwrap();
        assert_eq!(outcome, ApplyOutcome::Vanished);

        let outcome = engine
            .apply(
                &source(),
                &event(EventKind::Delete, ResourceKind::Post, POST_ID, "6"),
                None,
            )
            .await
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Tombstoned);

        let record = index
            .get_by_identifier(&UserId::new("userA"), POST_ID)
            .await
            .unwrap()
            .unwrap();
        assert!(record.tombstoned);
        assert_eq!(record.payload, Value::Null);
        assert_eq!(record.cursor, Cursor::new("6"));
    }

    #[tokio::test]
    async fn applying_twice_matches_applying_once() {
        let (engine, index) = engine();
        let write = event(EventKind::Write, ResourceKind::Post, POST_ID, "5");
        let delete = event(EventKind::Delete, ResourceKind::Post, POST_ID, "6");
        let body = json!({ "content": "hello" }).to_string();

        engine
            .apply(&source(), &write, Some(body.as_bytes()))
            .await
            .unwrap();
        engine.apply(&source(), &delete, None).await.unwrap();
        let once = index.all().unwrap();

        engine
            .apply(&source(), &write, Some(body.as_bytes()))
            .await
            .unwrap();
        engine.apply(&source(), &delete, None).await.unwrap();

        assert_eq!(index.all().unwrap(), once);
    }
}
