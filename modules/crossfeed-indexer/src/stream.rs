//! Event Stream Client: one batched change-feed request per source.
//!
//! Wire framing (shared with other implementations, so kept exact):
//!
//! ```text
//! event: PUT
//! data: pubky://<user>/<path>
//! data: <cursor>
//! data: <content hash>
//!
//! event: DEL
//! data: pubky://<user>/<path>
//! data: <cursor>
//! ```
//!
//! Events are separated by a blank line. The cursor and hash lines may carry a
//! `cursor:` / `content_hash:` label. An empty body means the caller is current.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use crossfeed_common::{split_uri, Cursor, EventKind, IndexerError, RawEvent, UserId};
use reqwest::StatusCode;
use tracing::{debug, warn};

use crate::registry::Source;

/// Events returned by one fetch, plus each requested user's cursor after it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamBatch {
    pub events: Vec<RawEvent>,
    /// For every requested user: the highest of the cursor it was requested
    /// with and every cursor seen for that user in this batch.
    pub cursors: BTreeMap<UserId, Option<Cursor>>,
}

impl StreamBatch {
    /// Assemble a batch from parsed events. Events for users that were not
    /// requested are dropped: a source never gets to move a cursor we did not
    /// hand it.
    pub fn from_events(
        source: &Source,
        requested: &[(UserId, Option<Cursor>)],
        events: Vec<RawEvent>,
    ) -> Self {
        let mut cursors: BTreeMap<UserId, Option<Cursor>> = requested.iter().cloned().collect();
        let mut kept = Vec::with_capacity(events.len());

        for event in events {
            match cursors.get_mut(&event.user) {
                Some(slot) => {
                    let advances = slot
                        .as_ref()
                        .map_or(true, |highest| event.cursor.is_after(highest));
                    if advances {
                        *slot = Some(event.cursor.clone());
                    }
                    kept.push(event);
                }
                None => {
                    warn!(
                        source = %source.id,
                        user = %event.user,
                        uri = %event.uri,
                        "Dropping event for a user that was not requested"
                    );
                }
            }
        }

        Self {
            events: kept,
            cursors,
        }
    }
}

#[async_trait]
pub trait SourceClient: Send + Sync {
    /// Fetch every event after each user's cursor in a single request.
    async fn fetch_events(
        &self,
        source: &Source,
        users: &[(UserId, Option<Cursor>)],
    ) -> Result<StreamBatch, IndexerError>;

    /// Fetch the current body of a written resource.
    async fn fetch_resource(
        &self,
        source: &Source,
        user: &UserId,
        path: &str,
    ) -> Result<Vec<u8>, IndexerError>;
}

// ---------------------------------------------------------------------------
// Framing parser
// ---------------------------------------------------------------------------

/// Parse a change-feed body. The error is a human-readable reason; callers wrap
/// it into `IndexerError::SourceProtocol` with the source id.
pub fn parse_event_stream(body: &str) -> Result<Vec<RawEvent>, String> {
    let mut events = Vec::new();
    let mut block: Vec<(usize, &str)> = Vec::new();

    for (n, line) in body.lines().enumerate() {
        if line.trim().is_empty() {
            if !block.is_empty() {
                events.push(parse_block(&block)?);
                block.clear();
            }
            continue;
        }
        // SSE comment line
        if line.starts_with(':') {
            continue;
        }
        block.push((n + 1, line));
    }
    if !block.is_empty() {
        events.push(parse_block(&block)?);
    }

    Ok(events)
}

fn parse_block(lines: &[(usize, &str)]) -> Result<RawEvent, String> {
    let mut kind: Option<EventKind> = None;
    let mut data: Vec<&str> = Vec::new();
    let first_line = lines.first().map(|(n, _)| *n).unwrap_or(0);

    for &(n, line) in lines {
        if let Some(value) = line.strip_prefix("event:") {
            if kind.is_some() {
                return Err(format!("line {n}: second event: line in one event"));
            }
            kind = Some(match value.trim() {
                "PUT" => EventKind::Write,
                "DEL" => EventKind::Delete,
                other => return Err(format!("line {n}: unknown event type {other:?}")),
            });
        } else if let Some(value) = line.strip_prefix("data:") {
            if kind.is_none() {
                return Err(format!("line {n}: data: before event:"));
            }
            data.push(value.trim());
        } else {
            return Err(format!("line {n}: expected event: or data:, got {line:?}"));
        }
    }

    let kind = kind.ok_or_else(|| format!("line {first_line}: event without event: line"))?;
    let expected = match kind {
        EventKind::Write => 3,
        EventKind::Delete => 2,
    };
    if data.len() != expected {
        return Err(format!(
            "line {first_line}: {kind:?} event needs {expected} data lines, got {}",
            data.len()
        ));
    }

    let uri = data[0];
    let (user, _) =
        split_uri(uri).ok_or_else(|| format!("line {first_line}: malformed resource uri {uri:?}"))?;

    let cursor = strip_label(data[1], &["cursor"]);
    if cursor.is_empty() {
        return Err(format!("line {first_line}: empty cursor"));
    }

    let content_hash = match kind {
        EventKind::Write => {
            let hash = strip_label(data[2], &["content_hash", "hash"]);
            if hash.is_empty() {
                return Err(format!("line {first_line}: empty content hash"));
            }
            Some(hash.to_string())
        }
        EventKind::Delete => None,
    };

    Ok(RawEvent {
        kind,
        uri: uri.to_string(),
        user,
        cursor: Cursor::new(cursor),
        content_hash,
    })
}

fn strip_label<'a>(value: &'a str, labels: &[&str]) -> &'a str {
    for label in labels {
        if let Some(rest) = value
            .strip_prefix(label)
            .and_then(|rest| rest.strip_prefix(':'))
        {
            return rest.trim();
        }
    }
    value
}

// ---------------------------------------------------------------------------
// HTTP client
// ---------------------------------------------------------------------------

pub struct HttpSourceClient {
    client: reqwest::Client,
}

impl HttpSourceClient {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent("crossfeed/0.1")
            .build()
            .context("Failed to build source HTTP client")?;
        Ok(Self { client })
    }

    fn unreachable(source: &Source, reason: impl std::fmt::Display) -> IndexerError {
        IndexerError::SourceUnreachable {
            source_id: source.id.to_string(),
            reason: reason.to_string(),
        }
    }
}

#[async_trait]
impl SourceClient for HttpSourceClient {
    async fn fetch_events(
        &self,
        source: &Source,
        users: &[(UserId, Option<Cursor>)],
    ) -> Result<StreamBatch, IndexerError> {
        let url = format!("{}/events-stream", source.address.trim_end_matches('/'));

        let mut query: Vec<(&str, String)> = Vec::with_capacity(users.len() + 1);
        query.push(("path", source.path_prefix.clone()));
        for (user, cursor) in users {
            let value = match cursor {
                Some(cursor) => format!("{user}:{cursor}"),
                None => user.to_string(),
            };
            query.push(("user", value));
        }

        let resp = self
            .client
            .get(&url)
            .query(&query)
            .send()
            .await
            .map_err(|e| Self::unreachable(source, e))?;

        let status = resp.status();
        if status.is_server_error() {
            return Err(Self::unreachable(source, format!("HTTP {status}")));
        }
        if !status.is_success() {
            return Err(IndexerError::SourceProtocol {
                source_id: source.id.to_string(),
                reason: format!("HTTP {status}"),
            });
        }

        let body = resp
            .text()
            .await
            .map_err(|e| Self::unreachable(source, e))?;
        let events = parse_event_stream(&body).map_err(|reason| IndexerError::SourceProtocol {
            source_id: source.id.to_string(),
            reason,
        })?;

        debug!(source = %source.id, users = users.len(), events = events.len(), "Fetched event stream");
        Ok(StreamBatch::from_events(source, users, events))
    }

    async fn fetch_resource(
        &self,
        source: &Source,
        user: &UserId,
        path: &str,
    ) -> Result<Vec<u8>, IndexerError> {
        let url = format!("{}/{user}{path}", source.address.trim_end_matches('/'));

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Self::unreachable(source, e))?;

        let status = resp.status();
        if status.is_success() {
            let bytes = resp
                .bytes()
                .await
                .map_err(|e| Self::unreachable(source, e))?;
            return Ok(bytes.to_vec());
        }
        // Deleted after the event was emitted; a later DEL will follow.
        if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
            return Err(IndexerError::ResourceGone { uri: url });
        }
        if status.is_server_error() {
            return Err(Self::unreachable(source, format!("HTTP {status}")));
        }
        Err(IndexerError::SourceProtocol {
            source_id: source.id.to_string(),
            reason: format!("HTTP {status} fetching {url}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossfeed_common::SourceId;

    fn source() -> Source {
        Source::new(SourceId::new("home-1"), "http://localhost:1", "/pub/")
    }

    #[test]
    fn parses_put_and_del() {
        let body = "event: PUT\n\
                    data: pubky://userA/pub/pubky.app/posts/0001\n\
                    data: 5\n\
                    data: h1\n\
                    \n\
                    event: DEL\n\
                    data: pubky://userA/pub/pubky.app/posts/0001\n\
                    data: 6\n";
        let events = parse_event_stream(body).unwrap();

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, EventKind::Write);
        assert_eq!(events[0].user, UserId::new("userA"));
        assert_eq!(events[0].cursor, Cursor::new("5"));
        assert_eq!(events[0].content_hash.as_deref(), Some("h1"));
        assert_eq!(events[1].kind, EventKind::Delete);
        assert_eq!(events[1].cursor, Cursor::new("6"));
        assert_eq!(events[1].content_hash, None);
    }

    #[test]
    fn accepts_labelled_data_lines_and_crlf() {
        let body = "event: PUT\r\ndata: pubky://userA/pub/app/posts/1\r\ndata: cursor: 42\r\ndata: content_hash: abc\r\n\r\n";
        let events = parse_event_stream(body).unwrap();
        assert_eq!(events[0].cursor, Cursor::new("42"));
        assert_eq!(events[0].content_hash.as_deref(), Some("abc"));
    }

    #[test]
    fn empty_stream_is_valid() {
        assert!(parse_event_stream("").unwrap().is_empty());
        assert!(parse_event_stream("\n\n: keep-alive\n\n").unwrap().is_empty());
    }

    #[test]
    fn rejects_bad_framing() {
        let cases = [
            "event: PATCH\ndata: pubky://u/p\ndata: 1\n",
            "data: pubky://u/p\ndata: 1\n",
            "event: DEL\ndata: pubky://u/p\n",
            "event: PUT\ndata: pubky://u/p\ndata: 1\n",
            "event: DEL\ndata: pubky://u/p\ndata: 1\ndata: extra\n",
            "event: DEL\nevent: DEL\ndata: pubky://u/p\ndata: 1\n",
            "event: DEL\ndata: not-a-uri\ndata: 1\n",
            "event: DEL\ndata: pubky://u/p\ndata: cursor:\n",
            "event: DEL\nretry: 10\ndata: pubky://u/p\ndata: 1\n",
        ];
        for body in cases {
            assert!(parse_event_stream(body).is_err(), "accepted {body:?}");
        }
    }

    #[test]
    fn batch_tracks_highest_cursor_per_user() {
        let requested = vec![
            (UserId::new("userA"), Some(Cursor::new("4"))),
            (UserId::new("userB"), None),
            (UserId::new("userC"), Some(Cursor::new("9"))),
        ];
        let body = "event: PUT\ndata: pubky://userA/pub/app/posts/1\ndata: 5\ndata: h\n\n\
                    event: DEL\ndata: pubky://userB/pub/app/posts/2\ndata: 6\n\n\
                    event: DEL\ndata: pubky://userA/pub/app/posts/1\ndata: 7\n";
        let batch =
            StreamBatch::from_events(&source(), &requested, parse_event_stream(body).unwrap());

        assert_eq!(batch.events.len(), 3);
        assert_eq!(batch.cursors[&UserId::new("userA")], Some(Cursor::new("7")));
        assert_eq!(batch.cursors[&UserId::new("userB")], Some(Cursor::new("6")));
        // No events: unchanged.
        assert_eq!(batch.cursors[&UserId::new("userC")], Some(Cursor::new("9")));
    }

    #[test]
    fn batch_keeps_highest_cursor_when_source_misorders() {
        let requested = vec![
            (UserId::new("userA"), None),
            (UserId::new("userB"), Some(Cursor::new("20"))),
        ];
        let body = "event: PUT\ndata: pubky://userA/pub/app/posts/1\ndata: 7\ndata: h\n\n\
                    event: PUT\ndata: pubky://userA/pub/app/posts/1\ndata: 5\ndata: h\n\n\
                    event: DEL\ndata: pubky://userB/pub/app/posts/2\ndata: 9\n";
        let batch =
            StreamBatch::from_events(&source(), &requested, parse_event_stream(body).unwrap());

        assert_eq!(batch.events.len(), 3);
        assert_eq!(batch.cursors[&UserId::new("userA")], Some(Cursor::new("7")));
        assert_eq!(batch.cursors[&UserId::new("userB")], Some(Cursor::new("20")));
    }

    #[test]
    fn batch_drops_unrequested_users() {
        let requested = vec![(UserId::new("userA"), None)];
        let body = "event: DEL\ndata: pubky://mallory/pub/app/posts/1\ndata: 99\n";
        let batch =
            StreamBatch::from_events(&source(), &requested, parse_event_stream(body).unwrap());

        assert!(batch.events.is_empty());
        assert_eq!(batch.cursors.len(), 1);
        assert_eq!(batch.cursors[&UserId::new("userA")], None);
    }
}
