use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Identifiers for sources and users
// ---------------------------------------------------------------------------

/// Stable identifier of a registered source (a per-user data store).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceId(String);

impl SourceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SourceId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Public identifier of the user who owns a resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

// ---------------------------------------------------------------------------
// Cursor
// ---------------------------------------------------------------------------

/// Opaque, source-assigned position marker for one user's change feed.
///
/// Only ever constructed from a value the source returned. Ordering between two
/// cursors is numeric when both are unsigned integers, otherwise by length and
/// then bytes (which agrees with numeric order for unpadded digits).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cursor(String);

impl Cursor {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn position_cmp(&self, other: &Cursor) -> Ordering {
        match (self.0.parse::<u64>(), other.0.parse::<u64>()) {
            (Ok(a), Ok(b)) => a.cmp(&b),
            _ => self
                .0
                .len()
                .cmp(&other.0.len())
                .then_with(|| self.0.cmp(&other.0)),
        }
    }

    /// True if `self` is strictly past `other` in feed order.
    pub fn is_after(&self, other: &Cursor) -> bool {
        self.position_cmp(other) == Ordering::Greater
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Resource URIs and kinds
// ---------------------------------------------------------------------------

/// Split `scheme://<user>/<path>` into the owning user and the absolute path.
///
/// Returns `None` when there is no scheme, no user segment, or no path.
pub fn split_uri(uri: &str) -> Option<(UserId, String)> {
    let (scheme, rest) = uri.split_once("://")?;
    if scheme.is_empty() {
        return None;
    }
    let (user, path) = rest.split_once('/')?;
    if user.is_empty() || path.is_empty() {
        return None;
    }
    Some((UserId::new(user), format!("/{path}")))
}

/// How a resource kind derives its identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdFamily {
    /// Minted from a monotonic clock reading (13-symbol timestamp id).
    Timestamp,
    /// Derived from the identity-bearing fields of the payload.
    Hash,
    /// One resource per user; the identifier is fixed.
    Singleton,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Post,
    File,
    Tag,
    Bookmark,
    Profile,
}

impl ResourceKind {
    /// Resolve a kind from the path segment right after the app namespace.
    pub fn from_collection(segment: &str) -> Option<Self> {
        match segment {
            "posts" => Some(Self::Post),
            "files" => Some(Self::File),
            "tags" => Some(Self::Tag),
            "bookmarks" => Some(Self::Bookmark),
            "profile.json" => Some(Self::Profile),
            _ => None,
        }
    }

    pub fn family(self) -> IdFamily {
        match self {
            Self::Post | Self::File => IdFamily::Timestamp,
            Self::Tag | Self::Bookmark => IdFamily::Hash,
            Self::Profile => IdFamily::Singleton,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Post => "post",
            Self::File => "file",
            Self::Tag => "tag",
            Self::Bookmark => "bookmark",
            Self::Profile => "profile",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "post" => Ok(Self::Post),
            "file" => Ok(Self::File),
            "tag" => Ok(Self::Tag),
            "bookmark" => Ok(Self::Bookmark),
            "profile" => Ok(Self::Profile),
            other => Err(format!("unknown resource kind: {other}")),
        }
    }
}

/// Fixed identifier of singleton resources.
pub const PROFILE_ID: &str = "profile";

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Write,
    Delete,
}

/// A change notification exactly as framed on the wire, with the owning user
/// already split out so per-user cursors can be tracked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    pub kind: EventKind,
    pub uri: String,
    pub user: UserId,
    pub cursor: Cursor,
    pub content_hash: Option<String>,
}

/// Which resource an event refers to, after classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRef {
    pub kind: ResourceKind,
    pub app: String,
    /// Identifier as it appears in the path (the fixed id for singletons).
    pub id: String,
}

/// Typed domain event produced by the normalizer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub kind: EventKind,
    pub user: UserId,
    pub uri: String,
    pub path: String,
    pub resource: ResourceRef,
    pub cursor: Cursor,
    pub fingerprint: Option<String>,
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Indexed materialization of one resource, keyed by (user_id, identifier).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub user_id: UserId,
    pub identifier: String,
    pub source_id: SourceId,
    pub kind: ResourceKind,
    pub payload: serde_json::Value,
    pub fingerprint: Option<String>,
    pub tombstoned: bool,
    /// Cursor of the event that last touched this record.
    pub cursor: Cursor,
}

// ---------------------------------------------------------------------------
// Source reachability
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reachability {
    Unknown,
    Reachable,
    Unreachable,
}
