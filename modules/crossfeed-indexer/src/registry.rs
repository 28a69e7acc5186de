//! Registered sources and the users tracked on each.
//!
//! A source's address and prefix are fixed at registration; only its
//! reachability, last-poll time and tracked users change afterwards.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use crossfeed_common::{IndexerError, Reachability, SourceConfig, SourceId, UserId};
use tracing::info;

#[derive(Debug, Clone, PartialEq)]
pub struct Source {
    pub id: SourceId,
    /// Base URL, e.g. `https://home1.example`.
    pub address: String,
    /// Only resources under this path are indexed from this source.
    pub path_prefix: String,
    pub reachability: Reachability,
    pub last_polled_at: Option<DateTime<Utc>>,
    pub users: BTreeSet<UserId>,
}

impl Source {
    pub fn new(id: SourceId, address: impl Into<String>, path_prefix: impl Into<String>) -> Self {
        Self {
            id,
            address: address.into(),
            path_prefix: path_prefix.into(),
            reachability: Reachability::Unknown,
            last_polled_at: None,
            users: BTreeSet::new(),
        }
    }
}

#[derive(Debug, Default)]
pub struct SourceRegistry {
    sources: RwLock<BTreeMap<SourceId, Source>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(configs: &[SourceConfig]) -> Result<Self, IndexerError> {
        let registry = Self::new();
        for config in configs {
            let id = SourceId::new(&config.id);
            registry.register(Source::new(
                id.clone(),
                &config.address,
                &config.path_prefix,
            ))?;
            for user in &config.users {
                registry.track_user(&id, UserId::new(user));
            }
        }
        Ok(registry)
    }

    // A panicking writer cannot leave a half-updated entry behind, so a
    // poisoned lock is still safe to read through.
    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<SourceId, Source>> {
        self.sources.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<SourceId, Source>> {
        self.sources.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn register(&self, source: Source) -> Result<(), IndexerError> {
        let mut sources = self.write();
        if sources.contains_key(&source.id) {
            return Err(IndexerError::Config(format!(
                "source already registered: {}",
                source.id
            )));
        }
        info!(source = %source.id, address = %source.address, "Source registered");
        sources.insert(source.id.clone(), source);
        Ok(())
    }

    /// Remove a source from future cycles. Results of a poll already in flight
    /// are discarded because the source is no longer registered at commit time.
    pub fn deregister(&self, id: &SourceId) -> Option<Source> {
        let removed = self.write().remove(id);
        if removed.is_some() {
            info!(source = %id, "Source deregistered");
        }
        removed
    }

    /// Start tracking a user on a source. Returns false if the source is
    /// unknown or the user was already tracked.
    pub fn track_user(&self, id: &SourceId, user: UserId) -> bool {
        self.write()
            .get_mut(id)
            .map(|s| s.users.insert(user))
            .unwrap_or(false)
    }

    pub fn untrack_user(&self, id: &SourceId, user: &UserId) -> bool {
        self.write()
            .get_mut(id)
            .map(|s| s.users.remove(user))
            .unwrap_or(false)
    }

    pub fn contains(&self, id: &SourceId) -> bool {
        self.read().contains_key(id)
    }

    pub fn get(&self, id: &SourceId) -> Option<Source> {
        self.read().get(id).cloned()
    }

    /// Point-in-time copy of every registered source.
    pub fn snapshot(&self) -> Vec<Source> {
        self.read().values().cloned().collect()
    }

    pub fn mark_reachable(&self, id: &SourceId, at: DateTime<Utc>) {
        self.set_status(id, Reachability::Reachable, at);
    }

    pub fn mark_unreachable(&self, id: &SourceId, at: DateTime<Utc>) {
        self.set_status(id, Reachability::Unreachable, at);
    }

    fn set_status(&self, id: &SourceId, status: Reachability, at: DateTime<Utc>) {
        if let Some(source) = self.write().get_mut(id) {
            source.reachability = status;
            source.last_polled_at = Some(at);
        }
    }
}
