//! Poller: drives every registered source through
//! Collect → Fetch → Normalize & Apply → Commit.
//!
//! Sources are prepared concurrently, one batch each, and hand their results
//! back over the cycle's stream; the cycle driver alone writes cursors. A
//! batch either commits all its cursor advances or none of them, and
//! everything before Commit is safe to repeat because apply is idempotent.
//!
//! Apply and Commit for a source run under that source's lock, which
//! `reset` and `deregister` also take, so neither can interleave with a
//! batch that is writing records or cursors.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use crossfeed_common::{Cursor, Event, EventKind, IndexerConfig, IndexerError, SourceId, UserId};
use crossfeed_store::CursorStore;
use futures::stream::{self, StreamExt};
use tokio::sync::{watch, Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::apply::ApplyEngine;
use crate::normalize::normalize;
use crate::registry::{Source, SourceRegistry};
use crate::stream::SourceClient;

/// How one source's batch ended.
#[derive(Debug)]
pub enum BatchOutcome {
    /// Batch applied; cursors advanced for `users_advanced` users.
    Committed {
        events: usize,
        applied: usize,
        skipped: usize,
        users_advanced: usize,
    },
    /// No tracked users, nothing fetched.
    Idle,
    /// Aborted. No cursor past the failure point was written; the batch is
    /// retried next cycle.
    Failed(IndexerError),
    /// Source was deregistered, or one of its cursors reset, while the
    /// batch was in flight. Nothing was applied.
    Discarded,
}

/// Totals for one cycle across all sources.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleStats {
    pub sources: usize,
    pub committed: usize,
    pub idle: usize,
    pub failed: usize,
    pub discarded: usize,
    pub events: usize,
    pub applied: usize,
    pub skipped: usize,
    pub users_advanced: usize,
}

impl CycleStats {
    fn record(&mut self, outcome: &BatchOutcome) {
        self.sources += 1;
        match outcome {
            BatchOutcome::Committed {
                events,
                applied,
                skipped,
                users_advanced,
            } => {
                self.committed += 1;
                self.events += events;
                self.applied += applied;
                self.skipped += skipped;
                self.users_advanced += users_advanced;
            }
            BatchOutcome::Idle => self.idle += 1,
            BatchOutcome::Failed(_) => self.failed += 1,
            BatchOutcome::Discarded => self.discarded += 1,
        }
    }
}

impl fmt::Display for CycleStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "sources={} committed={} idle={} failed={} discarded={} events={} applied={} skipped={} users_advanced={}",
            self.sources,
            self.committed,
            self.idle,
            self.failed,
            self.discarded,
            self.events,
            self.applied,
            self.skipped,
            self.users_advanced,
        )
    }
}

/// A batch that applied cleanly and is waiting for Commit. Holds its
/// source's lock until it is committed or dropped.
struct PreparedBatch {
    events: usize,
    applied: usize,
    skipped: usize,
    advances: Vec<(UserId, Cursor)>,
    _lock: OwnedMutexGuard<()>,
}

enum Prepared {
    Ready(PreparedBatch),
    Idle,
    Discarded,
}

pub struct Poller {
    client: Arc<dyn SourceClient>,
    cursors: Arc<dyn CursorStore>,
    engine: ApplyEngine,
    registry: Arc<SourceRegistry>,
    max_concurrent: usize,
    period: Duration,
    source_locks: Mutex<HashMap<SourceId, Arc<AsyncMutex<()>>>>,
}

impl Poller {
    pub fn new(
        client: Arc<dyn SourceClient>,
        cursors: Arc<dyn CursorStore>,
        engine: ApplyEngine,
        registry: Arc<SourceRegistry>,
        config: &IndexerConfig,
    ) -> Self {
        Self {
            client,
            cursors,
            engine,
            registry,
            max_concurrent: config.max_concurrent_sources.max(1),
            period: config.poll_period(),
            source_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<SourceRegistry> {
        &self.registry
    }

    // ---- lifecycle ----

    /// Poll on the configured period until `shutdown` flips to true or its
    /// sender is dropped. A cycle in flight at shutdown is abandoned; nothing
    /// it did before Commit needs undoing.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(period_secs = self.period.as_secs(), max_concurrent = self.max_concurrent, "Poller started");

        let mut ticker = tokio::time::interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }

            tokio::select! {
                stats = self.run_cycle() => {
                    info!(%stats, "Poll cycle complete");
                }
                _ = shutdown.changed() => {
                    info!("Shutdown during poll cycle, abandoning uncommitted batches");
                    break;
                }
            }
        }

        info!("Poller stopped");
    }

    /// One pass over every registered source.
    pub async fn run_cycle(&self) -> CycleStats {
        let sources = self.registry.snapshot();

        let mut prepared = stream::iter(sources.into_iter().map(|source| async move {
            let result = self.prepare(&source).await;
            (source.id, result)
        }))
        .buffer_unordered(self.max_concurrent);

        let mut stats = CycleStats::default();
        while let Some((source, result)) = prepared.next().await {
            let outcome = self.finish(&source, result).await;
            match &outcome {
                BatchOutcome::Failed(e) => {
                    warn!(source = %source, error = %e, "Batch failed, will retry next cycle");
                }
                BatchOutcome::Discarded => {
                    info!(source = %source, "Batch discarded, source changed mid-flight");
                }
                _ => {}
            }
            stats.record(&outcome);
        }
        stats
    }

    /// Remove a source and forget its cursors. A batch already in flight for
    /// it is discarded.
    pub async fn deregister(&self, source: &SourceId) -> Result<Option<Source>> {
        let _lock = self.lock_source(source).await;
        let removed = self.registry.deregister(source);
        self.cursors.drop_source(source).await?;
        Ok(removed)
    }

    /// Clear one user's cursor so the next cycle replays their full history.
    /// A batch already in flight for the source is discarded.
    pub async fn reset(&self, source: &SourceId, user: &UserId) -> Result<()> {
        let _lock = self.lock_source(source).await;
        self.cursors.reset(source, user).await?;
        info!(source = %source, user = %user, "Cursor reset");
        Ok(())
    }

    // ---- one batch ----

    /// Run one source's batch end to end.
    pub async fn poll_source(&self, source: &Source) -> BatchOutcome {
        let result = self.prepare(source).await;
        self.finish(&source.id, result).await
    }

    async fn finish(
        &self,
        source: &SourceId,
        result: Result<Prepared, IndexerError>,
    ) -> BatchOutcome {
        match result {
            Ok(Prepared::Ready(batch)) => self.commit(source, batch).await,
            Ok(Prepared::Idle) => BatchOutcome::Idle,
            Ok(Prepared::Discarded) => BatchOutcome::Discarded,
            Err(e) => BatchOutcome::Failed(e),
        }
    }

    async fn lock_source(&self, source: &SourceId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.source_locks.lock().unwrap_or_else(|e| e.into_inner());
            locks.entry(source.clone()).or_default().clone()
        };
        lock.lock_owned().await
    }

    /// Collect, fetch, normalize and apply. Returns the cursor advances to
    /// commit.
    async fn prepare(&self, source: &Source) -> Result<Prepared, IndexerError> {
        if source.users.is_empty() {
            return Ok(Prepared::Idle);
        }

        // Collect
        let requested = self.collect_cursors(source).await?;

        // Fetch
        let batch = match self.client.fetch_events(source, &requested).await {
            Ok(batch) => batch,
            Err(e) => {
                self.registry.mark_unreachable(&source.id, Utc::now());
                return Err(e);
            }
        };
        self.registry.mark_reachable(&source.id, Utc::now());
        if !self.registry.contains(&source.id) {
            return Ok(Prepared::Discarded);
        }

        let previous: HashMap<UserId, Option<Cursor>> = requested.iter().cloned().collect();

        // Normalize. Only events past everything already seen for their user
        // are applied: a replayed or misordered event never overwrites newer
        // state.
        let total = batch.events.len();
        let mut skipped = 0;
        let mut high_water = previous.clone();
        let mut events: Vec<Event> = Vec::with_capacity(total);
        for raw in &batch.events {
            let mark = high_water.entry(raw.user.clone()).or_default();
            if let Some(seen) = mark.as_ref() {
                if !raw.cursor.is_after(seen) {
                    warn!(
                        source = %source.id,
                        user = %raw.user,
                        seen = %seen,
                        received = %raw.cursor,
                        uri = %raw.uri,
                        "Dropping event at or behind an already seen cursor"
                    );
                    skipped += 1;
                    continue;
                }
            }
            *mark = Some(raw.cursor.clone());

            match normalize(raw, &source.path_prefix) {
                Ok(event) => events.push(event),
                Err(e) => {
                    warn!(source = %source.id, uri = %raw.uri, cursor = %raw.cursor, error = %e, "Skipping event");
                    skipped += 1;
                }
            }
        }

        // Hydrate write bodies; order is preserved for apply.
        let hydrated: Vec<(Event, Result<Option<Vec<u8>>, IndexerError>)> =
            stream::iter(events.into_iter().map(|event| async move {
                let body = match event.kind {
                    EventKind::Write => self
                        .client
                        .fetch_resource(source, &event.user, &event.path)
                        .await
                        .map(Some),
                    EventKind::Delete => Ok(None),
                };
                (event, body)
            }))
            .buffered(self.max_concurrent)
            .collect()
            .await;

        // From here to Commit the source must stay registered and its cursors
        // must stay where they were when collected.
        let lock = self.lock_source(&source.id).await;
        if !self.registry.contains(&source.id) {
            return Ok(Prepared::Discarded);
        }
        if self.collect_cursors(source).await? != requested {
            info!(source = %source.id, "Cursors changed while the batch was in flight");
            return Ok(Prepared::Discarded);
        }

        // Apply, in stream order.
        let mut applied = 0;
        for (event, body) in hydrated {
            let result = match body {
                Ok(body) => {
                    self.engine
                        .apply(&source.id, &event, body.as_deref())
                        .await
                }
                Err(IndexerError::ResourceGone { .. }) => {
                    self.engine.apply_vanished(&source.id, &event).await
                }
                Err(e) => Err(e),
            };

            match result {
                Ok(outcome) => {
                    debug!(source = %source.id, uri = %event.uri, cursor = %event.cursor, ?outcome, "Applied");
                    applied += 1;
                }
                Err(e) if e.is_transient() => {
                    if matches!(e, IndexerError::SourceUnreachable { .. }) {
                        self.registry.mark_unreachable(&source.id, Utc::now());
                    }
                    return Err(e);
                }
                Err(e) => {
                    warn!(source = %source.id, uri = %event.uri, cursor = %event.cursor, error = %e, "Skipping event");
                    skipped += 1;
                }
            }
        }

        let mut advances = Vec::new();
        for (user, cursor) in batch.cursors {
            let Some(cursor) = cursor else { continue };
            let moved = match previous.get(&user).and_then(Option::as_ref) {
                Some(stored) => cursor.is_after(stored),
                None => true,
            };
            if moved {
                advances.push((user, cursor));
            }
        }

        Ok(Prepared::Ready(PreparedBatch {
            events: total,
            applied,
            skipped,
            advances,
            _lock: lock,
        }))
    }

    /// Write a prepared batch's cursors. The batch still holds its source's
    /// lock, so the source cannot be deregistered or reset meanwhile.
    async fn commit(&self, source: &SourceId, batch: PreparedBatch) -> BatchOutcome {
        for (user, cursor) in &batch.advances {
            if let Err(e) = self.cursors.set(source, user, cursor).await {
                return BatchOutcome::Failed(IndexerError::CursorStore(format!("{e:#}")));
            }
        }

        if batch.events > 0 {
            info!(
                source = %source,
                events = batch.events,
                applied = batch.applied,
                skipped = batch.skipped,
                users_advanced = batch.advances.len(),
                "Batch committed"
            );
        }

        BatchOutcome::Committed {
            events: batch.events,
            applied: batch.applied,
            skipped: batch.skipped,
            users_advanced: batch.advances.len(),
        }
    }

    async fn collect_cursors(
        &self,
        source: &Source,
    ) -> Result<Vec<(UserId, Option<Cursor>)>, IndexerError> {
        let mut requested = Vec::with_capacity(source.users.len());
        for user in &source.users {
            let cursor = self
                .cursors
                .get(&source.id, user)
                .await
                .map_err(|e| IndexerError::CursorStore(format!("{e:#}")))?;
            requested.push((user.clone(), cursor));
        }
        Ok(requested)
    }
}
