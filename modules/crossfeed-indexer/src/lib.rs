//! Cross-source event indexer.
//!
//! Consumes per-user change feeds from many independent sources and keeps an
//! eventually-consistent record index of their union:
//!
//! fetch (one request per source) → normalize → apply → commit cursors.
//!
//! Cursors only advance after a whole batch applied cleanly, so any failure
//! before commit is retried next cycle from the same positions.

pub mod apply;
pub mod normalize;
pub mod poller;
pub mod registry;
pub mod stream;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use apply::{ApplyEngine, ApplyOutcome, SoftDeletePolicy};
pub use normalize::normalize;
pub use poller::{BatchOutcome, CycleStats, Poller};
pub use registry::{Source, SourceRegistry};
pub use stream::{parse_event_stream, HttpSourceClient, SourceClient, StreamBatch};
