//! Persistence for the indexer: per-(source, user) cursors and the record index.
//!
//! Each store is a trait with a Postgres implementation and an in-memory twin.
//! The in-memory twins back the tests and database-less runs.

pub mod cursor;
pub mod records;

pub use cursor::{CursorStore, MemoryCursorStore, PgCursorStore};
pub use records::{MemoryRecordIndex, PgRecordIndex, RecordIndex};

use anyhow::{Context, Result};
use sqlx::PgPool;

/// Run the embedded SQL migrations.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("Failed to run crossfeed-store migrations")?;
    Ok(())
}
