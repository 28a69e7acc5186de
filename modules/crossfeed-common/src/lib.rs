pub mod config;
pub mod error;
pub mod ids;
pub mod types;

pub use config::{AppConfig, FileConfig, IndexerConfig, SoftDeleteConfig, SourceConfig};
pub use error::{IndexerError, Result};
pub use ids::{
    canonical_hash_id, decode_timestamp_id, encode_timestamp_id, hash_id, TimestampIdClock,
};
pub use types::*;
