//! Identifier codec.
//!
//! Two disjoint identifier families share one Crockford base-32 alphabet:
//!
//! - **Timestamp identifiers**: 13 symbols encoding a `u64` microsecond reading.
//!   13 × 5 = 65 bits, so the value is right-aligned with a single zero pad bit
//!   at the most-significant position. Implementations that instead left-align
//!   (dropping the low bit on decode) halve every value; this module never does.
//! - **Hash identifiers**: the first 16 bytes of a SHA-256 digest of the
//!   canonical identity bytes, encoded as a left-aligned bit stream (26 symbols).

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use sha2::{Digest, Sha256};

use crate::error::{IndexerError, Result};

const ALPHABET: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";

pub const TIMESTAMP_ID_LEN: usize = 13;
pub const HASH_ID_LEN: usize = 26;

/// Value of a symbol, folding lowercase and the ambiguous `O`, `I`, `L`.
fn symbol_value(c: u8) -> Option<u8> {
    match c.to_ascii_uppercase() {
        b'O' => Some(0),
        b'I' | b'L' => Some(1),
        upper => ALPHABET.iter().position(|&a| a == upper).map(|p| p as u8),
    }
}

pub fn encode_timestamp_id(micros: u64) -> String {
    let mut out = String::with_capacity(TIMESTAMP_ID_LEN);
    // First symbol: pad bit (always 0) plus bits 63..60.
    out.push(ALPHABET[(micros >> 60) as usize] as char);
    for group in (0..12).rev() {
        let idx = ((micros >> (group * 5)) & 0x1f) as usize;
        out.push(ALPHABET[idx] as char);
    }
    out
}

pub fn decode_timestamp_id(s: &str) -> Result<u64> {
    if s.len() != TIMESTAMP_ID_LEN {
        return Err(IndexerError::MalformedId(format!(
            "{s:?}: expected {TIMESTAMP_ID_LEN} characters, got {}",
            s.chars().count()
        )));
    }

    let mut value: u64 = 0;
    for (i, c) in s.bytes().enumerate() {
        let v = symbol_value(c).ok_or_else(|| {
            IndexerError::MalformedId(format!("{s:?}: invalid character at position {i}"))
        })?;
        if i == 0 && v > 0x0f {
            return Err(IndexerError::MalformedId(format!(
                "{s:?}: value does not fit in 64 bits"
            )));
        }
        value = (value << 5) | u64::from(v);
    }
    Ok(value)
}

/// Content-addressed identifier: identical bytes always yield the same string.
pub fn hash_id(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    encode_bytes(&digest[..16])
}

/// True if `s` has the shape of a hash identifier.
pub fn is_hash_id(s: &str) -> bool {
    canonical_hash_id(s).is_ok()
}

/// Canonical spelling of a hash identifier: uppercase, with the `O`, `I`, `L`
/// look-alikes folded to the symbols they stand for.
pub fn canonical_hash_id(s: &str) -> Result<String> {
    if s.len() != HASH_ID_LEN {
        return Err(IndexerError::MalformedId(format!(
            "{s:?}: expected {HASH_ID_LEN} characters, got {}",
            s.chars().count()
        )));
    }
    s.bytes()
        .enumerate()
        .map(|(i, c)| {
            symbol_value(c)
                .map(|v| ALPHABET[v as usize] as char)
                .ok_or_else(|| {
                    IndexerError::MalformedId(format!("{s:?}: invalid character at position {i}"))
                })
        })
        .collect()
}

fn encode_bytes(bytes: &[u8]) -> String {
    let mut out = String::with_capacity((bytes.len() * 8).div_ceil(5));
    let mut buffer: u32 = 0;
    let mut bits = 0u32;

    for &b in bytes {
        buffer = (buffer << 8) | u32::from(b);
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            out.push(ALPHABET[((buffer >> bits) & 0x1f) as usize] as char);
        }
    }
    if bits > 0 {
        out.push(ALPHABET[((buffer << (5 - bits)) & 0x1f) as usize] as char);
    }
    out
}

/// Mints timestamp identifiers from the wall clock.
///
/// Readings are strictly increasing within one clock: a repeated or regressing
/// wall-clock reading is bumped to one microsecond past the last one issued.
#[derive(Debug, Default)]
pub struct TimestampIdClock {
    last: AtomicU64,
}

impl TimestampIdClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_micros(&self) -> u64 {
        let now = u64::try_from(Utc::now().timestamp_micros()).unwrap_or(0);
        let mut issued = now;
        // fetch_update retries on contention, so `issued` is the value that won.
        let _ = self
            .last
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |prev| {
                issued = now.max(prev.saturating_add(1));
                Some(issued)
            });
        issued
    }

    pub fn next(&self) -> String {
        encode_timestamp_id(self.next_micros())
    }
}
