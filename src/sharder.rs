//! Traffic allocation through consistent hashing.
//!
//! Allocation must match server-side and other SDKs bit for bit: any deviation silently moves
//! visitors to different variations.
use std::io::Cursor;

use rand::{thread_rng, Rng};

/// Number of buckets visitors are spread over.
pub const TOTAL_BUCKETS: u32 = 100;

/// Map `hash_key` to a bucket in `[0, 100)` using MurmurHash3 x86-32 with seed 0.
///
/// Rust strings are valid UTF-8, so hashing their bytes is identical to the reference
/// implementation that encodes UTF-16 code units (surrogate pairs included) to UTF-8 on the fly.
pub fn allocate(hash_key: &str) -> u32 {
    match murmur3::murmur3_32(&mut Cursor::new(hash_key.as_bytes()), 0) {
        Ok(hash) => hash % TOTAL_BUCKETS,
        Err(err) => {
            // Reading from an in-memory cursor cannot fail.
            log::error!(target: "flagship", hash_key; "failed to hash allocation key: {:?}", err);
            random_bucket()
        }
    }
}

/// Like [`allocate`] but falls back to a random bucket in `[0, 100]` when the visitor has no
/// stable key yet. The fallback is not deterministic and is never used once a visitor id exists.
pub fn allocate_or_random(hash_key: Option<&str>) -> u32 {
    match hash_key {
        Some(key) if !key.is_empty() => allocate(key),
        _ => {
            log::warn!(target: "flagship", "no hash key available, using a random allocation");
            random_bucket()
        }
    }
}

fn random_bucket() -> u32 {
    thread_rng().gen_range(0..=TOTAL_BUCKETS)
}
