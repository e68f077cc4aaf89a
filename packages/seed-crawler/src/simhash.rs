//! 64-bit Simhash fingerprints for near-duplicate detection.
//!
//! Token hashes come from SHA-256 (first 8 bytes) so fingerprints are
//! stable across processes and releases. Hamming distance ≤ 3 corresponds
//! to ~95 % bit similarity, the default duplicate threshold.

use sha2::{Digest, Sha256};

/// Number of 16-bit bands a fingerprint splits into for candidate lookup.
///
/// By the pigeonhole principle, two fingerprints within Hamming distance 3
/// share at least one of the four bands, so a band-equality index never
/// misses a candidate at the default threshold.
pub const BANDS: usize = 4;

fn token_hash(token: &str) -> u64 {
    let digest = Sha256::digest(token.as_bytes());
    u64::from_be_bytes(digest[..8].try_into().expect("digest is at least 8 bytes"))
}

/// Compute the Simhash of already-normalized text.
///
/// Empty input hashes to zero.
pub fn simhash64(text: &str) -> u64 {
    let mut weights = [0i64; 64];
    let mut any = false;

    for token in text.split_whitespace() {
        any = true;
        let h = token_hash(token);
        for (bit, weight) in weights.iter_mut().enumerate() {
            if h & (1 << bit) != 0 {
                *weight += 1;
            } else {
                *weight -= 1;
            }
        }
    }

    if !any {
        return 0;
    }

    let mut fingerprint = 0u64;
    for (bit, weight) in weights.iter().enumerate() {
        if *weight > 0 {
            fingerprint |= 1 << bit;
        }
    }
    fingerprint
}

/// Hamming distance between two fingerprints.
pub fn hamming(a: u64, b: u64) -> u32 {
    (a ^ b).count_ones()
}

/// Bit similarity in [0, 1]: `1 - hamming/64`.
pub fn similarity(a: u64, b: u64) -> f64 {
    1.0 - hamming(a, b) as f64 / 64.0
}

/// Split a fingerprint into its 16-bit bands for indexed candidate lookup.
pub fn bands(fingerprint: u64) -> [i32; BANDS] {
    let mut out = [0i32; BANDS];
    for (i, band) in out.iter_mut().enumerate() {
        *band = ((fingerprint >> (i * 16)) & 0xFFFF) as i32;
    }
    out
}
