//! Ketama hashing: string → SHA-1 digest → ring coordinates.
//!
//! These functions are the interoperability surface of the ring. Any
//! implementation that places targets with [`ketama_coordinates`] and looks up
//! keys with [`key_hash`] produces the same layout, bit for bit.

use sha1::{Digest, Sha1};

/// Number of ring coordinates carved out of one digest.
pub const KETAMA_COORDINATES: usize = 4;

/// Length of a SHA-1 digest in bytes.
pub const DIGEST_LEN: usize = 20;

/// SHA-1 of the UTF-8 bytes of `content`.
pub fn digest(content: &str) -> [u8; DIGEST_LEN] {
    let mut out = [0u8; DIGEST_LEN];
    out.copy_from_slice(&Sha1::digest(content.as_bytes()));
    out
}

/// Four ring coordinates taken from one digest.
///
/// Words are read little-endian from byte offsets 0, 4, 8 and 12; the last
/// four digest bytes are unused.
pub fn ketama_coordinates(content: &str) -> [u32; KETAMA_COORDINATES] {
    let digest = digest(content);
    let mut coordinates = [0u32; KETAMA_COORDINATES];
    for (i, word) in digest.chunks_exact(4).take(KETAMA_COORDINATES).enumerate() {
        coordinates[i] = u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
    }
    coordinates
}

/// Lookup position of a key: the mean of its four ketama coordinates.
///
/// The sum is taken in `u64` so the mean never wraps.
pub fn key_hash(content: &str) -> u32 {
    let sum: u64 = ketama_coordinates(content)
        .iter()
        .map(|&c| u64::from(c))
        .sum();
    // The mean of four u32 values always fits in a u32.
    (sum / KETAMA_COORDINATES as u64) as u32
}
