//! Hash primitives: slot placement and truncated-key fingerprints.

use md5::{Digest, Md5};

/// MurmurHash3 x86/32, seed 0.
///
/// The result modulo the slot count is an element's home slot, so every
/// process attaching a region must compute identical values; the
/// function is part of the region ABI. Blocks are read in native byte
/// order (regions are same-host only).
pub fn murmur3_32(data: &[u8]) -> u32 {
    const C1: u32 = 0xcc9e_2d51;
    const C2: u32 = 0x1b87_3593;

    let mut h: u32 = 0;

    let mut chunks = data.chunks_exact(4);
    for block in &mut chunks {
        let mut k = u32::from_ne_bytes([block[0], block[1], block[2], block[3]]);
        k = k.wrapping_mul(C1);
        k = k.rotate_left(15);
        k = k.wrapping_mul(C2);

        h ^= k;
        h = h.rotate_left(13);
        h = h.wrapping_mul(5).wrapping_add(0xe654_6b64);
    }

    let tail = chunks.remainder();
    let mut k: u32 = 0;
    if tail.len() >= 3 {
        k ^= (tail[2] as u32) << 16;
    }
    if tail.len() >= 2 {
        k ^= (tail[1] as u32) << 8;
    }
    if !tail.is_empty() {
        k ^= tail[0] as u32;
        k = k.wrapping_mul(C1);
        k = k.rotate_left(15);
        k = k.wrapping_mul(C2);
        h ^= k;
    }

    h ^= data.len() as u32;
    h ^= h >> 16;
    h = h.wrapping_mul(0x85eb_ca6b);
    h ^= h >> 13;
    h = h.wrapping_mul(0xc2b2_ae35);
    h ^= h >> 16;

    h
}

/// MD5 digest of the full key, stored beside truncated inline keys.
pub fn md5_digest(data: &[u8]) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update(data);
    let result = hasher.finalize();
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&result);
    bytes
}
