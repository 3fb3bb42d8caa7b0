//! TEA-based keyed hash used by the placement heuristics.
//!
//! This must stay bit-exact with the on-disk format's historical hash: input
//! bytes are treated as signed chars and sign-extended before they are
//! packed into words, and object ids are hashed as their four little-endian
//! bytes.

const KEY: [u32; 4] = [0x9464_a485, 0x542e_1a94, 0x3e84_6bff, 0xb75b_cfc3];
const DELTA: u32 = 0x9E37_79B9;
const PARTIAL_ROUNDS: u32 = 6;
const FULL_ROUNDS: u32 = 10;

struct TeaState {
    h0: u32,
    h1: u32,
}

impl TeaState {
    fn mix(&mut self, rounds: u32, [a, b, c, d]: [u32; 4]) {
        let mut sum = 0_u32;
        let mut b0 = self.h0;
        let mut b1 = self.h1;
        for _ in 0..rounds {
            sum = sum.wrapping_add(DELTA);
            b0 = b0.wrapping_add(
                ((b1 << 4).wrapping_add(a)) ^ b1.wrapping_add(sum) ^ ((b1 >> 5).wrapping_add(b)),
            );
            b1 = b1.wrapping_add(
                ((b0 << 4).wrapping_add(c)) ^ b0.wrapping_add(sum) ^ ((b0 >> 5).wrapping_add(d)),
            );
        }
        self.h0 = self.h0.wrapping_add(b0);
        self.h1 = self.h1.wrapping_add(b1);
    }
}

/// Sign-extend one input byte the way a `signed char` promotes to `u32`.
fn widen(byte: u8) -> u32 {
    if byte & 0x80 == 0 {
        u32::from(byte)
    } else {
        u32::from(byte) | 0xFFFF_FF00
    }
}

fn word(bytes: &[u8]) -> u32 {
    bytes
        .iter()
        .take(4)
        .enumerate()
        .fold(0, |acc, (i, &byte)| acc | (widen(byte) << (8 * i)))
}

fn shift_in(seed: u32, tail: &[u8]) -> u32 {
    tail.iter()
        .fold(seed, |acc, &byte| (acc << 8) | widen(byte))
}

/// Hash an arbitrary byte string.
#[must_use]
#[expect(clippy::cast_possible_truncation)]
pub fn keyed_hash(msg: &[u8]) -> u32 {
    let mut state = TeaState {
        h0: KEY[0],
        h1: KEY[1],
    };
    // Only the low 32 bits of the length take part in the mix.
    let len = msg.len() as u32;
    let mut pad = len | (len << 8);
    pad |= pad << 16;

    let mut chunks = msg.chunks_exact(16);
    for chunk in &mut chunks {
        state.mix(
            PARTIAL_ROUNDS,
            [
                word(&chunk[0..4]),
                word(&chunk[4..8]),
                word(&chunk[8..12]),
                word(&chunk[12..16]),
            ],
        );
    }

    let rest = chunks.remainder();
    let block = match rest.len() {
        12..=15 => [
            word(&rest[0..4]),
            word(&rest[4..8]),
            word(&rest[8..12]),
            shift_in(pad, &rest[12..]),
        ],
        8..=11 => [
            word(&rest[0..4]),
            word(&rest[4..8]),
            shift_in(pad, &rest[8..]),
            pad,
        ],
        4..=7 => [word(&rest[0..4]), shift_in(pad, &rest[4..]), pad, pad],
        _ => [shift_in(pad, rest), pad, pad, pad],
    };
    state.mix(FULL_ROUNDS, block);
    state.h0 ^ state.h1
}

/// Hash an object or directory id.
#[must_use]
pub fn hash_id(id: u32) -> u32 {
    keyed_hash(&id.to_le_bytes())
}

/// Map an id onto a bitmap group.
///
/// Ids up to 2 (the root and its parent) always land in bitmap 1. Hashed ids
/// never land in bitmap 0, which holds the reserved area. On single-bitmap
/// devices the result collapses to 0.
#[must_use]
pub fn bmap_hash_id(id: u32, bitmap_count: u32) -> u32 {
    let mut bm = if id <= 2 || bitmap_count == 0 {
        1
    } else {
        match hash_id(id) % bitmap_count {
            0 => 1,
            bm => bm,
        }
    };
    if bm >= bitmap_count {
        bm = 0;
    }
    bm
}
