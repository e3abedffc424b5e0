//! Bytewise mutation of samples.

use crate::RngType;
use rand::prelude::*;
use std::cmp::min;

/// Upper bound on the number of bytes a single insertion adds.
pub const MAX_INSERT_LEN: usize = 10;

/// A mutation transforms the buffer in place and returns `true`, or returns
/// `false` when it is ill-defined on the current input.
pub type MutateOperation = fn(&mut Vec<u8>, &mut RngType) -> bool;

/// The fixed mutation menu. Every invocation of [`mutate`] draws from it
/// uniformly.
pub const MUTATE_OPERATIONS: [MutateOperation; 8] = [
    remove_range,
    insert_random,
    duplicate_range,
    copy_range,
    flip_bit,
    set_byte,
    perturb_byte,
    replace_interesting,
];

/// Produces a mutated copy of `sample` by applying one transformation from
/// the menu. Operations that do not apply to the current input are skipped
/// and another is drawn; the result is usually, but not always, different
/// from the input.
pub fn mutate(sample: &[u8], rng: &mut RngType) -> Vec<u8> {
    let mut res = sample.to_vec();
    let mut tries = 0;
    while tries < 128 {
        let op = MUTATE_OPERATIONS.choose(rng).unwrap();
        if op(&mut res, rng) {
            break;
        }
        tries += 1;
    }
    res
}

/// Removes a contiguous range of bytes.
fn remove_range(buf: &mut Vec<u8>, rng: &mut RngType) -> bool {
    if buf.is_empty() {
        return false;
    }
    let start = rng.gen_range(0..buf.len());
    let len = rng.gen_range(1..=buf.len() - start);
    buf.drain(start..start + len);
    true
}

/// Inserts a short run of random bytes at a random position.
fn insert_random(buf: &mut Vec<u8>, rng: &mut RngType) -> bool {
    let start = rng.gen_range(0..=buf.len());
    let mut data = vec![0u8; rng.gen_range(1..=MAX_INSERT_LEN)];
    rng.fill_bytes(&mut data);
    buf.splice(start..start, data);
    true
}

/// Duplicates a block and inserts the copy at another position.
fn duplicate_range(buf: &mut Vec<u8>, rng: &mut RngType) -> bool {
    if buf.is_empty() {
        return false;
    }
    let src = rng.gen_range(0..buf.len());
    let len = rng.gen_range(1..=buf.len() - src);
    let dst = rng.gen_range(0..=buf.len());
    let block = buf[src..src + len].to_vec();
    buf.splice(dst..dst, block);
    true
}

/// Copies a block over another position, overwriting what was there.
fn copy_range(buf: &mut Vec<u8>, rng: &mut RngType) -> bool {
    if buf.len() < 2 {
        return false;
    }
    let src = rng.gen_range(0..buf.len());
    let dst = rng.gen_range(0..buf.len());
    let len = rng.gen_range(1..=min(buf.len() - src, buf.len() - dst));
    buf.copy_within(src..src + len, dst);
    true
}

/// Flips a single bit.
fn flip_bit(buf: &mut Vec<u8>, rng: &mut RngType) -> bool {
    if buf.is_empty() {
        return false;
    }
    let pos = rng.gen_range(0..buf.len());
    buf[pos] ^= 1 << rng.gen_range(0..8);
    true
}

/// Sets a single byte to a random value.
fn set_byte(buf: &mut Vec<u8>, rng: &mut RngType) -> bool {
    if buf.is_empty() {
        return false;
    }
    let pos = rng.gen_range(0..buf.len());
    buf[pos] = rng.gen();
    true
}

/// Adds a non-zero delta in `[-35, 35]` to a single byte, wrapping.
fn perturb_byte(buf: &mut Vec<u8>, rng: &mut RngType) -> bool {
    const RANGE: u8 = 35;

    if buf.is_empty() {
        return false;
    }
    let pos = rng.gen_range(0..buf.len());
    let delta = rng.gen_range(1..=RANGE);
    buf[pos] = if rng.gen() {
        buf[pos].wrapping_add(delta)
    } else {
        buf[pos].wrapping_sub(delta)
    };
    true
}

/// Interesting replacement values per scalar width: 0, 1, -1, MIN and MAX
/// of the signed type, kept as their unsigned bit patterns.
const INTERESTING: [(usize, [u64; 5]); 4] = [
    (1, [0, 1, u8::MAX as u64, i8::MIN as u8 as u64, i8::MAX as u64]),
    (2, [0, 1, u16::MAX as u64, i16::MIN as u16 as u64, i16::MAX as u64]),
    (4, [0, 1, u32::MAX as u64, i32::MIN as u32 as u64, i32::MAX as u64]),
    (8, [0, 1, u64::MAX, i64::MIN as u64, i64::MAX as u64]),
];

/// Overwrites an aligned 8/16/32/64-bit slot with an interesting integer,
/// encoded little- or big-endian.
fn replace_interesting(buf: &mut Vec<u8>, rng: &mut RngType) -> bool {
    let fits = INTERESTING.iter().filter(|(w, _)| *w <= buf.len()).count();
    if fits == 0 {
        return false;
    }
    let (width, values) = INTERESTING[rng.gen_range(0..fits)];
    let value = *values.choose(rng).unwrap();
    let pos = width * rng.gen_range(0..buf.len() / width);

    let enc = value.to_le_bytes();
    let big_endian = rng.gen();
    for i in 0..width {
        buf[pos + i] = if big_endian { enc[width - 1 - i] } else { enc[i] };
    }
    true
}
