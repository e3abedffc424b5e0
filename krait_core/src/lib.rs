//! Core algorithms and data structures of krait.

use ahash::{AHashMap, AHashSet};

pub mod corpus;
pub mod coverage;
pub mod mutation;
pub mod trace;

pub type HashMap<K, V> = AHashMap<K, V>;
pub type HashSet<V> = AHashSet<V>;

/// All mutation randomness comes from the operating system generator;
/// predictable mutation streams would let pathological targets starve the
/// fuzzer.
pub type RngType = rand::rngs::OsRng;
