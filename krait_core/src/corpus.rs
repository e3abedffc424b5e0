//! The pool of samples currently believed to be interesting.

use crate::{HashSet, RngType};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::cmp::max;

/// An ordered, duplicate-free pool of byte strings. The corpus never
/// shrinks during a run; sampling is weighted by `max(1, len)` so longer
/// samples, which exercise more internal structure, are drawn more often
/// while short ones stay reachable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<Vec<u8>>", into = "Vec<Vec<u8>>")]
pub struct Corpus {
    entries: Vec<Vec<u8>>,
    seen: HashSet<Vec<u8>>,
    // Prefix sums of the sampling weights, one per entry.
    weights: Vec<u64>,
    sum_weights: u64,
}

impl Corpus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `sample` unless a byte-identical entry is already present.
    /// Returns whether it was actually added.
    pub fn put(&mut self, sample: Vec<u8>) -> bool {
        if self.seen.contains(&sample) {
            return false;
        }
        self.sum_weights += max(1, sample.len() as u64);
        self.weights.push(self.sum_weights);
        self.seen.insert(sample.clone());
        self.entries.push(sample);
        true
    }

    /// Draws one sample, weighted by `max(1, len)`. An empty corpus yields
    /// the empty byte string.
    pub fn sample(&self, rng: &mut RngType) -> Vec<u8> {
        if self.entries.is_empty() {
            return Vec::new();
        }
        self.entries[choose_weighted(rng, &self.weights)].clone()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[inline]
    pub fn contains(&self, sample: &[u8]) -> bool {
        self.seen.contains(sample)
    }

    pub fn iter(&self) -> impl Iterator<Item = &[u8]> {
        self.entries.iter().map(Vec::as_slice)
    }

    /// The pool in insertion order, for snapshotting to workers.
    pub fn samples(&self) -> &[Vec<u8>] {
        &self.entries
    }
}

impl From<Vec<Vec<u8>>> for Corpus {
    fn from(entries: Vec<Vec<u8>>) -> Self {
        let mut corpus = Corpus::new();
        for entry in entries {
            corpus.put(entry);
        }
        corpus
    }
}

impl From<Corpus> for Vec<Vec<u8>> {
    fn from(corpus: Corpus) -> Self {
        corpus.entries
    }
}

fn choose_weighted(rng: &mut RngType, weights: &[u64]) -> usize {
    let max = weights.last().unwrap();
    let n = rng.gen_range(0..*max);
    match weights.binary_search(&n) {
        Ok(idx) => idx + 1,
        Err(idx) => idx,
    }
}

#[cfg(test)]
mod tests {
    use super::Corpus;
    use crate::RngType;

    #[test]
    fn put_rejects_duplicates() {
        let mut corpus = Corpus::new();
        assert!(corpus.put(b"one".to_vec()));
        assert!(corpus.put(b"two".to_vec()));
        assert!(!corpus.put(b"one".to_vec()));
        assert_eq!(corpus.len(), 2);
        assert!(corpus.contains(b"one"));
        assert!(!corpus.contains(b"three"));
    }

    #[test]
    fn empty_corpus_samples_empty_string() {
        let corpus = Corpus::new();
        let mut rng = RngType::default();
        assert_eq!(corpus.sample(&mut rng), Vec::<u8>::new());
    }

    #[test]
    fn sampling_reaches_zero_length_entries() {
        let mut corpus = Corpus::new();
        corpus.put(Vec::new());
        corpus.put(vec![7; 64]);

        let mut rng = RngType::default();
        let mut saw_empty = false;
        let mut saw_long = false;
        for _ in 0..4096 {
            match corpus.sample(&mut rng).len() {
                0 => saw_empty = true,
                64 => saw_long = true,
                n => panic!("sample of unexpected length {}", n),
            }
        }
        assert!(saw_empty, "the max(1, len) floor must keep empty entries reachable");
        assert!(saw_long);
    }

    #[test]
    fn sampling_prefers_longer_entries() {
        let mut corpus = Corpus::new();
        corpus.put(vec![1]);
        corpus.put(vec![2; 99]);

        let mut rng = RngType::default();
        let long = (0..1000)
            .filter(|_| corpus.sample(&mut rng).len() == 99)
            .count();
        // Expected 990 of 1000; far outside any plausible noise band.
        assert!(long > 900, "drew the long entry only {} times", long);
    }

    #[test]
    fn round_trips_through_plain_entries() {
        let mut corpus = Corpus::new();
        corpus.put(b"alpha".to_vec());
        corpus.put(Vec::new());
        corpus.put(b"beta".to_vec());

        let entries: Vec<Vec<u8>> = corpus.clone().into();
        let restored = Corpus::from(entries);
        assert_eq!(restored, corpus);
    }
}
