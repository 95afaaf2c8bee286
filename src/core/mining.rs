use crate::core::similarity::{cos_sim, top_k};
use crate::core::vector::{VectorError, VectorStore};
use serde::{Deserialize, Serialize};
use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashSet};

/// A mined pair of store rows. `first < second` once returned by [`PairMiner::mine`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoredPair {
    pub score: f32,
    pub first: usize,
    pub second: usize,
}

impl Eq for ScoredPair {}

impl Ord for ScoredPair {
    fn cmp(&self, other: &Self) -> Ordering {
        self.score
            .total_cmp(&other.score)
            .then(self.first.cmp(&other.first))
            .then(self.second.cmp(&other.second))
    }
}

impl PartialOrd for ScoredPair {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Fixed-capacity min-heap keeping the highest-scoring pairs seen so far.
#[derive(Debug)]
pub struct BoundedPairHeap {
    capacity: usize,
    heap: BinaryHeap<Reverse<ScoredPair>>,
    floor: f32,
}

impl BoundedPairHeap {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            heap: BinaryHeap::with_capacity(capacity.saturating_add(1).min(1 << 20)),
            floor: f32::NEG_INFINITY,
        }
    }

    /// Scores at or below this value are no longer accepted.
    pub fn floor(&self) -> f32 {
        self.floor
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Insert `pair`, evicting the current minimum once the heap is over capacity.
    ///
    /// Returns `false` if the pair scored at or below the floor and was skipped.
    pub fn push(&mut self, pair: ScoredPair) -> bool {
        if self.capacity == 0 || pair.score <= self.floor {
            return false;
        }
        self.heap.push(Reverse(pair));
        if self.heap.len() > self.capacity {
            if let Some(Reverse(evicted)) = self.heap.pop() {
                self.floor = self.floor.max(evicted.score);
            }
        }
        true
    }

    pub fn into_vec(self) -> Vec<ScoredPair> {
        self.heap.into_iter().map(|Reverse(pair)| pair).collect()
    }
}

/// Global top pair search ("paraphrase mining") over a [`VectorStore`].
#[derive(Debug, Clone)]
pub struct PairMiner {
    query_chunk_size: usize,
    corpus_chunk_size: usize,
    max_pairs: usize,
    top_k: usize,
}

impl PairMiner {
    pub fn new(query_chunk_size: usize, corpus_chunk_size: usize, max_pairs: usize, top_k: usize) -> Self {
        Self {
            query_chunk_size: query_chunk_size.max(1),
            corpus_chunk_size: corpus_chunk_size.max(1),
            max_pairs,
            top_k,
        }
    }

    /// At most `max_pairs` distinct pairs, highest score first.
    ///
    /// Only pairs that show up in some row's top-`top_k` neighbor list within a corpus
    /// block are ever considered.
    pub fn mine(&self, store: &VectorStore) -> Result<Vec<ScoredPair>, VectorError> {
        let len = store.len();
        let vectors = store.as_block();
        // Every row's best match is itself.
        let per_row = self.top_k + 1;
        let mut heap = BoundedPairHeap::new(self.max_pairs);

        for corpus_start in (0..len).step_by(self.corpus_chunk_size) {
            let corpus = vectors.slice(corpus_start, corpus_start + self.corpus_chunk_size);
            for query_start in (0..len).step_by(self.query_chunk_size) {
                let queries = vectors.slice(query_start, query_start + self.query_chunk_size);
                let scores = cos_sim(queries, corpus)?;

                for row in 0..scores.rows() {
                    let i = query_start + row;
                    for (col, score) in top_k(scores.row(row), per_row) {
                        let j = corpus_start + col;
                        if i != j {
                            heap.push(ScoredPair { score, first: i, second: j });
                        }
                    }
                }
            }
        }

        let mut seen: HashSet<(usize, usize)> = HashSet::new();
        let mut pairs: Vec<ScoredPair> = heap
            .into_vec()
            .into_iter()
            .filter_map(|pair| {
                let (first, second) = if pair.first < pair.second {
                    (pair.first, pair.second)
                } else {
                    (pair.second, pair.first)
                };
                seen.insert((first, second)).then_some(ScoredPair {
                    score: pair.score,
                    first,
                    second,
                })
            })
            .collect();

        pairs.sort_by(|a, b| b.cmp(a));
        Ok(pairs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::item::Item;

    fn store(vectors: &[Vec<f32>]) -> VectorStore {
        let mut store = VectorStore::new(vectors[0].len());
        for (i, v) in vectors.iter().enumerate() {
            store.push(Item::new(format!("item-{i}"), 1, 1), v.clone()).unwrap();
        }
        store
    }

    fn sample() -> VectorStore {
        store(&[
            vec![1.0, 0.0, 0.0],
            vec![0.9, 0.1, 0.0],
            vec![0.0, 1.0, 0.0],
            vec![0.0, 0.9, 0.2],
            vec![0.5, 0.5, 0.5],
            vec![0.0, 0.0, 1.0],
        ])
    }

    fn brute_force(store: &VectorStore) -> Vec<ScoredPair> {
        let mut all = Vec::new();
        for i in 0..store.len() {
            for j in (i + 1)..store.len() {
                let score = crate::core::similarity::dot(store.vector(i), store.vector(j));
                all.push(ScoredPair { score, first: i, second: j });
            }
        }
        all.sort_by(|a, b| b.cmp(a));
        all
    }

    #[test]
    fn test_heap_evicts_minimum_and_raises_floor() {
        let mut heap = BoundedPairHeap::new(2);
        assert!(heap.push(ScoredPair { score: 0.5, first: 0, second: 1 }));
        assert!(heap.push(ScoredPair { score: 0.7, first: 0, second: 2 }));
        assert!(heap.push(ScoredPair { score: 0.9, first: 0, second: 3 }));
        assert_eq!(heap.len(), 2);
        assert_eq!(heap.floor(), 0.5);
        assert!(!heap.push(ScoredPair { score: 0.5, first: 1, second: 2 }));
        let mut scores: Vec<f32> = heap.into_vec().iter().map(|p| p.score).collect();
        scores.sort_by(|a, b| a.total_cmp(b));
        assert_eq!(scores, vec![0.7, 0.9]);
    }

    #[test]
    fn test_pairs_are_unique_canonical_and_sorted() {
        let store = sample();
        let pairs = PairMiner::new(2, 3, 100, 5).mine(&store).unwrap();
        let mut seen = HashSet::new();
        for pair in &pairs {
            assert!(pair.first < pair.second);
            assert!(seen.insert((pair.first, pair.second)));
        }
        for window in pairs.windows(2) {
            assert!(window[0].score >= window[1].score);
        }
    }

    #[test]
    fn test_full_top_k_matches_brute_force() {
        let store = sample();
        let expected = brute_force(&store);
        let pairs = PairMiner::new(500, 10_000, 1_000, store.len()).mine(&store).unwrap();
        assert_eq!(pairs.len(), expected.len());
        for (got, want) in pairs.iter().zip(&expected) {
            assert_eq!((got.first, got.second), (want.first, want.second));
            assert!((got.score - want.score).abs() < 1e-6);
        }
    }

    #[test]
    fn test_max_pairs_keeps_the_best_pairs() {
        let store = sample();
        let expected = brute_force(&store);
        // Both directions of a pair occupy a slot, so 2K slots hold the top K pairs.
        let pairs = PairMiner::new(4, 4, 6, store.len()).mine(&store).unwrap();
        assert_eq!(pairs.len(), 3);
        for (got, want) in pairs.iter().zip(&expected) {
            assert_eq!((got.first, got.second), (want.first, want.second));
        }
    }

    #[test]
    fn test_self_pairs_are_excluded() {
        let store = store(&[vec![1.0, 0.0], vec![0.0, 1.0]]);
        let pairs = PairMiner::new(1, 1, 10, 1).mine(&store).unwrap();
        assert_eq!(pairs.len(), 1);
        assert_eq!((pairs[0].first, pairs[0].second), (0, 1));
    }

    #[test]
    fn test_zero_budget_returns_nothing() {
        let pairs = PairMiner::new(10, 10, 0, 3).mine(&sample()).unwrap();
        assert!(pairs.is_empty());
    }
}
