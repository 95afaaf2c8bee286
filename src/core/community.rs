use crate::core::similarity::{cos_sim, kth_largest, top_k};
use crate::core::vector::{VectorError, VectorStore};
use std::collections::HashSet;

/// Row indices of one duplicate cluster, ascending.
pub type Community = Vec<usize>;

/// Fast community detection over a [`VectorStore`].
///
/// Every row with at least `min_community_size` neighbors at or above `threshold`
/// seeds a raw cluster. Raw clusters are then taken largest first, and each member
/// belongs to the first accepted cluster that claims it.
#[derive(Debug, Clone)]
pub struct CommunityDetector {
    threshold: f32,
    min_community_size: usize,
    batch_size: usize,
}

impl CommunityDetector {
    pub fn new(threshold: f32, min_community_size: usize, batch_size: usize) -> Self {
        Self {
            threshold,
            min_community_size,
            batch_size: batch_size.max(1),
        }
    }

    /// Clusters sorted by size, largest first. Clusters are pairwise disjoint.
    pub fn detect(&self, store: &VectorStore) -> Result<Vec<Community>, VectorError> {
        let len = store.len();
        if len == 0 {
            return Ok(Vec::new());
        }

        let min_size = self.min_community_size.clamp(1, len);
        let mut sort_max_size = (2 * min_size).max(50).min(len);
        let corpus = store.as_block();
        let mut extracted: Vec<Community> = Vec::new();

        for start in (0..len).step_by(self.batch_size) {
            let batch = corpus.slice(start, start + self.batch_size);
            let mut scores = cos_sim(batch, corpus)?;

            for row in 0..batch.len() {
                // A row is its own neighbor at exactly 1.0, rounding aside.
                scores.set(row, start + row, 1.0);
                let row_scores = scores.row(row);

                match kth_largest(row_scores, min_size) {
                    Some(kth) if kth >= self.threshold => {}
                    _ => continue,
                }

                let mut neighbors = top_k(row_scores, sort_max_size);
                while sort_max_size < len
                    && neighbors
                        .last()
                        .is_some_and(|&(_, weakest)| weakest > self.threshold)
                {
                    sort_max_size = (2 * sort_max_size).min(len);
                    neighbors = top_k(row_scores, sort_max_size);
                }

                let cluster: Community = neighbors
                    .iter()
                    .take_while(|&&(_, score)| score >= self.threshold)
                    .map(|&(idx, _)| idx)
                    .collect();
                extracted.push(cluster);
            }
        }

        // Stable: equal sizes keep the order they were produced in.
        extracted.sort_by(|a, b| b.len().cmp(&a.len()));

        let mut claimed: HashSet<usize> = HashSet::new();
        let mut unique: Vec<Community> = Vec::new();
        for mut community in extracted {
            community.sort_unstable();
            let remaining: Community = community
                .into_iter()
                .filter(|idx| !claimed.contains(idx))
                .collect();
            if remaining.len() >= min_size {
                claimed.extend(remaining.iter().copied());
                unique.push(remaining);
            }
        }

        unique.sort_by(|a, b| b.len().cmp(&a.len()));
        log::debug!(
            "Community detection kept {} of {} rows in {} clusters",
            claimed.len(),
            len,
            unique.len()
        );
        Ok(unique)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::item::Item;

    fn store(vectors: &[Vec<f32>]) -> VectorStore {
        let dims = vectors[0].len();
        let mut store = VectorStore::new(dims);
        for (i, v) in vectors.iter().enumerate() {
            store.push(Item::new(format!("item-{i}"), 1, 1), v.clone()).unwrap();
        }
        store
    }

    #[test]
    fn test_identical_pairs_form_two_communities() {
        let store = store(&[
            vec![1.0, 0.0, 0.0],
            vec![0.0, 1.0, 0.0],
            vec![1.0, 0.0, 0.0],
            vec![0.0, 1.0, 0.0],
        ]);
        let communities = CommunityDetector::new(0.9, 2, 128).detect(&store).unwrap();
        assert_eq!(communities, vec![vec![0, 2], vec![1, 3]]);
    }

    #[test]
    fn test_isolated_rows_seed_nothing() {
        let store = store(&[vec![1.0, 0.0, 0.0], vec![0.0, 1.0, 0.0], vec![0.0, 0.0, 1.0]]);
        let communities = CommunityDetector::new(0.5, 2, 2).detect(&store).unwrap();
        assert!(communities.is_empty());
    }

    #[test]
    fn test_largest_cluster_claims_overlapping_members() {
        // 0,1,2 are mutually close; 3 is close to 2 only.
        let store = store(&[
            vec![1.0, 0.0],
            vec![0.999, 0.045],
            vec![0.995, 0.1],
            vec![0.98, 0.2],
            vec![-1.0, 0.0],
        ]);
        let detector = CommunityDetector::new(0.99, 2, 1);
        let communities = detector.detect(&store).unwrap();

        let mut seen = HashSet::new();
        for community in &communities {
            assert!(community.len() >= 2);
            for idx in community {
                assert!(seen.insert(*idx), "index {idx} claimed twice");
            }
        }
        for pair in communities.windows(2) {
            assert!(pair[0].len() >= pair[1].len());
        }
        assert!(!seen.contains(&4));
    }

    #[test]
    fn test_min_community_size_filters_small_clusters() {
        let store = store(&[
            vec![1.0, 0.0],
            vec![1.0, 0.0],
            vec![1.0, 0.0],
            vec![0.0, 1.0],
            vec![0.0, 1.0],
        ]);
        let communities = CommunityDetector::new(0.9, 3, 128).detect(&store).unwrap();
        assert_eq!(communities, vec![vec![0, 1, 2]]);
    }

    #[test]
    fn test_candidate_window_grows_past_initial_size() {
        // 120 identical vectors exceed the initial window of 50 neighbors.
        let mut vectors = vec![vec![1.0, 0.0]; 120];
        vectors.push(vec![0.0, 1.0]);
        let store = store(&vectors);
        let communities = CommunityDetector::new(0.95, 2, 16).detect(&store).unwrap();
        assert_eq!(communities.len(), 1);
        assert_eq!(communities[0], (0..120).collect::<Vec<_>>());
    }

    #[test]
    fn test_min_size_is_clamped_to_store_size() {
        let store = store(&[vec![1.0, 0.0], vec![1.0, 0.0]]);
        let communities = CommunityDetector::new(0.9, 5, 128).detect(&store).unwrap();
        assert_eq!(communities, vec![vec![0, 1]]);
    }

    #[test]
    fn test_empty_store() {
        let store = VectorStore::new(4);
        assert!(CommunityDetector::new(0.9, 2, 8).detect(&store).unwrap().is_empty());
    }
}
