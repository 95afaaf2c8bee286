use crate::core::item::ItemId;
use crate::core::mining::ScoredPair;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;

/// Sparse, symmetric, irreflexive similarity graph keyed by item id.
///
/// Every edge is stored in both directions; self-edges are refused.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SimilarityMap {
    adjacency: BTreeMap<ItemId, BTreeMap<ItemId, f32>>,
    edge_count: usize,
}

impl SimilarityMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `a ~ b` with `score` (clamped to [-1, 1]). Returns `false` for a self-edge.
    pub fn insert(&mut self, a: ItemId, b: ItemId, score: f32) -> bool {
        if a == b {
            return false;
        }
        let score = score.clamp(-1.0, 1.0);
        let previous = self
            .adjacency
            .entry(a.clone())
            .or_default()
            .insert(b.clone(), score);
        self.adjacency.entry(b).or_default().insert(a, score);
        if previous.is_none() {
            self.edge_count += 1;
        }
        true
    }

    pub fn get(&self, a: &ItemId, b: &ItemId) -> Option<f32> {
        self.adjacency.get(a).and_then(|neighbors| neighbors.get(b)).copied()
    }

    pub fn neighbors(&self, id: &ItemId) -> impl Iterator<Item = (&ItemId, f32)> {
        self.adjacency
            .get(id)
            .into_iter()
            .flat_map(|neighbors| neighbors.iter().map(|(other, score)| (other, *score)))
    }

    /// Each unordered edge once, as `(smaller id, larger id, score)`.
    pub fn edges(&self) -> impl Iterator<Item = (&ItemId, &ItemId, f32)> {
        self.adjacency.iter().flat_map(|(a, neighbors)| {
            neighbors
                .iter()
                .filter(move |(b, _)| a < *b)
                .map(move |(b, score)| (a, b, *score))
        })
    }

    pub fn merge(&mut self, other: SimilarityMap) {
        for (a, neighbors) in other.adjacency {
            for (b, score) in neighbors {
                if a < b {
                    self.insert(a.clone(), b, score);
                }
            }
        }
    }

    /// Number of unordered edges.
    pub fn len(&self) -> usize {
        self.edge_count
    }

    pub fn is_empty(&self) -> bool {
        self.edge_count == 0
    }

    /// Number of items with at least one edge.
    pub fn item_count(&self) -> usize {
        self.adjacency.len()
    }

    /// Keep mined pairs scoring at or above `threshold`. `ids[i]` names store row `i`.
    pub fn from_pairs(pairs: &[ScoredPair], ids: &[ItemId], threshold: f32) -> Self {
        let mut map = Self::new();
        for pair in pairs.iter().filter(|pair| pair.score >= threshold) {
            map.insert(ids[pair.first].clone(), ids[pair.second].clone(), pair.score);
        }
        map
    }
}

impl Serialize for SimilarityMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.adjacency.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for SimilarityMap {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = BTreeMap::<ItemId, BTreeMap<ItemId, f32>>::deserialize(deserializer)?;
        let mut map = Self::new();
        for (a, neighbors) in raw {
            for (b, score) in neighbors {
                map.insert(a.clone(), b, score);
            }
        }
        Ok(map)
    }
}
