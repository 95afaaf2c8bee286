use crate::core::community::Community;
use crate::core::item::{Group, Item, ItemId};
use crate::core::similarity_map::SimilarityMap;
use std::collections::HashMap;

/// Disjoint sets over `0..n` with path halving and union by size.
#[derive(Debug, Clone)]
pub struct UnionFind {
    parent: Vec<usize>,
    size: Vec<usize>,
}

impl UnionFind {
    pub fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
            size: vec![1; n],
        }
    }

    pub fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    /// Returns `true` if `a` and `b` were in different sets.
    pub fn union(&mut self, a: usize, b: usize) -> bool {
        let (mut ra, mut rb) = (self.find(a), self.find(b));
        if ra == rb {
            return false;
        }
        if self.size[ra] < self.size[rb] {
            std::mem::swap(&mut ra, &mut rb);
        }
        self.parent[rb] = ra;
        self.size[ra] += self.size[rb];
        true
    }

    pub fn len(&self) -> usize {
        self.parent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parent.is_empty()
    }

    /// Sets with at least `min_size` members, each ascending, ordered by smallest member.
    pub fn components(&mut self, min_size: usize) -> Vec<Vec<usize>> {
        let mut by_root: HashMap<usize, usize> = HashMap::new();
        let mut components: Vec<Vec<usize>> = Vec::new();
        for idx in 0..self.parent.len() {
            let root = self.find(idx);
            if self.size[root] < min_size {
                continue;
            }
            let slot = *by_root.entry(root).or_insert_with(|| {
                components.push(Vec::new());
                components.len() - 1
            });
            components[slot].push(idx);
        }
        components
    }
}

/// Connected components of the similarity graph as duplicate groups.
///
/// Edges naming ids not present in `items` are ignored. Groups come out ordered by
/// their first member's position in `items`.
pub fn build_groups(map: &SimilarityMap, items: &[Item]) -> Vec<Group> {
    let index: HashMap<&ItemId, usize> = items.iter().enumerate().map(|(i, item)| (&item.id, i)).collect();
    let mut sets = UnionFind::new(items.len());
    let mut unknown = 0usize;

    for (a, b, _) in map.edges() {
        match (index.get(a), index.get(b)) {
            (Some(&ia), Some(&ib)) => {
                sets.union(ia, ib);
            }
            _ => unknown += 1,
        }
    }
    if unknown > 0 {
        log::warn!("Ignored {} similarity edges referencing unknown items", unknown);
    }

    sets.components(2)
        .iter()
        .enumerate()
        .filter_map(|(n, members)| Group::from_members(n.to_string(), members, items))
        .collect()
}

/// Duplicate groups from detected communities; `items[i]` names store row `i`.
pub fn groups_from_communities(communities: &[Community], items: &[Item]) -> Vec<Group> {
    communities
        .iter()
        .map(|members| {
            let mut members = members.clone();
            members.sort_unstable();
            members
        })
        .enumerate()
        .filter_map(|(n, members)| Group::from_members(n.to_string(), &members, items))
        .collect()
}
