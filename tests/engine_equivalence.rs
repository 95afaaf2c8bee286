use photodedup::core::similarity::cos_sim;
use photodedup::core::vector::VectorStore;
use photodedup::{
    DedupConfig, DedupMode, DedupReport, DuplicateDetector, Item, ItemId, PrecomputedEmbedder,
    SimilarityMap,
};
use std::collections::{HashMap, HashSet};
use tempfile::TempDir;

fn embedder(entries: &[(&str, Vec<f32>)]) -> PrecomputedEmbedder {
    PrecomputedEmbedder::from_entries(
        entries
            .iter()
            .map(|(id, v)| (ItemId::from(*id), v.clone())),
    )
    .unwrap()
}

/// Four tight clusters of three, interleaved so every chunking splits them.
fn clustered() -> (Vec<Item>, PrecomputedEmbedder) {
    let mut items = Vec::new();
    let mut embedder = PrecomputedEmbedder::new(6);
    for k in 0..3 {
        for c in 0..4 {
            let id = format!("c{c}-{k}");
            let mut vector = vec![0.0; 6];
            vector[c] = 1.0;
            vector[4] = 0.01 * k as f32;
            vector[5] = 0.005 * c as f32;
            items.push(Item::new(id.as_str(), 100 + k as u32, 100));
            embedder.insert(ItemId::from(id), vector).unwrap();
        }
    }
    (items, embedder)
}

fn in_memory(items: &[Item], embedder: PrecomputedEmbedder, config: DedupConfig) -> DedupReport {
    DuplicateDetector::new(config, embedder).unwrap().run(items).unwrap()
}

fn chunked(
    items: &[Item],
    embedder: PrecomputedEmbedder,
    config: DedupConfig,
    chunk_size: usize,
) -> DedupReport {
    let dir = TempDir::new().unwrap();
    let config = DedupConfig {
        chunk_size: Some(chunk_size),
        chunk_dir: Some(dir.path().to_path_buf()),
        ..config
    };
    let report = DuplicateDetector::new(config, embedder).unwrap().run(items).unwrap();
    assert_eq!(report.mode, DedupMode::Chunked);
    report
}

fn member_sets(report: &DedupReport) -> Vec<Vec<String>> {
    let mut sets: Vec<Vec<String>> = report
        .groups
        .iter()
        .map(|g| {
            let mut ids: Vec<String> = g.media_item_ids.iter().map(ToString::to_string).collect();
            ids.sort();
            ids
        })
        .collect();
    sets.sort();
    sets
}

fn sorted_edges(map: &SimilarityMap) -> Vec<(String, String, f32)> {
    let mut edges: Vec<(String, String, f32)> = map
        .edges()
        .map(|(a, b, s)| (a.to_string(), b.to_string(), s))
        .collect();
    edges.sort_by(|x, y| (&x.0, &x.1).cmp(&(&y.0, &y.1)));
    edges
}

fn assert_same_map(left: &SimilarityMap, right: &SimilarityMap) {
    let left = sorted_edges(left);
    let right = sorted_edges(right);
    assert_eq!(left.len(), right.len());
    for (l, r) in left.iter().zip(&right) {
        assert_eq!((&l.0, &l.1), (&r.0, &r.1));
        assert!((l.2 - r.2).abs() < 1e-5, "{l:?} vs {r:?}");
    }
}

#[test]
fn test_orthogonal_pairs_group_the_same_on_both_paths() {
    let vectors = [
        ("a", vec![1.0, 0.0, 0.0]),
        ("b", vec![0.0, 1.0, 0.0]),
        ("c", vec![1.0, 0.0, 0.0]),
        ("d", vec![0.0, 1.0, 0.0]),
    ];
    let items: Vec<Item> = vectors.iter().map(|(id, _)| Item::new(*id, 10, 10)).collect();
    let expected = vec![vec!["a", "c"], vec!["b", "d"]];

    let memory = in_memory(&items, embedder(&vectors), DedupConfig::with_threshold(0.9));
    assert_eq!(member_sets(&memory), expected);

    let disk = chunked(&items, embedder(&vectors), DedupConfig::with_threshold(0.9), 2);
    assert_eq!(member_sets(&disk), expected);
    assert_same_map(&memory.similarity_map, &disk.similarity_map);
}

#[test]
fn test_chunk_size_does_not_change_the_result() {
    let (items, embedder) = clustered();
    let reference = chunked(&items, embedder.clone(), DedupConfig::default(), items.len());
    assert_eq!(reference.groups.len(), 4);
    assert_eq!(reference.similarity_map.len(), 12);

    for chunk_size in [1, 2, 4, 5] {
        let report = chunked(&items, embedder.clone(), DedupConfig::default(), chunk_size);
        assert_eq!(member_sets(&report), member_sets(&reference), "chunk_size {chunk_size}");
        assert_same_map(&report.similarity_map, &reference.similarity_map);
    }

    let memory = in_memory(&items, embedder, DedupConfig::default());
    assert_eq!(member_sets(&memory), member_sets(&reference));
    assert_same_map(&memory.similarity_map, &reference.similarity_map);
}

#[test]
fn test_min_community_size_only_limits_in_memory_groups() {
    let vectors = [
        ("a", vec![1.0, 0.0]),
        ("b", vec![0.0, 1.0]),
        ("c", vec![1.0, 0.0]),
        ("d", vec![0.0, 1.0]),
    ];
    let items: Vec<Item> = vectors.iter().map(|(id, _)| Item::new(*id, 10, 10)).collect();
    let config = DedupConfig {
        threshold: 0.9,
        min_community_size: 3,
        ..Default::default()
    };

    let memory = in_memory(&items, embedder(&vectors), config.clone());
    assert!(memory.groups.is_empty());
    assert_eq!(memory.similarity_map.len(), 2);

    let disk = chunked(&items, embedder(&vectors), config, 2);
    assert_eq!(disk.groups.len(), 2);
}

#[test]
fn test_chunked_groups_are_connected_components() {
    // a~b and b~c clear the threshold, a~c does not
    let angle = |deg: f32| {
        let rad = deg.to_radians();
        vec![rad.cos(), rad.sin(), 0.0]
    };
    let vectors = [
        ("a", angle(0.0)),
        ("b", angle(8.0)),
        ("c", angle(16.0)),
        ("d", vec![0.0, 0.0, 1.0]),
    ];
    let items: Vec<Item> = vectors.iter().map(|(id, _)| Item::new(*id, 10, 10)).collect();
    let threshold = 10.0f32.to_radians().cos();

    let report = chunked(&items, embedder(&vectors), DedupConfig::with_threshold(threshold), 2);
    assert_eq!(report.similarity_map.len(), 2);
    assert!(report.similarity_map.get(&ItemId::from("a"), &ItemId::from("c")).is_none());
    assert_eq!(member_sets(&report), vec![vec!["a", "b", "c"]]);

    let group_of: HashMap<&ItemId, &str> = report
        .groups
        .iter()
        .flat_map(|g| g.media_item_ids.iter().map(move |id| (id, g.id.as_str())))
        .collect();
    for (a, b, _) in report.similarity_map.edges() {
        assert_eq!(group_of[a], group_of[b]);
    }
}

#[test]
fn test_original_is_largest_or_first_encountered() {
    let same = vec![0.6, 0.8];
    for chunk_size in [None, Some(1)] {
        let dir = TempDir::new().unwrap();
        let config = DedupConfig {
            chunk_size,
            chunk_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        let run = |items: Vec<Item>| {
            let embedder = embedder(&[("x", same.clone()), ("y", same.clone())]);
            DuplicateDetector::new(config.clone(), embedder)
                .unwrap()
                .run(&items)
                .unwrap()
        };

        let tie = run(vec![Item::new("x", 100, 100), Item::new("y", 200, 50)]);
        assert_eq!(tie.groups[0].original_media_item_id, ItemId::from("x"));

        let tie = run(vec![Item::new("y", 200, 50), Item::new("x", 100, 100)]);
        assert_eq!(tie.groups[0].original_media_item_id, ItemId::from("y"));

        let larger = run(vec![Item::new("x", 100, 100), Item::new("y", 300, 300)]);
        assert_eq!(larger.groups[0].original_media_item_id, ItemId::from("y"));
    }
}

#[test]
fn test_similarity_is_symmetric_with_unit_diagonal() {
    let (items, embedder) = clustered();
    let mut store = VectorStore::new(6);
    for item in &items {
        let vector = photodedup::EmbeddingProvider::embed(&embedder, item).unwrap();
        store.push(item.clone(), vector).unwrap();
    }
    let matrix = cos_sim(store.as_block(), store.as_block()).unwrap();
    for i in 0..store.len() {
        assert!((matrix.get(i, i) - 1.0).abs() < 1e-5);
        for j in 0..store.len() {
            assert!((matrix.get(i, j) - matrix.get(j, i)).abs() < 1e-6);
        }
    }
}

#[test]
fn test_groups_are_disjoint_and_cover_duplicates() {
    let (items, embedder) = clustered();
    let report = in_memory(&items, embedder, DedupConfig::default());
    let mut seen = HashSet::new();
    for group in &report.groups {
        assert!(group.len() >= 2);
        assert!(group.media_item_ids.contains(&group.original_media_item_id));
        for id in &group.media_item_ids {
            assert!(seen.insert(id.clone()), "{id} appears in two groups");
        }
    }
    assert_eq!(seen.len(), items.len());
}
