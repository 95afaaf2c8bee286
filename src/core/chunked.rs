use crate::core::chunk_store::{digest_ids, ChunkManifest, ChunkStorage, MappedChunk};
use crate::core::duplicate::DedupError;
use crate::core::item::{Item, ItemId, SkippedItem};
use crate::core::similarity::dot;
use crate::core::similarity_map::SimilarityMap;
use crate::core::vector::{VectorError, VectorStore};
use crate::services::embedding::EmbeddingProvider;
use crate::services::progress::{DedupPhase, DedupProgress, NoProgress, ProgressObserver};
use rayon::prelude::*;
use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Result of a chunked similarity run.
#[derive(Debug, Clone, Default)]
pub struct ChunkedOutcome {
    pub similarity_map: SimilarityMap,
    pub skipped: Vec<SkippedItem>,
    pub embedded_count: usize,
    pub chunk_count: usize,
    pub comparisons: usize,
}

/// Edges found between two chunks, or the chunk that could not be read.
enum PairOutcome {
    Edges(SimilarityMap),
    Unreadable { chunk: usize },
}

/// Out-of-core similarity: embed and persist fixed-size chunks, then compare every
/// unordered pair of chunks (including each chunk with itself).
pub struct ChunkedSimilarityBuilder<'a, P: EmbeddingProvider + ?Sized> {
    provider: &'a P,
    chunk_size: usize,
    threshold: f32,
    embed_batch_size: usize,
    resume: bool,
    observer: &'a dyn ProgressObserver,
    cancellation_token: Arc<AtomicBool>,
}

impl<'a, P: EmbeddingProvider + ?Sized> ChunkedSimilarityBuilder<'a, P> {
    pub fn new(provider: &'a P, chunk_size: usize, threshold: f32) -> Self {
        Self {
            provider,
            chunk_size: chunk_size.max(1),
            threshold,
            embed_batch_size: 32,
            resume: false,
            observer: &NoProgress,
            cancellation_token: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_embed_batch_size(mut self, batch_size: usize) -> Self {
        self.embed_batch_size = batch_size.max(1);
        self
    }

    /// Reuse chunks already persisted for the same input ids and provider.
    pub fn with_resume(mut self, resume: bool) -> Self {
        self.resume = resume;
        self
    }

    pub fn with_observer(mut self, observer: &'a dyn ProgressObserver) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_cancellation_token(mut self, token: Arc<AtomicBool>) -> Self {
        self.cancellation_token = token;
        self
    }

    fn cancelled(&self) -> bool {
        self.cancellation_token.load(Ordering::Relaxed)
    }

    pub fn build(&self, items: &[Item], storage: &ChunkStorage) -> Result<ChunkedOutcome, DedupError> {
        let mut outcome = ChunkedOutcome::default();
        let chunks = self.embed_chunks(items, storage, &mut outcome)?;
        self.compare_chunks(&chunks, storage, &mut outcome)?;
        Ok(outcome)
    }

    /// Embed and persist every chunk. Returns the manifests and ids of stored chunks.
    fn embed_chunks(
        &self,
        items: &[Item],
        storage: &ChunkStorage,
        outcome: &mut ChunkedOutcome,
    ) -> Result<Vec<(ChunkManifest, Vec<ItemId>)>, DedupError> {
        let total_chunks = items.len().div_ceil(self.chunk_size);
        let start = Instant::now();
        let mut stored = Vec::with_capacity(total_chunks);
        let mut failed_chunks = 0usize;

        for (index, chunk) in items.chunks(self.chunk_size).enumerate() {
            if self.cancelled() {
                return Err(DedupError::Cancelled);
            }
            let message = format!("Processing chunk {}/{} ({} items)", index + 1, total_chunks, chunk.len());
            log::info!("{}", message);
            self.observer
                .on_progress(&DedupProgress::new(DedupPhase::ChunkEmbedding, index, total_chunks, message));

            let input_ids: Vec<ItemId> = chunk.iter().map(|item| item.id.clone()).collect();
            let input_digest = digest_ids(&input_ids);

            if let Some((manifest, ids)) = self.resumable_chunk(storage, index, &input_digest) {
                log::info!("Reusing persisted chunk {} ({} embeddings)", index, manifest.embedded);
                record_missing(&input_ids, &ids, "skipped in the run that persisted this chunk", outcome);
                outcome.embedded_count += ids.len();
                stored.push((manifest, ids));
                continue;
            }

            let vectors = self.embed_chunk(chunk, outcome)?;
            self.provider.evict(chunk);

            if vectors.is_empty() {
                log::warn!("Chunk {} produced no embeddings; skipping it", index);
                continue;
            }

            let ids: Vec<ItemId> = vectors.items().iter().map(|item| item.id.clone()).collect();
            match storage.write_chunk(index, self.provider.name(), &input_digest, &ids, vectors.as_block()) {
                Ok(manifest) => {
                    outcome.embedded_count += ids.len();
                    stored.push((manifest, ids));
                }
                Err(e) => {
                    log::warn!("Failed to persist chunk {}: {}", index, e);
                    failed_chunks += 1;
                    for id in ids {
                        outcome.skipped.push(SkippedItem::new(id, format!("chunk {index} could not be stored: {e}")));
                    }
                }
            }
        }

        log::info!(
            "Calculated chunk embeddings in {:.2} seconds",
            start.elapsed().as_secs_f64()
        );
        outcome.chunk_count = stored.len();

        if stored.is_empty() {
            if failed_chunks > 0 {
                return Err(DedupError::AllChunksFailed { chunks: failed_chunks });
            }
            return Err(DedupError::NoUsableItems {
                skipped: outcome.skipped.len(),
            });
        }
        Ok(stored)
    }

    fn resumable_chunk(
        &self,
        storage: &ChunkStorage,
        index: usize,
        input_digest: &str,
    ) -> Option<(ChunkManifest, Vec<ItemId>)> {
        if !self.resume {
            return None;
        }
        let manifest = match storage.read_manifest(index) {
            Ok(Some(manifest)) => manifest,
            Ok(None) => return None,
            Err(e) => {
                log::warn!("Ignoring unreadable manifest for chunk {}: {}", index, e);
                return None;
            }
        };
        if manifest.input_digest != input_digest
            || manifest.provider != self.provider.name()
            || manifest.dimensions != self.provider.dimensions()
        {
            log::debug!("Persisted chunk {} does not match this run; recomputing", index);
            return None;
        }
        match storage.read_ids(index) {
            Ok(ids) if ids.len() == manifest.embedded => Some((manifest, ids)),
            Ok(_) => None,
            Err(e) => {
                log::warn!("Ignoring persisted chunk {}: {}", index, e);
                None
            }
        }
    }

    /// Normalized embeddings for the items of one chunk; failed items are recorded and dropped.
    fn embed_chunk(&self, chunk: &[Item], outcome: &mut ChunkedOutcome) -> Result<VectorStore, DedupError> {
        let mut store = VectorStore::with_capacity(self.provider.dimensions(), chunk.len());
        for batch in chunk.chunks(self.embed_batch_size) {
            if self.cancelled() {
                return Err(DedupError::Cancelled);
            }
            for (item, result) in batch.iter().zip(self.provider.embed_batch(batch)) {
                let reason = match result {
                    Ok(vector) => match store.push(item.clone(), vector) {
                        Ok(_) => continue,
                        // A provider producing the wrong length is misconfigured, not one bad item.
                        Err(e @ (VectorError::DimensionMismatch { .. } | VectorError::EmptyDimension)) => {
                            return Err(e.into());
                        }
                        Err(e) => e.to_string(),
                    },
                    Err(e) => e.to_string(),
                };
                log::warn!("Skipping item {}: {}", item.id, reason);
                outcome.skipped.push(SkippedItem::new(item.id.clone(), reason));
            }
        }
        Ok(store)
    }

    /// Compare every unordered chunk pair. Each left chunk is mapped and decoded once;
    /// the chunks it is compared against are read row by row from their mappings.
    fn compare_chunks(
        &self,
        chunks: &[(ChunkManifest, Vec<ItemId>)],
        storage: &ChunkStorage,
        outcome: &mut ChunkedOutcome,
    ) -> Result<(), DedupError> {
        let total = chunks.len() * (chunks.len() + 1) / 2;
        let completed = AtomicUsize::new(0);
        let start = Instant::now();
        let mut unreadable: BTreeSet<usize> = BTreeSet::new();

        log::info!(
            "Computing pairwise similarities across {} chunks ({} comparisons)",
            chunks.len(),
            total
        );

        for i in 0..chunks.len() {
            if self.cancelled() {
                return Err(DedupError::Cancelled);
            }
            if unreadable.contains(&i) {
                continue;
            }
            let left = match storage.read_chunk(&chunks[i].0) {
                Ok(chunk) => chunk,
                Err(e) => {
                    log::warn!("Failed to read chunk {}: {}", chunks[i].0.chunk_index, e);
                    unreadable.insert(i);
                    continue;
                }
            };
            let left_vectors = left.to_vec();

            let results: Vec<Result<PairOutcome, DedupError>> = (i..chunks.len())
                .into_par_iter()
                .map(|j| {
                    if self.cancelled() {
                        return Err(DedupError::Cancelled);
                    }
                    let map = if i == j {
                        chunk_edges(&left, &left_vectors, &left, true, self.threshold)
                    } else {
                        let right = match storage.read_chunk(&chunks[j].0) {
                            Ok(chunk) => chunk,
                            Err(e) => {
                                log::warn!("Failed to read chunk {}: {}", chunks[j].0.chunk_index, e);
                                return Ok(PairOutcome::Unreadable { chunk: j });
                            }
                        };
                        chunk_edges(&left, &left_vectors, &right, false, self.threshold)
                    };

                    let done = completed.fetch_add(1, Ordering::Relaxed) + 1;
                    let message = format!(
                        "Comparing chunks {} vs {} ({}/{}, {}%)",
                        chunks[i].0.chunk_index,
                        chunks[j].0.chunk_index,
                        done,
                        total,
                        done * 100 / total.max(1)
                    );
                    log::info!("{}", message);
                    self.observer
                        .on_progress(&DedupProgress::new(DedupPhase::ChunkComparison, done, total, message));
                    Ok(PairOutcome::Edges(map))
                })
                .collect();

            for result in results {
                match result? {
                    PairOutcome::Edges(map) => {
                        outcome.similarity_map.merge(map);
                        outcome.comparisons += 1;
                    }
                    PairOutcome::Unreadable { chunk } => {
                        unreadable.insert(chunk);
                    }
                }
            }
        }

        for &chunk in &unreadable {
            let (manifest, ids) = &chunks[chunk];
            outcome.embedded_count -= ids.len();
            for id in ids {
                outcome.skipped.push(SkippedItem::new(
                    id.clone(),
                    format!("chunk {} could not be read back", manifest.chunk_index),
                ));
            }
        }
        if !unreadable.is_empty() && unreadable.len() == chunks.len() {
            return Err(DedupError::AllChunksFailed { chunks: chunks.len() });
        }

        log::info!(
            "Calculated similarity map in {:.2} seconds ({} edges across {} items)",
            start.elapsed().as_secs_f64(),
            outcome.similarity_map.len(),
            outcome.similarity_map.item_count()
        );
        Ok(())
    }
}

/// Edges at or above `threshold` between `left` (already decoded) and `right`.
///
/// For a chunk against itself only the upper triangle is scanned; the diagonal is an
/// item compared with itself and never counts.
fn chunk_edges(
    left: &MappedChunk,
    left_vectors: &[f32],
    right: &MappedChunk,
    same_chunk: bool,
    threshold: f32,
) -> SimilarityMap {
    let dims = left.dims();
    let mut map = SimilarityMap::new();
    let mut row = vec![0.0f32; dims];
    for b in 0..right.len() {
        right.read_row(b, &mut row);
        let rows_above = if same_chunk { b } else { left.len() };
        for a in 0..rows_above {
            let score = dot(&left_vectors[a * dims..(a + 1) * dims], &row);
            if score >= threshold {
                map.insert(left.ids[a].clone(), right.ids[b].clone(), score);
            }
        }
    }
    map
}

fn record_missing(input: &[ItemId], stored: &[ItemId], reason: &str, outcome: &mut ChunkedOutcome) {
    let stored: HashSet<&ItemId> = stored.iter().collect();
    for id in input.iter().filter(|id| !stored.contains(id)) {
        outcome.skipped.push(SkippedItem::new(id.clone(), reason));
    }
}
