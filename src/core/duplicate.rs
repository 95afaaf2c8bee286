// Duplicate detection over a batch of items:
// - in-memory: pair mining for the similarity map, community detection for groups
// - chunked: persisted chunk comparison for the similarity map, union-find for groups

use crate::config::{ConfigError, DedupConfig};
use crate::core::chunk_store::{default_chunk_root, digest_ids, ChunkStoreError, ChunkStorage};
use crate::core::chunked::ChunkedSimilarityBuilder;
use crate::core::community::CommunityDetector;
use crate::core::groups::{build_groups, groups_from_communities};
use crate::core::item::{Group, Item, ItemId, SkippedItem};
use crate::core::mining::{PairMiner, ScoredPair};
use crate::core::similarity_map::SimilarityMap;
use crate::core::vector::{VectorError, VectorStore};
use crate::services::embedding::EmbeddingProvider;
use crate::services::progress::{DedupPhase, DedupProgress, NoProgress, ProgressObserver};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DedupError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Vector error: {0}")]
    Vector(#[from] VectorError),

    #[error("Chunk storage error: {0}")]
    Storage(#[from] ChunkStoreError),

    #[error("Duplicate item id: {id}")]
    DuplicateItemId { id: String },

    #[error("No usable items: {skipped} item(s) were skipped")]
    NoUsableItems { skipped: usize },

    #[error("All {chunks} chunk(s) failed to persist or load")]
    AllChunksFailed { chunks: usize },

    #[error("Operation cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupMode {
    InMemory,
    Chunked,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DedupReport {
    pub generated_at: String,
    pub threshold: f32,
    pub mode: DedupMode,
    pub item_count: usize,
    pub embedded_count: usize,
    pub skipped: Vec<SkippedItem>,
    pub similarity_map: SimilarityMap,
    pub groups: Vec<Group>,
}

impl DedupReport {
    pub fn skipped_count(&self) -> usize {
        self.skipped.len()
    }
}

pub struct DuplicateDetector<P: EmbeddingProvider> {
    config: DedupConfig,
    provider: P,
    observer: Box<dyn ProgressObserver>,
    cancellation_token: Arc<AtomicBool>,
}

impl<P: EmbeddingProvider> DuplicateDetector<P> {
    pub fn new(config: DedupConfig, provider: P) -> Result<Self, DedupError> {
        config.validate()?;
        Ok(Self {
            config,
            provider,
            observer: Box::new(NoProgress),
            cancellation_token: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn with_observer(mut self, observer: impl ProgressObserver + 'static) -> Self {
        self.observer = Box::new(observer);
        self
    }

    pub fn get_cancellation_token(&self) -> Arc<AtomicBool> {
        self.cancellation_token.clone()
    }

    pub fn cancel(&self) {
        self.cancellation_token.store(true, Ordering::Relaxed);
    }

    fn check_cancelled(&self) -> Result<(), DedupError> {
        if self.cancellation_token.load(Ordering::Relaxed) {
            return Err(DedupError::Cancelled);
        }
        Ok(())
    }

    fn send_progress(&self, phase: DedupPhase, completed: usize, total: usize, message: impl Into<String>) {
        self.observer
            .on_progress(&DedupProgress::new(phase, completed, total, message));
    }

    /// Find duplicate groups among `items`.
    ///
    /// Items that cannot be embedded are skipped and listed in the report; the run only
    /// fails on bad input, cancellation, or when nothing usable is left.
    pub fn run(&self, items: &[Item]) -> Result<DedupReport, DedupError> {
        check_unique_ids(items)?;
        if self.provider.dimensions() == 0 {
            return Err(VectorError::EmptyDimension.into());
        }
        self.check_cancelled()?;

        let report = match self.config.chunk_size {
            Some(chunk_size) => self.run_chunked(items, chunk_size)?,
            None => self.run_in_memory(items)?,
        };

        log::info!(
            "Found {} duplicate group(s) among {} items ({} skipped)",
            report.groups.len(),
            report.item_count,
            report.skipped_count()
        );
        self.send_progress(
            DedupPhase::Complete,
            report.groups.len(),
            report.groups.len(),
            "Duplicate detection complete",
        );
        Ok(report)
    }

    /// Embed and normalize `items` in batches; failed items are returned as skipped.
    pub fn embed_all(&self, items: &[Item]) -> Result<(VectorStore, Vec<SkippedItem>), DedupError> {
        let start = Instant::now();
        let batch_size = self.config.embed_batch_size;
        let total_batches = items.len().div_ceil(batch_size);
        let mut store = VectorStore::with_capacity(self.provider.dimensions(), items.len());
        let mut skipped = Vec::new();

        log::info!("Calculating embeddings for {} images", items.len());
        for (batch_index, batch) in items.chunks(batch_size).enumerate() {
            self.check_cancelled()?;
            self.send_progress(
                DedupPhase::Embedding,
                batch_index,
                total_batches,
                format!("Computing embeddings: batch {}/{}", batch_index + 1, total_batches),
            );

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
                log::warn!("Skipping invalid image {}: {}", item.id, reason);
                skipped.push(SkippedItem::new(item.id.clone(), reason));
            }
            self.provider.evict(batch);
        }

        log::info!("Calculated embeddings in {:.2} seconds", start.elapsed().as_secs_f64());
        Ok((store, skipped))
    }

    /// Ranked top pairs of `store` under the configured mining budget.
    pub fn mine_pairs(&self, store: &VectorStore) -> Result<Vec<ScoredPair>, DedupError> {
        let miner = PairMiner::new(
            self.config.query_chunk_size,
            self.config.corpus_chunk_size,
            self.config.max_pairs,
            self.config.top_k,
        );
        Ok(miner.mine(store)?)
    }

    fn run_in_memory(&self, items: &[Item]) -> Result<DedupReport, DedupError> {
        let (store, skipped) = self.embed_all(items)?;
        if store.is_empty() {
            return Err(DedupError::NoUsableItems {
                skipped: skipped.len(),
            });
        }

        self.check_cancelled()?;
        self.send_progress(DedupPhase::Mining, 0, 1, "Mining similar pairs");
        let start = Instant::now();
        let pairs = self.mine_pairs(&store)?;
        let ids: Vec<ItemId> = store.items().iter().map(|item| item.id.clone()).collect();
        let similarity_map = SimilarityMap::from_pairs(&pairs, &ids, self.config.threshold);
        log::info!("Calculated similarity map in {:.2} seconds", start.elapsed().as_secs_f64());

        self.check_cancelled()?;
        self.send_progress(DedupPhase::Clustering, 0, 1, "Detecting communities");
        let start = Instant::now();
        let detector = CommunityDetector::new(
            self.config.threshold,
            self.config.min_community_size,
            self.config.community_batch_size,
        );
        let communities = detector.detect(&store)?;
        let groups = groups_from_communities(&communities, store.items());
        log::info!("Calculated groups in {:.2} seconds", start.elapsed().as_secs_f64());

        Ok(DedupReport {
            generated_at: Utc::now().to_rfc3339(),
            threshold: self.config.threshold,
            mode: DedupMode::InMemory,
            item_count: items.len(),
            embedded_count: store.len(),
            skipped,
            similarity_map,
            groups,
        })
    }

    fn run_chunked(&self, items: &[Item], chunk_size: usize) -> Result<DedupReport, DedupError> {
        let mut storage = self.open_storage(items, chunk_size)?;
        let builder = ChunkedSimilarityBuilder::new(&self.provider, chunk_size, self.config.threshold)
            .with_embed_batch_size(self.config.embed_batch_size)
            .with_resume(self.config.resume)
            .with_observer(self.observer.as_ref())
            .with_cancellation_token(self.cancellation_token.clone());

        let result = builder.build(items, &storage);
        // An interrupted resumable run leaves its chunks for the next attempt.
        if self.config.keep_chunks || (self.config.resume && result.is_err()) {
            storage.set_keep(true);
        } else {
            storage.release();
        }
        let outcome = result?;

        self.send_progress(DedupPhase::Grouping, 0, 1, "Building groups");
        let start = Instant::now();
        let groups = build_groups(&outcome.similarity_map, items);
        log::info!("Calculated groups in {:.2} seconds", start.elapsed().as_secs_f64());

        Ok(DedupReport {
            generated_at: Utc::now().to_rfc3339(),
            threshold: self.config.threshold,
            mode: DedupMode::Chunked,
            item_count: items.len(),
            embedded_count: outcome.embedded_count,
            skipped: outcome.skipped,
            similarity_map: outcome.similarity_map,
            groups,
        })
    }

    /// Run directory under the configured chunk root. Resumable runs get a name derived
    /// from their input so a later run can find them.
    fn open_storage(&self, items: &[Item], chunk_size: usize) -> Result<ChunkStorage, DedupError> {
        let parent = self.config.chunk_dir.clone().unwrap_or_else(default_chunk_root);
        let name = if self.config.resume || self.config.keep_chunks {
            let ids: Vec<ItemId> = items.iter().map(|item| item.id.clone()).collect();
            let mut hasher = blake3::Hasher::new();
            hasher.update(self.provider.name().as_bytes());
            hasher.update(&(chunk_size as u64).to_le_bytes());
            hasher.update(digest_ids(&ids).as_bytes());
            format!("embeddings-{}", &hasher.finalize().to_hex()[..16])
        } else {
            format!(
                "embeddings-{}-{}",
                Utc::now().format("%Y%m%dT%H%M%S%f"),
                std::process::id()
            )
        };
        let storage = ChunkStorage::open(parent.join(name))?;
        log::debug!("Chunk storage at {}", storage.root().display());
        Ok(storage)
    }
}

fn check_unique_ids(items: &[Item]) -> Result<(), DedupError> {
    let mut seen: HashSet<&ItemId> = HashSet::with_capacity(items.len());
    for item in items {
        if !seen.insert(&item.id) {
            return Err(DedupError::DuplicateItemId {
                id: item.id.to_string(),
            });
        }
    }
    Ok(())
}
