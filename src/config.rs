use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("threshold must be in (0, 1], got {0}")]
    InvalidThreshold(f32),

    #[error("min_community_size must be at least 2, got {0}")]
    InvalidMinCommunitySize(usize),

    #[error("{name} must be greater than 0")]
    NotPositive { name: &'static str },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config file: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Tuning knobs for one deduplication run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// Cosine similarity at or above which two photos count as duplicates.
    pub threshold: f32,
    pub min_community_size: usize,
    /// Items per chunk; `None` keeps the whole run in memory.
    pub chunk_size: Option<usize>,
    pub max_pairs: usize,
    pub top_k: usize,
    /// Rows per similarity call during community detection.
    pub community_batch_size: usize,
    pub query_chunk_size: usize,
    pub corpus_chunk_size: usize,
    pub embed_batch_size: usize,
    /// Parent directory for chunk storage; defaults to the user cache dir.
    pub chunk_dir: Option<PathBuf>,
    pub keep_chunks: bool,
    pub resume: bool,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            threshold: 0.99,
            min_community_size: 2,
            chunk_size: None,
            max_pairs: 500_000,
            top_k: 10,
            community_batch_size: 128,
            query_chunk_size: 500,
            corpus_chunk_size: 10_000,
            embed_batch_size: 32,
            chunk_dir: None,
            keep_chunks: false,
            resume: false,
        }
    }
}

impl DedupConfig {
    pub fn with_threshold(threshold: f32) -> Self {
        Self {
            threshold,
            ..Default::default()
        }
    }

    /// Read a JSON config file; missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let file = File::open(path)?;
        Ok(serde_json::from_reader(BufReader::new(file))?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.threshold > 0.0 && self.threshold <= 1.0) {
            return Err(ConfigError::InvalidThreshold(self.threshold));
        }
        if self.min_community_size < 2 {
            return Err(ConfigError::InvalidMinCommunitySize(self.min_community_size));
        }
        let positive = [
            ("chunk_size", self.chunk_size.unwrap_or(1)),
            ("max_pairs", self.max_pairs),
            ("top_k", self.top_k),
            ("community_batch_size", self.community_batch_size),
            ("query_chunk_size", self.query_chunk_size),
            ("corpus_chunk_size", self.corpus_chunk_size),
            ("embed_batch_size", self.embed_batch_size),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(ConfigError::NotPositive { name });
            }
        }
        Ok(())
    }
}
