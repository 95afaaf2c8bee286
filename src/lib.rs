pub mod config;
pub mod core;
pub mod services;

pub use crate::config::{ConfigError, DedupConfig};
pub use crate::core::duplicate::{DedupError, DedupMode, DedupReport, DuplicateDetector};
pub use crate::core::item::{Group, Item, ItemId, SkippedItem};
pub use crate::core::similarity_map::SimilarityMap;
pub use crate::services::embedding::{
    EmbeddingError, EmbeddingProvider, PerceptualHashEmbedder, PrecomputedEmbedder,
    ThumbnailEmbedder,
};
pub use crate::services::progress::{DedupPhase, DedupProgress, ProgressObserver};
