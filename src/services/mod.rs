pub mod embedding;
pub mod progress;
pub mod scanner;

pub use embedding::{EmbeddingProvider, PerceptualHashEmbedder, PrecomputedEmbedder, ThumbnailEmbedder};
pub use progress::{DedupPhase, DedupProgress, ProgressObserver};
pub use scanner::ScannerService;
