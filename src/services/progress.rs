use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum DedupPhase {
    Embedding,
    Mining,
    Clustering,
    ChunkEmbedding,
    ChunkComparison,
    Grouping,
    Complete,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupProgress {
    pub phase: DedupPhase,
    pub completed: usize,
    pub total: usize,
    pub message: String,
}

impl DedupProgress {
    pub fn new(phase: DedupPhase, completed: usize, total: usize, message: impl Into<String>) -> Self {
        Self {
            phase,
            completed,
            total,
            message: message.into(),
        }
    }

    pub fn percent(&self) -> usize {
        if self.total == 0 {
            100
        } else {
            self.completed * 100 / self.total
        }
    }
}

/// Receives progress at phase and chunk boundaries. May be called from worker threads.
pub trait ProgressObserver: Send + Sync {
    fn on_progress(&self, progress: &DedupProgress);
}

impl<F> ProgressObserver for F
where
    F: Fn(&DedupProgress) + Send + Sync,
{
    fn on_progress(&self, progress: &DedupProgress) {
        self(progress)
    }
}

/// Observer that ignores everything.
pub struct NoProgress;

impl ProgressObserver for NoProgress {
    fn on_progress(&self, _progress: &DedupProgress) {}
}
