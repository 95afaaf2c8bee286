use crate::core::item::Item;
use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use walkdir::WalkDir;

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("Invalid path: {path}")]
    InvalidPath { path: String },

    #[error("Operation cancelled")]
    Cancelled,
}

/// Turns a directory of photos into engine items.
pub struct ScannerService {
    cancellation_token: Arc<AtomicBool>,
    supported_formats: HashSet<String>,
}

impl Default for ScannerService {
    fn default() -> Self {
        Self::new()
    }
}

impl ScannerService {
    pub fn new() -> Self {
        let supported_formats = ["jpg", "jpeg", "png", "tiff", "tif", "webp", "bmp", "gif"]
            .iter()
            .map(|ext| ext.to_string())
            .collect();

        Self {
            cancellation_token: Arc::new(AtomicBool::new(false)),
            supported_formats,
        }
    }

    pub fn get_cancellation_token(&self) -> Arc<AtomicBool> {
        self.cancellation_token.clone()
    }

    pub fn cancel_scan(&self) {
        self.cancellation_token.store(true, Ordering::Relaxed);
    }

    pub fn is_supported(&self, path: &Path) -> bool {
        path.extension()
            .map(|ext| self.supported_formats.contains(&ext.to_string_lossy().to_lowercase()))
            .unwrap_or(false)
    }

    /// Items for every supported image under `root`, ids relative to `root`, sorted by id.
    pub fn scan(&self, root: &Path) -> Result<Vec<Item>, ScanError> {
        if !root.is_dir() {
            return Err(ScanError::InvalidPath {
                path: root.to_string_lossy().to_string(),
            });
        }

        let mut items = Vec::new();
        for entry in WalkDir::new(root)
            .follow_links(false)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if self.cancellation_token.load(Ordering::Relaxed) {
                return Err(ScanError::Cancelled);
            }

            let path = entry.path();
            if !entry.file_type().is_file() || !self.is_supported(path) {
                continue;
            }

            let relative = path.strip_prefix(root).unwrap_or(path);
            let id = relative.to_string_lossy().replace('\\', "/");
            let (width, height) = image_dimensions(path);
            items.push(Item::new(id, width, height).with_source(path));
        }

        items.sort_by(|a, b| a.id.cmp(&b.id));
        log::info!("Found {} images under {}", items.len(), root.display());
        Ok(items)
    }
}

fn image_dimensions(path: &Path) -> (u32, u32) {
    match image::image_dimensions(path) {
        Ok(dimensions) => dimensions,
        Err(e) => {
            log::warn!("Could not read dimensions for {}: {}", path.display(), e);
            (0, 0)
        }
    }
}
