use crate::core::item::{Item, ItemId};
use crate::core::vector::VectorError;
use image::imageops::FilterType;
use image::{DynamicImage, ImageReader};
use image_hasher::{HashAlg, HasherConfig};
use rayon::prelude::*;
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("Item {id} has no source image")]
    MissingSource { id: String },

    #[error("No embedding available for item {id}")]
    UnknownItem { id: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image processing error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Embedding failed: {message}")]
    Failed { message: String },
}

/// Anything that turns an item into a fixed-length float vector.
///
/// Failures are per item: a run skips the item and carries on.
pub trait EmbeddingProvider: Send + Sync {
    fn name(&self) -> &str;

    fn dimensions(&self) -> usize;

    fn embed(&self, item: &Item) -> Result<Vec<f32>, EmbeddingError>;

    /// One result per input item, in input order.
    fn embed_batch(&self, items: &[Item]) -> Vec<Result<Vec<f32>, EmbeddingError>> {
        items.par_iter().map(|item| self.embed(item)).collect()
    }

    /// Drop any cached image data held for `items`.
    fn evict(&self, _items: &[Item]) {}
}

fn load_image(item: &Item) -> Result<DynamicImage, EmbeddingError> {
    let path = item.source.as_deref().ok_or_else(|| EmbeddingError::MissingSource {
        id: item.id.to_string(),
    })?;
    open_image(path)
}

fn open_image(path: &Path) -> Result<DynamicImage, EmbeddingError> {
    Ok(ImageReader::open(path)?.with_guessed_format()?.decode()?)
}

/// Mean-centred grayscale thumbnail, flattened, followed by two brightness
/// components `mean` and `1 - mean`.
///
/// A uniform frame is never the zero vector: two black frames match each other and
/// a black frame against a white one scores 0.
pub struct ThumbnailEmbedder {
    side: u32,
}

impl ThumbnailEmbedder {
    pub fn new(side: u32) -> Self {
        Self { side: side.max(2) }
    }

    pub fn embed_image(&self, img: &DynamicImage) -> Vec<f32> {
        let thumb = img.resize_exact(self.side, self.side, FilterType::Triangle).to_luma8();
        let mut values: Vec<f32> = thumb.pixels().map(|p| f32::from(p.0[0]) / 255.0).collect();
        let mean = values.iter().sum::<f32>() / values.len() as f32;
        for v in values.iter_mut() {
            *v -= mean;
        }
        values.push(mean);
        values.push(1.0 - mean);
        values
    }
}

impl Default for ThumbnailEmbedder {
    fn default() -> Self {
        Self::new(32)
    }
}

impl EmbeddingProvider for ThumbnailEmbedder {
    fn name(&self) -> &str {
        "thumbnail"
    }

    fn dimensions(&self) -> usize {
        (self.side * self.side) as usize + 2
    }

    fn embed(&self, item: &Item) -> Result<Vec<f32>, EmbeddingError> {
        let img = load_image(item)?;
        Ok(self.embed_image(&img))
    }
}

/// Perceptual mean hash with every bit mapped to -1.0 or 1.0.
///
/// The cosine of two such vectors is `1 - 2 * hamming / bits`.
pub struct PerceptualHashEmbedder {
    hash_side: u32,
}

impl PerceptualHashEmbedder {
    pub fn new(hash_side: u32) -> Self {
        Self {
            hash_side: hash_side.max(4),
        }
    }

    pub fn embed_image(&self, img: &DynamicImage) -> Vec<f32> {
        let hasher = HasherConfig::new()
            .hash_size(self.hash_side, self.hash_side)
            .hash_alg(HashAlg::Mean)
            .to_hasher();
        let hash = hasher.hash_image(img);
        hash.as_bytes()
            .iter()
            .flat_map(|byte| (0..8).map(move |bit| if (byte >> bit) & 1 == 1 { 1.0 } else { -1.0 }))
            .take(self.dimensions())
            .collect()
    }
}

impl Default for PerceptualHashEmbedder {
    fn default() -> Self {
        Self::new(16)
    }
}

impl EmbeddingProvider for PerceptualHashEmbedder {
    fn name(&self) -> &str {
        "phash"
    }

    fn dimensions(&self) -> usize {
        (self.hash_side * self.hash_side) as usize
    }

    fn embed(&self, item: &Item) -> Result<Vec<f32>, EmbeddingError> {
        let img = load_image(item)?;
        Ok(self.embed_image(&img))
    }
}

/// Vectors computed elsewhere and handed in by item id.
#[derive(Debug, Clone, Default)]
pub struct PrecomputedEmbedder {
    dims: usize,
    vectors: HashMap<ItemId, Vec<f32>>,
}

impl PrecomputedEmbedder {
    pub fn new(dims: usize) -> Self {
        Self {
            dims,
            vectors: HashMap::new(),
        }
    }

    /// Dimension is taken from the first vector; every other vector must match it.
    pub fn from_entries(entries: impl IntoIterator<Item = (ItemId, Vec<f32>)>) -> Result<Self, VectorError> {
        let mut embedder = Self::new(0);
        for (id, vector) in entries {
            if embedder.dims == 0 {
                embedder.dims = vector.len();
            }
            embedder.insert(id, vector)?;
        }
        Ok(embedder)
    }

    pub fn insert(&mut self, id: ItemId, vector: Vec<f32>) -> Result<(), VectorError> {
        if vector.len() != self.dims {
            return Err(VectorError::DimensionMismatch {
                expected: self.dims,
                got: vector.len(),
            });
        }
        self.vectors.insert(id, vector);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }
}

impl EmbeddingProvider for PrecomputedEmbedder {
    fn name(&self) -> &str {
        "precomputed"
    }

    fn dimensions(&self) -> usize {
        self.dims
    }

    fn embed(&self, item: &Item) -> Result<Vec<f32>, EmbeddingError> {
        self.vectors
            .get(&item.id)
            .cloned()
            .ok_or_else(|| EmbeddingError::UnknownItem {
                id: item.id.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::similarity::dot;
    use crate::core::vector::normalize;
    use crate::{DedupConfig, DuplicateDetector};
    use image::{ImageBuffer, Luma};
    use tempfile::TempDir;

    fn write_pattern(dir: &TempDir, name: &str, f: impl Fn(u32, u32) -> u8) -> Item {
        let path = dir.path().join(name);
        let img: ImageBuffer<Luma<u8>, Vec<u8>> = ImageBuffer::from_fn(64, 64, |x, y| Luma([f(x, y)]));
        img.save(&path).unwrap();
        Item::new(name, 64, 64).with_source(path)
    }

    fn cosine(mut a: Vec<f32>, mut b: Vec<f32>) -> f32 {
        normalize(&mut a).unwrap();
        normalize(&mut b).unwrap();
        dot(&a, &b)
    }

    #[test]
    fn test_thumbnail_identical_images_match() {
        let dir = TempDir::new().unwrap();
        let a = write_pattern(&dir, "a.png", |x, _| if x < 32 { 0 } else { 255 });
        let b = write_pattern(&dir, "b.png", |x, _| if x < 32 { 0 } else { 255 });
        let c = write_pattern(&dir, "c.png", |_, y| if y < 32 { 0 } else { 255 });

        let embedder = ThumbnailEmbedder::new(16);
        let va = embedder.embed(&a).unwrap();
        assert_eq!(va.len(), embedder.dimensions());
        let vb = embedder.embed(&b).unwrap();
        let vc = embedder.embed(&c).unwrap();
        assert!(cosine(va.clone(), vb) > 0.999);
        assert!(cosine(va, vc) < 0.5);
    }

    #[test]
    fn test_thumbnail_flat_frames() {
        let dir = TempDir::new().unwrap();
        let black_a = write_pattern(&dir, "black-a.png", |_, _| 0);
        let black_b = write_pattern(&dir, "black-b.png", |_, _| 0);
        let white = write_pattern(&dir, "white.png", |_, _| 255);

        let embedder = ThumbnailEmbedder::default();
        let va = embedder.embed(&black_a).unwrap();
        assert_eq!(va.len(), embedder.dimensions());
        assert!(va.iter().any(|v| *v != 0.0));
        let vb = embedder.embed(&black_b).unwrap();
        let vw = embedder.embed(&white).unwrap();
        assert!(cosine(va.clone(), vb) > 0.999);
        assert!(cosine(va, vw).abs() < 1e-6);
    }

    #[test]
    fn test_flat_duplicates_are_grouped() {
        let dir = TempDir::new().unwrap();
        let items = vec![
            write_pattern(&dir, "black-a.png", |_, _| 0),
            write_pattern(&dir, "black-b.png", |_, _| 0),
        ];
        let report = DuplicateDetector::new(DedupConfig::default(), ThumbnailEmbedder::default())
            .unwrap()
            .run(&items)
            .unwrap();
        assert!(report.skipped.is_empty());
        assert_eq!(report.groups.len(), 1);
        assert_eq!(report.groups[0].len(), 2);
    }

    #[test]
    fn test_phash_vectors_are_signed_bits() {
        let dir = TempDir::new().unwrap();
        let a = write_pattern(&dir, "a.png", |x, y| ((x * 4 + y * 2) % 256) as u8);
        let embedder = PerceptualHashEmbedder::new(8);
        let v = embedder.embed(&a).unwrap();
        assert_eq!(v.len(), 64);
        assert!(v.iter().all(|x| *x == 1.0 || *x == -1.0));
        assert_eq!(embedder.embed(&a).unwrap(), v);
    }

    #[test]
    fn test_missing_source_is_reported() {
        let item = Item::new("nowhere", 1, 1);
        let err = ThumbnailEmbedder::default().embed(&item).unwrap_err();
        assert!(matches!(err, EmbeddingError::MissingSource { .. }));

        let item = Item::new("broken", 1, 1).with_source("/definitely/not/here.jpg");
        assert!(ThumbnailEmbedder::default().embed(&item).is_err());
    }

    #[test]
    fn test_precomputed_batch_reports_per_item() {
        let embedder = PrecomputedEmbedder::from_entries([(ItemId::from("a"), vec![1.0, 0.0])]).unwrap();
        assert_eq!(embedder.dimensions(), 2);
        let results = embedder.embed_batch(&[Item::new("a", 1, 1), Item::new("b", 1, 1)]);
        assert_eq!(results[0].as_ref().unwrap(), &vec![1.0, 0.0]);
        assert!(matches!(results[1], Err(EmbeddingError::UnknownItem { .. })));
    }

    #[test]
    fn test_precomputed_rejects_mixed_dimensions() {
        let entries = [
            (ItemId::from("a"), vec![1.0, 0.0]),
            (ItemId::from("b"), vec![1.0, 0.0, 0.0]),
            (ItemId::from("c"), vec![1.0, 0.0, 0.0]),
        ];
        assert_eq!(
            PrecomputedEmbedder::from_entries(entries).unwrap_err(),
            VectorError::DimensionMismatch { expected: 2, got: 3 }
        );

        let mut embedder = PrecomputedEmbedder::new(3);
        assert!(embedder.insert(ItemId::from("a"), vec![1.0]).is_err());
        assert!(embedder.is_empty());
    }
}
