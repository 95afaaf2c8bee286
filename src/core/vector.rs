use crate::core::item::Item;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum VectorError {
    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Vector has zero norm")]
    ZeroNorm,

    #[error("Vector contains non-finite values")]
    NonFinite,

    #[error("Embedding dimension must be positive")]
    EmptyDimension,
}

/// L2-normalize `vector` in place.
pub fn normalize(vector: &mut [f32]) -> Result<(), VectorError> {
    if vector.iter().any(|v| !v.is_finite()) {
        return Err(VectorError::NonFinite);
    }
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm == 0.0 || !norm.is_finite() {
        return Err(VectorError::ZeroNorm);
    }
    for v in vector.iter_mut() {
        *v /= norm;
    }
    Ok(())
}

/// Borrowed row-major block of `len() x dims` vectors.
#[derive(Debug, Clone, Copy)]
pub struct VectorBlock<'a> {
    data: &'a [f32],
    dims: usize,
}

impl<'a> VectorBlock<'a> {
    pub fn new(data: &'a [f32], dims: usize) -> Result<Self, VectorError> {
        if dims == 0 {
            return Err(VectorError::EmptyDimension);
        }
        if data.len() % dims != 0 {
            return Err(VectorError::DimensionMismatch {
                expected: dims,
                got: data.len() % dims,
            });
        }
        Ok(Self { data, dims })
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn len(&self) -> usize {
        self.data.len() / self.dims
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn row(&self, index: usize) -> &'a [f32] {
        &self.data[index * self.dims..(index + 1) * self.dims]
    }

    /// Rows `start..end`, clamped to the block.
    pub fn slice(&self, start: usize, end: usize) -> VectorBlock<'a> {
        let end = end.min(self.len());
        let start = start.min(end);
        VectorBlock {
            data: &self.data[start * self.dims..end * self.dims],
            dims: self.dims,
        }
    }

    pub fn as_slice(&self) -> &'a [f32] {
        self.data
    }
}

/// Items paired with their normalized embeddings. Row `i` belongs to `items()[i]`;
/// that index is the identity the clustering algorithms work with.
#[derive(Debug, Clone)]
pub struct VectorStore {
    dims: usize,
    items: Vec<Item>,
    data: Vec<f32>,
}

impl VectorStore {
    pub fn new(dims: usize) -> Self {
        Self {
            dims,
            items: Vec::new(),
            data: Vec::new(),
        }
    }

    pub fn with_capacity(dims: usize, capacity: usize) -> Self {
        Self {
            dims,
            items: Vec::with_capacity(capacity),
            data: Vec::with_capacity(capacity * dims),
        }
    }

    /// Normalize `vector` and append it. The store is left untouched on error.
    pub fn push(&mut self, item: Item, mut vector: Vec<f32>) -> Result<usize, VectorError> {
        if self.dims == 0 {
            return Err(VectorError::EmptyDimension);
        }
        if vector.len() != self.dims {
            return Err(VectorError::DimensionMismatch {
                expected: self.dims,
                got: vector.len(),
            });
        }
        normalize(&mut vector)?;
        self.data.extend_from_slice(&vector);
        self.items.push(item);
        Ok(self.items.len() - 1)
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn items(&self) -> &[Item] {
        &self.items
    }

    pub fn vector(&self, index: usize) -> &[f32] {
        &self.data[index * self.dims..(index + 1) * self.dims]
    }

    pub fn as_block(&self) -> VectorBlock<'_> {
        VectorBlock {
            data: &self.data,
            dims: self.dims.max(1),
        }
    }

}
