use crate::core::vector::{VectorBlock, VectorError};
use rayon::prelude::*;
use std::cmp::Ordering;

/// Dense `rows x cols` matrix of similarity scores, row-major.
#[derive(Debug, Clone)]
pub struct SimilarityMatrix {
    rows: usize,
    cols: usize,
    data: Vec<f32>,
}

impl SimilarityMatrix {
    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn get(&self, row: usize, col: usize) -> f32 {
        self.data[row * self.cols + col]
    }

    pub fn set(&mut self, row: usize, col: usize, value: f32) {
        self.data[row * self.cols + col] = value;
    }

    pub fn row(&self, row: usize) -> &[f32] {
        &self.data[row * self.cols..(row + 1) * self.cols]
    }
}

pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Cosine similarity of every row of `a` against every row of `b`.
///
/// Both blocks must already be L2-normalized, so the dot product is the cosine.
pub fn cos_sim(a: VectorBlock<'_>, b: VectorBlock<'_>) -> Result<SimilarityMatrix, VectorError> {
    if a.dims() != b.dims() {
        return Err(VectorError::DimensionMismatch {
            expected: a.dims(),
            got: b.dims(),
        });
    }

    let rows = a.len();
    let cols = b.len();
    let mut data = vec![0.0f32; rows * cols];
    if cols > 0 {
        data.par_chunks_mut(cols).enumerate().for_each(|(i, out)| {
            let left = a.row(i);
            for (j, slot) in out.iter_mut().enumerate() {
                *slot = dot(left, b.row(j));
            }
        });
    }

    Ok(SimilarityMatrix { rows, cols, data })
}

/// Highest score first; equal scores keep the lower index first.
fn by_score_desc(a: &(usize, f32), b: &(usize, f32)) -> Ordering {
    b.1.total_cmp(&a.1).then(a.0.cmp(&b.0))
}

/// The `k` largest entries of `row` as `(column, score)`, sorted descending.
pub fn top_k(row: &[f32], k: usize) -> Vec<(usize, f32)> {
    let k = k.min(row.len());
    if k == 0 {
        return Vec::new();
    }
    let mut entries: Vec<(usize, f32)> = row.iter().copied().enumerate().collect();
    if k < entries.len() {
        entries.select_nth_unstable_by(k - 1, by_score_desc);
        entries.truncate(k);
    }
    entries.sort_by(by_score_desc);
    entries
}

/// The `k`-th largest value of `row` (1-based), or `None` if the row is shorter.
pub fn kth_largest(row: &[f32], k: usize) -> Option<f32> {
    if k == 0 || k > row.len() {
        return None;
    }
    let mut values = row.to_vec();
    let (_, kth, _) = values.select_nth_unstable_by(k - 1, |a, b| b.total_cmp(a));
    Some(*kth)
}
