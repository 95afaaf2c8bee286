//! On-disk storage for per-chunk normalized embeddings.
//!
//! Each chunk `k` of a run owns three files in the run directory:
//!
//! - `chunk-{k}-ids.json`: ordered item ids, one per embedding row
//! - `chunk-{k}-embeddings.bin`: 24-byte header followed by little-endian f32 rows
//! - `chunk-{k}-manifest.json`: digests and counts; written last, so a manifest
//!   only exists for a completely written chunk
//!
//! Embedding header: magic `PDEMBED\0` (8), version u32, dimensions u32, row count u64.

use crate::core::item::ItemId;
use crate::core::vector::{VectorBlock, VectorError};
use memmap2::Mmap;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

const MAGIC: &[u8; 8] = b"PDEMBED\0";
const FORMAT_VERSION: u32 = 1;
const HEADER_SIZE: usize = 24;

#[derive(Debug, Error)]
pub enum ChunkStoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid embedding file {path}: {message}")]
    InvalidFormat { path: String, message: String },

    #[error("Version mismatch: file version {0}, supported version {1}")]
    VersionMismatch(u32, u32),

    #[error("Checksum mismatch in chunk {chunk}: file may be corrupted")]
    ChecksumMismatch { chunk: usize },

    #[error("Chunk {chunk} has {ids} ids but {vectors} vectors")]
    CountMismatch { chunk: usize, ids: usize, vectors: usize },

    #[error("Vector error: {0}")]
    Vector(#[from] VectorError),
}

/// Summary of one persisted chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkManifest {
    pub chunk_index: usize,
    pub provider: String,
    pub dimensions: usize,
    /// Digest of the chunk's input ids, before any item was dropped.
    pub input_digest: String,
    pub payload_digest: String,
    pub embedded: usize,
}

/// A verified chunk whose rows are decoded straight from a read-only memory map.
#[derive(Debug)]
pub struct MappedChunk {
    pub index: usize,
    pub ids: Vec<ItemId>,
    dims: usize,
    mmap: Mmap,
}

impl MappedChunk {
    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    fn payload(&self) -> &[u8] {
        &self.mmap[HEADER_SIZE..]
    }

    /// Decode row `row` into `out`, which must hold `dims()` values.
    pub fn read_row(&self, row: usize, out: &mut [f32]) {
        let width = self.dims * 4;
        let bytes = &self.payload()[row * width..(row + 1) * width];
        for (value, raw) in out.iter_mut().zip(bytes.chunks_exact(4)) {
            *value = f32::from_le_bytes(read_array(raw));
        }
    }

    /// All rows decoded into one row-major buffer.
    pub fn to_vec(&self) -> Vec<f32> {
        self.payload()
            .chunks_exact(4)
            .map(|bytes| f32::from_le_bytes(read_array(bytes)))
            .collect()
    }
}

/// Stable digest of an ordered id list.
pub fn digest_ids(ids: &[ItemId]) -> String {
    let mut hasher = blake3::Hasher::new();
    for id in ids {
        hasher.update(&(id.as_str().len() as u64).to_le_bytes());
        hasher.update(id.as_str().as_bytes());
    }
    hasher.finalize().to_hex().to_string()
}

/// Default parent directory for run directories: `<cache dir>/photodedup/chunks`.
pub fn default_chunk_root() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("photodedup")
        .join("chunks")
}

/// Owns one run directory. The directory is deleted on drop unless kept.
#[derive(Debug)]
pub struct ChunkStorage {
    root: PathBuf,
    keep: bool,
}

impl ChunkStorage {
    /// Open (creating if needed) the run directory at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, ChunkStoreError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root, keep: false })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Keep the directory after this value is dropped, e.g. to resume later.
    pub fn set_keep(&mut self, keep: bool) {
        self.keep = keep;
    }

    pub fn ids_path(&self, index: usize) -> PathBuf {
        self.root.join(format!("chunk-{index}-ids.json"))
    }

    pub fn embeddings_path(&self, index: usize) -> PathBuf {
        self.root.join(format!("chunk-{index}-embeddings.bin"))
    }

    pub fn manifest_path(&self, index: usize) -> PathBuf {
        self.root.join(format!("chunk-{index}-manifest.json"))
    }

    /// Persist a chunk's ids and normalized vectors, then its manifest.
    pub fn write_chunk(
        &self,
        index: usize,
        provider: &str,
        input_digest: &str,
        ids: &[ItemId],
        vectors: VectorBlock<'_>,
    ) -> Result<ChunkManifest, ChunkStoreError> {
        if ids.len() != vectors.len() {
            return Err(ChunkStoreError::CountMismatch {
                chunk: index,
                ids: ids.len(),
                vectors: vectors.len(),
            });
        }

        // A stale manifest must not vouch for files that are about to change.
        remove_if_exists(&self.manifest_path(index))?;

        write_atomic(&self.ids_path(index), |writer| {
            serde_json::to_writer(&mut *writer, ids)?;
            Ok(())
        })?;

        let mut hasher = blake3::Hasher::new();
        write_atomic(&self.embeddings_path(index), |writer| {
            writer.write_all(MAGIC)?;
            writer.write_all(&FORMAT_VERSION.to_le_bytes())?;
            writer.write_all(&(vectors.dims() as u32).to_le_bytes())?;
            writer.write_all(&(vectors.len() as u64).to_le_bytes())?;
            for value in vectors.as_slice() {
                let bytes = value.to_le_bytes();
                hasher.update(&bytes);
                writer.write_all(&bytes)?;
            }
            Ok(())
        })?;

        let manifest = ChunkManifest {
            chunk_index: index,
            provider: provider.to_string(),
            dimensions: vectors.dims(),
            input_digest: input_digest.to_string(),
            payload_digest: hasher.finalize().to_hex().to_string(),
            embedded: ids.len(),
        };
        write_atomic(&self.manifest_path(index), |writer| {
            serde_json::to_writer_pretty(&mut *writer, &manifest)?;
            Ok(())
        })?;

        Ok(manifest)
    }

    /// The manifest of chunk `index`, if that chunk was completely written.
    pub fn read_manifest(&self, index: usize) -> Result<Option<ChunkManifest>, ChunkStoreError> {
        let path = self.manifest_path(index);
        if !path.exists() {
            return Ok(None);
        }
        let file = File::open(&path)?;
        Ok(Some(serde_json::from_reader(std::io::BufReader::new(file))?))
    }

    pub fn read_ids(&self, index: usize) -> Result<Vec<ItemId>, ChunkStoreError> {
        let file = File::open(self.ids_path(index))?;
        Ok(serde_json::from_reader(std::io::BufReader::new(file))?)
    }

    /// Map a chunk's embedding file read-only and verify it against `manifest`.
    pub fn read_chunk(&self, manifest: &ChunkManifest) -> Result<MappedChunk, ChunkStoreError> {
        let index = manifest.chunk_index;
        let ids = self.read_ids(index)?;

        let path = self.embeddings_path(index);
        let file = File::open(&path)?;
        let mmap = unsafe { Mmap::map(&file)? };
        let invalid = |message: String| ChunkStoreError::InvalidFormat {
            path: path.display().to_string(),
            message,
        };

        if mmap.len() < HEADER_SIZE || &mmap[..8] != MAGIC {
            return Err(invalid("missing header".to_string()));
        }
        let version = u32::from_le_bytes(read_array(&mmap[8..12]));
        if version != FORMAT_VERSION {
            return Err(ChunkStoreError::VersionMismatch(version, FORMAT_VERSION));
        }
        let dims = u32::from_le_bytes(read_array(&mmap[12..16])) as usize;
        let count = u64::from_le_bytes(read_array(&mmap[16..24]));
        if dims != manifest.dimensions {
            return Err(VectorError::DimensionMismatch {
                expected: manifest.dimensions,
                got: dims,
            }
            .into());
        }
        // The header is outside the payload digest; trust the manifest's count.
        if usize::try_from(count).ok() != Some(manifest.embedded) {
            return Err(ChunkStoreError::CountMismatch {
                chunk: index,
                ids: manifest.embedded,
                vectors: usize::try_from(count).unwrap_or(usize::MAX),
            });
        }
        if ids.len() != manifest.embedded {
            return Err(ChunkStoreError::CountMismatch {
                chunk: index,
                ids: ids.len(),
                vectors: manifest.embedded,
            });
        }

        let expected = manifest
            .embedded
            .checked_mul(dims)
            .and_then(|values| values.checked_mul(4))
            .ok_or_else(|| invalid(format!("{} rows of {} values overflow", manifest.embedded, dims)))?;
        let payload = &mmap[HEADER_SIZE..];
        if payload.len() != expected {
            return Err(invalid(format!(
                "expected {} payload bytes, found {}",
                expected,
                payload.len()
            )));
        }
        if blake3::hash(payload).to_hex().as_str() != manifest.payload_digest {
            return Err(ChunkStoreError::ChecksumMismatch { chunk: index });
        }

        Ok(MappedChunk {
            index,
            ids,
            dims,
            mmap,
        })
    }

    /// Delete the run directory now. Failures are logged, not returned.
    pub fn release(mut self) {
        self.keep = false;
    }
}

impl Drop for ChunkStorage {
    fn drop(&mut self) {
        if self.keep {
            log::info!("Keeping chunk storage at {}", self.root.display());
            return;
        }
        if let Err(e) = fs::remove_dir_all(&self.root) {
            if e.kind() != std::io::ErrorKind::NotFound {
                log::warn!("Failed to remove chunk storage {}: {}", self.root.display(), e);
            }
        }
    }
}

fn read_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[..N]);
    out
}

fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Write through a temp file and rename into place; the temp file is removed on error.
fn write_atomic<F>(path: &Path, write: F) -> Result<(), ChunkStoreError>
where
    F: FnOnce(&mut BufWriter<File>) -> Result<(), ChunkStoreError>,
{
    let temp_path = path.with_extension("tmp");
    let result = (|| {
        let mut writer = BufWriter::new(File::create(&temp_path)?);
        write(&mut writer)?;
        writer.flush()?;
        writer
            .into_inner()
            .map_err(|e| std::io::Error::other(e.to_string()))?
            .sync_all()?;
        Ok(())
    })();

    if result.is_err() {
        let _ = fs::remove_file(&temp_path);
        return result;
    }
    fs::rename(&temp_path, path)?;
    Ok(())
}
