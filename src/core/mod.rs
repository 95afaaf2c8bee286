// Similarity clustering engine:
// - vector storage and cosine similarity blocks
// - community detection and pair mining for in-memory runs
// - chunk-persisted comparison and union-find grouping for large runs

pub mod chunk_store;
pub mod chunked;
pub mod community;
pub mod duplicate;
pub mod groups;
pub mod item;
pub mod mining;
pub mod similarity;
pub mod similarity_map;
pub mod vector;
