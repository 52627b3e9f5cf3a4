use serde::{Deserialize, Serialize};

/// A persisted embedding and the file identity it was computed for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub path: String,
    pub file_size: u64,
    /// Windows file time (100ns ticks since 1601).
    pub last_modified: i64,
    pub embedding: Vec<f32>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStatistics {
    pub total_entries: u64,
    pub database_bytes: u64,
}

/// Raw little-endian encoding of an `f32` slice.
pub fn embedding_to_bytes(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
}

/// Inverse of `embedding_to_bytes`; `None` if the blob does not hold
/// exactly `len` floats.
pub fn bytes_to_embedding(bytes: &[u8], len: usize) -> Option<Vec<f32>> {
    if bytes.len() != len.checked_mul(4)? {
        return None;
    }
    Some(
        bytes
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect(),
    )
}
