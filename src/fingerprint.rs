use sha2::{Digest, Sha256};
use std::fs::Metadata;
use std::path::Path;
use std::time::UNIX_EPOCH;

use crate::error::{IndexError, IndexResult};
use crate::model::FileMetadata;

pub fn hash_content(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

pub fn stat_fields(meta: &Metadata) -> (u64, u64) {
    let modified_at = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0);
    (modified_at, meta.len())
}

pub fn stat(path: &Path) -> IndexResult<(u64, u64)> {
    let meta = std::fs::metadata(path).map_err(|e| IndexError::io(path, e))?;
    Ok(stat_fields(&meta))
}

#[derive(Debug)]
pub struct FileSnapshot {
    pub bytes: Vec<u8>,
    pub metadata: FileMetadata,
}

pub fn read_snapshot(path: &Path) -> IndexResult<FileSnapshot> {
    let (modified_at, _) = stat(path)?;
    let bytes = std::fs::read(path).map_err(|e| IndexError::io(path, e))?;
    let metadata = FileMetadata {
        modified_at,
        size_bytes: bytes.len() as u64,
        content_hash: hash_content(&bytes),
    };
    Ok(FileSnapshot { bytes, metadata })
}

pub fn hash_file(path: &Path) -> IndexResult<String> {
    let bytes = std::fs::read(path).map_err(|e| IndexError::io(path, e))?;
    Ok(hash_content(&bytes))
}
