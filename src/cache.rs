//! In-process memo of extractor output.
//!
//! Keyed by `(path, modified_at, size)` rather than the content hash, so a hit
//! costs a single `stat`. A changed file produces a different key, which is the
//! only invalidation needed; [`ExtractionCache::clear`] bounds memory.

use dashmap::DashMap;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{IndexError, IndexResult};
use crate::extract::extract;
use crate::fingerprint::{read_snapshot, stat};
use crate::model::{FileMetadata, SymbolRecord};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub path: String,
    pub modified_at: u64,
    pub size_bytes: u64,
}

#[derive(Debug)]
struct CachedFile {
    records: Vec<SymbolRecord>,
    metadata: FileMetadata,
    syntax_error_line: Option<u32>,
}

#[derive(Debug)]
pub struct FileOutcome {
    pub records: Vec<SymbolRecord>,
    pub metadata: FileMetadata,
    pub error: Option<IndexError>,
    pub cache_hit: bool,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

#[derive(Debug, Default)]
pub struct ExtractionCache {
    entries: DashMap<CacheKey, Arc<CachedFile>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ExtractionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_extract(&self, root: &Path, rel: &str) -> IndexResult<FileOutcome> {
        let abs = root.join(rel);
        let (modified_at, size_bytes) = stat(&abs)?;
        let key = CacheKey {
            path: rel.to_string(),
            modified_at,
            size_bytes,
        };

        if let Some(entry) = self.entries.get(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(outcome(rel, entry.value(), true));
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        let snapshot = read_snapshot(&abs)?;
        let source = String::from_utf8_lossy(&snapshot.bytes);
        let extraction = extract(&source, rel);
        let syntax_error_line = match extraction.error {
            Some(IndexError::Syntax { line, .. }) => Some(line),
            _ => None,
        };

        let cached = Arc::new(CachedFile {
            records: extraction.records,
            metadata: snapshot.metadata,
            syntax_error_line,
        });
        let key = CacheKey {
            path: rel.to_string(),
            modified_at: cached.metadata.modified_at,
            size_bytes: cached.metadata.size_bytes,
        };
        // identical keys always carry identical values, so last writer wins
        self.entries.insert(key, Arc::clone(&cached));
        Ok(outcome(rel, &cached, false))
    }

    pub fn invalidate(&self, rel: &str) {
        self.entries.retain(|key, _| key.path != rel);
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

fn outcome(rel: &str, cached: &CachedFile, cache_hit: bool) -> FileOutcome {
    FileOutcome {
        records: cached.records.clone(),
        metadata: cached.metadata.clone(),
        error: cached.syntax_error_line.map(|line| IndexError::Syntax {
            path: rel.to_string(),
            line,
        }),
        cache_hit,
    }
}
