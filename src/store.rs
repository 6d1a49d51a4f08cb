//! Persisted symbol index and file table.
//!
//! Three JSON snapshots live in the index directory: `index.json` (symbols),
//! `files.json` (per-file fingerprints) and `meta.json` (build metadata). Each
//! is replaced atomically, index first, so a crash can leave the file table
//! older than the index but never newer; the next update then re-extracts the
//! affected files instead of trusting stale symbols.

use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, info};

use crate::config::{IndexLayout, write_atomic};
use crate::error::{IndexError, IndexResult};
use crate::model::{
    BuildMetadata, FileTable, FileTableSnapshot, INDEX_FORMAT_VERSION, SymbolIndex, SymbolRecord,
};

#[derive(Debug, Clone)]
pub struct IndexStore {
    layout: IndexLayout,
}

#[derive(Debug, Default)]
pub struct MergeSet {
    pub deleted: Vec<String>,
    pub changed_or_new: Vec<String>,
    pub records: Vec<SymbolRecord>,
    /// Fresh fingerprints for `changed_or_new`. A file missing here loses its
    /// stored fingerprint so the next update retries it.
    pub metadata: FileTable,
}

#[derive(Deserialize)]
struct VersionProbe {
    version: u32,
}

impl IndexStore {
    pub fn new(layout: IndexLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &IndexLayout {
        &self.layout
    }

    pub fn exists(&self) -> bool {
        self.layout.index_path().is_file() && self.layout.files_path().is_file()
    }

    pub fn load(&self) -> IndexResult<SymbolIndex> {
        self.read_versioned(&self.layout.index_path())
    }

    pub fn load_files(&self) -> IndexResult<FileTable> {
        let snapshot: FileTableSnapshot = self.read_versioned(&self.layout.files_path())?;
        Ok(snapshot.files)
    }

    pub fn load_meta(&self) -> IndexResult<Option<BuildMetadata>> {
        let path = self.layout.meta_path();
        if !path.is_file() {
            return Ok(None);
        }
        let bytes = std::fs::read(&path).map_err(|e| IndexError::io(&path, e))?;
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| IndexError::Corrupt { path, source })
    }

    pub fn save(&self, records: Vec<SymbolRecord>, files: FileTable) -> IndexResult<SymbolIndex> {
        let index = SymbolIndex::from_records(records, files.len());
        self.write(&index, &files)?;
        info!(
            files = index.total_files,
            symbols = index.total_symbols,
            "index saved"
        );
        Ok(index)
    }

    pub fn merge(&self, set: MergeSet) -> IndexResult<SymbolIndex> {
        let mut index = self.load()?;
        let mut files = self.load_files()?;
        merge_into(&mut index, &mut files, set);
        self.write(&index, &files)?;
        info!(
            files = index.total_files,
            symbols = index.total_symbols,
            "index merged"
        );
        Ok(index)
    }

    fn write(&self, index: &SymbolIndex, files: &FileTable) -> IndexResult<()> {
        let index_path = self.layout.index_path();
        let index_bytes = serde_json::to_vec(index).map_err(|source| IndexError::Corrupt {
            path: index_path.clone(),
            source,
        })?;

        let files_path = self.layout.files_path();
        let files_bytes = serde_json::to_vec(&FileTableSnapshot {
            version: INDEX_FORMAT_VERSION,
            files: files.clone(),
        })
        .map_err(|source| IndexError::Corrupt {
            path: files_path.clone(),
            source,
        })?;

        let meta_path = self.layout.meta_path();
        let mut meta = BuildMetadata::current();
        meta.last_built = index.built_at;
        let meta_bytes = serde_json::to_vec_pretty(&meta).map_err(|source| IndexError::Corrupt {
            path: meta_path.clone(),
            source,
        })?;

        write_atomic(&index_path, &index_bytes)?;
        write_atomic(&files_path, &files_bytes)?;
        write_atomic(&meta_path, &meta_bytes)?;
        debug!(dir = %self.layout.dir().display(), "snapshots written");
        Ok(())
    }

    fn read_versioned<T: DeserializeOwned>(&self, path: &Path) -> IndexResult<T> {
        if !path.is_file() {
            return Err(IndexError::IndexMissing {
                dir: self.layout.dir().to_path_buf(),
            });
        }
        let bytes = std::fs::read(path).map_err(|e| IndexError::io(path, e))?;

        let probe: VersionProbe =
            serde_json::from_slice(&bytes).map_err(|source| IndexError::Corrupt {
                path: path.to_path_buf(),
                source,
            })?;
        if probe.version != INDEX_FORMAT_VERSION {
            return Err(IndexError::Incompatible {
                path: path.to_path_buf(),
                found: probe.version,
                expected: INDEX_FORMAT_VERSION,
            });
        }

        serde_json::from_slice(&bytes).map_err(|source| IndexError::Corrupt {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Removes every record of a deleted or re-extracted file, drops emptied
/// buckets, then inserts the fresh records. Records of other files are not
/// touched.
pub fn merge_into(index: &mut SymbolIndex, files: &mut FileTable, set: MergeSet) {
    let refreshed: HashSet<&str> = set.changed_or_new.iter().map(String::as_str).collect();
    let touched: HashSet<&str> = set
        .deleted
        .iter()
        .map(String::as_str)
        .chain(refreshed.iter().copied())
        .collect();

    for bucket in index.symbols.values_mut() {
        bucket.retain(|r| !touched.contains(r.file.as_str()));
    }
    index.symbols.retain(|_, bucket| !bucket.is_empty());

    for record in set.records {
        if refreshed.contains(record.file.as_str()) {
            index.symbols.entry(record.name.clone()).or_default().push(record);
        }
    }

    for path in &set.deleted {
        files.remove(path);
    }
    for path in &set.changed_or_new {
        match set.metadata.get(path) {
            Some(meta) => {
                files.insert(path.clone(), meta.clone());
            }
            None => {
                files.remove(path);
            }
        }
    }

    index.normalize();
    index.total_files = files.len();
    index.built_at = chrono::Utc::now();
}
