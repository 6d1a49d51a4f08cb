use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info};

use crate::fingerprint::{hash_file, stat};
use crate::model::{FileMetadata, FileTable};
use crate::pipeline::{BuildPipeline, FileFailure};
use crate::scan::{is_indexable, relative_path};
use crate::store::{IndexStore, MergeSet};

/// Paths reported by a file-system watcher for one batch. Paths may be
/// absolute (under the root) or root-relative.
#[derive(Debug, Clone, Default)]
pub struct ChangeBatch {
    pub modified: Vec<PathBuf>,
    pub added: Vec<PathBuf>,
    pub removed: Vec<PathBuf>,
}

impl ChangeBatch {
    pub fn is_empty(&self) -> bool {
        self.modified.is_empty() && self.added.is_empty() && self.removed.is_empty()
    }

    pub fn len(&self) -> usize {
        self.modified.len() + self.added.len() + self.removed.len()
    }
}

/// Files that differ from the stored file table. Every path lands in at most
/// one of the three lists; anything else is unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChangeSet {
    pub changed: Vec<String>,
    pub new: Vec<String>,
    pub deleted: Vec<String>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.new.is_empty() && self.deleted.is_empty()
    }

    pub fn refreshed(&self) -> Vec<String> {
        let mut files: Vec<String> = self.changed.iter().chain(&self.new).cloned().collect();
        files.sort();
        files
    }
}

pub struct ChangeDetector<'a> {
    root: &'a Path,
    always_hash: bool,
}

impl<'a> ChangeDetector<'a> {
    pub fn new(root: &'a Path, always_hash: bool) -> Self {
        Self { root, always_hash }
    }

    pub fn diff(&self, current: &BTreeSet<String>, stored: &FileTable) -> ChangeSet {
        let mut changes = ChangeSet::default();
        for path in current {
            match stored.get(path) {
                None => changes.new.push(path.clone()),
                Some(meta) if self.is_changed(path, meta) => changes.changed.push(path.clone()),
                Some(_) => {}
            }
        }
        changes.deleted = stored
            .keys()
            .filter(|p| !current.contains(*p))
            .cloned()
            .collect();
        changes
    }

    /// Classifies only the paths named by `batch`; on-disk existence decides
    /// between deletion and refresh regardless of which list reported a path.
    pub fn diff_batch(&self, batch: &ChangeBatch, stored: &FileTable) -> ChangeSet {
        let paths: BTreeSet<String> = batch
            .modified
            .iter()
            .chain(&batch.added)
            .chain(&batch.removed)
            .filter_map(|p| relative_path(self.root, p))
            .filter(|rel| is_indexable(rel))
            .collect();

        let mut changes = ChangeSet::default();
        for path in paths {
            let exists = self.root.join(&path).is_file();
            match (exists, stored.get(&path)) {
                (false, Some(_)) => changes.deleted.push(path),
                (false, None) => {}
                (true, None) => changes.new.push(path),
                (true, Some(meta)) => {
                    if self.is_changed(&path, meta) {
                        changes.changed.push(path);
                    }
                }
            }
        }
        changes
    }

    /// mtime and size gate the hash; the hash decides. A file that cannot be
    /// inspected counts as changed so the pipeline reports the real failure.
    fn is_changed(&self, rel: &str, stored: &FileMetadata) -> bool {
        let abs = self.root.join(rel);
        let Ok((modified_at, size_bytes)) = stat(&abs) else {
            return true;
        };
        if !self.always_hash && modified_at == stored.modified_at && size_bytes == stored.size_bytes
        {
            return false;
        }
        match hash_file(&abs) {
            Ok(hash) => hash != stored.content_hash,
            Err(_) => true,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UpdateDetails {
    pub changed: Vec<String>,
    pub new: Vec<String>,
    pub deleted: Vec<String>,
    pub files_processed: usize,
    pub symbols_extracted: usize,
    pub total_files: usize,
    pub total_symbols: usize,
    pub failures: Vec<FileFailure>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct UpdateReport {
    pub updated: bool,
    #[serde(flatten)]
    pub details: Option<UpdateDetails>,
}

impl UpdateReport {
    pub fn noop() -> Self {
        Self {
            updated: false,
            details: None,
        }
    }
}

pub struct IncrementalUpdater<'a> {
    store: &'a IndexStore,
    pipeline: &'a BuildPipeline,
    detector: ChangeDetector<'a>,
}

impl<'a> IncrementalUpdater<'a> {
    pub fn new(
        store: &'a IndexStore,
        pipeline: &'a BuildPipeline,
        detector: ChangeDetector<'a>,
    ) -> Self {
        Self {
            store,
            pipeline,
            detector,
        }
    }

    pub fn update(&self, current: &BTreeSet<String>) -> Result<UpdateReport> {
        let stored = self.store.load_files().context("Failed to load file table")?;
        let changes = self.detector.diff(current, &stored);
        self.apply(changes)
    }

    pub fn apply_batch(&self, batch: &ChangeBatch) -> Result<UpdateReport> {
        let stored = self.store.load_files().context("Failed to load file table")?;
        let changes = self.detector.diff_batch(batch, &stored);
        self.apply(changes)
    }

    fn apply(&self, changes: ChangeSet) -> Result<UpdateReport> {
        if changes.is_empty() {
            debug!("index is up to date");
            return Ok(UpdateReport::noop());
        }

        let start = Instant::now();
        // a same-second, same-size edit keeps its cache key
        for path in changes.changed.iter().chain(&changes.deleted) {
            self.pipeline.cache().invalidate(path);
        }
        let refreshed = changes.refreshed();
        let output = self.pipeline.process(&refreshed);
        let symbols_extracted = output.records.len();

        let index = self
            .store
            .merge(MergeSet {
                deleted: changes.deleted.clone(),
                changed_or_new: refreshed.clone(),
                records: output.records,
                metadata: output.metadata,
            })
            .context("Failed to persist merged index")?;

        info!(
            changed = changes.changed.len(),
            new = changes.new.len(),
            deleted = changes.deleted.len(),
            "index updated"
        );

        Ok(UpdateReport {
            updated: true,
            details: Some(UpdateDetails {
                changed: changes.changed,
                new: changes.new,
                deleted: changes.deleted,
                files_processed: refreshed.len(),
                symbols_extracted,
                total_files: index.total_files,
                total_symbols: index.total_symbols,
                failures: output.failures,
                duration_ms: start.elapsed().as_millis() as u64,
            }),
        })
    }
}
