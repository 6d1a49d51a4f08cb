//! One engine instance per corpus root.
//!
//! The engine owns its extraction cache, worker pool and index store, so
//! several engines (or tests) can run side by side without shared globals.

use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

use crate::cache::ExtractionCache;
use crate::config::{EngineConfig, IndexLayout};
use crate::incremental::{
    ChangeBatch, ChangeDetector, IncrementalUpdater, UpdateDetails, UpdateReport,
};
use crate::model::SymbolKind;
use crate::pipeline::{BuildPipeline, FileFailure, PipelineStats};
use crate::query::{QueryEngine, SearchHit};
use crate::scan::scan_sources;
use crate::store::IndexStore;
use crate::watch::{LockState, WatchLock};

#[derive(Debug, Clone, Serialize)]
pub struct BuildReport {
    pub files_processed: usize,
    pub symbols_extracted: usize,
    pub total_files: usize,
    pub total_symbols: usize,
    pub failures: Vec<FileFailure>,
    pub duration_ms: u64,
    pub pipeline: PipelineStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct WatcherStatus {
    pub active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub stale_lock_removed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub index_present: bool,
    pub root: String,
    pub index_dir: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub built_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_files: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_symbols: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parser: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parser_version: Option<String>,
    pub watcher: WatcherStatus,
}

pub struct Engine {
    root: PathBuf,
    config: EngineConfig,
    store: IndexStore,
    pipeline: BuildPipeline,
}

impl Engine {
    pub fn open(root: PathBuf, index_dir: PathBuf, config: EngineConfig) -> Result<Self> {
        let cache = Arc::new(ExtractionCache::new());
        let pipeline = BuildPipeline::new(root.clone(), cache, &config)?;
        info!(
            root = %root.display(),
            workers = pipeline.workers(),
            "engine ready"
        );
        Ok(Self {
            root,
            config,
            store: IndexStore::new(IndexLayout::new(index_dir)),
            pipeline,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn store(&self) -> &IndexStore {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn build(&self) -> Result<BuildReport> {
        let start = Instant::now();
        let files = scan_sources(&self.root)
            .with_context(|| format!("Failed to scan {}", self.root.display()))?;
        let output = self.pipeline.process(&files);
        let symbols_extracted = output.records.len();

        let index = self
            .store
            .save(output.records, output.metadata)
            .context("Failed to save index")?;

        Ok(BuildReport {
            files_processed: files.len(),
            symbols_extracted,
            total_files: index.total_files,
            total_symbols: index.total_symbols,
            failures: output.failures,
            duration_ms: start.elapsed().as_millis() as u64,
            pipeline: output.stats,
        })
    }

    /// Incremental update of the whole corpus; falls back to a full build
    /// when nothing has been persisted yet.
    pub fn update(&self) -> Result<UpdateReport> {
        if !self.store.exists() {
            return self.build_as_update();
        }
        let current: BTreeSet<String> = scan_sources(&self.root)
            .with_context(|| format!("Failed to scan {}", self.root.display()))?
            .into_iter()
            .collect();
        self.updater().update(&current)
    }

    pub fn apply_batch(&self, batch: &ChangeBatch) -> Result<UpdateReport> {
        if !self.store.exists() {
            return self.build_as_update();
        }
        self.updater().apply_batch(batch)
    }

    pub fn search(&self, query: &str, kind: Option<SymbolKind>) -> Result<Vec<SearchHit>> {
        let index = self.store.load()?;
        Ok(QueryEngine::new(&index).search(query, kind))
    }

    /// Read-only apart from removing a stale watch lock.
    pub fn status(&self) -> Result<StatusReport> {
        let layout = self.store.layout();
        let lock_path = layout.lock_path();
        let watcher = match WatchLock::probe(&lock_path)? {
            LockState::Free => WatcherStatus {
                active: false,
                pid: None,
                stale_lock_removed: false,
            },
            LockState::Held { pid } => WatcherStatus {
                active: true,
                pid: Some(pid),
                stale_lock_removed: false,
            },
            LockState::Stale { pid } => {
                WatchLock::remove_stale(&lock_path)?;
                warn!(pid, "removed stale watch lock");
                WatcherStatus {
                    active: false,
                    pid: None,
                    stale_lock_removed: true,
                }
            }
        };

        let index = if self.store.exists() {
            Some(self.store.load()?)
        } else {
            None
        };
        let meta = self.store.load_meta()?;

        Ok(StatusReport {
            index_present: index.is_some(),
            root: self.root.to_string_lossy().to_string(),
            index_dir: layout.dir().to_string_lossy().to_string(),
            built_at: index.as_ref().map(|i| i.built_at),
            total_files: index.as_ref().map(|i| i.total_files),
            total_symbols: index.as_ref().map(|i| i.total_symbols),
            tool_version: meta.as_ref().map(|m| m.tool_version.clone()),
            parser: meta.as_ref().map(|m| m.parser.clone()),
            parser_version: meta.map(|m| m.parser_version),
            watcher,
        })
    }

    pub fn clear(&self) -> Result<()> {
        self.store.layout().clear()?;
        self.clear_cache();
        Ok(())
    }

    pub fn clear_cache(&self) {
        self.pipeline.cache().clear();
    }

    fn updater(&self) -> IncrementalUpdater<'_> {
        IncrementalUpdater::new(
            &self.store,
            &self.pipeline,
            ChangeDetector::new(&self.root, self.config.always_hash),
        )
    }

    fn build_as_update(&self) -> Result<UpdateReport> {
        info!("no index yet, running a full build");
        let report = self.build()?;
        let files = self.store.load_files()?;
        Ok(UpdateReport {
            updated: true,
            details: Some(UpdateDetails {
                changed: Vec::new(),
                new: files.keys().cloned().collect(),
                deleted: Vec::new(),
                files_processed: report.files_processed,
                symbols_extracted: report.symbols_extracted,
                total_files: report.total_files,
                total_symbols: report.total_symbols,
                failures: report.failures,
                duration_ms: report.duration_ms,
            }),
        })
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.clear_cache();
    }
}
