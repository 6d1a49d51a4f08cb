//! Concurrent build pipeline.
//!
//! Extraction tasks run on a fixed rayon pool. At most `queue_capacity` tasks
//! may wait for a worker; beyond that the submitting thread runs the task
//! itself, which throttles submission without dropping work. Results are
//! collected in submission order with a per-task timeout, and every per-file
//! failure degrades to "no symbols for this file".

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use rayon::ThreadPool;
use serde::Serialize;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::Duration;
use tracing::{debug, warn};

use crate::cache::{ExtractionCache, FileOutcome};
use crate::config::{EngineConfig, MIN_WORKERS};
use crate::error::IndexError;
use crate::model::{FileTable, SymbolRecord};

const WORKER_STACK_SIZE: usize = 8 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Syntax,
    Timeout,
    Read,
    Panic,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileFailure {
    pub path: String,
    pub kind: FailureKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct PipelineStats {
    pub submitted: usize,
    pub caller_ran: usize,
    pub cache_hits: usize,
}

#[derive(Debug, Default)]
pub struct PipelineOutput {
    pub records: Vec<SymbolRecord>,
    /// Only files that were actually read; timed-out and unreadable files are
    /// absent so that the next update retries them.
    pub metadata: FileTable,
    pub failures: Vec<FileFailure>,
    pub stats: PipelineStats,
}

type TaskResult = std::result::Result<FileOutcome, FileFailure>;

pub struct BuildPipeline {
    pool: ThreadPool,
    cache: Arc<ExtractionCache>,
    root: PathBuf,
    queue_capacity: usize,
    task_timeout: Duration,
    show_progress: bool,
}

impl BuildPipeline {
    pub fn new(root: PathBuf, cache: Arc<ExtractionCache>, config: &EngineConfig) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.workers.max(MIN_WORKERS))
            .thread_name(|i| format!("rb-finder-extract-{i}"))
            .stack_size(WORKER_STACK_SIZE)
            .build()
            .context("Failed to start extraction worker pool")?;

        Ok(Self {
            pool,
            cache,
            root,
            queue_capacity: config.queue_capacity.max(1),
            task_timeout: config.task_timeout,
            show_progress: config.show_progress,
        })
    }

    pub fn workers(&self) -> usize {
        self.pool.current_num_threads()
    }

    pub fn cache(&self) -> &ExtractionCache {
        &self.cache
    }

    pub fn process(&self, files: &[String]) -> PipelineOutput {
        let queued = Arc::new(AtomicUsize::new(0));
        let mut stats = PipelineStats::default();
        let mut pending = Vec::with_capacity(files.len());

        for rel in files {
            let (tx, rx) = mpsc::channel::<TaskResult>();
            let cache = Arc::clone(&self.cache);
            let root = self.root.clone();
            let path = rel.clone();

            if queued.load(Ordering::Acquire) >= self.queue_capacity {
                stats.caller_ran += 1;
                let _ = tx.send(run_task(&cache, &root, &path));
            } else {
                queued.fetch_add(1, Ordering::AcqRel);
                let queued = Arc::clone(&queued);
                self.pool.spawn(move || {
                    queued.fetch_sub(1, Ordering::AcqRel);
                    // the receiver may have given up after a timeout
                    let _ = tx.send(run_task(&cache, &root, &path));
                });
            }
            stats.submitted += 1;
            pending.push((rel, rx));
        }

        let progress = self.progress_bar(files.len());
        let mut output = PipelineOutput::default();

        for (rel, rx) in pending {
            match rx.recv_timeout(self.task_timeout) {
                Ok(Ok(outcome)) => {
                    if outcome.cache_hit {
                        stats.cache_hits += 1;
                    }
                    if let Some(err) = outcome.error {
                        warn!(path = %rel, error = %err, "skipping symbols for file");
                        output.failures.push(FileFailure {
                            path: rel.clone(),
                            kind: FailureKind::Syntax,
                            message: err.to_string(),
                        });
                    }
                    output.metadata.insert(rel.clone(), outcome.metadata);
                    output.records.extend(outcome.records);
                }
                Ok(Err(failure)) => {
                    warn!(path = %rel, error = %failure.message, "extraction failed");
                    output.failures.push(failure);
                }
                Err(RecvTimeoutError::Timeout) => {
                    let err = IndexError::TaskTimeout {
                        path: rel.clone(),
                        timeout: self.task_timeout,
                    };
                    warn!(path = %rel, "{err}");
                    output.failures.push(FileFailure {
                        path: rel.clone(),
                        kind: FailureKind::Timeout,
                        message: err.to_string(),
                    });
                }
                Err(RecvTimeoutError::Disconnected) => {
                    warn!(path = %rel, "extraction task was dropped");
                    output.failures.push(FileFailure {
                        path: rel.clone(),
                        kind: FailureKind::Panic,
                        message: "extraction task ended without a result".to_string(),
                    });
                }
            }
            progress.inc(1);
        }
        progress.finish_and_clear();

        output.stats = stats;
        debug!(
            files = files.len(),
            symbols = output.records.len(),
            failures = output.failures.len(),
            caller_ran = stats.caller_ran,
            cache_hits = stats.cache_hits,
            "pipeline finished"
        );
        output
    }

    fn progress_bar(&self, len: usize) -> ProgressBar {
        if !self.show_progress || len == 0 {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(len as u64);
        pb.set_style(
            ProgressStyle::with_template(
                "{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} files ({eta})",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("##-"),
        );
        pb
    }
}

fn run_task(cache: &ExtractionCache, root: &Path, rel: &str) -> TaskResult {
    match catch_unwind(AssertUnwindSafe(|| cache.get_or_extract(root, rel))) {
        Ok(Ok(outcome)) => Ok(outcome),
        Ok(Err(err)) => Err(FileFailure {
            path: rel.to_string(),
            kind: FailureKind::Read,
            message: err.to_string(),
        }),
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "extractor panicked".to_string());
            Err(FileFailure {
                path: rel.to_string(),
                kind: FailureKind::Panic,
                message,
            })
        }
    }
}
