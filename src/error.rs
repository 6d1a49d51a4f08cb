use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Failure categories surfaced by the index engine.
///
/// `Syntax` and `TaskTimeout` are per-file and never abort a build; they are
/// collected into the build report. The remaining variants end the current
/// operation.
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("syntax error in {path} near line {line}")]
    Syntax { path: String, line: u32 },

    #[error("extraction of {path} exceeded {timeout:?}")]
    TaskTimeout { path: String, timeout: Duration },

    #[error("no index found in {}; run `rb-finder build` first", dir.display())]
    IndexMissing { dir: PathBuf },

    #[error("I/O failure on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt index snapshot {}: {source}", path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("index snapshot {} has format version {found}, expected {expected}; rebuild it", path.display())]
    Incompatible {
        path: PathBuf,
        found: u32,
        expected: u32,
    },

    #[error("a watcher (pid {pid}) already holds {}", lock.display())]
    WatcherActive { pid: u32, lock: PathBuf },
}

impl IndexError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

pub type IndexResult<T> = std::result::Result<T, IndexError>;

pub fn is_index_missing(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<IndexError>(),
        Some(IndexError::IndexMissing { .. })
    )
}
