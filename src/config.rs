use anyhow::{Context, Result};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cli::Cli;
use crate::error::{IndexError, IndexResult};

pub const DEFAULT_INDEX_DIR: &str = ".rb-finder";
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_WORKERS: usize = 8;
pub const MIN_WORKERS: usize = 2;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub workers: usize,
    pub queue_capacity: usize,
    pub task_timeout: Duration,
    pub always_hash: bool,
    pub show_progress: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            task_timeout: DEFAULT_TASK_TIMEOUT,
            always_hash: false,
            show_progress: true,
        }
    }
}

impl EngineConfig {
    /// CLI flag, then `RB_FINDER_*` environment variable, then default.
    pub fn resolve(cli: &Cli) -> Self {
        let mut config = Self::default();

        if let Some(n) = cli.workers.or_else(|| env_parse("RB_FINDER_WORKERS")) {
            config.workers = n.max(MIN_WORKERS);
        }
        if let Some(ms) = cli
            .timeout_ms
            .or_else(|| env_parse("RB_FINDER_TASK_TIMEOUT_MS"))
        {
            config.task_timeout = Duration::from_millis(ms.max(1));
        }
        config.always_hash = cli.always_hash || env_flag("RB_FINDER_ALWAYS_HASH");
        config.show_progress = !cli.quiet;
        config
    }
}

pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(MIN_WORKERS)
        .clamp(MIN_WORKERS, MAX_WORKERS)
}

pub fn resolve_root(cli: &Cli) -> Result<PathBuf> {
    let root = match cli.root.clone() {
        Some(p) => p,
        None => match env::var("RB_FINDER_ROOT") {
            Ok(p) => PathBuf::from(p),
            Err(_) => env::current_dir().context("Failed to resolve current directory")?,
        },
    };
    root.canonicalize()
        .with_context(|| format!("Invalid corpus root: {}", root.display()))
}

pub fn resolve_index_dir(cli: &Cli, root: &Path) -> PathBuf {
    if let Some(p) = cli.index_dir.clone() {
        return p;
    }
    if let Ok(p) = env::var("RB_FINDER_INDEX_DIR") {
        return PathBuf::from(p);
    }
    root.join(DEFAULT_INDEX_DIR)
}

#[derive(Debug, Clone)]
pub struct IndexLayout {
    dir: PathBuf,
}

impl IndexLayout {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn index_path(&self) -> PathBuf {
        self.dir.join("index.json")
    }

    pub fn files_path(&self) -> PathBuf {
        self.dir.join("files.json")
    }

    pub fn meta_path(&self) -> PathBuf {
        self.dir.join("meta.json")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.dir.join("watch.lock")
    }

    /// Removes the snapshot files. The watch lock is left alone.
    pub fn clear(&self) -> Result<()> {
        remove_file_if_exists(&self.index_path(), "index")?;
        remove_file_if_exists(&self.files_path(), "file table")?;
        remove_file_if_exists(&self.meta_path(), "build metadata")?;
        Ok(())
    }
}

/// Writes `bytes` to a sibling temp file and renames it over `path`, so a
/// reader sees either the old content or the new one.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> IndexResult<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).map_err(|e| IndexError::io(parent, e))?;
    }

    let mut tmp_os = path.as_os_str().to_os_string();
    tmp_os.push(format!(".{}.tmp", std::process::id()));
    let tmp = PathBuf::from(tmp_os);

    std::fs::write(&tmp, bytes).map_err(|e| IndexError::io(&tmp, e))?;
    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(IndexError::io(path, e));
    }
    Ok(())
}

fn remove_file_if_exists(path: &Path, kind: &str) -> Result<()> {
    if path.exists() {
        std::fs::remove_file(path)
            .with_context(|| format!("Failed to remove {kind} file: {}", path.display()))?;
    }
    Ok(())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

fn env_flag(key: &str) -> bool {
    env::var(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn default_workers_stays_within_bounds() {
        let n = default_workers();
        assert!((MIN_WORKERS..=MAX_WORKERS).contains(&n));
    }

    #[test]
    fn cli_flags_override_defaults() {
        let cli = Cli::parse_from([
            "rb-finder",
            "--workers",
            "3",
            "--timeout-ms",
            "250",
            "--always-hash",
            "-q",
            "build",
        ]);
        let config = EngineConfig::resolve(&cli);
        assert_eq!(config.workers, 3);
        assert_eq!(config.task_timeout, Duration::from_millis(250));
        assert!(config.always_hash);
        assert!(!config.show_progress);
    }

    #[test]
    fn worker_override_never_drops_below_minimum() {
        let cli = Cli::parse_from(["rb-finder", "--workers", "1", "build"]);
        assert_eq!(EngineConfig::resolve(&cli).workers, MIN_WORKERS);
    }

    #[test]
    fn write_atomic_replaces_content_and_leaves_no_temp() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let target = dir.path().join("nested").join("index.json");
        write_atomic(&target, b"one")?;
        write_atomic(&target, b"two")?;
        assert_eq!(std::fs::read_to_string(&target)?, "two");

        let leftovers: Vec<_> = std::fs::read_dir(target.parent().unwrap())?
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
        Ok(())
    }

    #[test]
    fn layout_clear_keeps_lock() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let layout = IndexLayout::new(dir.path());
        std::fs::write(layout.index_path(), "{}")?;
        std::fs::write(layout.lock_path(), "1")?;
        layout.clear()?;
        assert!(!layout.index_path().exists());
        assert!(layout.lock_path().exists());
        Ok(())
    }
}
