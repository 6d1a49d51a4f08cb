//! Long-running watch mode.
//!
//! A [`WatchLock`] marks the index directory as owned by a live watcher, an
//! [`FsWatcher`] turns debounced file-system events into [`ChangeBatch`]es,
//! and a [`WatchSession`] applies them one at a time until cancelled.

use anyhow::{Context, Result};
use notify::event::{ModifyKind, RenameMode};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::engine::Engine;
use crate::error::{IndexError, IndexResult};
use crate::incremental::{ChangeBatch, UpdateReport};
use crate::scan::SOURCE_EXTENSION;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Free,
    Held { pid: u32 },
    Stale { pid: u32 },
}

/// PID file held for the lifetime of a watch session.
#[derive(Debug)]
pub struct WatchLock {
    path: PathBuf,
    released: bool,
}

impl WatchLock {
    /// Claims `path` for this process. A lock left by a dead process is
    /// replaced; a lock held by a live one is refused.
    pub fn acquire(path: &Path) -> IndexResult<Self> {
        match Self::probe(path)? {
            LockState::Held { pid } => {
                return Err(IndexError::WatcherActive {
                    pid,
                    lock: path.to_path_buf(),
                });
            }
            LockState::Stale { pid } => {
                warn!(pid, lock = %path.display(), "replacing stale watch lock");
                Self::remove_stale(path)?;
            }
            LockState::Free => {}
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| IndexError::io(parent, e))?;
        }
        let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                // lost a race with another watcher
                let pid = read_pid(path)?.unwrap_or(0);
                return Err(IndexError::WatcherActive {
                    pid,
                    lock: path.to_path_buf(),
                });
            }
            Err(e) => return Err(IndexError::io(path, e)),
        };
        let pid = std::process::id();
        file.write_all(pid.to_string().as_bytes())
            .map_err(|e| IndexError::io(path, e))?;

        info!(pid, lock = %path.display(), "watch lock acquired");
        Ok(Self {
            path: path.to_path_buf(),
            released: false,
        })
    }

    pub fn probe(path: &Path) -> IndexResult<LockState> {
        let Some(pid) = read_pid(path)? else {
            return Ok(LockState::Free);
        };
        if pid != 0 && is_pid_running(pid) {
            Ok(LockState::Held { pid })
        } else {
            Ok(LockState::Stale { pid })
        }
    }

    /// Removes the lock file regardless of owner. Callers probe first.
    pub fn remove_stale(path: &Path) -> IndexResult<()> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(IndexError::io(path, e)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn release(mut self) -> IndexResult<()> {
        self.released = true;
        self.remove_if_owned()
    }

    fn remove_if_owned(&self) -> IndexResult<()> {
        if read_pid(&self.path)? == Some(std::process::id()) {
            Self::remove_stale(&self.path)?;
            debug!(lock = %self.path.display(), "watch lock released");
        }
        Ok(())
    }
}

impl Drop for WatchLock {
    fn drop(&mut self) {
        if !self.released {
            let _ = self.remove_if_owned();
        }
    }
}

/// `Ok(None)` when no lock exists; unparsable content reads as pid 0.
fn read_pid(path: &Path) -> IndexResult<Option<u32>> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(Some(content.trim().parse().unwrap_or(0))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(IndexError::io(path, e)),
    }
}

#[cfg(unix)]
fn is_pid_running(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        // exists but belongs to someone else
        Err(_) => true,
    }
}

#[cfg(not(unix))]
fn is_pid_running(_pid: u32) -> bool {
    true
}

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

#[cfg(unix)]
extern "C" fn on_shutdown_signal(_: std::ffi::c_int) {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

#[cfg(unix)]
pub fn install_shutdown_handler() -> Result<&'static AtomicBool> {
    use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};

    let action = SigAction::new(
        SigHandler::Handler(on_shutdown_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    for signal in [Signal::SIGINT, Signal::SIGTERM] {
        // SAFETY: the handler only stores to an atomic.
        unsafe { sigaction(signal, &action) }
            .with_context(|| format!("Failed to install {signal} handler"))?;
    }
    Ok(&SHUTDOWN)
}

#[cfg(not(unix))]
pub fn install_shutdown_handler() -> Result<&'static AtomicBool> {
    Ok(&SHUTDOWN)
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SessionStats {
    pub batches: usize,
    pub updates: usize,
    pub noops: usize,
    pub errors: usize,
}

pub struct WatchSession<'e> {
    engine: &'e Engine,
    lock: WatchLock,
    stats: SessionStats,
}

impl<'e> WatchSession<'e> {
    pub fn start(engine: &'e Engine) -> Result<Self> {
        let lock = WatchLock::acquire(&engine.store().layout().lock_path())?;
        Ok(Self {
            engine,
            lock,
            stats: SessionStats::default(),
        })
    }

    pub fn lock(&self) -> &WatchLock {
        &self.lock
    }

    pub fn run(mut self, batches: Receiver<ChangeBatch>, cancel: &AtomicBool) -> Result<SessionStats> {
        info!(root = %self.engine.root().display(), "watching for changes");
        while !cancel.load(Ordering::SeqCst) {
            match batches.recv_timeout(POLL_INTERVAL) {
                Ok(batch) => self.apply(&batch),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        let stats = self.stats;
        self.lock.release()?;
        info!(?stats, "watch session finished");
        Ok(stats)
    }

    fn apply(&mut self, batch: &ChangeBatch) {
        self.stats.batches += 1;
        debug!(paths = batch.len(), "applying change batch");
        match self.engine.apply_batch(batch) {
            Ok(report) if report.updated => {
                self.stats.updates += 1;
                if let Some(details) = &report.details {
                    info!(
                        changed = details.changed.len(),
                        new = details.new.len(),
                        deleted = details.deleted.len(),
                        total_symbols = details.total_symbols,
                        "index refreshed"
                    );
                }
            }
            Ok(_) => self.stats.noops += 1,
            Err(e) => {
                self.stats.errors += 1;
                error!(error = %format!("{e:#}"), "failed to apply change batch");
            }
        }
    }
}

/// Holds the lock, starts the file watcher, brings the index up to date and
/// then applies batches until `cancel` is set. The watcher is running before
/// the initial update, so edits made during it are queued rather than lost.
pub fn watch_until_cancelled(
    engine: &Engine,
    debounce: Duration,
    cancel: &AtomicBool,
    on_initial: impl FnOnce(&UpdateReport) -> Result<()>,
) -> Result<SessionStats> {
    let session = WatchSession::start(engine)?;
    let (tx, rx) = mpsc::channel();
    let watcher = FsWatcher::spawn(engine.root(), debounce, tx)?;

    let initial = engine.update()?;
    on_initial(&initial)?;

    let stats = session.run(rx, cancel)?;
    drop(watcher);
    Ok(stats)
}

#[derive(Debug, Default)]
struct PendingBatch {
    modified: BTreeSet<PathBuf>,
    added: BTreeSet<PathBuf>,
    removed: BTreeSet<PathBuf>,
}

impl PendingBatch {
    fn is_empty(&self) -> bool {
        self.modified.is_empty() && self.added.is_empty() && self.removed.is_empty()
    }

    fn record(&mut self, event: &Event) {
        let sources: Vec<&PathBuf> = event.paths.iter().filter(|p| is_source(p)).collect();
        if sources.is_empty() {
            return;
        }
        match event.kind {
            EventKind::Create(_) | EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
                self.added.extend(sources.into_iter().cloned());
            }
            EventKind::Remove(_) | EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
                self.removed.extend(sources.into_iter().cloned());
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
                // paths are [from, to]
                for (i, path) in event.paths.iter().enumerate() {
                    if !is_source(path) {
                        continue;
                    }
                    if i == 0 {
                        self.removed.insert(path.clone());
                    } else {
                        self.added.insert(path.clone());
                    }
                }
            }
            EventKind::Modify(_) | EventKind::Any => {
                self.modified.extend(sources.into_iter().cloned());
            }
            EventKind::Access(_) | EventKind::Other => {}
        }
    }

    fn take(&mut self) -> ChangeBatch {
        let pending = std::mem::take(self);
        ChangeBatch {
            modified: pending.modified.into_iter().collect(),
            added: pending.added.into_iter().collect(),
            removed: pending.removed.into_iter().collect(),
        }
    }
}

fn is_source(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == SOURCE_EXTENSION)
}

/// Recursive file-system watcher that emits one batch per quiet period.
/// Dropping it stops the watcher and closes the batch channel.
pub struct FsWatcher {
    watcher: Option<RecommendedWatcher>,
    debouncer: Option<JoinHandle<()>>,
}

impl FsWatcher {
    pub fn spawn(root: &Path, debounce: Duration, batches: Sender<ChangeBatch>) -> Result<Self> {
        let (tx, rx) = mpsc::channel();
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    let _ = tx.send(event);
                }
                Err(e) => warn!(error = %e, "file watcher error"),
            },
            Config::default(),
        )
        .context("Failed to create file watcher")?;
        watcher
            .watch(root, RecursiveMode::Recursive)
            .with_context(|| format!("Failed to watch {}", root.display()))?;

        let debouncer = std::thread::Builder::new()
            .name("rb-finder-debounce".to_string())
            .spawn(move || debounce_loop(rx, batches, debounce))
            .context("Failed to spawn debounce thread")?;

        Ok(Self {
            watcher: Some(watcher),
            debouncer: Some(debouncer),
        })
    }
}

impl Drop for FsWatcher {
    fn drop(&mut self) {
        // the watcher owns the event sender; dropping it ends the debouncer
        self.watcher.take();
        if let Some(handle) = self.debouncer.take() {
            let _ = handle.join();
        }
    }
}

fn debounce_loop(events: Receiver<Event>, batches: Sender<ChangeBatch>, debounce: Duration) {
    let mut pending = PendingBatch::default();
    let mut last_event = Instant::now();

    loop {
        match events.recv_timeout(POLL_INTERVAL) {
            Ok(event) => {
                pending.record(&event);
                last_event = Instant::now();
            }
            Err(RecvTimeoutError::Timeout) => {
                if !pending.is_empty() && last_event.elapsed() >= debounce {
                    if batches.send(pending.take()).is_err() {
                        return;
                    }
                }
            }
            Err(RecvTimeoutError::Disconnected) => {
                if !pending.is_empty() {
                    let _ = batches.send(pending.take());
                }
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EngineConfig, IndexLayout};
    use crate::store::IndexStore;
    use notify::event::{CreateKind, DataChange, RemoveKind};

    fn engine_for(root: &Path) -> Engine {
        let config = EngineConfig {
            workers: 2,
            show_progress: false,
            ..EngineConfig::default()
        };
        Engine::open(root.to_path_buf(), root.join(".rb-finder"), config).unwrap()
    }

    #[test]
    fn lock_refuses_live_owner_and_cleans_up_on_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("watch.lock");

        let lock = WatchLock::acquire(&path).unwrap();
        assert_eq!(
            WatchLock::probe(&path).unwrap(),
            LockState::Held {
                pid: std::process::id()
            }
        );
        let err = WatchLock::acquire(&path).unwrap_err();
        assert!(matches!(err, IndexError::WatcherActive { .. }));

        lock.release().unwrap();
        assert_eq!(WatchLock::probe(&path).unwrap(), LockState::Free);
    }

    #[test]
    fn dropping_the_lock_removes_it() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("watch.lock");
        {
            let _lock = WatchLock::acquire(&path).unwrap();
            assert!(path.exists());
        }
        assert!(!path.exists());
    }

    #[cfg(unix)]
    #[test]
    fn dead_owner_is_stale_and_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("watch.lock");
        fs::write(&path, i32::MAX.to_string()).unwrap();

        assert_eq!(
            WatchLock::probe(&path).unwrap(),
            LockState::Stale {
                pid: i32::MAX as u32
            }
        );
        let lock = WatchLock::acquire(&path).unwrap();
        assert_eq!(
            fs::read_to_string(lock.path()).unwrap(),
            std::process::id().to_string()
        );
    }

    #[test]
    fn garbage_lock_content_is_stale() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("watch.lock");
        fs::write(&path, "not a pid").unwrap();
        assert_eq!(WatchLock::probe(&path).unwrap(), LockState::Stale { pid: 0 });
    }

    #[test]
    fn pending_batch_classifies_events_and_ignores_other_files() {
        let mut pending = PendingBatch::default();
        pending.record(&Event::new(EventKind::Create(CreateKind::File)).add_path("a.rb".into()));
        pending.record(
            &Event::new(EventKind::Modify(ModifyKind::Data(DataChange::Content)))
                .add_path("b.rb".into()),
        );
        pending.record(&Event::new(EventKind::Remove(RemoveKind::File)).add_path("c.rb".into()));
        pending.record(
            &Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
                .add_path("old.rb".into())
                .add_path("new.rb".into()),
        );
        pending.record(&Event::new(EventKind::Create(CreateKind::File)).add_path("index.json".into()));

        let batch = pending.take();
        assert_eq!(
            batch.added,
            vec![PathBuf::from("a.rb"), PathBuf::from("new.rb")]
        );
        assert_eq!(batch.modified, vec![PathBuf::from("b.rb")]);
        assert_eq!(
            batch.removed,
            vec![PathBuf::from("c.rb"), PathBuf::from("old.rb")]
        );
        assert!(pending.is_empty());
    }

    #[test]
    fn debounce_flushes_pending_events_when_source_closes() {
        let (event_tx, event_rx) = mpsc::channel();
        let (batch_tx, batch_rx) = mpsc::channel();
        event_tx
            .send(Event::new(EventKind::Create(CreateKind::File)).add_path("a.rb".into()))
            .unwrap();
        drop(event_tx);

        debounce_loop(event_rx, batch_tx, Duration::from_secs(60));
        let batch = batch_rx.recv().unwrap();
        assert_eq!(batch.added, vec![PathBuf::from("a.rb")]);
        assert!(batch_rx.recv().is_err());
    }

    #[test]
    fn session_applies_batches_and_releases_lock() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::write(root.join("a.rb"), "class A\nend\n").unwrap();
        let engine = engine_for(root);
        engine.build().unwrap();

        let session = WatchSession::start(&engine).unwrap();
        let lock_path = session.lock().path().to_path_buf();
        assert!(WatchSession::start(&engine).is_err());

        let (tx, rx) = mpsc::channel();
        fs::write(root.join("b.rb"), "module B\nend\n").unwrap();
        tx.send(ChangeBatch {
            added: vec![root.join("b.rb")],
            ..ChangeBatch::default()
        })
        .unwrap();
        tx.send(ChangeBatch {
            modified: vec![root.join("a.rb")],
            ..ChangeBatch::default()
        })
        .unwrap();
        drop(tx);

        let cancel = AtomicBool::new(false);
        let stats = session.run(rx, &cancel).unwrap();
        assert_eq!(stats.batches, 2);
        assert_eq!(stats.updates, 1);
        assert_eq!(stats.noops, 1);
        assert!(!lock_path.exists());

        let hits = engine.search("B", None).unwrap();
        assert_eq!(hits[0].record.file, "b.rb");
    }

    #[test]
    fn edit_after_initial_update_is_picked_up() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        fs::write(root.join("a.rb"), "class A\nend\n").unwrap();
        let engine = engine_for(&root);
        let store = IndexStore::new(IndexLayout::new(root.join(".rb-finder")));
        let cancel = AtomicBool::new(false);

        let stats = std::thread::scope(|s| {
            s.spawn(|| {
                let deadline = Instant::now() + Duration::from_secs(20);
                while Instant::now() < deadline {
                    let indexed = store
                        .load()
                        .map(|index| index.symbols.contains_key("Late"))
                        .unwrap_or(false);
                    if indexed {
                        break;
                    }
                    std::thread::sleep(Duration::from_millis(50));
                }
                cancel.store(true, Ordering::SeqCst);
            });

            watch_until_cancelled(&engine, Duration::from_millis(50), &cancel, |initial| {
                assert!(initial.updated);
                fs::write(root.join("late.rb"), "class Late\nend\n")?;
                Ok(())
            })
            .unwrap()
        });

        assert!(stats.updates >= 1);
        assert!(store.load().unwrap().symbols.contains_key("Late"));
        assert!(!root.join(".rb-finder/watch.lock").exists());
    }

    #[test]
    fn cancelled_session_stops_without_draining() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_for(dir.path());
        let session = WatchSession::start(&engine).unwrap();
        let (_tx, rx) = mpsc::channel::<ChangeBatch>();

        let cancel = AtomicBool::new(true);
        let stats = session.run(rx, &cancel).unwrap();
        assert_eq!(stats.batches, 0);
    }
}
