//! Polling file watcher driving rolling restarts.
//!
//! Debug-mode only. Every 500 ms the watcher scans the tracked files; a
//! changed mtime is only acted on if the content hash actually differs, so
//! editor touches and checkout churn don't restart the pool. A file that
//! did change moves to the front of the scan list (recently-changed files
//! tend to change again), and at most one change is acted on per tick;
//! restarts are pool-wide, so further changes ride along on later ticks.

use crate::pool::Pool;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Poll cadence; a contract of the watcher, not a tuning knob.
pub const POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
struct TrackedFile {
    path: PathBuf,
    mtime: Option<SystemTime>,
    digest: Option<[u8; 32]>,
}

fn probe(path: &Path) -> (Option<SystemTime>, Option<[u8; 32]>) {
    let mtime = std::fs::metadata(path).and_then(|m| m.modified()).ok();
    let digest = std::fs::read(path)
        .ok()
        .map(|bytes| Sha256::digest(&bytes).into());
    (mtime, digest)
}

/// The set of watched source files. Seeded from configuration at boot and
/// grown by workers through the `files` control verb; set semantics, only
/// grows during a run.
#[derive(Default)]
pub struct TrackedFiles {
    inner: Mutex<Vec<TrackedFile>>,
}

impl TrackedFiles {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Merge paths into the set (union). New entries are stamped with their
    /// current mtime and content hash so pre-existing content does not
    /// trigger a reload.
    pub fn track<I>(&self, paths: I)
    where
        I: IntoIterator<Item = PathBuf>,
    {
        let mut inner = self.inner.lock();
        for path in paths {
            if inner.iter().any(|f| f.path == path) {
                continue;
            }
            let (mtime, digest) = probe(&path);
            debug!(path = %path.display(), "tracking file");
            inner.push(TrackedFile { path, mtime, digest });
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Scan for at most one content change, updating stamps as it goes.
    /// Returns the changed path, moved to the front of the scan list.
    pub fn poll_once(&self) -> Option<PathBuf> {
        let snapshot: Vec<TrackedFile> = self.inner.lock().clone();
        for file in snapshot {
            let mtime = match std::fs::metadata(&file.path).and_then(|m| m.modified()) {
                Ok(mtime) => mtime,
                Err(e) => {
                    debug!(path = %file.path.display(), error = %e, "cannot stat watched file");
                    continue;
                }
            };
            if file.mtime == Some(mtime) {
                continue;
            }
            let bytes = match std::fs::read(&file.path) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(path = %file.path.display(), error = %e, "failed to read watched file");
                    continue;
                }
            };
            let digest: [u8; 32] = Sha256::digest(&bytes).into();
            let changed = file.digest != Some(digest);
            self.commit(&file.path, mtime, digest, changed);
            if changed {
                return Some(file.path);
            }
        }
        None
    }

    fn commit(&self, path: &Path, mtime: SystemTime, digest: [u8; 32], move_front: bool) {
        let mut inner = self.inner.lock();
        if let Some(idx) = inner.iter().position(|f| f.path == path) {
            inner[idx].mtime = Some(mtime);
            inner[idx].digest = Some(digest);
            if move_front && idx != 0 {
                let file = inner.remove(idx);
                inner.insert(0, file);
            }
        }
    }

    /// Forget a file's stamps so the next poll re-probes it.
    #[cfg(test)]
    fn force_stale(&self, path: &Path) {
        let mut inner = self.inner.lock();
        if let Some(file) = inner.iter_mut().find(|f| f.path == path) {
            file.mtime = None;
        }
    }

    #[cfg(test)]
    fn scan_order(&self) -> Vec<PathBuf> {
        self.inner.lock().iter().map(|f| f.path.clone()).collect()
    }
}

/// Periodic poller that turns detected changes into rolling restarts.
pub struct Watcher {
    pool: Arc<Pool>,
    files: Arc<TrackedFiles>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Watcher {
    pub fn new(pool: Arc<Pool>, files: Arc<TrackedFiles>, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            pool,
            files,
            shutdown_rx,
        }
    }

    pub async fn run(mut self) {
        info!("file watcher running");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(POLL_INTERVAL) => {
                    if let Some(path) = self.files.poll_once() {
                        info!(path = %path.display(), "watched file changed, restarting pool");
                        self.pool.begin_rolling_restart();
                    }
                }
                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
    }
}
