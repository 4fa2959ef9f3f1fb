//! Top-level lifecycle: starting, running, reloading, emergency,
//! shutting down.
//!
//! [`start`] binds both listeners (fail fast), wires up the supervisor,
//! control plane, dispatcher, and (in debug mode) the file watcher, then
//! fills the pool. [`run`] adds the signal loop and orderly teardown for
//! the binary.

use crate::config::Config;
use crate::control::ControlServer;
use crate::dispatcher::Dispatcher;
use crate::pool::Pool;
use crate::supervisor::Supervisor;
use crate::watcher::{TrackedFiles, Watcher};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

/// Interval for polling child exits while draining at shutdown.
const SHUTDOWN_POLL_INTERVAL_MS: u64 = 50;

/// A running pool master.
pub struct Server {
    pool: Arc<Pool>,
    files: Arc<TrackedFiles>,
    shutdown_tx: watch::Sender<bool>,
    public_addr: SocketAddr,
    run_dir: PathBuf,
    _pid_file: Option<PidFile>,
}

/// Bind listeners, spawn the service tasks, and begin filling the pool.
/// Returns once everything is started; workers become ready asynchronously.
pub async fn start(config: Config) -> anyhow::Result<Server> {
    let pid_file = match config.server.pid_file.as_deref() {
        Some(path) => {
            let pid_file = PidFile::create(Path::new(path))?;
            info!(path, "PID file written and locked");
            Some(pid_file)
        }
        None => None,
    };

    // Private run directory for the control socket, data sockets, and
    // launch files. The random suffix keeps concurrent pools apart; 0700
    // keeps the unauthenticated control plane private.
    let run_dir = std::env::temp_dir().join(format!("poolgate-{}", Uuid::new_v4()));
    std::fs::create_dir_all(&run_dir)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&run_dir, std::fs::Permissions::from_mode(0o700))?;
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let files = TrackedFiles::new();
    files.track(config.watch.files.clone());

    let debug_mode = config.debug;
    let workers = config.pool.workers;
    let (pool, spawn_rx) = Pool::new(config, &run_dir);

    // Bind both listeners before anything runs; a bind error is fatal.
    let control =
        ControlServer::bind(pool.control_addr(), Arc::clone(&pool), Arc::clone(&files)).await?;
    let dispatcher = Dispatcher::bind(Arc::clone(&pool)).await?;
    let public_addr = dispatcher.local_addr()?;

    tokio::spawn(Supervisor::new(Arc::clone(&pool), spawn_rx).run());
    tokio::spawn(control.run(shutdown_rx.clone()));
    tokio::spawn(dispatcher.run(shutdown_rx.clone()));
    if debug_mode {
        tokio::spawn(
            Watcher::new(Arc::clone(&pool), Arc::clone(&files), shutdown_rx.clone()).run(),
        );
    }

    pool.spawn_all();
    info!(workers, addr = %public_addr, "pool starting; waiting for workers to boot");

    Ok(Server {
        pool,
        files,
        shutdown_tx,
        public_addr,
        run_dir,
        _pid_file: pid_file,
    })
}

impl Server {
    pub fn pool(&self) -> &Arc<Pool> {
        &self.pool
    }

    pub fn files(&self) -> &Arc<TrackedFiles> {
        &self.files
    }

    pub fn public_addr(&self) -> SocketAddr {
        self.public_addr
    }

    /// Orderly teardown: stop accepting, terminate children politely, kill
    /// whatever outlives the grace period, and remove the run directory.
    /// Idempotent.
    pub async fn shutdown(self) {
        if !self.pool.begin_shutdown() {
            return;
        }
        let _ = self.shutdown_tx.send(true);

        let grace = self.pool.config().shutdown_grace();
        let drain_start = Instant::now();
        while self.pool.live_children() > 0 && drain_start.elapsed() < grace {
            tokio::time::sleep(Duration::from_millis(SHUTDOWN_POLL_INTERVAL_MS)).await;
        }
        if self.pool.live_children() > 0 {
            self.pool.kill_remaining();
            let reap_start = Instant::now();
            while self.pool.live_children() > 0 && reap_start.elapsed() < Duration::from_secs(2) {
                tokio::time::sleep(Duration::from_millis(SHUTDOWN_POLL_INTERVAL_MS)).await;
            }
        }

        if let Err(e) = std::fs::remove_dir_all(&self.run_dir) {
            warn!(dir = %self.run_dir.display(), error = %e, "failed to remove run directory");
        }
        info!("shutdown complete");
    }
}

/// Run the pool until SIGINT or SIGTERM, then tear it down.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let server = start(config).await?;
    wait_for_shutdown_signal().await;
    // Signal handlers stay installed for the life of the process, so a
    // second signal during teardown is a no-op rather than a hard kill.
    server.shutdown().await;
    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received SIGINT, shutting down");
            }
            _ = sigterm.recv() => {
                info!("received SIGTERM, shutting down");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to listen for Ctrl+C");
        info!("received Ctrl+C, shutting down");
    }
}

/// PID file that holds an exclusive advisory lock for the life of the
/// process and removes itself on drop.
///
/// The file is opened without truncation and only cleared after the lock
/// is won: a second instance that loses the race must not wipe the live
/// instance's pid on its way out.
struct PidFile {
    path: PathBuf,
    _file: std::fs::File,
}

impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        try_lock_exclusive(&file).map_err(|e| {
            if e.kind() == std::io::ErrorKind::WouldBlock {
                anyhow::anyhow!(
                    "another instance is already running (holds the lock on {})",
                    path.display()
                )
            } else {
                e.into()
            }
        })?;
        write_pid(&file, std::process::id())?;
        Ok(Self {
            path: path.to_path_buf(),
            _file: file,
        })
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(unix)]
fn try_lock_exclusive(file: &std::fs::File) -> std::io::Result<()> {
    use std::os::unix::io::AsRawFd;
    match unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) } {
        0 => Ok(()),
        _ => Err(std::io::Error::last_os_error()),
    }
}

#[cfg(not(unix))]
fn try_lock_exclusive(_file: &std::fs::File) -> std::io::Result<()> {
    // No advisory locking off unix; the pid write is best-effort.
    Ok(())
}

/// Replace the file's contents with the pid. Called with the lock held.
fn write_pid(mut file: &std::fs::File, pid: u32) -> std::io::Result<()> {
    use std::io::Write;
    file.set_len(0)?;
    writeln!(file, "{}", pid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pid_file_writes_pid_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("poolgate.pid");

        let pid_file = PidFile::create(&path).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.trim(), std::process::id().to_string());

        drop(pid_file);
        assert!(!path.exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_second_instance_is_rejected_and_pid_survives() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("poolgate.pid");

        let _held = PidFile::create(&path).unwrap();
        // flock is per open file description, so a second open in the same
        // process contends just like a second process would.
        assert!(PidFile::create(&path).is_err());

        // The loser must not have clobbered the winner's pid.
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.trim(), std::process::id().to_string());
    }
}
