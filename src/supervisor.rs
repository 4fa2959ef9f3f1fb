//! Worker process spawning and ownership.
//!
//! The supervisor task consumes spawn orders from the pool and starts one
//! child per order. Each child is owned by a wait task that reports its exit
//! back to the pool (stamped with the spawn generation) and honors the
//! slot's kill handle; stdout and stderr are drained continuously so a noisy
//! worker can never wedge on a full pipe buffer.

use crate::net::Endpoint;
use crate::pool::{Pool, SpawnOrder};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info};

/// Environment variable carrying the launch-file path into the child.
pub const LAUNCH_ENV: &str = "POOLGATE_LAUNCH";

/// Serialized launch configuration handed to every worker process. The
/// worker side of the contract: open the data socket, connect the control
/// plane, send `register`, await `bootstrap`, run the application, send
/// `ready`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchSpec {
    pub slot_id: usize,
    pub data_addr: String,
    pub control_addr: String,
    pub bootstrap: String,
    pub bridge: String,
    pub app_env: String,
    pub debug: bool,
    pub logging: bool,
}

impl LaunchSpec {
    pub fn write(&self, path: &Path) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self).expect("LaunchSpec serialization failed");
        std::fs::write(path, json)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }
}

/// Delay before respawning after `failures` consecutive bootstrap failures.
/// Bounded exponential: 100 ms doubling, capped at 3 s; a plain crash
/// (zero failures) respawns immediately.
pub(crate) fn respawn_delay(failures: u32) -> Duration {
    if failures == 0 {
        return Duration::ZERO;
    }
    let base = Duration::from_millis(100);
    base.saturating_mul(2u32.saturating_pow(failures - 1))
        .min(Duration::from_secs(3))
}

/// Retry delay after a failed spawn attempt, doubling the previous delay.
fn spawn_retry_delay(prev: Duration) -> Duration {
    (prev * 2)
        .max(Duration::from_millis(100))
        .min(Duration::from_secs(3))
}

/// Consumes spawn orders and starts worker processes.
pub struct Supervisor {
    pool: Arc<Pool>,
    orders: mpsc::UnboundedReceiver<SpawnOrder>,
}

impl Supervisor {
    pub fn new(pool: Arc<Pool>, orders: mpsc::UnboundedReceiver<SpawnOrder>) -> Self {
        Self { pool, orders }
    }

    pub async fn run(mut self) {
        while let Some(order) = self.orders.recv().await {
            let pool = Arc::clone(&self.pool);
            tokio::spawn(spawn_worker(pool, order));
        }
    }
}

/// Start one worker process for a slot, honoring the order's delay.
async fn spawn_worker(pool: Arc<Pool>, order: SpawnOrder) {
    if order.delay > Duration::ZERO {
        tokio::time::sleep(order.delay).await;
    }
    let slot_id = order.slot_id;
    let Some((generation, data_addr)) = pool.begin_spawn(slot_id) else {
        return;
    };

    let config = pool.config();
    let spec = LaunchSpec {
        slot_id,
        data_addr: data_addr.to_string(),
        control_addr: pool.control_addr().to_string(),
        bootstrap: config.worker.bootstrap.clone(),
        bridge: config.worker.bridge.clone(),
        app_env: config.worker.app_env.clone(),
        debug: config.debug,
        logging: config.logging,
    };
    let launch_path = pool.run_dir().join(format!("launch-{}.json", slot_id));
    if let Err(e) = spec.write(&launch_path) {
        error!(slot = slot_id, error = %e, "failed to write launch file");
        if pool.note_spawn_failed(slot_id, generation) {
            pool.schedule_respawn(slot_id, spawn_retry_delay(order.delay));
        }
        return;
    }

    // The worker binds the data socket; clear any stale file from a
    // previous child of this slot.
    #[cfg(unix)]
    if let Endpoint::Unix(path) = &data_addr {
        let _ = std::fs::remove_file(path);
    }

    let mut cmd = Command::new(&config.worker.command);
    cmd.args(&config.worker.args)
        .arg(&launch_path)
        .env(LAUNCH_ENV, &launch_path)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            error!(
                slot = slot_id,
                command = %config.worker.command,
                error = %e,
                "failed to spawn worker process"
            );
            if pool.note_spawn_failed(slot_id, generation) {
                pool.schedule_respawn(slot_id, spawn_retry_delay(order.delay));
            }
            return;
        }
    };

    let pid = child.id().unwrap_or(0);
    let forward = config.logging;
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(drain_output(slot_id, stdout, false, forward));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(drain_output(slot_id, stderr, true, forward));
    }

    let (kill_tx, mut kill_rx) = oneshot::channel::<()>();
    if !pool.note_spawned(slot_id, generation, pid, kill_tx) {
        // Shutdown began while we were spawning.
        let _ = child.start_kill();
        let _ = child.wait().await;
        return;
    }
    info!(slot = slot_id, pid, "worker process started");

    let exited = tokio::select! {
        status = child.wait() => Some(status),
        _ = &mut kill_rx => None,
    };
    let code = match exited {
        Some(status) => status.ok().and_then(|s| s.code()),
        None => {
            let _ = child.start_kill();
            child.wait().await.ok().and_then(|s| s.code())
        }
    };
    pool.on_child_exit(slot_id, generation, code);
}

/// Drain a worker output pipe to EOF, re-emitting lines through the
/// operator log when forwarding is enabled. Draining always runs: a stalled
/// pipe would silently wedge the worker.
async fn drain_output(
    slot_id: usize,
    reader: impl AsyncRead + Unpin + Send + 'static,
    is_stderr: bool,
    forward: bool,
) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if !forward || line.trim().is_empty() {
            continue;
        }
        if is_stderr {
            info!(slot = slot_id, "worker stderr: {}", line);
        } else {
            debug!(slot = slot_id, "worker stdout: {}", line);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_respawn_delay_is_bounded_exponential() {
        assert_eq!(respawn_delay(0), Duration::ZERO);
        assert_eq!(respawn_delay(1), Duration::from_millis(100));
        assert_eq!(respawn_delay(2), Duration::from_millis(200));
        assert_eq!(respawn_delay(3), Duration::from_millis(400));
        assert_eq!(respawn_delay(6), Duration::from_secs(3));
        assert_eq!(respawn_delay(30), Duration::from_secs(3));
    }

    #[test]
    fn test_spawn_retry_delay_doubles_and_caps() {
        assert_eq!(spawn_retry_delay(Duration::ZERO), Duration::from_millis(100));
        assert_eq!(
            spawn_retry_delay(Duration::from_millis(100)),
            Duration::from_millis(200)
        );
        assert_eq!(spawn_retry_delay(Duration::from_secs(10)), Duration::from_secs(3));
    }

    #[test]
    fn test_launch_spec_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("launch-0.json");
        let spec = LaunchSpec {
            slot_id: 0,
            data_addr: "tcp:127.0.0.1:5501".to_string(),
            control_addr: "tcp:127.0.0.1:5500".to_string(),
            bootstrap: "app-kernel".to_string(),
            bridge: "http".to_string(),
            app_env: "dev".to_string(),
            debug: true,
            logging: true,
        };
        spec.write(&path).unwrap();

        let loaded = LaunchSpec::load(&path).unwrap();
        assert_eq!(loaded.slot_id, 0);
        assert_eq!(loaded.data_addr, spec.data_addr);
        assert_eq!(loaded.control_addr, spec.control_addr);
        assert_eq!(loaded.bootstrap, "app-kernel");
        assert!(loaded.debug);
    }
}
