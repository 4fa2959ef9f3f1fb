//! Control-plane server.
//!
//! Accepts connections from freshly spawned workers on the private
//! endpoint. A connection is unauthorized until its first message, which
//! must be `register`; after that the connection is bound to exactly one
//! slot and carries the worker's lifecycle verbs. The address is trusted
//! (a 0700 run directory, or loopback) so no authentication is performed.

use crate::error::{PoolError, Result};
use crate::net::{Endpoint, Listener, Stream};
use crate::pool::Pool;
use crate::protocol::ControlMessage;
use crate::slot::ControlLink;
use crate::watcher::TrackedFiles;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

pub struct ControlServer {
    listener: Listener,
    pool: Arc<Pool>,
    files: Arc<TrackedFiles>,
}

impl ControlServer {
    /// Bind the control-plane listener. Fails fast: a bind error aborts
    /// startup.
    pub async fn bind(addr: &Endpoint, pool: Arc<Pool>, files: Arc<TrackedFiles>) -> Result<Self> {
        let listener = addr.bind().await.map_err(|e| PoolError::Bind {
            addr: addr.to_string(),
            source: e,
        })?;
        info!(addr = %addr, "control plane listening");
        Ok(Self {
            listener,
            pool,
            files,
        })
    }

    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok(stream) => {
                            let pool = Arc::clone(&self.pool);
                            let files = Arc::clone(&self.files);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, pool, files).await {
                                    warn!(error = %e, "control connection closed with error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "failed to accept control connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("control plane shutting down");
                        break;
                    }
                }
            }
        }
    }
}

async fn handle_connection(
    stream: Stream,
    pool: Arc<Pool>,
    files: Arc<TrackedFiles>,
) -> Result<()> {
    let (read_half, mut write_half) = tokio::io::split(stream);
    let mut lines = BufReader::new(read_half).lines();

    // Until `register` arrives the connection belongs to no slot; any other
    // verb is a protocol violation and the connection is simply dropped.
    let first = match lines.next_line().await? {
        Some(line) => line,
        None => return Ok(()),
    };
    let (tx, mut outbound) = mpsc::unbounded_channel();
    let (slot_id, generation) = match ControlMessage::from_line(&first) {
        Ok(ControlMessage::Register { pid, data_addr }) => {
            pool.on_register(&data_addr, pid, ControlLink::new(tx))?
        }
        Ok(other) => {
            return Err(PoolError::Protocol(format!(
                "first message must be register, got {:?}",
                other
            )));
        }
        Err(e) => {
            return Err(PoolError::Protocol(format!(
                "undecodable register message: {}",
                e
            )));
        }
    };

    let result = async {
        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let Some(line) = line? else {
                        // Worker closed its end: it is gone.
                        return Ok(());
                    };
                    if line.trim().is_empty() {
                        continue;
                    }
                    let msg = ControlMessage::from_line(&line).map_err(|e| {
                        PoolError::Protocol(format!("undecodable control message: {}", e))
                    })?;
                    match msg {
                        ControlMessage::Ready => pool.on_ready(slot_id, generation),
                        ControlMessage::Files { files: paths } => {
                            debug!(slot = slot_id, count = paths.len(), "worker contributed watch paths");
                            files.track(paths);
                        }
                        ControlMessage::Log { message } => {
                            if pool.config().logging {
                                info!(slot = slot_id, "worker: {}", message);
                            }
                        }
                        ControlMessage::Status { workers: None } => {
                            let reply = pool.status_reply();
                            write_half.write_all(reply.to_line().as_bytes()).await?;
                        }
                        ControlMessage::Register { .. } => {
                            return Err(PoolError::Protocol("duplicate register".to_string()));
                        }
                        ControlMessage::Bootstrap | ControlMessage::Status { workers: Some(_) } => {
                            return Err(PoolError::Protocol(
                                "master-bound verb received from worker".to_string(),
                            ));
                        }
                    }
                }
                out = outbound.recv() => {
                    match out {
                        Some(msg) => write_half.write_all(msg.to_line().as_bytes()).await?,
                        // Master dropped the link: close the connection.
                        None => return Ok(()),
                    }
                }
            }
        }
    }
    .await;

    // Closing this connection, for any reason, is the authoritative
    // "worker is gone" signal; the pool recycles the slot.
    pool.on_control_closed(slot_id, generation);
    result
}
