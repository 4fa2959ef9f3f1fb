//! Front-end dispatcher.
//!
//! Accepts client connections on the public listener and splices each one to
//! a worker's data socket. The dispatcher is byte-transparent: it never
//! parses the stream, opens exactly one back-end connection per client, and
//! does not retry. Bytes a client sends before a worker is assigned are
//! buffered and flushed into the back-end ahead of the splice.

use crate::error::{PoolError, Result};
use crate::pool::Pool;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Stages slower than this emit a diagnostic warning.
const SLOW_STAGE: Duration = Duration::from_secs(1);

pub struct Dispatcher {
    listener: TcpListener,
    pool: Arc<Pool>,
}

impl Dispatcher {
    /// Bind the public listener. Fails fast: a bind error aborts startup.
    pub async fn bind(pool: Arc<Pool>) -> Result<Self> {
        let config = pool.config();
        let addr = format!("{}:{}", config.server.host, config.server.port);
        let listener = TcpListener::bind(&addr).await.map_err(|e| PoolError::Bind {
            addr: addr.clone(),
            source: e,
        })?;
        info!(addr = %addr, "public listener ready");
        Ok(Self { listener, pool })
    }

    /// The bound public address (resolves port 0 to the actual port).
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let pool = Arc::clone(&self.pool);
                            tokio::spawn(handle_client(stream, addr, pool));
                        }
                        Err(e) => {
                            error!(error = %e, "failed to accept client connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("public listener shutting down");
                        break;
                    }
                }
            }
        }
    }
}

async fn handle_client(mut client: TcpStream, addr: SocketAddr, pool: Arc<Pool>) {
    // Buffer whatever the client sends while we wait for a worker; the
    // scheduler wait must never block the read.
    let mut buffered: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 8192];
    let wait_start = Instant::now();
    let mut assignment = pool.next_worker();

    let lease = loop {
        tokio::select! {
            granted = &mut assignment => {
                match granted {
                    Some(lease) => break lease,
                    // Pool is shutting down.
                    None => return,
                }
            }
            read = client.read(&mut chunk) => {
                match read {
                    Ok(0) => {
                        // Client left before we saw an assignment. Dropping
                        // the pending assignment cancels it; if a lease was
                        // granted concurrently, the drop drains and
                        // releases it, so no slot state is left behind.
                        debug!(client = %addr, "client closed while waiting for a worker");
                        return;
                    }
                    Ok(n) => buffered.extend_from_slice(&chunk[..n]),
                    Err(e) => {
                        debug!(client = %addr, error = %e, "client read failed while waiting");
                        return;
                    }
                }
            }
        }
    };
    let waited = wait_start.elapsed();
    if waited > SLOW_STAGE {
        warn!(
            client = %addr,
            slot = lease.slot_id,
            waited_ms = waited.as_millis() as u64,
            "slow worker assignment"
        );
    }

    let data_addr = pool.data_addr(lease.slot_id);
    let dial_start = Instant::now();
    let mut backend = match data_addr.connect().await {
        Ok(stream) => stream,
        Err(e) => {
            // No retry: release the slot and let the client reconnect.
            let err = PoolError::BackendDial {
                addr: data_addr.to_string(),
                source: e,
            };
            warn!(slot = lease.slot_id, error = %err, "back-end dial failed");
            pool.release(lease, false);
            return;
        }
    };
    let dialed = dial_start.elapsed();
    if dialed > SLOW_STAGE {
        warn!(
            slot = lease.slot_id,
            dial_ms = dialed.as_millis() as u64,
            "slow back-end dial"
        );
    }

    let splice_start = Instant::now();
    let result = async {
        if !buffered.is_empty() {
            backend.write_all(&buffered).await?;
        }
        tokio::io::copy_bidirectional(&mut client, &mut backend).await
    }
    .await;
    match result {
        Ok((from_client, to_client)) => {
            debug!(
                client = %addr,
                slot = lease.slot_id,
                bytes_in = buffered.len() as u64 + from_client,
                bytes_out = to_client,
                "connection finished"
            );
        }
        Err(e) => {
            // A peer dropping mid-splice is the normal end of a proxied
            // connection, not an error of ours.
            debug!(client = %addr, slot = lease.slot_id, error = %e, "proxy splice ended");
        }
    }
    let spliced = splice_start.elapsed();
    if spliced > SLOW_STAGE {
        warn!(
            slot = lease.slot_id,
            splice_ms = spliced.as_millis() as u64,
            "long-running proxied connection finished"
        );
    }
    pool.release(lease, true);
}
