//! Integration tests driving the full stack: supervisor, control plane,
//! dispatcher, scheduler, and (where marked) the file watcher, against real
//! echo-worker child processes.

use poolgate::config::Config;
use poolgate::lifecycle::{self, Server};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

fn echo_worker_bin() -> String {
    env!("CARGO_BIN_EXE_echo-worker").to_string()
}

fn test_config(workers: usize) -> Config {
    let mut config = Config::for_worker_command(echo_worker_bin());
    config.server.port = 0; // ephemeral, so tests can run in parallel
    config.pool.workers = workers;
    config.pool.shutdown_grace_secs = 2;
    config
}

async fn start_server(config: Config) -> Server {
    lifecycle::start(config).await.expect("server starts")
}

async fn wait_until<F>(mut condition: F, timeout: Duration, what: &str)
where
    F: FnMut() -> bool,
{
    let start = Instant::now();
    while !condition() {
        if start.elapsed() > timeout {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

async fn wait_all_ready(server: &Server) {
    let pool = server.pool().clone();
    wait_until(
        move || pool.snapshot().iter().all(|s| s.state == "ready"),
        Duration::from_secs(10),
        "all workers ready",
    )
    .await;
}

async fn wait_idle(server: &Server) {
    let pool = server.pool().clone();
    wait_until(
        move || pool.snapshot().iter().all(|s| s.in_flight == 0),
        Duration::from_secs(5),
        "pool idle",
    )
    .await;
}

/// Connect, send a payload, read back exactly as many bytes.
async fn roundtrip(addr: SocketAddr, payload: &[u8]) -> Vec<u8> {
    let mut stream = TcpStream::connect(addr)
        .await
        .expect("connect to public listener");
    stream.write_all(payload).await.expect("send payload");
    let mut response = vec![0u8; payload.len()];
    stream
        .read_exact(&mut response)
        .await
        .expect("read echoed payload");
    response
}

#[tokio::test]
async fn test_cold_start_and_recycling_after_max_requests() {
    let mut config = test_config(2);
    config.pool.max_requests = 3;
    let server = start_server(config).await;
    wait_all_ready(&server).await;
    let addr = server.public_addr();
    let first_pid = server.pool().worker_pid(0).expect("slot 0 has a pid");

    // Sequential requests all land on slot 0 (lowest id among idle slots).
    for i in 0..3u32 {
        let payload = format!("request-{}", i).into_bytes();
        assert_eq!(roundtrip(addr, &payload).await, payload);
        wait_idle(&server).await;
    }

    // Slot 0 hit its request budget: recycled, fresh child, counters reset.
    let pool = server.pool().clone();
    wait_until(
        move || {
            let snapshot = pool.snapshot();
            snapshot[0].state == "ready" && snapshot[0].served == 0
        },
        Duration::from_secs(10),
        "slot 0 recycled",
    )
    .await;
    assert_ne!(server.pool().worker_pid(0), Some(first_pid));
    assert_eq!(server.pool().snapshot()[1].served, 0);

    // The replacement serves again from zero.
    assert_eq!(roundtrip(addr, b"after-recycle").await, b"after-recycle");
    wait_idle(&server).await;
    let snapshot = server.pool().snapshot();
    assert_eq!(snapshot[0].served, 1);
    assert_eq!(snapshot[1].served, 0);

    server.shutdown().await;
}

#[tokio::test]
async fn test_dispatcher_is_byte_transparent() {
    let server = start_server(test_config(1)).await;
    wait_all_ready(&server).await;

    // 16 KiB including NULs, 0xff, and no valid UTF-8 framing to lean on.
    let payload: Vec<u8> = (0..4096u32)
        .flat_map(|i| [(i % 256) as u8, 0u8, 0xff, (i / 256) as u8])
        .collect();
    assert_eq!(roundtrip(server.public_addr(), &payload).await, payload);

    server.shutdown().await;
}

#[tokio::test]
async fn test_exclusive_mode_queues_second_connection() {
    let server = start_server(test_config(1)).await;
    wait_all_ready(&server).await;
    let addr = server.public_addr();

    // First connection takes the only worker and holds it open.
    let mut c1 = TcpStream::connect(addr).await.unwrap();
    c1.write_all(b"held").await.unwrap();
    let mut echo = [0u8; 4];
    c1.read_exact(&mut echo).await.unwrap();
    assert_eq!(&echo, b"held");

    // Second connection is buffered in the scheduler, not handed to the
    // busy worker.
    let mut c2 = TcpStream::connect(addr).await.unwrap();
    c2.write_all(b"queued").await.unwrap();
    let mut probe = [0u8; 1];
    let premature = tokio::time::timeout(Duration::from_millis(300), c2.read(&mut probe)).await;
    assert!(
        premature.is_err(),
        "second connection must see no bytes while the worker is held"
    );

    // Releasing the worker serves the queued connection.
    drop(c1);
    let mut response = [0u8; 6];
    tokio::time::timeout(Duration::from_secs(5), c2.read_exact(&mut response))
        .await
        .expect("second connection served after the first closes")
        .unwrap();
    assert_eq!(&response, b"queued");

    server.shutdown().await;
}

#[tokio::test]
async fn test_client_disconnect_while_waiting_touches_no_state() {
    let server = start_server(test_config(1)).await;
    wait_all_ready(&server).await;
    let addr = server.public_addr();

    let mut c1 = TcpStream::connect(addr).await.unwrap();
    c1.write_all(b"hold").await.unwrap();
    let mut echo = [0u8; 4];
    c1.read_exact(&mut echo).await.unwrap();

    // A second client queues up, then gives up before a worker frees.
    {
        let mut c2 = TcpStream::connect(addr).await.unwrap();
        c2.write_all(b"abandoned").await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(200)).await;

    drop(c1);
    wait_idle(&server).await;
    assert_eq!(server.pool().snapshot()[0].served, 1);

    // The abandoned request consumed nothing; the pool serves on.
    assert_eq!(roundtrip(addr, b"next").await, b"next");
    wait_idle(&server).await;
    assert_eq!(server.pool().snapshot()[0].served, 2);

    server.shutdown().await;
}

#[cfg(unix)]
#[tokio::test]
async fn test_worker_crash_respawns_with_fresh_counters() {
    let server = start_server(test_config(1)).await;
    wait_all_ready(&server).await;
    let addr = server.public_addr();

    assert_eq!(roundtrip(addr, b"before").await, b"before");
    wait_idle(&server).await;
    assert_eq!(server.pool().snapshot()[0].served, 1);
    let old_pid = server.pool().worker_pid(0).expect("slot 0 has a pid");

    unsafe {
        libc::kill(old_pid as i32, libc::SIGKILL);
    }

    let pool = server.pool().clone();
    wait_until(
        move || {
            let snapshot = pool.snapshot();
            snapshot[0].state == "ready" && snapshot[0].served == 0
        },
        Duration::from_secs(10),
        "slot respawned after SIGKILL",
    )
    .await;
    assert_ne!(server.pool().worker_pid(0), Some(old_pid));

    assert_eq!(roundtrip(addr, b"after").await, b"after");

    server.shutdown().await;
}

#[cfg(unix)]
#[tokio::test]
async fn test_graceful_shutdown_terminates_children() {
    let server = start_server(test_config(2)).await;
    wait_all_ready(&server).await;
    let addr = server.public_addr();
    let pids: Vec<u32> = (0..2)
        .map(|i| server.pool().worker_pid(i).expect("worker pid"))
        .collect();

    server.shutdown().await;

    for pid in pids {
        let alive = unsafe { libc::kill(pid as i32, 0) } == 0;
        assert!(!alive, "worker {} must be terminated", pid);
    }

    // The public listener closes with the dispatcher task.
    let start = Instant::now();
    loop {
        if TcpStream::connect(addr).await.is_err() {
            break;
        }
        if start.elapsed() > Duration::from_secs(2) {
            panic!("public listener still accepting after shutdown");
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[cfg(unix)]
#[tokio::test]
async fn test_bootstrap_failure_in_debug_enters_and_recovers_emergency() {
    let scratch = tempfile::tempdir().unwrap();
    let marker = scratch.path().join("break-bootstrap");
    let watched = scratch.path().join("kernel.src");
    std::fs::write(&watched, "v1").unwrap();

    let mut config = test_config(2);
    config.debug = true;
    config.worker.args = vec![
        "--fail-bootstrap-if".to_string(),
        marker.to_string_lossy().into_owned(),
    ];
    config.watch.files = vec![watched.clone()];
    let server = start_server(config).await;
    wait_all_ready(&server).await;
    let addr = server.public_addr();

    // Break the bootstrap, then trigger a rolling restart via the watcher.
    std::fs::write(&marker, "").unwrap();
    std::fs::write(&watched, "v2 - broken").unwrap();
    let pool = server.pool().clone();
    wait_until(
        move || pool.is_emergency(),
        Duration::from_secs(10),
        "emergency mode after failed bootstrap",
    )
    .await;

    // The pool holds zero workers: a request starves.
    let mut probe = TcpStream::connect(addr).await.unwrap();
    probe.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 1];
    let starved = tokio::time::timeout(Duration::from_millis(500), probe.read(&mut buf)).await;
    assert!(starved.is_err(), "no worker must answer in emergency mode");
    drop(probe);

    // Fix the source and touch a watched file: the pool recovers.
    std::fs::remove_file(&marker).unwrap();
    std::fs::write(&watched, "v3 - fixed").unwrap();
    let pool = server.pool().clone();
    wait_until(
        move || !pool.is_emergency() && pool.snapshot().iter().all(|s| s.state == "ready"),
        Duration::from_secs(10),
        "recovery from emergency mode",
    )
    .await;

    assert_eq!(roundtrip(addr, b"recovered").await, b"recovered");

    server.shutdown().await;
}

#[cfg(unix)]
#[tokio::test]
async fn test_workers_contribute_watch_paths() {
    let scratch = tempfile::tempdir().unwrap();
    let contributed = scratch.path().join("routes.src");
    std::fs::write(&contributed, "v1").unwrap();

    let mut config = test_config(1);
    config.debug = true;
    config.worker.args = vec![
        "--watch".to_string(),
        contributed.to_string_lossy().into_owned(),
    ];
    let server = start_server(config).await;
    wait_all_ready(&server).await;
    assert_eq!(server.files().len(), 1);
    let first_pid = server.pool().worker_pid(0).expect("worker pid");

    // Changing the contributed file rolls the pool.
    std::fs::write(&contributed, "v2 - edited").unwrap();
    let pool = server.pool().clone();
    wait_until(
        move || {
            pool.worker_pid(0).is_some_and(|pid| pid != first_pid)
                && pool.snapshot()[0].state == "ready"
        },
        Duration::from_secs(10),
        "pool rolled after contributed file changed",
    )
    .await;

    server.shutdown().await;
}
