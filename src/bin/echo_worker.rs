//! A demonstration worker implementing the pool launch contract.
//!
//! Boots from a launch file, registers on the control plane, echoes every
//! proxied connection's bytes back, and exits when the master closes the
//! control connection. The flags let the integration tests inject boot
//! failures and delays:
//!
//! - `--fail-bootstrap-if <path>`: exit nonzero during bootstrap if `<path>`
//!   exists
//! - `--boot-delay-ms <ms>`: sleep before sending `ready`
//! - `--watch <path>`: contribute `<path>` to the watched-file set

use anyhow::{bail, Context};
use poolgate::net::Endpoint;
use poolgate::protocol::ControlMessage;
use poolgate::supervisor::{LaunchSpec, LAUNCH_ENV};
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

struct Options {
    launch_path: PathBuf,
    fail_marker: Option<PathBuf>,
    boot_delay: Option<Duration>,
    watch: Vec<PathBuf>,
}

fn parse_args() -> anyhow::Result<Options> {
    let mut args = std::env::args().skip(1);
    let mut launch_path = None;
    let mut fail_marker = None;
    let mut boot_delay = None;
    let mut watch = Vec::new();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--fail-bootstrap-if" => {
                let path = args.next().context("--fail-bootstrap-if needs a path")?;
                fail_marker = Some(PathBuf::from(path));
            }
            "--boot-delay-ms" => {
                let ms: u64 = args
                    .next()
                    .context("--boot-delay-ms needs a value")?
                    .parse()
                    .context("--boot-delay-ms must be an integer")?;
                boot_delay = Some(Duration::from_millis(ms));
            }
            "--watch" => {
                let path = args.next().context("--watch needs a path")?;
                watch.push(PathBuf::from(path));
            }
            other => launch_path = Some(PathBuf::from(other)),
        }
    }

    let launch_path = launch_path
        .or_else(|| std::env::var(LAUNCH_ENV).ok().map(PathBuf::from))
        .with_context(|| format!("launch file path required (argument or {})", LAUNCH_ENV))?;
    Ok(Options {
        launch_path,
        fail_marker,
        boot_delay,
        watch,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = parse_args()?;
    let spec = LaunchSpec::load(&opts.launch_path)
        .with_context(|| format!("loading launch file {}", opts.launch_path.display()))?;

    let data_addr = Endpoint::parse(&spec.data_addr)?;
    let listener = data_addr
        .bind()
        .await
        .with_context(|| format!("binding data socket {}", spec.data_addr))?;

    let control = Endpoint::parse(&spec.control_addr)?
        .connect()
        .await
        .with_context(|| format!("connecting control plane {}", spec.control_addr))?;
    let (read_half, mut control_tx) = tokio::io::split(control);
    let mut control_rx = BufReader::new(read_half).lines();

    let register = ControlMessage::Register {
        pid: std::process::id(),
        data_addr: spec.data_addr.clone(),
    };
    control_tx.write_all(register.to_line().as_bytes()).await?;

    let line = control_rx
        .next_line()
        .await?
        .context("control connection closed before bootstrap")?;
    match ControlMessage::from_line(&line)? {
        ControlMessage::Bootstrap => {}
        other => bail!("expected bootstrap, got {:?}", other),
    }

    // The test knobs stand in for real application boot work.
    if let Some(marker) = &opts.fail_marker {
        if marker.exists() {
            eprintln!("bootstrap failed: marker {} present", marker.display());
            std::process::exit(1);
        }
    }
    if let Some(delay) = opts.boot_delay {
        tokio::time::sleep(delay).await;
    }
    if !opts.watch.is_empty() {
        let msg = ControlMessage::Files {
            files: opts.watch.clone(),
        };
        control_tx.write_all(msg.to_line().as_bytes()).await?;
    }
    control_tx
        .write_all(ControlMessage::Ready.to_line().as_bytes())
        .await?;

    // Echo proxied connections until the master closes the control channel.
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let stream = accepted.context("accept on data socket")?;
                tokio::spawn(async move {
                    let (mut reader, mut writer) = tokio::io::split(stream);
                    let _ = tokio::io::copy(&mut reader, &mut writer).await;
                    let _ = writer.shutdown().await;
                });
            }
            line = control_rx.next_line() => {
                match line {
                    // Late control chatter (e.g. a status reply) is ignored.
                    Ok(Some(_)) => {}
                    // Master closed the channel: we are done.
                    _ => break,
                }
            }
        }
    }
    Ok(())
}
