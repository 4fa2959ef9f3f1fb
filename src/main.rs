use poolgate::config::Config;
use poolgate::{PKG_NAME, VERSION};
use std::path::PathBuf;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("poolgate=info".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "failed to load configuration");
        e
    })?;
    info!(path = %config_path.display(), "configuration loaded");

    print_startup_banner(&config);

    poolgate::lifecycle::run(config).await
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "starting pool master");
    info!(
        host = %config.server.host,
        port = config.server.port,
        "public listener configuration"
    );
    info!(
        workers = config.pool.workers,
        max_requests = config.pool.max_requests,
        concurrent_requests = config.pool.concurrent_requests,
        shutdown_grace_secs = config.pool.shutdown_grace_secs,
        "pool settings"
    );
    info!(
        command = %config.worker.command,
        bootstrap = %config.worker.bootstrap,
        bridge = %config.worker.bridge,
        app_env = %config.worker.app_env,
        "worker launch settings"
    );
    info!(
        debug = config.debug,
        logging = config.logging,
        watch_files = config.watch.files.len(),
        "operating modes"
    );
}
