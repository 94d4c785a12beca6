use anyhow::Context;
use balancer_studio::api::ApiServer;
use balancer_studio::apply::{ApplyCoordinator, ApplyIntent};
use balancer_studio::config::Config;
use balancer_studio::db::Database;
use balancer_studio::queue::ChangeQueue;
use balancer_studio::store::EntityStore;
use balancer_studio::sweep::CertificateSweeper;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

const PKG_NAME: &str = env!("CARGO_PKG_NAME");
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("balancer_studio=info".parse()?),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");
    print_startup_banner(&config);

    let bind: IpAddr = config
        .server
        .bind
        .parse()
        .with_context(|| format!("Invalid bind address: {}", config.server.bind))?;
    let api_addr = SocketAddr::new(bind, config.server.port);

    let db = Arc::new(
        Database::open(&config.server.database_path)
            .with_context(|| format!("Failed to open store at {}", config.server.database_path))?,
    );
    let store: Arc<dyn EntityStore> = db;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let coordinator = ApplyCoordinator::from_config(Arc::clone(&store), &config)?;
    let queue = ChangeQueue::new(Arc::clone(&coordinator), config.apply.debounce());

    let queue_handle = tokio::spawn(Arc::clone(&queue).run(shutdown_rx.clone()));

    let sweeper = CertificateSweeper::new(
        Arc::clone(&store),
        Arc::clone(&queue),
        config.certificates.sweep_interval(),
    );
    let sweep_handle = tokio::spawn(sweeper.run(shutdown_rx.clone()));

    let api = ApiServer::new(
        Arc::clone(&store),
        Arc::clone(&coordinator),
        Arc::clone(&queue),
        shutdown_rx.clone(),
    );
    let api_handle = tokio::spawn(async move {
        if let Err(e) = api.run(api_addr).await {
            error!(error = %e, "API server error");
        }
    });

    if config.apply.apply_on_startup {
        let revision = store.revision()?;
        queue.enqueue(ApplyIntent::new(revision, "startup"));
    }

    // Wait for shutdown signal (Ctrl+C or SIGTERM); SIGHUP forces a re-apply
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sighup = signal(SignalKind::hangup())?;

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received SIGINT (Ctrl+C), shutting down...");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down...");
                    break;
                }
                _ = sighup.recv() => {
                    match store.revision() {
                        Ok(revision) => {
                            info!(revision, "Received SIGHUP, re-applying configuration");
                            queue.enqueue(ApplyIntent::new(revision, "SIGHUP").forced());
                        }
                        Err(e) => error!(error = %e, "Failed to read store revision"),
                    }
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    // An apply in flight sees the cancellation; a reload it already issued is
    // rolled back or completed before the queue exits
    let drain = config.nginx.shutdown_drain();
    info!(drain_secs = drain.as_secs(), "Waiting for in-flight work");
    let drained = tokio::time::timeout(drain, async {
        let _ = queue_handle.await;
        let _ = sweep_handle.await;
        let _ = api_handle.await;
    })
    .await;

    if drained.is_err() {
        warn!("Shutdown drain timed out");
    }

    info!(state = coordinator.state().name(), "Shutdown complete");
    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting configuration manager");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        database = %config.server.database_path,
        "API settings"
    );
    info!(
        config_path = %config.nginx.config_path,
        staging_dir = %config.nginx.staging_dir().display(),
        test_command = %config.nginx.test_command,
        reload_command = %config.nginx.reload_command,
        "nginx settings"
    );
    info!(
        pid_file = ?config.nginx.pid_file,
        status_url = ?config.nginx.status_url,
        validate_timeout_secs = config.nginx.validate_timeout_secs,
        reload_timeout_secs = config.nginx.reload_timeout_secs,
        "nginx supervision"
    );
    info!(
        debounce_ms = config.apply.debounce_ms,
        apply_on_startup = config.apply.apply_on_startup,
        sweep_interval_secs = config.certificates.sweep_interval_secs,
        "Apply settings"
    );
}
