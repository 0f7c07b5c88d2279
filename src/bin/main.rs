//! Process entrypoint: parses arguments, loads configuration, wires up the
//! tracker/registry/lifecycle/lock singletons, and serves the HTTP API.

use std::error::Error;
use std::sync::Arc;

use bollard::Docker;
use clap::Parser;
use gpu_arbiter::api::{self, ApiState};
use gpu_arbiter::cli::Cli;
use gpu_arbiter::config::load_config;
use gpu_arbiter::lifecycle::LifecycleManager;
use gpu_arbiter::lock::RedisLock;
use gpu_arbiter::orchestrator::Orchestrator;
use gpu_arbiter::tracker::NvmlTracker;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cli.log_level.to_string())),
        )
        .init();

    let config = load_config(&cli.config)?;
    tracing::info!(services = config.registry.all().len(), "configuration loaded");

    let registry = Arc::new(config.registry);
    let tracker = Arc::new(NvmlTracker::new());
    let lock = Arc::new(RedisLock::connect(&config.redis_url).await?);
    let docker = connect_docker(config.docker_socket.as_deref())?;
    let lifecycle = Arc::new(LifecycleManager::new(Arc::clone(&registry), docker));

    let orchestrator = Arc::new(Orchestrator::new(
        registry,
        tracker,
        lifecycle,
        lock,
        config.vram_reserve_mb,
        config.default_lock_ttl_s,
    ));

    let app = api::router(ApiState { orchestrator })
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(std::time::Duration::from_secs(30)));

    let listener = tokio::net::TcpListener::bind(&cli.bind).await?;
    tracing::info!(addr = %cli.bind, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

fn connect_docker(socket: Option<&str>) -> Result<Docker, Box<dyn Error>> {
    let docker = match socket {
        Some(path) => Docker::connect_with_unix(path, 120, bollard::API_DEFAULT_VERSION)?,
        None => Docker::connect_with_unix_defaults()?,
    };
    Ok(docker)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("shutdown signal received");
}
