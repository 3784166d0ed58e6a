use crate::{config, server};
use anyhow::Result;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// CLI arguments forwarded from `main()`.
pub struct BootstrapArgs {
    pub config_path: std::path::PathBuf,
    pub listen: Option<String>,
    pub admin_listen: String,
}

/// Gateway lifecycle: init → build state → start workers → serve → drain.
pub async fn run(args: BootstrapArgs) -> Result<()> {
    init_tracing();

    // Phase 1: configuration (file + env overrides) and shared state.
    let gateway = config::GatewayConfig::load(&args.config_path)?;
    let listen = args
        .listen
        .unwrap_or_else(|| format!("0.0.0.0:{}", gateway.server.port));
    let state = server::GatewayState::new(gateway).await?;

    // Phase 2: maintenance loops — recurring cleanup and the health probe.
    let shutdown = Arc::new(Notify::new());
    state.worker.start(&shutdown);

    // Phase 3: admin listener.
    start_admin_server(&state, &args.admin_listen);

    tracing::info!(
        "server: starting gateway, listen={}, rules={}",
        listen,
        state.rules.rules().len()
    );

    // Phase 4: request listener.
    let gateway_handle = tokio::spawn({
        let state = state.clone();
        let shutdown = shutdown.clone();
        async move { server::run_gateway_server(&listen, state, shutdown).await }
    });

    // Phase 5: block until signal, then clean up.
    wait_for_shutdown(&shutdown).await;

    // Graceful shutdown: stop queue intake, drain active jobs, then wait
    // for the request listener to finish draining connections.
    state.worker.shutdown().await;

    if let Err(e) = gateway_handle.await {
        tracing::error!("server: gateway task error: {}", e);
    }

    tracing::info!("server: shutdown complete");
    Ok(())
}

fn init_tracing() {
    let (non_blocking, _guard) = tracing_appender::non_blocking::NonBlockingBuilder::default()
        .buffered_lines_limit(128_000)
        .lossy(true)
        .finish(std::io::stdout());

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(false)
                .json(),
        )
        .init();

    std::mem::forget(_guard);
}

fn start_admin_server(state: &server::GatewayState, admin_listen: &str) {
    let s = state.clone();
    let admin_addr = admin_listen.to_string();
    tokio::spawn(async move {
        if let Err(e) = server::run_admin_server(&admin_addr, s).await {
            tracing::error!("server: admin failed, error={}", e);
        }
    });
}

async fn wait_for_shutdown(shutdown: &Arc<Notify>) {
    let ctrl_c = tokio::signal::ctrl_c();

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
        _ = ctrl_c => tracing::info!("server: received SIGINT, shutting down"),
        _ = terminate => tracing::info!("server: received SIGTERM, shutting down"),
    }

    // Signal all background loops to stop.
    shutdown.notify_waiters();
}
