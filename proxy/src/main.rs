use std::sync::Arc;
use std::time::{Duration, Instant};

use router_core::{IdleMonitor, ModelManager, RouterConfig, StatePersistence};
use router_proxy::{build_router, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .compact()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config_path = std::env::var("ROUTER_CONFIG").ok().map(std::path::PathBuf::from);
    let config = RouterConfig::load(config_path.as_deref())?;
    tracing::info!(bind = %format!("{}:{}", config.bind_host, config.bind_port), "starting router");

    let started_at_epoch = chrono::Utc::now().timestamp();
    let persistence = Arc::new(StatePersistence::new(config.snapshot_path.clone(), started_at_epoch));
    persistence
        .cleanup_orphans(&config.inference_binary.display().to_string())
        .await;

    let manager = Arc::new(ModelManager::new(config.clone(), persistence.clone()));
    let idle_monitor = Arc::new(IdleMonitor::new(
        manager.clone(),
        Duration::from_secs(config.idle_check_interval_secs),
        Duration::from_secs(config.idle_threshold_secs),
    ));
    idle_monitor.start().await;

    let state = AppState {
        manager: manager.clone(),
        idle_monitor: idle_monitor.clone(),
        config: config.clone(),
        http: reqwest::Client::new(),
        started_at: Instant::now(),
    };

    let router = build_router(state);
    let addr = format!("{}:{}", config.bind_host, config.bind_port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "listening");

    let (shutdown_tx, mut shutdown_rx) = tokio::sync::watch::channel(false);
    let serve_handle = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.changed().await;
            })
            .await
    });

    shutdown_signal().await;
    tracing::info!("shutdown signal received, draining connections and stopping backends");
    let _ = shutdown_tx.send(true);

    let stop_backends = async {
        idle_monitor.stop().await;
        if let Err(e) = manager.stop_all().await {
            tracing::warn!(?e, "error while stopping backends during shutdown");
        }
    };
    let drain = async {
        match serve_handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!(?e, "server error during shutdown"),
            Err(e) => tracing::error!(?e, "server task panicked during shutdown"),
        }
    };

    // Every backend is stopped concurrently with the connection drain, not
    // after it, and the drain itself is capped so one open streaming
    // request can't hold shutdown open indefinitely.
    let (_, drain_result) = tokio::join!(stop_backends, tokio::time::timeout(Duration::from_secs(10), drain));
    if drain_result.is_err() {
        tracing::warn!("graceful shutdown exceeded 10s bound, abandoning outstanding connections");
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install ctrl-c handler");
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
}
