use simrank::shutdown::serve_with_drain;
use simrank::{config_handler, health_handler, rank_handler, ready_handler, AppState, Config};

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Rank bodies carry whole candidate lists.
const RANK_BODY_LIMIT: usize = 50 * 1024 * 1024;

/// `LOG_FORMAT=json` switches to structured output for log shippers.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "simrank=info,tower_http=debug".into());
    let registry = tracing_subscriber::registry().with(filter);

    match std::env::var("LOG_FORMAT").as_deref() {
        Ok("json") => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        _ => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

fn router(state: Arc<AppState>, metrics: PrometheusHandle) -> Router {
    Router::new()
        .route(
            "/rank",
            post(rank_handler).layer(DefaultBodyLimit::max(RANK_BODY_LIMIT)),
        )
        .route("/config", get(config_handler))
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route(
            "/metrics",
            get(move || std::future::ready(metrics.render())),
        )
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = Config::from_env()?;
    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    let drain = Duration::from_secs(config.shutdown_timeout_secs);
    tracing::info!(model = %config.model, %addr, "Starting simrank");

    let metrics = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus recorder: {}", e))?;

    // Session creation and the priming inference block
    let started = Instant::now();
    let state = Arc::new(tokio::task::spawn_blocking(move || AppState::new(config)).await??);
    tracing::info!(
        elapsed_ms = started.elapsed().as_millis() as u64,
        model = %state.ranker.config().model,
        "Ranker warmed up"
    );

    let listener = TcpListener::bind(addr).await?;
    tracing::info!(address = %addr, "Server listening");

    let drained = serve_with_drain(listener, router(state, metrics), shutdown_signal(), drain).await?;

    tracing::info!(drained, "Server shutdown complete");
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Ctrl+C handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let source = tokio::select! {
        _ = ctrl_c => "ctrl_c",
        _ = terminate => "sigterm",
    };

    tracing::info!(signal = source, "Shutting down, draining connections");
}
