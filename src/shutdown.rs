//! Serving with a bounded drain once shutdown is requested.

use axum::Router;
use std::future::{Future, IntoFuture};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Notify;

/// Serves `app` until `signal` resolves, then gives in-flight requests at
/// most `drain` to finish.
///
/// Returns `true` when every connection closed within the drain period and
/// `false` when the remaining ones were dropped.
pub async fn serve_with_drain<S>(
    listener: TcpListener,
    app: Router,
    signal: S,
    drain: Duration,
) -> std::io::Result<bool>
where
    S: Future<Output = ()> + Send + 'static,
{
    let draining = Arc::new(Notify::new());
    let notifier = Arc::clone(&draining);

    let server = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            signal.await;
            notifier.notify_one();
        })
        .into_future();

    let deadline = async {
        draining.notified().await;
        tokio::time::sleep(drain).await;
    };

    tokio::select! {
        result = server => {
            result?;
            Ok(true)
        }
        _ = deadline => {
            tracing::warn!(
                drain_ms = drain.as_millis() as u64,
                "Drain period elapsed, dropping open connections"
            );
            Ok(false)
        }
    }
}
