use tokio::signal;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::logbuf::LogBufferLayer;

/// Initialize the global tracing subscriber: env-filtered JSON logs to
/// stdout plus a tap feeding the in-memory log ring buffer (spec §7, §9).
pub fn init_tracing(log_level: &str, log_capacity: usize, alert_capacity: usize) {
    crate::logbuf::init(log_capacity, alert_capacity);

    let default_filter = format!("{log_level},hyper=warn,reqwest=warn,tower_http=info");

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .with(LogBufferLayer)
        .init();
}

pub async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! { _ = ctrl_c => {}, _ = terminate => {}, }
    info!("shutdown signal received");
}
