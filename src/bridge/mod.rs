//! Ask/Answer HTTP bridge.
//!
//! A dedicated listener (default port 3415) serving ask creation, answer
//! long-polling, external answer posting, ask history, and the SSE event
//! stream. On shutdown, pending long-polls receive 503, SSE streams close,
//! and the listener stops accepting connections.

pub mod longpoll;
pub mod routes;
pub mod sse;

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

use crate::config::BridgeConfig;
use crate::manager::JobManager;

pub use routes::bridge_routes;

/// Shared state for bridge handlers.
#[derive(Clone)]
pub struct BridgeState {
    pub manager: Arc<JobManager>,
    pub config: BridgeConfig,
    pub shutdown: watch::Receiver<bool>,
}

/// Serve the bridge until the shutdown signal flips.
pub async fn serve(
    state: BridgeState,
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let addr = listener.local_addr()?;
    info!(%addr, "HTTP bridge listening");

    let app = bridge_routes(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
            info!("HTTP bridge shutting down");
        })
        .await
}
