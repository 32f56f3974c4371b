//! Socialite presence server: HTTP and WebSocket front of the presence engine.

pub mod config;
pub mod http_server;

use std::future::Future;

use tokio::net::TcpListener;
use tracing::info;

pub use http_server::{build_router, AppState};

/// Serves the router on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, service = %state.service_name, "socialite listening");
    }
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown)
        .await
}
