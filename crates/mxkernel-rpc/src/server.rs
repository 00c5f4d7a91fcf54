//! HTTP server implementation using Axum.

use crate::handler::{handle_events, handle_health, handle_rpc};
use axum::{
    routing::{get, post},
    Router,
};
use mxkernel::{BroadcastPublisher, Session};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// Calls allowed to wait on the session at once.
const MAX_PENDING_CALLS: usize = 64;

/// Application state shared across handlers.
pub struct AppState {
    /// The kernel session; dispatches take the lock one at a time
    pub session: Arc<Mutex<Session>>,
    /// Notification channel the session publishes into
    pub publisher: Arc<BroadcastPublisher>,
}

/// Start the JSON-RPC HTTP server.
///
/// Returns the actual address the server is bound to (useful when port=0).
pub async fn start_server(
    session: Session,
    publisher: Arc<BroadcastPublisher>,
    host: &str,
    port: u16,
) -> anyhow::Result<SocketAddr> {
    let state = Arc::new(AppState {
        session: Arc::new(Mutex::new(session)),
        publisher,
    });

    // Configure CORS for development
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Build the router
    let app = Router::new()
        .route("/health", get(handle_health))
        .route(
            "/rpc",
            post(handle_rpc).layer(ConcurrencyLimitLayer::new(MAX_PENDING_CALLS)),
        )
        .route("/events", get(handle_events))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state);

    // Parse the address
    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;

    // Bind to the address
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;

    info!("Server listening on {}", actual_addr);

    // Spawn the server in the background
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("Server error: {}", e);
        }
    });

    Ok(actual_addr)
}
