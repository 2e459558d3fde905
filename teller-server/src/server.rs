//! Axum server setup and router configuration.

use crate::api;
use crate::state::AppState;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use std::future::Future;
use std::net::SocketAddr;
use tokio::net::TcpListener;

/// Build the application router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        // Health check endpoint
        .route("/health", get(health_check))
        // Ready check (includes store connectivity)
        .route("/ready", get(ready_check))
        // Dummy-mode admin mux
        .route("/api/dummy/scanner/deposit", post(api::dummy_inject_deposit))
        .route("/api/dummy/sender/confirm", post(api::dummy_confirm_tx))
        .with_state(state)
}

/// Health check response.
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

/// Simple health check - returns OK if the server is running.
async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Ready check response.
#[derive(Serialize)]
struct ReadyResponse {
    status: &'static str,
    database: &'static str,
}

/// Ready check - verifies the store answers a read transaction.
async fn ready_check(State(state): State<AppState>) -> impl IntoResponse {
    let database = if state.teller.database_ready() {
        "connected"
    } else {
        "disconnected"
    };

    let (status, status_code) = if database == "connected" {
        ("ready", StatusCode::OK)
    } else {
        ("not_ready", StatusCode::SERVICE_UNAVAILABLE)
    };

    (status_code, Json(ReadyResponse { status, database }))
}

/// Run the server until the shutdown future completes.
pub async fn run_server<F>(
    router: Router,
    addr: SocketAddr,
    shutdown: F,
) -> Result<(), std::io::Error>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("HTTP server listening on {}", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
}
