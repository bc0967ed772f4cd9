use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::cache::Snapshot;

/// What `/readyz` reports on.
#[derive(Clone, Debug)]
pub struct Health {
    cache: watch::Receiver<Snapshot>,
    leading: Arc<AtomicBool>,
}

impl Health {
    pub fn new(cache: watch::Receiver<Snapshot>, leading: Arc<AtomicBool>) -> Self {
        Self { cache, leading }
    }

    fn report(&self) -> Readiness {
        let snapshot = self.cache.borrow();
        Readiness {
            synced: snapshot.is_synced(),
            leading: self.leading.load(Ordering::Relaxed),
            machinesets: snapshot.machinesets.len(),
            machines: snapshot.machines.len(),
        }
    }
}

#[derive(Debug, serde::Serialize)]
struct Readiness {
    synced: bool,
    leading: bool,
    machinesets: usize,
    machines: usize,
}

impl IntoResponse for Readiness {
    fn into_response(self) -> axum::response::Response {
        let status = if self.synced && self.leading {
            StatusCode::OK
        } else {
            StatusCode::SERVICE_UNAVAILABLE
        };
        (status, Json(self)).into_response()
    }
}

pub fn app(health: Health) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .layer(TraceLayer::new_for_http())
        .with_state(health)
}

async fn healthz() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn readyz(State(health): State<Health>) -> Readiness {
    health.report()
}

pub async fn serve(
    address: SocketAddr,
    health: Health,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(address).await?;
    info!(%address, "Serving health endpoints");
    axum::serve(listener, app(health))
        .with_graceful_shutdown(shutdown)
        .await
}
