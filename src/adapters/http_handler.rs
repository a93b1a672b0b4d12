use std::{net::SocketAddr, sync::Arc};

use axum::{
    Router,
    body::Body,
    extract::{ConnectInfo, Request, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};

use crate::adapters::{filter_chain::FilterChain, snapshot_store::SnapshotStore};

/// Front door of the gateway: probes answer directly, everything else runs the filter chain.
pub struct HttpHandler {
    chain: Arc<FilterChain>,
    snapshots: Arc<SnapshotStore>,
}

impl HttpHandler {
    pub fn new(chain: Arc<FilterChain>, snapshots: Arc<SnapshotStore>) -> Self {
        Self { chain, snapshots }
    }

    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .route("/healthz", get(healthz))
            .route("/readyz", get(readyz))
            .fallback(proxy)
            .with_state(self)
    }

    pub async fn handle_request(&self, req: Request, client_addr: Option<SocketAddr>) -> Response {
        self.chain.serve(req, client_addr).await
    }
}

fn plain(status: StatusCode, body: &'static str) -> Response {
    (status, [(header::CONTENT_TYPE, "text/plain; charset=utf-8")], body).into_response()
}

async fn healthz() -> Response {
    plain(StatusCode::OK, "ok")
}

/// Ready once a routing snapshot has been published.
async fn readyz(State(handler): State<Arc<HttpHandler>>) -> Response {
    match handler.snapshots.snapshot() {
        Ok(_) => plain(StatusCode::OK, "ok"),
        Err(e) => {
            tracing::debug!(error = %e, "Readiness probe failed");
            plain(StatusCode::SERVICE_UNAVAILABLE, "routing snapshot not synced")
        }
    }
}

async fn proxy(State(handler): State<Arc<HttpHandler>>, req: Request<Body>) -> Response {
    // Absent when the router is driven without a listener, e.g. in tests.
    let client_addr = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    handler.handle_request(req, client_addr).await
}
