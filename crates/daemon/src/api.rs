/// Status API
///
/// A small HTTP surface for operators and the companion UI: router
/// identity, link counts and path state.

use crate::router::Router;
use anyhow::Result;
use axum::extract::State;
use axum::routing::get;
use axum::Json;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::info;
use veilnet_common::Timestamp;

#[derive(Clone)]
struct AppState {
    router: Arc<Router>,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    router_id: String,
    address: String,
    running: bool,
    connected_routers: usize,
    connected_clients: usize,
    pending_connections: usize,
    established_paths: usize,
    known_contacts: usize,
}

pub struct ApiServer {
    listen_addr: SocketAddr,
    router: Arc<Router>,
}

impl ApiServer {
    pub fn new(listen_addr: SocketAddr, router: Arc<Router>) -> Self {
        Self {
            listen_addr,
            router,
        }
    }

    pub async fn start(self) -> Result<()> {
        let state = AppState {
            router: self.router,
        };

        let app = axum::Router::new()
            .route("/health", get(health))
            .route("/api/status", get(status))
            .layer(CorsLayer::permissive())
            .with_state(state);

        let listener = tokio::net::TcpListener::bind(self.listen_addr).await?;
        info!(addr = %listener.local_addr()?, "status API listening");
        axum::serve(listener, app).await?;
        Ok(())
    }
}

async fn health() -> &'static str {
    "ok"
}

async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    let router = &state.router;
    let now = Timestamp::now();
    Json(StatusResponse {
        router_id: router.router_id().to_hex(),
        address: router.endpoint.address().to_hostname(),
        running: router.is_running(),
        connected_routers: router.link_manager.num_connected_routers().await,
        connected_clients: router.link_manager.num_connected_clients().await,
        pending_connections: router.link_manager.num_pending_connections().await,
        established_paths: router.endpoint.paths.num_established(now).await,
        known_contacts: router.nodedb.len().await,
    })
}
