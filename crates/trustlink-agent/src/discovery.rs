//! Unauthenticated discovery endpoint.
//!
//! - `GET /.well-known/agent.json`: the agent's discovery document
//! - `GET /healthz`: liveness

use std::sync::Arc;

use axum::{extract::State, routing::get, Json, Router};

use trustlink_contracts::discovery::DiscoveryDocument;

pub const DISCOVERY_PATH: &str = "/.well-known/agent.json";

pub fn router(document: DiscoveryDocument) -> Router {
    Router::new()
        .route(DISCOVERY_PATH, get(agent_document))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(Arc::new(document))
}

async fn agent_document(State(document): State<Arc<DiscoveryDocument>>) -> Json<DiscoveryDocument> {
    Json(document.as_ref().clone())
}
