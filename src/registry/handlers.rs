//! Registry API Handlers
//!
//! The registry's HTTP surface: one route, two verbs. GET reports the live
//! set in a response header; POST upserts the address named in the request
//! header. Both sides of the protocol are headers-only, so there is no body
//! schema to version.

use std::sync::Arc;

use axum::extract::Extension;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;

use super::service::{Registry, DEFAULT_REGISTRY_PATH, SERVERS_HEADER, SERVER_HEADER};

/// Builds the registry router on its default path.
pub fn router(registry: Arc<Registry>) -> Router {
    Router::new()
        .route(
            DEFAULT_REGISTRY_PATH,
            get(handle_list_servers).post(handle_heartbeat),
        )
        .layer(Extension(registry))
}

/// `GET`: the sorted live set, comma-joined, in [`SERVERS_HEADER`].
pub async fn handle_list_servers(
    Extension(registry): Extension<Arc<Registry>>,
) -> impl IntoResponse {
    let alive = registry.alive_servers().join(",");
    (StatusCode::OK, [(SERVERS_HEADER, alive)])
}

/// `POST`: upsert the address in [`SERVER_HEADER`]; a missing or empty
/// header is a server error.
pub async fn handle_heartbeat(
    Extension(registry): Extension<Arc<Registry>>,
    headers: HeaderMap,
) -> StatusCode {
    let addr = headers
        .get(SERVER_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");
    if addr.is_empty() {
        tracing::warn!("heartbeat without a server address");
        return StatusCode::INTERNAL_SERVER_ERROR;
    }
    registry.put_server(addr);
    StatusCode::OK
}
