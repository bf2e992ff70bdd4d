//! Cache Peer Handlers
//!
//! The serving half of the peer protocol: an axum route that resolves the
//! named group, runs the normal read path, and returns the value as a
//! bincode-encoded [`PeerResponse`].

use std::sync::Arc;

use axum::extract::{Extension, Path};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;

use super::group::GroupRegistry;
use super::protocol::{PeerResponse, DEFAULT_BASE_PATH};

/// Builds the peer router for a group registry, mounted under `base_path`.
pub fn peer_router(groups: Arc<GroupRegistry>) -> Router {
    peer_router_with_base(groups, DEFAULT_BASE_PATH)
}

pub fn peer_router_with_base(groups: Arc<GroupRegistry>, base_path: &str) -> Router {
    Router::new()
        .route(
            &format!("{}:group/:key", base_path),
            get(handle_peer_get),
        )
        .layer(Extension(groups))
}

/// `GET <base>/<group>/<key>`.
///
/// Unknown group is `404`; a loader failure inside the group is `500`.
pub async fn handle_peer_get(
    Extension(groups): Extension<Arc<GroupRegistry>>,
    Path((group_name, key)): Path<(String, String)>,
) -> impl IntoResponse {
    let Some(group) = groups.get_group(&group_name) else {
        return (
            StatusCode::NOT_FOUND,
            format!("no such group: {}", group_name),
        )
            .into_response();
    };

    match group.get(&key).await {
        Ok(view) => {
            let body = PeerResponse {
                value: view.byte_slice(),
            };
            match bincode::serialize(&body) {
                Ok(bytes) => (
                    StatusCode::OK,
                    [(header::CONTENT_TYPE, "application/octet-stream")],
                    bytes,
                )
                    .into_response(),
                Err(err) => {
                    tracing::error!("failed to encode peer response: {}", err);
                    (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
                }
            }
        }
        Err(err) => {
            tracing::error!("load for {}/{} failed: {}", group_name, key, err);
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
        }
    }
}
