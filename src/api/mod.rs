//! HTTP surface: the inter-node cluster API and the tenant-facing migration
//! API, wired onto a single `ClusterHandle` application state.
//!
//! Follows the `api::rest::handlers` module split (one file per resource
//! area, a top-level router assembling them), with `ClusterHandle` standing
//! in directly as application state since every field an `ApiState` wrapper
//! would hold is already an `Arc<...>` component handle there. Middleware
//! layering follows `api::rest::server`'s `TraceLayer` / `TimeoutLayer` /
//! body-limit stack.

pub mod cluster_handlers;
pub mod error;
pub mod migration_handlers;

use std::time::Duration;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post};
use axum::Router;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::router::RouteRequest;
use crate::runtime::ClusterHandle;

pub fn build_router(state: ClusterHandle) -> Router {
    let request_timeout = Duration::from_secs(state.config.cluster_request_timeout_seconds);
    let max_body_bytes = state.config.migration_max_compressed_bytes as usize;

    Router::new()
        .route("/cluster/register", post(cluster_handlers::register_node))
        .route(
            "/cluster/replication/apply",
            post(cluster_handlers::apply_replication_event),
        )
        .route("/cluster/health", get(cluster_handlers::cluster_health))
        .route("/cluster/topology", get(cluster_handlers::topology))
        .route("/cluster/nodes", get(cluster_handlers::list_nodes))
        .route(
            "/cluster/nodes/{id}",
            get(cluster_handlers::get_node).delete(cluster_handlers::remove_node),
        )
        .route("/cluster/nodes/promote", post(cluster_handlers::promote_node))
        .route("/cluster/nodes/{id}/demote", post(cluster_handlers::demote_node))
        .route("/cluster/replication/lag", get(cluster_handlers::replication_lag))
        .route("/cluster/validate-owner", post(cluster_handlers::validate_owner))
        .route(
            "/cluster/internal/check-user/{user_id}",
            get(cluster_handlers::check_user),
        )
        .route("/migration/export", post(migration_handlers::export))
        .route(
            "/migration/export/{id}/download",
            get(migration_handlers::download_export),
        )
        .route("/migration/upload", post(migration_handlers::upload))
        .route("/migration/import", post(migration_handlers::import))
        .route("/migration/import/validate", post(migration_handlers::validate_import))
        .route(
            "/migration/import/{id}/rollback",
            post(migration_handlers::rollback),
        )
        .route("/migration/history", get(migration_handlers::history))
        .route("/migration/{id}", axum::routing::delete(migration_handlers::delete_migration))
        .route("/migration/collections", get(migration_handlers::list_collections))
        .route("/migration/{id}/status", get(migration_handlers::status))
        .route("/migration/health", get(migration_handlers::migration_health))
        .route(
            "/migration/instances",
            post(migration_handlers::register_instance).get(migration_handlers::list_instances),
        )
        .route(
            "/migration/instances/{id}",
            axum::routing::delete(migration_handlers::delete_instance),
        )
        .route(
            "/migration/transfers",
            post(migration_handlers::create_transfer),
        )
        .route("/migration/transfers/{id}", get(migration_handlers::get_transfer))
        .route(
            "/migration/transfer/{transfer_id}/collections/{collection}",
            patch(migration_handlers::receive_transfer_chunk),
        )
        .route(
            "/migration/schedules",
            post(migration_handlers::create_schedule).get(migration_handlers::list_schedules),
        )
        .route(
            "/migration/schedules/{id}",
            axum::routing::delete(migration_handlers::delete_schedule),
        )
        .fallback(route_or_forward)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(request_timeout))
        .layer(RequestBodyLimitLayer::new(max_body_bytes))
}

/// Catches any request that didn't match a route this node serves itself:
/// asks `Router` whether another node should handle it and, if so, forwards
/// it there and relays the upstream response back verbatim. A request the
/// router decides belongs locally falls through to a plain 404, since this
/// crate's own HTTP surface has no handler left to try.
async fn route_or_forward(State(state): State<ClusterHandle>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let body = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(b) => b,
        Err(e) => return crate::error::ClusterError::Validation(e.to_string()).into_response(),
    };

    let route_request = RouteRequest {
        method: parts.method.clone(),
        path: parts.uri.path().to_string(),
        query: parts.uri.query().map(str::to_string),
        client_id: parts
            .headers
            .get("x-client-id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
    };

    match state.router.route(&route_request).await {
        Ok(Some(forwarded)) => match state.router.forward_request(&forwarded, &parts.headers, body).await {
            Ok((status, headers, body)) => {
                let mut response = Response::new(Body::from(body));
                *response.status_mut() = status;
                *response.headers_mut() = headers;
                response
            }
            Err(e) => e.into_response(),
        },
        Ok(None) => axum::http::StatusCode::NOT_FOUND.into_response(),
        Err(e) => e.into_response(),
    }
}

/// Checks the `X-Cluster-Token` header against the configured shared secret.
/// Used by every inter-node endpoint; migration endpoints authenticate by
/// tenant ownership instead (see `migration_handlers::require_owner`).
pub(crate) fn require_cluster_token(
    headers: &axum::http::HeaderMap,
    expected: &str,
) -> crate::error::Result<()> {
    let provided = headers
        .get("x-cluster-token")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if provided.is_empty() || provided != expected {
        return Err(crate::error::ClusterError::Unauthorized(
            "missing or invalid X-Cluster-Token".to_string(),
        ));
    }
    Ok(())
}
