//! Administrative API for dynamic pool management.
//!
//! Served on `apiPort` when `use_dynamic` is set. Thin wrappers over the
//! pool's add and remove operations.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::PoolError;
use crate::proxy::ServerPool;

#[derive(Debug, Deserialize)]
struct AddBackendRequest {
    url: String,
}

#[derive(Debug, Serialize)]
struct ApiMessage {
    message: String,
}

#[derive(Debug, Serialize)]
struct ApiErrorBody {
    code: String,
    message: String,
}

pub fn router(pool: Arc<ServerPool>) -> Router {
    Router::new()
        .route("/api/backends", post(add_backend))
        .route("/api/backends/{url}", delete(remove_backend))
        .with_state(pool)
}

async fn add_backend(
    State(pool): State<Arc<ServerPool>>,
    Json(input): Json<AddBackendRequest>,
) -> Response {
    match pool.add_url(&input.url) {
        Ok(_) => message(StatusCode::OK, "Backend added successfully"),
        Err(err @ PoolError::InvalidUrl { .. }) => error(
            StatusCode::BAD_REQUEST,
            "invalid_url",
            &err.to_string(),
        ),
        Err(err) => error(StatusCode::INTERNAL_SERVER_ERROR, "internal", &err.to_string()),
    }
}

async fn remove_backend(
    State(pool): State<Arc<ServerPool>>,
    Path(url): Path<String>,
) -> Response {
    match pool.remove(&url) {
        Ok(()) => message(StatusCode::OK, "Backend removed successfully"),
        Err(err @ PoolError::BackendNotFound(_)) => error(
            StatusCode::NOT_FOUND,
            "backend_not_found",
            &err.to_string(),
        ),
        Err(err) => error(StatusCode::INTERNAL_SERVER_ERROR, "internal", &err.to_string()),
    }
}

fn message(status: StatusCode, text: &str) -> Response {
    (
        status,
        Json(ApiMessage {
            message: text.to_string(),
        }),
    )
        .into_response()
}

fn error(status: StatusCode, code: &str, text: &str) -> Response {
    (
        status,
        Json(ApiErrorBody {
            code: code.to_string(),
            message: text.to_string(),
        }),
    )
        .into_response()
}

/// Binds and serves the admin router.
pub async fn serve(addr: SocketAddr, pool: Arc<ServerPool>) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind admin API on {addr}"))?;
    info!(bind_addr = %listener.local_addr()?, "Admin API listening");
    axum::serve(listener, router(pool))
        .await
        .context("Admin API server failed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RateLimitingConfig;
    use crate::proxy::{Algorithm, Strategy};
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn pool() -> Arc<ServerPool> {
        Arc::new(ServerPool::new(
            Algorithm::from(Strategy::RoundRobin),
            RateLimitingConfig::default(),
            false,
        ))
    }

    #[tokio::test]
    async fn add_then_remove_roundtrip() {
        let pool = pool();
        let app = router(Arc::clone(&pool));

        let response = app
            .clone()
            .oneshot(
                Request::post("/api/backends")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"url":"http://10.0.0.1:8081"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(pool.len(), 1);

        let response = app
            .oneshot(
                Request::delete("/api/backends/http%3A%2F%2F10.0.0.1%3A8081")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn removing_unknown_backend_is_not_found() {
        let app = router(pool());
        let response = app
            .oneshot(
                Request::delete("/api/backends/http%3A%2F%2Fmissing.test")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn adding_invalid_url_is_rejected() {
        let app = router(pool());
        let response = app
            .oneshot(
                Request::post("/api/backends")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"url":"/not-a-url"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
