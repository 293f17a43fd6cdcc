use std::net::SocketAddr;

use axum::extract::{Path, State};
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::error::ServerError;
use crate::federation::{admin, handlers};
use crate::file_store::is_valid_file_name;
use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/files/:name", get(file_download))
        .merge(handlers::router(&state))
        .nest("/admin/federation", admin::router(&state))
        .layer(state.cors.layer())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Serve a stored file; peers fetch avatars and banners from here.
async fn file_download(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ServerError> {
    if !is_valid_file_name(&name) {
        return Err(ServerError::NotFound("File".to_string()));
    }
    let record = state
        .store
        .with(|db| db.find_file_by_name(&name))?
        .ok_or_else(|| ServerError::NotFound("File".to_string()))?;
    let data = state.files.load(&record.name).await?;
    let content_type = record
        .content_type
        .unwrap_or_else(|| "application/octet-stream".to_string());
    Ok(([(header::CONTENT_TYPE, content_type)], data))
}

pub async fn serve(state: AppState, addr: SocketAddr) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    serve_on(listener, state).await
}

pub async fn serve_on(listener: TcpListener, state: AppState) -> anyhow::Result<()> {
    info!(addr = %listener.local_addr()?, domain = %state.config.domain, "Starting HTTP API server");
    axum::serve(listener, build_router(state)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use crate::testing;

    #[tokio::test]
    async fn test_health() {
        let node = testing::instance("b.example").await;
        let response = build_router(node.state.clone())
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_file_download() {
        let node = testing::instance("b.example").await;
        let stored = node.state.files.store(b"png bytes", "", Some("png")).await.unwrap();
        node.state
            .store
            .with(|db| db.insert_file(&stored.name, None, Some("image/png"), stored.size as i64))
            .unwrap();

        let response = build_router(node.state.clone())
            .oneshot(
                Request::get(format!("/files/{}", stored.name))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "image/png");
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&bytes[..], b"png bytes");

        let response = build_router(node.state.clone())
            .oneshot(Request::get("/files/missing.png").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
