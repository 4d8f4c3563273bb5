//! HTTP Server
//!
//! Routes:
//! - `POST /process` identify the products in an uploaded photo
//! - `GET /products.json` the raw catalog file
//! - `GET /db/images/*` static product images
//! - `GET /health` liveness probe

pub mod auth;

pub use auth::RequireApiKey;

use anyhow::{Context, Result};
use axum::{
    extract::{multipart::MultipartRejection, DefaultBodyLimit, Multipart, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::{services::ServeDir, trace::TraceLayer};
use tracing::{debug, info, instrument};

use crate::error::ApiError;
use crate::pipeline::{Pipeline, ProcessResponse};

/// Multipart field holding the uploaded photo
const IMAGE_FIELD: &str = "image";

/// Application state shared across routes
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    pub api_key: Arc<str>,
    pub products_file: Arc<PathBuf>,
}

/// Build the router with all routes and layers
pub fn router(state: AppState, images_dir: &Path, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/process", post(process_image))
        .route("/products.json", get(products_json))
        .route("/health", get(|| async { "OK" }))
        .nest_service("/db/images", ServeDir::new(images_dir))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve `app` until Ctrl-C
#[instrument(skip(app))]
pub async fn start_server(bind: &str, app: Router) -> Result<()> {
    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("Failed to bind {}", bind))?;

    info!("Listening on {}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}

async fn process_image(
    _auth: RequireApiKey,
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<ProcessResponse>, ApiError> {
    let mut multipart = multipart.map_err(|e| {
        debug!("Rejected non-multipart upload: {}", e);
        ApiError::NoImage
    })?;

    while let Some(field) = multipart.next_field().await? {
        if field.name() != Some(IMAGE_FIELD) {
            continue;
        }
        // Only file parts count as uploads
        let Some(filename) = field.file_name().map(str::to_string) else {
            debug!("Ignoring non-file {:?} field", IMAGE_FIELD);
            continue;
        };

        let bytes = field.bytes().await?;
        debug!("Received {:?} ({} bytes)", filename, bytes.len());

        let response = state.pipeline.clone().process(bytes.to_vec(), filename).await?;
        return Ok(Json(response));
    }

    Err(ApiError::NoImage)
}

async fn products_json(State(state): State<AppState>) -> Result<Response, ApiError> {
    match tokio::fs::read(state.products_file.as_path()).await {
        Ok(content) => Ok(([(header::CONTENT_TYPE, "application/json")], content).into_response()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(StatusCode::NOT_FOUND.into_response()),
        Err(e) => Err(anyhow::Error::new(e)
            .context(format!("Failed to read {:?}", state.products_file))
            .into()),
    }
}
