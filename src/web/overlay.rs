use axum::{
    body::Body,
    extract::State,
    http::{header, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::any,
    Router,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::File;
use tokio_util::io::ReaderStream;
use tracing::{error, info, warn};

/// The single asset path served besides `/`.
pub const ASSET_PATH: &str = "/overlay.html";

/// Overlay page compiled into the binary.
pub const EMBEDDED_OVERLAY: &str = include_str!("../../static/overlay.html");

/// Where the overlay bytes come from.
#[derive(Debug, Clone)]
pub enum OverlayAsset {
    Embedded,
    /// Read on every request, so edits show up without a restart.
    File(PathBuf),
}

impl OverlayAsset {
    pub fn from_override(path: Option<PathBuf>) -> Self {
        match path {
            Some(path) => OverlayAsset::File(path),
            None => OverlayAsset::Embedded,
        }
    }
}

/// Both known paths answer any method; everything else is 404.
pub fn router(asset: Arc<OverlayAsset>) -> Router {
    Router::new()
        .route("/", any(serve_overlay))
        .route(ASSET_PATH, any(serve_overlay))
        .fallback(not_found)
        .with_state(asset)
}

/// Serve the overlay page. Query parameters are left for the page itself.
pub async fn serve_overlay(State(asset): State<Arc<OverlayAsset>>, uri: Uri) -> Response {
    info!("Request: {} -> Path: {}", uri, uri.path());

    match asset.as_ref() {
        OverlayAsset::Embedded => (
            [(header::CONTENT_TYPE, content_type(Path::new(ASSET_PATH)))],
            EMBEDDED_OVERLAY,
        )
            .into_response(),
        OverlayAsset::File(path) => match File::open(path).await {
            Ok(file) => {
                let body = Body::from_stream(ReaderStream::new(file));
                ([(header::CONTENT_TYPE, content_type(path))], body).into_response()
            }
            Err(e) => {
                error!("Error reading overlay {:?}: {}", path, e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("Error loading overlay: {}", e),
                )
                    .into_response()
            }
        },
    }
}

async fn not_found(uri: Uri) -> (StatusCode, &'static str) {
    warn!("404 for: {}", uri.path());
    (StatusCode::NOT_FOUND, "Not found")
}

// The overlay is always HTML; unknown extensions must not degrade to octet-stream.
fn content_type(path: &Path) -> &'static str {
    mime_guess::from_path(path).first_raw().unwrap_or("text/html")
}
