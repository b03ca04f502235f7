mod error;
mod session;
mod status;

use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use roi_inspect_common::config::Config;
use roi_inspect_common::frame::{ComparisonResult, Region, Verdict};
use roi_inspect_common::status::StatusLevel;
use serde::Serialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::error::ApiError;
use crate::session::{RoiRequest, Session};
use crate::status::StatusBoard;

#[derive(Debug, Serialize)]
struct TestResponse {
    verdict: Verdict,
    changed: bool,
    severity: f64,
    summary: String,
}

impl From<ComparisonResult> for TestResponse {
    fn from(result: ComparisonResult) -> Self {
        Self {
            verdict: result.verdict(),
            changed: result.changed,
            severity: result.severity,
            summary: result.summary(),
        }
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// GET /status: status line, last result, calibration progress and session flags
async fn get_status(State(session): State<Arc<Session>>) -> impl IntoResponse {
    // Reference completeness touches the filesystem
    match tokio::task::spawn_blocking(move || session.snapshot()).await {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(e) => {
            error!(error = %e, "spawn_blocking failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// GET /frame: latest frame as PNG with the ROI outlined
async fn get_frame(State(session): State<Arc<Session>>) -> Result<impl IntoResponse, ApiError> {
    let png = tokio::task::spawn_blocking(move || session.frame_png()).await??;
    Ok(([(header::CONTENT_TYPE, "image/png")], png))
}

/// POST /roi: body `{x, y, width, height}` or `{start: [x, y], end: [x, y]}`
async fn post_roi(
    State(session): State<Arc<Session>>,
    Json(request): Json<RoiRequest>,
) -> Result<Json<Region>, ApiError> {
    session.select_roi(request).map(Json)
}

/// DELETE /roi
async fn delete_roi(State(session): State<Arc<Session>>) -> StatusCode {
    session.clear_roi();
    StatusCode::NO_CONTENT
}

/// POST /calibrate: starts the reference capture worker
async fn post_calibrate(State(session): State<Arc<Session>>) -> Result<StatusCode, ApiError> {
    session.start_calibration()?;
    Ok(StatusCode::ACCEPTED)
}

/// POST /test: one comparison cycle against the stored references
async fn post_test(State(session): State<Arc<Session>>) -> Result<Json<TestResponse>, ApiError> {
    let result = session.run_test().await?;
    Ok(Json(result.into()))
}

/// POST /reset
async fn post_reset(State(session): State<Arc<Session>>) -> StatusCode {
    session.reset();
    StatusCode::NO_CONTENT
}

fn router(session: Arc<Session>) -> Router {
    Router::new()
        .route("/status", get(get_status))
        .route("/frame", get(get_frame))
        .route("/roi", post(post_roi).delete(delete_roi))
        .route("/calibrate", post(post_calibrate))
        .route("/test", post(post_test))
        .route("/reset", post(post_reset))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(session)
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = match Config::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {e}", config_path.display());
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.parse().unwrap_or_default()),
        )
        .init();

    info!(
        camera = config.camera.url,
        mode = config.camera.mode,
        reference_dir = %config.reference.dir.display(),
        references = config.reference.count,
        "starting roi-inspect"
    );

    let board = Arc::new(StatusBoard::new("Connecting to camera...", StatusLevel::Neutral));
    let (publisher, latest) = roi_inspect_producer::channel();

    let session = Arc::new(Session::from_config(&config, latest, board));

    let capture_session = Arc::clone(&session);
    let camera = config.camera.clone();
    tokio::spawn(async move {
        if let Err(e) =
            roi_inspect_producer::run_capture(&camera, publisher, &*capture_session).await
        {
            error!(error = %e, "frame capture stopped");
        }
    });

    let app = router(session);

    let addr = format!("0.0.0.0:{}", config.api.port);
    info!(addr, "operator API starting");

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            eprintln!("Failed to bind to {addr}: {e}");
            std::process::exit(1);
        }
    };
    if let Err(e) = axum::serve(listener, app).await {
        error!(error = %e, "server error");
        std::process::exit(1);
    }
}
