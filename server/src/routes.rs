use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::header::{CACHE_CONTROL, CONTENT_TYPE, EXPIRES, PRAGMA};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use bytes::{Bytes, BytesMut};
use frame_cast_capture::{Camera, CameraStatus};
use frame_cast_common::frame::Frame;
use futures_util::StreamExt;
use serde::Serialize;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

// ---------------------------------------------------------------------------
// App state
// ---------------------------------------------------------------------------

pub struct AppState {
    pub camera: Arc<Camera>,
    pub boundary: String,
    /// Flipped to `true` on shutdown so open streams end and the server can
    /// drain.
    pub shutdown: watch::Sender<bool>,
}

impl AppState {
    pub fn new(camera: Arc<Camera>, boundary: String) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            camera,
            boundary,
            shutdown,
        }
    }
}

#[derive(Debug, Serialize)]
struct Health {
    ok: bool,
    #[serde(flatten)]
    camera: CameraStatus,
}

// ---------------------------------------------------------------------------
// Multipart framing
// ---------------------------------------------------------------------------

/// One `multipart/x-mixed-replace` part carrying a JPEG frame.
pub fn encode_part(boundary: &str, frame: &Frame) -> Bytes {
    let header = format!(
        "--{boundary}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        frame.len()
    );
    let mut buf = BytesMut::with_capacity(header.len() + frame.len() + 2);
    buf.extend_from_slice(header.as_bytes());
    buf.extend_from_slice(frame.jpeg_data());
    buf.extend_from_slice(b"\r\n");
    buf.freeze()
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// GET /stream: endless MJPEG stream, one part per fresh frame
async fn stream_mjpeg(State(state): State<Arc<AppState>>) -> Response {
    info!("stream viewer connected");

    let boundary = state.boundary.clone();
    let mut shutdown = state.shutdown.subscribe();
    let parts = state
        .camera
        .frames()
        .map(move |frame| Ok::<_, Infallible>(encode_part(&boundary, &frame)))
        .take_until(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        });

    let content_type = format!("multipart/x-mixed-replace; boundary={}", state.boundary);
    (
        [
            (CONTENT_TYPE, content_type),
            (CACHE_CONTROL, "no-store".to_string()),
        ],
        Body::from_stream(parts),
    )
        .into_response()
}

/// GET /snapshot: latest JPEG, or 503 if none shows up in time
async fn snapshot(State(state): State<Arc<AppState>>) -> Response {
    match state.camera.snapshot().await {
        Ok(frame) => (
            [
                (CONTENT_TYPE, "image/jpeg"),
                (CACHE_CONTROL, "no-store, no-cache, must-revalidate, max-age=0"),
                (PRAGMA, "no-cache"),
                (EXPIRES, "0"),
            ],
            frame.bytes(),
        )
            .into_response(),
        Err(e) => {
            debug!(error = %e, "snapshot unavailable");
            (StatusCode::SERVICE_UNAVAILABLE, "no frame").into_response()
        }
    }
}

/// GET /health
async fn health(State(state): State<Arc<AppState>>) -> Json<Health> {
    Json(Health {
        ok: true,
        camera: state.camera.status(),
    })
}

/// GET /: viewer page
async fn index() -> Html<&'static str> {
    Html(
        r#"<!doctype html>
<html><head><meta charset="utf-8"><title>frame-cast</title></head>
<body style="margin:0;background:#111;display:flex;align-items:center;justify-content:center;height:100vh">
<img src="/stream" style="max-width:100%;height:auto;border-radius:12px;box-shadow:0 10px 30px rgba(0,0,0,.5)">
</body></html>"#,
    )
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/stream", get(stream_mjpeg))
        .route("/stream.mjpg", get(stream_mjpeg))
        .route("/snapshot", get(snapshot))
        .route("/snapshot.jpg", get(snapshot))
        .route("/health", get(health))
        .route("/healthz", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
