//! HTTP routes over the engine, gallery, and stream slot.

use crate::engine::{EngineError, EngineHandle};
use crate::stream::{StreamLoop, StreamSettings, StreamSlot, MJPEG_CONTENT_TYPE};
use axum::body::Body;
use axum::extract::{DefaultBodyLimit, Multipart, Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use facewatch_core::{GalleryError, GalleryStore, PipelineError};
use facewatch_hw::{CameraError, FrameSource};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

/// Opens the live frame source on the stream thread.
pub type SourceOpener = Arc<dyn Fn() -> Result<Box<dyn FrameSource>, CameraError> + Send + Sync>;

#[derive(Clone)]
pub struct AppState {
    pub engine: EngineHandle,
    pub gallery: Arc<GalleryStore>,
    pub streams: Arc<StreamSlot>,
    pub open_source: SourceOpener,
    pub stream_settings: StreamSettings,
    pub upload_dir: PathBuf,
    pub max_upload_bytes: usize,
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    StreamBusy,
    Unavailable(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, m),
            ApiError::StreamBusy => (StatusCode::CONFLICT, "a webcam stream is already running".to_string()),
            ApiError::Unavailable(m) => (StatusCode::SERVICE_UNAVAILABLE, m),
            ApiError::Internal(m) => {
                tracing::error!(error = %m, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, m)
            }
        };
        (status, Json(json!({ "status": "error", "message": message }))).into_response()
    }
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::Pipeline(PipelineError::Input(_)) | EngineError::EmptyVideo => {
                ApiError::BadRequest(e.to_string())
            }
            EngineError::ChannelClosed => ApiError::Unavailable(e.to_string()),
            EngineError::Pipeline(PipelineError::Detector(_))
            | EngineError::Gallery(_)
            | EngineError::Encode(_) => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<GalleryError> for ApiError {
    fn from(e: GalleryError) -> Self {
        ApiError::Internal(e.to_string())
    }
}

impl From<axum::extract::multipart::MultipartError> for ApiError {
    fn from(e: axum::extract::multipart::MultipartError) -> Self {
        ApiError::BadRequest(e.body_text())
    }
}

pub fn router(state: AppState) -> Router {
    let body_limit = state.max_upload_bytes;
    Router::new()
        .route("/api/add-known-face", post(add_known_face))
        .route("/api/recognize-image", post(recognize_image))
        .route("/api/recognize-video", post(recognize_video))
        .route("/api/video/:id", get(get_video))
        .route("/api/webcam-stream", get(webcam_stream))
        .route("/api/stop-webcam", post(stop_webcam))
        .route("/api/known-faces", get(known_faces))
        .route("/api/set-wanted", post(set_wanted))
        .route("/api/clear-database", post(clear_database))
        .route("/health", get(health))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Text fields plus the `file` field of a multipart upload.
struct Upload {
    fields: HashMap<String, String>,
    file: Option<Vec<u8>>,
}

impl Upload {
    async fn read(mut multipart: Multipart) -> Result<Self, ApiError> {
        let mut fields = HashMap::new();
        let mut file = None;
        while let Some(field) = multipart.next_field().await? {
            let name = field.name().unwrap_or_default().to_string();
            if name == "file" {
                file = Some(field.bytes().await?.to_vec());
            } else {
                fields.insert(name, field.text().await?);
            }
        }
        Ok(Self { fields, file })
    }

    fn file(&mut self) -> Result<Vec<u8>, ApiError> {
        match self.file.take() {
            Some(bytes) if !bytes.is_empty() => Ok(bytes),
            _ => Err(ApiError::BadRequest("no file provided".into())),
        }
    }
}

fn parse_flag(value: Option<&String>) -> bool {
    value.is_some_and(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes" | "on"))
}

async fn add_known_face(State(state): State<AppState>, multipart: Multipart) -> Result<Response, ApiError> {
    let mut upload = Upload::read(multipart).await?;
    let name = upload
        .fields
        .get("name")
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty())
        .ok_or_else(|| ApiError::BadRequest("name is required".into()))?;
    let wanted = parse_flag(upload.fields.get("wanted"));
    let bytes = upload.file()?;

    if state.engine.enroll(bytes, name.clone(), wanted).await? {
        Ok(Json(json!({
            "status": "success",
            "message": format!("Face for '{name}' added successfully"),
        }))
        .into_response())
    } else {
        Ok((
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({ "status": "error", "message": "No face detected in image" })),
        )
            .into_response())
    }
}

async fn recognize_image(State(state): State<AppState>, multipart: Multipart) -> Result<Json<Value>, ApiError> {
    let bytes = Upload::read(multipart).await?.file()?;
    let recognition = state.engine.recognize_image(bytes).await?;
    Ok(Json(json!({
        "status": "success",
        "data": {
            "recognized_faces": recognition.results,
            "total_faces": recognition.results.len(),
        },
        "image": format!("data:image/jpeg;base64,{}", BASE64.encode(&recognition.annotated_jpeg)),
    })))
}

async fn recognize_video(State(state): State<AppState>, multipart: Multipart) -> Result<Json<Value>, ApiError> {
    let bytes = Upload::read(multipart).await?.file()?;
    let video = state.engine.recognize_video(bytes).await?;

    let id = Uuid::new_v4();
    let path = state.upload_dir.join(format!("{id}.gif"));
    tokio::fs::create_dir_all(&state.upload_dir)
        .await
        .map_err(|e| ApiError::Internal(format!("failed to create upload dir: {e}")))?;
    tokio::fs::write(&path, &video.gif)
        .await
        .map_err(|e| ApiError::Internal(format!("failed to write video: {e}")))?;
    tracing::info!(path = %path.display(), bytes = video.gif.len(), "annotated video written");

    let summary = &video.summary;
    Ok(Json(json!({
        "status": "success",
        "total_frames": summary.total_frames,
        "recognized_faces": summary.recognized_faces,
        "total_recognized": summary.total_recognized,
        "video_url": format!("/api/video/{id}"),
        "file_size": video.gif.len(),
    })))
}

async fn get_video(State(state): State<AppState>, Path(id): Path<String>) -> Result<Response, ApiError> {
    let not_found = || ApiError::NotFound("Video not found".into());
    let id = Uuid::parse_str(&id).map_err(|_| not_found())?;
    let path = state.upload_dir.join(format!("{id}.gif"));
    let bytes = match tokio::fs::read(&path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(not_found()),
        Err(e) => return Err(ApiError::Internal(format!("failed to read video: {e}"))),
    };
    Ok((
        [(header::CONTENT_TYPE, "image/gif"), (header::CONTENT_DISPOSITION, "inline")],
        bytes,
    )
        .into_response())
}

async fn webcam_stream(State(state): State<AppState>) -> Result<Response, ApiError> {
    let lease = state.streams.try_start().ok_or(ApiError::StreamBusy)?;
    let (ready_tx, ready_rx) = oneshot::channel::<Result<(), CameraError>>();
    let (part_tx, part_rx) = mpsc::channel::<Vec<u8>>(2);
    let open_source = Arc::clone(&state.open_source);
    let engine = state.engine.clone();
    let settings = state.stream_settings;

    std::thread::Builder::new()
        .name("facewatch-stream".into())
        .spawn(move || {
            let source = match open_source() {
                Ok(source) => {
                    let _ = ready_tx.send(Ok(()));
                    source
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };

            let outcome = StreamLoop::new(source, settings, lease.token()).run(
                |frame| engine.blocking_annotate_frame(frame),
                |part| part_tx.blocking_send(part).is_ok(),
            );
            match outcome {
                Ok((end, stats)) => tracing::info!(
                    ?end,
                    frames = stats.frames,
                    recognized = stats.recognized,
                    "stream finished"
                ),
                Err(e) => tracing::warn!(error = %e, "stream aborted"),
            }
            // The source is gone by now; free the slot last.
            drop(lease);
        })
        .map_err(|e| ApiError::Internal(format!("failed to spawn stream thread: {e}")))?;

    match ready_rx.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => return Err(ApiError::Unavailable(format!("camera unavailable: {e}"))),
        Err(_) => return Err(ApiError::Internal("stream thread exited before opening the camera".into())),
    }

    let body = Body::from_stream(ReceiverStream::new(part_rx).map(Ok::<_, Infallible>));
    Ok((
        [(header::CONTENT_TYPE, MJPEG_CONTENT_TYPE), (header::CACHE_CONTROL, "no-cache")],
        body,
    )
        .into_response())
}

async fn stop_webcam(State(state): State<AppState>) -> Json<Value> {
    let stopped = state.streams.stop();
    Json(json!({ "status": "success", "stopped": stopped }))
}

async fn known_faces(State(state): State<AppState>) -> Json<Value> {
    let names = state.gallery.list_names();
    Json(json!({ "count": names.len(), "known_faces": names }))
}

#[derive(Deserialize)]
struct SetWantedRequest {
    name: String,
    wanted: bool,
}

async fn set_wanted(
    State(state): State<AppState>,
    Json(request): Json<SetWantedRequest>,
) -> Result<Json<Value>, ApiError> {
    let gallery = Arc::clone(&state.gallery);
    let name = request.name.clone();
    let updated = tokio::task::spawn_blocking(move || gallery.set_wanted(&name, request.wanted))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))??;

    if !updated {
        return Err(ApiError::NotFound(format!("no known face named '{}'", request.name)));
    }
    Ok(Json(json!({
        "status": "success",
        "name": request.name,
        "wanted": request.wanted,
    })))
}

async fn clear_database(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let gallery = Arc::clone(&state.gallery);
    tokio::task::spawn_blocking(move || gallery.clear())
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))??;
    Ok(Json(json!({ "status": "success", "message": "Database cleared" })))
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "known_faces": state.gallery.list_names().len(),
        "database_loaded": !state.gallery.is_empty(),
        "stream_active": state.streams.is_active(),
    }))
}
