use anyhow::{Context, Result};
use facewatch_core::annotate::load_font;
use facewatch_core::gallery::open_backend;
use facewatch_core::{ArcFaceEmbedder, Config, CosineMatcher, GalleryStore, Recognizer, ScrfdDetector};
use facewatch_hw::{Camera, FrameSource};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

mod api;
mod engine;
mod stream;

use api::{AppState, SourceOpener};
use engine::{spawn_engine, Engine};
use stream::{StreamSettings, StreamSlot};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("facewatchd starting");

    let config = Config::load()?;
    let bind_addr: SocketAddr = config
        .bind_addr
        .parse()
        .with_context(|| format!("invalid bind address {}", config.bind_addr))?;

    let backend = open_backend(&config.gallery_path)
        .with_context(|| format!("failed to open gallery {}", config.gallery_path.display()))?;
    let gallery = Arc::new(GalleryStore::open(backend));
    tracing::info!(
        path = %config.gallery_path.display(),
        entries = gallery.len(),
        "gallery ready"
    );

    // Models load before binding so a missing file fails startup.
    let detector = ScrfdDetector::load(&config.scrfd_model_path())?;
    let embedder = ArcFaceEmbedder::load(&config.arcface_model_path())?;
    let font = match &config.label_font {
        Some(path) => Some(load_font(path)?),
        None => {
            tracing::info!("no label font configured; overlays draw boxes only");
            None
        }
    };

    let recognizer = Recognizer::new(
        Box::new(detector),
        Box::new(embedder),
        CosineMatcher::new(config.match_threshold),
        Arc::clone(&gallery),
    );
    let engine = spawn_engine(Engine::new(
        recognizer,
        config.detection_confidence,
        config.video_count_every,
        font,
    ))
    .context("failed to spawn engine thread")?;

    let shutdown = CancellationToken::new();
    let stream_settings = StreamSettings {
        width: config.stream_width,
        height: config.stream_height,
        recognize_every: config.stream_recognize_every,
    };
    let device = config.camera_device.clone();
    let open_source: SourceOpener = Arc::new(move || {
        Camera::open(&device, stream_settings.width, stream_settings.height)
            .map(|camera| Box::new(camera) as Box<dyn FrameSource>)
    });

    let state = AppState {
        engine,
        gallery,
        streams: Arc::new(StreamSlot::new(shutdown.clone())),
        open_source,
        stream_settings,
        upload_dir: config.upload_dir.clone(),
        max_upload_bytes: config.max_upload_bytes,
    };

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    tracing::info!(addr = %bind_addr, "facewatchd ready");

    axum::serve(listener, api::router(state))
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("facewatchd shutting down");
            shutdown.cancel();
        })
        .await?;

    Ok(())
}
