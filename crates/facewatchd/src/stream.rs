//! Live webcam stream: one producer loop at a time, cancelled cooperatively.

use crate::engine::EngineError;
use facewatch_core::annotate::encode_jpeg;
use facewatch_hw::{CameraError, FrameSource};
use image::imageops::{self, FilterType};
use image::RgbImage;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub const MJPEG_CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

const STREAM_JPEG_QUALITY: u8 = 80;

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("camera error: {0}")]
    Camera(#[from] CameraError),
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),
    #[error("failed to encode frame: {0}")]
    Encode(#[from] image::ImageError),
}

#[derive(Debug, Clone, Copy)]
pub struct StreamSettings {
    pub width: u32,
    pub height: u32,
    pub recognize_every: u32,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StreamStats {
    pub frames: u64,
    pub recognized: u64,
}

/// Why a stream ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    Cancelled,
    ClientGone,
}

/// Tracks the single active stream.
///
/// Each start gets a fresh id, so a finishing stream only clears the slot it
/// still owns.
pub struct StreamSlot {
    active: Mutex<Option<(u64, CancellationToken)>>,
    next_id: AtomicU64,
    shutdown: CancellationToken,
}

impl StreamSlot {
    /// Streams are cancelled along with `shutdown`.
    pub fn new(shutdown: CancellationToken) -> Self {
        Self {
            active: Mutex::new(None),
            next_id: AtomicU64::new(1),
            shutdown,
        }
    }

    /// Claim the slot; `None` when a stream is already running.
    pub fn try_start(self: &Arc<Self>) -> Option<StreamLease> {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if active.is_some() {
            return None;
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = self.shutdown.child_token();
        *active = Some((id, token.clone()));
        tracing::info!(stream = id, "stream started");
        Some(StreamLease {
            slot: Arc::clone(self),
            id,
            token,
        })
    }

    /// Cancel the active stream. Returns whether one was running.
    pub fn stop(&self) -> bool {
        let active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        match active.as_ref() {
            Some((id, token)) => {
                tracing::info!(stream = id, "stream stop requested");
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.lock().unwrap_or_else(PoisonError::into_inner).is_some()
    }
}

/// Ownership of the slot for one stream; releases it on drop.
pub struct StreamLease {
    slot: Arc<StreamSlot>,
    id: u64,
    token: CancellationToken,
}

impl StreamLease {
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

impl Drop for StreamLease {
    fn drop(&mut self) {
        let mut active = self.slot.active.lock().unwrap_or_else(PoisonError::into_inner);
        if matches!(active.as_ref(), Some((id, _)) if *id == self.id) {
            *active = None;
        }
        tracing::info!(stream = self.id, "stream ended");
    }
}

/// Producer loop over a frame source. The source is dropped when `run` returns.
pub struct StreamLoop<S: FrameSource> {
    source: S,
    settings: StreamSettings,
    token: CancellationToken,
}

impl<S: FrameSource> StreamLoop<S> {
    pub fn new(source: S, settings: StreamSettings, token: CancellationToken) -> Self {
        Self {
            source,
            settings,
            token,
        }
    }

    /// Capture, resize, annotate every Nth frame, and emit multipart parts
    /// until cancelled, the consumer goes away (`emit` returns false), or an
    /// error occurs.
    pub fn run<A, E>(mut self, mut annotate: A, mut emit: E) -> Result<(StreamEnd, StreamStats), StreamError>
    where
        A: FnMut(RgbImage) -> Result<RgbImage, EngineError>,
        E: FnMut(Vec<u8>) -> bool,
    {
        let every = u64::from(self.settings.recognize_every.max(1));
        let mut stats = StreamStats::default();

        loop {
            if self.token.is_cancelled() {
                return Ok((StreamEnd::Cancelled, stats));
            }

            let mut frame = self.source.next_frame()?;
            if frame.dimensions() != (self.settings.width, self.settings.height) {
                frame = imageops::resize(&frame, self.settings.width, self.settings.height, FilterType::Triangle);
            }

            if stats.frames % every == 0 {
                frame = match annotate(frame.clone()) {
                    Ok(annotated) => {
                        stats.recognized += 1;
                        annotated
                    }
                    Err(EngineError::ChannelClosed) => return Err(EngineError::ChannelClosed.into()),
                    Err(e) => {
                        tracing::warn!(error = %e, frame = stats.frames, "live frame recognition failed");
                        frame
                    }
                };
            }

            let jpeg = encode_jpeg(&frame, STREAM_JPEG_QUALITY)?;
            stats.frames += 1;
            if !emit(mjpeg_part(&jpeg)) {
                return Ok((StreamEnd::ClientGone, stats));
            }
        }
    }
}

/// One `multipart/x-mixed-replace` part carrying a JPEG frame.
pub fn mjpeg_part(jpeg: &[u8]) -> Vec<u8> {
    let header = format!(
        "--frame\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        jpeg.len()
    );
    let mut part = Vec::with_capacity(header.len() + jpeg.len() + 2);
    part.extend_from_slice(header.as_bytes());
    part.extend_from_slice(jpeg);
    part.extend_from_slice(b"\r\n");
    part
}
