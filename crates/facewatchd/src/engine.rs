use ab_glyph::FontVec;
use facewatch_core::annotate::{draw_results, encode_jpeg};
use facewatch_core::pipeline::decode_image;
use facewatch_core::{DetectionResult, GalleryError, PipelineError, Recognizer, VideoSummary};
use image::codecs::gif::{GifDecoder, GifEncoder, Repeat};
use image::{AnimationDecoder, DynamicImage, Frame, RgbImage};
use std::io::Cursor;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

const JPEG_QUALITY: u8 = 85;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error("gallery error: {0}")]
    Gallery(#[from] GalleryError),
    #[error("failed to encode output: {0}")]
    Encode(image::ImageError),
    #[error("video contains no frames")]
    EmptyVideo,
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Recognized image plus its annotated JPEG rendering.
pub struct ImageRecognition {
    pub results: Vec<DetectionResult>,
    pub annotated_jpeg: Vec<u8>,
}

/// Per-name counts plus the annotated GIF.
pub struct VideoRecognition {
    pub summary: VideoSummary,
    pub gif: Vec<u8>,
}

/// Messages sent from HTTP handlers and the stream thread to the engine thread.
enum EngineRequest {
    RecognizeImage {
        bytes: Vec<u8>,
        reply: oneshot::Sender<Result<ImageRecognition, EngineError>>,
    },
    AnnotateFrame {
        frame: RgbImage,
        reply: oneshot::Sender<Result<RgbImage, EngineError>>,
    },
    Enroll {
        bytes: Vec<u8>,
        name: String,
        wanted: bool,
        reply: oneshot::Sender<Result<bool, EngineError>>,
    },
    Video {
        bytes: Vec<u8>,
        reply: oneshot::Sender<Result<VideoRecognition, EngineError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    async fn call<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T, EngineError>>) -> EngineRequest,
    ) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Decode, recognize and annotate an uploaded image.
    pub async fn recognize_image(&self, bytes: Vec<u8>) -> Result<ImageRecognition, EngineError> {
        self.call(|reply| EngineRequest::RecognizeImage { bytes, reply }).await
    }

    /// Enroll `name` from an uploaded image. `Ok(false)` when no embedding was obtained.
    pub async fn enroll(&self, bytes: Vec<u8>, name: String, wanted: bool) -> Result<bool, EngineError> {
        self.call(|reply| EngineRequest::Enroll {
            bytes,
            name,
            wanted,
            reply,
        })
        .await
    }

    /// Recognize every frame of an animated GIF.
    pub async fn recognize_video(&self, bytes: Vec<u8>) -> Result<VideoRecognition, EngineError> {
        self.call(|reply| EngineRequest::Video { bytes, reply }).await
    }

    /// Recognize and annotate one live frame. For use from non-async threads.
    pub fn blocking_annotate_frame(&self, frame: RgbImage) -> Result<RgbImage, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .blocking_send(EngineRequest::AnnotateFrame {
                frame,
                reply: reply_tx,
            })
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.blocking_recv().map_err(|_| EngineError::ChannelClosed)?
    }
}

/// Owns the models; processes one request at a time.
pub struct Engine {
    recognizer: Recognizer,
    detection_confidence: f32,
    video_count_every: u32,
    font: Option<FontVec>,
}

impl Engine {
    pub fn new(
        recognizer: Recognizer,
        detection_confidence: f32,
        video_count_every: u32,
        font: Option<FontVec>,
    ) -> Self {
        Self {
            recognizer,
            detection_confidence,
            video_count_every,
            font,
        }
    }

    fn recognize_image(&mut self, bytes: &[u8]) -> Result<ImageRecognition, EngineError> {
        let image = decode_image(bytes)?;
        let results = self.recognizer.recognize(&image, self.detection_confidence)?;
        let annotated = draw_results(&image, &results, self.font.as_ref());
        let annotated_jpeg = encode_jpeg(&annotated, JPEG_QUALITY).map_err(EngineError::Encode)?;
        tracing::info!(
            width = image.width(),
            height = image.height(),
            faces = results.len(),
            "image recognized"
        );
        Ok(ImageRecognition {
            results,
            annotated_jpeg,
        })
    }

    fn annotate_frame(&mut self, frame: RgbImage) -> Result<RgbImage, EngineError> {
        let results = self.recognizer.recognize(&frame, self.detection_confidence)?;
        Ok(draw_results(&frame, &results, self.font.as_ref()))
    }

    fn enroll(&mut self, bytes: &[u8], name: &str, wanted: bool) -> Result<bool, EngineError> {
        let image = decode_image(bytes)?;
        Ok(self.recognizer.enroll(&image, name, wanted, self.detection_confidence)?)
    }

    fn recognize_video(&mut self, bytes: Vec<u8>) -> Result<VideoRecognition, EngineError> {
        let decoder = GifDecoder::new(Cursor::new(bytes)).map_err(PipelineError::from)?;
        let frames = decoder.into_frames().collect_frames().map_err(PipelineError::from)?;
        if frames.is_empty() {
            return Err(EngineError::EmptyVideo);
        }

        let mut summary = VideoSummary::new(self.video_count_every);
        let mut annotated = Vec::with_capacity(frames.len());
        for frame in frames {
            let delay = frame.delay();
            let rgb = DynamicImage::ImageRgba8(frame.into_buffer()).to_rgb8();
            let results = self.recognizer.recognize(&rgb, self.detection_confidence)?;
            summary.record(&results);
            let drawn = draw_results(&rgb, &results, self.font.as_ref());
            annotated.push(Frame::from_parts(DynamicImage::ImageRgb8(drawn).to_rgba8(), 0, 0, delay));
        }

        let mut gif = Vec::new();
        {
            let mut encoder = GifEncoder::new(&mut gif);
            encoder.set_repeat(Repeat::Infinite).map_err(EngineError::Encode)?;
            encoder.encode_frames(annotated).map_err(EngineError::Encode)?;
        }

        tracing::info!(
            frames = summary.total_frames,
            recognized = summary.total_recognized,
            "video recognized"
        );
        Ok(VideoRecognition { summary, gif })
    }

    fn handle(&mut self, request: EngineRequest) {
        match request {
            EngineRequest::RecognizeImage { bytes, reply } => {
                let _ = reply.send(self.recognize_image(&bytes));
            }
            EngineRequest::AnnotateFrame { frame, reply } => {
                let _ = reply.send(self.annotate_frame(frame));
            }
            EngineRequest::Enroll {
                bytes,
                name,
                wanted,
                reply,
            } => {
                let _ = reply.send(self.enroll(&bytes, &name, wanted));
            }
            EngineRequest::Video { bytes, reply } => {
                let _ = reply.send(self.recognize_video(bytes));
            }
        }
    }
}

/// Spawn the engine on a dedicated OS thread and return its handle.
///
/// The thread exits once every handle has been dropped.
pub fn spawn_engine(mut engine: Engine) -> std::io::Result<EngineHandle> {
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(16);

    std::thread::Builder::new()
        .name("facewatch-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(request) = rx.blocking_recv() {
                engine.handle(request);
            }
            tracing::info!("engine thread exiting");
        })?;

    Ok(EngineHandle { tx })
}
