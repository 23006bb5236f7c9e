//! facewatch-core: face recognition against a small on-disk gallery.
//!
//! Detection (SCRFD) and embedding (ArcFace) run via ONNX Runtime behind the
//! [`Detector`] and [`Embedder`] traits. Matching is cosine distance against
//! the enrolled identities held by [`GalleryStore`].

pub mod annotate;
pub mod config;
pub mod detector;
pub mod embedder;
pub mod gallery;
pub mod matcher;
pub mod pipeline;
pub mod summary;
pub mod types;

pub use config::Config;
pub use detector::{DetectorError, ScrfdDetector};
pub use embedder::{ArcFaceEmbedder, EmbedderError};
pub use gallery::{GalleryEntry, GalleryError, GalleryStore, NameSummary};
pub use matcher::{CosineMatcher, Matcher, DEFAULT_MATCH_THRESHOLD};
pub use pipeline::{Detector, Embedder, PipelineError, Recognizer, DEFAULT_DETECTION_CONFIDENCE};
pub use summary::VideoSummary;
pub use types::{BoundingBox, DetectionResult, Embedding, MatchResult, PixelRect, UNKNOWN_NAME};
