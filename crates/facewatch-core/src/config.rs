use crate::matcher::DEFAULT_MATCH_THRESHOLD;
use crate::pipeline::DEFAULT_DETECTION_CONFIDENCE;
use crate::summary::DEFAULT_VIDEO_COUNT_EVERY;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
}

/// Service configuration.
///
/// Resolved from defaults, then the TOML file named by `FACEWATCH_CONFIG`,
/// then `FACEWATCH_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// HTTP listen address (default: 0.0.0.0:8000).
    pub bind_addr: String,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Gallery storage; `.db`, `.sqlite` or `.sqlite3` selects SQLite, anything else JSON.
    pub gallery_path: PathBuf,
    /// Where annotated videos are written.
    pub upload_dir: PathBuf,
    /// Maximum cosine distance for a positive match.
    pub match_threshold: f64,
    /// Minimum detector score for a face box.
    pub detection_confidence: f32,
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    pub stream_width: u32,
    pub stream_height: u32,
    /// Run recognition on every Nth live frame.
    pub stream_recognize_every: u32,
    /// Count recognitions on every Nth video frame.
    pub video_count_every: u32,
    /// TTF/OTF font for overlay labels; boxes only when unset.
    pub label_font: Option<PathBuf>,
    pub max_upload_bytes: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self::defaults_from(&|key: &str| std::env::var(key).ok())
    }
}

impl Config {
    /// Load configuration from the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_with(|key| std::env::var(key).ok())
    }

    /// Load configuration reading variables through `lookup`.
    pub fn load_with(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::defaults_from(&lookup);
        let base = match lookup("FACEWATCH_CONFIG") {
            Some(path) => ConfigFile::read(Path::new(&path))?.apply(defaults),
            None => defaults,
        };
        Ok(base.with_overrides(lookup))
    }

    /// Parse a TOML file; absent keys keep the process-environment defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        Ok(ConfigFile::read(path)?.apply(Self::default()))
    }

    /// Apply `FACEWATCH_*` overrides. Unparsable values keep the current setting.
    pub fn with_overrides(self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let lookup = &lookup;
        Self {
            bind_addr: lookup("FACEWATCH_BIND_ADDR").unwrap_or(self.bind_addr),
            model_dir: env_or(lookup, "FACEWATCH_MODEL_DIR", self.model_dir),
            gallery_path: env_or(lookup, "FACEWATCH_GALLERY_PATH", self.gallery_path),
            upload_dir: env_or(lookup, "FACEWATCH_UPLOAD_DIR", self.upload_dir),
            match_threshold: env_or(lookup, "FACEWATCH_MATCH_THRESHOLD", self.match_threshold),
            detection_confidence: env_or(lookup, "FACEWATCH_DETECTION_CONFIDENCE", self.detection_confidence),
            camera_device: lookup("FACEWATCH_CAMERA_DEVICE").unwrap_or(self.camera_device),
            stream_width: env_or(lookup, "FACEWATCH_STREAM_WIDTH", self.stream_width),
            stream_height: env_or(lookup, "FACEWATCH_STREAM_HEIGHT", self.stream_height),
            stream_recognize_every: env_or(lookup, "FACEWATCH_STREAM_RECOGNIZE_EVERY", self.stream_recognize_every),
            video_count_every: env_or(lookup, "FACEWATCH_VIDEO_COUNT_EVERY", self.video_count_every),
            label_font: lookup("FACEWATCH_LABEL_FONT")
                .map(|v| Some(PathBuf::from(v)).filter(|p| !p.as_os_str().is_empty()))
                .unwrap_or(self.label_font),
            max_upload_bytes: env_or(lookup, "FACEWATCH_MAX_UPLOAD_BYTES", self.max_upload_bytes),
        }
    }

    fn defaults_from(lookup: &dyn Fn(&str) -> Option<String>) -> Self {
        let data_dir = lookup("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                let home = lookup("HOME").unwrap_or_else(|| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("facewatch");

        Self {
            bind_addr: "0.0.0.0:8000".to_string(),
            model_dir: data_dir.join("models"),
            gallery_path: data_dir.join("gallery.json"),
            upload_dir: data_dir.join("uploads"),
            match_threshold: DEFAULT_MATCH_THRESHOLD,
            detection_confidence: DEFAULT_DETECTION_CONFIDENCE,
            camera_device: "/dev/video0".to_string(),
            stream_width: 640,
            stream_height: 480,
            stream_recognize_every: 2,
            video_count_every: DEFAULT_VIDEO_COUNT_EVERY,
            label_font: None,
            max_upload_bytes: 64 * 1024 * 1024,
        }
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> PathBuf {
        self.model_dir.join("det_10g.onnx")
    }

    /// Path to the ArcFace recognition model.
    pub fn arcface_model_path(&self) -> PathBuf {
        self.model_dir.join("w600k_r50.onnx")
    }
}

/// Keys present in a TOML config file.
#[derive(Debug, Deserialize)]
struct ConfigFile {
    bind_addr: Option<String>,
    model_dir: Option<PathBuf>,
    gallery_path: Option<PathBuf>,
    upload_dir: Option<PathBuf>,
    match_threshold: Option<f64>,
    detection_confidence: Option<f32>,
    camera_device: Option<String>,
    stream_width: Option<u32>,
    stream_height: Option<u32>,
    stream_recognize_every: Option<u32>,
    video_count_every: Option<u32>,
    label_font: Option<PathBuf>,
    max_upload_bytes: Option<usize>,
}

impl ConfigFile {
    fn read(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let file = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        tracing::info!(path = %path.display(), "loaded config file");
        Ok(file)
    }

    fn apply(self, base: Config) -> Config {
        Config {
            bind_addr: self.bind_addr.unwrap_or(base.bind_addr),
            model_dir: self.model_dir.unwrap_or(base.model_dir),
            gallery_path: self.gallery_path.unwrap_or(base.gallery_path),
            upload_dir: self.upload_dir.unwrap_or(base.upload_dir),
            match_threshold: self.match_threshold.unwrap_or(base.match_threshold),
            detection_confidence: self.detection_confidence.unwrap_or(base.detection_confidence),
            camera_device: self.camera_device.unwrap_or(base.camera_device),
            stream_width: self.stream_width.unwrap_or(base.stream_width),
            stream_height: self.stream_height.unwrap_or(base.stream_height),
            stream_recognize_every: self.stream_recognize_every.unwrap_or(base.stream_recognize_every),
            video_count_every: self.video_count_every.unwrap_or(base.video_count_every),
            label_font: self.label_font.or(base.label_font),
            max_upload_bytes: self.max_upload_bytes.unwrap_or(base.max_upload_bytes),
        }
    }
}

fn env_or<T: FromStr>(lookup: &dyn Fn(&str) -> Option<String>, key: &str, current: T) -> T {
    match lookup(key) {
        Some(raw) => match raw.parse() {
            Ok(value) => value,
            Err(_) => {
                tracing::warn!(key, value = %raw, "ignoring unparsable setting");
                current
            }
        },
        None => current,
    }
}
