use serde::{Deserialize, Serialize};

/// Name reported for faces that match no gallery entry.
pub const UNKNOWN_NAME: &str = "Unknown";

/// Detected face in pixel coordinates, `(0, 0)` at the top-left corner.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub confidence: f32,
}

impl BoundingBox {
    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    /// Truncate to whole pixels and clamp into a `width` x `height` frame.
    ///
    /// A box lying entirely outside the frame clamps to an empty rect.
    pub fn clamp_to(&self, width: u32, height: u32) -> PixelRect {
        let clamp = |v: f32, max: u32| (v as i64).clamp(0, max as i64) as u32;
        PixelRect {
            x1: clamp(self.x1, width),
            y1: clamp(self.y1, height),
            x2: clamp(self.x2, width),
            y2: clamp(self.y2, height),
        }
    }
}

/// Integer pixel rectangle, guaranteed to lie inside the frame it was clamped to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PixelRect {
    pub x1: u32,
    pub y1: u32,
    pub x2: u32,
    pub y2: u32,
}

impl PixelRect {
    pub fn width(&self) -> u32 {
        self.x2.saturating_sub(self.x1)
    }

    pub fn height(&self) -> u32 {
        self.y2.saturating_sub(self.y1)
    }

    pub fn is_empty(&self) -> bool {
        self.width() == 0 || self.height() == 0
    }
}

/// Face embedding vector (512-dimensional for ArcFace), stored as f64.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Embedding {
    pub values: Vec<f64>,
}

impl Embedding {
    pub fn new(values: Vec<f64>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// True when every component is a finite number.
    pub fn is_finite(&self) -> bool {
        self.values.iter().all(|v| v.is_finite())
    }

    /// Cosine similarity in [-1, 1], or `None` when either vector has zero
    /// norm or the dimensions differ.
    pub fn similarity(&self, other: &Embedding) -> Option<f64> {
        if self.values.len() != other.values.len() {
            return None;
        }

        let mut dot = 0.0f64;
        let mut norm_a = 0.0f64;
        let mut norm_b = 0.0f64;
        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        // sqrt(|a|^2 * |b|^2) rather than |a| * |b|: for a == b this is exactly
        // `dot`, so self-similarity is exactly 1.0. Falls back to the product
        // of norms when the squared product overflows.
        let mut denom = (norm_a * norm_b).sqrt();
        if !denom.is_finite() {
            denom = norm_a.sqrt() * norm_b.sqrt();
        }
        if denom > 0.0 && denom.is_finite() {
            let sim = dot / denom;
            sim.is_finite().then(|| sim.clamp(-1.0, 1.0))
        } else {
            None
        }
    }

    /// Cosine distance `1 - similarity` in [0, 2]; `+inf` when similarity is undefined.
    pub fn cosine_distance(&self, other: &Embedding) -> f64 {
        self.similarity(other)
            .map(|sim| 1.0 - sim)
            .unwrap_or(f64::INFINITY)
    }
}

/// Outcome of classifying one embedding against the gallery.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
    /// True when a gallery entry passed the acceptance threshold.
    pub matched: bool,
    pub name: String,
    /// `1 - cosine distance` of the accepted match, 0.0 otherwise.
    pub confidence: f64,
    pub wanted: bool,
}

impl MatchResult {
    pub fn unknown() -> Self {
        Self {
            matched: false,
            name: UNKNOWN_NAME.to_string(),
            confidence: 0.0,
            wanted: false,
        }
    }
}

/// Per-face output of the recognition pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct DetectionResult {
    #[serde(rename = "box")]
    pub bbox: BoundingBox,
    /// Absent when the crop was empty or the embedder failed.
    #[serde(skip)]
    pub embedding: Option<Embedding>,
    #[serde(flatten)]
    pub identity: MatchResult,
}
