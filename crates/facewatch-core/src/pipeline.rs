//! Recognition pipeline: detect, crop, embed, and classify each face.

use crate::detector::DetectorError;
use crate::embedder::EmbedderError;
use crate::gallery::{GalleryError, GalleryStore};
use crate::matcher::{CosineMatcher, Matcher};
use crate::types::{BoundingBox, DetectionResult, Embedding};
use image::{imageops, RgbImage};
use std::sync::Arc;
use thiserror::Error;

pub const DEFAULT_DETECTION_CONFIDENCE: f32 = 0.5;

/// Face detector returning boxes in frame pixel coordinates.
///
/// Implementations own inference state, hence `&mut self`.
pub trait Detector: Send {
    fn detect(&mut self, frame: &RgbImage, min_confidence: f32) -> Result<Vec<BoundingBox>, DetectorError>;
}

/// Face embedder for an RGB face crop.
pub trait Embedder: Send {
    fn embed(&mut self, face: &RgbImage) -> Result<Embedding, EmbedderError>;
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("unreadable image: {0}")]
    Input(#[from] image::ImageError),
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
}

/// Decode an uploaded image (any format the `image` crate knows) to RGB.
pub fn decode_image(bytes: &[u8]) -> Result<RgbImage, PipelineError> {
    Ok(image::load_from_memory(bytes)?.to_rgb8())
}

/// Runs detection and embedding, and classifies faces against the gallery.
///
/// Reads the gallery through snapshots; enrollment goes through
/// [`GalleryStore::add_entry`].
pub struct Recognizer {
    detector: Box<dyn Detector>,
    embedder: Box<dyn Embedder>,
    matcher: CosineMatcher,
    gallery: Arc<GalleryStore>,
}

impl Recognizer {
    pub fn new(
        detector: Box<dyn Detector>,
        embedder: Box<dyn Embedder>,
        matcher: CosineMatcher,
        gallery: Arc<GalleryStore>,
    ) -> Self {
        Self {
            detector,
            embedder,
            matcher,
            gallery,
        }
    }

    pub fn gallery(&self) -> &Arc<GalleryStore> {
        &self.gallery
    }

    /// Detect and classify every face in `frame`, in detector order.
    ///
    /// Per-face embedding failures resolve to `Unknown`; only a detector
    /// failure fails the whole frame.
    pub fn recognize(
        &mut self,
        frame: &RgbImage,
        min_confidence: f32,
    ) -> Result<Vec<DetectionResult>, PipelineError> {
        let boxes = self.detector.detect(frame, min_confidence)?;
        if boxes.is_empty() {
            return Ok(Vec::new());
        }

        let gallery = self.gallery.snapshot();
        let mut results = Vec::with_capacity(boxes.len());
        for bbox in boxes {
            let embedding = self.embed_region(frame, &bbox);
            let identity = self.matcher.classify(embedding.as_ref(), &gallery);
            results.push(DetectionResult {
                bbox,
                embedding,
                identity,
            });
        }

        tracing::debug!(
            faces = results.len(),
            recognized = results.iter().filter(|r| r.identity.matched).count(),
            "frame recognized"
        );
        Ok(results)
    }

    /// Enroll `name` from `image`.
    ///
    /// Embeds the highest-confidence detection; when nothing usable is
    /// detected the whole image is embedded instead, which covers
    /// pre-cropped headshots. `Ok(false)` means no embedding could be produced.
    pub fn enroll(
        &mut self,
        image: &RgbImage,
        name: &str,
        wanted: bool,
        min_confidence: f32,
    ) -> Result<bool, GalleryError> {
        let embedding = self.enrollment_embedding(image, min_confidence);
        if embedding.is_none() {
            tracing::info!(name, "enroll: no face embedding obtained");
        }
        self.gallery.add_entry(name, embedding, wanted)
    }

    fn enrollment_embedding(&mut self, image: &RgbImage, min_confidence: f32) -> Option<Embedding> {
        match self.detector.detect(image, min_confidence) {
            Ok(boxes) => match best_detection(&boxes) {
                Some(best) => {
                    tracing::debug!(confidence = best.confidence, "enroll: best face selected");
                    if let Some(embedding) = self.embed_region(image, best) {
                        return Some(embedding);
                    }
                    tracing::info!("enroll: best face yielded no embedding; embedding whole image");
                }
                None => tracing::info!("enroll: no face detected; embedding whole image"),
            },
            Err(e) => tracing::warn!(error = %e, "enroll: detector failed; embedding whole image"),
        }
        self.embed_image(image)
    }

    /// Embed the clamped crop of `bbox`; `None` for empty crops or embedder failures.
    /// Non-finite output counts as a failure.
    fn embed_region(&mut self, frame: &RgbImage, bbox: &BoundingBox) -> Option<Embedding> {
        let rect = bbox.clamp_to(frame.width(), frame.height());
        if rect.is_empty() {
            tracing::debug!(?bbox, "face crop is empty after clamping");
            return None;
        }
        let crop = imageops::crop_imm(frame, rect.x1, rect.y1, rect.width(), rect.height()).to_image();
        self.embed_image(&crop)
    }

    fn embed_image(&mut self, image: &RgbImage) -> Option<Embedding> {
        match self.embedder.embed(image) {
            Ok(embedding) if embedding.is_empty() => {
                tracing::warn!("embedder returned an empty vector");
                None
            }
            Ok(embedding) if !embedding.is_finite() => {
                tracing::warn!("embedder returned non-finite values");
                None
            }
            Ok(embedding) => Some(embedding),
            Err(e) => {
                tracing::warn!(error = %e, "face embedding failed");
                None
            }
        }
    }
}

/// Highest-confidence box; the earliest wins ties.
fn best_detection(boxes: &[BoundingBox]) -> Option<&BoundingBox> {
    boxes.iter().fold(None, |best, candidate| match best {
        Some(current) if current.confidence >= candidate.confidence => Some(current),
        _ => Some(candidate),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gallery::JsonFileBackend;
    use crate::types::UNKNOWN_NAME;
    use std::collections::VecDeque;

    /// Returns queued box lists, then nothing.
    struct ScriptedDetector {
        frames: VecDeque<Result<Vec<BoundingBox>, DetectorError>>,
    }

    impl ScriptedDetector {
        fn new(frames: Vec<Result<Vec<BoundingBox>, DetectorError>>) -> Box<Self> {
            Box::new(Self { frames: frames.into() })
        }
    }

    impl Detector for ScriptedDetector {
        fn detect(&mut self, _frame: &RgbImage, _min_confidence: f32) -> Result<Vec<BoundingBox>, DetectorError> {
            self.frames.pop_front().unwrap_or_else(|| Ok(Vec::new()))
        }
    }

    /// Embeds a crop as its mean colour; fails on crops whose top-left pixel is pure black.
    struct MeanColorEmbedder;

    impl Embedder for MeanColorEmbedder {
        fn embed(&mut self, face: &RgbImage) -> Result<Embedding, EmbedderError> {
            if face.get_pixel(0, 0).0 == [0, 0, 0] {
                return Err(EmbedderError::InferenceFailed("black crop".into()));
            }
            let n = (face.width() * face.height()) as f64;
            let mut sum = [0.0f64; 3];
            for pixel in face.pixels() {
                for c in 0..3 {
                    sum[c] += pixel[c] as f64;
                }
            }
            Ok(Embedding::new(sum.iter().map(|s| s / n).collect()))
        }
    }

    /// Emits NaN for every crop.
    struct NanEmbedder;

    impl Embedder for NanEmbedder {
        fn embed(&mut self, _face: &RgbImage) -> Result<Embedding, EmbedderError> {
            Ok(Embedding::new(vec![f64::NAN, 1.0, 0.0]))
        }
    }

    fn bbox(x1: f32, y1: f32, x2: f32, y2: f32, confidence: f32) -> BoundingBox {
        BoundingBox { x1, y1, x2, y2, confidence }
    }

    /// 100x50 frame: red left half, black right half.
    fn two_tone_frame() -> RgbImage {
        RgbImage::from_fn(100, 50, |x, _| if x < 50 { image::Rgb([200, 0, 0]) } else { image::Rgb([0, 0, 0]) })
    }

    fn gallery(dir: &tempfile::TempDir) -> Arc<GalleryStore> {
        Arc::new(GalleryStore::open(Box::new(JsonFileBackend::new(dir.path().join("g.json")))))
    }

    fn recognizer(detector: Box<ScriptedDetector>, gallery: Arc<GalleryStore>) -> Recognizer {
        Recognizer::new(detector, Box::new(MeanColorEmbedder), CosineMatcher::default(), gallery)
    }

    #[test]
    fn test_no_detections_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let mut rec = recognizer(ScriptedDetector::new(vec![Ok(vec![])]), gallery(&dir));
        assert!(rec.recognize(&two_tone_frame(), 0.5).unwrap().is_empty());
    }

    #[test]
    fn test_embedding_failure_is_per_face() {
        let dir = tempfile::tempdir().unwrap();
        let store = gallery(&dir);
        store.add_entry("Red", Some(Embedding::new(vec![200.0, 0.0, 0.0])), true).unwrap();

        let detector = ScriptedDetector::new(vec![Ok(vec![
            bbox(0.0, 0.0, 50.0, 50.0, 0.9),
            bbox(50.0, 0.0, 100.0, 50.0, 0.8),
        ])]);
        let mut rec = recognizer(detector, store);
        let results = rec.recognize(&two_tone_frame(), 0.5).unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].identity.name, "Red");
        assert_eq!(results[0].identity.confidence, 1.0);
        assert!(results[0].identity.wanted);
        assert!(results[0].embedding.is_some());

        assert_eq!(results[1].identity.name, UNKNOWN_NAME);
        assert_eq!(results[1].identity.confidence, 0.0);
        assert!(!results[1].identity.wanted);
        assert!(results[1].embedding.is_none());
        assert_eq!(results[1].bbox, bbox(50.0, 0.0, 100.0, 50.0, 0.8));
    }

    #[test]
    fn test_out_of_frame_box_is_unknown_without_embedding() {
        let dir = tempfile::tempdir().unwrap();
        let store = gallery(&dir);
        store.add_entry("Red", Some(Embedding::new(vec![200.0, 0.0, 0.0])), false).unwrap();

        let detector = ScriptedDetector::new(vec![Ok(vec![
            bbox(150.0, 10.0, 180.0, 40.0, 0.9),
            bbox(-20.0, -20.0, 30.0, 30.0, 0.7),
        ])]);
        let mut rec = recognizer(detector, store);
        let results = rec.recognize(&two_tone_frame(), 0.5).unwrap();

        assert_eq!(results.len(), 2);
        assert!(results[0].embedding.is_none());
        assert!(!results[0].identity.matched);
        // Clamped crop of the second box is all red.
        assert_eq!(results[1].identity.name, "Red");
    }

    #[test]
    fn test_results_keep_detector_order() {
        let dir = tempfile::tempdir().unwrap();
        let boxes = vec![
            bbox(60.0, 0.0, 90.0, 30.0, 0.6),
            bbox(0.0, 0.0, 30.0, 30.0, 0.99),
            bbox(10.0, 10.0, 40.0, 40.0, 0.7),
        ];
        let mut rec = recognizer(ScriptedDetector::new(vec![Ok(boxes.clone())]), gallery(&dir));
        let results = rec.recognize(&two_tone_frame(), 0.5).unwrap();
        let got: Vec<BoundingBox> = results.iter().map(|r| r.bbox).collect();
        assert_eq!(got, boxes);
    }

    #[test]
    fn test_detector_failure_fails_frame() {
        let dir = tempfile::tempdir().unwrap();
        let detector = ScriptedDetector::new(vec![Err(DetectorError::InferenceFailed("boom".into()))]);
        let mut rec = recognizer(detector, gallery(&dir));
        assert!(matches!(
            rec.recognize(&two_tone_frame(), 0.5),
            Err(PipelineError::Detector(_))
        ));
    }

    #[test]
    fn test_enroll_uses_highest_confidence_face() {
        let dir = tempfile::tempdir().unwrap();
        let store = gallery(&dir);
        let frame = RgbImage::from_fn(100, 50, |x, _| {
            if x < 50 { image::Rgb([10, 200, 10]) } else { image::Rgb([10, 10, 200]) }
        });
        let detector = ScriptedDetector::new(vec![Ok(vec![
            bbox(0.0, 0.0, 50.0, 50.0, 0.6),
            bbox(50.0, 0.0, 100.0, 50.0, 0.95),
        ])]);
        let mut rec = recognizer(detector, Arc::clone(&store));

        assert!(rec.enroll(&frame, "Blue", false, 0.5).unwrap());
        let snapshot = store.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].embedding.values, vec![10.0, 10.0, 200.0]);
    }

    #[test]
    fn test_enroll_falls_back_to_whole_image() {
        let dir = tempfile::tempdir().unwrap();
        let store = gallery(&dir);
        let headshot = RgbImage::from_fn(40, 40, |x, y| image::Rgb([(x * 5) as u8 + 10, (y * 3) as u8 + 10, 90]));

        // Enrollment sees no detections; the re-query sees the whole image as one box.
        let detector = ScriptedDetector::new(vec![
            Ok(vec![]),
            Ok(vec![bbox(0.0, 0.0, 40.0, 40.0, 0.9)]),
        ]);
        let mut rec = recognizer(detector, Arc::clone(&store));

        assert!(rec.enroll(&headshot, "Dana", true, 0.5).unwrap());
        assert_eq!(store.len(), 1);

        let results = rec.recognize(&headshot, 0.5).unwrap();
        assert_eq!(results[0].identity.name, "Dana");
        assert!((results[0].identity.confidence - 1.0).abs() < 1e-12);
        assert!(results[0].identity.wanted);
    }

    #[test]
    fn test_enroll_falls_back_when_crop_is_empty_or_detector_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = gallery(&dir);
        let image = RgbImage::from_pixel(20, 20, image::Rgb([50, 60, 70]));
        let detector = ScriptedDetector::new(vec![
            Ok(vec![bbox(30.0, 30.0, 40.0, 40.0, 0.9)]),
            Err(DetectorError::InferenceFailed("boom".into())),
        ]);
        let mut rec = recognizer(detector, Arc::clone(&store));

        assert!(rec.enroll(&image, "Eve", false, 0.5).unwrap());
        assert!(rec.enroll(&image, "Eve", false, 0.5).unwrap());
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_enroll_reports_false_when_nothing_embeds() {
        let dir = tempfile::tempdir().unwrap();
        let store = gallery(&dir);
        let black = RgbImage::from_pixel(20, 20, image::Rgb([0, 0, 0]));
        let mut rec = recognizer(ScriptedDetector::new(vec![Ok(vec![])]), Arc::clone(&store));

        assert!(!rec.enroll(&black, "Nobody", false, 0.5).unwrap());
        assert!(store.is_empty());
    }

    #[test]
    fn test_non_finite_embedding_is_treated_as_failure() {
        let dir = tempfile::tempdir().unwrap();
        let store = gallery(&dir);
        store.add_entry("Red", Some(Embedding::new(vec![200.0, 0.0, 0.0])), false).unwrap();

        let detector = ScriptedDetector::new(vec![Ok(vec![bbox(0.0, 0.0, 50.0, 50.0, 0.9)]), Ok(vec![])]);
        let mut rec = Recognizer::new(detector, Box::new(NanEmbedder), CosineMatcher::default(), Arc::clone(&store));

        let results = rec.recognize(&two_tone_frame(), 0.5).unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].embedding.is_none());
        assert_eq!(results[0].identity.name, UNKNOWN_NAME);

        assert!(!rec.enroll(&two_tone_frame(), "Ghost", false, 0.5).unwrap());
        assert_eq!(store.len(), 1);
        assert_eq!(gallery(&dir).len(), 1);
    }

    #[test]
    fn test_set_wanted_then_recognize_reports_wanted() {
        let dir = tempfile::tempdir().unwrap();
        let store = gallery(&dir);
        let face = bbox(0.0, 0.0, 50.0, 50.0, 0.9);
        let detector = ScriptedDetector::new(vec![Ok(vec![face]), Ok(vec![face]), Ok(vec![face])]);
        let mut rec = recognizer(detector, Arc::clone(&store));

        assert!(rec.enroll(&two_tone_frame(), "Alice", false, 0.5).unwrap());
        let before = rec.recognize(&two_tone_frame(), 0.5).unwrap();
        assert_eq!(before[0].identity.name, "Alice");
        assert!(!before[0].identity.wanted);

        assert!(rec.gallery().set_wanted("Alice", true).unwrap());
        let after = rec.recognize(&two_tone_frame(), 0.5).unwrap();
        assert!(after[0].identity.matched);
        assert_eq!(after[0].identity.name, "Alice");
        assert_eq!(after[0].identity.confidence, 1.0);
        assert!(after[0].identity.wanted);
    }

    #[test]
    fn test_best_detection_prefers_earliest_on_tie() {
        let boxes = vec![
            bbox(0.0, 0.0, 1.0, 1.0, 0.8),
            bbox(5.0, 5.0, 6.0, 6.0, 0.8),
            bbox(9.0, 9.0, 10.0, 10.0, 0.3),
        ];
        assert_eq!(best_detection(&boxes).unwrap().x1, 0.0);
        assert!(best_detection(&[]).is_none());
    }

    #[test]
    fn test_decode_image_rejects_garbage() {
        assert!(matches!(decode_image(b"definitely not an image"), Err(PipelineError::Input(_))));
    }
}
