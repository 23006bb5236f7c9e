//! Identity matching: nearest gallery entry by cosine distance.

use crate::gallery::GalleryEntry;
use crate::types::{Embedding, MatchResult};

/// Default acceptance threshold on cosine distance.
pub const DEFAULT_MATCH_THRESHOLD: f64 = 0.4;

/// Strategy for classifying a probe embedding against the enrolled gallery.
pub trait Matcher {
    fn classify(&self, probe: Option<&Embedding>, gallery: &[GalleryEntry]) -> MatchResult;
}

/// Nearest-neighbour matcher on cosine distance with a fixed acceptance threshold.
///
/// Every gallery entry is compared; ties go to the earliest entry. A match is
/// accepted only when the minimum distance is strictly below the threshold.
#[derive(Debug, Clone, Copy)]
pub struct CosineMatcher {
    threshold: f64,
}

impl CosineMatcher {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }
}

impl Default for CosineMatcher {
    fn default() -> Self {
        Self::new(DEFAULT_MATCH_THRESHOLD)
    }
}

impl Matcher for CosineMatcher {
    fn classify(&self, probe: Option<&Embedding>, gallery: &[GalleryEntry]) -> MatchResult {
        let Some(probe) = probe else {
            return MatchResult::unknown();
        };

        let mut best: Option<(usize, f64)> = None;
        for (i, entry) in gallery.iter().enumerate() {
            let distance = probe.cosine_distance(&entry.embedding);
            let is_better = match best {
                None => true,
                Some((_, best_distance)) => distance < best_distance,
            };
            if is_better {
                best = Some((i, distance));
            }
        }

        match best {
            Some((idx, distance)) if distance < self.threshold => {
                let entry = &gallery[idx];
                tracing::trace!(name = %entry.name, distance, "gallery match accepted");
                MatchResult {
                    matched: true,
                    name: entry.name.clone(),
                    confidence: 1.0 - distance,
                    wanted: entry.wanted,
                }
            }
            _ => MatchResult::unknown(),
        }
    }
}
