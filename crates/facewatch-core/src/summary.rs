use crate::types::DetectionResult;
use serde::Serialize;
use std::collections::BTreeMap;

pub const DEFAULT_VIDEO_COUNT_EVERY: u32 = 5;

/// Per-name recognition counts over a frame sequence.
///
/// Every frame advances `total_frames`, but only every `count_every`-th frame
/// (starting with the first) contributes to the counts. Unknown faces never count.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VideoSummary {
    pub total_frames: u64,
    pub recognized_faces: BTreeMap<String, u64>,
    pub total_recognized: u64,
    #[serde(skip)]
    count_every: u32,
}

impl VideoSummary {
    pub fn new(count_every: u32) -> Self {
        Self {
            total_frames: 0,
            recognized_faces: BTreeMap::new(),
            total_recognized: 0,
            count_every: count_every.max(1),
        }
    }

    /// Record one frame's results; returns whether the frame was counted.
    pub fn record(&mut self, results: &[DetectionResult]) -> bool {
        let index = self.total_frames;
        self.total_frames += 1;
        if index % u64::from(self.count_every) != 0 {
            return false;
        }

        for result in results.iter().filter(|r| r.identity.matched) {
            *self.recognized_faces.entry(result.identity.name.clone()).or_insert(0) += 1;
            self.total_recognized += 1;
        }
        true
    }
}

impl Default for VideoSummary {
    fn default() -> Self {
        Self::new(DEFAULT_VIDEO_COUNT_EVERY)
    }
}
