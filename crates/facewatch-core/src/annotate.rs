//! Overlay rendering for recognition results.
//!
//! [`annotations`] is the pure mapping from results to rectangles, colors and
//! labels; [`draw_results`] renders that mapping onto a copy of the frame.

use crate::types::{DetectionResult, PixelRect, UNKNOWN_NAME};
use ab_glyph::{FontVec, PxScale};
use image::codecs::jpeg::JpegEncoder;
use image::{ImageError, Rgb, RgbImage};
use imageproc::drawing::{draw_hollow_rect_mut, draw_text_mut};
use imageproc::rect::Rect;
use std::path::Path;
use thiserror::Error;

pub const UNKNOWN_COLOR: Rgb<u8> = Rgb([255, 255, 0]);
pub const RECOGNIZED_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
pub const WANTED_COLOR: Rgb<u8> = Rgb([255, 0, 0]);

const BOX_THICKNESS: u32 = 2;
const LABEL_OFFSET: u32 = 10;
const LABEL_SCALE: f32 = 18.0;

#[derive(Error, Debug)]
pub enum FontError {
    #[error("failed to read font {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid font {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Annotation {
    pub rect: PixelRect,
    pub color: Rgb<u8>,
    pub label: String,
}

pub fn label_for(result: &DetectionResult) -> String {
    let identity = &result.identity;
    if !identity.matched {
        return UNKNOWN_NAME.to_string();
    }
    if identity.wanted {
        format!("{} ({:.2}) [WANTED]", identity.name, identity.confidence)
    } else {
        format!("{} ({:.2})", identity.name, identity.confidence)
    }
}

pub fn color_for(result: &DetectionResult) -> Rgb<u8> {
    match (result.identity.matched, result.identity.wanted) {
        (false, _) => UNKNOWN_COLOR,
        (true, false) => RECOGNIZED_COLOR,
        (true, true) => WANTED_COLOR,
    }
}

/// One annotation per result, in result order, with boxes clamped to the frame.
pub fn annotations(width: u32, height: u32, results: &[DetectionResult]) -> Vec<Annotation> {
    results
        .iter()
        .map(|result| Annotation {
            rect: result.bbox.clamp_to(width, height),
            color: color_for(result),
            label: label_for(result),
        })
        .collect()
}

/// Draw boxes (and labels, when a font is given) on a copy of `frame`.
pub fn draw_results(frame: &RgbImage, results: &[DetectionResult], font: Option<&FontVec>) -> RgbImage {
    let mut canvas = frame.clone();
    for annotation in annotations(frame.width(), frame.height(), results) {
        let rect = annotation.rect;
        for inset in 0..BOX_THICKNESS {
            let w = rect.width().saturating_sub(2 * inset).max(1);
            let h = rect.height().saturating_sub(2 * inset).max(1);
            let outline = Rect::at((rect.x1 + inset) as i32, (rect.y1 + inset) as i32).of_size(w, h);
            draw_hollow_rect_mut(&mut canvas, outline, annotation.color);
        }

        if let Some(font) = font {
            let y = rect.y1.saturating_sub(LABEL_OFFSET) as i32;
            draw_text_mut(
                &mut canvas,
                annotation.color,
                rect.x1 as i32,
                y,
                PxScale::from(LABEL_SCALE),
                font,
                &annotation.label,
            );
        }
    }
    canvas
}

pub fn load_font(path: &Path) -> Result<FontVec, FontError> {
    let bytes = std::fs::read(path).map_err(|source| FontError::Read {
        path: path.display().to_string(),
        source,
    })?;
    FontVec::try_from_vec(bytes).map_err(|_| FontError::Invalid(path.display().to_string()))
}

pub fn encode_jpeg(frame: &RgbImage, quality: u8) -> Result<Vec<u8>, ImageError> {
    let mut buf = Vec::new();
    JpegEncoder::new_with_quality(&mut buf, quality).encode_image(frame)?;
    Ok(buf)
}
