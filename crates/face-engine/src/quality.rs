//! Face-crop quality scoring.
//!
//! Three subscores in [0, 1] and their fixed blend. Quality gates both
//! live-capture acceptance and embedding eviction, so the formulas here
//! are contract, not tuning.

use common::QualityScores;
use image::RgbImage;
use imageproc::filter::laplacian_filter;

use crate::image_ops::to_gray;

/// Laplacian variance at which a crop counts as perfectly sharp.
const BLUR_VARIANCE_CEILING: f64 = 500.0;

/// Short side (px) at and below which size scores zero.
const SIZE_FLOOR_PX: f32 = 80.0;

/// Short side (px) at and above which size scores one.
const SIZE_CEILING_PX: f32 = 200.0;

pub struct QualityScorer;

impl Default for QualityScorer {
    fn default() -> Self {
        Self::new()
    }
}

impl QualityScorer {
    pub fn new() -> Self {
        Self
    }

    /// Score one face crop.
    pub fn score(&self, crop: &RgbImage) -> QualityScores {
        let (width, height) = crop.dimensions();
        if width == 0 || height == 0 {
            return QualityScores::blend(0.0, 0.0, 0.0);
        }

        let gray = to_gray(crop);
        QualityScores::blend(
            blur_score(&gray),
            lighting_score(&gray),
            size_score(width, height),
        )
    }
}

/// Variance of the Laplacian response, mapped to [0, 1].
fn blur_score(gray: &image::GrayImage) -> f32 {
    let response = laplacian_filter(gray);
    let n = (response.width() as f64) * (response.height() as f64);
    if n == 0.0 {
        return 0.0;
    }

    let mut sum = 0.0f64;
    for p in response.pixels() {
        sum += p.0[0] as f64;
    }
    let mean = sum / n;

    let mut var = 0.0f64;
    for p in response.pixels() {
        let d = p.0[0] as f64 - mean;
        var += d * d;
    }
    var /= n;

    ((var / BLUR_VARIANCE_CEILING).min(1.0)) as f32
}

/// Entropy of the 256-bin luma histogram over the 8-bit maximum.
fn lighting_score(gray: &image::GrayImage) -> f32 {
    let total = (gray.width() as f64) * (gray.height() as f64);
    if total == 0.0 {
        return 0.0;
    }

    let mut hist = [0u64; 256];
    for p in gray.pixels() {
        hist[p.0[0] as usize] += 1;
    }

    let mut entropy = 0.0f64;
    for count in hist {
        if count == 0 {
            continue;
        }
        let p = count as f64 / total;
        entropy -= p * p.log2();
    }

    ((entropy / 8.0).clamp(0.0, 1.0)) as f32
}

/// Piecewise-linear score of the crop's short side.
fn size_score(width: u32, height: u32) -> f32 {
    let short = width.min(height) as f32;
    if short <= SIZE_FLOOR_PX {
        0.0
    } else if short >= SIZE_CEILING_PX {
        1.0
    } else {
        (short - SIZE_FLOOR_PX) / (SIZE_CEILING_PX - SIZE_FLOOR_PX)
    }
}
