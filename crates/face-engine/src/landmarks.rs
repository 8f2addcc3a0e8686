//! 68-point facial landmarks: canonical region layout, blob encoding and
//! the best-effort derived measurements stored for downstream analytics.
//! Nothing here is consulted by the matcher.

use anyhow::{bail, Result};
use common::LANDMARK_POINTS;
use image::RgbImage;
use serde::{Deserialize, Serialize};

use crate::image_ops::{mean_luma, to_gray};

/// Index ranges of the nine canonical regions within the 68-point layout.
pub mod regions {
    use std::ops::Range;

    pub const CHIN: Range<usize> = 0..17;
    pub const LEFT_EYEBROW: Range<usize> = 17..22;
    pub const RIGHT_EYEBROW: Range<usize> = 22..27;
    pub const NOSE_BRIDGE: Range<usize> = 27..31;
    pub const NOSE_TIP: Range<usize> = 31..36;
    pub const LEFT_EYE: Range<usize> = 36..42;
    pub const RIGHT_EYE: Range<usize> = 42..48;
    pub const OUTER_LIP: Range<usize> = 48..60;
    pub const INNER_LIP: Range<usize> = 60..68;
}

/// A full 68-point landmark set in crop coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct FaceLandmarks {
    points: [(f32, f32); LANDMARK_POINTS],
}

impl FaceLandmarks {
    pub fn new(points: [(f32, f32); LANDMARK_POINTS]) -> Self {
        Self { points }
    }

    pub fn from_flat(values: &[f32]) -> Option<Self> {
        if values.len() != LANDMARK_POINTS * 2 {
            return None;
        }
        let mut points = [(0.0f32, 0.0f32); LANDMARK_POINTS];
        for (i, pair) in values.chunks_exact(2).enumerate() {
            points[i] = (pair[0], pair[1]);
        }
        Some(Self { points })
    }

    pub fn points(&self) -> &[(f32, f32); LANDMARK_POINTS] {
        &self.points
    }

    pub fn region(&self, range: std::ops::Range<usize>) -> &[(f32, f32)] {
        &self.points[range]
    }

    fn region_center(&self, range: std::ops::Range<usize>) -> (f32, f32) {
        let slice = self.region(range);
        let n = slice.len() as f32;
        let (sx, sy) = slice
            .iter()
            .fold((0.0, 0.0), |(ax, ay), (x, y)| (ax + x, ay + y));
        (sx / n, sy / n)
    }

    /// Encode as a little-endian f32 blob (x, y interleaved).
    pub fn to_blob(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(LANDMARK_POINTS * 8);
        for (x, y) in &self.points {
            out.extend_from_slice(&x.to_le_bytes());
            out.extend_from_slice(&y.to_le_bytes());
        }
        out
    }

    pub fn from_blob(blob: &[u8]) -> Result<Self> {
        if blob.len() != LANDMARK_POINTS * 8 {
            bail!(
                "landmark blob is {} bytes, expected {}",
                blob.len(),
                LANDMARK_POINTS * 8
            );
        }
        let mut points = [(0.0f32, 0.0f32); LANDMARK_POINTS];
        for (i, chunk) in blob.chunks_exact(8).enumerate() {
            let x = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            let y = f32::from_le_bytes([chunk[4], chunk[5], chunk[6], chunk[7]]);
            points[i] = (x, y);
        }
        Ok(Self { points })
    }
}

/// Derived measurements and heuristics for one detection. Every field is
/// best-effort and nullable; consumers must tolerate absence.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FaceAttributes {
    /// Distance between the two eye centers, in crop pixels.
    pub eye_distance: Option<f32>,

    /// Width of the nose at the nostril line.
    pub nose_width: Option<f32>,

    /// Bridge-to-tip nose length.
    pub nose_height: Option<f32>,

    /// Jaw width at the chin contour's widest span.
    pub jaw_width: Option<f32>,

    /// Dark-band heuristic across the eye line.
    pub has_glasses: Option<bool>,

    /// Lower-face darkness heuristic.
    pub has_facial_hair: Option<bool>,
}

/// Compute measurements from landmarks plus image heuristics. Uncalibrated
/// by design; stored but never used for matching.
pub fn derive_attributes(crop: &RgbImage, landmarks: &FaceLandmarks) -> FaceAttributes {
    let left_eye = landmarks.region_center(regions::LEFT_EYE);
    let right_eye = landmarks.region_center(regions::RIGHT_EYE);
    let eye_distance = distance(left_eye, right_eye);

    let nose_tip = landmarks.region(regions::NOSE_TIP);
    let nose_width = span(nose_tip.iter().map(|p| p.0));
    let bridge = landmarks.region(regions::NOSE_BRIDGE);
    let nose_height = bridge
        .first()
        .zip(nose_tip.get(2))
        .map(|(top, tip)| distance(*top, *tip));

    let chin = landmarks.region(regions::CHIN);
    let jaw_width = span(chin.iter().map(|p| p.0));

    FaceAttributes {
        eye_distance: Some(eye_distance),
        nose_width,
        nose_height,
        jaw_width,
        has_glasses: glasses_heuristic(crop, left_eye, right_eye, eye_distance),
        has_facial_hair: facial_hair_heuristic(crop),
    }
}

fn distance(a: (f32, f32), b: (f32, f32)) -> f32 {
    let dx = a.0 - b.0;
    let dy = a.1 - b.1;
    (dx * dx + dy * dy).sqrt()
}

fn span(xs: impl Iterator<Item = f32>) -> Option<f32> {
    let values: Vec<f32> = xs.collect();
    if values.is_empty() {
        return None;
    }
    let min = values.iter().copied().fold(f32::INFINITY, f32::min);
    let max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    Some(max - min)
}

/// A band across the eye line markedly darker than the cheeks below hints
/// at frames or tinted lenses.
fn glasses_heuristic(
    crop: &RgbImage,
    left_eye: (f32, f32),
    right_eye: (f32, f32),
    eye_distance: f32,
) -> Option<bool> {
    let (width, height) = crop.dimensions();
    if width == 0 || height == 0 || eye_distance < 4.0 {
        return None;
    }

    let gray = to_gray(crop);
    let eye_y = ((left_eye.1 + right_eye.1) / 2.0).max(0.0) as u32;
    let band = (eye_distance * 0.25).max(2.0) as u32;

    let y0 = eye_y.saturating_sub(band / 2);
    let y1 = (eye_y + band / 2 + 1).min(height);
    let cheek_y0 = y1.min(height);
    let cheek_y1 = (cheek_y0 + band).min(height);
    if cheek_y0 >= cheek_y1 || y0 >= y1 {
        return None;
    }

    let eye_band = mean_luma(&gray, 0, y0, width, y1);
    let cheek_band = mean_luma(&gray, 0, cheek_y0, width, cheek_y1);
    if cheek_band <= 0.0 {
        return None;
    }
    Some(eye_band < cheek_band * 0.72)
}

/// The lower third of a bearded face is darker than the mid-face.
fn facial_hair_heuristic(crop: &RgbImage) -> Option<bool> {
    let (width, height) = crop.dimensions();
    if width < 8 || height < 8 {
        return None;
    }

    let gray = to_gray(crop);
    let mid = mean_luma(&gray, width / 4, height * 2 / 5, width * 3 / 4, height * 3 / 5);
    let lower = mean_luma(&gray, width / 4, height * 7 / 10, width * 3 / 4, height);
    if mid <= 0.0 {
        return None;
    }
    Some(lower < mid * 0.70)
}
