//! Discrete yaw classification.
//!
//! With landmarks available the classifier is geometric: the nose tip's
//! horizontal offset from the eye midpoint, as a fraction of the
//! inter-eye distance. Without landmarks it falls back to comparing the
//! mean luminance of the two crop halves. The function is total: every
//! path, including internal failure, produces one of the five labels.

use common::{FaceAngle, FivePointLandmarks};
use image::RgbImage;

use crate::image_ops::{mean_luma, to_gray};

/// |dx| at or below this is frontal.
const FRONTAL_LIMIT: f32 = 0.15;

/// |dx| at or below this (but above frontal) is a 45-degree turn.
const HALF_PROFILE_LIMIT: f32 = 0.40;

/// Luminance imbalance required before the fallback calls a profile.
const LUMA_IMBALANCE: f32 = 0.15;

pub struct PoseEstimator;

impl Default for PoseEstimator {
    fn default() -> Self {
        Self::new()
    }
}

impl PoseEstimator {
    pub fn new() -> Self {
        Self
    }

    /// Classify a face crop's yaw.
    pub fn estimate(&self, crop: &RgbImage, landmarks: Option<&FivePointLandmarks>) -> FaceAngle {
        if let Some(points) = landmarks {
            if let Some(angle) = classify_from_landmarks(points) {
                return angle;
            }
        }
        classify_from_luminance(crop)
    }
}

/// Geometric classification. `None` when the landmark layout is unusable
/// (coincident eyes), which sends the caller to the luminance fallback.
fn classify_from_landmarks(points: &FivePointLandmarks) -> Option<FaceAngle> {
    let (lx, ly) = points.left_eye;
    let (rx, ry) = points.right_eye;
    let eye_dx = rx - lx;
    let eye_dy = ry - ly;
    let eye_distance = (eye_dx * eye_dx + eye_dy * eye_dy).sqrt();
    if !eye_distance.is_finite() || eye_distance < 1.0 {
        return None;
    }

    let mid_x = (lx + rx) / 2.0;
    let dx = (points.nose.0 - mid_x) / eye_distance;
    if !dx.is_finite() {
        return None;
    }

    let angle = if dx.abs() <= FRONTAL_LIMIT {
        FaceAngle::Frontal
    } else if dx.abs() <= HALF_PROFILE_LIMIT {
        if dx < 0.0 {
            FaceAngle::Left45
        } else {
            FaceAngle::Right45
        }
    } else if dx < 0.0 {
        FaceAngle::Left90
    } else {
        FaceAngle::Right90
    };
    Some(angle)
}

/// Landmark-free fallback: a markedly brighter half means the face is lit
/// from that side and turned toward it; call it a 45-degree profile.
fn classify_from_luminance(crop: &RgbImage) -> FaceAngle {
    let (width, height) = crop.dimensions();
    if width < 2 || height < 1 {
        return FaceAngle::Frontal;
    }

    let gray = to_gray(crop);
    let mid = width / 2;
    let left = mean_luma(&gray, 0, 0, mid, height);
    let right = mean_luma(&gray, mid, 0, width, height);
    let brightest = left.max(right);
    if brightest <= 0.0 {
        return FaceAngle::Frontal;
    }

    if (left - right) / brightest > LUMA_IMBALANCE {
        FaceAngle::Left45
    } else if (right - left) / brightest > LUMA_IMBALANCE {
        FaceAngle::Right45
    } else {
        FaceAngle::Frontal
    }
}
