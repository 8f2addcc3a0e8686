//! Cascaded face detection.
//!
//! The cascade tries backends in a fixed order on the original image and
//! returns the first non-empty result. Only when every backend comes up
//! empty does it spend time on enhancement variants, rerunning the whole
//! cascade on each. The fast classical backends therefore carry the common
//! case and the neural backends recover the hard ones (occlusion,
//! sunglasses, extreme lighting).

pub mod dnn;
pub mod haar;
pub mod hog;
pub mod mtcnn;
pub mod static_backend;

use anyhow::Result;
use common::{BoundingBox, CoreConfig, DetectionBox};
use image::RgbImage;
use tracing::{debug, warn};

use crate::image_ops::{enhance, Enhancement};
pub use dnn::DnnDetector;
pub use haar::HaarDetector;
pub use hog::HogDetector;
pub use mtcnn::MtcnnDetector;
pub use static_backend::StaticDetector;

/// One detection backend. A closed sum, not a trait object: the set of
/// algorithms is fixed and each carries its own tuning.
pub enum DetectorBackend {
    Haar(HaarDetector),
    Hog(HogDetector),
    Dnn(DnnDetector),
    Mtcnn(MtcnnDetector),
    /// Scripted backend returning preconfigured boxes; the test and
    /// bring-up stand-in.
    Static(StaticDetector),
}

impl DetectorBackend {
    pub fn name(&self) -> &'static str {
        match self {
            DetectorBackend::Haar(_) => "haar",
            DetectorBackend::Hog(_) => "hog",
            DetectorBackend::Dnn(_) => "dnn",
            DetectorBackend::Mtcnn(_) => "mtcnn",
            DetectorBackend::Static(_) => "static",
        }
    }

    async fn detect(&self, image: &RgbImage) -> Result<Vec<DetectionBox>> {
        match self {
            DetectorBackend::Haar(d) => d.detect(image),
            DetectorBackend::Hog(d) => d.detect(image),
            DetectorBackend::Dnn(d) => d.detect(image).await,
            DetectorBackend::Mtcnn(d) => d.detect(image).await,
            DetectorBackend::Static(d) => d.detect(image),
        }
    }
}

/// The full cascade: ordered backends plus the enhancement fallback list.
pub struct FaceDetector {
    backends: Vec<DetectorBackend>,
}

impl FaceDetector {
    /// Build the production cascade from configuration. Classical backends
    /// are always present; the neural backends join when their models are
    /// configured and load.
    pub fn from_config(config: &CoreConfig) -> Self {
        let mut backends = vec![
            DetectorBackend::Haar(HaarDetector::new()),
            DetectorBackend::Hog(HogDetector::new()),
        ];

        if let Some(path) = &config.models.dnn_detector {
            match DnnDetector::load(path, config.dnn_confidence) {
                Ok(d) => backends.push(DetectorBackend::Dnn(d)),
                Err(e) => warn!(model = %path, error = %e, "ssd detector unavailable"),
            }
        }

        if let (Some(pnet), Some(rnet), Some(onet)) = (
            &config.models.mtcnn_pnet,
            &config.models.mtcnn_rnet,
            &config.models.mtcnn_onet,
        ) {
            match MtcnnDetector::load(
                pnet,
                rnet,
                onet,
                config.mtcnn_min_face,
                config.mtcnn_thresholds,
                config.mtcnn_scale,
            ) {
                Ok(d) => backends.push(DetectorBackend::Mtcnn(d)),
                Err(e) => warn!(error = %e, "multi-stage detector unavailable"),
            }
        }

        Self { backends }
    }

    /// Build a cascade from an explicit backend list (tests, bring-up).
    pub fn with_backends(backends: Vec<DetectorBackend>) -> Self {
        Self { backends }
    }

    pub fn backend_names(&self) -> Vec<&'static str> {
        self.backends.iter().map(|b| b.name()).collect()
    }

    /// Locate faces. Never fails: a backend error is logged and treated as
    /// an empty result, and an image nothing can find a face in yields an
    /// empty list.
    pub async fn detect(&self, image: &RgbImage) -> Vec<DetectionBox> {
        let found = self.run_cascade(image, "original").await;
        if !found.is_empty() {
            return found;
        }

        for enhancement in Enhancement::ALL {
            let variant = enhance(image, enhancement);
            let found = self.run_cascade(&variant, enhancement.as_str()).await;
            if !found.is_empty() {
                debug!(
                    variant = enhancement.as_str(),
                    faces = found.len(),
                    "enhancement variant recovered faces"
                );
                return found;
            }
        }

        Vec::new()
    }

    async fn run_cascade(&self, image: &RgbImage, variant: &str) -> Vec<DetectionBox> {
        for backend in &self.backends {
            match backend.detect(image).await {
                Ok(raw) if !raw.is_empty() => {
                    let filtered = filter_boxes(raw, image.width(), image.height());
                    if !filtered.is_empty() {
                        debug!(
                            backend = backend.name(),
                            variant = variant,
                            faces = filtered.len(),
                            "cascade hit"
                        );
                        return filtered;
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(
                        backend = backend.name(),
                        variant = variant,
                        error = %e,
                        "detector backend failed, continuing cascade"
                    );
                }
            }
        }
        Vec::new()
    }
}

/// Clamp every box to image bounds and drop anything degenerate.
fn filter_boxes(boxes: Vec<DetectionBox>, width: u32, height: u32) -> Vec<DetectionBox> {
    boxes
        .into_iter()
        .filter_map(|mut d| {
            let clamped = d.bbox.clamped(width, height)?;
            d.bbox = clamped;
            d.confidence = d.confidence.clamp(0.0, 1.0);
            Some(d)
        })
        .collect()
}

/// Greedy non-maximum suppression shared by the backends.
pub(crate) fn non_max_suppression(
    mut boxes: Vec<(BoundingBox, f32)>,
    iou_threshold: f32,
) -> Vec<(BoundingBox, f32)> {
    boxes.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    let mut keep: Vec<(BoundingBox, f32)> = Vec::new();
    for candidate in boxes {
        if keep.iter().all(|k| k.0.iou(&candidate.0) < iou_threshold) {
            keep.push(candidate);
        }
    }
    keep
}
