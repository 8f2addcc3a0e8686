//! Face perception engine: cascaded detection, pose classification,
//! quality scoring and identity feature extraction.

pub mod detector;
pub mod extract;
pub mod image_ops;
pub mod landmarks;
pub mod pose;
pub mod quality;

use common::CoreConfig;

pub use detector::{DetectorBackend, FaceDetector, StaticDetector};
pub use extract::{FaceFeatures, FeatureExtractor, MIN_FACE_PX};
pub use landmarks::{FaceAttributes, FaceLandmarks};
pub use pose::PoseEstimator;
pub use quality::QualityScorer;

/// The four perception components bundled for the orchestrator. One
/// engine instance serializes inference per model internally, so sharing
/// it across photo tasks is safe; running two extractions of the *same*
/// photo concurrently is not required or supported.
pub struct FaceEngine {
    pub detector: FaceDetector,
    pub pose: PoseEstimator,
    pub quality: QualityScorer,
    pub extractor: FeatureExtractor,
}

impl FaceEngine {
    /// Production engine per configuration.
    pub fn from_config(config: &CoreConfig) -> Self {
        Self {
            detector: FaceDetector::from_config(config),
            pose: PoseEstimator::new(),
            quality: QualityScorer::new(),
            extractor: FeatureExtractor::from_config(config),
        }
    }

    /// Deterministic engine for tests and bring-up: a scripted detector
    /// plus the signature extractor.
    pub fn scripted(detector: FaceDetector) -> Self {
        Self {
            detector,
            pose: PoseEstimator::new(),
            quality: QualityScorer::new(),
            extractor: FeatureExtractor::signature(),
        }
    }
}
