use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Per-stored-angle weights applied by the matcher. Frontal evidence must
/// always outweigh profile evidence.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AngleWeights {
    /// Weight for frontal embeddings.
    #[serde(default = "default_weight_frontal")]
    pub frontal: f32,

    /// Weight for left_45 / right_45 embeddings.
    #[serde(default = "default_weight_half")]
    pub half_profile: f32,

    /// Weight for left_90 / right_90 embeddings.
    #[serde(default = "default_weight_full")]
    pub full_profile: f32,
}

fn default_weight_frontal() -> f32 {
    1.0
}

fn default_weight_half() -> f32 {
    0.8
}

fn default_weight_full() -> f32 {
    0.6
}

impl Default for AngleWeights {
    fn default() -> Self {
        Self {
            frontal: default_weight_frontal(),
            half_profile: default_weight_half(),
            full_profile: default_weight_full(),
        }
    }
}

impl AngleWeights {
    pub fn for_angle(&self, angle: crate::types::FaceAngle) -> f32 {
        use crate::types::FaceAngle;
        match angle {
            FaceAngle::Frontal => self.frontal,
            FaceAngle::Left45 | FaceAngle::Right45 => self.half_profile,
            FaceAngle::Left90 | FaceAngle::Right90 => self.full_profile,
        }
    }
}

/// Paths to the ONNX models the engine can load. Every path is optional;
/// a backend whose model is absent is skipped by the cascade and the
/// extractor falls back to its deterministic signature backend.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelPaths {
    /// SSD face detection model (single session).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dnn_detector: Option<String>,

    /// Multi-stage detector proposal network.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mtcnn_pnet: Option<String>,

    /// Multi-stage detector refinement network.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mtcnn_rnet: Option<String>,

    /// Multi-stage detector output network.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mtcnn_onet: Option<String>,

    /// 128-D identity embedding network.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<String>,

    /// 68-point landmark network.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub landmarks: Option<String>,
}

/// Recognized configuration of the core. Anything not listed here is not
/// configurable; there are no environment variables beyond the logging
/// filter and no persisted state beyond the repository and blob namespace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Match-distance threshold tau. A candidate matches iff its distance
    /// is at or below this value.
    #[serde(default = "default_match_threshold")]
    pub match_threshold: f32,

    /// Minimum overall quality a live-scan frame must reach to complete
    /// the capture early.
    #[serde(default = "default_min_live_quality")]
    pub min_live_quality: f32,

    /// Capacity K of the per-person multi-angle embedding set.
    #[serde(default = "default_max_angles_per_person")]
    pub max_angles_per_person: usize,

    /// Upload size boundary in bytes.
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: u64,

    /// Accepted upload file extensions, lowercase, no dot.
    #[serde(default = "default_allowed_extensions")]
    pub allowed_extensions: Vec<String>,

    /// Matcher snapshot lifetime in seconds.
    #[serde(default = "default_cache_ttl_seconds")]
    pub cache_ttl_seconds: u64,

    /// Minimum face size in pixels for the multi-stage detector.
    #[serde(default = "default_mtcnn_min_face")]
    pub mtcnn_min_face: u32,

    /// Per-stage score thresholds for the multi-stage detector.
    #[serde(default = "default_mtcnn_thresholds")]
    pub mtcnn_thresholds: [f32; 3],

    /// Image pyramid scale factor for the multi-stage detector.
    #[serde(default = "default_mtcnn_scale")]
    pub mtcnn_scale: f32,

    /// Confidence threshold for the SSD detector.
    #[serde(default = "default_dnn_confidence")]
    pub dnn_confidence: f32,

    /// Matcher angle weights.
    #[serde(default)]
    pub angle_weights: AngleWeights,

    /// Live capture timeout in seconds.
    #[serde(default = "default_scan_timeout_secs")]
    pub scan_timeout_secs: u64,

    /// Run detection on every Nth live frame.
    #[serde(default = "default_scan_frame_interval")]
    pub scan_frame_interval: u32,

    /// ONNX model locations.
    #[serde(default)]
    pub models: ModelPaths,
}

fn default_match_threshold() -> f32 {
    0.60
}

fn default_min_live_quality() -> f32 {
    0.50
}

fn default_max_angles_per_person() -> usize {
    5
}

fn default_max_upload_bytes() -> u64 {
    16 * 1024 * 1024
}

fn default_allowed_extensions() -> Vec<String> {
    ["jpg", "jpeg", "png", "gif", "bmp"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_cache_ttl_seconds() -> u64 {
    300
}

fn default_mtcnn_min_face() -> u32 {
    20
}

fn default_mtcnn_thresholds() -> [f32; 3] {
    [0.60, 0.70, 0.70]
}

fn default_mtcnn_scale() -> f32 {
    0.709
}

fn default_dnn_confidence() -> f32 {
    0.30
}

fn default_scan_timeout_secs() -> u64 {
    30
}

fn default_scan_frame_interval() -> u32 {
    5
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            match_threshold: default_match_threshold(),
            min_live_quality: default_min_live_quality(),
            max_angles_per_person: default_max_angles_per_person(),
            max_upload_bytes: default_max_upload_bytes(),
            allowed_extensions: default_allowed_extensions(),
            cache_ttl_seconds: default_cache_ttl_seconds(),
            mtcnn_min_face: default_mtcnn_min_face(),
            mtcnn_thresholds: default_mtcnn_thresholds(),
            mtcnn_scale: default_mtcnn_scale(),
            dnn_confidence: default_dnn_confidence(),
            angle_weights: AngleWeights::default(),
            scan_timeout_secs: default_scan_timeout_secs(),
            scan_frame_interval: default_scan_frame_interval(),
            models: ModelPaths::default(),
        }
    }
}

impl CoreConfig {
    /// Load from a JSON file; absent keys take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {:?}", path))?;
        let config: CoreConfig =
            serde_json::from_str(&raw).context("failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    /// Sanity-check ranges that would silently break matching or eviction.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.match_threshold > 0.0,
            "match_threshold must be positive"
        );
        anyhow::ensure!(
            (0.0..=1.0).contains(&self.min_live_quality),
            "min_live_quality must be in [0, 1]"
        );
        anyhow::ensure!(
            self.max_angles_per_person >= 1,
            "max_angles_per_person must be at least 1"
        );
        anyhow::ensure!(
            self.angle_weights.frontal > self.angle_weights.half_profile
                && self.angle_weights.half_profile > self.angle_weights.full_profile,
            "angle weights must strictly decrease from frontal to full profile"
        );
        anyhow::ensure!(
            self.scan_frame_interval >= 1,
            "scan_frame_interval must be at least 1"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FaceAngle;

    #[test]
    fn defaults_match_documented_values() {
        let config = CoreConfig::default();
        assert_eq!(config.match_threshold, 0.60);
        assert_eq!(config.min_live_quality, 0.50);
        assert_eq!(config.max_angles_per_person, 5);
        assert_eq!(config.max_upload_bytes, 16 * 1024 * 1024);
        assert_eq!(config.cache_ttl_seconds, 300);
        assert_eq!(config.mtcnn_min_face, 20);
        assert_eq!(config.mtcnn_thresholds, [0.60, 0.70, 0.70]);
        assert_eq!(config.mtcnn_scale, 0.709);
        assert_eq!(config.dnn_confidence, 0.30);
        assert_eq!(config.scan_timeout_secs, 30);
        assert_eq!(config.scan_frame_interval, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn angle_weights_lookup() {
        let weights = AngleWeights::default();
        assert_eq!(weights.for_angle(FaceAngle::Frontal), 1.0);
        assert_eq!(weights.for_angle(FaceAngle::Left45), 0.8);
        assert_eq!(weights.for_angle(FaceAngle::Right45), 0.8);
        assert_eq!(weights.for_angle(FaceAngle::Left90), 0.6);
        assert_eq!(weights.for_angle(FaceAngle::Right90), 0.6);
    }

    #[test]
    fn partial_json_takes_defaults() {
        let config: CoreConfig = serde_json::from_str(r#"{"match_threshold": 0.5}"#).unwrap();
        assert_eq!(config.match_threshold, 0.5);
        assert_eq!(config.cache_ttl_seconds, 300);
        assert_eq!(config.allowed_extensions.len(), 5);
    }

    #[test]
    fn validate_rejects_inverted_weights() {
        let mut config = CoreConfig::default();
        config.angle_weights.frontal = 0.5;
        assert!(config.validate().is_err());
    }
}
