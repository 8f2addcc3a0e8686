//! Shared contracts for the face-identity pipeline.
//!
//! These types travel between the detection engine, the identity store and
//! the matcher, so they live in one place with stable serde names.

use serde::{Deserialize, Serialize};

/// Dimensionality of every identity embedding produced by the engine.
pub const EMBEDDING_DIM: usize = 128;

/// Number of landmark points in the canonical face layout.
pub const LANDMARK_POINTS: usize = 68;

/// Discrete yaw classification for a detected face.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaceAngle {
    Frontal,
    Left45,
    Right45,
    Left90,
    Right90,
}

impl FaceAngle {
    pub const ALL: [FaceAngle; 5] = [
        FaceAngle::Frontal,
        FaceAngle::Left45,
        FaceAngle::Right45,
        FaceAngle::Left90,
        FaceAngle::Right90,
    ];

    /// Stable storage name (matches the serde rename).
    pub fn as_str(&self) -> &'static str {
        match self {
            FaceAngle::Frontal => "frontal",
            FaceAngle::Left45 => "left_45",
            FaceAngle::Right45 => "right_45",
            FaceAngle::Left90 => "left_90",
            FaceAngle::Right90 => "right_90",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "frontal" => Some(FaceAngle::Frontal),
            "left_45" => Some(FaceAngle::Left45),
            "right_45" => Some(FaceAngle::Right45),
            "left_90" => Some(FaceAngle::Left90),
            "right_90" => Some(FaceAngle::Right90),
            _ => None,
        }
    }

    /// Whether this is one of the two full-profile labels.
    pub fn is_profile(&self) -> bool {
        matches!(self, FaceAngle::Left90 | FaceAngle::Right90)
    }
}

impl std::fmt::Display for FaceAngle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which detection backend produced a face box.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectorKind {
    Mtcnn,
    Dnn,
    Haar,
    Hog,
}

impl DetectorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DetectorKind::Mtcnn => "mtcnn",
            DetectorKind::Dnn => "dnn",
            DetectorKind::Haar => "haar",
            DetectorKind::Hog => "hog",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "mtcnn" => Some(DetectorKind::Mtcnn),
            "dnn" => Some(DetectorKind::Dnn),
            "haar" => Some(DetectorKind::Haar),
            "hog" => Some(DetectorKind::Hog),
            _ => None,
        }
    }
}

impl std::fmt::Display for DetectorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Axis-aligned box in image pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl BoundingBox {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Shorter of the two sides, the quantity quality scoring cares about.
    pub fn short_side(&self) -> u32 {
        self.width.min(self.height)
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Clamp the box to an image of the given dimensions. Returns `None`
    /// when nothing usable remains (zero width or height after clamping).
    pub fn clamped(&self, image_width: u32, image_height: u32) -> Option<BoundingBox> {
        if self.x >= image_width || self.y >= image_height {
            return None;
        }
        let width = self.width.min(image_width - self.x);
        let height = self.height.min(image_height - self.y);
        if width == 0 || height == 0 {
            return None;
        }
        Some(BoundingBox {
            x: self.x,
            y: self.y,
            width,
            height,
        })
    }

    /// Intersection-over-union with another box.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.width).min(other.x + other.width);
        let y2 = (self.y + self.height).min(other.y + other.height);

        let intersection = if x2 > x1 && y2 > y1 {
            (x2 - x1) as f32 * (y2 - y1) as f32
        } else {
            0.0
        };

        let union = self.area() as f32 + other.area() as f32 - intersection;
        if union > 0.0 {
            intersection / union
        } else {
            0.0
        }
    }
}

/// Five-point landmark set emitted by the multi-stage detector
/// (left eye, right eye, nose, left mouth corner, right mouth corner).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FivePointLandmarks {
    pub left_eye: (f32, f32),
    pub right_eye: (f32, f32),
    pub nose: (f32, f32),
    pub mouth_left: (f32, f32),
    pub mouth_right: (f32, f32),
}

/// One face located by a detection backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionBox {
    /// Box in full-image coordinates, already clamped to image bounds.
    pub bbox: BoundingBox,

    /// Backend that produced the box.
    pub detector: DetectorKind,

    /// Detection confidence in [0, 1]. Classical backends report a fixed
    /// synthetic value.
    pub confidence: f32,

    /// Coarse landmarks when the backend provides them.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub landmarks: Option<FivePointLandmarks>,
}

/// Per-crop quality subscores, each in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualityScores {
    pub blur: f32,
    pub lighting: f32,
    pub size: f32,
    pub overall: f32,
}

impl QualityScores {
    /// Weighted blend used everywhere a single quality number is needed.
    pub fn blend(blur: f32, lighting: f32, size: f32) -> Self {
        let blur = blur.clamp(0.0, 1.0);
        let lighting = lighting.clamp(0.0, 1.0);
        let size = size.clamp(0.0, 1.0);
        Self {
            blur,
            lighting,
            size,
            overall: 0.4 * blur + 0.3 * lighting + 0.3 * size,
        }
    }
}

/// Fixed-length identity embedding with explicit binary serialization.
///
/// Carried as a plain f32 array; persisted as a little-endian blob. There
/// are no hidden copies: callers hand slices around and the store owns the
/// only encoded form.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingVector([f32; EMBEDDING_DIM]);

impl EmbeddingVector {
    /// Build from a slice, enforcing the dimensionality and finiteness
    /// contract.
    pub fn from_slice(values: &[f32]) -> Result<Self, EmbeddingShapeError> {
        if values.len() != EMBEDDING_DIM {
            return Err(EmbeddingShapeError::WrongLength(values.len()));
        }
        if values.iter().any(|v| !v.is_finite()) {
            return Err(EmbeddingShapeError::NonFinite);
        }
        let mut data = [0.0f32; EMBEDDING_DIM];
        data.copy_from_slice(values);
        Ok(Self(data))
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    /// Euclidean distance to another embedding. Accumulates in f64 so the
    /// threshold comparison at the match boundary is stable.
    pub fn distance(&self, other: &EmbeddingVector) -> f32 {
        let sum: f64 = self
            .0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| {
                let d = (*a - *b) as f64;
                d * d
            })
            .sum();
        sum.sqrt() as f32
    }

    /// L2-normalize in place. A zero vector is left untouched.
    pub fn l2_normalize(&mut self) {
        let norm: f64 = self.0.iter().map(|v| (*v as f64) * (*v as f64)).sum();
        let norm = norm.sqrt();
        if norm > 0.0 {
            for v in &mut self.0 {
                *v = (*v as f64 / norm) as f32;
            }
        }
    }

    /// Encode as a little-endian f32 blob for the embeddings table.
    pub fn to_blob(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(EMBEDDING_DIM * 4);
        for v in &self.0 {
            out.extend_from_slice(&v.to_le_bytes());
        }
        out
    }

    /// Decode a blob previously produced by [`Self::to_blob`].
    pub fn from_blob(blob: &[u8]) -> Result<Self, EmbeddingShapeError> {
        if blob.len() != EMBEDDING_DIM * 4 {
            return Err(EmbeddingShapeError::WrongBlobLength(blob.len()));
        }
        let mut data = [0.0f32; EMBEDDING_DIM];
        for (i, chunk) in blob.chunks_exact(4).enumerate() {
            let bytes: [u8; 4] = [chunk[0], chunk[1], chunk[2], chunk[3]];
            data[i] = f32::from_le_bytes(bytes);
        }
        if data.iter().any(|v| !v.is_finite()) {
            return Err(EmbeddingShapeError::NonFinite);
        }
        Ok(Self(data))
    }
}

/// Shape violations when constructing or decoding an embedding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum EmbeddingShapeError {
    #[error("embedding has {0} components, expected {EMBEDDING_DIM}")]
    WrongLength(usize),

    #[error("embedding blob is {0} bytes, expected {}", EMBEDDING_DIM * 4)]
    WrongBlobLength(usize),

    #[error("embedding contains non-finite components")]
    NonFinite,
}

/// Outcome of a batch processing run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchReport {
    /// Photos the batch attempted.
    pub total: usize,

    /// Photos that completed (including zero-face photos).
    pub processed: usize,

    /// Faces detected across all completed photos.
    pub total_faces: usize,

    /// Per-photo failures; a failure never aborts the rest of the batch.
    pub errors: Vec<BatchError>,
}

/// One failed photo inside a batch run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchError {
    pub filename: String,
    pub message: String,
}
