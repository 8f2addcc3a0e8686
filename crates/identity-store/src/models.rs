use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use common::{BoundingBox, DetectorKind, EmbeddingVector, FaceAngle, QualityScores};
use serde::Serialize;
use sqlx::FromRow;

/// One ingested photo.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct PhotoRow {
    pub photo_id: i64,
    pub event_id: String,
    pub filename: String,
    pub filepath: String,
    pub uploaded_at: DateTime<Utc>,
    pub processed: bool,
    pub face_count: i64,
}

/// One person identity. Created lazily the first time a detection fails
/// to match anyone.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct PersonRow {
    pub person_id: i64,
    pub person_uuid: String,
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub photo_count: i64,
}

/// One detected face within a photo.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct DetectionRow {
    pub detection_id: i64,
    pub photo_id: i64,
    pub person_id: Option<i64>,
    pub bbox_x: i64,
    pub bbox_y: i64,
    pub bbox_width: i64,
    pub bbox_height: i64,
    pub detector: String,
    pub confidence: f64,
    pub angle: String,
    pub quality_blur: f64,
    pub quality_lighting: f64,
    pub quality_size: f64,
    pub quality_overall: f64,
    pub created_at: DateTime<Utc>,
}

impl DetectionRow {
    pub fn bbox(&self) -> BoundingBox {
        BoundingBox::new(
            self.bbox_x.max(0) as u32,
            self.bbox_y.max(0) as u32,
            self.bbox_width.max(0) as u32,
            self.bbox_height.max(0) as u32,
        )
    }

    pub fn detector_kind(&self) -> Result<DetectorKind> {
        DetectorKind::parse(&self.detector)
            .ok_or_else(|| anyhow!("unknown detector '{}' in row", self.detector))
    }

    pub fn face_angle(&self) -> Result<FaceAngle> {
        FaceAngle::parse(&self.angle)
            .ok_or_else(|| anyhow!("unknown angle '{}' in row", self.angle))
    }

    pub fn quality(&self) -> QualityScores {
        QualityScores {
            blur: self.quality_blur as f32,
            lighting: self.quality_lighting as f32,
            size: self.quality_size as f32,
            overall: self.quality_overall as f32,
        }
    }
}

/// Raw embedding row as stored.
#[derive(Debug, Clone, FromRow)]
pub struct EmbeddingRow {
    pub embedding_id: i64,
    pub person_id: i64,
    pub detection_id: Option<i64>,
    pub vector: Vec<u8>,
    pub angle: String,
    pub quality: f64,
    pub is_primary: bool,
    pub created_at: DateTime<Utc>,
}

/// Decoded embedding handed to the matcher.
#[derive(Debug, Clone)]
pub struct StoredEmbedding {
    pub embedding_id: i64,
    pub person_id: i64,
    pub angle: FaceAngle,
    pub quality: f32,
    pub is_primary: bool,
    pub vector: EmbeddingVector,
}

impl TryFrom<EmbeddingRow> for StoredEmbedding {
    type Error = anyhow::Error;

    fn try_from(row: EmbeddingRow) -> Result<Self> {
        let angle = FaceAngle::parse(&row.angle)
            .ok_or_else(|| anyhow!("unknown angle '{}' in embedding row", row.angle))?;
        let vector = EmbeddingVector::from_blob(&row.vector)?;
        Ok(Self {
            embedding_id: row.embedding_id,
            person_id: row.person_id,
            angle,
            quality: row.quality as f32,
            is_primary: row.is_primary,
            vector,
        })
    }
}

/// Landmarks and derived attributes for one detection.
#[derive(Debug, Clone, FromRow)]
pub struct LandmarksRow {
    pub detection_id: i64,
    pub points: Vec<u8>,
    pub eye_distance: Option<f64>,
    pub nose_width: Option<f64>,
    pub nose_height: Option<f64>,
    pub jaw_width: Option<f64>,
    pub has_glasses: Option<bool>,
    pub has_facial_hair: Option<bool>,
}

/// Landmark payload to persist for one detection.
#[derive(Debug, Clone, Default)]
pub struct NewLandmarks {
    pub points: Vec<u8>,
    pub eye_distance: Option<f32>,
    pub nose_width: Option<f32>,
    pub nose_height: Option<f32>,
    pub jaw_width: Option<f32>,
    pub has_glasses: Option<bool>,
    pub has_facial_hair: Option<bool>,
}

/// Outcome of an embedding upsert against the capacity-bounded set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UpsertOutcome {
    /// Whether the new embedding was stored.
    pub accepted: bool,

    /// Id of the evicted embedding when the set was full.
    pub replaced_id: Option<i64>,

    /// Id of the inserted embedding when accepted.
    pub embedding_id: Option<i64>,
}

/// One photo returned from a person lookup, with its association strength.
#[derive(Debug, Clone, Serialize)]
pub struct PhotoMatch {
    pub photo: PhotoRow,
    pub match_confidence: f32,
    pub face_count_in_photo: i64,
}

impl PhotoMatch {
    /// Derived, never stored: a photo is a group photo when the capture
    /// held more than one face.
    pub fn is_group(&self) -> bool {
        self.face_count_in_photo > 1
    }
}

/// Person photos split the way the retrieval surface serves them.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PersonPhotos {
    pub individual: Vec<PhotoMatch>,
    pub group: Vec<PhotoMatch>,
}

/// Aggregate store counters for the status surface.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct StoreStatus {
    pub photos: i64,
    pub unprocessed_photos: i64,
    pub persons: i64,
    pub embeddings: i64,
    pub detections: i64,
}
