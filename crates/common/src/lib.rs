//! Shared domain types, configuration, validation and storage abstractions
//! for the snapmatch face-identity pipeline.

pub mod blob;
pub mod config;
pub mod error;
pub mod types;
pub mod validation;

pub use blob::{BlobStore, FsBlobStore};
pub use config::{AngleWeights, CoreConfig, ModelPaths};
pub use error::{CoreError, CoreResult, ExtractionError};
pub use types::{
    BatchError, BatchReport, BoundingBox, DetectionBox, DetectorKind, EmbeddingShapeError,
    EmbeddingVector, FaceAngle, FivePointLandmarks, QualityScores, EMBEDDING_DIM, LANDMARK_POINTS,
};
