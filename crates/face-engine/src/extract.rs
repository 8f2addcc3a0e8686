//! Identity feature extraction: the 128-D embedding plus optional 68-point
//! landmarks and derived attributes.
//!
//! The embedding backend is a closed sum. The ONNX path wraps the trained
//! identity network; the signature path is a deterministic pooled-luma
//! fallback with the same shape contract, used by the test suites and by
//! deployments that have not shipped model files yet. Either way the
//! output is exactly 128 finite, L2-normalized floats or an
//! [`ExtractionError`] — never a guess.

use anyhow::{Context, Result};
use common::{CoreConfig, EmbeddingVector, ExtractionError, EMBEDDING_DIM, LANDMARK_POINTS};
use image::{imageops, RgbImage};
use ndarray::{Array, IxDyn};
use ort::{
    session::{builder::GraphOptimizationLevel, Session},
    value::Value,
};
use tokio::sync::Mutex;
use tracing::warn;

use crate::image_ops::to_gray;
use crate::landmarks::{derive_attributes, FaceAttributes, FaceLandmarks};

/// Crops with a shorter side below this cannot produce an embedding.
pub const MIN_FACE_PX: u32 = 70;

/// Embedding network input edge.
const EMBED_INPUT: u32 = 112;

/// Landmark network input edge.
const LANDMARK_INPUT: u32 = 64;

/// Everything the extractor can say about one face crop.
#[derive(Debug, Clone)]
pub struct FaceFeatures {
    pub embedding: EmbeddingVector,
    pub landmarks: Option<FaceLandmarks>,
    pub attributes: Option<FaceAttributes>,
}

enum EmbeddingBackend {
    Onnx(OnnxEmbedder),
    Signature(SignatureEmbedder),
}

pub struct FeatureExtractor {
    backend: EmbeddingBackend,
    landmark_session: Option<Mutex<Session>>,
}

impl FeatureExtractor {
    /// Build from configuration: the ONNX backend when an embedding model
    /// is configured and loads, the signature backend otherwise.
    pub fn from_config(config: &CoreConfig) -> Self {
        let backend = match &config.models.embedding {
            Some(path) => match OnnxEmbedder::load(path) {
                Ok(embedder) => EmbeddingBackend::Onnx(embedder),
                Err(e) => {
                    warn!(model = %path, error = %e, "embedding model unavailable, using signature backend");
                    EmbeddingBackend::Signature(SignatureEmbedder)
                }
            },
            None => EmbeddingBackend::Signature(SignatureEmbedder),
        };

        let landmark_session = config.models.landmarks.as_ref().and_then(|path| {
            match load_session(path) {
                Ok(session) => Some(Mutex::new(session)),
                Err(e) => {
                    warn!(model = %path, error = %e, "landmark model unavailable");
                    None
                }
            }
        });

        Self {
            backend,
            landmark_session,
        }
    }

    /// Deterministic extractor with no model dependencies.
    pub fn signature() -> Self {
        Self {
            backend: EmbeddingBackend::Signature(SignatureEmbedder),
            landmark_session: None,
        }
    }

    /// Extract identity features from a face crop.
    pub async fn extract(&self, crop: &RgbImage) -> Result<FaceFeatures, ExtractionError> {
        let (width, height) = crop.dimensions();
        if width.min(height) < MIN_FACE_PX {
            return Err(ExtractionError::FaceTooSmall {
                width,
                height,
                min: MIN_FACE_PX,
            });
        }

        let embedding = match &self.backend {
            EmbeddingBackend::Onnx(embedder) => embedder.embed(crop).await?,
            EmbeddingBackend::Signature(embedder) => embedder.embed(crop)?,
        };

        let landmarks = self.extract_landmarks(crop).await;
        let attributes = landmarks.as_ref().map(|l| derive_attributes(crop, l));

        Ok(FaceFeatures {
            embedding,
            landmarks,
            attributes,
        })
    }

    /// Best-effort landmark inference; failure degrades to `None`.
    async fn extract_landmarks(&self, crop: &RgbImage) -> Option<FaceLandmarks> {
        let session = self.landmark_session.as_ref()?;
        match run_landmark_session(session, crop).await {
            Ok(landmarks) => Some(landmarks),
            Err(e) => {
                warn!(error = %e, "landmark inference failed");
                None
            }
        }
    }
}

async fn run_landmark_session(
    session: &Mutex<Session>,
    crop: &RgbImage,
) -> Result<FaceLandmarks> {
    let (crop_w, crop_h) = crop.dimensions();
    let resized = imageops::resize(
        crop,
        LANDMARK_INPUT,
        LANDMARK_INPUT,
        imageops::FilterType::Triangle,
    );
    let input_tensor = Value::from_array(normalized_rgb_tensor(&resized))?;

    let mut guard = session.lock().await;
    let outputs = guard.run(ort::inputs![input_tensor])?;
    let output_value = outputs
        .get("output")
        .or_else(|| outputs.get("output0"))
        .or_else(|| outputs.get("landmarks"))
        .context("no landmark output tensor found")?;
    let (_, data) = output_value.try_extract_tensor::<f32>()?;
    let flat: Vec<f32> = data.to_vec();
    drop(outputs);
    drop(guard);

    anyhow::ensure!(
        flat.len() >= LANDMARK_POINTS * 2,
        "landmark output has {} values, expected {}",
        flat.len(),
        LANDMARK_POINTS * 2
    );

    // The network emits unit coordinates; map to crop pixels.
    let scaled: Vec<f32> = flat[..LANDMARK_POINTS * 2]
        .iter()
        .enumerate()
        .map(|(i, v)| {
            if i % 2 == 0 {
                v * crop_w as f32
            } else {
                v * crop_h as f32
            }
        })
        .collect();

    FaceLandmarks::from_flat(&scaled).context("landmark reshape failed")
}

struct OnnxEmbedder {
    session: Mutex<Session>,
}

impl OnnxEmbedder {
    fn load(path: &str) -> Result<Self> {
        Ok(Self {
            session: Mutex::new(load_session(path)?),
        })
    }

    async fn embed(&self, crop: &RgbImage) -> Result<EmbeddingVector, ExtractionError> {
        let resized = imageops::resize(
            crop,
            EMBED_INPUT,
            EMBED_INPUT,
            imageops::FilterType::Triangle,
        );
        let input_tensor = Value::from_array(normalized_rgb_tensor(&resized))
            .map_err(|e| ExtractionError::Inference(e.to_string()))?;

        let mut session = self.session.lock().await;
        let outputs = session
            .run(ort::inputs![input_tensor])
            .map_err(|e| ExtractionError::Inference(e.to_string()))?;

        let output_value = outputs
            .get("output")
            .or_else(|| outputs.get("output0"))
            .or_else(|| outputs.get("embedding"))
            .ok_or_else(|| {
                ExtractionError::Inference("no embedding output tensor found".to_string())
            })?;
        let (_, data) = output_value
            .try_extract_tensor::<f32>()
            .map_err(|e| ExtractionError::Inference(e.to_string()))?;
        let flat: Vec<f32> = data.to_vec();
        drop(outputs);
        drop(session);

        if flat.len() != EMBEDDING_DIM {
            return Err(ExtractionError::Inference(format!(
                "model produced {} components, expected {}",
                flat.len(),
                EMBEDDING_DIM
            )));
        }

        let mut embedding = EmbeddingVector::from_slice(&flat)
            .map_err(|e| ExtractionError::Inference(e.to_string()))?;
        embedding.l2_normalize();
        Ok(embedding)
    }
}

/// Deterministic content signature: a 16x8 pooled-luma grid, centered and
/// L2-normalized. Identical crops produce identical embeddings, distinct
/// content diverges, and the shape contract matches the trained network.
struct SignatureEmbedder;

impl SignatureEmbedder {
    fn embed(&self, crop: &RgbImage) -> Result<EmbeddingVector, ExtractionError> {
        let gray = to_gray(crop);
        // 16 columns x 8 rows = 128 cells.
        let pooled = imageops::resize(&gray, 16, 8, imageops::FilterType::Triangle);

        let mut values = [0.0f32; EMBEDDING_DIM];
        for (i, p) in pooled.pixels().enumerate() {
            values[i] = p.0[0] as f32 / 255.0;
        }

        let mean = values.iter().sum::<f32>() / EMBEDDING_DIM as f32;
        for v in &mut values {
            *v -= mean;
        }

        let mut embedding = EmbeddingVector::from_slice(&values)
            .map_err(|e| ExtractionError::Inference(e.to_string()))?;
        embedding.l2_normalize();
        Ok(embedding)
    }
}

fn load_session(path: &str) -> Result<Session> {
    Session::builder()
        .context("failed to create session builder")?
        .with_optimization_level(GraphOptimizationLevel::Level3)
        .context("failed to set optimization level")?
        .with_intra_threads(4)
        .context("failed to set intra threads")?
        .commit_from_file(path)
        .with_context(|| format!("failed to load model from {}", path))
}

/// NCHW RGB tensor normalized to `(x - 127.5) / 128`.
fn normalized_rgb_tensor(image: &RgbImage) -> Array<f32, IxDyn> {
    let (width, height) = image.dimensions();
    let mut input = Array::zeros(IxDyn(&[1, 3, height as usize, width as usize]));
    for (x, y, pixel) in image.enumerate_pixels() {
        for channel in 0..3 {
            input[[0, channel, y as usize, x as usize]] =
                (pixel[channel] as f32 - 127.5) / 128.0;
        }
    }
    input
}
