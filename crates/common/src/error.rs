use thiserror::Error;

/// Failure taxonomy of the core pipeline.
///
/// Two conditions that look like failures are deliberately *not* here:
/// a photo where the full cascade finds no face completes normally with
/// `face_count = 0`, and a match query against an empty store returns
/// `NoMatch`. Both are ordinary values.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Bad image bytes, disallowed file type, or an oversize upload. The
    /// photo is neither created nor processed.
    #[error("invalid input: {0}")]
    Input(String),

    /// The extractor could not produce an embedding for one crop. Local to
    /// the face; the photo continues.
    #[error(transparent)]
    Extraction(#[from] ExtractionError),

    /// Repository or database failure. The current photo's transaction is
    /// rolled back and the photo stays unprocessed.
    #[error("storage error: {0:#}")]
    Storage(anyhow::Error),

    /// Camera unavailable or a capture failed.
    #[error("device error: {0}")]
    Device(String),

    /// A referenced entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),
}

impl CoreError {
    pub fn input(msg: impl Into<String>) -> Self {
        Self::Input(msg.into())
    }

    pub fn device(msg: impl Into<String>) -> Self {
        Self::Device(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn storage(err: impl Into<anyhow::Error>) -> Self {
        Self::Storage(err.into())
    }
}

/// Why an embedding could not be produced for a crop. "Face too small"
/// versus "model failure" are data here, not exceptions, so callers can
/// branch without string matching.
#[derive(Debug, Error)]
pub enum ExtractionError {
    /// The crop's short side is below the minimum the embedding network
    /// accepts. The caller skips the face rather than guessing.
    #[error("face crop {width}x{height} is below the {min} px minimum")]
    FaceTooSmall { width: u32, height: u32, min: u32 },

    /// The model ran but produced an unusable result.
    #[error("embedding inference failed: {0}")]
    Inference(String),

    /// The model handle is missing or failed to load.
    #[error("embedding model unavailable: {0}")]
    ModelUnavailable(String),
}

pub type CoreResult<T> = Result<T, CoreError>;
