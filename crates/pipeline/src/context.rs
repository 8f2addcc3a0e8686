use anyhow::Result;
use common::{BlobStore, CoreConfig, FsBlobStore};
use face_engine::FaceEngine;
use identity_store::IdentityRepository;
use matcher::FaceMatcher;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Everything the core owns, built once at startup and passed explicitly.
/// There is no process-global state: model handles, the repository, the
/// blob store and the matcher cache all live here and are torn down when
/// the last reference drops.
pub struct CoreContext {
    pub config: CoreConfig,
    pub engine: FaceEngine,
    pub repo: IdentityRepository,
    pub blobs: Arc<dyn BlobStore>,
    pub matcher: FaceMatcher,
}

impl CoreContext {
    /// Assemble a context from already-built parts.
    pub fn assemble(
        config: CoreConfig,
        engine: FaceEngine,
        repo: IdentityRepository,
        blobs: Arc<dyn BlobStore>,
    ) -> Arc<Self> {
        let matcher = FaceMatcher::new(repo.clone(), &config);
        Arc::new(Self {
            config,
            engine,
            repo,
            blobs,
            matcher,
        })
    }

    /// Open the production context: database at `database_url`, blobs
    /// rooted at `blob_root`, engine per configuration.
    pub async fn open(
        config: CoreConfig,
        database_url: &str,
        blob_root: impl AsRef<Path>,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let pool = identity_store::connect(database_url).await?;
        let repo = IdentityRepository::new(pool, config.max_angles_per_person);
        let engine = FaceEngine::from_config(&config);
        let blobs: Arc<dyn BlobStore> = Arc::new(FsBlobStore::new(blob_root.as_ref()));

        info!(
            database = %database_url,
            blob_root = %blob_root.as_ref().display(),
            detectors = ?engine.detector.backend_names(),
            "core context ready"
        );

        Ok(Self::assemble(config, engine, repo, blobs))
    }
}
