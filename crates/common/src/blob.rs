//! Blob store abstraction for raw photo bytes.
//!
//! The core never touches raw storage paths directly: every write goes
//! through [`BlobStore::put`], which namespaces by event and guarantees
//! collision-free, sanitized filenames.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::validation::{sanitize_filename, validate_event_id};

/// Storage of raw photo bytes, namespaced per event.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store bytes under the event namespace. Returns the stored path
    /// (relative, `event_id/filename`), which is unique even when the same
    /// client filename is uploaded twice.
    async fn put(&self, event_id: &str, filename: &str, bytes: &[u8]) -> Result<String>;

    /// Read back a blob by its stored path.
    async fn open(&self, path: &str) -> Result<Vec<u8>>;

    /// Stored paths under an event namespace, sorted by filename.
    async fn list(&self, event_id: &str) -> Result<Vec<String>>;

    /// Remove a blob. Missing blobs are not an error.
    async fn delete(&self, path: &str) -> Result<()>;
}

/// Filesystem-backed blob store rooted at a single directory.
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a stored path, rejecting anything that would escape the
    /// root directory.
    fn resolve(&self, stored: &str) -> Result<PathBuf> {
        let rel = Path::new(stored);
        for component in rel.components() {
            use std::path::Component;
            match component {
                Component::Normal(_) => {}
                _ => return Err(anyhow!("blob path '{}' is not a plain relative path", stored)),
            }
        }
        Ok(self.root.join(rel))
    }

    /// Pick a filename that does not collide in the event directory by
    /// suffixing `-1`, `-2`, ... before the extension.
    async fn uniquify(&self, dir: &Path, filename: &str) -> Result<String> {
        let candidate = dir.join(filename);
        if !candidate.exists() {
            return Ok(filename.to_string());
        }

        let (stem, ext) = match filename.rsplit_once('.') {
            Some((s, e)) if !s.is_empty() => (s.to_string(), Some(e.to_string())),
            _ => (filename.to_string(), None),
        };

        for n in 1..10_000u32 {
            let next = match &ext {
                Some(e) => format!("{}-{}.{}", stem, n, e),
                None => format!("{}-{}", stem, n),
            };
            if !dir.join(&next).exists() {
                return Ok(next);
            }
        }

        Err(anyhow!("could not find a free filename for '{}'", filename))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, event_id: &str, filename: &str, bytes: &[u8]) -> Result<String> {
        validate_event_id(event_id)?;
        let safe_name = sanitize_filename(filename);

        let dir = self.root.join(event_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("failed to create blob directory {:?}", dir))?;

        let final_name = self.uniquify(&dir, &safe_name).await?;
        let target = dir.join(&final_name);
        tokio::fs::write(&target, bytes)
            .await
            .with_context(|| format!("failed to write blob {:?}", target))?;

        debug!(event_id = %event_id, filename = %final_name, size = bytes.len(), "blob stored");
        Ok(format!("{}/{}", event_id, final_name))
    }

    async fn open(&self, path: &str) -> Result<Vec<u8>> {
        let full = self.resolve(path)?;
        tokio::fs::read(&full)
            .await
            .with_context(|| format!("failed to read blob {:?}", full))
    }

    async fn list(&self, event_id: &str) -> Result<Vec<String>> {
        validate_event_id(event_id)?;
        let dir = self.root.join(event_id);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .with_context(|| format!("failed to list blob directory {:?}", dir))?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(format!("{}/{}", event_id, name));
                }
            }
        }
        names.sort();
        Ok(names)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let full = self.resolve(path)?;
        match tokio::fs::remove_file(&full).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("failed to delete blob {:?}", full)),
        }
    }
}
