//! Input validation for the ingestion boundary.
//!
//! Everything arriving from outside the core (event ids, filenames, upload
//! bytes) passes through here before it can touch the blob store or the
//! repository.

use anyhow::{anyhow, Result};

use crate::config::CoreConfig;

/// Maximum length for event identifiers.
pub const MAX_EVENT_ID_LENGTH: usize = 256;

/// Maximum length for a stored filename after sanitization.
pub const MAX_FILENAME_LENGTH: usize = 255;

/// Validate an event identifier used as a blob namespace.
pub fn validate_event_id(event_id: &str) -> Result<()> {
    if event_id.trim().is_empty() {
        return Err(anyhow!("event_id cannot be empty"));
    }
    if event_id.len() > MAX_EVENT_ID_LENGTH {
        return Err(anyhow!(
            "event_id exceeds maximum length of {} bytes",
            MAX_EVENT_ID_LENGTH
        ));
    }
    // The event id becomes a directory name, so it must not traverse.
    if event_id.contains("..") || event_id.contains('/') || event_id.contains('\\') {
        return Err(anyhow!(
            "event_id contains invalid characters (no path separators or '..' allowed)"
        ));
    }
    Ok(())
}

/// Lowercased extension of a filename, if it has one.
pub fn file_extension(filename: &str) -> Option<String> {
    let name = filename.rsplit(['/', '\\']).next().unwrap_or(filename);
    let (stem, ext) = name.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

/// Check an upload against the configured extension whitelist and size cap.
pub fn validate_upload(config: &CoreConfig, filename: &str, size_bytes: u64) -> Result<()> {
    let ext = file_extension(filename)
        .ok_or_else(|| anyhow!("filename '{}' has no extension", filename))?;
    if !config.allowed_extensions.iter().any(|a| *a == ext) {
        return Err(anyhow!(
            "file type '{}' is not allowed (accepted: {})",
            ext,
            config.allowed_extensions.join(", ")
        ));
    }
    if size_bytes > config.max_upload_bytes {
        return Err(anyhow!(
            "upload of {} bytes exceeds the {} byte limit",
            size_bytes,
            config.max_upload_bytes
        ));
    }
    if size_bytes == 0 {
        return Err(anyhow!("upload is empty"));
    }
    Ok(())
}

/// Reduce an arbitrary client filename to a safe basename: path components
/// stripped, disallowed characters replaced, length capped. The extension
/// is preserved.
pub fn sanitize_filename(filename: &str) -> String {
    let name = filename.rsplit(['/', '\\']).next().unwrap_or(filename);

    let mut sanitized: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();

    // Collapse leading dots so the result is never hidden or a traversal.
    while sanitized.starts_with('.') {
        sanitized.remove(0);
    }

    if sanitized.is_empty() {
        sanitized = "upload".to_string();
    }

    if sanitized.len() > MAX_FILENAME_LENGTH {
        // Keep the extension when truncating.
        match sanitized.rsplit_once('.') {
            Some((stem, ext)) if !ext.is_empty() => {
                let keep = MAX_FILENAME_LENGTH.saturating_sub(ext.len() + 1);
                sanitized = format!("{}.{}", &stem[..keep.min(stem.len())], ext);
            }
            _ => sanitized.truncate(MAX_FILENAME_LENGTH),
        }
    }

    sanitized
}
