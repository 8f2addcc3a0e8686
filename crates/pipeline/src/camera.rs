//! Frame sources for live scanning.
//!
//! The production source grabs single JPEG frames from a camera device
//! through an ffmpeg subprocess; the scripted source replays a fixed
//! frame sequence for tests. Both release their device on `close()` and
//! again on drop, so every exit path of the scanner frees the camera.

use async_trait::async_trait;
use common::{CoreError, CoreResult};
use image::RgbImage;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::process::Command;
use tracing::{debug, warn};

/// A cooperative, exclusively-owned stream of camera frames.
#[async_trait]
pub trait FrameSource: Send {
    /// Next frame, or `None` when the stream has ended.
    async fn next_frame(&mut self) -> CoreResult<Option<RgbImage>>;

    /// Release the underlying device. Idempotent.
    fn close(&mut self);
}

/// Camera frames via ffmpeg one-shot grabs.
pub struct FfmpegCamera {
    input: String,
    input_format: Option<String>,
    open: bool,
}

impl FfmpegCamera {
    /// A V4L2 camera by index (`/dev/video<N>`).
    pub fn device(camera_index: u32) -> Self {
        Self {
            input: format!("/dev/video{}", camera_index),
            input_format: Some("v4l2".to_string()),
            open: true,
        }
    }

    /// Any ffmpeg-readable input URI; used for network cameras and
    /// prerecorded fixtures.
    pub fn uri(input: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            input_format: None,
            open: true,
        }
    }
}

#[async_trait]
impl FrameSource for FfmpegCamera {
    async fn next_frame(&mut self) -> CoreResult<Option<RgbImage>> {
        if !self.open {
            return Ok(None);
        }

        let mut args: Vec<String> = Vec::new();
        if let Some(format) = &self.input_format {
            args.push("-f".to_string());
            args.push(format.clone());
        }
        args.extend(
            [
                "-i",
                self.input.as_str(),
                "-vframes",
                "1",
                "-f",
                "image2pipe",
                "-vcodec",
                "mjpeg",
                "pipe:1",
            ]
            .iter()
            .map(|s| s.to_string()),
        );

        debug!(input = %self.input, "grabbing camera frame");
        let output = Command::new("ffmpeg")
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .output()
            .await
            .map_err(|e| CoreError::device(format!("failed to spawn ffmpeg: {}", e)))?;

        if !output.status.success() {
            return Err(CoreError::device(format!(
                "camera '{}' unavailable (ffmpeg exited with {:?}); check that the device exists and is not in use",
                self.input, output.status
            )));
        }
        if output.stdout.is_empty() {
            return Err(CoreError::device(format!(
                "camera '{}' produced no frame data",
                self.input
            )));
        }

        let frame = image::load_from_memory(&output.stdout)
            .map_err(|e| CoreError::device(format!("failed to decode camera frame: {}", e)))?
            .to_rgb8();
        Ok(Some(frame))
    }

    fn close(&mut self) {
        if self.open {
            debug!(input = %self.input, "camera released");
            self.open = false;
        }
    }
}

impl Drop for FfmpegCamera {
    fn drop(&mut self) {
        self.close();
    }
}

/// One step of a scripted frame sequence.
pub enum ScriptedFrame {
    Frame(RgbImage),
    Error(String),
}

/// Replays a fixed sequence, then reports end-of-stream. Exposes a shared
/// closed flag so tests can assert the scanner released the device.
pub struct ScriptedSource {
    frames: std::collections::VecDeque<ScriptedFrame>,
    closed: Arc<AtomicBool>,
}

impl ScriptedSource {
    pub fn new(frames: Vec<ScriptedFrame>) -> Self {
        Self {
            frames: frames.into(),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn from_images(frames: Vec<RgbImage>) -> Self {
        Self::new(frames.into_iter().map(ScriptedFrame::Frame).collect())
    }

    /// Handle observed by tests after the source has been consumed.
    pub fn closed_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.closed)
    }
}

#[async_trait]
impl FrameSource for ScriptedSource {
    async fn next_frame(&mut self) -> CoreResult<Option<RgbImage>> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(None);
        }
        match self.frames.pop_front() {
            Some(ScriptedFrame::Frame(frame)) => Ok(Some(frame)),
            Some(ScriptedFrame::Error(message)) => Err(CoreError::device(message)),
            None => Ok(None),
        }
    }

    fn close(&mut self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!("scripted source closed");
        }
    }
}

impl Drop for ScriptedSource {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            warn!("scripted source dropped without close");
        }
    }
}
