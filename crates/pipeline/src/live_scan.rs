//! Live capture and identification.
//!
//! The scanner drives a frame source through the capture state machine:
//! Idle -> Capturing on start; every Nth frame is detected and
//! quality-scored on its largest face; Capturing -> Captured when a frame
//! clears the quality gate or the timeout expires with some usable
//! capture; Captured -> Matched -> Done through extraction, matching and
//! photo retrieval. No face before the timeout is `Failed(NoFace)`, an
//! unusable device `Failed(NoDevice)`, and a cancel signal ends in
//! `Cancelled` without partial results. The camera is released on every
//! exit path.

use common::{CoreError, CoreResult, FaceAngle, QualityScores};
use face_engine::image_ops;
use identity_store::PersonPhotos;
use image::RgbImage;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::camera::FrameSource;
use crate::context::CoreContext;

/// Capture tuning for one scan.
#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// Hard capture timeout.
    pub timeout: Duration,

    /// Minimum overall quality that completes the capture early.
    pub min_quality: f32,

    /// Detect on every Nth frame.
    pub frame_interval: u32,
}

impl ScanOptions {
    pub fn from_config(config: &common::CoreConfig) -> Self {
        Self {
            timeout: Duration::from_secs(config.scan_timeout_secs),
            min_quality: config.min_live_quality,
            frame_interval: config.scan_frame_interval.max(1),
        }
    }
}

/// Why a scan produced nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanFailure {
    /// No face was acquired before the timeout.
    NoFace,
    /// The camera could not produce frames at all.
    NoDevice,
}

/// The best frame the capture loop saw.
#[derive(Debug, Clone)]
pub struct Capture {
    pub crop: RgbImage,
    pub angle: FaceAngle,
    pub quality: QualityScores,
    /// Frames inspected before this capture was selected.
    pub frames_seen: u64,
}

/// Terminal state of the capture phase.
#[derive(Debug)]
pub enum CaptureOutcome {
    Captured(Capture),
    Failed(ScanFailure),
    Cancelled,
}

/// Terminal state of a full scan-and-match run.
#[derive(Debug)]
pub enum ScanOutcome {
    /// Capture matched a known person; their photos are attached.
    Matched {
        person_id: i64,
        confidence: f32,
        distance: f32,
        capture_quality: f32,
        photos: PersonPhotos,
    },
    /// A face was captured but nobody in the store matched it.
    Unmatched { capture_quality: f32 },
    Failed(ScanFailure),
    Cancelled,
}

pub struct LiveScanner {
    ctx: Arc<CoreContext>,
}

impl LiveScanner {
    pub fn new(ctx: Arc<CoreContext>) -> Self {
        Self { ctx }
    }

    /// Run the capture loop until a good-enough face, timeout, stream
    /// end, cancellation or device failure. The source is closed before
    /// returning, whatever the path.
    pub async fn capture(
        &self,
        source: &mut dyn FrameSource,
        options: &ScanOptions,
        cancel: &CancellationToken,
    ) -> CoreResult<CaptureOutcome> {
        let result = self.capture_inner(source, options, cancel).await;
        source.close();
        result
    }

    async fn capture_inner(
        &self,
        source: &mut dyn FrameSource,
        options: &ScanOptions,
        cancel: &CancellationToken,
    ) -> CoreResult<CaptureOutcome> {
        let deadline = Instant::now() + options.timeout;
        let mut best: Option<Capture> = None;
        let mut frames_seen: u64 = 0;
        debug!("capturing");

        loop {
            if cancel.is_cancelled() {
                info!("scan cancelled");
                return Ok(CaptureOutcome::Cancelled);
            }

            let frame = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("scan cancelled");
                    return Ok(CaptureOutcome::Cancelled);
                }
                _ = tokio::time::sleep_until(deadline) => None,
                frame = source.next_frame() => match frame {
                    Ok(Some(frame)) => Some(frame),
                    Ok(None) => None,
                    Err(e) => {
                        // A device that never produced a frame is absent;
                        // one that failed mid-stream surfaces the error.
                        if frames_seen == 0 {
                            debug!(error = %e, "no usable capture device");
                            return Ok(CaptureOutcome::Failed(ScanFailure::NoDevice));
                        }
                        return Err(e);
                    }
                },
            };

            // Timeout or end of stream: settle on the best so far.
            let Some(frame) = frame else {
                return Ok(match best {
                    Some(capture) => {
                        debug!(quality = capture.quality.overall, "captured at timeout");
                        CaptureOutcome::Captured(capture)
                    }
                    None => CaptureOutcome::Failed(ScanFailure::NoFace),
                });
            };

            frames_seen += 1;
            if frames_seen % u64::from(options.frame_interval) != 0 {
                continue;
            }

            let detections = self.ctx.engine.detector.detect(&frame).await;
            let Some(largest) = detections.into_iter().max_by_key(|d| d.bbox.area()) else {
                continue;
            };

            let crop = image_ops::crop_face(&frame, &largest.bbox);
            let quality = self.ctx.engine.quality.score(&crop);
            let angle = self
                .ctx
                .engine
                .pose
                .estimate(&crop, largest.landmarks.as_ref());

            let is_better = best
                .as_ref()
                .map(|b| quality.overall > b.quality.overall)
                .unwrap_or(true);
            if is_better {
                best = Some(Capture {
                    crop,
                    angle,
                    quality,
                    frames_seen,
                });
            }

            if quality.overall >= options.min_quality {
                if let Some(capture) = best.take() {
                    debug!(
                        quality = capture.quality.overall,
                        frames = frames_seen,
                        "capture quality gate met"
                    );
                    return Ok(CaptureOutcome::Captured(capture));
                }
            }

            if Instant::now() >= deadline {
                return Ok(match best {
                    Some(capture) => CaptureOutcome::Captured(capture),
                    None => CaptureOutcome::Failed(ScanFailure::NoFace),
                });
            }
        }
    }

    /// Full workflow: capture, extract, match, retrieve photos.
    pub async fn scan_and_match(
        &self,
        source: &mut dyn FrameSource,
        options: &ScanOptions,
        cancel: &CancellationToken,
    ) -> CoreResult<ScanOutcome> {
        let capture = match self.capture(source, options, cancel).await? {
            CaptureOutcome::Captured(capture) => capture,
            CaptureOutcome::Failed(failure) => return Ok(ScanOutcome::Failed(failure)),
            CaptureOutcome::Cancelled => return Ok(ScanOutcome::Cancelled),
        };

        let capture_quality = capture.quality.overall;
        let features = match self.ctx.engine.extractor.extract(&capture.crop).await {
            Ok(features) => features,
            Err(e) => {
                info!(error = %e, "capture unusable for identification");
                return Ok(ScanOutcome::Unmatched { capture_quality });
            }
        };

        let outcome = self
            .ctx
            .matcher
            .match_one(&features.embedding, Some(capture.angle))
            .await
            .map_err(CoreError::storage)?;

        match outcome.matched() {
            Some(m) => {
                let photos = self
                    .ctx
                    .repo
                    .photos_for_person(m.person_id)
                    .await
                    .map_err(CoreError::storage)?;
                info!(
                    person_id = m.person_id,
                    confidence = m.confidence,
                    individual = photos.individual.len(),
                    group = photos.group.len(),
                    "live scan matched"
                );
                Ok(ScanOutcome::Matched {
                    person_id: m.person_id,
                    confidence: m.confidence,
                    distance: m.distance,
                    capture_quality,
                    photos,
                })
            }
            None => {
                info!("live scan found no matching person");
                Ok(ScanOutcome::Unmatched { capture_quality })
            }
        }
    }
}
