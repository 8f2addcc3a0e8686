//! Photo ingestion orchestration.
//!
//! One photo runs end to end as: decode, detect, per-face
//! pose/quality/extraction, match-or-create, then a single database
//! transaction that writes detections, embeddings and associations and
//! flips the processed flag. A storage failure rolls the whole photo
//! back; the photo is never half-written and never marked processed on a
//! violated invariant.

use anyhow::Context as _;
use common::{
    validation, BatchError, BatchReport, BlobStore as _, CoreError, CoreResult, DetectionBox,
    EmbeddingVector, FaceAngle, QualityScores,
};
use face_engine::{image_ops, FaceFeatures};
use identity_store::NewLandmarks;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::context::CoreContext;

/// Result of processing one photo.
#[derive(Debug, Clone, Serialize)]
pub struct PhotoReport {
    pub photo_id: i64,
    /// True when the photo was already processed and `force` was not set;
    /// nothing was changed.
    pub skipped: bool,
    pub face_count: usize,
    pub new_persons: usize,
    pub matched_faces: usize,
    /// Faces recorded without identity because no embedding could be
    /// produced for them.
    pub extraction_failures: usize,
}

/// Receipt for an accepted upload.
#[derive(Debug, Clone, Serialize)]
pub struct IngestReceipt {
    pub stored_path: String,
    pub report: PhotoReport,
}

/// Confidence recorded when a face creates a brand-new person; there is
/// no distance to score against.
const ENROLLMENT_CONFIDENCE: f32 = 1.0;

/// Work computed for one detected face before any row is written.
struct FaceWork {
    detection: DetectionBox,
    angle: FaceAngle,
    quality: QualityScores,
    features: Result<FaceFeatures, common::ExtractionError>,
    matched: Option<matcher::FaceMatch>,
}

/// An embedding written earlier in the same photo, for intra-photo
/// matching before anything is committed.
struct LocalEmbedding {
    person_id: i64,
    vector: EmbeddingVector,
    angle: FaceAngle,
    quality: f32,
}

pub struct PhotoProcessor {
    ctx: Arc<CoreContext>,
}

impl PhotoProcessor {
    pub fn new(ctx: Arc<CoreContext>) -> Self {
        Self { ctx }
    }

    /// Validate, store and process one uploaded photo. On processing
    /// failure the stored blob is removed again so no orphan remains.
    pub async fn ingest_upload(
        &self,
        event_id: &str,
        filename: &str,
        bytes: &[u8],
        force: bool,
    ) -> CoreResult<IngestReceipt> {
        validation::validate_event_id(event_id).map_err(|e| CoreError::input(e.to_string()))?;
        validation::validate_upload(&self.ctx.config, filename, bytes.len() as u64)
            .map_err(|e| CoreError::input(e.to_string()))?;

        let stored_path = self
            .ctx
            .blobs
            .put(event_id, filename, bytes)
            .await
            .map_err(CoreError::storage)?;

        match self
            .process_bytes(event_id, filename, &stored_path, bytes, force)
            .await
        {
            Ok(report) => Ok(IngestReceipt {
                stored_path,
                report,
            }),
            Err(e) => {
                if let Err(cleanup) = self.ctx.blobs.delete(&stored_path).await {
                    warn!(path = %stored_path, error = %cleanup, "failed to remove blob after error");
                }
                Err(e)
            }
        }
    }

    /// Process every blob in an event namespace. Per-photo failures are
    /// collected, never fatal to the batch.
    pub async fn process_event(&self, event_id: &str, force: bool) -> CoreResult<BatchReport> {
        validation::validate_event_id(event_id).map_err(|e| CoreError::input(e.to_string()))?;

        let paths = self
            .ctx
            .blobs
            .list(event_id)
            .await
            .map_err(CoreError::storage)?;

        let mut report = BatchReport {
            total: paths.len(),
            processed: 0,
            total_faces: 0,
            errors: Vec::new(),
        };

        for stored_path in paths {
            let filename = stored_path
                .rsplit('/')
                .next()
                .unwrap_or(stored_path.as_str())
                .to_string();

            let result = async {
                let bytes = self
                    .ctx
                    .blobs
                    .open(&stored_path)
                    .await
                    .map_err(CoreError::storage)?;
                self.process_bytes(event_id, &filename, &stored_path, &bytes, force)
                    .await
            }
            .await;

            match result {
                Ok(photo) => {
                    report.processed += 1;
                    report.total_faces += photo.face_count;
                }
                Err(e) => {
                    warn!(photo = %filename, error = %e, "photo failed, batch continues");
                    report.errors.push(BatchError {
                        filename,
                        message: e.to_string(),
                    });
                }
            }
        }

        info!(
            event_id = %event_id,
            total = report.total,
            processed = report.processed,
            faces = report.total_faces,
            errors = report.errors.len(),
            "event batch complete"
        );
        Ok(report)
    }

    /// Process one photo's bytes. `stored_path` is the blob identity the
    /// photo row keys on.
    pub async fn process_bytes(
        &self,
        event_id: &str,
        filename: &str,
        stored_path: &str,
        bytes: &[u8],
        force: bool,
    ) -> CoreResult<PhotoReport> {
        // Undecodable input fails the call before any row exists.
        let image = image_ops::decode_image(bytes)?;

        let photo = self
            .ctx
            .repo
            .insert_or_get_photo(event_id, filename, stored_path)
            .await
            .map_err(CoreError::storage)?;

        if photo.processed && !force {
            debug!(photo_id = photo.photo_id, "already processed, skipping");
            return Ok(PhotoReport {
                photo_id: photo.photo_id,
                skipped: true,
                face_count: photo.face_count as usize,
                new_persons: 0,
                matched_faces: 0,
                extraction_failures: 0,
            });
        }

        // Perception first, storage second: everything CPU-bound happens
        // before the transaction opens.
        let detections = self.ctx.engine.detector.detect(&image).await;
        let mut work = Vec::with_capacity(detections.len());
        for detection in detections {
            work.push(self.analyze_face(&image, detection).await?);
        }

        let report = self.persist_photo(photo.photo_id, force, work).await?;

        info!(
            photo_id = report.photo_id,
            faces = report.face_count,
            new_persons = report.new_persons,
            matched = report.matched_faces,
            "photo processed"
        );
        Ok(report)
    }

    /// Pose, quality, extraction and a committed-store match for one face.
    async fn analyze_face(
        &self,
        image: &image::RgbImage,
        detection: DetectionBox,
    ) -> CoreResult<FaceWork> {
        let crop = image_ops::crop_face(image, &detection.bbox);
        let angle = self
            .ctx
            .engine
            .pose
            .estimate(&crop, detection.landmarks.as_ref());
        let quality = self.ctx.engine.quality.score(&crop);

        let features = self.ctx.engine.extractor.extract(&crop).await;
        let matched = match &features {
            Ok(f) => self
                .ctx
                .matcher
                .match_one(&f.embedding, Some(angle))
                .await
                .map_err(CoreError::storage)?
                .matched()
                .copied(),
            Err(e) => {
                debug!(error = %e, "face skipped for identity, detection still recorded");
                None
            }
        };

        Ok(FaceWork {
            detection,
            angle,
            quality,
            features,
            matched,
        })
    }

    /// Write all rows for one photo in a single transaction.
    async fn persist_photo(
        &self,
        photo_id: i64,
        force: bool,
        work: Vec<FaceWork>,
    ) -> CoreResult<PhotoReport> {
        let repo = &self.ctx.repo;
        let face_total = work.len();

        let mut tx = repo
            .pool()
            .begin()
            .await
            .context("failed to begin photo transaction")
            .map_err(CoreError::storage)?;

        if force {
            repo.clear_photo_results_tx(&mut tx, photo_id)
                .await
                .map_err(CoreError::storage)?;
        }

        let mut report = PhotoReport {
            photo_id,
            skipped: false,
            face_count: face_total,
            new_persons: 0,
            matched_faces: 0,
            extraction_failures: 0,
        };
        let mut local: Vec<LocalEmbedding> = Vec::new();

        for face in work {
            let features = match face.features {
                Ok(features) => features,
                Err(_) => {
                    // The face exists even when identity extraction does
                    // not; no person is created for it.
                    report.extraction_failures += 1;
                    repo.insert_detection_tx(
                        &mut tx,
                        photo_id,
                        None,
                        face.detection.bbox,
                        face.detection.detector,
                        face.detection.confidence,
                        face.angle,
                        face.quality,
                    )
                    .await
                    .map_err(CoreError::storage)?;
                    continue;
                }
            };

            let (person_id, confidence) = match face.matched {
                Some(m) => {
                    report.matched_faces += 1;
                    (m.person_id, m.confidence)
                }
                None => match self.match_local(&local, &features.embedding) {
                    Some((person_id, confidence)) => {
                        report.matched_faces += 1;
                        (person_id, confidence)
                    }
                    None => {
                        let person = repo
                            .add_person_tx(&mut tx, None, None)
                            .await
                            .map_err(CoreError::storage)?;
                        report.new_persons += 1;
                        (person.person_id, ENROLLMENT_CONFIDENCE)
                    }
                },
            };

            let detection_id = repo
                .insert_detection_tx(
                    &mut tx,
                    photo_id,
                    Some(person_id),
                    face.detection.bbox,
                    face.detection.detector,
                    face.detection.confidence,
                    face.angle,
                    face.quality,
                )
                .await
                .map_err(CoreError::storage)?;

            if let Some(landmarks) = &features.landmarks {
                let attributes = features.attributes.clone().unwrap_or_default();
                repo.insert_landmarks_tx(
                    &mut tx,
                    detection_id,
                    &NewLandmarks {
                        points: landmarks.to_blob(),
                        eye_distance: attributes.eye_distance,
                        nose_width: attributes.nose_width,
                        nose_height: attributes.nose_height,
                        jaw_width: attributes.jaw_width,
                        has_glasses: attributes.has_glasses,
                        has_facial_hair: attributes.has_facial_hair,
                    },
                )
                .await
                .map_err(CoreError::storage)?;
            }

            repo.upsert_embedding_tx(
                &mut tx,
                person_id,
                &features.embedding,
                face.angle,
                face.quality.overall,
                Some(detection_id),
            )
            .await
            .map_err(CoreError::storage)?;

            repo.associate_tx(&mut tx, person_id, photo_id, face_total as i64, confidence)
                .await
                .map_err(CoreError::storage)?;

            repo.touch_person_tx(&mut tx, person_id)
                .await
                .map_err(CoreError::storage)?;

            local.push(LocalEmbedding {
                person_id,
                vector: features.embedding,
                angle: face.angle,
                quality: face.quality.overall,
            });
        }

        repo.mark_processed_tx(&mut tx, photo_id)
            .await
            .map_err(CoreError::storage)?;

        tx.commit()
            .await
            .context("failed to commit photo transaction")
            .map_err(CoreError::storage)?;

        Ok(report)
    }

    /// Match against embeddings created earlier in this same photo, which
    /// are not yet visible to the committed-store matcher. Keeps two
    /// shots of the same new guest in one photo from minting two persons.
    fn match_local(
        &self,
        local: &[LocalEmbedding],
        embedding: &EmbeddingVector,
    ) -> Option<(i64, f32)> {
        let threshold = self.ctx.matcher.threshold();
        let weights = &self.ctx.config.angle_weights;

        let mut best: Option<(i64, f32, f32)> = None;
        for candidate in local {
            let distance = embedding.distance(&candidate.vector);
            let base = (-f64::from(distance)).exp() as f32;
            let confidence =
                weights.for_angle(candidate.angle) * (0.7 * base + 0.3 * candidate.quality);
            match best {
                Some((_, _, d)) if distance >= d => {}
                _ => best = Some((candidate.person_id, confidence, distance)),
            }
        }

        match best {
            Some((person_id, confidence, distance)) if distance <= threshold => {
                Some((person_id, confidence))
            }
            _ => None,
        }
    }

    /// Delete a photo and its blob. Detections, landmarks and
    /// associations disappear by schema cascade.
    pub async fn delete_photo(&self, photo_id: i64) -> CoreResult<bool> {
        let photo = self
            .ctx
            .repo
            .get_photo(photo_id)
            .await
            .map_err(CoreError::storage)?;
        let Some(photo) = photo else {
            return Ok(false);
        };

        self.ctx
            .repo
            .delete_photo(photo_id)
            .await
            .map_err(CoreError::storage)?;
        if let Err(e) = self.ctx.blobs.delete(&photo.filepath).await {
            warn!(path = %photo.filepath, error = %e, "photo row deleted but blob removal failed");
        }
        Ok(true)
    }

    /// Find the top-k persons most similar to the largest face in the
    /// given image bytes.
    pub async fn similar_faces(
        &self,
        bytes: &[u8],
        top_k: usize,
    ) -> CoreResult<Vec<matcher::SimilarFace>> {
        let image = image_ops::decode_image(bytes)?;
        let detections = self.ctx.engine.detector.detect(&image).await;
        let largest = detections
            .into_iter()
            .max_by_key(|d| d.bbox.area())
            .ok_or_else(|| CoreError::input("no face found in query image"))?;

        let crop = image_ops::crop_face(&image, &largest.bbox);
        let features = self.ctx.engine.extractor.extract(&crop).await?;
        self.ctx
            .matcher
            .similar(&features.embedding, top_k)
            .await
            .map_err(CoreError::storage)
    }
}
