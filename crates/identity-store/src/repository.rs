use anyhow::{Context, Result};
use chrono::Utc;
use common::{BoundingBox, DetectorKind, EmbeddingVector, FaceAngle, QualityScores};
use sqlx::{SqliteConnection, SqlitePool};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::models::*;

/// Repository over the relational identity store.
///
/// Write operations that belong to one photo run on the caller's
/// transaction (`*_tx` variants taking `&mut SqliteConnection`); the
/// plain variants open and commit their own transaction. Every mutation
/// bumps a generation counter that matcher caches watch for
/// invalidation.
#[derive(Clone)]
pub struct IdentityRepository {
    pool: SqlitePool,
    capacity: usize,
    generation: Arc<AtomicU64>,
}

impl IdentityRepository {
    /// `capacity` is K, the per-person embedding bound.
    pub fn new(pool: SqlitePool, capacity: usize) -> Self {
        Self {
            pool,
            capacity: capacity.max(1),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Monotonic counter incremented on every mutation; snapshot caches
    /// compare it to decide whether they are stale.
    pub fn mutation_generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    fn bump_generation(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    // ===== Persons =====

    pub async fn add_person(&self, uuid: Option<Uuid>, name: Option<&str>) -> Result<PersonRow> {
        let now = Utc::now();
        let person_uuid = uuid.unwrap_or_else(Uuid::new_v4).to_string();

        let person = sqlx::query_as::<_, PersonRow>(
            r#"
            INSERT INTO persons (person_uuid, name, created_at, last_seen, photo_count)
            VALUES ($1, $2, $3, $3, 0)
            RETURNING *
            "#,
        )
        .bind(&person_uuid)
        .bind(name)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .context("failed to create person")?;

        self.bump_generation();
        debug!(person_id = person.person_id, uuid = %person_uuid, "person created");
        Ok(person)
    }

    /// Create a person inside the caller's transaction, so a lazily
    /// created identity rolls back with the photo that introduced it.
    pub async fn add_person_tx(
        &self,
        conn: &mut SqliteConnection,
        uuid: Option<Uuid>,
        name: Option<&str>,
    ) -> Result<PersonRow> {
        let now = Utc::now();
        let person_uuid = uuid.unwrap_or_else(Uuid::new_v4).to_string();

        let person = sqlx::query_as::<_, PersonRow>(
            r#"
            INSERT INTO persons (person_uuid, name, created_at, last_seen, photo_count)
            VALUES ($1, $2, $3, $3, 0)
            RETURNING *
            "#,
        )
        .bind(&person_uuid)
        .bind(name)
        .bind(now)
        .fetch_one(conn)
        .await
        .context("failed to create person")?;

        self.bump_generation();
        Ok(person)
    }

    pub async fn get_person(&self, person_id: i64) -> Result<Option<PersonRow>> {
        sqlx::query_as::<_, PersonRow>("SELECT * FROM persons WHERE person_id = $1")
            .bind(person_id)
            .fetch_optional(&self.pool)
            .await
            .context("failed to get person")
    }

    pub async fn get_person_by_uuid(&self, person_uuid: &str) -> Result<Option<PersonRow>> {
        sqlx::query_as::<_, PersonRow>("SELECT * FROM persons WHERE person_uuid = $1")
            .bind(person_uuid)
            .fetch_optional(&self.pool)
            .await
            .context("failed to get person by uuid")
    }

    /// Refresh a person's `last_seen` inside the caller's transaction.
    pub async fn touch_person_tx(
        &self,
        conn: &mut SqliteConnection,
        person_id: i64,
    ) -> Result<()> {
        sqlx::query("UPDATE persons SET last_seen = $1 WHERE person_id = $2")
            .bind(Utc::now())
            .bind(person_id)
            .execute(conn)
            .await
            .context("failed to touch person")?;
        Ok(())
    }

    /// Delete a person. Embeddings and photo associations go with it via
    /// schema cascade; detections survive with their person reference
    /// cleared.
    pub async fn delete_person(&self, person_id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM persons WHERE person_id = $1")
            .bind(person_id)
            .execute(&self.pool)
            .await
            .context("failed to delete person")?;
        self.bump_generation();
        Ok(result.rows_affected() > 0)
    }

    // ===== Photos =====

    /// Insert a photo row, or return the existing one for the same stored
    /// path.
    pub async fn insert_or_get_photo(
        &self,
        event_id: &str,
        filename: &str,
        filepath: &str,
    ) -> Result<PhotoRow> {
        if let Some(existing) = self.get_photo_by_filepath(filepath).await? {
            return Ok(existing);
        }

        let photo = sqlx::query_as::<_, PhotoRow>(
            r#"
            INSERT INTO photos (event_id, filename, filepath, uploaded_at, processed, face_count)
            VALUES ($1, $2, $3, $4, 0, 0)
            RETURNING *
            "#,
        )
        .bind(event_id)
        .bind(filename)
        .bind(filepath)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await
        .context("failed to insert photo")?;

        self.bump_generation();
        Ok(photo)
    }

    pub async fn get_photo(&self, photo_id: i64) -> Result<Option<PhotoRow>> {
        sqlx::query_as::<_, PhotoRow>("SELECT * FROM photos WHERE photo_id = $1")
            .bind(photo_id)
            .fetch_optional(&self.pool)
            .await
            .context("failed to get photo")
    }

    pub async fn get_photo_by_filepath(&self, filepath: &str) -> Result<Option<PhotoRow>> {
        sqlx::query_as::<_, PhotoRow>("SELECT * FROM photos WHERE filepath = $1")
            .bind(filepath)
            .fetch_optional(&self.pool)
            .await
            .context("failed to get photo by filepath")
    }

    pub async fn photos_for_event(&self, event_id: &str) -> Result<Vec<PhotoRow>> {
        sqlx::query_as::<_, PhotoRow>(
            "SELECT * FROM photos WHERE event_id = $1 ORDER BY photo_id",
        )
        .bind(event_id)
        .fetch_all(&self.pool)
        .await
        .context("failed to list photos for event")
    }

    /// Flip the processed flag inside the caller's transaction. The flag
    /// only ever goes false -> true here; a forced reprocess resets it
    /// through [`Self::clear_photo_results_tx`] first.
    pub async fn mark_processed_tx(
        &self,
        conn: &mut SqliteConnection,
        photo_id: i64,
    ) -> Result<()> {
        sqlx::query("UPDATE photos SET processed = 1 WHERE photo_id = $1")
            .bind(photo_id)
            .execute(conn)
            .await
            .context("failed to mark photo processed")?;
        Ok(())
    }

    /// Remove a photo's detections and associations and reset its
    /// processed flag, ahead of a forced reprocess. Landmark rows follow
    /// their detections by cascade; `face_count` follows via trigger.
    pub async fn clear_photo_results_tx(
        &self,
        conn: &mut SqliteConnection,
        photo_id: i64,
    ) -> Result<()> {
        sqlx::query("DELETE FROM face_detections WHERE photo_id = $1")
            .bind(photo_id)
            .execute(&mut *conn)
            .await
            .context("failed to clear photo detections")?;
        sqlx::query("DELETE FROM person_photos WHERE photo_id = $1")
            .bind(photo_id)
            .execute(&mut *conn)
            .await
            .context("failed to clear photo associations")?;
        sqlx::query("UPDATE photos SET processed = 0 WHERE photo_id = $1")
            .bind(photo_id)
            .execute(&mut *conn)
            .await
            .context("failed to reset processed flag")?;
        self.bump_generation();
        Ok(())
    }

    pub async fn delete_photo(&self, photo_id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM photos WHERE photo_id = $1")
            .bind(photo_id)
            .execute(&self.pool)
            .await
            .context("failed to delete photo")?;
        self.bump_generation();
        Ok(result.rows_affected() > 0)
    }

    // ===== Detections & landmarks =====

    #[allow(clippy::too_many_arguments)]
    pub async fn insert_detection_tx(
        &self,
        conn: &mut SqliteConnection,
        photo_id: i64,
        person_id: Option<i64>,
        bbox: BoundingBox,
        detector: DetectorKind,
        confidence: f32,
        angle: FaceAngle,
        quality: QualityScores,
    ) -> Result<i64> {
        let row: (i64,) = sqlx::query_as(
            r#"
            INSERT INTO face_detections (
                photo_id, person_id,
                bbox_x, bbox_y, bbox_width, bbox_height,
                detector, confidence, angle,
                quality_blur, quality_lighting, quality_size, quality_overall,
                created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            RETURNING detection_id
            "#,
        )
        .bind(photo_id)
        .bind(person_id)
        .bind(bbox.x as i64)
        .bind(bbox.y as i64)
        .bind(bbox.width as i64)
        .bind(bbox.height as i64)
        .bind(detector.as_str())
        .bind(confidence as f64)
        .bind(angle.as_str())
        .bind(quality.blur as f64)
        .bind(quality.lighting as f64)
        .bind(quality.size as f64)
        .bind(quality.overall as f64)
        .bind(Utc::now())
        .fetch_one(conn)
        .await
        .context("failed to insert detection")?;

        self.bump_generation();
        Ok(row.0)
    }

    pub async fn insert_landmarks_tx(
        &self,
        conn: &mut SqliteConnection,
        detection_id: i64,
        landmarks: &NewLandmarks,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO face_landmarks (
                detection_id, points,
                eye_distance, nose_width, nose_height, jaw_width,
                has_glasses, has_facial_hair
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(detection_id)
        .bind(&landmarks.points)
        .bind(landmarks.eye_distance.map(|v| v as f64))
        .bind(landmarks.nose_width.map(|v| v as f64))
        .bind(landmarks.nose_height.map(|v| v as f64))
        .bind(landmarks.jaw_width.map(|v| v as f64))
        .bind(landmarks.has_glasses)
        .bind(landmarks.has_facial_hair)
        .execute(conn)
        .await
        .context("failed to insert landmarks")?;
        Ok(())
    }

    pub async fn detections_for_photo(&self, photo_id: i64) -> Result<Vec<DetectionRow>> {
        sqlx::query_as::<_, DetectionRow>(
            "SELECT * FROM face_detections WHERE photo_id = $1 ORDER BY detection_id",
        )
        .bind(photo_id)
        .fetch_all(&self.pool)
        .await
        .context("failed to list detections")
    }

    pub async fn landmarks_for_detection(&self, detection_id: i64) -> Result<Option<LandmarksRow>> {
        sqlx::query_as::<_, LandmarksRow>(
            "SELECT * FROM face_landmarks WHERE detection_id = $1",
        )
        .bind(detection_id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to get landmarks")
    }

    // ===== Embeddings =====

    /// Upsert in an internally managed transaction.
    pub async fn upsert_embedding(
        &self,
        person_id: i64,
        vector: &EmbeddingVector,
        angle: FaceAngle,
        quality: f32,
        detection_id: Option<i64>,
    ) -> Result<UpsertOutcome> {
        let mut tx = self.pool.begin().await.context("failed to begin transaction")?;
        let outcome = self
            .upsert_embedding_tx(&mut tx, person_id, vector, angle, quality, detection_id)
            .await?;
        tx.commit().await.context("failed to commit embedding upsert")?;
        Ok(outcome)
    }

    /// Capacity-bounded embedding admission, the single chokepoint for the
    /// eviction rule:
    ///
    /// 1. below capacity: insert unconditionally;
    /// 2. at capacity: the new embedding must beat the current minimum
    ///    quality strictly, evicting it (quality ties evict oldest first);
    /// 3. afterwards exactly one embedding holds `is_primary`, the highest
    ///    quality one (ties: most recent) — recomputed here, in the same
    ///    transaction.
    pub async fn upsert_embedding_tx(
        &self,
        conn: &mut SqliteConnection,
        person_id: i64,
        vector: &EmbeddingVector,
        angle: FaceAngle,
        quality: f32,
        detection_id: Option<i64>,
    ) -> Result<UpsertOutcome> {
        let existing: Vec<(i64, f64)> = sqlx::query_as(
            r#"
            SELECT embedding_id, quality FROM embeddings
            WHERE person_id = $1
            ORDER BY quality ASC, created_at ASC, embedding_id ASC
            "#,
        )
        .bind(person_id)
        .fetch_all(&mut *conn)
        .await
        .context("failed to read embedding set")?;

        let mut replaced_id = None;
        if existing.len() >= self.capacity {
            let (min_id, min_quality) = existing[0];
            if f64::from(quality) <= min_quality {
                debug!(
                    person_id,
                    quality,
                    min_quality,
                    "embedding rejected at capacity"
                );
                return Ok(UpsertOutcome {
                    accepted: false,
                    replaced_id: None,
                    embedding_id: None,
                });
            }

            sqlx::query("DELETE FROM embeddings WHERE embedding_id = $1")
                .bind(min_id)
                .execute(&mut *conn)
                .await
                .context("failed to evict minimum-quality embedding")?;
            replaced_id = Some(min_id);
        }

        let row: (i64,) = sqlx::query_as(
            r#"
            INSERT INTO embeddings (person_id, detection_id, vector, angle, quality, is_primary, created_at)
            VALUES ($1, $2, $3, $4, $5, 0, $6)
            RETURNING embedding_id
            "#,
        )
        .bind(person_id)
        .bind(detection_id)
        .bind(vector.to_blob())
        .bind(angle.as_str())
        .bind(quality as f64)
        .bind(Utc::now())
        .fetch_one(&mut *conn)
        .await
        .context("failed to insert embedding")?;

        self.recompute_primary_tx(conn, person_id).await?;
        self.bump_generation();

        Ok(UpsertOutcome {
            accepted: true,
            replaced_id,
            embedding_id: Some(row.0),
        })
    }

    /// Re-elect the primary embedding: highest quality, ties broken by
    /// recency then id.
    async fn recompute_primary_tx(
        &self,
        conn: &mut SqliteConnection,
        person_id: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE embeddings SET is_primary = (embedding_id = (
                SELECT embedding_id FROM embeddings
                WHERE person_id = $1
                ORDER BY quality DESC, created_at DESC, embedding_id DESC
                LIMIT 1
            ))
            WHERE person_id = $1
            "#,
        )
        .bind(person_id)
        .execute(conn)
        .await
        .context("failed to recompute primary embedding")?;
        Ok(())
    }

    pub async fn embeddings_for(
        &self,
        person_id: i64,
        angle: Option<FaceAngle>,
    ) -> Result<Vec<StoredEmbedding>> {
        let rows = match angle {
            Some(a) => {
                sqlx::query_as::<_, EmbeddingRow>(
                    "SELECT * FROM embeddings WHERE person_id = $1 AND angle = $2 ORDER BY embedding_id",
                )
                .bind(person_id)
                .bind(a.as_str())
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query_as::<_, EmbeddingRow>(
                    "SELECT * FROM embeddings WHERE person_id = $1 ORDER BY embedding_id",
                )
                .bind(person_id)
                .fetch_all(&self.pool)
                .await
            }
        }
        .context("failed to list embeddings")?;

        rows.into_iter().map(StoredEmbedding::try_from).collect()
    }

    pub async fn all_embeddings(&self) -> Result<Vec<StoredEmbedding>> {
        let rows = sqlx::query_as::<_, EmbeddingRow>(
            "SELECT * FROM embeddings ORDER BY embedding_id",
        )
        .fetch_all(&self.pool)
        .await
        .context("failed to list all embeddings")?;

        rows.into_iter().map(StoredEmbedding::try_from).collect()
    }

    // ===== Associations =====

    /// Associate in an internally managed transaction.
    pub async fn associate(
        &self,
        person_id: i64,
        photo_id: i64,
        face_count_in_photo: i64,
        match_confidence: f32,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await.context("failed to begin transaction")?;
        self.associate_tx(&mut tx, person_id, photo_id, face_count_in_photo, match_confidence)
            .await?;
        tx.commit().await.context("failed to commit association")?;
        Ok(())
    }

    /// Idempotent association upsert on `(person_id, photo_id)`: a repeat
    /// assert refreshes the confidence and face count, never duplicates.
    pub async fn associate_tx(
        &self,
        conn: &mut SqliteConnection,
        person_id: i64,
        photo_id: i64,
        face_count_in_photo: i64,
        match_confidence: f32,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO person_photos (person_id, photo_id, face_count_in_photo, match_confidence, created_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (person_id, photo_id) DO UPDATE SET
                match_confidence = excluded.match_confidence,
                face_count_in_photo = excluded.face_count_in_photo
            "#,
        )
        .bind(person_id)
        .bind(photo_id)
        .bind(face_count_in_photo)
        .bind(match_confidence as f64)
        .bind(Utc::now())
        .execute(conn)
        .await
        .context("failed to upsert association")?;

        self.bump_generation();
        Ok(())
    }

    /// A person's photos split into individual and group shots, each
    /// sorted by match confidence, strongest first.
    pub async fn photos_for_person(&self, person_id: i64) -> Result<PersonPhotos> {
        #[derive(sqlx::FromRow)]
        struct JoinedRow {
            photo_id: i64,
            event_id: String,
            filename: String,
            filepath: String,
            uploaded_at: chrono::DateTime<Utc>,
            processed: bool,
            face_count: i64,
            match_confidence: f64,
            face_count_in_photo: i64,
        }

        let rows = sqlx::query_as::<_, JoinedRow>(
            r#"
            SELECT
                p.photo_id, p.event_id, p.filename, p.filepath,
                p.uploaded_at, p.processed, p.face_count,
                pp.match_confidence, pp.face_count_in_photo
            FROM person_photos pp
            JOIN photos p ON p.photo_id = pp.photo_id
            WHERE pp.person_id = $1
            ORDER BY pp.match_confidence DESC, p.photo_id
            "#,
        )
        .bind(person_id)
        .fetch_all(&self.pool)
        .await
        .context("failed to list photos for person")?;

        let mut result = PersonPhotos::default();
        for row in rows {
            let item = PhotoMatch {
                photo: PhotoRow {
                    photo_id: row.photo_id,
                    event_id: row.event_id,
                    filename: row.filename,
                    filepath: row.filepath,
                    uploaded_at: row.uploaded_at,
                    processed: row.processed,
                    face_count: row.face_count,
                },
                match_confidence: row.match_confidence as f32,
                face_count_in_photo: row.face_count_in_photo,
            };
            if item.is_group() {
                result.group.push(item);
            } else {
                result.individual.push(item);
            }
        }
        Ok(result)
    }

    pub async fn association_count(&self, person_id: i64, photo_id: i64) -> Result<i64> {
        let row: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM person_photos WHERE person_id = $1 AND photo_id = $2",
        )
        .bind(person_id)
        .bind(photo_id)
        .fetch_one(&self.pool)
        .await
        .context("failed to count associations")?;
        Ok(row.0)
    }

    // ===== Status =====

    pub async fn status(&self) -> Result<StoreStatus> {
        let photos: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM photos")
            .fetch_one(&self.pool)
            .await?;
        let unprocessed: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM photos WHERE processed = 0")
                .fetch_one(&self.pool)
                .await?;
        let persons: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM persons")
            .fetch_one(&self.pool)
            .await?;
        let embeddings: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM embeddings")
            .fetch_one(&self.pool)
            .await?;
        let detections: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM face_detections")
            .fetch_one(&self.pool)
            .await?;

        Ok(StoreStatus {
            photos: photos.0,
            unprocessed_photos: unprocessed.0,
            persons: persons.0,
            embeddings: embeddings.0,
            detections: detections.0,
        })
    }
}
