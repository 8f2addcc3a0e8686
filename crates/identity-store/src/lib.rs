//! Relational identity store: persons, photos, detections, bounded
//! multi-angle embedding sets and photo associations, over SQLite.

pub mod models;
pub mod repository;

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;

pub use models::{
    DetectionRow, EmbeddingRow, LandmarksRow, NewLandmarks, PersonPhotos, PersonRow, PhotoMatch,
    PhotoRow, StoreStatus, StoredEmbedding, UpsertOutcome,
};
pub use repository::IdentityRepository;

/// Embedded schema migrations.
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// Open (creating if missing) a database at the given sqlite URL and run
/// migrations. Foreign keys and recursive triggers are enabled so schema
/// cascades and counter triggers behave as declared.
pub async fn connect(database_url: &str) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(database_url)
        .context("invalid database url")?
        .create_if_missing(true)
        .foreign_keys(true)
        .pragma("recursive_triggers", "ON");

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .context("failed to connect to database")?;

    MIGRATOR
        .run(&pool)
        .await
        .context("failed to run migrations")?;

    Ok(pool)
}

/// An isolated in-memory database, used by the test suites. The pool is
/// pinned to a single never-expiring connection — a second connection
/// would see a different empty database.
pub async fn connect_in_memory() -> Result<SqlitePool> {
    let options = SqliteConnectOptions::new()
        .in_memory(true)
        .foreign_keys(true)
        .pragma("recursive_triggers", "ON");

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await
        .context("failed to open in-memory database")?;

    MIGRATOR
        .run(&pool)
        .await
        .context("failed to run migrations")?;

    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{BoundingBox, DetectorKind, EmbeddingVector, FaceAngle, QualityScores};

    async fn repo() -> IdentityRepository {
        let pool = connect_in_memory().await.unwrap();
        IdentityRepository::new(pool, 5)
    }

    fn vector(fill: f32) -> EmbeddingVector {
        EmbeddingVector::from_slice(&[fill; common::EMBEDDING_DIM]).unwrap()
    }

    fn quality(overall_ish: f32) -> QualityScores {
        QualityScores::blend(overall_ish, overall_ish, overall_ish)
    }

    async fn insert_detection(
        repo: &IdentityRepository,
        photo_id: i64,
        person_id: Option<i64>,
    ) -> i64 {
        let mut tx = repo.pool().begin().await.unwrap();
        let id = repo
            .insert_detection_tx(
                &mut tx,
                photo_id,
                person_id,
                BoundingBox::new(10, 10, 100, 100),
                DetectorKind::Haar,
                0.75,
                FaceAngle::Frontal,
                quality(0.8),
            )
            .await
            .unwrap();
        tx.commit().await.unwrap();
        id
    }

    #[tokio::test]
    async fn person_round_trip() {
        let repo = repo().await;
        let person = repo.add_person(None, Some("Ada")).await.unwrap();
        assert_eq!(person.name.as_deref(), Some("Ada"));
        assert_eq!(person.photo_count, 0);

        let by_id = repo.get_person(person.person_id).await.unwrap().unwrap();
        assert_eq!(by_id.person_uuid, person.person_uuid);

        let by_uuid = repo
            .get_person_by_uuid(&person.person_uuid)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_uuid.person_id, person.person_id);
    }

    #[tokio::test]
    async fn capacity_is_enforced_with_strict_quality_eviction() {
        let repo = repo().await;
        let person = repo.add_person(None, None).await.unwrap();
        let id = person.person_id;

        for (i, q) in [0.50f32, 0.60, 0.70, 0.80, 0.90].iter().enumerate() {
            let outcome = repo
                .upsert_embedding(id, &vector(i as f32), FaceAngle::Frontal, *q, None)
                .await
                .unwrap();
            assert!(outcome.accepted);
            assert!(outcome.replaced_id.is_none());
        }
        assert_eq!(repo.embeddings_for(id, None).await.unwrap().len(), 5);

        // Below the minimum: rejected, set unchanged.
        let rejected = repo
            .upsert_embedding(id, &vector(9.0), FaceAngle::Left45, 0.55, None)
            .await
            .unwrap();
        assert!(!rejected.accepted);
        let set = repo.embeddings_for(id, None).await.unwrap();
        assert_eq!(set.len(), 5);
        assert!(set.iter().any(|e| (e.quality - 0.50).abs() < 1e-6));

        // Equal to the minimum: still rejected (strictly greater required).
        let equal = repo
            .upsert_embedding(id, &vector(9.0), FaceAngle::Left45, 0.50, None)
            .await
            .unwrap();
        assert!(!equal.accepted);

        // Better than the minimum: evicts exactly the minimum.
        let accepted = repo
            .upsert_embedding(id, &vector(9.0), FaceAngle::Left45, 0.95, None)
            .await
            .unwrap();
        assert!(accepted.accepted);
        assert!(accepted.replaced_id.is_some());

        let set = repo.embeddings_for(id, None).await.unwrap();
        assert_eq!(set.len(), 5);
        assert!(!set.iter().any(|e| (e.quality - 0.50).abs() < 1e-6));
        let min = set
            .iter()
            .map(|e| e.quality)
            .fold(f32::INFINITY, f32::min);
        assert!((min - 0.60).abs() < 1e-6);
    }

    #[tokio::test]
    async fn primary_tracks_maximum_quality() {
        let repo = repo().await;
        let id = repo.add_person(None, None).await.unwrap().person_id;

        repo.upsert_embedding(id, &vector(1.0), FaceAngle::Frontal, 0.70, None)
            .await
            .unwrap();
        let set = repo.embeddings_for(id, None).await.unwrap();
        assert_eq!(set.iter().filter(|e| e.is_primary).count(), 1);

        repo.upsert_embedding(id, &vector(2.0), FaceAngle::Left45, 0.90, None)
            .await
            .unwrap();
        repo.upsert_embedding(id, &vector(3.0), FaceAngle::Right45, 0.80, None)
            .await
            .unwrap();

        let set = repo.embeddings_for(id, None).await.unwrap();
        let primaries: Vec<_> = set.iter().filter(|e| e.is_primary).collect();
        assert_eq!(primaries.len(), 1);
        assert!((primaries[0].quality - 0.90).abs() < 1e-6);
        assert_eq!(primaries[0].angle, FaceAngle::Left45);
    }

    #[tokio::test]
    async fn quality_ties_evict_oldest_first() {
        let repo = repo().await;
        let id = repo.add_person(None, None).await.unwrap().person_id;

        let mut first_id = None;
        for i in 0..5 {
            let outcome = repo
                .upsert_embedding(id, &vector(i as f32), FaceAngle::Frontal, 0.50, None)
                .await
                .unwrap();
            if i == 0 {
                first_id = outcome.embedding_id;
            }
        }

        let outcome = repo
            .upsert_embedding(id, &vector(7.0), FaceAngle::Frontal, 0.60, None)
            .await
            .unwrap();
        assert!(outcome.accepted);
        assert_eq!(outcome.replaced_id, first_id);
    }

    #[tokio::test]
    async fn association_is_idempotent_and_updates_confidence() {
        let repo = repo().await;
        let person = repo.add_person(None, None).await.unwrap();
        let photo = repo
            .insert_or_get_photo("gala", "a.jpg", "gala/a.jpg")
            .await
            .unwrap();

        repo.associate(person.person_id, photo.photo_id, 1, 0.80)
            .await
            .unwrap();
        repo.associate(person.person_id, photo.photo_id, 3, 0.95)
            .await
            .unwrap();

        assert_eq!(
            repo.association_count(person.person_id, photo.photo_id)
                .await
                .unwrap(),
            1
        );

        let photos = repo.photos_for_person(person.person_id).await.unwrap();
        assert!(photos.individual.is_empty());
        assert_eq!(photos.group.len(), 1);
        assert!((photos.group[0].match_confidence - 0.95).abs() < 1e-6);

        // The counter trigger saw one insert, not two.
        let person = repo.get_person(person.person_id).await.unwrap().unwrap();
        assert_eq!(person.photo_count, 1);
    }

    #[tokio::test]
    async fn face_count_follows_detections() {
        let repo = repo().await;
        let photo = repo
            .insert_or_get_photo("gala", "b.jpg", "gala/b.jpg")
            .await
            .unwrap();
        assert_eq!(photo.face_count, 0);

        insert_detection(&repo, photo.photo_id, None).await;
        insert_detection(&repo, photo.photo_id, None).await;

        let photo = repo.get_photo(photo.photo_id).await.unwrap().unwrap();
        assert_eq!(photo.face_count, 2);

        let mut tx = repo.pool().begin().await.unwrap();
        repo.clear_photo_results_tx(&mut tx, photo.photo_id)
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let photo = repo.get_photo(photo.photo_id).await.unwrap().unwrap();
        assert_eq!(photo.face_count, 0);
        assert!(!photo.processed);
    }

    #[tokio::test]
    async fn deleting_a_person_cascades_embeddings_and_associations_only() {
        let repo = repo().await;
        let person = repo.add_person(None, None).await.unwrap();
        let photo = repo
            .insert_or_get_photo("gala", "c.jpg", "gala/c.jpg")
            .await
            .unwrap();

        let detection_id = insert_detection(&repo, photo.photo_id, Some(person.person_id)).await;
        repo.upsert_embedding(
            person.person_id,
            &vector(1.0),
            FaceAngle::Frontal,
            0.9,
            Some(detection_id),
        )
        .await
        .unwrap();
        repo.associate(person.person_id, photo.photo_id, 1, 0.9)
            .await
            .unwrap();

        assert!(repo.delete_person(person.person_id).await.unwrap());

        // Embeddings and associations are gone.
        assert!(repo.all_embeddings().await.unwrap().is_empty());
        assert_eq!(
            repo.association_count(person.person_id, photo.photo_id)
                .await
                .unwrap(),
            0
        );

        // The detection survives with its person reference cleared, so
        // the photo's face count is untouched.
        let detections = repo.detections_for_photo(photo.photo_id).await.unwrap();
        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].person_id, None);
        let photo = repo.get_photo(photo.photo_id).await.unwrap().unwrap();
        assert_eq!(photo.face_count, 1);
    }

    #[tokio::test]
    async fn deleting_a_photo_cascades_detections_landmarks_and_associations() {
        let repo = repo().await;
        let person = repo.add_person(None, None).await.unwrap();
        let photo = repo
            .insert_or_get_photo("gala", "d.jpg", "gala/d.jpg")
            .await
            .unwrap();
        let detection_id = insert_detection(&repo, photo.photo_id, Some(person.person_id)).await;

        let mut tx = repo.pool().begin().await.unwrap();
        repo.insert_landmarks_tx(
            &mut tx,
            detection_id,
            &NewLandmarks {
                points: vec![0u8; common::LANDMARK_POINTS * 8],
                eye_distance: Some(40.0),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();

        repo.associate(person.person_id, photo.photo_id, 1, 0.9)
            .await
            .unwrap();

        assert!(repo.delete_photo(photo.photo_id).await.unwrap());

        assert!(repo
            .detections_for_photo(photo.photo_id)
            .await
            .unwrap()
            .is_empty());
        assert!(repo
            .landmarks_for_detection(detection_id)
            .await
            .unwrap()
            .is_none());
        assert_eq!(
            repo.association_count(person.person_id, photo.photo_id)
                .await
                .unwrap(),
            0
        );

        // The person survives, and the counter trigger saw the cascade.
        let person = repo.get_person(person.person_id).await.unwrap().unwrap();
        assert_eq!(person.photo_count, 0);
    }

    #[tokio::test]
    async fn embedding_blob_round_trips_through_store() {
        let repo = repo().await;
        let id = repo.add_person(None, None).await.unwrap().person_id;

        let mut values = [0.0f32; common::EMBEDDING_DIM];
        for (i, v) in values.iter_mut().enumerate() {
            *v = (i as f32).sin();
        }
        let original = EmbeddingVector::from_slice(&values).unwrap();
        repo.upsert_embedding(id, &original, FaceAngle::Right90, 0.8, None)
            .await
            .unwrap();

        let stored = repo.embeddings_for(id, Some(FaceAngle::Right90)).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].vector, original);
        assert_eq!(stored[0].angle, FaceAngle::Right90);

        assert!(repo
            .embeddings_for(id, Some(FaceAngle::Frontal))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn mutation_generation_moves_on_writes() {
        let repo = repo().await;
        let g0 = repo.mutation_generation();
        let person = repo.add_person(None, None).await.unwrap();
        assert!(repo.mutation_generation() > g0);

        let g1 = repo.mutation_generation();
        repo.upsert_embedding(person.person_id, &vector(0.5), FaceAngle::Frontal, 0.5, None)
            .await
            .unwrap();
        assert!(repo.mutation_generation() > g1);

        let g2 = repo.mutation_generation();
        repo.get_person(person.person_id).await.unwrap();
        assert_eq!(repo.mutation_generation(), g2);
    }
}
