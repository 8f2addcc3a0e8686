//! Weighted nearest-neighbour identity matching over the embedding store.
//!
//! Distances are Euclidean over the 128-D vectors. A candidate person
//! matches iff their best embedding distance is at or below the threshold
//! tau; confidence blends distance with stored quality and is weighted by
//! the stored angle so frontal evidence always counts for more than
//! profile evidence. A snapshot of the store is cached with a TTL and is
//! additionally invalidated by every store mutation.

use anyhow::Result;
use common::{AngleWeights, CoreConfig, EmbeddingVector, FaceAngle};
use identity_store::{IdentityRepository, StoredEmbedding};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::debug;

/// A successful identification.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FaceMatch {
    pub person_id: i64,
    pub confidence: f32,
    pub distance: f32,
}

/// Result of a match query. An empty store or a sub-threshold best
/// candidate is `NoMatch`, which is an ordinary value, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum MatchOutcome {
    Match(FaceMatch),
    NoMatch,
}

impl MatchOutcome {
    pub fn matched(&self) -> Option<&FaceMatch> {
        match self {
            MatchOutcome::Match(m) => Some(m),
            MatchOutcome::NoMatch => None,
        }
    }
}

/// One neighbour from a similarity query.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SimilarFace {
    pub person_id: i64,
    pub distance: f32,
    pub confidence: f32,
}

struct Snapshot {
    embeddings: Arc<Vec<StoredEmbedding>>,
    taken_at: Instant,
    generation: u64,
}

pub struct FaceMatcher {
    repo: IdentityRepository,
    threshold: f32,
    weights: AngleWeights,
    cache_ttl: Duration,
    cache: RwLock<Option<Snapshot>>,
}

impl FaceMatcher {
    pub fn new(repo: IdentityRepository, config: &CoreConfig) -> Self {
        Self {
            repo,
            threshold: config.match_threshold,
            weights: config.angle_weights,
            cache_ttl: Duration::from_secs(config.cache_ttl_seconds),
            cache: RwLock::new(None),
        }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Identify a single query embedding. The angle hint names the
    /// query's own pose; scoring weights depend on the *stored* angle.
    pub async fn match_one(
        &self,
        embedding: &EmbeddingVector,
        angle_hint: Option<FaceAngle>,
    ) -> Result<MatchOutcome> {
        let queries = [(angle_hint.unwrap_or(FaceAngle::Frontal), embedding.clone())];
        self.match_multi(&queries).await
    }

    /// Identify from one embedding per captured angle. Each person is
    /// scored by the mean of their best weighted confidence across the
    /// query angles; the winner must also have a best raw distance within
    /// the threshold.
    pub async fn match_multi(
        &self,
        queries: &[(FaceAngle, EmbeddingVector)],
    ) -> Result<MatchOutcome> {
        if queries.is_empty() {
            return Ok(MatchOutcome::NoMatch);
        }

        let snapshot = self.snapshot().await?;
        if snapshot.is_empty() {
            return Ok(MatchOutcome::NoMatch);
        }

        use std::collections::HashMap;
        struct PersonScore {
            confidence_sum: f32,
            angles_hit: usize,
            best_distance: f32,
        }
        let mut scores: HashMap<i64, PersonScore> = HashMap::new();

        for (_query_angle, query) in queries {
            // Best weighted confidence (and best distance) per person for
            // this query.
            let mut best: HashMap<i64, (f32, f32)> = HashMap::new();
            for stored in snapshot.iter() {
                let distance = query.distance(&stored.vector);
                let confidence = self.embedding_confidence(distance, stored);
                let entry = best
                    .entry(stored.person_id)
                    .or_insert((f32::NEG_INFINITY, f32::INFINITY));
                if confidence > entry.0 {
                    entry.0 = confidence;
                }
                if distance < entry.1 {
                    entry.1 = distance;
                }
            }

            for (person_id, (confidence, distance)) in best {
                let entry = scores.entry(person_id).or_insert(PersonScore {
                    confidence_sum: 0.0,
                    angles_hit: 0,
                    best_distance: f32::INFINITY,
                });
                entry.confidence_sum += confidence;
                entry.angles_hit += 1;
                if distance < entry.best_distance {
                    entry.best_distance = distance;
                }
            }
        }

        // Only persons whose best raw distance clears the threshold are
        // candidates; a heavily-weighted embedding beyond tau must not
        // shadow an in-threshold person.
        let winner = scores
            .into_iter()
            .filter(|(_, s)| s.best_distance <= self.threshold)
            .map(|(person_id, s)| {
                (
                    person_id,
                    s.confidence_sum / s.angles_hit as f32,
                    s.best_distance,
                )
            })
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

        match winner {
            Some((person_id, confidence, distance)) => {
                debug!(person_id, confidence, distance, "match");
                Ok(MatchOutcome::Match(FaceMatch {
                    person_id,
                    confidence,
                    distance,
                }))
            }
            None => {
                debug!(threshold = self.threshold, "no candidate within threshold");
                Ok(MatchOutcome::NoMatch)
            }
        }
    }

    /// Top-k nearest persons by their best embedding distance, nearest
    /// first. Results are not threshold-gated; callers see the distance.
    pub async fn similar(&self, embedding: &EmbeddingVector, k: usize) -> Result<Vec<SimilarFace>> {
        let snapshot = self.snapshot().await?;

        use std::collections::HashMap;
        let mut best: HashMap<i64, (f32, f32)> = HashMap::new();
        for stored in snapshot.iter() {
            let distance = embedding.distance(&stored.vector);
            let confidence = self.embedding_confidence(distance, stored);
            let entry = best
                .entry(stored.person_id)
                .or_insert((f32::INFINITY, f32::NEG_INFINITY));
            if distance < entry.0 {
                entry.0 = distance;
            }
            if confidence > entry.1 {
                entry.1 = confidence;
            }
        }

        let mut neighbours: Vec<SimilarFace> = best
            .into_iter()
            .map(|(person_id, (distance, confidence))| SimilarFace {
                person_id,
                distance,
                confidence,
            })
            .collect();
        neighbours.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        neighbours.truncate(k);
        Ok(neighbours)
    }

    /// Weighted confidence of one stored embedding against a query at the
    /// given distance.
    fn embedding_confidence(&self, distance: f32, stored: &StoredEmbedding) -> f32 {
        let base = (-f64::from(distance)).exp() as f32;
        self.weights.for_angle(stored.angle) * (0.7 * base + 0.3 * stored.quality)
    }

    /// Drop the snapshot; the next query re-reads the store.
    pub async fn clear_cache(&self) {
        let mut cache = self.cache.write().await;
        *cache = None;
    }

    /// Age of the current snapshot, if one is held.
    pub async fn cache_age(&self) -> Option<Duration> {
        let cache = self.cache.read().await;
        cache.as_ref().map(|s| s.taken_at.elapsed())
    }

    /// Current snapshot, refreshed when absent, expired, or stale against
    /// the repository's mutation generation.
    async fn snapshot(&self) -> Result<Arc<Vec<StoredEmbedding>>> {
        let generation = self.repo.mutation_generation();
        {
            let cache = self.cache.read().await;
            if let Some(snapshot) = cache.as_ref() {
                if snapshot.taken_at.elapsed() <= self.cache_ttl
                    && snapshot.generation == generation
                {
                    return Ok(Arc::clone(&snapshot.embeddings));
                }
            }
        }

        let mut cache = self.cache.write().await;
        // Another task may have refreshed while we waited for the lock.
        if let Some(snapshot) = cache.as_ref() {
            if snapshot.taken_at.elapsed() <= self.cache_ttl && snapshot.generation == generation {
                return Ok(Arc::clone(&snapshot.embeddings));
            }
        }

        let embeddings = Arc::new(self.repo.all_embeddings().await?);
        debug!(count = embeddings.len(), "matcher snapshot refreshed");
        *cache = Some(Snapshot {
            embeddings: Arc::clone(&embeddings),
            taken_at: Instant::now(),
            generation,
        });
        Ok(embeddings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::EMBEDDING_DIM;

    async fn setup() -> (IdentityRepository, FaceMatcher) {
        let pool = identity_store::connect_in_memory().await.unwrap();
        let repo = IdentityRepository::new(pool, 5);
        let matcher = FaceMatcher::new(repo.clone(), &CoreConfig::default());
        (repo, matcher)
    }

    /// Embedding whose distance to the zero vector is exactly `d`.
    fn offset_vector(d: f32) -> EmbeddingVector {
        let mut values = [0.0f32; EMBEDDING_DIM];
        values[0] = d;
        EmbeddingVector::from_slice(&values).unwrap()
    }

    fn zero_vector() -> EmbeddingVector {
        EmbeddingVector::from_slice(&[0.0; EMBEDDING_DIM]).unwrap()
    }

    #[tokio::test]
    async fn empty_store_is_no_match() {
        let (_repo, matcher) = setup().await;
        let outcome = matcher.match_one(&zero_vector(), None).await.unwrap();
        assert_eq!(outcome, MatchOutcome::NoMatch);
    }

    #[tokio::test]
    async fn threshold_is_inclusive_below_and_exclusive_above() {
        let (repo, matcher) = setup().await;
        let person = repo.add_person(None, None).await.unwrap();
        repo.upsert_embedding(
            person.person_id,
            &offset_vector(0.60),
            FaceAngle::Frontal,
            0.9,
            None,
        )
        .await
        .unwrap();

        // Winning distance exactly tau: a match.
        let outcome = matcher.match_one(&zero_vector(), None).await.unwrap();
        let m = outcome.matched().expect("distance == tau must match");
        assert_eq!(m.person_id, person.person_id);
        assert!((m.distance - 0.60).abs() < 1e-6);

        // A hair beyond tau: no match.
        let far = matcher
            .match_one(&offset_vector(-0.001), None)
            .await
            .unwrap();
        assert_eq!(far, MatchOutcome::NoMatch);
    }

    #[tokio::test]
    async fn identical_embedding_matches_at_distance_zero() {
        let (repo, matcher) = setup().await;
        let person = repo.add_person(None, None).await.unwrap();
        let stored = offset_vector(0.3);
        repo.upsert_embedding(person.person_id, &stored, FaceAngle::Left45, 0.85, None)
            .await
            .unwrap();

        let m = matcher
            .match_one(&stored, Some(FaceAngle::Left45))
            .await
            .unwrap();
        let m = m.matched().unwrap();
        assert_eq!(m.distance, 0.0);
        // w=0.8, base=exp(0)=1: 0.8 * (0.7 + 0.3*0.85) = 0.764.
        assert!((m.confidence - 0.764).abs() < 1e-4);
    }

    #[tokio::test]
    async fn frontal_outweighs_half_profile_outweighs_full_profile() {
        // Identical distance and quality; only the stored angle differs.
        let (_repo, matcher) = setup().await;
        let stored = |angle| StoredEmbedding {
            embedding_id: 1,
            person_id: 1,
            angle,
            quality: 0.8,
            is_primary: true,
            vector: zero_vector(),
        };

        for distance in [0.0f32, 0.25, 0.59] {
            let frontal = matcher.embedding_confidence(distance, &stored(FaceAngle::Frontal));
            let left_half = matcher.embedding_confidence(distance, &stored(FaceAngle::Left45));
            let right_half = matcher.embedding_confidence(distance, &stored(FaceAngle::Right45));
            let left_full = matcher.embedding_confidence(distance, &stored(FaceAngle::Left90));
            let right_full = matcher.embedding_confidence(distance, &stored(FaceAngle::Right90));

            assert_eq!(left_half, right_half);
            assert_eq!(left_full, right_full);
            assert!(frontal > left_half, "distance {}", distance);
            assert!(left_half > left_full, "distance {}", distance);
        }
    }

    #[tokio::test]
    async fn over_threshold_high_scorer_does_not_shadow_in_threshold_person() {
        // A frontal embedding beyond tau can out-score an in-threshold
        // profile embedding on weighted confidence alone; the threshold
        // gate must apply before the winner is chosen, not after.
        let (repo, matcher) = setup().await;

        let decoy = repo.add_person(None, None).await.unwrap();
        repo.upsert_embedding(
            decoy.person_id,
            &offset_vector(0.61),
            FaceAngle::Frontal,
            0.9,
            None,
        )
        .await
        .unwrap();

        let target = repo.add_person(None, None).await.unwrap();
        repo.upsert_embedding(
            target.person_id,
            &offset_vector(0.40),
            FaceAngle::Left90,
            0.9,
            None,
        )
        .await
        .unwrap();

        let outcome = matcher.match_one(&zero_vector(), None).await.unwrap();
        let m = outcome.matched().expect("in-threshold person must match");
        assert_eq!(m.person_id, target.person_id);
        assert!((m.distance - 0.40).abs() < 1e-5);
    }

    #[tokio::test]
    async fn multi_angle_mean_prefers_consistent_person() {
        let (repo, matcher) = setup().await;

        // Person A matches both query angles closely.
        let a = repo.add_person(None, None).await.unwrap();
        repo.upsert_embedding(a.person_id, &offset_vector(0.1), FaceAngle::Frontal, 0.9, None)
            .await
            .unwrap();
        repo.upsert_embedding(a.person_id, &offset_vector(0.15), FaceAngle::Left45, 0.9, None)
            .await
            .unwrap();

        // Person B matches one angle perfectly but is far on the other.
        let b = repo.add_person(None, None).await.unwrap();
        repo.upsert_embedding(b.person_id, &zero_vector(), FaceAngle::Frontal, 0.9, None)
            .await
            .unwrap();
        repo.upsert_embedding(b.person_id, &offset_vector(1.8), FaceAngle::Left45, 0.9, None)
            .await
            .unwrap();

        let queries = [
            (FaceAngle::Frontal, offset_vector(0.1)),
            (FaceAngle::Left45, offset_vector(0.15)),
        ];
        let outcome = matcher.match_multi(&queries).await.unwrap();
        assert_eq!(outcome.matched().unwrap().person_id, a.person_id);
    }

    #[tokio::test]
    async fn similar_returns_sorted_top_k() {
        let (repo, matcher) = setup().await;
        let mut expected = Vec::new();
        for d in [0.9f32, 0.2, 0.5] {
            let person = repo.add_person(None, None).await.unwrap();
            repo.upsert_embedding(
                person.person_id,
                &offset_vector(d),
                FaceAngle::Frontal,
                0.8,
                None,
            )
            .await
            .unwrap();
            expected.push((person.person_id, d));
        }

        let neighbours = matcher.similar(&zero_vector(), 2).await.unwrap();
        assert_eq!(neighbours.len(), 2);
        assert!((neighbours[0].distance - 0.2).abs() < 1e-5);
        assert!((neighbours[1].distance - 0.5).abs() < 1e-5);
        assert!(neighbours[0].confidence > neighbours[1].confidence);

        // k larger than the population returns everyone.
        let all = matcher.similar(&zero_vector(), 10).await.unwrap();
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn store_mutations_invalidate_the_snapshot() {
        let (repo, matcher) = setup().await;
        let person = repo.add_person(None, None).await.unwrap();
        repo.upsert_embedding(person.person_id, &zero_vector(), FaceAngle::Frontal, 0.9, None)
            .await
            .unwrap();

        // Prime the cache.
        assert!(matcher
            .match_one(&zero_vector(), None)
            .await
            .unwrap()
            .matched()
            .is_some());

        // A mutation through the store must be visible immediately.
        repo.delete_person(person.person_id).await.unwrap();
        let outcome = matcher.match_one(&zero_vector(), None).await.unwrap();
        assert_eq!(outcome, MatchOutcome::NoMatch);
    }

    #[tokio::test]
    async fn clear_cache_forces_reload() {
        let (repo, matcher) = setup().await;
        let person = repo.add_person(None, None).await.unwrap();
        repo.upsert_embedding(person.person_id, &zero_vector(), FaceAngle::Frontal, 0.9, None)
            .await
            .unwrap();

        matcher.match_one(&zero_vector(), None).await.unwrap();
        assert!(matcher.cache_age().await.is_some());

        matcher.clear_cache().await;
        assert!(matcher.cache_age().await.is_none());
    }
}
