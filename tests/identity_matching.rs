//! Store-and-matcher scenarios with exact expected values.

use common::{CoreConfig, EmbeddingVector, FaceAngle, EMBEDDING_DIM};
use identity_store::IdentityRepository;
use matcher::{FaceMatcher, MatchOutcome};

async fn setup() -> (IdentityRepository, FaceMatcher) {
    let pool = identity_store::connect_in_memory().await.unwrap();
    let repo = IdentityRepository::new(pool, 5);
    let matcher = FaceMatcher::new(repo.clone(), &CoreConfig::default());
    (repo, matcher)
}

fn basis_vector(component: usize, value: f32) -> EmbeddingVector {
    let mut values = [0.0f32; EMBEDDING_DIM];
    values[component] = value;
    EmbeddingVector::from_slice(&values).unwrap()
}

fn zero() -> EmbeddingVector {
    EmbeddingVector::from_slice(&[0.0; EMBEDDING_DIM]).unwrap()
}

#[tokio::test]
async fn cross_angle_retrieval_scores_the_identical_stored_angle() {
    // S2: three enrolled angles; a capture identical to the stored
    // left_45 embedding must match at distance zero with confidence
    // 0.8 * (0.7 * 1.0 + 0.3 * 0.85) = 0.764.
    let (repo, matcher) = setup().await;
    let person = repo.add_person(None, Some("A")).await.unwrap();

    let frontal = basis_vector(0, 2.0);
    let left = basis_vector(1, 2.0);
    let right = basis_vector(2, 2.0);

    repo.upsert_embedding(person.person_id, &frontal, FaceAngle::Frontal, 0.95, None)
        .await
        .unwrap();
    repo.upsert_embedding(person.person_id, &left, FaceAngle::Left45, 0.85, None)
        .await
        .unwrap();
    repo.upsert_embedding(person.person_id, &right, FaceAngle::Right45, 0.85, None)
        .await
        .unwrap();

    let outcome = matcher
        .match_one(&left, Some(FaceAngle::Left45))
        .await
        .unwrap();
    let m = outcome.matched().expect("identical capture must match");
    assert_eq!(m.person_id, person.person_id);
    assert_eq!(m.distance, 0.0);
    assert!((m.confidence - 0.764).abs() < 1e-4, "got {}", m.confidence);
}

#[tokio::test]
async fn capacity_eviction_scenario() {
    // S3: five embeddings at [0.50..0.90]. At capacity, admission
    // requires strictly beating the current minimum quality: 0.45 is
    // rejected outright, 0.55 evicts the 0.50 row, and 0.95 evicts the
    // new minimum and becomes primary.
    let (repo, _matcher) = setup().await;
    let person = repo.add_person(None, None).await.unwrap();
    let id = person.person_id;

    for (i, q) in [0.50f32, 0.60, 0.70, 0.80, 0.90].iter().enumerate() {
        repo.upsert_embedding(id, &basis_vector(i, 1.0), FaceAngle::Frontal, *q, None)
            .await
            .unwrap();
    }

    // Below the minimum: rejected, set unchanged.
    let rejected = repo
        .upsert_embedding(id, &basis_vector(9, 1.0), FaceAngle::Left45, 0.45, None)
        .await
        .unwrap();
    assert!(!rejected.accepted);

    let set = repo.embeddings_for(id, None).await.unwrap();
    assert_eq!(set.len(), 5);
    let mut qualities: Vec<f32> = set.iter().map(|e| e.quality).collect();
    qualities.sort_by(|a, b| a.partial_cmp(b).unwrap());
    assert!((qualities[0] - 0.50).abs() < 1e-6);

    // Strictly above the minimum: accepted, and exactly the minimum
    // (0.50) is the row that goes.
    let over_min = repo
        .upsert_embedding(id, &basis_vector(10, 1.0), FaceAngle::Left45, 0.55, None)
        .await
        .unwrap();
    assert!(over_min.accepted);
    assert!(over_min.replaced_id.is_some());

    let set = repo.embeddings_for(id, None).await.unwrap();
    assert_eq!(set.len(), 5);
    let mut qualities: Vec<f32> = set.iter().map(|e| e.quality).collect();
    qualities.sort_by(|a, b| a.partial_cmp(b).unwrap());
    assert!((qualities[0] - 0.55).abs() < 1e-6);

    let accepted = repo
        .upsert_embedding(id, &basis_vector(11, 1.0), FaceAngle::Left45, 0.95, None)
        .await
        .unwrap();
    assert!(accepted.accepted);
    assert!(accepted.replaced_id.is_some());

    let set = repo.embeddings_for(id, None).await.unwrap();
    assert_eq!(set.len(), 5);
    assert!(set.iter().all(|e| e.quality > 0.55));

    let primary: Vec<_> = set.iter().filter(|e| e.is_primary).collect();
    assert_eq!(primary.len(), 1);
    assert!((primary[0].quality - 0.95).abs() < 1e-6);
}

#[tokio::test]
async fn threshold_boundary_is_inclusive() {
    // S5: best distance exactly 0.60 matches; just above does not.
    let (repo, matcher) = setup().await;
    let person = repo.add_person(None, None).await.unwrap();
    repo.upsert_embedding(
        person.person_id,
        &basis_vector(0, 0.60),
        FaceAngle::Frontal,
        0.9,
        None,
    )
    .await
    .unwrap();

    let at_tau = matcher.match_one(&zero(), None).await.unwrap();
    assert!(at_tau.matched().is_some(), "distance == tau is a match");

    let beyond = matcher
        .match_one(&basis_vector(1, 0.001), None)
        .await
        .unwrap();
    assert_eq!(
        beyond,
        MatchOutcome::NoMatch,
        "distance just beyond tau must not match"
    );
}

#[tokio::test]
async fn empty_store_returns_no_match_not_error() {
    let (_repo, matcher) = setup().await;
    assert_eq!(
        matcher.match_one(&zero(), None).await.unwrap(),
        MatchOutcome::NoMatch
    );
    assert!(matcher.similar(&zero(), 3).await.unwrap().is_empty());
}

#[tokio::test]
async fn every_person_stays_within_capacity_under_churn() {
    let (repo, _matcher) = setup().await;
    let a = repo.add_person(None, None).await.unwrap().person_id;
    let b = repo.add_person(None, None).await.unwrap().person_id;

    for i in 0..20 {
        let quality = 0.30 + (i as f32) * 0.03;
        repo.upsert_embedding(
            a,
            &basis_vector(i % EMBEDDING_DIM, 1.0),
            FaceAngle::ALL[i % 5],
            quality,
            None,
        )
        .await
        .unwrap();
        repo.upsert_embedding(
            b,
            &basis_vector((i + 3) % EMBEDDING_DIM, 1.0),
            FaceAngle::ALL[(i + 2) % 5],
            1.0 - quality,
            None,
        )
        .await
        .unwrap();
    }

    for person in [a, b] {
        let set = repo.embeddings_for(person, None).await.unwrap();
        assert!(set.len() <= 5, "person {} holds {}", person, set.len());
        assert_eq!(set.iter().filter(|e| e.is_primary).count(), 1);

        let max = set.iter().map(|e| e.quality).fold(f32::MIN, f32::max);
        let primary = set.iter().find(|e| e.is_primary).unwrap();
        assert!((primary.quality - max).abs() < 1e-6);
    }
}
