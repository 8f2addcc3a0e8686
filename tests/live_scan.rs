//! Live-scan state machine outcomes over scripted frame sources.

use common::{BoundingBox, CoreConfig, DetectionBox, DetectorKind};
use face_engine::{DetectorBackend, FaceDetector, FaceEngine, StaticDetector};
use identity_store::IdentityRepository;
use image::{Rgb, RgbImage};
use pipeline::{
    CaptureOutcome, CoreContext, LiveScanner, PhotoProcessor, ScanFailure, ScanOptions,
    ScanOutcome, ScriptedFrame, ScriptedSource,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const FACE: BoundingBox = BoundingBox {
    x: 100,
    y: 80,
    width: 160,
    height: 160,
};

fn paint_face(image: &mut RgbImage, bbox: BoundingBox, seed: u32) {
    for dy in 0..bbox.height {
        for dx in 0..bbox.width {
            let h = ((dx / 8)
                .wrapping_mul(31)
                .wrapping_add((dy / 8).wrapping_mul(17))
                .wrapping_add(seed.wrapping_mul(97)))
            .wrapping_mul(2654435761);
            let v = ((h >> 16) % 256) as u8;
            image.put_pixel(bbox.x + dx, bbox.y + dy, Rgb([v, v, v]));
        }
    }
}

fn frame_with_face(seed: u32) -> RgbImage {
    let mut image = RgbImage::from_pixel(640, 480, Rgb([128, 128, 128]));
    paint_face(&mut image, FACE, seed);
    image
}

fn frame_bytes(seed: u32) -> Vec<u8> {
    let mut bytes = Vec::new();
    image::DynamicImage::ImageRgb8(frame_with_face(seed))
        .write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png)
        .unwrap();
    bytes
}

async fn context(detect: bool) -> Arc<CoreContext> {
    let pool = identity_store::connect_in_memory().await.unwrap();
    let repo = IdentityRepository::new(pool, 5);
    let backend = if detect {
        StaticDetector::with_boxes(vec![DetectionBox {
            bbox: FACE,
            detector: DetectorKind::Haar,
            confidence: 0.75,
            landmarks: None,
        }])
    } else {
        StaticDetector::empty()
    };
    let detector = FaceDetector::with_backends(vec![DetectorBackend::Static(backend)]);
    let dir = tempfile::TempDir::new().unwrap();
    let blobs: Arc<dyn common::BlobStore> =
        Arc::new(common::FsBlobStore::new(dir.keep()));
    CoreContext::assemble(
        CoreConfig::default(),
        FaceEngine::scripted(detector),
        repo,
        blobs,
    )
}

fn options(min_quality: f32, interval: u32) -> ScanOptions {
    ScanOptions {
        timeout: Duration::from_secs(5),
        min_quality,
        frame_interval: interval,
    }
}

#[tokio::test]
async fn quality_gate_captures_first_good_frame() {
    let ctx = context(true).await;
    let scanner = LiveScanner::new(ctx);
    let mut source = ScriptedSource::from_images(vec![frame_with_face(1)]);
    let closed = source.closed_flag();

    let outcome = scanner
        .capture(&mut source, &options(0.5, 1), &CancellationToken::new())
        .await
        .unwrap();

    match outcome {
        CaptureOutcome::Captured(capture) => {
            assert!(capture.quality.overall >= 0.5);
            assert_eq!(capture.frames_seen, 1);
            assert_eq!(capture.crop.dimensions(), (FACE.width, FACE.height));
        }
        other => panic!("expected capture, got {:?}", other),
    }
    assert!(closed.load(std::sync::atomic::Ordering::Acquire));
}

#[tokio::test]
async fn stream_end_with_best_capture_still_captures() {
    // The gate is unreachable; the loop settles on the best frame seen.
    let ctx = context(true).await;
    let scanner = LiveScanner::new(ctx);
    let mut source =
        ScriptedSource::from_images(vec![frame_with_face(1), frame_with_face(2)]);

    let outcome = scanner
        .capture(&mut source, &options(1.1, 1), &CancellationToken::new())
        .await
        .unwrap();
    assert!(matches!(outcome, CaptureOutcome::Captured(_)));
}

#[tokio::test]
async fn no_face_ever_seen_fails_with_no_face() {
    let ctx = context(false).await;
    let scanner = LiveScanner::new(ctx);
    let mut source =
        ScriptedSource::from_images(vec![frame_with_face(1), frame_with_face(2)]);
    let closed = source.closed_flag();

    let outcome = scanner
        .capture(&mut source, &options(0.5, 1), &CancellationToken::new())
        .await
        .unwrap();
    assert!(matches!(outcome, CaptureOutcome::Failed(ScanFailure::NoFace)));
    assert!(closed.load(std::sync::atomic::Ordering::Acquire));
}

#[tokio::test]
async fn dead_device_fails_with_no_device() {
    let ctx = context(true).await;
    let scanner = LiveScanner::new(ctx);
    let mut source = ScriptedSource::new(vec![ScriptedFrame::Error(
        "cannot open /dev/video0".to_string(),
    )]);
    let closed = source.closed_flag();

    let outcome = scanner
        .capture(&mut source, &options(0.5, 1), &CancellationToken::new())
        .await
        .unwrap();
    assert!(matches!(
        outcome,
        CaptureOutcome::Failed(ScanFailure::NoDevice)
    ));
    assert!(closed.load(std::sync::atomic::Ordering::Acquire));
}

#[tokio::test]
async fn cancellation_wins_and_releases_the_camera() {
    let ctx = context(true).await;
    let scanner = LiveScanner::new(ctx);
    let mut source = ScriptedSource::from_images(vec![frame_with_face(1)]);
    let closed = source.closed_flag();

    let cancel = CancellationToken::new();
    cancel.cancel();

    let outcome = scanner
        .capture(&mut source, &options(0.5, 1), &cancel)
        .await
        .unwrap();
    assert!(matches!(outcome, CaptureOutcome::Cancelled));
    assert!(closed.load(std::sync::atomic::Ordering::Acquire));
}

#[tokio::test]
async fn only_every_nth_frame_is_inspected() {
    let ctx = context(true).await;
    let scanner = LiveScanner::new(ctx.clone());

    // Four frames at interval five: none inspected, no face acquired.
    let mut short = ScriptedSource::from_images(
        (0..4).map(|_| frame_with_face(1)).collect::<Vec<_>>(),
    );
    let outcome = scanner
        .capture(&mut short, &options(0.5, 5), &CancellationToken::new())
        .await
        .unwrap();
    assert!(matches!(outcome, CaptureOutcome::Failed(ScanFailure::NoFace)));

    // The fifth frame is the first one detected.
    let mut exact = ScriptedSource::from_images(
        (0..5).map(|_| frame_with_face(1)).collect::<Vec<_>>(),
    );
    let outcome = scanner
        .capture(&mut exact, &options(0.5, 5), &CancellationToken::new())
        .await
        .unwrap();
    match outcome {
        CaptureOutcome::Captured(capture) => assert_eq!(capture.frames_seen, 5),
        other => panic!("expected capture, got {:?}", other),
    }
}

#[tokio::test]
async fn full_scan_matches_enrolled_person_and_returns_photos() {
    let ctx = context(true).await;

    // Enroll via the photo pipeline: one individual photo of seed 9.
    let processor = PhotoProcessor::new(ctx.clone());
    let report = processor
        .process_bytes("gala", "a.png", "gala/a.png", &frame_bytes(9), false)
        .await
        .unwrap();
    assert_eq!(report.new_persons, 1);

    let scanner = LiveScanner::new(ctx.clone());
    let mut source = ScriptedSource::from_images(vec![frame_with_face(9)]);

    let outcome = scanner
        .scan_and_match(&mut source, &options(0.5, 1), &CancellationToken::new())
        .await
        .unwrap();

    match outcome {
        ScanOutcome::Matched {
            person_id,
            confidence,
            distance,
            photos,
            ..
        } => {
            assert!(distance < 1e-5, "identical capture, got distance {}", distance);
            assert!(confidence > 0.0 && confidence <= 1.0);
            assert_eq!(photos.individual.len(), 1);
            assert!(photos.group.is_empty());
            let person = ctx.repo.get_person(person_id).await.unwrap();
            assert!(person.is_some());
        }
        other => panic!("expected match, got {:?}", other),
    }
}

#[tokio::test]
async fn capture_against_empty_store_is_unmatched_not_error() {
    let ctx = context(true).await;
    let scanner = LiveScanner::new(ctx);
    let mut source = ScriptedSource::from_images(vec![frame_with_face(3)]);

    let outcome = scanner
        .scan_and_match(&mut source, &options(0.5, 1), &CancellationToken::new())
        .await
        .unwrap();
    assert!(matches!(outcome, ScanOutcome::Unmatched { .. }));
}
