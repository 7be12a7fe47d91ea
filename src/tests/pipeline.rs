//! End-to-end tests over the full enroll -> rebuild -> match pipeline,
//! using synthetic face images and a real on-disk store.

use std::sync::Arc;

use image::{DynamicImage, Rgb, RgbImage};

use crate::builder::IndexBuilder;
use crate::cache::IndexCache;
use crate::face::{FaceEncoder, FaceSelection, EMBEDDING_DIM, ENCODER_ID};
use crate::matcher::{DiskSource, Matcher, DEFAULT_THRESHOLD};
use crate::persist::IndexFiles;
use crate::store::{CsvStore, EmbeddingStore};

const BACKGROUND: Rgb<u8> = Rgb([30, 60, 200]);

/// A synthetic "face": a skin-toned patch with a seeded stripe texture so
/// different seeds produce measurably different embeddings.
fn face_image(seed: u32) -> DynamicImage {
    let mut img = RgbImage::from_pixel(128, 128, BACKGROUND);
    for py in 30..100 {
        for px in 30..100 {
            let stripe = (px + py * (1 + seed % 5)) % (3 + seed % 4) == 0;
            let pixel = if stripe {
                Rgb([200, 140 + (seed % 40) as u8, 110])
            } else {
                Rgb([225, 175, 135])
            };
            img.put_pixel(px, py, pixel);
        }
    }
    DynamicImage::ImageRgb8(img)
}

fn matcher_in(dir: &std::path::Path) -> Matcher {
    let store: Arc<dyn EmbeddingStore> = Arc::new(CsvStore::new(dir.join("faces.csv")));
    let batch_size = 2;

    let source = DiskSource::new(
        IndexFiles::in_dir(dir),
        IndexBuilder::new(store.clone(), EMBEDDING_DIM, batch_size),
        EMBEDDING_DIM,
        ENCODER_ID,
    );
    let cache = Arc::new(IndexCache::new(Arc::new(source), true));

    Matcher::new(
        FaceEncoder::new(FaceSelection::First),
        cache,
        IndexBuilder::new(store.clone(), EMBEDDING_DIM, batch_size),
        IndexFiles::in_dir(dir),
        store,
        DEFAULT_THRESHOLD,
        ENCODER_ID,
    )
}

#[test]
fn test_enroll_rebuild_match() {
    let dir = tempfile::tempdir().unwrap();
    let matcher = matcher_in(dir.path());

    for (identifier, seed) in [("ada.jpg", 1), ("ben.jpg", 7), ("eva.jpg", 13)] {
        let embedding = matcher
            .enroll(&face_image(seed), identifier, Some(identifier.to_string()))
            .unwrap();
        assert_eq!(embedding.len(), EMBEDDING_DIM);
    }

    let report = matcher.rebuild_index(None).unwrap();
    assert_eq!(report.rows_scanned, 3);
    assert_eq!(report.rows_indexed, 3);
    assert_eq!(report.vector_count, 3);

    // Querying with ada's own image must rank ada first at ~100%.
    let results = matcher
        .extract_and_find_similar(&face_image(1), 3)
        .unwrap();
    assert_eq!(results.len(), 3);
    assert_eq!(results[0].identifier, "ada.jpg");
    assert!(results[0].similarity_percent > 99.0);
    assert_eq!(results[0].rank, 1);
    assert!(results[0].distance <= results[1].distance);
    assert!(results[1].distance <= results[2].distance);
}

#[test]
fn test_warm_start_from_persisted_pair() {
    let dir = tempfile::tempdir().unwrap();

    {
        let matcher = matcher_in(dir.path());
        matcher
            .enroll(&face_image(3), "ada.jpg", Some("Ada".to_string()))
            .unwrap();
        matcher.rebuild_index(None).unwrap();
    }

    // A fresh engine over the same directory loads the persisted pair
    // instead of rebuilding; the label travels with it.
    let matcher = matcher_in(dir.path());
    let results = matcher
        .extract_and_find_similar(&face_image(3), 1)
        .unwrap();
    assert_eq!(results[0].identifier, "ada.jpg");
    assert_eq!(results[0].label.as_deref(), Some("Ada"));
}

#[test]
fn test_match_before_any_enrollment_is_empty() {
    let dir = tempfile::tempdir().unwrap();
    let matcher = matcher_in(dir.path());

    let results = matcher
        .extract_and_find_similar(&face_image(5), 10)
        .unwrap();
    assert!(results.is_empty());
}

#[test]
fn test_blank_query_image_is_no_face() {
    let dir = tempfile::tempdir().unwrap();
    let matcher = matcher_in(dir.path());

    let blank = DynamicImage::ImageRgb8(RgbImage::from_pixel(64, 64, BACKGROUND));
    let result = matcher.extract_and_find_similar(&blank, 10);
    assert!(result.is_err());
}

#[test]
fn test_reenroll_overwrites_and_rebuild_picks_it_up() {
    let dir = tempfile::tempdir().unwrap();
    let matcher = matcher_in(dir.path());

    matcher.enroll(&face_image(2), "ada.jpg", None).unwrap();
    matcher.enroll(&face_image(9), "ada.jpg", None).unwrap();

    let report = matcher.rebuild_index(None).unwrap();
    assert_eq!(report.vector_count, 1);

    let results = matcher
        .extract_and_find_similar(&face_image(9), 1)
        .unwrap();
    assert_eq!(results[0].identifier, "ada.jpg");
    assert!(results[0].similarity_percent > 99.0);
}

#[test]
fn test_rebuild_idempotent_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let matcher = matcher_in(dir.path());

    matcher.enroll(&face_image(2), "ada.jpg", None).unwrap();
    matcher.enroll(&face_image(4), "ben.jpg", None).unwrap();

    let first = matcher.rebuild_index(None).unwrap();
    let second = matcher.rebuild_index(None).unwrap();

    assert_eq!(first.vector_count, second.vector_count);

    let encoder = crate::persist::encoder_id_hash(ENCODER_ID);
    let (_, names, _) = IndexFiles::in_dir(dir.path())
        .load(&encoder, EMBEDDING_DIM)
        .unwrap();
    assert_eq!(names, vec!["ada.jpg", "ben.jpg"]);
}
