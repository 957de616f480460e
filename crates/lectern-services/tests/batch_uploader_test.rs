//! Sequential batch upload integration tests.

mod helpers;

use helpers::{fast_retry, lesson_template, lessons, ScriptedDocumentStore, ScriptedStorage, TestStorage};
use lectern_core::models::LessonKind;
use lectern_db::{DocumentStore, RecordFilter};
use lectern_services::{BatchControl, BatchItemError, LessonCatalog, SequentialBatchUploader};
use std::sync::Arc;

const FIVE: [(LessonKind, &str); 5] = [
    (LessonKind::Video, "a.mp4"),
    (LessonKind::Video, "b.mp4"),
    (LessonKind::Document, "c.pdf"),
    (LessonKind::Video, "d.mp4"),
    (LessonKind::Video, "e.mp4"),
];

#[tokio::test]
async fn test_three_lesson_course_manifest_keeps_order() {
    let storage = TestStorage::new().await;
    let list = lessons(
        &storage,
        &[
            (LessonKind::Video, "intro.mp4"),
            (LessonKind::Video, "setup.mp4"),
            (LessonKind::Document, "notes.pdf"),
        ],
    )
    .await;
    let uploader = SequentialBatchUploader::new(storage.storage.clone(), fast_retry(3));

    let report = uploader
        .upload("course-1", list.items(), &lesson_template(), &BatchControl::new())
        .await
        .unwrap();

    assert_eq!(report.manifest.len(), 3);
    for (expected, (entry, item)) in report.manifest.iter().zip(list.items()).enumerate() {
        assert_eq!(entry.order, expected as u32);
        assert_eq!(entry.id, item.id);
        assert_eq!(entry.kind, item.kind);
        assert!(!entry.url.is_empty());
        assert!(storage.stored_path(&entry.storage_key).exists());
    }
    assert_eq!(report.manifest[2].kind, LessonKind::Document);
    assert_eq!(report.manifest[2].filename, "notes.pdf");
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let storage = TestStorage::new().await;
    let list = lessons(&storage, &FIVE[..3]).await;
    let scripted = Arc::new(ScriptedStorage::new(storage.storage.clone()).fail_times("1-lesson-1", 2));
    let uploader = SequentialBatchUploader::new(scripted.clone(), fast_retry(3));

    let report = uploader
        .upload("course-1", list.items(), &lesson_template(), &BatchControl::new())
        .await
        .unwrap();

    assert_eq!(report.manifest.len(), 3);
    assert_eq!(report.attempts, vec![1, 3, 1]);
    assert_eq!(
        report.manifest.iter().filter(|e| e.id == "lesson-1").count(),
        1
    );
    assert_eq!(scripted.attempts_for("1-lesson-1"), 3);
}

#[tokio::test]
async fn test_exhausted_item_aborts_batch() {
    let storage = TestStorage::new().await;
    let list = lessons(&storage, &FIVE).await;
    let scripted = Arc::new(ScriptedStorage::new(storage.storage.clone()).fail_times("3-lesson-3", 3));
    let uploader = SequentialBatchUploader::new(scripted.clone(), fast_retry(3));

    let err = uploader
        .upload("course-1", list.items(), &lesson_template(), &BatchControl::new())
        .await
        .unwrap_err();

    assert_eq!(err.source.index, 3);
    assert_eq!(err.manifest.len(), 3);
    assert_eq!(err.source.attempts, 3);
    assert_eq!(err.total_items, 5);
    assert!(matches!(err.source.last_error, BatchItemError::Transfer(_)));
    // Fail-fast: the last item is never attempted.
    assert_eq!(scripted.attempts_for("4-lesson-4"), 0);
}

#[tokio::test]
async fn test_cancel_during_third_item_keeps_first_two() {
    let storage = TestStorage::new().await;
    let list = lessons(&storage, &FIVE).await;
    let scripted = Arc::new(ScriptedStorage::new(storage.storage.clone()).hold("2-lesson-2"));
    let uploader = SequentialBatchUploader::new(scripted.clone(), fast_retry(3));
    let control = Arc::new(BatchControl::new());

    let task = {
        let control = control.clone();
        let items = list.items().to_vec();
        tokio::spawn(async move {
            uploader
                .upload("course-1", &items, &lesson_template(), &control)
                .await
        })
    };

    scripted.wait_until_held().await;
    assert_eq!(control.progress().current_index, Some(2));
    assert!(control.pause());
    assert!(control.resume());
    assert!(control.cancel());

    let err = task.await.unwrap().unwrap_err();
    assert!(err.is_cancelled());
    let ids: Vec<&str> = err.manifest.iter().map(|e| e.id.as_str()).collect();
    assert_eq!(ids, vec!["lesson-0", "lesson-1"]);
    assert_eq!(err.source.attempts, 1);
    assert_eq!(scripted.attempts_for("3-lesson-3"), 0);
}

#[tokio::test]
async fn test_catalog_records_written_per_lesson() {
    let storage = TestStorage::new().await;
    let list = lessons(&storage, &FIVE[..2]).await;
    let store = Arc::new(ScriptedDocumentStore::new(500));
    let uploader = SequentialBatchUploader::new(storage.storage.clone(), fast_retry(3))
        .with_catalog(LessonCatalog::new(store.clone(), "lessons"));

    let report = uploader
        .upload("course-9", list.items(), &lesson_template(), &BatchControl::new())
        .await
        .unwrap();
    assert_eq!(report.catalog_ids.len(), 2);

    let records = store
        .query("lessons", &RecordFilter::field_equals("parent_id", "course-9"))
        .await
        .unwrap();
    assert_eq!(records.len(), 2);
    let record = &records[0];
    assert_eq!(record.field("lesson_id"), Some(&serde_json::json!("lesson-0")));
    assert!(record.field("published_at").is_some());
}

#[tokio::test]
async fn test_catalog_failure_reports_phase_and_orphan() {
    let storage = TestStorage::new().await;
    let list = lessons(&storage, &FIVE[..2]).await;
    let store = Arc::new(ScriptedDocumentStore::new(500).fail_writes_in("lessons"));
    let uploader = SequentialBatchUploader::new(storage.storage.clone(), fast_retry(2))
        .with_catalog(LessonCatalog::new(store.clone(), "lessons"));

    let err = uploader
        .upload("course-9", list.items(), &lesson_template(), &BatchControl::new())
        .await
        .unwrap_err();

    assert_eq!(err.source.index, 0);
    assert!(err.manifest.is_empty());
    assert!(matches!(err.source.last_error, BatchItemError::Catalog(_)));
    let orphan = err.source.orphan.as_ref().unwrap();
    assert!(storage.stored_path(&orphan.storage_key).exists());
}

#[tokio::test]
async fn test_catalog_retry_after_lost_reply_keeps_one_record() {
    let storage = TestStorage::new().await;
    let list = lessons(&storage, &FIVE[..2]).await;
    let store = Arc::new(ScriptedDocumentStore::new(500).lose_put_replies(1));
    let uploader = SequentialBatchUploader::new(storage.storage.clone(), fast_retry(3))
        .with_catalog(LessonCatalog::new(store.clone(), "lessons"));

    let report = uploader
        .upload("course-9", list.items(), &lesson_template(), &BatchControl::new())
        .await
        .unwrap();

    assert_eq!(report.catalog_ids, vec!["course-9:lesson-0", "course-9:lesson-1"]);
    assert_eq!(store.count("lessons").await, 2);
}
