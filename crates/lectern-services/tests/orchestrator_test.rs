//! Publish workflow integration tests.

mod helpers;

use helpers::{
    lessons, orchestrator_settings, png, read_stored, ScriptedDocumentStore, ScriptedStorage,
    TestStorage,
};
use lectern_core::models::{
    ContentCategory, LessonKind, PersistenceStrategy, PublishContent, PublishRequest,
    PublishStage, PublishedContent, TransferState,
};
use lectern_core::ErrorMetadata;
use lectern_db::{DocumentStore, RecordFilter};
use lectern_services::{AssetRole, PublishError, PublishOrchestrator, TransferFailure};
use lectern_storage::{Storage, StorageError, CANCELLED_MESSAGE};
use serde_json::json;
use std::sync::Arc;

async fn video_request(storage: &TestStorage) -> PublishRequest {
    let file = storage.source("clip.mp4", 100).await;
    PublishRequest::new(
        "Clip",
        "A short clip",
        ContentCategory::Video,
        PublishContent::Single { file },
    )
    .with_tier("gold")
    .with_tier("free")
}

async fn course_request(storage: &TestStorage) -> PublishRequest {
    let lessons = lessons(
        storage,
        &[
            (LessonKind::Video, "intro.mp4"),
            (LessonKind::Video, "deep-dive.mp4"),
            (LessonKind::Document, "workbook.pdf"),
        ],
    )
    .await;
    PublishRequest::new(
        "Course",
        "A course",
        ContentCategory::Course,
        PublishContent::Lessons { lessons },
    )
    .with_tier("gold")
    .with_tier("silver")
    .with_parent_id("course-1")
}

#[tokio::test]
async fn test_single_video_per_tier_with_thumbnail() {
    let storage = TestStorage::new().await;
    let store = Arc::new(ScriptedDocumentStore::new(500));
    store.seed("analytics", 3).await;
    let orchestrator =
        PublishOrchestrator::new(storage.storage.clone(), store.clone(), orchestrator_settings(None));

    let thumb = storage.temp_dir.path().join("cover.png");
    tokio::fs::write(&thumb, png(256, 128)).await.unwrap();
    let request = video_request(&storage).await.with_thumbnail(&thumb);

    let receipt = orchestrator.publish(request).await.unwrap();
    orchestrator.wait_for_background().await;

    assert_eq!(receipt.record_ids.len(), 2);
    let thumbnail_url = receipt.thumbnail_url.as_deref().unwrap();
    let expected = format!("{}/videos/thumbnails/{}/cover.jpg", helpers::BASE_URL, receipt.parent_id);
    assert_eq!(thumbnail_url, expected);
    let thumbnail_key = format!("videos/thumbnails/{}/cover.jpg", receipt.parent_id);
    let stored = read_stored(&storage, &thumbnail_key).await;
    assert_eq!(image::guess_format(&stored).unwrap(), image::ImageFormat::Jpeg);

    match &receipt.content {
        PublishedContent::Single { url, filename, storage_key } => {
            assert_eq!(filename, "clip.mp4");
            assert_eq!(storage_key, &format!("videos/{}/clip.mp4", receipt.parent_id));
            assert!(url.ends_with("/clip.mp4"));
            assert_eq!(read_stored(&storage, storage_key).await.len(), 100);
        }
        other => panic!("unexpected content: {:?}", other),
    }

    let records = store.query("videos", &RecordFilter::All).await.unwrap();
    let tiers: Vec<_> = records.iter().map(|r| r.field("tier").cloned()).collect();
    assert_eq!(tiers, vec![Some(json!("gold")), Some(json!("free"))]);

    let analytics = store.query("analytics", &RecordFilter::All).await.unwrap();
    assert!(analytics
        .iter()
        .all(|d| d.field("videos_published") == Some(&json!(1))));

    let status = orchestrator.status();
    assert_eq!(status.stage, PublishStage::Succeeded);
    assert_eq!(status.transfer.state, TransferState::Success);
    assert!(!orchestrator.is_busy());
}

#[tokio::test]
async fn test_course_publishes_manifest_into_single_record() {
    let storage = TestStorage::new().await;
    let store = Arc::new(ScriptedDocumentStore::new(500));
    let orchestrator = PublishOrchestrator::new(
        storage.storage.clone(),
        store.clone(),
        orchestrator_settings(Some("lessons")),
    );

    let receipt = orchestrator.publish(course_request(&storage).await).await.unwrap();

    assert_eq!(receipt.parent_id, "course-1");
    assert_eq!(receipt.record_ids.len(), 1);
    let PublishedContent::Manifest { entries } = &receipt.content else {
        panic!("expected a manifest");
    };
    let orders: Vec<u32> = entries.iter().map(|e| e.order).collect();
    assert_eq!(orders, vec![0, 1, 2]);
    assert!(entries.iter().all(|e| !e.url.is_empty()));
    assert_eq!(entries[2].kind, LessonKind::Document);

    let record = store
        .get("courses", &receipt.record_ids[0])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.field("tiers"), Some(&json!(["gold", "silver"])));
    assert_eq!(record.field("lesson_count"), Some(&json!(3)));
    assert_eq!(store.count("lessons").await, 3);

    let status = orchestrator.status();
    let batch = status.batch.unwrap();
    assert_eq!(batch.completed_items, 3);
    assert_eq!(status.transfer.progress_pct, 100.0);
}

#[tokio::test]
async fn test_strategy_override_per_tier_course() {
    let storage = TestStorage::new().await;
    let store = Arc::new(ScriptedDocumentStore::new(500));
    let orchestrator =
        PublishOrchestrator::new(storage.storage.clone(), store.clone(), orchestrator_settings(None));

    let request = course_request(&storage)
        .await
        .with_strategy(PersistenceStrategy::PerTier);
    let receipt = orchestrator.publish(request).await.unwrap();

    assert_eq!(receipt.record_ids.len(), 2);
    assert_eq!(store.count("courses").await, 2);
    assert_eq!(store.count("lessons").await, 0);
}

#[tokio::test]
async fn test_validation_failure_touches_nothing() {
    let storage = TestStorage::new().await;
    let store = Arc::new(ScriptedDocumentStore::new(500));
    let scripted = Arc::new(ScriptedStorage::new(storage.storage.clone()));
    let orchestrator = PublishOrchestrator::new(scripted.clone(), store.clone(), orchestrator_settings(None));

    let file = storage.source("clip.mp4", 10).await;
    let request = PublishRequest::new(
        "Clip",
        "desc",
        ContentCategory::Video,
        PublishContent::Single { file },
    );
    let err = orchestrator.publish(request).await.unwrap_err();

    assert!(matches!(err, PublishError::Validation(_)));
    assert_eq!(err.error_code(), "VALIDATION_ERROR");
    assert!(scripted.calls().is_empty());
    assert_eq!(store.count("videos").await, 0);
    assert_eq!(orchestrator.status().stage, PublishStage::Failed);
}

#[tokio::test]
async fn test_second_publish_while_in_flight_is_busy() {
    let storage = TestStorage::new().await;
    let store = Arc::new(ScriptedDocumentStore::new(500));
    let scripted = Arc::new(ScriptedStorage::new(storage.storage.clone()).hold("clip.mp4"));
    let orchestrator = Arc::new(PublishOrchestrator::new(
        scripted.clone(),
        store.clone(),
        orchestrator_settings(None),
    ));

    let first = {
        let orchestrator = orchestrator.clone();
        let request = video_request(&storage).await;
        tokio::spawn(async move { orchestrator.publish(request).await })
    };
    scripted.wait_until_held().await;
    assert!(orchestrator.is_busy());

    let second = orchestrator.publish(video_request(&storage).await).await;
    assert!(matches!(second, Err(PublishError::Busy)));
    assert_eq!(scripted.attempts_for("clip.mp4"), 1);

    assert!(orchestrator.cancel());
    let err = first.await.unwrap().unwrap_err();
    assert!(err.is_cancelled());
    assert!(!orchestrator.is_busy());
}

#[tokio::test]
async fn test_cancel_single_transfer_reports_cancellation() {
    let storage = TestStorage::new().await;
    let store = Arc::new(ScriptedDocumentStore::new(500));
    let scripted = Arc::new(ScriptedStorage::new(storage.storage.clone()).hold("clip.mp4"));
    let orchestrator = Arc::new(PublishOrchestrator::new(
        scripted.clone(),
        store.clone(),
        orchestrator_settings(None),
    ));
    let mut status_rx = orchestrator.subscribe();

    let run = {
        let orchestrator = orchestrator.clone();
        let request = video_request(&storage).await;
        tokio::spawn(async move { orchestrator.publish(request).await })
    };
    scripted.wait_until_held().await;

    assert!(orchestrator.pause());
    assert!(!orchestrator.pause());
    assert!(orchestrator.resume());
    assert!(!orchestrator.resume());
    assert!(orchestrator.cancel());
    assert!(!orchestrator.cancel());

    let err = run.await.unwrap().unwrap_err();
    match &err {
        PublishError::Transfer { asset, source, orphans } => {
            assert_eq!(*asset, AssetRole::Content);
            assert!(matches!(source, TransferFailure::Storage(StorageError::Cancelled)));
            assert!(orphans.is_empty());
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(err.error_code(), "TRANSFER_CANCELLED");

    let status = status_rx.borrow_and_update().clone();
    assert_eq!(status.stage, PublishStage::Failed);
    assert_eq!(status.transfer.state, TransferState::Error);
    assert_eq!(status.transfer.error_message.as_deref(), Some(CANCELLED_MESSAGE));
    assert_eq!(store.count("videos").await, 0);
}

#[tokio::test]
async fn test_cancel_mid_course_returns_partial_manifest() {
    let storage = TestStorage::new().await;
    let store = Arc::new(ScriptedDocumentStore::new(500));
    let scripted = Arc::new(ScriptedStorage::new(storage.storage.clone()).hold("2-lesson-2"));
    let orchestrator = Arc::new(PublishOrchestrator::new(
        scripted.clone(),
        store.clone(),
        orchestrator_settings(None),
    ));

    let run = {
        let orchestrator = orchestrator.clone();
        let request = course_request(&storage).await;
        tokio::spawn(async move { orchestrator.publish(request).await })
    };
    scripted.wait_until_held().await;
    assert!(orchestrator.cancel());

    let err = run.await.unwrap().unwrap_err();
    assert!(err.is_cancelled());
    assert_eq!(err.error_code(), "BATCH_CANCELLED");
    let manifest = err.partial_manifest().unwrap();
    assert_eq!(manifest.len(), 2);
    assert_eq!(err.orphans().len(), 2);
    assert_eq!(store.count("courses").await, 0);
}

#[tokio::test]
async fn test_exhausted_lesson_fails_publish_with_partial_batch() {
    let storage = TestStorage::new().await;
    let store = Arc::new(ScriptedDocumentStore::new(500));
    let scripted = Arc::new(ScriptedStorage::new(storage.storage.clone()).fail_times("1-lesson-1", 10));
    let orchestrator =
        PublishOrchestrator::new(scripted.clone(), store.clone(), orchestrator_settings(None));

    let err = orchestrator.publish(course_request(&storage).await).await.unwrap_err();

    let PublishError::PartialBatch { source, orphans } = &err else {
        panic!("unexpected error: {:?}", err);
    };
    assert_eq!(source.manifest.len(), 1);
    assert_eq!(source.source.attempts, 3);
    assert_eq!(orphans.len(), 1);
    assert_eq!(err.error_code(), "PARTIAL_BATCH_ERROR");
    assert_eq!(orchestrator.status().stage, PublishStage::Failed);
}

#[tokio::test]
async fn test_persistence_failure_reports_orphans() {
    let storage = TestStorage::new().await;
    let store = Arc::new(ScriptedDocumentStore::new(500).fail_writes_in("videos"));
    let orchestrator =
        PublishOrchestrator::new(storage.storage.clone(), store.clone(), orchestrator_settings(None));

    let thumb = storage.temp_dir.path().join("cover.png");
    tokio::fs::write(&thumb, png(32, 32)).await.unwrap();
    let request = video_request(&storage).await.with_thumbnail(&thumb);

    let err = orchestrator.publish(request).await.unwrap_err();
    let PublishError::Persistence {
        records_created,
        orphans,
        ..
    } = &err
    else {
        panic!("unexpected error: {:?}", err);
    };
    assert!(records_created.is_empty());
    assert_eq!(orphans.len(), 2);

    let status = orchestrator.status();
    assert_eq!(status.stage, PublishStage::Failed);
    let failure = status.failure.as_ref().unwrap();
    assert_eq!(failure.error_code, "PERSISTENCE_ERROR");
    assert_eq!(failure.message, err.client_message());
    assert_eq!(orphans[0].role, AssetRole::Thumbnail);
    assert_eq!(orphans[1].role, AssetRole::Content);
    for orphan in orphans {
        assert!(storage.storage.exists(&orphan.storage_key).await.unwrap());
        assert!(orphan.url.starts_with(helpers::BASE_URL));
    }

    let deleted = orchestrator.discard_orphans(err.orphans()).await.unwrap();
    assert_eq!(deleted, 2);
    for orphan in err.orphans() {
        assert!(!storage.storage.exists(&orphan.storage_key).await.unwrap());
    }
}

#[tokio::test]
async fn test_analytics_failure_does_not_fail_publish() {
    let storage = TestStorage::new().await;
    let store = Arc::new(ScriptedDocumentStore::new(500).fail_commit_at(0));
    store.seed("analytics", 5).await;
    let orchestrator =
        PublishOrchestrator::new(storage.storage.clone(), store.clone(), orchestrator_settings(None));

    let receipt = orchestrator.publish(video_request(&storage).await).await;
    orchestrator.wait_for_background().await;

    assert!(receipt.is_ok());
    assert_eq!(store.commit_sizes(), vec![5]);
    assert_eq!(orchestrator.status().stage, PublishStage::Succeeded);
}

#[tokio::test]
async fn test_controls_are_noops_when_idle() {
    let storage = TestStorage::new().await;
    let store = Arc::new(ScriptedDocumentStore::new(500));
    let orchestrator =
        PublishOrchestrator::new(storage.storage.clone(), store, orchestrator_settings(None));

    assert!(!orchestrator.pause());
    assert!(!orchestrator.resume());
    assert!(!orchestrator.cancel());
    assert_eq!(orchestrator.status().stage, PublishStage::Idle);
}

#[tokio::test]
async fn test_unreadable_thumbnail_fails_as_thumbnail_transfer() {
    let storage = TestStorage::new().await;
    let store = Arc::new(ScriptedDocumentStore::new(500));
    let orchestrator =
        PublishOrchestrator::new(storage.storage.clone(), store.clone(), orchestrator_settings(None));

    let missing = storage.temp_dir.path().join("nope.png");
    let request = video_request(&storage).await.with_thumbnail(&missing);
    let err = orchestrator.publish(request).await.unwrap_err();

    match &err {
        PublishError::Transfer { asset, source, orphans } => {
            assert_eq!(*asset, AssetRole::Thumbnail);
            assert!(matches!(source, TransferFailure::Preprocessing(_)));
            assert!(orphans.is_empty());
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(err.error_code(), "TRANSFER_ERROR");
    assert!(!err.is_recoverable());

    let status = orchestrator.status();
    assert_eq!(status.stage, PublishStage::Failed);
    assert_eq!(
        status.failure.map(|f| f.error_code),
        Some("TRANSFER_ERROR".to_string())
    );
    assert_eq!(store.count("videos").await, 0);
}

#[tokio::test]
async fn test_cancel_while_persisting_is_refused() {
    let storage = TestStorage::new().await;
    let store = Arc::new(ScriptedDocumentStore::new(500).hold_next_create());
    let orchestrator = Arc::new(PublishOrchestrator::new(
        storage.storage.clone(),
        store.clone(),
        orchestrator_settings(None),
    ));

    let run = {
        let orchestrator = orchestrator.clone();
        let request = video_request(&storage).await;
        tokio::spawn(async move { orchestrator.publish(request).await })
    };
    store.wait_until_held().await;

    assert_eq!(orchestrator.status().stage, PublishStage::Persisting);
    assert!(!orchestrator.cancel());
    store.release();

    let receipt = run.await.unwrap().unwrap();
    assert_eq!(receipt.record_ids.len(), 2);
    assert_eq!(orchestrator.status().stage, PublishStage::Succeeded);
}

#[tokio::test]
async fn test_finished_background_tasks_are_not_retained() {
    let storage = TestStorage::new().await;
    let store = Arc::new(ScriptedDocumentStore::new(500));
    store.seed("analytics", 2).await;
    let orchestrator =
        PublishOrchestrator::new(storage.storage.clone(), store.clone(), orchestrator_settings(None));

    for _ in 0..20 {
        orchestrator.publish(video_request(&storage).await).await.unwrap();
    }
    tokio::time::timeout(std::time::Duration::from_secs(5), async {
        while orchestrator.pending_background() > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    assert_eq!(orchestrator.pending_background(), 0);
    let analytics = store.query("analytics", &RecordFilter::All).await.unwrap();
    assert!(analytics
        .iter()
        .all(|d| d.field("videos_published") == Some(&json!(20))));
}
