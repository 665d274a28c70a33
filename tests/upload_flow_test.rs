// End-to-end flows through the engine: intake, transfer, reconciliation,
// stability and finalize, all against the in-memory backend.

mod support;

use std::sync::Arc;
use std::time::Duration;
use stower::config::UploadConfig;
use stower::models::{BatchContext, CategoryField, FileSource, ItemStatus, NewUpload};
use stower::upload::{BatchEvent, TransferSettings, TransportManager, UploadEngine};
use support::{tracing_init, wait_until, MockUploadApi};
use tokio::sync::Semaphore;

fn test_context() -> BatchContext {
    BatchContext {
        company_id: "acme".to_string(),
        brand_id: "northwind".to_string(),
        category_id: Some("photography".to_string()),
        fields: vec![CategoryField {
            key: "shoot_date".to_string(),
            label: "Shoot date".to_string(),
            required: false,
        }],
    }
}

fn fast_config() -> UploadConfig {
    let mut config = UploadConfig::default();
    config.chunk_threshold = 64;
    config.chunk_size = 64;
    config.max_concurrent = 1;
    config.stability.interval = Duration::from_millis(10);
    config.stability.max_interval = Duration::from_millis(20);
    config.stability.max_attempts = 20;
    config
}

fn start_engine(api: Arc<MockUploadApi>, config: UploadConfig) -> (UploadEngine, TransportManager) {
    let transport = TransportManager::new(
        api.clone(),
        TransferSettings {
            chunk_threshold: config.chunk_threshold,
            chunk_size: config.chunk_size,
        },
    );
    let engine = UploadEngine::start(api, transport.clone(), test_context(), config);
    (engine, transport)
}

#[tokio::test]
async fn small_batch_uploads_stabilizes_and_finalizes() {
    tracing_init();
    let api = Arc::new(MockUploadApi::new());
    let (engine, transport) = start_engine(api.clone(), fast_config());
    let mut events = engine.subscribe();

    let ids = engine.add_files(vec![
        NewUpload::new(
            "holiday photo.JPG",
            "image/jpeg",
            FileSource::from_bytes(vec![1u8; 16]),
        ),
        NewUpload::new(
            "b-roll_clip.mp4",
            "video/mp4",
            FileSource::from_bytes(vec![2u8; 32]),
        ),
    ]);
    assert_eq!(ids.len(), 2);

    wait_until("both items complete", Duration::from_secs(5), || {
        engine
            .items()
            .iter()
            .all(|i| i.status == ItemStatus::Complete)
    })
    .await;

    let items = engine.items();
    assert_eq!(items[0].title, "Holiday Photo", "title derived from filename");
    assert_eq!(items[0].resolved_filename, "holiday-photo.jpg");
    assert_eq!(items[1].title, "B Roll Clip");
    for item in &items {
        assert!(item.session_id.is_some(), "complete item carries a session id");
        assert_eq!(item.progress, 100);
        assert!(item.error.is_none());
    }
    assert_eq!(api.received_bytes("holiday photo.JPG"), 16);
    assert_eq!(api.received_bytes("b-roll_clip.mp4"), 32);

    assert!(engine.can_finalize(), "batch gate opens once all terminal");
    wait_until("backend confirms durability", Duration::from_secs(5), || {
        engine.all_backend_stable()
    })
    .await;
    assert!(engine.finalize_ready());

    let assets = engine.finalize().await.expect("finalize succeeds");
    assert_eq!(assets.len(), 2);
    assert!(engine.items().is_empty(), "items purged after commit");
    assert!(transport.snapshot().is_empty(), "records purged after commit");
    assert_eq!(api.finalized_filenames().len(), 2);

    let mut saw_finalized = false;
    while let Ok(event) = events.try_recv() {
        if let BatchEvent::Finalized { assets } = event {
            assert_eq!(assets.len(), 2);
            saw_finalized = true;
        }
    }
    assert!(saw_finalized, "subscribers get the Finalized event");
}

#[tokio::test]
async fn chunked_failure_is_retryable_and_retry_gets_fresh_session() {
    tracing_init();
    let api = Arc::new(MockUploadApi::new());
    let (engine, _transport) = start_engine(api.clone(), fast_config());

    // 200 bytes at a 64-byte chunk size: parts 1..4, part 2 breaks.
    api.fail_part(
        "big_video.mp4",
        2,
        stower::error::UploadError::Network {
            message: "bad gateway".to_string(),
            http_status: Some(502),
        },
    );

    let ids = engine.add_files(vec![NewUpload::new(
        "big_video.mp4",
        "video/mp4",
        FileSource::from_bytes(vec![7u8; 200]),
    )]);
    let id = ids[0];

    wait_until("item fails on part 2", Duration::from_secs(5), || {
        engine
            .item(&id)
            .map(|i| i.status == ItemStatus::Failed)
            .unwrap_or(false)
    })
    .await;

    let failed = engine.item(&id).unwrap();
    let error = failed.error.clone().expect("failed item carries its error");
    assert!(error.retryable(), "network failures offer retry");
    assert_eq!(error.category(), "NETWORK");
    assert_eq!(error.http_status(), Some(502));

    assert!(engine.retry_item(&id), "failed item accepts retry");
    wait_until("retry completes", Duration::from_secs(5), || {
        engine
            .item(&id)
            .map(|i| i.status == ItemStatus::Complete)
            .unwrap_or(false)
    })
    .await;

    assert_eq!(
        api.session_count(),
        2,
        "retry opens a fresh session instead of reusing the failed one"
    );
    let retried = engine.item(&id).unwrap();
    let fresh_session = retried.session_id.clone().expect("completed item has a session");
    assert_ne!(
        Some(fresh_session),
        failed.session_id,
        "the item must carry the retry's session, not the failed attempt's"
    );
    assert_eq!(api.received_bytes("big_video.mp4"), 200);

    wait_until("retried upload stabilizes", Duration::from_secs(5), || {
        engine.finalize_ready()
    })
    .await;
    let assets = engine.finalize().await.expect("finalize after retry");
    assert_eq!(assets.len(), 1);
}

#[tokio::test]
async fn scheduler_runs_transfers_one_at_a_time_in_intake_order() {
    tracing_init();
    let gate = Arc::new(Semaphore::new(0));
    let api = Arc::new(MockUploadApi::with_initiate_gate(gate.clone()));
    let (engine, transport) = start_engine(api.clone(), fast_config());

    engine.add_files(vec![
        NewUpload::new("first.png", "image/png", FileSource::from_bytes(vec![1u8; 8])),
        NewUpload::new("second.png", "image/png", FileSource::from_bytes(vec![2u8; 8])),
        NewUpload::new("third.png", "image/png", FileSource::from_bytes(vec![3u8; 8])),
    ]);

    // With no permits the first transfer parks inside initiate; the other
    // two must stay queued rather than grab slots.
    wait_until("first transfer holds the slot", Duration::from_secs(5), || {
        transport.active_count() == 1
    })
    .await;
    assert_eq!(
        engine
            .items()
            .iter()
            .filter(|i| i.status == ItemStatus::Queued)
            .count(),
        2,
        "remaining items wait their turn"
    );

    // One permit lets the first transfer through; the second is issued and
    // parks at the gate, holding the slot, before it registers a session.
    gate.add_permits(1);
    wait_until(
        "first completes and the next start parks",
        Duration::from_secs(5),
        || {
            engine
                .items()
                .first()
                .map(|i| i.status == ItemStatus::Complete)
                .unwrap_or(false)
                && transport.active_count() == 1
        },
    )
    .await;
    assert_eq!(api.initiate_order().len(), 1, "second session not opened yet");

    gate.add_permits(2);
    wait_until("all items complete", Duration::from_secs(5), || {
        engine
            .items()
            .iter()
            .all(|i| i.status == ItemStatus::Complete)
    })
    .await;

    assert_eq!(
        api.initiate_order(),
        vec!["first.png", "second.png", "third.png"],
        "transfers start strictly in intake order"
    );
}

#[tokio::test]
async fn finalize_is_all_or_nothing_and_clears_nothing_on_partial_failure() {
    tracing_init();
    let api = Arc::new(MockUploadApi::new());
    let (engine, transport) = start_engine(api.clone(), fast_config());

    // Finalize requests carry the resolved filename, so the scripted
    // failure keys on the slugged form.
    api.fail_finalize(
        "report-two.pdf",
        stower::error::UploadError::Pipeline {
            message: "object lock contention".to_string(),
            http_status: Some(423),
        },
    );

    engine.add_files(vec![
        NewUpload::new(
            "report one.pdf",
            "application/pdf",
            FileSource::from_bytes(vec![1u8; 10]),
        ),
        NewUpload::new(
            "report two.pdf",
            "application/pdf",
            FileSource::from_bytes(vec![2u8; 10]),
        ),
    ]);

    wait_until("batch ready to finalize", Duration::from_secs(5), || {
        engine.finalize_ready()
    })
    .await;

    let err = engine
        .finalize()
        .await
        .expect_err("one failed call fails the whole commit");
    let banner = err.to_string();
    assert!(
        banner.contains("1 of 2"),
        "banner summarizes the failure counts: {}",
        banner
    );

    assert_eq!(engine.items().len(), 2, "no items cleared on failure");
    assert_eq!(transport.snapshot().len(), 2, "no records cleared on failure");
    assert!(
        engine.items().iter().all(|i| i.status == ItemStatus::Complete),
        "items stay complete and eligible for another attempt"
    );

    // The scripted failure was one-shot; the next attempt commits.
    let assets = engine.finalize().await.expect("second attempt succeeds");
    assert_eq!(assets.len(), 2);
    assert!(engine.items().is_empty());
}
