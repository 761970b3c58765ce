//! Usage store and tracker integration: accounting identities, idempotent
//! upserts, reset semantics, and on-disk persistence across reopens.

use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::Utc;

use voice_agent::config::{AbuseConfig, AudioConfig, VoiceLimitsConfig};
use voice_agent::dispatcher::Dispatcher;
use voice_agent::usage::models::{day_key, month_key};
use voice_agent::usage::{SqliteUsageStore, UsageStore, UsageTracker};

fn no_abuse() -> AbuseConfig {
    AbuseConfig {
        enabled: false,
        ..AbuseConfig::default()
    }
}

fn tracker_for(
    session_id: &str,
    store: Arc<dyn UsageStore>,
    dispatcher: Arc<Dispatcher>,
) -> Arc<UsageTracker> {
    UsageTracker::new(
        session_id,
        "u1",
        dispatcher,
        store,
        VoiceLimitsConfig::default(),
        AudioConfig::default(),
        no_abuse(),
    )
}

async fn settle(store: &Arc<dyn UsageStore>, session_id: &str, expected_ms: u64) {
    for _ in 0..200 {
        if let Some(session) = store.get_session(session_id).await.unwrap() {
            if session.duration_ms == expected_ms {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!(
        "session {} never reached {} ms in the store",
        session_id, expected_ms
    );
}

async fn settle_daily(store: &Arc<dyn UsageStore>, expected_ms: u64) {
    for _ in 0..200 {
        if let Some(daily) = store.daily_history("u1", 1).await.unwrap().first() {
            if daily.duration_ms == expected_ms {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("daily rollup never reached {} ms", expected_ms);
}

/// The daily rollup equals the sum of all session durations that landed in
/// that day
#[tokio::test]
async fn daily_rollup_equals_session_sum() {
    let dispatcher = Arc::new(Dispatcher::new());
    let store: Arc<dyn UsageStore> = Arc::new(SqliteUsageStore::in_memory().unwrap());

    // Three sessions, 100 ms + 250 ms + 650 ms of audio
    for (session_id, ms) in [("sess-a", 100u64), ("sess-b", 250), ("sess-c", 650)] {
        let tracker = tracker_for(session_id, store.clone(), dispatcher.clone());
        tracker.initialize().await;
        let blob = BASE64.encode(vec![0u8; (ms * 32) as usize]);
        assert!(tracker.track_audio_chunk(&blob).await);
        settle(&store, session_id, ms).await;
        tracker.end_session().await;
    }

    settle_daily(&store, 1000).await;
    let daily = store.daily_history("u1", 10).await.unwrap();
    assert_eq!(daily.len(), 1);
    assert_eq!(daily[0].session_count, 3);
    assert_eq!(daily[0].chunk_count, 3);

    let sessions = store.list_user_sessions("u1", 10).await.unwrap();
    let session_sum: u64 = sessions.iter().map(|s| s.duration_ms).sum();
    assert_eq!(session_sum, daily[0].duration_ms);

    let monthly = store.monthly_history("u1", 10).await.unwrap();
    assert_eq!(monthly[0].duration_ms, 1000);
    assert_eq!(monthly[0].session_count, 3);
}

/// Upsert-increments accumulate; an increment of zero changes nothing
#[tokio::test]
async fn upserts_accumulate() {
    let store = SqliteUsageStore::in_memory().unwrap();
    let date = day_key(Utc::now());

    store.upsert_daily("u1", date, 10, 1).await.unwrap();
    store.upsert_daily("u1", date, 0, 0).await.unwrap();
    store.upsert_daily("u1", date, 5, 1).await.unwrap();

    let daily = store.daily_history("u1", 10).await.unwrap();
    assert_eq!(daily[0].duration_ms, 15);
    assert_eq!(daily[0].chunk_count, 2);
}

/// reset_user followed by one tracked chunk leaves exactly that chunk's
/// duration in the daily rollup
#[tokio::test]
async fn reset_then_track_leaves_single_chunk() {
    let dispatcher = Arc::new(Dispatcher::new());
    let store: Arc<dyn UsageStore> = Arc::new(SqliteUsageStore::in_memory().unwrap());

    let tracker = tracker_for("sess-1", store.clone(), dispatcher.clone());
    tracker.initialize().await;
    let blob = BASE64.encode(vec![0u8; 4096]);
    assert!(tracker.track_audio_chunk(&blob).await);
    settle(&store, "sess-1", 128).await;
    tracker.end_session().await;

    store.reset_user("u1").await.unwrap();
    let daily = store.daily_history("u1", 10).await.unwrap();
    assert_eq!(daily[0].duration_ms, 0);

    // A fresh session tracks one more chunk
    let tracker = tracker_for("sess-2", store.clone(), dispatcher.clone());
    tracker.initialize().await;
    assert!(tracker.track_audio_chunk(&blob).await);
    settle(&store, "sess-2", 128).await;

    // 4096 / 32 = 128
    settle_daily(&store, 128).await;
}

/// A tracker initialized against existing daily usage resumes from it
#[tokio::test]
async fn tracker_resumes_persisted_daily_usage() {
    let dispatcher = Arc::new(Dispatcher::new());
    let store: Arc<dyn UsageStore> = Arc::new(SqliteUsageStore::in_memory().unwrap());
    store
        .upsert_daily("u1", day_key(Utc::now()), 12_345, 7)
        .await
        .unwrap();
    store
        .upsert_monthly("u1", &month_key(Utc::now()), 99_000)
        .await
        .unwrap();

    let tracker = tracker_for("sess-1", store, dispatcher);
    let summary = tracker.initialize().await;
    assert_eq!(summary.daily_duration_ms, 12_345);
    assert_eq!(summary.monthly_duration_ms, 99_000);
    assert_eq!(summary.session_duration_ms, 0);
    assert!(summary.voice_enabled);
}

/// The store survives a close/reopen cycle on disk
#[tokio::test]
async fn store_persists_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("usage.db");

    {
        let store = SqliteUsageStore::new(&path).await.unwrap();
        store.create_session("sess-1", "u1").await.unwrap();
        store.update_session_usage("sess-1", 500, 4).await.unwrap();
        store.end_session("sess-1").await.unwrap();
    }

    let store = SqliteUsageStore::new(&path).await.unwrap();
    let session = store.get_session("sess-1").await.unwrap().unwrap();
    assert_eq!(session.duration_ms, 500);
    assert_eq!(session.chunk_count, 4);
    assert!(!session.is_active);
    assert!(session.ended_at.is_some());
}

/// Ending an already-ended session is harmless, and updates after the end
/// are refused
#[tokio::test]
async fn end_session_is_idempotent() {
    let store = SqliteUsageStore::in_memory().unwrap();
    store.create_session("sess-1", "u1").await.unwrap();
    store.end_session("sess-1").await.unwrap();
    store.end_session("sess-1").await.unwrap();
    assert!(store.update_session_usage("sess-1", 1, 1).await.is_err());
}
