//! Voice usage abuse detection
//!
//! Flags suspicious usage patterns: rapid reconnection (limit-bypass
//! attempts), excessive continuous use, and abnormally long sessions without
//! breaks. All heuristics are advisory: they record an audit event and
//! publish `ABUSE_DETECTED`, but never deny audio on their own.

use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::AbuseConfig;
use crate::dispatcher::{Dispatcher, SessionMessage};
use crate::usage::models::AbuseEventType;
use crate::usage::store::{new_abuse_event, UsageStore};

pub struct AbuseDetector {
    user_id: String,
    session_id: String,
    store: Arc<dyn UsageStore>,
    dispatcher: Arc<Dispatcher>,
    config: AbuseConfig,
    session_start: DateTime<Utc>,
    last_activity: Option<DateTime<Utc>>,
    continuous_ms: u64,
}

impl AbuseDetector {
    pub fn new(
        user_id: &str,
        session_id: &str,
        store: Arc<dyn UsageStore>,
        dispatcher: Arc<Dispatcher>,
        config: AbuseConfig,
    ) -> Self {
        Self {
            user_id: user_id.to_string(),
            session_id: session_id.to_string(),
            store,
            dispatcher,
            config,
            session_start: Utc::now(),
            last_activity: None,
            continuous_ms: 0,
        }
    }

    /// Rapid-reconnection check, run once per session after the session row
    /// exists (so the count includes this connection)
    pub async fn check_on_connection(&self) {
        if !self.config.enabled {
            return;
        }
        let window = Duration::seconds(self.config.reconnect_window_seconds as i64);
        let recent = match self.store.recent_session_count(&self.user_id, window).await {
            Ok(count) => count,
            Err(e) => {
                warn!(user_id = %self.user_id, "abuse connection check failed: {}", e);
                return;
            }
        };

        if recent >= self.config.reconnect_threshold {
            debug!(user_id = %self.user_id, recent, "rapid reconnection pattern");
            self.record(
                AbuseEventType::RapidReconnection,
                json!({
                    "session_count": recent,
                    "window_seconds": self.config.reconnect_window_seconds,
                    "threshold": self.config.reconnect_threshold,
                }),
            )
            .await;
        }
    }

    /// Accumulate continuous-use time across chunks whose inter-arrival gap
    /// is under the configured threshold
    pub async fn track_activity(&mut self, duration_ms: u64) {
        if !self.config.enabled {
            return;
        }
        let now = Utc::now();
        let gap = Duration::seconds(self.config.continuous_gap_secs as i64);

        match self.last_activity {
            Some(last) if now - last < gap => {
                self.continuous_ms += duration_ms;
                let threshold_ms = self.config.continuous_threshold_minutes * 60 * 1000;
                if self.continuous_ms >= threshold_ms {
                    let continuous_ms = self.continuous_ms;
                    // Reset so the pattern is reported once per stretch
                    self.continuous_ms = 0;
                    self.record(
                        AbuseEventType::ExcessiveContinuousUse,
                        json!({
                            "continuous_duration_ms": continuous_ms,
                            "threshold_ms": threshold_ms,
                            "session_duration_seconds":
                                (now - self.session_start).num_seconds(),
                        }),
                    )
                    .await;
                }
            }
            _ => {
                // Break in activity restarts the stretch
                self.continuous_ms = duration_ms;
            }
        }
        self.last_activity = Some(now);
    }

    /// Long-session check, run once at session end
    pub async fn check_session_end(&self) {
        if !self.config.enabled {
            return;
        }
        let wall_secs = (Utc::now() - self.session_start).num_seconds();
        if wall_secs <= 2 * 3600 {
            return;
        }

        let session = match self.store.get_session(&self.session_id).await {
            Ok(Some(session)) => session,
            Ok(None) => return,
            Err(e) => {
                warn!(session_id = %self.session_id, "abuse end check failed: {}", e);
                return;
            }
        };

        let active_ratio = session.duration_ms as f64 / (wall_secs as f64 * 1000.0);
        if active_ratio > 0.5 {
            self.record(
                AbuseEventType::LongSessionNoBreaks,
                json!({
                    "session_duration_seconds": wall_secs,
                    "voice_duration_ms": session.duration_ms,
                    "active_ratio": active_ratio,
                    "chunk_count": session.chunk_count,
                }),
            )
            .await;
        }
    }

    async fn record(&self, event_type: AbuseEventType, details: serde_json::Value) {
        let event = new_abuse_event(&self.user_id, &self.session_id, event_type, details.clone());
        if let Err(e) = self.store.record_abuse_event(event).await {
            warn!(user_id = %self.user_id, "failed to record abuse event: {}", e);
        }
        self.dispatcher.broadcast(
            &self.session_id,
            SessionMessage::AbuseDetected {
                event_type,
                details,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::MessageType;
    use crate::usage::store::SqliteUsageStore;

    fn detector(
        store: Arc<dyn UsageStore>,
        dispatcher: Arc<Dispatcher>,
        config: AbuseConfig,
    ) -> AbuseDetector {
        AbuseDetector::new("u1", "s1", store, dispatcher, config)
    }

    #[tokio::test]
    async fn test_rapid_reconnection_records_and_publishes() {
        let store: Arc<dyn UsageStore> = Arc::new(SqliteUsageStore::in_memory().unwrap());
        let dispatcher = Arc::new(Dispatcher::new());
        let mut sub = dispatcher.subscribe("s1", MessageType::AbuseDetected);

        for i in 0..11 {
            store
                .create_session(&format!("s{}", i), "u1")
                .await
                .unwrap();
        }

        let det = detector(store, dispatcher.clone(), AbuseConfig::default());
        det.check_on_connection().await;

        let event = sub.recv().await.expect("abuse event published");
        match event.message {
            SessionMessage::AbuseDetected {
                event_type,
                details,
            } => {
                assert_eq!(event_type, AbuseEventType::RapidReconnection);
                assert_eq!(details["session_count"], 11);
                assert_eq!(details["window_seconds"], 300);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_below_threshold_is_quiet() {
        let store: Arc<dyn UsageStore> = Arc::new(SqliteUsageStore::in_memory().unwrap());
        let dispatcher = Arc::new(Dispatcher::new());
        let mut sub = dispatcher.subscribe("s1", MessageType::AbuseDetected);

        store.create_session("s1", "u1").await.unwrap();
        let det = detector(store, dispatcher, AbuseConfig::default());
        det.check_on_connection().await;
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_continuous_use_crosses_threshold_then_resets() {
        let store: Arc<dyn UsageStore> = Arc::new(SqliteUsageStore::in_memory().unwrap());
        let dispatcher = Arc::new(Dispatcher::new());
        let mut sub = dispatcher.subscribe("s1", MessageType::AbuseDetected);

        let config = AbuseConfig {
            continuous_threshold_minutes: 1,
            ..AbuseConfig::default()
        };
        let mut det = detector(store, dispatcher, config);

        // Chunks arrive back to back, so they all count as one stretch
        det.track_activity(30_000).await;
        assert!(sub.try_recv().is_none());
        det.track_activity(30_000).await;

        let event = sub.recv().await.expect("continuous-use event");
        match event.message {
            SessionMessage::AbuseDetected { event_type, .. } => {
                assert_eq!(event_type, AbuseEventType::ExcessiveContinuousUse);
            }
            other => panic!("unexpected message: {:?}", other),
        }

        // Counter reset: the next chunk alone does not re-trigger
        det.track_activity(30_000).await;
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_disabled_detector_is_inert() {
        let store: Arc<dyn UsageStore> = Arc::new(SqliteUsageStore::in_memory().unwrap());
        let dispatcher = Arc::new(Dispatcher::new());
        let mut sub = dispatcher.subscribe("s1", MessageType::AbuseDetected);

        let config = AbuseConfig {
            enabled: false,
            continuous_threshold_minutes: 0,
            ..AbuseConfig::default()
        };
        let mut det = detector(store, dispatcher, config);
        det.track_activity(10_000_000).await;
        det.check_on_connection().await;
        assert!(sub.try_recv().is_none());
    }
}
