//! Real-time voice usage metering and quota enforcement
//!
//! Meters outbound TTS audio chunk by chunk, keeps authoritative in-memory
//! counters per quota period, emits one-shot warnings at the configured
//! ratio, and disables voice on the first exceeded limit (priority
//! session → daily → monthly). Persistence writes are fire-and-forget and
//! idempotent; the in-memory counters remain authoritative between
//! successful writes.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::{AbuseConfig, AudioConfig, VoiceLimitsConfig};
use crate::dispatcher::{Dispatcher, SessionMessage};
use crate::usage::abuse::AbuseDetector;
use crate::usage::models::{day_key, month_key, LimitKind, UsageSummary};
use crate::usage::store::{new_limit_event, UsageStore};

struct TrackerState {
    session_ms: u64,
    daily_ms: u64,
    monthly_ms: u64,
    voice_enabled: bool,
    limit_reached: Option<LimitKind>,
    warned_session: bool,
    warned_daily: bool,
    warned_monthly: bool,
}

/// Per-session usage meter; shared between the TTS client and the supervisor
pub struct UsageTracker {
    session_id: String,
    user_id: String,
    dispatcher: Arc<Dispatcher>,
    store: Arc<dyn UsageStore>,
    limits: VoiceLimitsConfig,
    audio: AudioConfig,
    state: Mutex<TrackerState>,
    abuse: Option<Mutex<AbuseDetector>>,
}

impl UsageTracker {
    pub fn new(
        session_id: &str,
        user_id: &str,
        dispatcher: Arc<Dispatcher>,
        store: Arc<dyn UsageStore>,
        limits: VoiceLimitsConfig,
        audio: AudioConfig,
        abuse_config: AbuseConfig,
    ) -> Arc<Self> {
        let abuse = abuse_config.enabled.then(|| {
            Mutex::new(AbuseDetector::new(
                user_id,
                session_id,
                store.clone(),
                dispatcher.clone(),
                abuse_config,
            ))
        });
        Arc::new(Self {
            session_id: session_id.to_string(),
            user_id: user_id.to_string(),
            dispatcher,
            store,
            limits,
            audio,
            state: Mutex::new(TrackerState {
                session_ms: 0,
                daily_ms: 0,
                monthly_ms: 0,
                voice_enabled: true,
                limit_reached: None,
                warned_session: false,
                warned_daily: false,
                warned_monthly: false,
            }),
            abuse,
        })
    }

    /// Create the session row, bump session counts, load the current usage
    /// snapshot, and disable voice up front when a period is already spent
    pub async fn initialize(self: &Arc<Self>) -> UsageSummary {
        if !self.limits.enabled {
            return UsageSummary::empty(&self.user_id, &self.session_id);
        }

        if let Err(e) = self.store.create_session(&self.session_id, &self.user_id).await {
            warn!(session_id = %self.session_id, "create_session failed: {}", e);
        }
        let now = Utc::now();
        if let Err(e) = self
            .store
            .increment_daily_session_count(&self.user_id, day_key(now))
            .await
        {
            warn!(user_id = %self.user_id, "daily session count failed: {}", e);
        }
        if let Err(e) = self
            .store
            .increment_monthly_session_count(&self.user_id, &month_key(now))
            .await
        {
            warn!(user_id = %self.user_id, "monthly session count failed: {}", e);
        }

        if let Some(abuse) = &self.abuse {
            abuse.lock().await.check_on_connection().await;
        }

        let summary = match self
            .store
            .usage_summary(&self.user_id, &self.session_id)
            .await
        {
            Ok(summary) => summary,
            Err(e) => {
                // On store failure, allow voice rather than break the session
                warn!(user_id = %self.user_id, "usage summary failed: {}", e);
                UsageSummary::empty(&self.user_id, &self.session_id)
            }
        };

        let mut state = self.state.lock().await;
        state.session_ms = summary.session_duration_ms;
        state.daily_ms = summary.daily_duration_ms;
        state.monthly_ms = summary.monthly_duration_ms;

        info!(
            session_id = %self.session_id,
            session_min = state.session_ms / 60_000,
            daily_min = state.daily_ms / 60_000,
            monthly_min = state.monthly_ms / 60_000,
            "usage tracker initialized"
        );

        if let Some(kind) = self.exceeded_limit(&state) {
            state.voice_enabled = false;
            state.limit_reached = Some(kind);
            drop(state);
            self.dispatcher.broadcast(
                &self.session_id,
                SessionMessage::VoiceDisabled {
                    reason: format!("{}_limit_reached", kind),
                },
            );
            let mut summary = summary;
            summary.voice_enabled = false;
            summary.limit_reached = Some(kind);
            return summary;
        }

        summary
    }

    /// Meter one outbound chunk; `true` means the chunk may be forwarded
    pub async fn track_audio_chunk(self: &Arc<Self>, audio_b64: &str) -> bool {
        if !self.limits.enabled {
            return true;
        }
        {
            let state = self.state.lock().await;
            if !state.voice_enabled {
                return false;
            }
        }

        let bytes = match BASE64.decode(audio_b64) {
            Ok(bytes) => bytes.len() as u64,
            Err(e) => {
                // Malformed payloads pass through unmetered
                warn!(session_id = %self.session_id, "bad audio chunk: {}", e);
                return true;
            }
        };
        if bytes == 0 {
            return true;
        }

        let bytes_per_ms = self.audio.bytes_per_ms.max(1);
        let duration_ms = (bytes / bytes_per_ms).max(self.audio.min_chunk_ms);
        self.add_usage(duration_ms).await
    }

    async fn add_usage(self: &Arc<Self>, duration_ms: u64) -> bool {
        let mut state = self.state.lock().await;
        state.session_ms += duration_ms;
        state.daily_ms += duration_ms;
        state.monthly_ms += duration_ms;

        self.check_warnings(&mut state);

        if let Some(kind) = self.exceeded_limit(&state) {
            state.voice_enabled = false;
            state.limit_reached = Some(kind);
            let used_ms = self.period_used_ms(&state, kind);
            drop(state);
            self.handle_limit_reached(kind, used_ms);
            return false;
        }
        drop(state);

        // Persistence is fire-and-forget; counters above stay authoritative
        let tracker = self.clone();
        tokio::spawn(async move {
            tracker.persist_usage(duration_ms).await;
        });

        if self.abuse.is_some() {
            let tracker = self.clone();
            tokio::spawn(async move {
                if let Some(abuse) = &tracker.abuse {
                    abuse.lock().await.track_activity(duration_ms).await;
                }
            });
        }

        true
    }

    fn check_warnings(&self, state: &mut TrackerState) {
        let checks = [
            (
                LimitKind::Session,
                state.session_ms,
                self.limit_ms(LimitKind::Session),
                state.warned_session,
            ),
            (
                LimitKind::Daily,
                state.daily_ms,
                self.limit_ms(LimitKind::Daily),
                state.warned_daily,
            ),
            (
                LimitKind::Monthly,
                state.monthly_ms,
                self.limit_ms(LimitKind::Monthly),
                state.warned_monthly,
            ),
        ];

        for (kind, used_ms, limit_ms, warned) in checks {
            if warned || limit_ms == 0 {
                continue;
            }
            let threshold = (limit_ms as f64 * self.limits.warning_ratio) as u64;
            if used_ms >= threshold {
                match kind {
                    LimitKind::Session => state.warned_session = true,
                    LimitKind::Daily => state.warned_daily = true,
                    LimitKind::Monthly => state.warned_monthly = true,
                }
                let remaining_minutes =
                    limit_ms.saturating_sub(used_ms) as f64 / 60_000.0;
                debug!(
                    session_id = %self.session_id,
                    period = %kind,
                    remaining_minutes,
                    "usage warning threshold crossed"
                );
                self.dispatcher.broadcast(
                    &self.session_id,
                    SessionMessage::UsageWarning {
                        period: kind,
                        limit_minutes: limit_ms as f64 / 60_000.0,
                        used_minutes: used_ms as f64 / 60_000.0,
                        remaining_minutes,
                        message: format!(
                            "You have approximately {:.1} minutes of voice time remaining for this {} limit.",
                            remaining_minutes, kind
                        ),
                    },
                );
            }
        }
    }

    /// First exceeded limit in priority order
    fn exceeded_limit(&self, state: &TrackerState) -> Option<LimitKind> {
        for kind in [LimitKind::Session, LimitKind::Daily, LimitKind::Monthly] {
            let limit_ms = self.limit_ms(kind);
            if limit_ms > 0 && self.period_used_ms(state, kind) >= limit_ms {
                return Some(kind);
            }
        }
        None
    }

    fn period_used_ms(&self, state: &TrackerState, kind: LimitKind) -> u64 {
        match kind {
            LimitKind::Session => state.session_ms,
            LimitKind::Daily => state.daily_ms,
            LimitKind::Monthly => state.monthly_ms,
        }
    }

    fn limit_ms(&self, kind: LimitKind) -> u64 {
        let minutes = match kind {
            LimitKind::Session => self.limits.session_minutes,
            LimitKind::Daily => self.limits.daily_minutes,
            LimitKind::Monthly => self.limits.monthly_minutes,
        };
        minutes * 60 * 1000
    }

    fn handle_limit_reached(self: &Arc<Self>, kind: LimitKind, used_ms: u64) {
        let limit_minutes = self.limit_ms(kind) as f64 / 60_000.0;
        let used_minutes = used_ms as f64 / 60_000.0;
        info!(
            session_id = %self.session_id,
            user_id = %self.user_id,
            kind = %kind,
            used_minutes,
            "voice limit reached"
        );

        self.dispatcher.broadcast(
            &self.session_id,
            SessionMessage::UsageLimitReached {
                kind,
                limit_minutes,
                used_minutes,
                message: limit_message(kind, limit_minutes),
            },
        );
        self.dispatcher.broadcast(
            &self.session_id,
            SessionMessage::VoiceDisabled {
                reason: format!("{}_limit_reached", kind),
            },
        );

        let tracker = self.clone();
        tokio::spawn(async move {
            let event = new_limit_event(
                &tracker.user_id,
                &tracker.session_id,
                kind,
                limit_minutes,
                used_minutes,
            );
            if let Err(e) = tracker.store.record_limit_event(event).await {
                warn!("record_limit_event failed: {}", e);
            }
            if let Err(e) = tracker
                .store
                .mark_session_limit_reached(&tracker.session_id, kind)
                .await
            {
                warn!("mark_session_limit_reached failed: {}", e);
            }
            if let Err(e) = tracker
                .store
                .increment_daily_limit_reached(&tracker.user_id, day_key(Utc::now()))
                .await
            {
                warn!("increment_daily_limit_reached failed: {}", e);
            }
        });
    }

    async fn persist_usage(&self, duration_ms: u64) {
        let now = Utc::now();
        if let Err(e) = self
            .store
            .update_session_usage(&self.session_id, duration_ms, 1)
            .await
        {
            warn!(session_id = %self.session_id, "update_session_usage failed: {}", e);
        }
        if let Err(e) = self
            .store
            .upsert_daily(&self.user_id, day_key(now), duration_ms, 1)
            .await
        {
            warn!(user_id = %self.user_id, "upsert_daily failed: {}", e);
        }
        if let Err(e) = self
            .store
            .upsert_monthly(&self.user_id, &month_key(now), duration_ms)
            .await
        {
            warn!(user_id = %self.user_id, "upsert_monthly failed: {}", e);
        }
    }

    /// The tracker's supervised task, run in the session's task group
    ///
    /// Metering itself happens inline on the TTS audio path; this task
    /// anchors the tracker in the failure-propagating group, so a tracker
    /// fault cancels the session and a session fault cancels the tracker.
    /// It ends when the session closes.
    pub async fn run(self: Arc<Self>) {
        let mut close = self
            .dispatcher
            .subscribe(&self.session_id, crate::dispatcher::MessageType::SessionClose);
        close.recv().await;
        info!(session_id = %self.session_id, "usage tracker task stopped");
    }

    /// Finalize the session row and run the end-of-session abuse check
    pub async fn end_session(&self) {
        if !self.limits.enabled {
            return;
        }
        if let Some(abuse) = &self.abuse {
            abuse.lock().await.check_session_end().await;
        }
        if let Err(e) = self.store.end_session(&self.session_id).await {
            warn!(session_id = %self.session_id, "end_session failed: {}", e);
        }
        let state = self.state.lock().await;
        info!(
            session_id = %self.session_id,
            total_min = state.session_ms as f64 / 60_000.0,
            "usage session ended"
        );
    }

    /// Whether audio may currently be produced
    pub async fn is_voice_enabled(&self) -> bool {
        if !self.limits.enabled {
            return true;
        }
        self.state.lock().await.voice_enabled
    }

    /// Snapshot of the in-memory counters
    pub async fn summary(&self) -> UsageSummary {
        let state = self.state.lock().await;
        UsageSummary {
            user_id: self.user_id.clone(),
            session_id: self.session_id.clone(),
            session_duration_ms: state.session_ms,
            daily_duration_ms: state.daily_ms,
            monthly_duration_ms: state.monthly_ms,
            voice_enabled: state.voice_enabled,
            limit_reached: state.limit_reached,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }
}

fn limit_message(kind: LimitKind, limit_minutes: f64) -> String {
    match kind {
        LimitKind::Session => format!(
            "You've reached your session voice limit of {:.0} minutes. Voice responses are now disabled, but text chat continues to work.",
            limit_minutes
        ),
        LimitKind::Daily => format!(
            "You've reached your daily voice limit of {:.0} minutes. Voice will be available again tomorrow. Text chat continues to work.",
            limit_minutes
        ),
        LimitKind::Monthly => format!(
            "You've reached your monthly voice limit of {:.0} minutes. Voice will be available next month. Text chat continues to work.",
            limit_minutes
        ),
    }
}
