//! Session supervision
//!
//! Builds the per-session pipeline (usage tracker, STT, LLM driver, TTS,
//! socket manager), runs the components as one failure-propagating task
//! group, and tears everything down when the first of them exits or a
//! `SESSION_CLOSE` is published. All per-session state lives here;
//! components only share the session id and dispatcher handle.

use axum::extract::ws::WebSocket;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::dispatcher::{Dispatcher, MessageType, SessionMessage};
use crate::llm::client::ChatBackend;
use crate::llm::crisis::CrisisDetector;
use crate::llm::driver::LlmDriver;
use crate::llm::tools::ToolRegistry;
use crate::prompts;
use crate::providers::stt_ws::WsSttProvider;
use crate::providers::tts_ws::WsTtsProvider;
use crate::server::socket::SocketManager;
use crate::stt::SttClient;
use crate::tts::TtsClient;
use crate::types::{Language, PersonaRole, SessionSource};
use crate::usage::{UsageStore, UsageTracker};

/// Validated connection parameters
#[derive(Debug, Clone)]
pub struct SessionParams {
    pub user_id: String,
    pub session_id: String,
    pub source: SessionSource,
    pub language: Language,
    pub role: Option<PersonaRole>,
}

impl SessionParams {
    /// Resolve the session id: reuse a well-formed 36-char id, otherwise
    /// mint a fresh one
    pub fn resolve(
        user_id: String,
        session_id: Option<String>,
        source: SessionSource,
        language: Language,
        role: Option<PersonaRole>,
    ) -> Self {
        let session_id = session_id
            .filter(|id| id.len() == 36)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        Self {
            user_id,
            session_id,
            source,
            language,
            role,
        }
    }
}

/// STT language tag for a session language
fn stt_language(language: Language) -> &'static str {
    match language {
        Language::English => "en",
        Language::French => "fr",
        Language::Cantonese => "zh-HK",
        Language::TraditionalChinese => "zh-TW",
    }
}

pub struct SessionSupervisor {
    config: Arc<Config>,
    dispatcher: Arc<Dispatcher>,
    usage_store: Arc<dyn UsageStore>,
    backend: Arc<dyn ChatBackend>,
}

impl SessionSupervisor {
    pub fn new(
        config: Arc<Config>,
        dispatcher: Arc<Dispatcher>,
        usage_store: Arc<dyn UsageStore>,
        backend: Arc<dyn ChatBackend>,
    ) -> Self {
        Self {
            config,
            dispatcher,
            usage_store,
            backend,
        }
    }

    /// Run one client session to completion
    pub async fn run_session(&self, socket: WebSocket, params: SessionParams) {
        let session_id = params.session_id.clone();
        info!(
            session_id = %session_id,
            user_id = %params.user_id,
            source = %params.source,
            language = params.language.code(),
            "session starting"
        );

        let tracker = UsageTracker::new(
            &session_id,
            &params.user_id,
            self.dispatcher.clone(),
            self.usage_store.clone(),
            self.config.limits,
            self.config.audio,
            self.config.abuse,
        );
        let summary = tracker.initialize().await;
        if !summary.voice_enabled {
            warn!(
                session_id = %session_id,
                limit = ?summary.limit_reached,
                "session starts with voice disabled"
            );
        }

        let system_prompt = prompts::compose(params.role, params.language);
        let stt_provider = Arc::new(WsSttProvider::new(
            self.config.stt.clone(),
            stt_language(params.language),
        ));
        let tts_provider = Arc::new(WsTtsProvider::new(
            self.config.tts.clone(),
            prompts::voice_for_language(params.language),
        ));

        let stt = SttClient::new(
            &session_id,
            params.source,
            self.dispatcher.clone(),
            stt_provider,
            self.config.stt.max_reconnect_failures,
        );
        let driver = LlmDriver::new(
            &session_id,
            self.dispatcher.clone(),
            self.backend.clone(),
            Arc::new(ToolRegistry::empty()),
            Some(Arc::new(CrisisDetector::new(self.backend.clone()))),
            &system_prompt,
        );
        let tts = TtsClient::new(
            &session_id,
            self.dispatcher.clone(),
            tts_provider,
            tracker.clone(),
            self.config.tts.clone(),
        );
        let socket_manager =
            SocketManager::new(&session_id, params.source, self.dispatcher.clone());

        // Supervisor-side close watcher; the components also observe the
        // topic themselves, this one drives group teardown
        let mut close = self
            .dispatcher
            .subscribe(&session_id, MessageType::SessionClose);

        let mut tasks = JoinSet::new();
        tasks.spawn(tracker.clone().run());
        tasks.spawn(stt.run());
        tasks.spawn(async move {
            driver.run().await;
        });
        tasks.spawn(tts.run());
        tasks.spawn(socket_manager.run(socket));

        // First component to exit (or an explicit close) cancels the rest;
        // cancellation is a clean path for every component
        tokio::select! {
            _ = tasks.join_next() => {}
            _ = close.recv() => {}
        }
        tasks.abort_all();
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                if !e.is_cancelled() {
                    warn!(session_id = %session_id, "session task panicked: {}", e);
                }
            }
        }

        tracker.end_session().await;
        self.dispatcher.broadcast(
            &session_id,
            SessionMessage::SessionClose {
                reason: "session_terminated".to_string(),
            },
        );
        info!(session_id = %session_id, "session torn down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_reuse_requires_36_chars() {
        let well_formed = Uuid::new_v4().to_string();
        let params = SessionParams::resolve(
            "u1".to_string(),
            Some(well_formed.clone()),
            SessionSource::Device,
            Language::English,
            None,
        );
        assert_eq!(params.session_id, well_formed);

        let params = SessionParams::resolve(
            "u1".to_string(),
            Some("short".to_string()),
            SessionSource::Device,
            Language::English,
            None,
        );
        assert_ne!(params.session_id, "short");
        assert_eq!(params.session_id.len(), 36);

        let params = SessionParams::resolve(
            "u1".to_string(),
            None,
            SessionSource::Phone,
            Language::English,
            None,
        );
        assert_eq!(params.session_id.len(), 36);
    }

    #[test]
    fn test_stt_language_mapping() {
        assert_eq!(stt_language(Language::English), "en");
        assert_eq!(stt_language(Language::French), "fr");
        assert_eq!(stt_language(Language::Cantonese), "zh-HK");
    }
}
