//! STT pipeline component
//!
//! Bridges inbound client frames to transcript topics. Text-source sessions
//! never open a provider stream: their frames carry pre-transcribed text and
//! are forwarded as synthesized final transcripts. Audio-source sessions
//! stream binary frames to the provider and relay its interim/final events.
//! Provider drops are retried with jittered exponential backoff; after too
//! many consecutive failures the session is torn down.

use rand::Rng;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::dispatcher::{Dispatcher, FrameData, SessionMessage, Subscription};
use crate::providers::{ProviderEvent, ProviderHandle, StreamingProvider};
use crate::types::SessionSource;

/// Reconnect backoff floor
const BACKOFF_BASE_MS: u64 = 100;
/// Reconnect backoff ceiling
const BACKOFF_CAP_MS: u64 = 5_000;

/// Text frames from `device`/`web` clients
#[derive(Debug, Deserialize)]
struct TextFrame {
    #[serde(default)]
    transcribed_text: Option<String>,
    #[serde(default)]
    user_msg: Option<String>,
}

impl TextFrame {
    fn into_utterance(self) -> Option<String> {
        self.transcribed_text
            .or(self.user_msg)
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
    }
}

pub struct SttClient {
    session_id: String,
    source: SessionSource,
    dispatcher: Arc<Dispatcher>,
    provider: Arc<dyn StreamingProvider>,
    max_reconnect_failures: u32,
}

impl SttClient {
    pub fn new(
        session_id: &str,
        source: SessionSource,
        dispatcher: Arc<Dispatcher>,
        provider: Arc<dyn StreamingProvider>,
        max_reconnect_failures: u32,
    ) -> Self {
        Self {
            session_id: session_id.to_string(),
            source,
            dispatcher,
            provider,
            max_reconnect_failures: max_reconnect_failures.max(1),
        }
    }

    /// Run until the session closes or the provider becomes unavailable
    pub async fn run(self) {
        let frames = self
            .dispatcher
            .subscribe(&self.session_id, crate::dispatcher::MessageType::InboundFrame);
        let close = self
            .dispatcher
            .subscribe(&self.session_id, crate::dispatcher::MessageType::SessionClose);

        if self.source.is_text_only() {
            self.run_text_only(frames, close).await;
        } else {
            self.run_streaming(frames, close).await;
        }
        debug!(session_id = %self.session_id, "STT client stopped");
    }

    async fn run_text_only(&self, mut frames: Subscription, mut close: Subscription) {
        loop {
            tokio::select! {
                event = frames.recv() => {
                    let Some(event) = event else { return };
                    if let SessionMessage::InboundFrame { data } = event.message {
                        match data {
                            FrameData::Text(text) => self.forward_text_frame(&text),
                            FrameData::Binary(_) => {
                                debug!(session_id = %self.session_id,
                                       "binary frame on text-only source dropped");
                            }
                        }
                    }
                }
                _ = close.recv() => return,
            }
        }
    }

    async fn run_streaming(&self, mut frames: Subscription, mut close: Subscription) {
        let mut failures: u32 = 0;

        loop {
            let handle = match self.provider.open().await {
                Ok(handle) => {
                    failures = 0;
                    handle
                }
                Err(e) if e.is_transient() => {
                    failures += 1;
                    warn!(
                        session_id = %self.session_id,
                        failures, "STT connect failed: {}", e
                    );
                    if failures >= self.max_reconnect_failures {
                        self.close_session_unavailable();
                        return;
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(backoff_delay(failures)) => continue,
                        _ = close.recv() => return,
                    }
                }
                Err(e) => {
                    warn!(session_id = %self.session_id, "STT fatal error: {}", e);
                    self.close_session_unavailable();
                    return;
                }
            };

            match self.pump(handle, &mut frames, &mut close).await {
                PumpExit::SessionOver => return,
                PumpExit::Reconnect => {
                    failures += 1;
                    if failures >= self.max_reconnect_failures {
                        self.close_session_unavailable();
                        return;
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(backoff_delay(failures)) => {}
                        _ = close.recv() => return,
                    }
                }
            }
        }
    }

    /// Shuttle frames and events over one live connection
    async fn pump(
        &self,
        handle: ProviderHandle,
        frames: &mut Subscription,
        close: &mut Subscription,
    ) -> PumpExit {
        let ProviderHandle {
            mut sink,
            mut events,
        } = handle;

        loop {
            tokio::select! {
                event = frames.recv() => {
                    let Some(event) = event else {
                        let _ = sink.close().await;
                        return PumpExit::SessionOver;
                    };
                    if let SessionMessage::InboundFrame { data } = event.message {
                        match data {
                            FrameData::Binary(frame) => {
                                if let Err(e) = sink.send_audio(&frame).await {
                                    warn!(session_id = %self.session_id,
                                          "STT frame send failed: {}", e);
                                    return PumpExit::Reconnect;
                                }
                            }
                            // Web clients may interleave text frames
                            FrameData::Text(text) => self.forward_text_frame(&text),
                        }
                    }
                }
                event = events.recv() => {
                    match event {
                        Some(ProviderEvent::Interim(text)) => {
                            if !text.is_empty() {
                                self.dispatcher.broadcast(
                                    &self.session_id,
                                    SessionMessage::InterimTranscript { text },
                                );
                            }
                        }
                        Some(ProviderEvent::Final(text)) => {
                            let text = text.trim().to_string();
                            // Empty finals are noise, not turns
                            if !text.is_empty() {
                                info!(session_id = %self.session_id, %text, "final transcript");
                                self.dispatcher.broadcast(
                                    &self.session_id,
                                    SessionMessage::FinalTranscript { text },
                                );
                            }
                        }
                        Some(ProviderEvent::Error(e)) => {
                            warn!(session_id = %self.session_id, "STT stream error: {}", e);
                        }
                        Some(ProviderEvent::Closed) | None => {
                            debug!(session_id = %self.session_id, "STT stream closed");
                            return PumpExit::Reconnect;
                        }
                        Some(_) => {}
                    }
                }
                _ = close.recv() => {
                    let _ = sink.close().await;
                    return PumpExit::SessionOver;
                }
            }
        }
    }

    fn forward_text_frame(&self, text: &str) {
        let utterance = match serde_json::from_str::<TextFrame>(text) {
            Ok(frame) => frame.into_utterance(),
            Err(e) => {
                debug!(session_id = %self.session_id, "bad text frame dropped: {}", e);
                None
            }
        };
        if let Some(text) = utterance {
            self.dispatcher.broadcast(
                &self.session_id,
                SessionMessage::FinalTranscript { text },
            );
        }
    }

    fn close_session_unavailable(&self) {
        self.dispatcher.broadcast(
            &self.session_id,
            SessionMessage::SessionClose {
                reason: "stt_unavailable".to_string(),
            },
        );
    }
}

enum PumpExit {
    SessionOver,
    Reconnect,
}

/// Exponential backoff with ±25% jitter: 100ms, 200ms, ... capped at 5s
fn backoff_delay(attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    let base = BACKOFF_BASE_MS.saturating_mul(1u64 << exp).min(BACKOFF_CAP_MS);
    let jitter = rand::rng().random_range(0.75..=1.25);
    Duration::from_millis((base as f64 * jitter) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::MessageType;

    #[test]
    fn test_text_frame_field_fallback() {
        let frame: TextFrame =
            serde_json::from_str(r#"{"transcribed_text": " hello "}"#).unwrap();
        assert_eq!(frame.into_utterance().as_deref(), Some("hello"));

        let frame: TextFrame = serde_json::from_str(r#"{"user_msg": "hi"}"#).unwrap();
        assert_eq!(frame.into_utterance().as_deref(), Some("hi"));

        let frame: TextFrame = serde_json::from_str(r#"{"user_msg": "   "}"#).unwrap();
        assert_eq!(frame.into_utterance(), None);
    }

    #[test]
    fn test_backoff_envelope() {
        // First attempt centers on 100ms, jitter keeps it within ±25%
        for attempt in 1..10 {
            let delay = backoff_delay(attempt).as_millis() as u64;
            assert!(delay >= 75, "attempt {} too short: {}ms", attempt, delay);
            assert!(delay <= 6_250, "attempt {} too long: {}ms", attempt, delay);
        }
        // Deep attempts stay at the cap
        let deep = backoff_delay(30).as_millis() as u64;
        assert!(deep >= 3_750 && deep <= 6_250);
    }

    #[tokio::test]
    async fn test_text_only_session_synthesizes_finals() {
        let dispatcher = Arc::new(Dispatcher::new());
        let mut finals = dispatcher.subscribe("s1", MessageType::FinalTranscript);

        struct NeverProvider;
        #[async_trait::async_trait]
        impl StreamingProvider for NeverProvider {
            async fn open(
                &self,
            ) -> Result<crate::providers::ProviderHandle, crate::providers::ProviderError>
            {
                panic!("text-only sessions must not open a provider stream");
            }
        }

        let client = SttClient::new(
            "s1",
            SessionSource::Device,
            dispatcher.clone(),
            Arc::new(NeverProvider),
            5,
        );
        let task = tokio::spawn(client.run());
        // Let the client subscribe before publishing
        tokio::task::yield_now().await;
        while dispatcher.subscriber_count("s1", MessageType::InboundFrame) == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        dispatcher.broadcast(
            "s1",
            SessionMessage::InboundFrame {
                data: FrameData::Text(r#"{"transcribed_text": "hello"}"#.to_string()),
            },
        );
        // Unparseable and empty frames are dropped
        dispatcher.broadcast(
            "s1",
            SessionMessage::InboundFrame {
                data: FrameData::Text("not json".to_string()),
            },
        );
        dispatcher.broadcast(
            "s1",
            SessionMessage::InboundFrame {
                data: FrameData::Text(r#"{"user_msg": ""}"#.to_string()),
            },
        );

        let event = finals.recv().await.unwrap();
        match event.message {
            SessionMessage::FinalTranscript { text } => assert_eq!(text, "hello"),
            other => panic!("unexpected message: {:?}", other),
        }
        assert!(finals.try_recv().is_none());

        dispatcher.broadcast(
            "s1",
            SessionMessage::SessionClose {
                reason: "test".to_string(),
            },
        );
        task.await.unwrap();
    }
}
