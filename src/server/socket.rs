//! Client socket manager
//!
//! Frames the client WebSocket: demuxes inbound frames into the dispatcher
//! (per-source framing) and muxes pipeline events back out as the small JSON
//! envelopes clients understand. Sends are best-effort; any send failure or
//! missed liveness ping means the peer is gone and the session is closed.

use axum::extract::ws::{Message as WsFrame, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::dispatcher::{Dispatcher, FrameData, MessageType, SessionMessage};
use crate::types::SessionSource;
use crate::usage::models::LimitKind;

/// Liveness ping cadence; a dead peer is detected within one interval
const PING_INTERVAL_SECS: u64 = 1;

/// Outbound JSON envelope; absent fields default to false/null on the wire
#[derive(Debug, Default, Serialize)]
pub struct Envelope {
    pub is_text: bool,
    pub is_transcription: bool,
    pub is_end: bool,
    pub is_clear_event: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub msg: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit_type: Option<LimitKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit_minutes: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub used_minutes: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining_minutes: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_critical: Option<bool>,
}

impl Envelope {
    fn streamed_text(msg: String) -> Self {
        Self {
            is_text: true,
            msg: Some(msg),
            ..Self::default()
        }
    }

    fn transcript_echo(msg: String) -> Self {
        Self {
            is_text: true,
            is_transcription: true,
            is_end: true,
            msg: Some(msg),
            ..Self::default()
        }
    }

    fn turn_end() -> Self {
        Self {
            is_text: true,
            is_end: true,
            ..Self::default()
        }
    }

    fn audio(audio: String) -> Self {
        Self {
            audio: Some(audio),
            ..Self::default()
        }
    }

    fn clear() -> Self {
        Self {
            is_clear_event: true,
            ..Self::default()
        }
    }

    fn crisis(is_critical: bool) -> Self {
        Self {
            is_critical: Some(is_critical),
            ..Self::default()
        }
    }
}

/// Map one pipeline event onto its client envelope; `None` means the event
/// is not client-facing
fn envelope_for(message: SessionMessage) -> Option<Envelope> {
    match message {
        SessionMessage::LlmToken { text } => Some(Envelope::streamed_text(text)),
        SessionMessage::OutboundText {
            msg,
            is_transcription,
            is_end,
        } => Some(Envelope {
            is_text: true,
            is_transcription,
            is_end,
            msg,
            ..Envelope::default()
        }),
        SessionMessage::FinalTranscript { text } => Some(Envelope::transcript_echo(text)),
        SessionMessage::TurnEnd { .. } => Some(Envelope::turn_end()),
        SessionMessage::OutboundAudio { audio } => Some(Envelope::audio(audio)),
        SessionMessage::ClearBuffer { .. } => Some(Envelope::clear()),
        SessionMessage::UsageWarning {
            period,
            limit_minutes,
            used_minutes,
            remaining_minutes,
            message,
        } => Some(Envelope {
            event_type: Some("voice_usage_warning".to_string()),
            limit_type: Some(period),
            limit_minutes: Some(limit_minutes),
            used_minutes: Some(used_minutes),
            remaining_minutes: Some(remaining_minutes),
            message: Some(message),
            ..Envelope::default()
        }),
        SessionMessage::UsageLimitReached {
            kind,
            limit_minutes,
            used_minutes,
            message,
        } => Some(Envelope {
            event_type: Some("voice_limit_reached".to_string()),
            limit_type: Some(kind),
            limit_minutes: Some(limit_minutes),
            used_minutes: Some(used_minutes),
            message: Some(message),
            ..Envelope::default()
        }),
        SessionMessage::VoiceDisabled { reason } => Some(Envelope {
            event_type: Some("voice_disabled".to_string()),
            message: Some(reason),
            ..Envelope::default()
        }),
        SessionMessage::AbuseDetected { event_type, .. } => Some(Envelope {
            event_type: Some("voice_abuse_detected".to_string()),
            message: Some(event_type.as_str().to_string()),
            ..Envelope::default()
        }),
        SessionMessage::CrisisDetected { is_critical } => Some(Envelope::crisis(is_critical)),
        _ => None,
    }
}

pub struct SocketManager {
    session_id: String,
    source: SessionSource,
    dispatcher: Arc<Dispatcher>,
}

impl SocketManager {
    pub fn new(session_id: &str, source: SessionSource, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            session_id: session_id.to_string(),
            source,
            dispatcher,
        }
    }

    /// Run both directions until the peer disconnects or the session closes
    pub async fn run(self, socket: WebSocket) {
        let (ws_tx, ws_rx) = socket.split();

        tokio::select! {
            _ = self.pump_inbound(ws_rx) => {
                debug!(session_id = %self.session_id, "inbound socket stream ended");
            }
            _ = self.pump_outbound(ws_tx) => {
                debug!(session_id = %self.session_id, "outbound socket pump ended");
            }
        }

        self.dispatcher.broadcast(
            &self.session_id,
            SessionMessage::SessionClose {
                reason: "peer_closed".to_string(),
            },
        );
        info!(session_id = %self.session_id, "client socket closed");
    }

    async fn pump_inbound(&self, mut ws_rx: SplitStream<WebSocket>) {
        while let Some(frame) = ws_rx.next().await {
            let frame = match frame {
                Ok(frame) => frame,
                Err(e) => {
                    debug!(session_id = %self.session_id, "socket read error: {}", e);
                    return;
                }
            };
            match frame {
                WsFrame::Text(text) => match self.source {
                    SessionSource::Device | SessionSource::Web => {
                        self.dispatcher.broadcast(
                            &self.session_id,
                            SessionMessage::InboundFrame {
                                data: FrameData::Text(text.to_string()),
                            },
                        );
                    }
                    SessionSource::Phone => {
                        debug!(session_id = %self.session_id, "text frame on phone source dropped");
                    }
                },
                WsFrame::Binary(data) => match self.source {
                    SessionSource::Phone | SessionSource::Web => {
                        self.dispatcher.broadcast(
                            &self.session_id,
                            SessionMessage::InboundFrame {
                                data: FrameData::Binary(data.to_vec()),
                            },
                        );
                    }
                    SessionSource::Device => {
                        debug!(session_id = %self.session_id, "binary frame on device source dropped");
                    }
                },
                WsFrame::Close(_) => return,
                // Ping/pong are handled by the transport
                _ => {}
            }
        }
    }

    async fn pump_outbound(&self, mut ws_tx: SplitSink<WebSocket, WsFrame>) {
        let mut tokens = self.subscribe(MessageType::LlmToken);
        let mut text = self.subscribe(MessageType::OutboundText);
        let mut transcripts = self.subscribe(MessageType::FinalTranscript);
        let mut turn_ends = self.subscribe(MessageType::TurnEnd);
        let mut audio = self.subscribe(MessageType::OutboundAudio);
        let mut clear = self.subscribe(MessageType::ClearBuffer);
        let mut warnings = self.subscribe(MessageType::UsageWarning);
        let mut limits = self.subscribe(MessageType::UsageLimitReached);
        let mut disabled = self.subscribe(MessageType::VoiceDisabled);
        let mut abuse = self.subscribe(MessageType::AbuseDetected);
        let mut crisis = self.subscribe(MessageType::CrisisDetected);
        let mut close = self.subscribe(MessageType::SessionClose);

        let mut ping = tokio::time::interval(Duration::from_secs(PING_INTERVAL_SECS));
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            let event = tokio::select! {
                e = tokens.recv() => e,
                e = text.recv() => e,
                e = transcripts.recv() => e,
                e = turn_ends.recv() => e,
                e = audio.recv() => e,
                e = clear.recv() => e,
                e = warnings.recv() => e,
                e = limits.recv() => e,
                e = disabled.recv() => e,
                e = abuse.recv() => e,
                e = crisis.recv() => e,
                _ = close.recv() => {
                    let _ = ws_tx.send(WsFrame::Close(None)).await;
                    return;
                }
                _ = ping.tick() => {
                    if ws_tx.send(WsFrame::Ping(Vec::new().into())).await.is_err() {
                        warn!(session_id = %self.session_id, "liveness ping failed");
                        return;
                    }
                    continue;
                }
            };

            let Some(event) = event else { return };
            let Some(envelope) = envelope_for(event.message) else {
                continue;
            };
            let payload = match serde_json::to_string(&envelope) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(session_id = %self.session_id, "envelope serialize failed: {}", e);
                    continue;
                }
            };
            if ws_tx.send(WsFrame::Text(payload.into())).await.is_err() {
                warn!(session_id = %self.session_id, "socket send failed, closing session");
                return;
            }
        }
    }

    fn subscribe(&self, message_type: MessageType) -> crate::dispatcher::Subscription {
        self.dispatcher.subscribe(&self.session_id, message_type)
    }
}
