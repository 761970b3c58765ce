//! WebSocket STT provider client
//!
//! Opens a streaming transcription session configured with
//! `(encoding, sample_rate, channels, language)`, forwards binary audio
//! frames, and surfaces interim/final transcript events. One driver task
//! owns the socket; the sink half talks to it over a command channel.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::connect_async;
use tracing::{debug, error, info, warn};
use url::Url;

use super::{
    ProviderError, ProviderEvent, ProviderHandle, ProviderSink, StreamingProvider,
    EVENT_CHANNEL_CAPACITY, MAX_MISSED_PINGS, READ_IDLE_TIMEOUT_SECS,
};
use crate::config::SttConfig;

/// Wire shape of transcript results
#[derive(Debug, Deserialize)]
struct TranscriptFrame {
    #[serde(default)]
    is_final: bool,
    #[serde(default)]
    channel: Option<TranscriptChannel>,
}

#[derive(Debug, Deserialize)]
struct TranscriptChannel {
    alternatives: Vec<TranscriptAlternative>,
}

#[derive(Debug, Deserialize)]
struct TranscriptAlternative {
    #[serde(default)]
    transcript: String,
}

enum SinkCommand {
    Audio(Vec<u8>),
    Finalize,
    Close,
}

/// Streaming STT provider over WebSocket
pub struct WsSttProvider {
    config: SttConfig,
    language: String,
}

impl WsSttProvider {
    pub fn new(config: SttConfig, language: &str) -> Self {
        Self {
            config,
            language: language.to_string(),
        }
    }

    fn session_url(&self) -> Result<Url, ProviderError> {
        let mut url = Url::parse(&self.config.url)
            .map_err(|e| ProviderError::Fatal(format!("bad STT url: {}", e)))?;
        url.query_pairs_mut()
            .append_pair("encoding", &self.config.encoding)
            .append_pair("sample_rate", &self.config.sample_rate.to_string())
            .append_pair("channels", &self.config.channels.to_string())
            .append_pair("language", &self.language)
            .append_pair("interim_results", "true");
        Ok(url)
    }
}

#[async_trait]
impl StreamingProvider for WsSttProvider {
    async fn open(&self) -> Result<ProviderHandle, ProviderError> {
        let url = self.session_url()?;
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| ProviderError::Fatal(format!("bad STT request: {}", e)))?;
        if !self.config.api_key.is_empty() {
            let value = HeaderValue::from_str(&format!("Token {}", self.config.api_key))
                .map_err(|e| ProviderError::Fatal(format!("bad STT api key: {}", e)))?;
            request.headers_mut().insert("Authorization", value);
        }

        let (stream, _) = connect_async(request)
            .await
            .map_err(|e| ProviderError::Transient(format!("STT connect failed: {}", e)))?;
        info!(language = %self.language, "STT provider connected");

        let (cmd_tx, cmd_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        tokio::spawn(drive_connection(stream, cmd_rx, event_tx));

        Ok(ProviderHandle {
            sink: Box::new(WsSttSink { cmd_tx }),
            events: event_rx,
        })
    }
}

struct WsSttSink {
    cmd_tx: mpsc::Sender<SinkCommand>,
}

#[async_trait]
impl ProviderSink for WsSttSink {
    async fn send_text(&mut self, _text: &str) -> Result<(), ProviderError> {
        Err(ProviderError::Fatal(
            "STT sessions accept audio frames only".to_string(),
        ))
    }

    async fn send_audio(&mut self, frame: &[u8]) -> Result<(), ProviderError> {
        self.cmd_tx
            .send(SinkCommand::Audio(frame.to_vec()))
            .await
            .map_err(|_| ProviderError::Transient("STT connection closed".to_string()))
    }

    async fn start_segment(&mut self) -> Result<(), ProviderError> {
        Ok(())
    }

    async fn finish_segment(&mut self) -> Result<(), ProviderError> {
        self.cmd_tx
            .send(SinkCommand::Finalize)
            .await
            .map_err(|_| ProviderError::Transient("STT connection closed".to_string()))
    }

    async fn close(&mut self) -> Result<(), ProviderError> {
        let _ = self.cmd_tx.send(SinkCommand::Close).await;
        Ok(())
    }
}

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

async fn drive_connection(
    mut stream: WsStream,
    mut cmd_rx: mpsc::Receiver<SinkCommand>,
    event_tx: mpsc::Sender<ProviderEvent>,
) {
    let idle = Duration::from_secs(READ_IDLE_TIMEOUT_SECS);
    let mut missed_pings: u32 = 0;

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(SinkCommand::Audio(frame)) => {
                        if let Err(e) = stream.send(WsMessage::Binary(frame.into())).await {
                            warn!("STT send failed: {}", e);
                            let _ = event_tx
                                .send(ProviderEvent::Error(ProviderError::Transient(
                                    e.to_string(),
                                )))
                                .await;
                            break;
                        }
                    }
                    Some(SinkCommand::Finalize) => {
                        let frame = r#"{"type":"Finalize"}"#;
                        if stream.send(WsMessage::Text(frame.into())).await.is_err() {
                            break;
                        }
                    }
                    Some(SinkCommand::Close) | None => {
                        let _ = stream.send(WsMessage::Close(None)).await;
                        break;
                    }
                }
            }
            msg = tokio::time::timeout(idle, stream.next()) => {
                match msg {
                    Ok(Some(Ok(WsMessage::Text(text)))) => {
                        missed_pings = 0;
                        handle_text_frame(&text, &event_tx).await;
                    }
                    Ok(Some(Ok(WsMessage::Pong(_)))) => {
                        missed_pings = 0;
                    }
                    Ok(Some(Ok(WsMessage::Ping(payload)))) => {
                        let _ = stream.send(WsMessage::Pong(payload)).await;
                    }
                    Ok(Some(Ok(WsMessage::Close(_)))) | Ok(None) => {
                        debug!("STT connection closed by provider");
                        break;
                    }
                    Ok(Some(Ok(_))) => {}
                    Ok(Some(Err(e))) => {
                        warn!("STT read error: {}", e);
                        let _ = event_tx
                            .send(ProviderEvent::Error(ProviderError::Transient(
                                e.to_string(),
                            )))
                            .await;
                        break;
                    }
                    Err(_) => {
                        // Idle too long: ping, and give up after repeated misses
                        missed_pings += 1;
                        if missed_pings > MAX_MISSED_PINGS {
                            error!("STT provider unresponsive after {} pings", MAX_MISSED_PINGS);
                            let _ = event_tx
                                .send(ProviderEvent::Error(ProviderError::Transient(
                                    "ping timeout".to_string(),
                                )))
                                .await;
                            break;
                        }
                        if stream.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    }

    let _ = event_tx.send(ProviderEvent::Closed).await;
}

async fn handle_text_frame(text: &str, event_tx: &mpsc::Sender<ProviderEvent>) {
    let frame: TranscriptFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            debug!("unparseable STT frame: {}", e);
            return;
        }
    };
    let transcript = frame
        .channel
        .as_ref()
        .and_then(|c| c.alternatives.first())
        .map(|a| a.transcript.trim().to_string())
        .unwrap_or_default();

    let event = if frame.is_final {
        ProviderEvent::Final(transcript)
    } else {
        if transcript.is_empty() {
            return;
        }
        ProviderEvent::Interim(transcript)
    };
    let _ = event_tx.send(event).await;
}
