//! WebSocket TTS provider client
//!
//! Speaks a task-framed synthesis protocol: after the connection handshake,
//! each turn is bracketed by `task_start` / `task_finish`, with
//! `task_continue` frames carrying text in between. Audio arrives as
//! hex-encoded PCM chunks; a segment ends when the provider marks a frame
//! final. One driver task owns the socket.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, error, info, warn};

use super::{
    ProviderError, ProviderEvent, ProviderHandle, ProviderSink, StreamingProvider,
    EVENT_CHANNEL_CAPACITY, MAX_MISSED_PINGS, READ_IDLE_TIMEOUT_SECS,
};
use crate::config::TtsConfig;

enum SinkCommand {
    StartSegment,
    Text(String),
    FinishSegment,
    Close,
}

/// Streaming TTS provider over WebSocket
pub struct WsTtsProvider {
    config: TtsConfig,
    voice_id: String,
}

impl WsTtsProvider {
    /// `voice_id` is resolved per session (language-dependent); falls back
    /// to the configured default when empty
    pub fn new(config: TtsConfig, voice_id: &str) -> Self {
        let voice_id = if voice_id.is_empty() {
            config.voice_id.clone()
        } else {
            voice_id.to_string()
        };
        Self { config, voice_id }
    }

    fn task_start_frame(&self) -> String {
        json!({
            "event": "task_start",
            "model": self.config.model,
            "voice_setting": {
                "voice_id": self.voice_id,
                "speed": 1.0,
                "vol": 1,
                "pitch": 0,
            },
            "audio_setting": {
                "sample_rate": 16000,
                "format": "pcm",
                "channel": 1,
            },
        })
        .to_string()
    }
}

#[async_trait]
impl StreamingProvider for WsTtsProvider {
    async fn open(&self) -> Result<ProviderHandle, ProviderError> {
        let mut request = self
            .config
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| ProviderError::Fatal(format!("bad TTS url: {}", e)))?;
        if !self.config.api_key.is_empty() {
            let value = HeaderValue::from_str(&format!("Bearer {}", self.config.api_key))
                .map_err(|e| ProviderError::Fatal(format!("bad TTS api key: {}", e)))?;
            request.headers_mut().insert("Authorization", value);
        }

        let (mut stream, _) = connect_async(request)
            .await
            .map_err(|e| ProviderError::Transient(format!("TTS connect failed: {}", e)))?;

        // The provider confirms the connection before accepting tasks
        match stream.next().await {
            Some(Ok(WsMessage::Text(text))) => {
                let frame: serde_json::Value = serde_json::from_str(&text)
                    .map_err(|e| ProviderError::Transient(format!("bad TTS handshake: {}", e)))?;
                if frame["event"] != "connected_success" {
                    return Err(ProviderError::Transient(format!(
                        "TTS handshake rejected: {}",
                        frame
                    )));
                }
            }
            other => {
                return Err(ProviderError::Transient(format!(
                    "TTS handshake missing: {:?}",
                    other.map(|r| r.map(|m| m.to_string()))
                )));
            }
        }
        info!(voice_id = %self.voice_id, "TTS provider connected");

        let (cmd_tx, cmd_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let task_start = self.task_start_frame();
        tokio::spawn(drive_connection(stream, cmd_rx, event_tx, task_start));

        Ok(ProviderHandle {
            sink: Box::new(WsTtsSink { cmd_tx }),
            events: event_rx,
        })
    }
}

struct WsTtsSink {
    cmd_tx: mpsc::Sender<SinkCommand>,
}

impl WsTtsSink {
    async fn send(&self, cmd: SinkCommand) -> Result<(), ProviderError> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| ProviderError::Transient("TTS connection closed".to_string()))
    }
}

#[async_trait]
impl ProviderSink for WsTtsSink {
    async fn send_text(&mut self, text: &str) -> Result<(), ProviderError> {
        self.send(SinkCommand::Text(text.to_string())).await
    }

    async fn send_audio(&mut self, _frame: &[u8]) -> Result<(), ProviderError> {
        Err(ProviderError::Fatal(
            "TTS sessions accept text only".to_string(),
        ))
    }

    async fn start_segment(&mut self) -> Result<(), ProviderError> {
        self.send(SinkCommand::StartSegment).await
    }

    async fn finish_segment(&mut self) -> Result<(), ProviderError> {
        self.send(SinkCommand::FinishSegment).await
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
    task_start_frame: String,
) {
    let idle = Duration::from_secs(READ_IDLE_TIMEOUT_SECS);
    let mut missed_pings: u32 = 0;

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                let frame = match cmd {
                    Some(SinkCommand::StartSegment) => task_start_frame.clone(),
                    Some(SinkCommand::Text(text)) => {
                        json!({"event": "task_continue", "text": text}).to_string()
                    }
                    Some(SinkCommand::FinishSegment) => {
                        json!({"event": "task_finish"}).to_string()
                    }
                    Some(SinkCommand::Close) | None => {
                        let _ = stream.send(WsMessage::Close(None)).await;
                        break;
                    }
                };
                if let Err(e) = stream.send(WsMessage::Text(frame.into())).await {
                    warn!("TTS send failed: {}", e);
                    let _ = event_tx
                        .send(ProviderEvent::Error(ProviderError::Transient(e.to_string())))
                        .await;
                    break;
                }
            }
            msg = tokio::time::timeout(idle, stream.next()) => {
                match msg {
                    Ok(Some(Ok(WsMessage::Text(text)))) => {
                        missed_pings = 0;
                        if !handle_text_frame(&text, &event_tx).await {
                            break;
                        }
                    }
                    Ok(Some(Ok(WsMessage::Pong(_)))) => {
                        missed_pings = 0;
                    }
                    Ok(Some(Ok(WsMessage::Ping(payload)))) => {
                        let _ = stream.send(WsMessage::Pong(payload)).await;
                    }
                    Ok(Some(Ok(WsMessage::Close(_)))) | Ok(None) => {
                        debug!("TTS connection closed by provider");
                        break;
                    }
                    Ok(Some(Ok(_))) => {}
                    Ok(Some(Err(e))) => {
                        warn!("TTS read error: {}", e);
                        let _ = event_tx
                            .send(ProviderEvent::Error(ProviderError::Transient(e.to_string())))
                            .await;
                        break;
                    }
                    Err(_) => {
                        missed_pings += 1;
                        if missed_pings > MAX_MISSED_PINGS {
                            error!("TTS provider unresponsive after {} pings", MAX_MISSED_PINGS);
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

/// Returns false when the loop should stop
async fn handle_text_frame(text: &str, event_tx: &mpsc::Sender<ProviderEvent>) -> bool {
    let frame: serde_json::Value = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            debug!("unparseable TTS frame: {}", e);
            return true;
        }
    };

    match frame["event"].as_str() {
        Some("task_started") => {
            debug!("TTS task started");
            return true;
        }
        Some("task_failed") => {
            warn!("TTS task failed: {}", frame);
            let _ = event_tx
                .send(ProviderEvent::Error(ProviderError::Transient(
                    frame.to_string(),
                )))
                .await;
            return true;
        }
        _ => {}
    }

    if let Some(audio_hex) = frame["data"]["audio"].as_str() {
        if let Some(bytes) = decode_hex(audio_hex) {
            if !bytes.is_empty() {
                let _ = event_tx.send(ProviderEvent::Audio(bytes)).await;
            }
        } else {
            debug!("dropping undecodable audio frame");
        }
    }

    if frame["is_final"].as_bool() == Some(true) {
        let _ = event_tx.send(ProviderEvent::SegmentEnd).await;
    }
    true
}

fn decode_hex(raw: &str) -> Option<Vec<u8>> {
    if raw.len() % 2 != 0 {
        return None;
    }
    let mut out = Vec::with_capacity(raw.len() / 2);
    let bytes = raw.as_bytes();
    for pair in bytes.chunks_exact(2) {
        let hi = (pair[0] as char).to_digit(16)?;
        let lo = (pair[1] as char).to_digit(16)?;
        out.push(((hi << 4) | lo) as u8);
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_hex() {
        assert_eq!(decode_hex("00ff10"), Some(vec![0x00, 0xff, 0x10]));
        assert_eq!(decode_hex("abc"), None);
        assert_eq!(decode_hex("zz"), None);
        assert_eq!(decode_hex(""), Some(Vec::new()));
    }

    #[test]
    fn test_task_start_frame_shape() {
        let provider = WsTtsProvider::new(TtsConfig::default(), "hunyin_6");
        let frame: serde_json::Value =
            serde_json::from_str(&provider.task_start_frame()).unwrap();
        assert_eq!(frame["event"], "task_start");
        assert_eq!(frame["voice_setting"]["voice_id"], "hunyin_6");
        assert_eq!(frame["audio_setting"]["sample_rate"], 16000);
        assert_eq!(frame["audio_setting"]["format"], "pcm");
    }

    #[test]
    fn test_empty_voice_falls_back_to_config_default() {
        let provider = WsTtsProvider::new(TtsConfig::default(), "");
        let frame: serde_json::Value =
            serde_json::from_str(&provider.task_start_frame()).unwrap();
        assert_eq!(
            frame["voice_setting"]["voice_id"],
            "english_expressive_narrator"
        );
    }

    #[tokio::test]
    async fn test_audio_frame_handling() {
        let (tx, mut rx) = mpsc::channel(8);
        let raw = r#"{"data": {"audio": "0102"}, "is_final": true}"#;
        assert!(handle_text_frame(raw, &tx).await);

        match rx.recv().await.unwrap() {
            ProviderEvent::Audio(bytes) => assert_eq!(bytes, vec![1, 2]),
            other => panic!("unexpected event: {:?}", other),
        }
        match rx.recv().await.unwrap() {
            ProviderEvent::SegmentEnd => {}
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
