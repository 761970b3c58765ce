//! TTS pipeline component
//!
//! Converts the LLM token stream into provider synthesis requests and
//! forwards the resulting audio to the client, subject to usage quotas and
//! barge-in.
//!
//! Smart buffering: tokens accumulate until the buffer ends a sentence
//! (with a minimum length), reaches the word-count threshold, goes idle for
//! the timer interval, or hits the hard byte cap. `TTS_BUFFER_FLUSH` forces
//! a flush regardless of size.
//!
//! The provider connection is lazy and task-framed: `task_start` goes out
//! before the first segment of a turn, `task_finish` at turn end or on
//! barge-in. The audio listener runs for the life of the connection and only
//! terminates when the connection (or session) does.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::TtsConfig;
use crate::dispatcher::{Dispatcher, MessageType, SessionMessage};
use crate::providers::{ProviderEvent, ProviderSink, StreamingProvider};
use crate::usage::UsageTracker;

/// Sentence-terminating punctuation at the end of the buffer
static SENTENCE_END: Lazy<Regex> = Lazy::new(|| Regex::new(r"[.!?]\s*$").unwrap());

/// Minimum buffer length for the sentence-end trigger
const SENTENCE_MIN_CHARS: usize = 10;

/// Connection / generation state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtsState {
    Disconnected,
    Connecting,
    Idle,
    Generating,
    Flushing,
    Interrupted,
    Closed,
}

/// State shared with the audio listener task
struct TtsShared {
    session_id: String,
    dispatcher: Arc<Dispatcher>,
    tracker: Arc<UsageTracker>,
    state: StdMutex<TtsState>,
    is_interrupted: AtomicBool,
    task_started: AtomicBool,
    connected: AtomicBool,
}

impl TtsShared {
    fn set_state(&self, state: TtsState) {
        *self.state.lock().unwrap() = state;
    }

    fn state(&self) -> TtsState {
        *self.state.lock().unwrap()
    }
}

#[derive(Clone)]
pub struct TtsClient {
    shared: Arc<TtsShared>,
    provider: Arc<dyn StreamingProvider>,
    config: TtsConfig,
}

struct Connection {
    sink: Box<dyn ProviderSink>,
    listener: JoinHandle<()>,
}

impl TtsClient {
    pub fn new(
        session_id: &str,
        dispatcher: Arc<Dispatcher>,
        provider: Arc<dyn StreamingProvider>,
        tracker: Arc<UsageTracker>,
        config: TtsConfig,
    ) -> Self {
        Self {
            shared: Arc::new(TtsShared {
                session_id: session_id.to_string(),
                dispatcher,
                tracker,
                state: StdMutex::new(TtsState::Disconnected),
                is_interrupted: AtomicBool::new(false),
                task_started: AtomicBool::new(false),
                connected: AtomicBool::new(false),
            }),
            provider,
            config,
        }
    }

    /// Current state-machine position (observability and tests)
    pub fn state(&self) -> TtsState {
        self.shared.state()
    }

    /// Run until the session closes
    pub async fn run(self) {
        let dispatcher = self.shared.dispatcher.clone();
        let session_id = self.shared.session_id.clone();
        let mut tokens = dispatcher.subscribe(&session_id, MessageType::LlmToken);
        let mut force_flush = dispatcher.subscribe(&session_id, MessageType::TtsBufferFlush);
        let mut turn_end = dispatcher.subscribe(&session_id, MessageType::TurnEnd);
        let mut finals = dispatcher.subscribe(&session_id, MessageType::FinalTranscript);
        let mut close = dispatcher.subscribe(&session_id, MessageType::SessionClose);

        let (timer_tx, mut timer_rx) = mpsc::channel::<()>(1);
        let mut buffer = String::new();
        let mut timer: Option<JoinHandle<()>> = None;
        let mut conn: Option<Connection> = None;

        loop {
            // Biased: queued tokens are consumed before the turn-end marker
            // that follows them, so the tail of an answer is never orphaned
            tokio::select! {
                biased;
                event = tokens.recv() => {
                    let Some(event) = event else { break };
                    if let SessionMessage::LlmToken { text } = event.message {
                        self.on_token(&text, &mut buffer, &mut timer, &timer_tx, &mut conn)
                            .await;
                    }
                }
                event = force_flush.recv() => {
                    if event.is_none() { break }
                    cancel_timer(&mut timer);
                    self.flush(&mut buffer, &mut conn, "forced").await;
                }
                event = turn_end.recv() => {
                    if event.is_none() { break }
                    cancel_timer(&mut timer);
                    self.flush(&mut buffer, &mut conn, "turn_end").await;
                    self.finish_segment(&mut conn).await;
                    if self.shared.state() == TtsState::Generating {
                        self.shared.set_state(TtsState::Flushing);
                    }
                }
                event = finals.recv() => {
                    if event.is_none() { break }
                    self.on_barge_in(&mut buffer, &mut timer, &mut conn).await;
                }
                _ = timer_rx.recv() => {
                    timer = None;
                    if !buffer.trim().is_empty()
                        && !self.shared.is_interrupted.load(Ordering::Acquire)
                    {
                        self.flush(&mut buffer, &mut conn, "timer").await;
                    }
                }
                _ = close.recv() => break,
            }
        }

        cancel_timer(&mut timer);
        if let Some(mut conn) = conn.take() {
            let _ = conn.sink.close().await;
            conn.listener.abort();
        }
        self.shared.set_state(TtsState::Closed);
        debug!(session_id = %self.shared.session_id, "TTS client stopped");
    }

    async fn on_token(
        &self,
        text: &str,
        buffer: &mut String,
        timer: &mut Option<JoinHandle<()>>,
        timer_tx: &mpsc::Sender<()>,
        conn: &mut Option<Connection>,
    ) {
        // A token after an interruption starts the next answer
        if self.shared.is_interrupted.swap(false, Ordering::AcqRel) {
            debug!(session_id = %self.shared.session_id, "interruption cleared by new token");
        }
        if !self.shared.tracker.is_voice_enabled().await {
            return;
        }

        buffer.push_str(text);

        let trimmed = buffer.trim();
        let word_count = trimmed.split_whitespace().count();
        let reason = if SENTENCE_END.is_match(trimmed) && trimmed.len() >= SENTENCE_MIN_CHARS {
            Some("sentence_end")
        } else if word_count >= self.config.min_buffer_words {
            Some("buffer_size")
        } else if buffer.len() >= self.config.max_buffer_bytes {
            Some("byte_cap")
        } else {
            None
        };

        match reason {
            Some(reason) => {
                cancel_timer(timer);
                self.flush(buffer, conn, reason).await;
            }
            None => self.schedule_timer(timer, timer_tx),
        }
    }

    fn schedule_timer(&self, timer: &mut Option<JoinHandle<()>>, timer_tx: &mpsc::Sender<()>) {
        cancel_timer(timer);
        let tx = timer_tx.clone();
        let delay = Duration::from_millis(self.config.max_buffer_ms);
        *timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.try_send(());
        }));
    }

    /// Send the buffered text to the provider and clear the buffer
    async fn flush(&self, buffer: &mut String, conn: &mut Option<Connection>, reason: &str) {
        let text = std::mem::take(buffer);
        let text = text.replace('*', "");
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        if self.shared.is_interrupted.load(Ordering::Acquire) {
            return;
        }
        if !self.shared.tracker.is_voice_enabled().await {
            debug!(session_id = %self.shared.session_id, "voice disabled, dropping segment");
            return;
        }

        if !self.ensure_connected(conn).await {
            warn!(session_id = %self.shared.session_id, "no TTS connection, segment dropped");
            return;
        }
        let connection = conn.as_mut().expect("ensured above");

        if !self.shared.task_started.load(Ordering::Acquire) {
            if let Err(e) = connection.sink.start_segment().await {
                warn!(session_id = %self.shared.session_id, "task start failed: {}", e);
                self.drop_connection(conn).await;
                return;
            }
            self.shared.task_started.store(true, Ordering::Release);
            self.shared.set_state(TtsState::Generating);
        }

        debug!(
            session_id = %self.shared.session_id,
            reason,
            chars = text.len(),
            "flushing synthesis segment"
        );
        if let Err(e) = connection.sink.send_text(text).await {
            warn!(session_id = %self.shared.session_id, "segment send failed: {}", e);
            self.drop_connection(conn).await;
        }
    }

    async fn finish_segment(&self, conn: &mut Option<Connection>) {
        if !self.shared.task_started.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(connection) = conn.as_mut() {
            if let Err(e) = connection.sink.finish_segment().await {
                warn!(session_id = %self.shared.session_id, "task finish failed: {}", e);
                self.drop_connection(conn).await;
            }
        }
    }

    async fn on_barge_in(
        &self,
        buffer: &mut String,
        timer: &mut Option<JoinHandle<()>>,
        conn: &mut Option<Connection>,
    ) {
        info!(session_id = %self.shared.session_id, "user spoke, interrupting synthesis");
        self.shared.is_interrupted.store(true, Ordering::Release);
        buffer.clear();
        cancel_timer(timer);
        self.finish_segment(conn).await;
        self.shared.set_state(TtsState::Interrupted);
        self.shared.dispatcher.broadcast(
            &self.shared.session_id,
            SessionMessage::ClearBuffer {
                source: "tts_interrupt".to_string(),
            },
        );
    }

    /// Lazy connect with bounded retry
    async fn ensure_connected(&self, conn: &mut Option<Connection>) -> bool {
        if conn.is_some() && self.shared.connected.load(Ordering::Acquire) {
            return true;
        }
        self.drop_connection(conn).await;
        self.shared.set_state(TtsState::Connecting);

        for attempt in 1..=self.config.max_connect_attempts {
            match self.provider.open().await {
                Ok(handle) => {
                    self.shared.connected.store(true, Ordering::Release);
                    self.shared.task_started.store(false, Ordering::Release);
                    self.shared.set_state(TtsState::Idle);
                    let listener =
                        tokio::spawn(audio_listener(self.shared.clone(), handle.events));
                    *conn = Some(Connection {
                        sink: handle.sink,
                        listener,
                    });
                    return true;
                }
                Err(e) => {
                    warn!(
                        session_id = %self.shared.session_id,
                        attempt, "TTS connect failed: {}", e
                    );
                    if !e.is_transient() {
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
            }
        }
        self.shared.set_state(TtsState::Disconnected);
        false
    }

    async fn drop_connection(&self, conn: &mut Option<Connection>) {
        if let Some(mut connection) = conn.take() {
            let _ = connection.sink.close().await;
            connection.listener.abort();
        }
        self.shared.connected.store(false, Ordering::Release);
        self.shared.task_started.store(false, Ordering::Release);
        if self.shared.state() != TtsState::Closed {
            self.shared.set_state(TtsState::Disconnected);
        }
    }
}

/// Consumes provider events for the life of one connection; does not stop at
/// segment boundaries
async fn audio_listener(shared: Arc<TtsShared>, mut events: mpsc::Receiver<ProviderEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            ProviderEvent::Audio(bytes) => {
                if shared.is_interrupted.load(Ordering::Acquire) {
                    continue;
                }
                let audio = BASE64.encode(&bytes);
                if !shared.tracker.track_audio_chunk(&audio).await {
                    // Quota: stop forwarding and let the limit events reach
                    // the client through their own topics
                    shared.is_interrupted.store(true, Ordering::Release);
                    continue;
                }
                shared
                    .dispatcher
                    .broadcast(&shared.session_id, SessionMessage::OutboundAudio { audio });
            }
            ProviderEvent::SegmentEnd => {
                shared.task_started.store(false, Ordering::Release);
                let state = shared.state();
                if matches!(
                    state,
                    TtsState::Generating | TtsState::Flushing | TtsState::Interrupted
                ) {
                    shared.set_state(TtsState::Idle);
                }
            }
            ProviderEvent::Error(e) => {
                warn!(session_id = %shared.session_id, "TTS stream error: {}", e);
            }
            ProviderEvent::Closed => break,
            _ => {}
        }
    }
    shared.connected.store(false, Ordering::Release);
    if shared.state() != TtsState::Closed {
        shared.set_state(TtsState::Disconnected);
    }
}

fn cancel_timer(timer: &mut Option<JoinHandle<()>>) {
    if let Some(handle) = timer.take() {
        handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AbuseConfig, AudioConfig, VoiceLimitsConfig};
    use crate::providers::{ProviderError, ProviderHandle};
    use crate::usage::store::SqliteUsageStore;
    use crate::usage::UsageStore;
    use tokio::sync::Mutex;

    /// Provider whose sink records frames and emits a fixed audio chunk per
    /// text segment
    struct ScriptedTts {
        sent: Arc<Mutex<Vec<String>>>,
        chunk_bytes: usize,
    }

    struct ScriptedSink {
        sent: Arc<Mutex<Vec<String>>>,
        events: mpsc::Sender<ProviderEvent>,
        chunk_bytes: usize,
    }

    #[async_trait::async_trait]
    impl ProviderSink for ScriptedSink {
        async fn send_text(&mut self, text: &str) -> Result<(), ProviderError> {
            self.sent.lock().await.push(format!("text:{}", text));
            let _ = self
                .events
                .send(ProviderEvent::Audio(vec![0u8; self.chunk_bytes]))
                .await;
            Ok(())
        }
        async fn send_audio(&mut self, _frame: &[u8]) -> Result<(), ProviderError> {
            unreachable!()
        }
        async fn start_segment(&mut self) -> Result<(), ProviderError> {
            self.sent.lock().await.push("start".to_string());
            Ok(())
        }
        async fn finish_segment(&mut self) -> Result<(), ProviderError> {
            self.sent.lock().await.push("finish".to_string());
            let _ = self.events.send(ProviderEvent::SegmentEnd).await;
            Ok(())
        }
        async fn close(&mut self) -> Result<(), ProviderError> {
            Ok(())
        }
    }

    #[async_trait::async_trait]
    impl StreamingProvider for ScriptedTts {
        async fn open(&self) -> Result<ProviderHandle, ProviderError> {
            let (tx, rx) = mpsc::channel(64);
            Ok(ProviderHandle {
                sink: Box::new(ScriptedSink {
                    sent: self.sent.clone(),
                    events: tx,
                    chunk_bytes: self.chunk_bytes,
                }),
                events: rx,
            })
        }
    }

    struct Harness {
        dispatcher: Arc<Dispatcher>,
        client: TtsClient,
        sent: Arc<Mutex<Vec<String>>>,
        tracker: Arc<UsageTracker>,
    }

    async fn harness(chunk_bytes: usize, session_minutes: u64) -> Harness {
        let dispatcher = Arc::new(Dispatcher::new());
        let store: Arc<dyn UsageStore> = Arc::new(SqliteUsageStore::in_memory().unwrap());
        let tracker = UsageTracker::new(
            "s1",
            "u1",
            dispatcher.clone(),
            store,
            VoiceLimitsConfig {
                session_minutes,
                ..VoiceLimitsConfig::default()
            },
            AudioConfig::default(),
            AbuseConfig {
                enabled: false,
                ..AbuseConfig::default()
            },
        );
        tracker.initialize().await;

        let sent = Arc::new(Mutex::new(Vec::new()));
        let provider = Arc::new(ScriptedTts {
            sent: sent.clone(),
            chunk_bytes,
        });
        let client = TtsClient::new(
            "s1",
            dispatcher.clone(),
            provider,
            tracker.clone(),
            TtsConfig {
                min_buffer_words: 8,
                max_buffer_ms: 60_000,
                ..TtsConfig::default()
            },
        );
        Harness {
            dispatcher,
            client,
            sent,
            tracker,
        }
    }

    async fn start(h: &Harness) -> tokio::task::JoinHandle<()> {
        let task = tokio::spawn(h.client.clone().run());
        while h.dispatcher.subscriber_count("s1", MessageType::LlmToken) == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        task
    }

    fn token(dispatcher: &Dispatcher, text: &str) {
        dispatcher.broadcast(
            "s1",
            SessionMessage::LlmToken {
                text: text.to_string(),
            },
        );
    }

    fn close(dispatcher: &Dispatcher) {
        dispatcher.broadcast(
            "s1",
            SessionMessage::SessionClose {
                reason: "test".to_string(),
            },
        );
    }

    #[tokio::test]
    async fn test_sentence_end_flush_produces_audio_and_accounting() {
        let h = harness(4096, 10).await;
        let mut audio = h.dispatcher.subscribe("s1", MessageType::OutboundAudio);
        let task = start(&h).await;

        token(&h.dispatcher, "Hi");
        token(&h.dispatcher, " there");
        token(&h.dispatcher, ".");

        let event = audio.recv().await.unwrap();
        match event.message {
            SessionMessage::OutboundAudio { audio } => {
                assert_eq!(BASE64.decode(audio).unwrap().len(), 4096);
            }
            other => panic!("unexpected message: {:?}", other),
        }
        let sent = h.sent.lock().await.clone();
        assert_eq!(sent, vec!["start".to_string(), "text:Hi there.".to_string()]);
        assert_eq!(h.client.state(), TtsState::Generating);

        // 4096 bytes / 32 bytes-per-ms
        // counted once the tracker sees the chunk
        for _ in 0..20 {
            if h.tracker.summary().await.session_duration_ms == 128 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert_eq!(h.tracker.summary().await.session_duration_ms, 128);

        close(&h.dispatcher);
        task.await.unwrap();
        assert_eq!(h.client.state(), TtsState::Closed);
    }

    #[tokio::test]
    async fn test_short_sentence_waits_for_more_text() {
        let h = harness(1024, 10).await;
        let task = start(&h).await;

        // Ends with '.', but under the 10-char floor
        token(&h.dispatcher, "Hi.");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(h.sent.lock().await.is_empty());

        close(&h.dispatcher);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_word_count_trigger() {
        let h = harness(1024, 10).await;
        let task = start(&h).await;

        token(&h.dispatcher, "one two three four five six seven eight");
        for _ in 0..50 {
            if !h.sent.lock().await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        let sent = h.sent.lock().await.clone();
        assert_eq!(sent[0], "start");
        assert!(sent[1].starts_with("text:one two"));

        close(&h.dispatcher);
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timer_flushes_partial_buffer() {
        let h = harness(1024, 10).await;
        let task = start(&h).await;

        token(&h.dispatcher, "hello out");
        // Under every size trigger; only the timer can flush it
        tokio::time::sleep(Duration::from_millis(h.client.config.max_buffer_ms + 100)).await;
        for _ in 0..100 {
            if h.sent.lock().await.len() >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let sent = h.sent.lock().await.clone();
        assert_eq!(sent, vec!["start".to_string(), "text:hello out".to_string()]);

        close(&h.dispatcher);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_barge_in_interrupts_and_clears() {
        let h = harness(4096, 10).await;
        let mut audio = h.dispatcher.subscribe("s1", MessageType::OutboundAudio);
        let mut clear = h.dispatcher.subscribe("s1", MessageType::ClearBuffer);
        let task = start(&h).await;

        token(&h.dispatcher, "Hi there, how are you today friend.");
        // First segment flushed; audio flows
        assert!(audio.recv().await.is_some());

        h.dispatcher.broadcast(
            "s1",
            SessionMessage::FinalTranscript {
                text: "stop".to_string(),
            },
        );
        let event = clear.recv().await.unwrap();
        match event.message {
            SessionMessage::ClearBuffer { source } => assert_eq!(source, "tts_interrupt"),
            other => panic!("unexpected message: {:?}", other),
        }
        for _ in 0..50 {
            if h.client.state() == TtsState::Interrupted
                || h.client.state() == TtsState::Idle
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        let finish_sent = h.sent.lock().await.iter().any(|s| s == "finish");
        assert!(finish_sent, "barge-in must finish the provider task");

        // Buffered text from the aborted turn never reaches the provider
        token(&h.dispatcher, " tail of old answer");
        tokio::time::sleep(Duration::from_millis(20)).await;
        let sends = h
            .sent
            .lock()
            .await
            .iter()
            .filter(|s| s.starts_with("text:"))
            .count();
        assert_eq!(sends, 1);

        close(&h.dispatcher);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_quota_denial_suppresses_audio() {
        // 1-minute session limit; each 4 KiB chunk is 128 ms
        let h = harness(4096, 1).await;
        let mut audio = h.dispatcher.subscribe("s1", MessageType::OutboundAudio);
        let task = start(&h).await;

        // Burn the quota directly through the tracker
        let blob = BASE64.encode(vec![0u8; 60_000 * 32]);
        assert!(!h.tracker.track_audio_chunk(&blob).await);

        token(&h.dispatcher, "This is a sentence that would speak.");
        tokio::time::sleep(Duration::from_millis(30)).await;
        // Voice is disabled: no segment is sent, no audio is forwarded
        assert!(h.sent.lock().await.is_empty());
        assert!(audio.try_recv().is_none());

        close(&h.dispatcher);
        task.await.unwrap();
    }
}
