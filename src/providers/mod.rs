//! Streaming provider contracts
//!
//! STT and TTS vendors are consumed through one small seam: a provider
//! `open()`s into a handle carrying a command sink and a stream of typed
//! events. Each connection is driven by a single task that owns the socket;
//! the sink sends it commands and the events channel is its only output, so
//! there is no cross-task callback plumbing.

pub mod stt_ws;
pub mod tts_ws;

use async_trait::async_trait;
use tokio::sync::mpsc;

/// Typed error with the transient/fatal split the reconnect logic branches on
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// Worth retrying: socket drop, ping timeout, transient handshake failure
    #[error("transient provider error: {0}")]
    Transient(String),
    /// Not worth retrying: bad credentials, protocol violation
    #[error("fatal provider error: {0}")]
    Fatal(String),
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Transient(_))
    }
}

/// Events emitted by a provider connection
#[derive(Debug)]
pub enum ProviderEvent {
    /// Raw audio chunk from a TTS provider
    Audio(Vec<u8>),
    /// Partial transcript from an STT provider
    Interim(String),
    /// Finalized transcript from an STT provider
    Final(String),
    /// The provider finished the current synthesis segment
    SegmentEnd,
    /// A recoverable or terminal error; `Closed` follows terminal ones
    Error(ProviderError),
    /// The connection is gone; no further events will arrive
    Closed,
}

/// Command side of one provider connection
#[async_trait]
pub trait ProviderSink: Send {
    /// Send a text payload (TTS synthesis input)
    async fn send_text(&mut self, text: &str) -> Result<(), ProviderError>;

    /// Send a binary audio frame (STT input)
    async fn send_audio(&mut self, frame: &[u8]) -> Result<(), ProviderError>;

    /// Begin a synthesis segment (providers with task framing)
    async fn start_segment(&mut self) -> Result<(), ProviderError>;

    /// End the current segment, letting buffered audio drain
    async fn finish_segment(&mut self) -> Result<(), ProviderError>;

    /// Graceful shutdown of the connection
    async fn close(&mut self) -> Result<(), ProviderError>;
}

/// One open provider connection: command sink plus event stream
pub struct ProviderHandle {
    pub sink: Box<dyn ProviderSink>,
    pub events: mpsc::Receiver<ProviderEvent>,
}

/// A streaming speech provider that can be opened into live connections
#[async_trait]
pub trait StreamingProvider: Send + Sync {
    async fn open(&self) -> Result<ProviderHandle, ProviderError>;
}

/// Capacity of each connection's event channel; the consumer loop is
/// expected to keep up, this only absorbs scheduling jitter
pub(crate) const EVENT_CHANNEL_CAPACITY: usize = 64;

/// How long a provider read may be silent before a ping is sent
pub(crate) const READ_IDLE_TIMEOUT_SECS: u64 = 30;

/// Missed pings tolerated before the connection is declared dead
pub(crate) const MAX_MISSED_PINGS: u32 = 2;
