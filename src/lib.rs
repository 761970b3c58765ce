//! Voice Agent - Real-time Conversational Voice Pipeline
//!
//! A per-session streaming pipeline orchestrator that couples a client
//! WebSocket to streaming STT, LLM, and TTS providers through an in-process
//! publish/subscribe dispatcher:
//! - Topic-per-session dispatcher with bounded drop-oldest fan-out
//! - Smart-buffered streaming TTS with barge-in
//! - Voice-usage metering with session/daily/monthly quotas and abuse
//!   detection
//! - Thin REST surface for chat history and usage administration
//!
//! # Example
//!
//! ```ignore
//! use voice_agent::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load()?;
//!     voice_agent::server::start(config).await
//! }
//! ```

// Core modules (order matters for cross-module dependencies)
pub mod types;
pub mod config;
pub mod dispatcher;
pub mod usage; // Must come before the pipeline components that meter audio
pub mod providers;
pub mod llm;
pub mod stt;
pub mod tts;
pub mod history;
pub mod prompts;
pub mod server;
pub mod cli;

// Re-export commonly used types for convenience
pub use config::Config;

pub use dispatcher::{Dispatcher, MessageType, SessionMessage};

pub use llm::{ChatBackend, LlmClient, LlmDriver};

pub use usage::{SqliteUsageStore, UsageStore, UsageTracker};

pub use server::{start as start_server, ServerState};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Get the library info
pub fn info() -> String {
    format!("{} v{} - Real-time Voice Agent", NAME, VERSION)
}
