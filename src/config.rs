//! Configuration management
//!
//! Layered configuration: TOML file (optional) with serde field defaults,
//! then environment overrides for the deployment-facing knobs (voice limits,
//! abuse thresholds, provider credentials).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// HTTP/WebSocket server settings
    #[serde(default)]
    pub server: ServerConfig,
    /// LLM provider settings
    #[serde(default)]
    pub llm: LlmConfig,
    /// STT provider settings
    #[serde(default)]
    pub stt: SttConfig,
    /// TTS provider settings
    #[serde(default)]
    pub tts: TtsConfig,
    /// PCM accounting parameters
    #[serde(default)]
    pub audio: AudioConfig,
    /// Voice usage quotas
    #[serde(default)]
    pub limits: VoiceLimitsConfig,
    /// Abuse detection thresholds
    #[serde(default)]
    pub abuse: AbuseConfig,
    /// Persistence settings
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Bounded capacity of each dispatcher subscription queue
    #[serde(default = "default_queue_capacity")]
    pub dispatcher_queue_capacity: usize,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_queue_capacity() -> usize {
    256
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            dispatcher_queue_capacity: default_queue_capacity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// OpenAI-compatible chat completions base URL
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,
    /// API key; normally supplied via `LLM_API_KEY`
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Bound on a single tool execution
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
}

fn default_llm_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_llm_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_max_tokens() -> u32 {
    1024
}

fn default_temperature() -> f32 {
    0.7
}

fn default_tool_timeout_secs() -> u64 {
    15
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: default_llm_base_url(),
            api_key: String::new(),
            model: default_llm_model(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            tool_timeout_secs: default_tool_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SttConfig {
    /// Streaming transcription WebSocket URL
    #[serde(default = "default_stt_url")]
    pub url: String,
    /// API key; normally supplied via `STT_API_KEY`
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_encoding")]
    pub encoding: String,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    #[serde(default = "default_channels")]
    pub channels: u16,
    /// Consecutive reconnect failures tolerated before the session is torn down
    #[serde(default = "default_max_reconnect_failures")]
    pub max_reconnect_failures: u32,
}

fn default_stt_url() -> String {
    "wss://api.deepgram.com/v1/listen".to_string()
}

fn default_encoding() -> String {
    "linear16".to_string()
}

fn default_sample_rate() -> u32 {
    16_000
}

fn default_channels() -> u16 {
    1
}

fn default_max_reconnect_failures() -> u32 {
    5
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            url: default_stt_url(),
            api_key: String::new(),
            encoding: default_encoding(),
            sample_rate: default_sample_rate(),
            channels: default_channels(),
            max_reconnect_failures: default_max_reconnect_failures(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsConfig {
    /// Streaming synthesis WebSocket URL
    #[serde(default = "default_tts_url")]
    pub url: String,
    /// API key; normally supplied via `TTS_API_KEY`
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_tts_model")]
    pub model: String,
    /// Default voice; overridden per language at session start
    #[serde(default = "default_voice_id")]
    pub voice_id: String,
    /// Minimum buffered word count that triggers a flush
    #[serde(default = "default_min_buffer_words")]
    pub min_buffer_words: usize,
    /// Idle time after which a non-empty buffer is flushed anyway
    #[serde(default = "default_max_buffer_ms")]
    pub max_buffer_ms: u64,
    /// Hard cap on buffered text; beyond this a flush is forced
    #[serde(default = "default_max_buffer_bytes")]
    pub max_buffer_bytes: usize,
    #[serde(default = "default_max_connect_attempts")]
    pub max_connect_attempts: u32,
}

fn default_tts_url() -> String {
    "wss://api.minimax.io/ws/v1/t2a_v2".to_string()
}

fn default_tts_model() -> String {
    "speech-2.6-hd".to_string()
}

fn default_voice_id() -> String {
    "english_expressive_narrator".to_string()
}

fn default_min_buffer_words() -> usize {
    8
}

fn default_max_buffer_ms() -> u64 {
    2_500
}

fn default_max_buffer_bytes() -> usize {
    8 * 1024
}

fn default_max_connect_attempts() -> u32 {
    3
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            url: default_tts_url(),
            api_key: String::new(),
            model: default_tts_model(),
            voice_id: default_voice_id(),
            min_buffer_words: default_min_buffer_words(),
            max_buffer_ms: default_max_buffer_ms(),
            max_buffer_bytes: default_max_buffer_bytes(),
            max_connect_attempts: default_max_connect_attempts(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AudioConfig {
    /// PCM16 mono 16 kHz: (16000 * 1 * 16 / 8) / 1000 = 32 bytes per ms
    #[serde(default = "default_bytes_per_ms")]
    pub bytes_per_ms: u64,
    /// Non-empty chunks account for at least this much
    #[serde(default = "default_min_chunk_ms")]
    pub min_chunk_ms: u64,
}

fn default_bytes_per_ms() -> u64 {
    32
}

fn default_min_chunk_ms() -> u64 {
    1
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            bytes_per_ms: default_bytes_per_ms(),
            min_chunk_ms: default_min_chunk_ms(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct VoiceLimitsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_session_minutes")]
    pub session_minutes: u64,
    #[serde(default = "default_daily_minutes")]
    pub daily_minutes: u64,
    #[serde(default = "default_monthly_minutes")]
    pub monthly_minutes: u64,
    /// Fraction of a limit at which a one-shot warning is emitted
    #[serde(default = "default_warning_ratio")]
    pub warning_ratio: f64,
}

fn default_true() -> bool {
    true
}

fn default_session_minutes() -> u64 {
    10
}

fn default_daily_minutes() -> u64 {
    50
}

fn default_monthly_minutes() -> u64 {
    200
}

fn default_warning_ratio() -> f64 {
    0.8
}

impl Default for VoiceLimitsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            session_minutes: default_session_minutes(),
            daily_minutes: default_daily_minutes(),
            monthly_minutes: default_monthly_minutes(),
            warning_ratio: default_warning_ratio(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AbuseConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_continuous_threshold_minutes")]
    pub continuous_threshold_minutes: u64,
    /// Gap under which consecutive chunks count as continuous use
    #[serde(default = "default_continuous_gap_secs")]
    pub continuous_gap_secs: u64,
    #[serde(default = "default_reconnect_threshold")]
    pub reconnect_threshold: u64,
    #[serde(default = "default_reconnect_window_seconds")]
    pub reconnect_window_seconds: u64,
}

fn default_continuous_threshold_minutes() -> u64 {
    30
}

fn default_continuous_gap_secs() -> u64 {
    5
}

fn default_reconnect_threshold() -> u64 {
    10
}

fn default_reconnect_window_seconds() -> u64 {
    300
}

impl Default for AbuseConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            continuous_threshold_minutes: default_continuous_threshold_minutes(),
            continuous_gap_secs: default_continuous_gap_secs(),
            reconnect_threshold: default_reconnect_threshold(),
            reconnect_window_seconds: default_reconnect_window_seconds(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite database path; resolved under the platform data dir when unset
    #[serde(default)]
    pub db_path: Option<PathBuf>,
    /// Session rows older than this are archived by the maintenance sweep
    #[serde(default = "default_archive_after_days")]
    pub archive_after_days: u32,
}

fn default_archive_after_days() -> u32 {
    90
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            archive_after_days: default_archive_after_days(),
        }
    }
}

impl Config {
    /// Default config file location
    pub fn default_path() -> Result<PathBuf> {
        let dirs = directories::ProjectDirs::from("", "", "voice-agent")
            .context("Could not determine config directory")?;
        Ok(dirs.config_dir().join("config.toml"))
    }

    /// Default database location
    pub fn default_db_path() -> Result<PathBuf> {
        let dirs = directories::ProjectDirs::from("", "", "voice-agent")
            .context("Could not determine data directory")?;
        Ok(dirs.data_dir().join("voice-agent.db"))
    }

    /// Load from the default path (missing file yields defaults), then apply
    /// environment overrides
    pub fn load() -> Result<Self> {
        let path = Self::default_path()?;
        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config at {}", path.display()))?;
            toml::from_str(&raw)
                .with_context(|| format!("Failed to parse config at {}", path.display()))?
        } else {
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Resolve the database path, falling back to the platform data dir
    pub fn db_path(&self) -> Result<PathBuf> {
        match &self.storage.db_path {
            Some(path) => Ok(path.clone()),
            None => Self::default_db_path(),
        }
    }

    /// Environment variables win over the file for the deployment knobs
    pub fn apply_env_overrides(&mut self) {
        if let Some(v) = env_parse::<u64>("VOICE_LIMIT_SESSION_MINUTES") {
            self.limits.session_minutes = v;
        }
        if let Some(v) = env_parse::<u64>("VOICE_LIMIT_DAILY_MINUTES") {
            self.limits.daily_minutes = v;
        }
        if let Some(v) = env_parse::<u64>("VOICE_LIMIT_MONTHLY_MINUTES") {
            self.limits.monthly_minutes = v;
        }
        if let Some(v) = env_bool("VOICE_USAGE_ENABLED") {
            self.limits.enabled = v;
        }
        if let Some(v) = env_bool("VOICE_ABUSE_DETECTION_ENABLED") {
            self.abuse.enabled = v;
        }
        if let Some(v) = env_parse::<u64>("VOICE_ABUSE_CONTINUOUS_THRESHOLD_MINUTES") {
            self.abuse.continuous_threshold_minutes = v;
        }
        if let Some(v) = env_parse::<u64>("VOICE_ABUSE_RECONNECT_THRESHOLD") {
            self.abuse.reconnect_threshold = v;
        }
        if let Some(v) = env_parse::<u64>("VOICE_ABUSE_RECONNECT_WINDOW_SECONDS") {
            self.abuse.reconnect_window_seconds = v;
        }
        if let Some(v) = env_parse::<u64>("AUDIO_BYTES_PER_MS") {
            self.audio.bytes_per_ms = v.max(1);
        }
        if let Ok(v) = std::env::var("LLM_API_KEY") {
            self.llm.api_key = v;
        }
        if let Ok(v) = std::env::var("LLM_BASE_URL") {
            self.llm.base_url = v;
        }
        if let Ok(v) = std::env::var("LLM_MODEL") {
            self.llm.model = v;
        }
        if let Ok(v) = std::env::var("STT_API_KEY") {
            self.stt.api_key = v;
        }
        if let Ok(v) = std::env::var("STT_URL") {
            self.stt.url = v;
        }
        if let Ok(v) = std::env::var("TTS_API_KEY") {
            self.tts.api_key = v;
        }
        if let Ok(v) = std::env::var("TTS_URL") {
            self.tts.url = v;
        }
        if let Ok(v) = std::env::var("TTS_VOICE_ID") {
            self.tts.voice_id = v;
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

fn env_bool(name: &str) -> Option<bool> {
    std::env::var(name)
        .ok()
        .map(|v| matches!(v.to_lowercase().as_str(), "true" | "1" | "yes"))
}
