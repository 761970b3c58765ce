//! Shared types used across modules
//!
//! This module contains types that are used by multiple modules
//! to avoid circular dependencies.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single message in a conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// Role of a message sender
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

impl Role {
    /// Convert to OpenAI-style role string
    pub fn to_openai_string(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
            Role::Tool => "tool",
        }
    }

    /// Parse from OpenAI-style role string
    pub fn from_openai_string(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            "system" => Some(Role::System),
            "tool" => Some(Role::Tool),
            _ => None,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_openai_string())
    }
}

/// Where a session's inbound frames come from, and therefore how they are framed
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionSource {
    /// JSON text frames carrying pre-transcribed text
    Device,
    /// Raw PCM16 mono 16 kHz binary frames
    Phone,
    /// Auto-detected per frame (text or binary)
    Web,
}

impl SessionSource {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "device" => Some(SessionSource::Device),
            "phone" => Some(SessionSource::Phone),
            "web" => Some(SessionSource::Web),
            _ => None,
        }
    }

    /// Text-only sources never open an STT provider stream
    pub fn is_text_only(&self) -> bool {
        matches!(self, SessionSource::Device)
    }
}

impl std::fmt::Display for SessionSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionSource::Device => write!(f, "device"),
            SessionSource::Phone => write!(f, "phone"),
            SessionSource::Web => write!(f, "web"),
        }
    }
}

/// Supported conversation languages
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum Language {
    #[default]
    #[serde(rename = "en")]
    English,
    #[serde(rename = "french")]
    French,
    #[serde(rename = "zh-HK")]
    Cantonese,
    #[serde(rename = "zh-TW")]
    TraditionalChinese,
}

impl Language {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "en" => Some(Language::English),
            "french" => Some(Language::French),
            "zh-HK" => Some(Language::Cantonese),
            "zh-TW" => Some(Language::TraditionalChinese),
            _ => None,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Language::English => "en",
            Language::French => "french",
            Language::Cantonese => "zh-HK",
            Language::TraditionalChinese => "zh-TW",
        }
    }
}

/// Persona overlays selectable per session
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PersonaRole {
    LoyalBestFriend,
    CaringParent,
    Coach,
    FunnyFriend,
}

impl PersonaRole {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "loyal_best_friend" => Some(PersonaRole::LoyalBestFriend),
            "caring_parent" => Some(PersonaRole::CaringParent),
            "coach" => Some(PersonaRole::Coach),
            "funny_friend" => Some(PersonaRole::FunnyFriend),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_round_trip() {
        for role in [Role::User, Role::Assistant, Role::System, Role::Tool] {
            let s = role.to_openai_string();
            assert_eq!(Role::from_openai_string(s), Some(role));
        }
    }

    #[test]
    fn test_session_source_parse() {
        assert_eq!(SessionSource::parse("phone"), Some(SessionSource::Phone));
        assert_eq!(SessionSource::parse("DEVICE"), Some(SessionSource::Device));
        assert_eq!(SessionSource::parse("carrier-pigeon"), None);
        assert!(SessionSource::Device.is_text_only());
        assert!(!SessionSource::Web.is_text_only());
    }

    #[test]
    fn test_language_parse() {
        assert_eq!(Language::parse("zh-HK"), Some(Language::Cantonese));
        assert_eq!(Language::parse("en"), Some(Language::English));
        assert_eq!(Language::parse("klingon"), None);
        assert_eq!(Language::Cantonese.code(), "zh-HK");
    }

    #[test]
    fn test_persona_role_parse() {
        assert_eq!(PersonaRole::parse("coach"), Some(PersonaRole::Coach));
        assert_eq!(PersonaRole::parse("villain"), None);
    }
}
