//! Voice usage data model
//!
//! Row types for the usage collections plus the limit / abuse enums shared
//! with the dispatcher message set.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Which quota period a limit belongs to
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LimitKind {
    Session,
    Daily,
    Monthly,
}

impl LimitKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LimitKind::Session => "session",
            LimitKind::Daily => "daily",
            LimitKind::Monthly => "monthly",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "session" => Some(LimitKind::Session),
            "daily" => Some(LimitKind::Daily),
            "monthly" => Some(LimitKind::Monthly),
            _ => None,
        }
    }
}

impl std::fmt::Display for LimitKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Suspicious usage patterns flagged by the abuse detector
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AbuseEventType {
    ExcessiveContinuousUse,
    RapidReconnection,
    LongSessionNoBreaks,
}

impl AbuseEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AbuseEventType::ExcessiveContinuousUse => "excessive_continuous_use",
            AbuseEventType::RapidReconnection => "rapid_reconnection",
            AbuseEventType::LongSessionNoBreaks => "long_session_no_breaks",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "excessive_continuous_use" => Some(AbuseEventType::ExcessiveContinuousUse),
            "rapid_reconnection" => Some(AbuseEventType::RapidReconnection),
            "long_session_no_breaks" => Some(AbuseEventType::LongSessionNoBreaks),
            _ => None,
        }
    }
}

/// One voice session's usage record; exactly one active row per session id
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceUsageSession {
    pub id: String,
    pub session_id: String,
    pub user_id: String,
    pub duration_ms: u64,
    pub chunk_count: u64,
    pub started_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub voice_disabled: bool,
    pub limit_reached: Option<LimitKind>,
}

/// Per-user daily usage rollup, keyed uniquely by `(user_id, date)`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceUsageDaily {
    pub user_id: String,
    pub date: NaiveDate,
    pub duration_ms: u64,
    pub session_count: u64,
    pub chunk_count: u64,
    pub limit_reached_count: u64,
}

/// Per-user monthly usage rollup, keyed uniquely by `(user_id, year_month)`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceUsageMonthly {
    pub user_id: String,
    /// `YYYY-MM`
    pub year_month: String,
    pub duration_ms: u64,
    pub session_count: u64,
}

/// Append-only audit record of a limit being hit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceLimitEvent {
    pub id: String,
    pub user_id: String,
    pub session_id: String,
    pub limit_type: LimitKind,
    pub limit_minutes: f64,
    pub used_minutes: f64,
    pub created_at: DateTime<Utc>,
}

/// Append-only audit record of a suspicious usage pattern
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceAbuseEvent {
    pub id: String,
    pub user_id: String,
    pub session_id: String,
    pub event_type: AbuseEventType,
    pub details: serde_json::Value,
    pub reviewed: bool,
    pub created_at: DateTime<Utc>,
}

/// One logical snapshot of a user's usage across all three periods
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageSummary {
    pub user_id: String,
    pub session_id: String,
    pub session_duration_ms: u64,
    pub daily_duration_ms: u64,
    pub monthly_duration_ms: u64,
    pub voice_enabled: bool,
    pub limit_reached: Option<LimitKind>,
}

impl UsageSummary {
    /// Summary for a fresh user with no recorded usage
    pub fn empty(user_id: &str, session_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            session_id: session_id.to_string(),
            session_duration_ms: 0,
            daily_duration_ms: 0,
            monthly_duration_ms: 0,
            voice_enabled: true,
            limit_reached: None,
        }
    }
}

/// Format a UTC timestamp into the daily bucket key
pub fn day_key(at: DateTime<Utc>) -> NaiveDate {
    at.date_naive()
}

/// Format a UTC timestamp into the `YYYY-MM` monthly bucket key
pub fn month_key(at: DateTime<Utc>) -> String {
    at.format("%Y-%m").to_string()
}
