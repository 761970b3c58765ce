//! REST surface: chat, conversation CRUD, voice usage, voice management
//!
//! Thin layer over the shared LLM backend, history store, and usage store.
//! The realtime pipeline never calls into this module.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::sse::{Event as SseEvent, Sse},
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::convert::Infallible;
use tracing::{debug, warn};

use crate::history::HistoryStore;
use crate::llm::client::{ChatMessage, CompletionStream, StreamEvent};
use crate::prompts;
use crate::server::ServerState;
use crate::types::{Language, PersonaRole, Role};
use crate::usage::models::LimitKind;

// ============ Chat ============

#[derive(Debug, Deserialize)]
pub struct ChatApiRequest {
    #[serde(default)]
    pub session_id: Option<String>,
    pub user_id: String,
    pub input_text: String,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ChatApiResponse {
    pub reply: String,
    pub session_id: String,
    pub message_id: String,
}

struct PreparedChat {
    session_id: String,
    messages: Vec<ChatMessage>,
}

/// Resolve session, persist the user message, and assemble the model input
async fn prepare_chat(
    state: &ServerState,
    req: &ChatApiRequest,
) -> anyhow::Result<PreparedChat> {
    let language = req
        .language
        .as_deref()
        .and_then(Language::parse)
        .unwrap_or_default();
    let role = req.role.as_deref().and_then(PersonaRole::parse);
    let session_id = req
        .session_id
        .clone()
        .filter(|id| id.len() == 36)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    state
        .history
        .touch_session(&session_id, &req.user_id, language, role)
        .await?;

    let mut messages = vec![ChatMessage::system(prompts::compose(role, language))];
    for stored in state.history.conversation(&session_id).await? {
        let message = match stored.role {
            Role::User => ChatMessage::user(stored.content),
            Role::Assistant => ChatMessage::assistant(stored.content),
            _ => continue,
        };
        messages.push(message);
    }
    messages.push(ChatMessage::user(&req.input_text));

    state
        .history
        .append_message(&session_id, Role::User, &req.input_text)
        .await?;

    Ok(PreparedChat {
        session_id,
        messages,
    })
}

/// POST /api/v1/chat, non-streaming completion
pub async fn chat_handler(
    State(state): State<ServerState>,
    Json(req): Json<ChatApiRequest>,
) -> impl IntoResponse {
    if req.user_id.is_empty() || req.input_text.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "user_id and input_text are required"})),
        )
            .into_response();
    }

    let prepared = match prepare_chat(&state, &req).await {
        Ok(prepared) => prepared,
        Err(e) => {
            warn!("chat preparation failed: {}", e);
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": e.to_string()})),
            )
                .into_response();
        }
    };

    let reply = match state.backend.complete(prepared.messages).await {
        Ok(reply) => reply,
        Err(e) => {
            warn!("chat completion failed: {}", e);
            return (
                StatusCode::BAD_GATEWAY,
                Json(json!({"error": e.to_string()})),
            )
                .into_response();
        }
    };

    let message_id = state
        .history
        .append_message(&prepared.session_id, Role::Assistant, &reply)
        .await
        .unwrap_or_default();

    (
        StatusCode::OK,
        Json(ChatApiResponse {
            reply,
            session_id: prepared.session_id,
            message_id,
        }),
    )
        .into_response()
}

struct SseFlow {
    completion: CompletionStream,
    history: std::sync::Arc<HistoryStore>,
    session_id: String,
    collected: String,
    done: bool,
}

/// POST /api/v1/chat/stream: server-sent events, final event carries
/// `is_end: true` and the stored message id
pub async fn chat_stream_handler(
    State(state): State<ServerState>,
    Json(req): Json<ChatApiRequest>,
) -> impl IntoResponse {
    if req.user_id.is_empty() || req.input_text.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "user_id and input_text are required"})),
        )
            .into_response();
    }

    let prepared = match prepare_chat(&state, &req).await {
        Ok(prepared) => prepared,
        Err(e) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": e.to_string()})),
            )
                .into_response();
        }
    };

    let completion = match state.backend.stream_chat(prepared.messages, Vec::new()).await {
        Ok(completion) => completion,
        Err(e) => {
            warn!("stream open failed: {}", e);
            return (
                StatusCode::BAD_GATEWAY,
                Json(json!({"error": e.to_string()})),
            )
                .into_response();
        }
    };

    let flow = SseFlow {
        completion,
        history: state.history.clone(),
        session_id: prepared.session_id,
        collected: String::new(),
        done: false,
    };

    let stream = futures_util::stream::unfold(flow, |mut flow| async move {
        if flow.done {
            return None;
        }
        loop {
            match flow.completion.events.recv().await {
                Some(StreamEvent::Token(token)) => {
                    flow.collected.push_str(&token);
                    let event = SseEvent::default().data(
                        json!({
                            "reply": token,
                            "session_id": flow.session_id,
                            "is_end": false,
                        })
                        .to_string(),
                    );
                    return Some((Ok::<_, Infallible>(event), flow));
                }
                Some(StreamEvent::Error(e)) => {
                    flow.done = true;
                    debug!("stream errored: {}", e);
                    let event = SseEvent::default().data(
                        json!({
                            "reply": "",
                            "session_id": flow.session_id,
                            "is_end": true,
                            "error": e,
                        })
                        .to_string(),
                    );
                    return Some((Ok(event), flow));
                }
                Some(StreamEvent::Done { .. }) | None => {
                    flow.done = true;
                    let message_id = flow
                        .history
                        .append_message(&flow.session_id, Role::Assistant, &flow.collected)
                        .await
                        .unwrap_or_default();
                    let event = SseEvent::default().data(
                        json!({
                            "reply": "",
                            "session_id": flow.session_id,
                            "is_end": true,
                            "message_id": message_id,
                        })
                        .to_string(),
                    );
                    return Some((Ok(event), flow));
                }
                Some(_) => continue,
            }
        }
    });

    Sse::new(stream).into_response()
}

// ============ Conversation CRUD ============

/// GET /api/v1/conversation/{session_id}
pub async fn conversation_handler(
    State(state): State<ServerState>,
    Path(session_id): Path<String>,
) -> impl IntoResponse {
    match state.history.conversation(&session_id).await {
        Ok(messages) => (
            StatusCode::OK,
            Json(json!({"session_id": session_id, "messages": messages})),
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": e.to_string()})),
        )
            .into_response(),
    }
}

/// GET /api/v1/sessions/{user_id}
pub async fn sessions_handler(
    State(state): State<ServerState>,
    Path(user_id): Path<String>,
) -> impl IntoResponse {
    match state.history.list_sessions(&user_id).await {
        Ok(sessions) => (
            StatusCode::OK,
            Json(json!({"user_id": user_id, "sessions": sessions})),
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": e.to_string()})),
        )
            .into_response(),
    }
}

/// DELETE /api/v1/session/{session_id}
pub async fn delete_session_handler(
    State(state): State<ServerState>,
    Path(session_id): Path<String>,
) -> impl IntoResponse {
    match state.history.delete_session(&session_id).await {
        Ok(true) => (StatusCode::OK, Json(json!({"deleted": true}))).into_response(),
        Ok(false) => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "session not found"})),
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": e.to_string()})),
        )
            .into_response(),
    }
}

// ============ Voice usage ============

#[derive(Debug, Serialize)]
struct PeriodUsage {
    used_ms: u64,
    limit_ms: u64,
    remaining_ms: u64,
}

impl PeriodUsage {
    fn new(used_ms: u64, limit_minutes: u64) -> Self {
        let limit_ms = limit_minutes * 60 * 1000;
        Self {
            used_ms,
            limit_ms,
            remaining_ms: limit_ms.saturating_sub(used_ms),
        }
    }
}

#[derive(Debug, Serialize)]
struct VoiceUsageResponse {
    user_id: String,
    voice_enabled: bool,
    limit_reached: Option<LimitKind>,
    daily: PeriodUsage,
    monthly: PeriodUsage,
}

/// GET /api/v1/voice-usage/{user_id}
pub async fn voice_usage_handler(
    State(state): State<ServerState>,
    Path(user_id): Path<String>,
) -> impl IntoResponse {
    let summary = match state.usage_store.usage_summary(&user_id, "").await {
        Ok(summary) => summary,
        Err(e) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": e.to_string()})),
            )
                .into_response();
        }
    };
    let limits = state.config.limits;
    (
        StatusCode::OK,
        Json(VoiceUsageResponse {
            user_id,
            voice_enabled: summary.daily_duration_ms < limits.daily_minutes * 60 * 1000
                && summary.monthly_duration_ms < limits.monthly_minutes * 60 * 1000,
            limit_reached: summary.limit_reached,
            daily: PeriodUsage::new(summary.daily_duration_ms, limits.daily_minutes),
            monthly: PeriodUsage::new(summary.monthly_duration_ms, limits.monthly_minutes),
        }),
    )
        .into_response()
}

/// GET /api/v1/voice-usage/{user_id}/history
pub async fn voice_usage_history_handler(
    State(state): State<ServerState>,
    Path(user_id): Path<String>,
) -> impl IntoResponse {
    let daily = state.usage_store.daily_history(&user_id, 31).await;
    let monthly = state.usage_store.monthly_history(&user_id, 12).await;
    let sessions = state.usage_store.list_user_sessions(&user_id, 50).await;
    match (daily, monthly, sessions) {
        (Ok(daily), Ok(monthly), Ok(sessions)) => (
            StatusCode::OK,
            Json(json!({
                "user_id": user_id,
                "daily": daily,
                "monthly": monthly,
                "sessions": sessions,
            })),
        )
            .into_response(),
        (daily, monthly, sessions) => {
            let error = [
                daily.err().map(|e| e.to_string()),
                monthly.err().map(|e| e.to_string()),
                sessions.err().map(|e| e.to_string()),
            ]
            .into_iter()
            .flatten()
            .next()
            .unwrap_or_default();
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": error})),
            )
                .into_response()
        }
    }
}

// ============ Voice management (admin) ============

/// GET /api/v1/voice/management/all
pub async fn management_all_handler(State(state): State<ServerState>) -> impl IntoResponse {
    match state.usage_store.all_user_overviews().await {
        Ok(users) => (StatusCode::OK, Json(json!({"users": users}))).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": e.to_string()})),
        )
            .into_response(),
    }
}

/// GET /api/v1/voice/management/{user_id}
pub async fn management_user_handler(
    State(state): State<ServerState>,
    Path(user_id): Path<String>,
) -> impl IntoResponse {
    let summary = state.usage_store.usage_summary(&user_id, "").await;
    let sessions = state.usage_store.list_user_sessions(&user_id, 20).await;
    match (summary, sessions) {
        (Ok(summary), Ok(sessions)) => (
            StatusCode::OK,
            Json(json!({
                "user_id": user_id,
                "daily_duration_ms": summary.daily_duration_ms,
                "monthly_duration_ms": summary.monthly_duration_ms,
                "sessions": sessions,
            })),
        )
            .into_response(),
        (summary, sessions) => {
            let error = [
                summary.err().map(|e| e.to_string()),
                sessions.err().map(|e| e.to_string()),
            ]
            .into_iter()
            .flatten()
            .next()
            .unwrap_or_default();
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": error})),
            )
                .into_response()
        }
    }
}

/// POST /api/v1/voice/management/{user_id}/reset
pub async fn management_reset_handler(
    State(state): State<ServerState>,
    Path(user_id): Path<String>,
) -> impl IntoResponse {
    match state.usage_store.reset_user(&user_id).await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({"user_id": user_id, "status": "reset"})),
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": e.to_string()})),
        )
            .into_response(),
    }
}
