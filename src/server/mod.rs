//! Server module: axum router, shared state, and the session WebSocket entry
//!
//! Process bootstrap happens here: the dispatcher, stores, and LLM backend
//! are constructed once and injected into every session and HTTP handler.

pub mod http;
pub mod session;
pub mod socket;

use anyhow::{Context, Result};
use axum::{
    extract::ws::{CloseFrame, Message as WsFrame, WebSocketUpgrade},
    extract::{Path, Query, State},
    response::Response,
    routing::{delete, get, post},
    Router,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::Config;
use crate::dispatcher::Dispatcher;
use crate::history::HistoryStore;
use crate::llm::client::{ChatBackend, LlmClient};
use crate::server::session::{SessionParams, SessionSupervisor};
use crate::types::{Language, PersonaRole, SessionSource};
use crate::usage::{SqliteUsageStore, UsageStore};

/// Close code for a connection without a user id
const CLOSE_MISSING_USER_ID: u16 = 4001;

/// Shared server state
#[derive(Clone)]
pub struct ServerState {
    pub config: Arc<Config>,
    pub dispatcher: Arc<Dispatcher>,
    pub usage_store: Arc<dyn UsageStore>,
    pub history: Arc<HistoryStore>,
    pub backend: Arc<dyn ChatBackend>,
}

impl ServerState {
    /// Bootstrap all shared resources from configuration
    pub async fn from_config(config: Config) -> Result<Self> {
        let db_path = config.db_path()?;
        let usage_store: Arc<dyn UsageStore> = Arc::new(
            SqliteUsageStore::new(&db_path)
                .await
                .context("Failed to open usage store")?,
        );
        let history = Arc::new(
            HistoryStore::new(db_path.with_extension("history.db"))
                .await
                .context("Failed to open history store")?,
        );
        let backend: Arc<dyn ChatBackend> = Arc::new(LlmClient::new(config.llm.clone()));
        let dispatcher = Arc::new(Dispatcher::with_capacity(
            config.server.dispatcher_queue_capacity,
        ));
        Ok(Self {
            config: Arc::new(config),
            dispatcher,
            usage_store,
            history,
            backend,
        })
    }

    pub fn supervisor(&self) -> SessionSupervisor {
        SessionSupervisor::new(
            self.config.clone(),
            self.dispatcher.clone(),
            self.usage_store.clone(),
            self.backend.clone(),
        )
    }
}

/// Build the application router
pub fn router(state: ServerState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/ws/{source}", get(ws_handler))
        .route("/api/v1/chat", post(http::chat_handler))
        .route("/api/v1/chat/stream", post(http::chat_stream_handler))
        .route(
            "/api/v1/conversation/{session_id}",
            get(http::conversation_handler),
        )
        .route("/api/v1/sessions/{user_id}", get(http::sessions_handler))
        .route(
            "/api/v1/session/{session_id}",
            delete(http::delete_session_handler),
        )
        .route(
            "/api/v1/voice-usage/{user_id}",
            get(http::voice_usage_handler),
        )
        .route(
            "/api/v1/voice-usage/{user_id}/history",
            get(http::voice_usage_history_handler),
        )
        .route(
            "/api/v1/voice/management/all",
            get(http::management_all_handler),
        )
        .route(
            "/api/v1/voice/management/{user_id}",
            get(http::management_user_handler),
        )
        .route(
            "/api/v1/voice/management/{user_id}/reset",
            post(http::management_reset_handler),
        )
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// GET /ws/{source}?user_id=…&session_id=…&language=…&role=…
async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(source): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    State(state): State<ServerState>,
) -> Response {
    let source = SessionSource::parse(&source).unwrap_or(SessionSource::Web);
    let user_id = query.get("user_id").cloned().unwrap_or_default();
    let session_id = query.get("session_id").cloned();
    let language = query
        .get("language")
        .and_then(|l| Language::parse(l))
        .unwrap_or_default();
    let role = query.get("role").and_then(|r| PersonaRole::parse(r));

    ws.on_upgrade(move |mut socket| async move {
        if user_id.is_empty() {
            warn!("connection rejected: missing user_id");
            let _ = socket
                .send(WsFrame::Close(Some(CloseFrame {
                    code: CLOSE_MISSING_USER_ID,
                    reason: "user_id is required".into(),
                })))
                .await;
            return;
        }
        let params = SessionParams::resolve(user_id, session_id, source, language, role);
        state.supervisor().run_session(socket, params).await;
    })
}

/// Start the server
pub async fn start(config: Config) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("Invalid server address")?;
    let state = ServerState::from_config(config).await?;
    let dispatcher = state.dispatcher.clone();

    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
            dispatcher.disconnect();
        })
        .await
        .context("Server error")?;
    Ok(())
}
