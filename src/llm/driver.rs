//! LLM driver: consumes finalized user turns, streams assistant tokens
//!
//! Owns the session's append-only conversation history (system prompt
//! first, then strictly alternating user/assistant, with tool records only
//! between an assistant message carrying tool calls and its successor).
//! A turn opens on `FINAL_TRANSCRIPT` and closes with `TURN_END`. A new
//! final transcript arriving mid-completion cancels the in-flight stream,
//! commits the partial assistant text, and starts the next turn.

use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::dispatcher::{Dispatcher, MessageType, SessionMessage, Subscription};
use crate::llm::client::{ChatBackend, ChatMessage, FunctionCall, StreamEvent, ToolCall};
use crate::llm::crisis::CrisisDetector;
use crate::llm::tools::ToolRegistry;

/// Tool-execution rounds allowed within one turn
const MAX_TOOL_ROUNDS: usize = 4;

pub struct LlmDriver {
    session_id: String,
    dispatcher: Arc<Dispatcher>,
    backend: Arc<dyn ChatBackend>,
    tools: Arc<ToolRegistry>,
    crisis: Option<Arc<CrisisDetector>>,
    history: Vec<ChatMessage>,
}

enum TurnOutcome {
    /// Turn ended normally (or on provider error)
    Complete,
    /// Barge-in: a new utterance preempted the stream
    Interrupted(String),
    /// The session is going away
    SessionClosed,
}

#[derive(Default)]
struct PendingToolCall {
    id: Option<String>,
    name: Option<String>,
    arguments: String,
}

impl LlmDriver {
    pub fn new(
        session_id: &str,
        dispatcher: Arc<Dispatcher>,
        backend: Arc<dyn ChatBackend>,
        tools: Arc<ToolRegistry>,
        crisis: Option<Arc<CrisisDetector>>,
        system_prompt: &str,
    ) -> Self {
        Self {
            session_id: session_id.to_string(),
            dispatcher,
            backend,
            tools,
            crisis,
            history: vec![ChatMessage::system(system_prompt)],
        }
    }

    /// Run until the session closes; returns the final history (tests use
    /// this to check the alternation invariant)
    pub async fn run(mut self) -> Vec<ChatMessage> {
        let mut finals = self
            .dispatcher
            .subscribe(&self.session_id, MessageType::FinalTranscript);
        let mut close = self
            .dispatcher
            .subscribe(&self.session_id, MessageType::SessionClose);

        let mut pending: Option<String> = None;
        loop {
            let utterance = match pending.take() {
                Some(text) => text,
                None => {
                    tokio::select! {
                        event = finals.recv() => {
                            match event.map(|e| e.message) {
                                Some(SessionMessage::FinalTranscript { text }) => text,
                                Some(_) => continue,
                                None => break,
                            }
                        }
                        _ = close.recv() => break,
                    }
                }
            };

            match self.run_turn(utterance, &mut finals, &mut close).await {
                TurnOutcome::Complete => {}
                TurnOutcome::Interrupted(text) => pending = Some(text),
                TurnOutcome::SessionClosed => break,
            }
        }

        debug!(session_id = %self.session_id, turns = self.history.len(), "LLM driver stopped");
        self.history
    }

    async fn run_turn(
        &mut self,
        utterance: String,
        finals: &mut Subscription,
        close: &mut Subscription,
    ) -> TurnOutcome {
        info!(session_id = %self.session_id, "turn opened: \"{}\"", truncate(&utterance, 60));
        self.history.push(ChatMessage::user(&utterance));
        self.spawn_crisis_check(&utterance);

        // All text spoken this turn, across tool rounds
        let mut turn_text = String::new();

        for round in 0..=MAX_TOOL_ROUNDS {
            let mut stream = match self
                .backend
                .stream_chat(self.history.clone(), self.tools.definitions())
                .await
            {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(session_id = %self.session_id, "completion open failed: {}", e);
                    return self.end_turn_with_error(e.to_string());
                }
            };

            // Text produced in this round only; it belongs to this round's
            // assistant message
            let mut round_text = String::new();
            let mut pending_calls: BTreeMap<usize, PendingToolCall> = BTreeMap::new();
            let mut finish_reason: Option<String> = None;
            let mut stream_error: Option<String> = None;

            loop {
                tokio::select! {
                    event = stream.events.recv() => {
                        match event {
                            Some(StreamEvent::Token(text)) => {
                                round_text.push_str(&text);
                                turn_text.push_str(&text);
                                self.dispatcher.broadcast(
                                    &self.session_id,
                                    SessionMessage::LlmToken { text },
                                );
                            }
                            Some(StreamEvent::ToolCallDelta { index, id, name, arguments }) => {
                                let slot = pending_calls.entry(index).or_default();
                                if let Some(id) = id {
                                    slot.id = Some(id);
                                }
                                if let Some(name) = name {
                                    slot.name = Some(name);
                                }
                                slot.arguments.push_str(&arguments);
                            }
                            Some(StreamEvent::Done { finish_reason: reason }) => {
                                finish_reason = reason;
                                break;
                            }
                            Some(StreamEvent::Error(e)) => {
                                stream_error = Some(e);
                                break;
                            }
                            None => break,
                        }
                    }
                    event = finals.recv() => {
                        match event.map(|e| e.message) {
                            Some(SessionMessage::FinalTranscript { text }) if !text.is_empty() => {
                                info!(session_id = %self.session_id, "barge-in, cancelling completion");
                                stream.abort();
                                // Whatever was said stays in history so the
                                // role sequence remains valid
                                self.history.push(ChatMessage::assistant(turn_text));
                                return TurnOutcome::Interrupted(text);
                            }
                            Some(_) => {}
                            None => {
                                stream.abort();
                                return TurnOutcome::SessionClosed;
                            }
                        }
                    }
                    _ = close.recv() => {
                        stream.abort();
                        return TurnOutcome::SessionClosed;
                    }
                }
            }

            if let Some(e) = stream_error {
                warn!(session_id = %self.session_id, "completion stream failed: {}", e);
                return self.end_turn_with_error(e);
            }

            let calls = assemble_tool_calls(pending_calls);
            let wants_tools = finish_reason.as_deref() == Some("tool_calls") && !calls.is_empty();

            if wants_tools && round < MAX_TOOL_ROUNDS {
                self.history.push(ChatMessage::assistant_with_tools(
                    (!round_text.is_empty()).then(|| round_text.clone()),
                    calls.clone(),
                ));
                for call in &calls {
                    self.dispatcher.broadcast(
                        &self.session_id,
                        SessionMessage::LlmToolCall {
                            call_id: call.id.clone(),
                            name: call.function.name.clone(),
                            arguments: serde_json::from_str(&call.function.arguments)
                                .unwrap_or(Value::Null),
                        },
                    );
                    let result = self.tools.execute(call).await;
                    self.history
                        .push(ChatMessage::tool_result(call.id.clone(), result.to_string()));
                }
                continue;
            }

            if wants_tools {
                warn!(session_id = %self.session_id, "tool round limit hit, ending turn");
            }
            self.history.push(ChatMessage::assistant(round_text));
            info!(
                session_id = %self.session_id,
                chars = turn_text.len(),
                "turn closed"
            );
            self.dispatcher.broadcast(
                &self.session_id,
                SessionMessage::TurnEnd {
                    full_text: turn_text,
                    error: None,
                },
            );
            return TurnOutcome::Complete;
        }

        unreachable!("tool round loop always returns");
    }

    fn end_turn_with_error(&mut self, error: String) -> TurnOutcome {
        // The turn dies but the session survives; the assistant slot stays
        // empty so the next user message keeps the history alternating
        self.history.push(ChatMessage::assistant(""));
        self.dispatcher.broadcast(
            &self.session_id,
            SessionMessage::TurnEnd {
                full_text: String::new(),
                error: Some(error),
            },
        );
        TurnOutcome::Complete
    }

    fn spawn_crisis_check(&self, text: &str) {
        let Some(crisis) = self.crisis.clone() else {
            return;
        };
        let dispatcher = self.dispatcher.clone();
        let session_id = self.session_id.clone();
        let text = text.to_string();
        tokio::spawn(async move {
            match crisis.is_critical(&text).await {
                Ok(is_critical) => {
                    dispatcher.broadcast(
                        &session_id,
                        SessionMessage::CrisisDetected { is_critical },
                    );
                }
                Err(e) => debug!(session_id = %session_id, "crisis check failed: {}", e),
            }
        });
    }
}

fn assemble_tool_calls(pending: BTreeMap<usize, PendingToolCall>) -> Vec<ToolCall> {
    pending
        .into_values()
        .filter_map(|slot| {
            let name = slot.name?;
            Some(ToolCall {
                id: slot.id.unwrap_or_else(|| format!("call_{}", uuid::Uuid::new_v4())),
                r#type: "function".to_string(),
                function: FunctionCall {
                    name,
                    arguments: if slot.arguments.is_empty() {
                        "{}".to_string()
                    } else {
                        slot.arguments
                    },
                },
            })
        })
        .collect()
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::client::{CompletionStream, ToolDefinition};
    use anyhow::Result;
    use std::collections::VecDeque;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::sync::Mutex;

    /// One scripted streaming completion
    enum Step {
        Emit(StreamEvent),
        Idle(u64),
    }

    struct ScriptedBackend {
        scripts: Mutex<VecDeque<Vec<Step>>>,
    }

    impl ScriptedBackend {
        fn new(scripts: Vec<Vec<Step>>) -> Arc<Self> {
            Arc::new(Self {
                scripts: Mutex::new(scripts.into()),
            })
        }
    }

    #[async_trait::async_trait]
    impl ChatBackend for ScriptedBackend {
        async fn complete(&self, _messages: Vec<ChatMessage>) -> Result<String> {
            Ok("NO".to_string())
        }

        async fn stream_chat(
            &self,
            _messages: Vec<ChatMessage>,
            _tools: Vec<ToolDefinition>,
        ) -> Result<CompletionStream> {
            let script = self
                .scripts
                .lock()
                .await
                .pop_front()
                .expect("script exhausted");
            let (tx, rx) = mpsc::channel(64);
            let task = tokio::spawn(async move {
                for step in script {
                    match step {
                        Step::Emit(event) => {
                            if tx.send(event).await.is_err() {
                                return;
                            }
                        }
                        Step::Idle(ms) => tokio::time::sleep(Duration::from_millis(ms)).await,
                    }
                }
            });
            Ok(CompletionStream::new(rx, Some(task)))
        }
    }

    fn tokens(parts: &[&str]) -> Vec<Step> {
        let mut steps: Vec<Step> = parts
            .iter()
            .map(|t| Step::Emit(StreamEvent::Token(t.to_string())))
            .collect();
        steps.push(Step::Emit(StreamEvent::Done {
            finish_reason: Some("stop".to_string()),
        }));
        steps
    }

    async fn wait_for_subscriber(
        dispatcher: &Dispatcher,
        session_id: &str,
        message_type: MessageType,
    ) {
        while dispatcher.subscriber_count(session_id, message_type) == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    #[tokio::test]
    async fn test_tokens_stream_in_order_and_turn_ends() {
        let dispatcher = Arc::new(Dispatcher::new());
        let mut token_sub = dispatcher.subscribe("s1", MessageType::LlmToken);
        let mut end_sub = dispatcher.subscribe("s1", MessageType::TurnEnd);

        let backend = ScriptedBackend::new(vec![tokens(&["Hi", " there", "."])]);
        let driver = LlmDriver::new(
            "s1",
            dispatcher.clone(),
            backend,
            Arc::new(ToolRegistry::empty()),
            None,
            "persona",
        );
        let task = tokio::spawn(driver.run());
        wait_for_subscriber(&dispatcher, "s1", MessageType::FinalTranscript).await;

        dispatcher.broadcast(
            "s1",
            SessionMessage::FinalTranscript {
                text: "hello".to_string(),
            },
        );

        for expected in ["Hi", " there", "."] {
            match token_sub.recv().await.unwrap().message {
                SessionMessage::LlmToken { text } => assert_eq!(text, expected),
                other => panic!("unexpected message: {:?}", other),
            }
        }
        match end_sub.recv().await.unwrap().message {
            SessionMessage::TurnEnd { full_text, error } => {
                assert_eq!(full_text, "Hi there.");
                assert!(error.is_none());
            }
            other => panic!("unexpected message: {:?}", other),
        }

        dispatcher.broadcast(
            "s1",
            SessionMessage::SessionClose {
                reason: "test".to_string(),
            },
        );
        let history = task.await.unwrap();
        let roles: Vec<&str> = history.iter().map(|m| m.role.as_str()).collect();
        assert_eq!(roles, vec!["system", "user", "assistant"]);
        assert_eq!(history[2].content_text(), "Hi there.");
    }

    #[tokio::test]
    async fn test_barge_in_cancels_and_keeps_history_alternating() {
        let dispatcher = Arc::new(Dispatcher::new());
        let mut end_sub = dispatcher.subscribe("s1", MessageType::TurnEnd);

        let backend = ScriptedBackend::new(vec![
            // First completion emits a partial answer then stalls
            vec![
                Step::Emit(StreamEvent::Token("Hi there, how".to_string())),
                Step::Idle(60_000),
            ],
            tokens(&["Stopping."]),
        ]);
        let driver = LlmDriver::new(
            "s1",
            dispatcher.clone(),
            backend,
            Arc::new(ToolRegistry::empty()),
            None,
            "persona",
        );
        let task = tokio::spawn(driver.run());
        wait_for_subscriber(&dispatcher, "s1", MessageType::FinalTranscript).await;

        dispatcher.broadcast(
            "s1",
            SessionMessage::FinalTranscript {
                text: "hello".to_string(),
            },
        );
        // Let the partial token arrive before interrupting
        tokio::time::sleep(Duration::from_millis(50)).await;
        dispatcher.broadcast(
            "s1",
            SessionMessage::FinalTranscript {
                text: "stop".to_string(),
            },
        );

        // Only the second (uninterrupted) turn reaches TURN_END
        match end_sub.recv().await.unwrap().message {
            SessionMessage::TurnEnd { full_text, .. } => assert_eq!(full_text, "Stopping."),
            other => panic!("unexpected message: {:?}", other),
        }

        dispatcher.broadcast(
            "s1",
            SessionMessage::SessionClose {
                reason: "test".to_string(),
            },
        );
        let history = task.await.unwrap();
        let roles: Vec<&str> = history.iter().map(|m| m.role.as_str()).collect();
        assert_eq!(
            roles,
            vec!["system", "user", "assistant", "user", "assistant"]
        );
        // The partial text was committed as the first assistant message
        assert_eq!(history[2].content_text(), "Hi there, how");
    }

    #[tokio::test]
    async fn test_tool_round_then_final_answer() {
        let dispatcher = Arc::new(Dispatcher::new());
        let mut call_sub = dispatcher.subscribe("s1", MessageType::LlmToolCall);
        let mut end_sub = dispatcher.subscribe("s1", MessageType::TurnEnd);

        let backend = ScriptedBackend::new(vec![
            vec![
                Step::Emit(StreamEvent::ToolCallDelta {
                    index: 0,
                    id: Some("call_1".to_string()),
                    name: Some("echo".to_string()),
                    arguments: "{\"text\":".to_string(),
                }),
                Step::Emit(StreamEvent::ToolCallDelta {
                    index: 0,
                    id: None,
                    name: None,
                    arguments: "\"hi\"}".to_string(),
                }),
                Step::Emit(StreamEvent::Done {
                    finish_reason: Some("tool_calls".to_string()),
                }),
            ],
            tokens(&["Echoed."]),
        ]);

        struct Echo;
        #[async_trait::async_trait]
        impl crate::llm::tools::Tool for Echo {
            fn name(&self) -> &str {
                "echo"
            }
            fn description(&self) -> &str {
                "echo"
            }
            fn parameters(&self) -> Value {
                serde_json::json!({"type": "object"})
            }
            async fn execute(&self, args: Value) -> Result<Value> {
                Ok(serde_json::json!({"echoed": args["text"]}))
            }
        }
        let mut registry = ToolRegistry::empty();
        registry.register(Arc::new(Echo));

        let driver = LlmDriver::new(
            "s1",
            dispatcher.clone(),
            backend,
            Arc::new(registry),
            None,
            "persona",
        );
        let task = tokio::spawn(driver.run());
        wait_for_subscriber(&dispatcher, "s1", MessageType::FinalTranscript).await;

        dispatcher.broadcast(
            "s1",
            SessionMessage::FinalTranscript {
                text: "say hi".to_string(),
            },
        );

        match call_sub.recv().await.unwrap().message {
            SessionMessage::LlmToolCall {
                name, arguments, ..
            } => {
                assert_eq!(name, "echo");
                assert_eq!(arguments["text"], "hi");
            }
            other => panic!("unexpected message: {:?}", other),
        }
        match end_sub.recv().await.unwrap().message {
            SessionMessage::TurnEnd { full_text, .. } => assert_eq!(full_text, "Echoed."),
            other => panic!("unexpected message: {:?}", other),
        }

        dispatcher.broadcast(
            "s1",
            SessionMessage::SessionClose {
                reason: "test".to_string(),
            },
        );
        let history = task.await.unwrap();
        let roles: Vec<&str> = history.iter().map(|m| m.role.as_str()).collect();
        assert_eq!(
            roles,
            vec!["system", "user", "assistant", "tool", "assistant"]
        );
        assert!(history[2].tool_calls.is_some());
        assert_eq!(history[3].tool_call_id.as_deref(), Some("call_1"));
    }

    #[tokio::test]
    async fn test_stream_error_ends_turn_with_empty_assistant() {
        let dispatcher = Arc::new(Dispatcher::new());
        let mut end_sub = dispatcher.subscribe("s1", MessageType::TurnEnd);

        let backend = ScriptedBackend::new(vec![vec![
            Step::Emit(StreamEvent::Token("Par".to_string())),
            Step::Emit(StreamEvent::Error("upstream 500".to_string())),
        ]]);
        let driver = LlmDriver::new(
            "s1",
            dispatcher.clone(),
            backend,
            Arc::new(ToolRegistry::empty()),
            None,
            "persona",
        );
        let task = tokio::spawn(driver.run());
        wait_for_subscriber(&dispatcher, "s1", MessageType::FinalTranscript).await;

        dispatcher.broadcast(
            "s1",
            SessionMessage::FinalTranscript {
                text: "hello".to_string(),
            },
        );
        match end_sub.recv().await.unwrap().message {
            SessionMessage::TurnEnd { full_text, error } => {
                assert!(full_text.is_empty());
                assert!(error.unwrap().contains("upstream 500"));
            }
            other => panic!("unexpected message: {:?}", other),
        }

        dispatcher.broadcast(
            "s1",
            SessionMessage::SessionClose {
                reason: "test".to_string(),
            },
        );
        let history = task.await.unwrap();
        assert_eq!(history.last().unwrap().role, "assistant");
        assert_eq!(history.last().unwrap().content_text(), "");
    }

    #[tokio::test]
    async fn test_empty_final_transcripts_do_not_open_turns() {
        let dispatcher = Arc::new(Dispatcher::new());
        let backend = ScriptedBackend::new(vec![]);
        let driver = LlmDriver::new(
            "s1",
            dispatcher.clone(),
            backend,
            Arc::new(ToolRegistry::empty()),
            None,
            "persona",
        );
        let task = tokio::spawn(driver.run());
        wait_for_subscriber(&dispatcher, "s1", MessageType::FinalTranscript).await;

        dispatcher.broadcast(
            "s1",
            SessionMessage::SessionClose {
                reason: "test".to_string(),
            },
        );
        let history = task.await.unwrap();
        assert_eq!(history.len(), 1);
    }
}

