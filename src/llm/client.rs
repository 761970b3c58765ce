//! LLM chat client (OpenAI-compatible completions API)
//!
//! Non-streaming completions for the HTTP chat surface and the crisis
//! classifier; streaming completions (SSE over a plain byte stream) for the
//! realtime driver. The streaming side hands back a [`CompletionStream`]
//! whose reader task can be aborted mid-flight for barge-in.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::LlmConfig;

// ============ Wire types ============

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    /// Assistant message carrying the tool calls the model requested
    pub fn assistant_with_tools(content: Option<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: "assistant".to_string(),
            content,
            tool_calls: Some(tool_calls),
            tool_call_id: None,
        }
    }

    /// Tool result message answering one tool call
    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: "tool".to_string(),
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: Some(tool_call_id.into()),
        }
    }

    pub fn content_text(&self) -> &str {
        self.content.as_deref().unwrap_or("")
    }
}

/// Tool definition advertised to the model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub r#type: String,
    pub function: FunctionDefinition,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Completed tool call assembled from stream deltas
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub r#type: String,
    pub function: FunctionCall,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    /// JSON-encoded arguments, accumulated verbatim from the stream
    pub arguments: String,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<&'a [ToolDefinition]>,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct StreamResponse {
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: Delta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCallDeltaWire>>,
}

#[derive(Debug, Deserialize)]
struct ToolCallDeltaWire {
    #[serde(default)]
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<FunctionDeltaWire>,
}

#[derive(Debug, Deserialize)]
struct FunctionDeltaWire {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

// ============ Streaming surface ============

/// Events surfaced from one streaming completion
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// Content delta
    Token(String),
    /// Partial tool call, accumulated by index until `Done`
    ToolCallDelta {
        index: usize,
        id: Option<String>,
        name: Option<String>,
        arguments: String,
    },
    /// Stream ended normally; `finish_reason` is the provider's verdict
    Done { finish_reason: Option<String> },
    /// Stream ended on a provider error
    Error(String),
}

/// Handle on one in-flight streaming completion; dropping it cancels the
/// reader task, which is how barge-in aborts generation
pub struct CompletionStream {
    pub events: mpsc::Receiver<StreamEvent>,
    task: Option<JoinHandle<()>>,
}

impl CompletionStream {
    pub fn new(events: mpsc::Receiver<StreamEvent>, task: Option<JoinHandle<()>>) -> Self {
        Self { events, task }
    }

    pub fn abort(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for CompletionStream {
    fn drop(&mut self) {
        self.abort();
    }
}

/// The seam the realtime driver and HTTP surface talk through; the
/// production implementation is [`LlmClient`]
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Blocking completion; returns the assistant text
    async fn complete(&self, messages: Vec<ChatMessage>) -> Result<String>;

    /// Streaming completion with the given tool set
    async fn stream_chat(
        &self,
        messages: Vec<ChatMessage>,
        tools: Vec<ToolDefinition>,
    ) -> Result<CompletionStream>;
}

// ============ Client ============

/// OpenAI-compatible chat client
#[derive(Clone)]
pub struct LlmClient {
    client: Arc<Client>,
    config: LlmConfig,
}

impl LlmClient {
    pub fn new(config: LlmConfig) -> Self {
        Self {
            client: Arc::new(Client::new()),
            config,
        }
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    fn request_builder(&self) -> reqwest::RequestBuilder {
        self.client
            .post(format!("{}/chat/completions", self.config.base_url))
            .header("Authorization", format!("Bearer {}", self.config.api_key))
    }
}

#[async_trait]
impl ChatBackend for LlmClient {
    async fn complete(&self, messages: Vec<ChatMessage>) -> Result<String> {
        let request = ChatRequest {
            model: &self.config.model,
            messages: &messages,
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
            stream: None,
            tools: None,
        };

        let response = self
            .request_builder()
            .json(&request)
            .send()
            .await
            .context("Failed to send request to LLM provider")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("LLM API error ({}): {}", status, body);
        }

        let parsed: CompletionResponse = response
            .json()
            .await
            .context("Failed to parse LLM response")?;
        Ok(parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content_text().to_string())
            .unwrap_or_default())
    }

    async fn stream_chat(
        &self,
        messages: Vec<ChatMessage>,
        tools: Vec<ToolDefinition>,
    ) -> Result<CompletionStream> {
        let request = ChatRequest {
            model: &self.config.model,
            messages: &messages,
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
            stream: Some(true),
            tools: if tools.is_empty() { None } else { Some(&tools) },
        };

        let response = self
            .request_builder()
            .json(&request)
            .send()
            .await
            .context("Failed to send streaming request to LLM provider")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("LLM streaming API error ({}): {}", status, body);
        }

        let (tx, rx) = mpsc::channel(64);
        let task = tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut buffer = String::new();
            let mut finished = false;

            while let Some(chunk) = stream.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        let _ = tx.send(StreamEvent::Error(e.to_string())).await;
                        return;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&chunk));

                // SSE events are separated by blank lines
                while let Some(pos) = buffer.find("\n\n") {
                    let event_str = buffer[..pos].to_string();
                    buffer = buffer[pos + 2..].to_string();

                    for line in event_str.lines() {
                        let Some(data) = line.strip_prefix("data: ") else {
                            continue;
                        };
                        if data == "[DONE]" {
                            continue;
                        }
                        match serde_json::from_str::<StreamResponse>(data) {
                            Ok(parsed) => {
                                if let Some(choice) = parsed.choices.into_iter().next() {
                                    forward_delta(&tx, choice, &mut finished).await;
                                }
                            }
                            Err(e) => debug!("unparseable stream frame: {}", e),
                        }
                    }
                }
            }
            if !finished {
                let _ = tx.send(StreamEvent::Done { finish_reason: None }).await;
            }
        });

        Ok(CompletionStream::new(rx, Some(task)))
    }
}

async fn forward_delta(
    tx: &mpsc::Sender<StreamEvent>,
    choice: StreamChoice,
    finished: &mut bool,
) {
    if let Some(content) = choice.delta.content {
        if !content.is_empty() {
            let _ = tx.send(StreamEvent::Token(content)).await;
        }
    }
    if let Some(tool_calls) = choice.delta.tool_calls {
        for delta in tool_calls {
            let _ = tx
                .send(StreamEvent::ToolCallDelta {
                    index: delta.index,
                    id: delta.id,
                    name: delta.function.as_ref().and_then(|f| f.name.clone()),
                    arguments: delta
                        .function
                        .and_then(|f| f.arguments)
                        .unwrap_or_default(),
                })
                .await;
        }
    }
    if let Some(reason) = choice.finish_reason {
        *finished = true;
        if tx
            .send(StreamEvent::Done {
                finish_reason: Some(reason),
            })
            .await
            .is_err()
        {
            warn!("stream consumer went away before completion");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_builders() {
        let msg = ChatMessage::system("prompt");
        assert_eq!(msg.role, "system");
        assert_eq!(msg.content_text(), "prompt");

        let msg = ChatMessage::tool_result("call_1", "{\"ok\":true}");
        assert_eq!(msg.role, "tool");
        assert_eq!(msg.tool_call_id.as_deref(), Some("call_1"));

        let msg = ChatMessage::assistant_with_tools(
            None,
            vec![ToolCall {
                id: "call_1".to_string(),
                r#type: "function".to_string(),
                function: FunctionCall {
                    name: "lookup".to_string(),
                    arguments: "{}".to_string(),
                },
            }],
        );
        assert!(msg.content.is_none());
        assert_eq!(msg.tool_calls.as_ref().unwrap().len(), 1);
    }

    #[test]
    fn test_request_serialization_omits_empty_tools() {
        let messages = vec![ChatMessage::user("hi")];
        let request = ChatRequest {
            model: "m",
            messages: &messages,
            max_tokens: 16,
            temperature: 0.7,
            stream: Some(true),
            tools: None,
        };
        let raw = serde_json::to_string(&request).unwrap();
        assert!(!raw.contains("tools"));
        assert!(raw.contains("\"stream\":true"));
    }

    #[test]
    fn test_stream_frame_parsing() {
        let raw = r#"{"choices":[{"delta":{"content":"Hi"},"finish_reason":null}]}"#;
        let parsed: StreamResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.choices[0].delta.content.as_deref(), Some("Hi"));
        assert!(parsed.choices[0].finish_reason.is_none());

        let raw = r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"c1",
            "function":{"name":"lookup","arguments":"{\"q\""}}]},"finish_reason":null}]}"#;
        let parsed: StreamResponse = serde_json::from_str(raw).unwrap();
        let deltas = parsed.choices[0].delta.tool_calls.as_ref().unwrap();
        assert_eq!(deltas[0].index, 0);
        assert_eq!(deltas[0].id.as_deref(), Some("c1"));
    }

    #[tokio::test]
    async fn test_completion_stream_abort_is_idempotent() {
        let (_tx, rx) = mpsc::channel(1);
        let task = tokio::spawn(async {
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
        });
        let mut stream = CompletionStream::new(rx, Some(task));
        stream.abort();
        stream.abort();
    }
}
