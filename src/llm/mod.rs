//! LLM integration: chat client, realtime driver, tools, crisis detection

pub mod client;
pub mod crisis;
pub mod driver;
pub mod tools;

pub use client::{ChatBackend, ChatMessage, LlmClient};
pub use driver::LlmDriver;
pub use tools::{Tool, ToolRegistry};
