//! Crisis detection
//!
//! Classifies each user turn with a minimal yes/no completion and publishes
//! the verdict as a `CRISIS_DETECTED` event. Runs fire-and-forget off the
//! turn's critical path; classifier failures never affect the conversation.

use anyhow::Result;
use std::sync::Arc;

use super::client::{ChatBackend, ChatMessage};

const CRISIS_PROMPT: &str = "\
You are a safety classifier. Decide whether the user's message indicates an \
acute mental-health crisis: intent of self-harm, harm to others, or being in \
immediate danger. Reply with exactly one word: YES or NO.";

pub struct CrisisDetector {
    backend: Arc<dyn ChatBackend>,
}

impl CrisisDetector {
    pub fn new(backend: Arc<dyn ChatBackend>) -> Self {
        Self { backend }
    }

    pub async fn is_critical(&self, text: &str) -> Result<bool> {
        let messages = vec![ChatMessage::system(CRISIS_PROMPT), ChatMessage::user(text)];
        let reply = self.backend.complete(messages).await?;
        Ok(parse_verdict(&reply))
    }
}

fn parse_verdict(reply: &str) -> bool {
    reply
        .trim()
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .next()
        .map(|word| word == "yes")
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_verdict() {
        assert!(parse_verdict("YES"));
        assert!(parse_verdict("yes."));
        assert!(parse_verdict("  Yes\n"));
        assert!(!parse_verdict("NO"));
        assert!(!parse_verdict("not really"));
        assert!(!parse_verdict(""));
    }
}
