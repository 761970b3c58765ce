//! System prompt composition
//!
//! The session system prompt is a pure function of (persona role, language):
//! base persona, optional role overlay, then a language directive. The
//! composed string is appended to history once and is immutable for the
//! session's lifetime.

use crate::types::{Language, PersonaRole};

const BASE_PERSONA: &str = "\
You are a warm, supportive wellbeing companion in a real-time voice \
conversation. You listen closely, respond with empathy, and keep answers \
short and conversational, usually one to three sentences, as if on a phone \
call. You do not give medical advice. Do not use markdown, bullet points, or \
code blocks; your responses are spoken aloud, so use natural speech patterns.";

fn role_overlay(role: PersonaRole) -> &'static str {
    match role {
        PersonaRole::LoyalBestFriend => {
            "Speak like a loyal best friend: casual, affectionate, always on \
             the user's side, comfortable with silly tangents."
        }
        PersonaRole::CaringParent => {
            "Speak like a caring parent: gentle, patient, reassuring, and \
             quietly proud of the user's small wins."
        }
        PersonaRole::Coach => {
            "Speak like a supportive coach: encouraging and practical, \
             nudging the user toward one small concrete next step."
        }
        PersonaRole::FunnyFriend => {
            "Speak like a funny friend: light, playful, quick with gentle \
             humor, but never at the user's expense."
        }
    }
}

fn language_directive(language: Language) -> &'static str {
    match language {
        Language::English => "Respond in English.",
        Language::French => "Respond in French.",
        Language::Cantonese => "Respond in Cantonese, written in Traditional Chinese.",
        Language::TraditionalChinese => "Respond in Traditional Chinese.",
    }
}

/// Compose the session system prompt
pub fn compose(role: Option<PersonaRole>, language: Language) -> String {
    let mut prompt = String::from(BASE_PERSONA);
    if let Some(role) = role {
        prompt.push_str("\n\n");
        prompt.push_str(role_overlay(role));
    }
    prompt.push_str("\n\n");
    prompt.push_str(language_directive(language));
    prompt
}

/// TTS voice for a language; empty string keeps the configured default
pub fn voice_for_language(language: Language) -> &'static str {
    match language {
        Language::English | Language::French => "",
        Language::Cantonese => "cantonese_expressive_narrator",
        Language::TraditionalChinese => "taiwanese_expressive_narrator",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compose_layers() {
        let prompt = compose(Some(PersonaRole::Coach), Language::French);
        assert!(prompt.starts_with(BASE_PERSONA));
        assert!(prompt.contains("supportive coach"));
        assert!(prompt.ends_with("Respond in French."));
    }

    #[test]
    fn test_compose_without_role() {
        let prompt = compose(None, Language::English);
        assert!(!prompt.contains("coach"));
        assert!(prompt.ends_with("Respond in English."));
    }

    #[test]
    fn test_identical_inputs_compose_identically() {
        assert_eq!(
            compose(Some(PersonaRole::FunnyFriend), Language::Cantonese),
            compose(Some(PersonaRole::FunnyFriend), Language::Cantonese)
        );
    }
}
