//! # Persona Instructions
//!
//! Derives the assistant instructions for a session from the optional
//! conversation topic. The wording itself lives in [`PersonaConfig`].

use crate::config::{PersonaConfig, TOPIC_PLACEHOLDER};

/// Normalize a raw `topic` query value. Empty strings count as "no topic".
pub fn normalize_topic(raw: Option<&str>) -> Option<String> {
    match raw {
        Some(topic) if !topic.is_empty() => Some(topic.to_string()),
        _ => None,
    }
}

/// Build the instructions string for a session.
///
/// ## Template selection:
/// - **topic present**: `topic_template` with `{topic}` replaced by the topic
/// - **topic absent**: `generic_template` verbatim
pub fn derive_instructions(persona: &PersonaConfig, topic: Option<&str>) -> String {
    match topic {
        Some(topic) => persona.topic_template.replace(TOPIC_PLACEHOLDER, topic),
        None => persona.generic_template.clone(),
    }
}
