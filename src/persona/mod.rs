//! Companion personas
//!
//! A companion is a fixed-shape record validated at load time. The compiler
//! turns it into the instruction preamble that leads every context window.

mod directory;

pub use directory::{CompanionDirectory, MemoryCompanionDirectory, TomlCompanionDirectory};

use crate::{CompanionError, Result};
use serde::{Deserialize, Serialize};

/// Style used when a companion record does not name one
pub const DEFAULT_CONVERSATION_STYLE: &str = "friendly and engaging";

/// Minimum display name length accepted by the directory
const MIN_NAME_CHARS: usize = 2;
/// Minimum background length accepted by the directory
const MIN_BACKGROUND_CHARS: usize = 10;

/// Immutable persona descriptor, read by identifier and never mutated by a turn
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Companion {
    pub id: String,
    pub name: String,
    pub background: String,
    #[serde(default)]
    pub traits: Vec<String>,
    #[serde(default)]
    pub interests: Vec<String>,
    #[serde(default = "default_style")]
    pub conversation_style: String,
}

fn default_style() -> String {
    DEFAULT_CONVERSATION_STYLE.to_string()
}

impl Companion {
    pub fn new(id: impl Into<String>, name: impl Into<String>, background: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            background: background.into(),
            traits: Vec::new(),
            interests: Vec::new(),
            conversation_style: default_style(),
        }
    }

    pub fn with_traits<I, S>(mut self, traits: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.traits = traits.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_interests<I, S>(mut self, interests: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.interests = interests.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_style(mut self, style: impl Into<String>) -> Self {
        self.conversation_style = style.into();
        self
    }

    /// Build a companion from comma-delimited trait and interest strings,
    /// the shape admin forms store them in.
    pub fn from_delimited(
        id: impl Into<String>,
        name: impl Into<String>,
        background: impl Into<String>,
        traits: &str,
        interests: &str,
    ) -> Self {
        Self::new(id, name, background)
            .with_traits(split_list(traits))
            .with_interests(split_list(interests))
    }

    /// Check the record against the directory's acceptance rules.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(CompanionError::Configuration(
                "companion record has no id".to_string(),
            ));
        }
        if self.name.trim().chars().count() < MIN_NAME_CHARS {
            return Err(CompanionError::Configuration(format!(
                "companion '{}' name must be at least {} characters",
                self.id, MIN_NAME_CHARS
            )));
        }
        if self.background.trim().chars().count() < MIN_BACKGROUND_CHARS {
            return Err(CompanionError::Configuration(format!(
                "companion '{}' background must be at least {} characters",
                self.id, MIN_BACKGROUND_CHARS
            )));
        }
        Ok(())
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Compiled system instruction for one companion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Preamble(String);

impl Preamble {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Compiles companions into instruction preambles. Pure and deterministic.
pub struct PersonaCompiler;

impl PersonaCompiler {
    pub fn compile(companion: &Companion) -> Result<Preamble> {
        let name = companion.name.trim();
        if name.is_empty() {
            return Err(CompanionError::Configuration(format!(
                "companion '{}' has no name",
                companion.id
            )));
        }

        let traits = join_items(&companion.traits);
        let interests = join_items(&companion.interests);
        let style = companion.conversation_style.trim();
        let background = companion.background.trim();

        Ok(Preamble(format!(
            r#"You are {name}, an AI companion with the following character:
Background: {background}
Personality Traits: {traits}
Interests: {interests}
Conversation Style: {style}

Keep the same personality, memories and voice across every turn of this conversation.
Engage naturally while staying within ethical and safety boundaries.
If the user asks directly whether you are an AI, answer honestly; otherwise stay in character."#
        )))
    }
}

fn join_items(items: &[String]) -> String {
    items
        .iter()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn luna() -> Companion {
        Companion::new("luna", "Luna", "A retired astronomer who loves night walks.")
            .with_traits(["curious", "warm", "patient"])
            .with_interests(["stars", "poetry"])
            .with_style("gentle and reflective")
    }

    #[test]
    fn test_compile_is_deterministic() {
        let companion = luna();
        let first = PersonaCompiler::compile(&companion).unwrap();
        let second = PersonaCompiler::compile(&companion.clone()).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.as_str().as_bytes(), second.as_str().as_bytes());
    }

    #[test]
    fn test_compile_contains_all_attributes() {
        let preamble = PersonaCompiler::compile(&luna()).unwrap();
        let text = preamble.as_str();
        assert!(text.starts_with("You are Luna,"));
        assert!(text.contains("Background: A retired astronomer who loves night walks."));
        assert!(text.contains("Personality Traits: curious, warm, patient"));
        assert!(text.contains("Interests: stars, poetry"));
        assert!(text.contains("Conversation Style: gentle and reflective"));
        assert!(text.contains("answer honestly"));
        assert!(text.contains("same personality"));
    }

    #[test]
    fn test_compile_rejects_missing_name() {
        let companion = Companion::new("ghost", "   ", "No name at all, just a shadow.");
        let err = PersonaCompiler::compile(&companion).unwrap_err();
        assert_eq!(err.reason(), "configuration_error");
    }

    #[test]
    fn test_empty_lists_compile_to_empty_fields() {
        let companion = Companion::new("min", "Min", "Minimal companion record.");
        let preamble = PersonaCompiler::compile(&companion).unwrap();
        assert!(preamble.as_str().contains("Personality Traits: \n"));
        assert!(preamble.as_str().contains("Conversation Style: friendly and engaging"));
    }

    #[test]
    fn test_from_delimited_splits_and_trims() {
        let companion = Companion::from_delimited(
            "sam",
            "Sam",
            "A barista with opinions about everything.",
            " witty,  sarcastic ,,kind",
            "coffee, jazz",
        );
        assert_eq!(companion.traits, vec!["witty", "sarcastic", "kind"]);
        assert_eq!(companion.interests, vec!["coffee", "jazz"]);
    }

    #[test]
    fn test_validate_rules() {
        assert!(luna().validate().is_ok());

        let short_name = Companion::new("x", "X", "Background long enough.");
        assert!(short_name.validate().is_err());

        let short_background = Companion::new("y", "Yara", "tiny");
        assert!(short_background.validate().is_err());

        let no_id = Companion::new(" ", "Nobody", "Has a background but no id.");
        assert!(no_id.validate().is_err());
    }
}
