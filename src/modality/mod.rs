//! Input modalities
//!
//! Text, speech transcripts and image descriptions all reduce to one plain
//! text turn before the orchestrator sees them.

pub mod vision;
pub mod voice;

pub use vision::ImageAnalyzer;
pub use voice::{RecognitionSession, SpeechRecognizer, SpeechSynthesizer, TranscriptEvent};

use crate::{CompanionError, Result};
use serde::{Deserialize, Serialize};

/// Marker placed before image-derived turns
const IMAGE_PREFIX: &str = "[Image] ";

/// Raw turn input as submitted by a client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "inputKind", content = "content", rename_all = "camelCase")]
pub enum TurnInput {
    Text(String),
    /// Text produced by the speech recognizer
    VoiceTranscript(String),
    /// Natural-language description produced by the image analyzer
    ImageDescription(String),
}

impl TurnInput {
    /// Join recognized speech fragments into one transcript input.
    pub fn voice_from_fragments<S: AsRef<str>>(fragments: &[S]) -> Self {
        let joined = fragments
            .iter()
            .map(|f| f.as_ref().trim())
            .filter(|f| !f.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        Self::VoiceTranscript(joined)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Text(_) => "text",
            Self::VoiceTranscript(_) => "voiceTranscript",
            Self::ImageDescription(_) => "imageDescription",
        }
    }
}

/// Normalized text ready to become a user message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalText(String);

impl CanonicalText {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

pub struct ModalityNormalizer;

impl ModalityNormalizer {
    /// Reduce any input kind to canonical text. Whitespace-only input is
    /// rejected so it never reaches the model.
    pub fn normalize(input: &TurnInput) -> Result<CanonicalText> {
        let text = match input {
            TurnInput::Text(content) => content.trim().to_string(),
            TurnInput::VoiceTranscript(content) => collapse_whitespace(content),
            TurnInput::ImageDescription(content) => {
                let description = content.trim();
                if description.is_empty() {
                    return Err(CompanionError::EmptyInput);
                }
                format!("{IMAGE_PREFIX}{description}")
            }
        };

        if text.is_empty() {
            return Err(CompanionError::EmptyInput);
        }
        Ok(CanonicalText(text))
    }
}

/// Recognizers emit line breaks and doubled spaces between phrases
fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_is_trimmed() {
        let text = ModalityNormalizer::normalize(&TurnInput::Text("  How are you?\n".into())).unwrap();
        assert_eq!(text.as_str(), "How are you?");
    }

    #[test]
    fn test_empty_inputs_rejected() {
        for input in [
            TurnInput::Text("   ".into()),
            TurnInput::VoiceTranscript("\n\t".into()),
            TurnInput::ImageDescription("".into()),
        ] {
            let err = ModalityNormalizer::normalize(&input).unwrap_err();
            assert!(matches!(err, CompanionError::EmptyInput), "{input:?}");
        }
    }

    #[test]
    fn test_voice_transcript_whitespace_collapsed() {
        let text = ModalityNormalizer::normalize(&TurnInput::VoiceTranscript(
            "hello  there\nhow is   the weather".into(),
        ))
        .unwrap();
        assert_eq!(text.as_str(), "hello there how is the weather");
    }

    #[test]
    fn test_voice_from_fragments() {
        let input = TurnInput::voice_from_fragments(&["Good morning.", "  ", "Any plans today?"]);
        assert_eq!(
            input,
            TurnInput::VoiceTranscript("Good morning. Any plans today?".into())
        );
    }

    #[test]
    fn test_image_description_is_marked() {
        let text = ModalityNormalizer::normalize(&TurnInput::ImageDescription(
            " A golden retriever catching a frisbee on a beach. ".into(),
        ))
        .unwrap();
        assert_eq!(
            text.as_str(),
            "[Image] A golden retriever catching a frisbee on a beach."
        );
    }

    #[test]
    fn test_request_shape_deserializes() {
        let input: TurnInput =
            serde_json::from_str(r#"{"inputKind":"voiceTranscript","content":"hi"}"#).unwrap();
        assert_eq!(input, TurnInput::VoiceTranscript("hi".into()));
        assert_eq!(input.kind(), "voiceTranscript");
    }
}
