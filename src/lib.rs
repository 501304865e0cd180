//! Companion - persona-driven conversation engine
//!
//! Turns a user's text, voice transcript, or image description into one
//! model call against a configurable companion persona:
//! - Compiles the persona into a deterministic instruction preamble
//! - Builds a bounded, ordered context window from stored history
//! - Serializes turns per conversation and persists each user/assistant pair atomically

pub mod config;
pub mod context;
pub mod gateway;
pub mod modality;
pub mod notify;
pub mod orchestrator;
pub mod persona;
pub mod store;

pub use context::{ContextWindowBuilder, PromptContext, PromptMessage, PromptRole};
pub use gateway::{ModelBackend, ModelGateway, ModelReply};
pub use modality::{ModalityNormalizer, TurnInput};
pub use orchestrator::{ConversationOrchestrator, TurnRequest, TurnResponse, TurnState};
pub use persona::{Companion, CompanionDirectory, PersonaCompiler};
pub use store::{Conversation, ConversationStore, Message, MessageRole};

use std::path::PathBuf;
use std::time::Duration;

/// Default number of prior messages included in a context window
pub const DEFAULT_WINDOW_SIZE: usize = 10;

/// What to do with an in-flight turn whose caller went away
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelPolicy {
    /// Let the model call finish and persist the pair anyway
    #[default]
    Complete,
    /// Drop the turn with the caller; nothing is written
    Discard,
}

/// Which wire format the model backend speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelProvider {
    /// OpenAI-compatible Chat Completions
    Openai,
    /// Google Gemini generateContent
    #[default]
    Gemini,
}

/// Model backend settings
#[derive(Debug, Clone)]
pub struct ModelSettings {
    pub provider: ModelProvider,
    pub model: String,
    pub base_url: String,
    /// Environment variable holding the API key
    pub api_key_env: String,
    pub max_output_tokens: u32,
    pub temperature: f32,
    /// Deadline for a single model call
    pub request_timeout: Duration,
    /// Fixed delay before the one retry after a timeout
    pub retry_delay: Duration,
}

impl ModelSettings {
    pub fn for_provider(provider: ModelProvider) -> Self {
        let (model, base_url, api_key_env) = match provider {
            ModelProvider::Openai => ("gpt-4o-mini", "https://api.openai.com/v1", "OPENAI_API_KEY"),
            ModelProvider::Gemini => (
                "gemini-1.5-flash",
                "https://generativelanguage.googleapis.com/v1beta",
                "GOOGLE_AI_API_KEY",
            ),
        };
        Self {
            provider,
            model: model.to_string(),
            base_url: base_url.to_string(),
            api_key_env: api_key_env.to_string(),
            max_output_tokens: 2048,
            temperature: 0.3,
            request_timeout: Duration::from_secs(30),
            retry_delay: Duration::from_millis(500),
        }
    }
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self::for_provider(ModelProvider::default())
    }
}

/// Azure speech settings for the voice adapter
#[derive(Debug, Clone)]
pub struct SpeechSettings {
    pub region: Option<String>,
    pub key_env: String,
    pub voice: String,
    pub language: String,
}

impl Default for SpeechSettings {
    fn default() -> Self {
        Self {
            region: None,
            key_env: "AZURE_SPEECH_KEY".to_string(),
            voice: "en-US-JennyNeural".to_string(),
            language: "en-US".to_string(),
        }
    }
}

/// Image analysis settings
#[derive(Debug, Clone)]
pub struct VisionSettings {
    /// Model used for descriptions; falls back to the chat model when unset
    pub model: Option<String>,
    /// Longest side after downscaling
    pub max_dimension: u32,
    /// Upper bound on the encoded upload
    pub max_bytes: usize,
}

impl Default for VisionSettings {
    fn default() -> Self {
        Self {
            model: None,
            max_dimension: 1024,
            max_bytes: 1024 * 1024,
        }
    }
}

/// Configuration for Companion
#[derive(Debug, Clone)]
pub struct CompanionConfig {
    /// Root directory for config, companions and conversations
    pub data_dir: PathBuf,

    /// Number of prior messages in each context window
    pub window_size: usize,

    /// Deadline for the atomic pair write
    pub persist_timeout: Duration,

    /// Behaviour when the caller of a turn disconnects
    pub on_cancel: CancelPolicy,

    pub model: ModelSettings,
    pub speech: SpeechSettings,
    pub vision: VisionSettings,
}

impl CompanionConfig {
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            data_dir,
            window_size: DEFAULT_WINDOW_SIZE,
            persist_timeout: Duration::from_secs(5),
            on_cancel: CancelPolicy::default(),
            model: ModelSettings::default(),
            speech: SpeechSettings::default(),
            vision: VisionSettings::default(),
        }
    }

    pub fn with_window_size(mut self, size: usize) -> Self {
        self.window_size = size;
        self
    }

    pub fn with_persist_timeout(mut self, timeout: Duration) -> Self {
        self.persist_timeout = timeout;
        self
    }

    pub fn with_cancel_policy(mut self, policy: CancelPolicy) -> Self {
        self.on_cancel = policy;
        self
    }

    pub fn with_model(mut self, model: ModelSettings) -> Self {
        self.model = model;
        self
    }

    pub fn companions_file(&self) -> PathBuf {
        self.data_dir.join("companions.toml")
    }

    pub fn conversations_dir(&self) -> PathBuf {
        self.data_dir.join("conversations")
    }
}

/// Result type for Companion operations
pub type Result<T> = std::result::Result<T, CompanionError>;

/// Errors that can occur in Companion
#[derive(Debug, thiserror::Error)]
pub enum CompanionError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Input is empty after normalization")]
    EmptyInput,

    #[error("Model call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Model backend error{}: {detail}", .status.map(|s| format!(" {s}")).unwrap_or_default())]
    Upstream { status: Option<u16>, detail: String },

    #[error("Model backend rate limited{}", .retry_after.map(|d| format!(", retry after {d:?}")).unwrap_or_default())]
    RateLimit { retry_after: Option<Duration> },

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Companion not found: {0}")]
    CompanionNotFound(String),

    #[error("Image analysis error: {0}")]
    Analysis(String),

    #[error("Speech error: {0}")]
    Speech(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CompanionError {
    pub fn upstream(status: Option<u16>, detail: impl Into<String>) -> Self {
        Self::Upstream {
            status,
            detail: detail.into(),
        }
    }

    /// Stable machine-readable reason code
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration_error",
            Self::EmptyInput => "empty_input",
            Self::Timeout(_) => "timeout",
            Self::Upstream { .. } => "upstream_error",
            Self::RateLimit { .. } => "rate_limited",
            Self::Persistence(_) => "persistence_error",
            Self::CompanionNotFound(_) => "companion_not_found",
            Self::Analysis(_) => "analysis_error",
            Self::Speech(_) => "speech_error",
            Self::Io(_) => "io_error",
            Self::Json(_) => "json_error",
        }
    }

    /// Whether resubmitting the same input later may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::RateLimit { .. } => true,
            Self::Upstream { status, .. } => status.map_or(true, |s| s >= 500),
            _ => false,
        }
    }
}
