//! Model gateway
//!
//! Wraps a wire backend with the call policy: bounded output, fixed
//! low-temperature decoding, an enforced deadline, and at most one retry,
//! only after a timeout. Every other failure propagates on the first attempt.

mod gemini;
pub(crate) mod http;
mod openai;

pub use gemini::GeminiBackend;
pub use openai::OpenAiChatBackend;

use crate::context::PromptContext;
use crate::{CompanionError, ModelProvider, ModelSettings, Result};
use regex::Regex;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Attempts per generation: the first call plus one retry after a timeout
const MAX_ATTEMPTS: u32 = 2;

/// One raw model call. Implementations do not retry.
#[async_trait::async_trait]
pub trait ModelBackend: Send + Sync {
    async fn complete(&self, context: &PromptContext) -> Result<String>;

    fn model_name(&self) -> &str;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelReply {
    pub content: String,
    pub model: String,
    /// 1, or 2 when the first call timed out
    pub attempts: u32,
}

pub struct ModelGateway {
    backend: Arc<dyn ModelBackend>,
    timeout: Duration,
    retry_delay: Duration,
}

impl ModelGateway {
    pub fn new(backend: Arc<dyn ModelBackend>, timeout: Duration, retry_delay: Duration) -> Self {
        Self {
            backend,
            timeout,
            retry_delay,
        }
    }

    /// Build the backend named by `settings.provider`.
    pub fn from_settings(settings: &ModelSettings) -> Result<Self> {
        let backend: Arc<dyn ModelBackend> = match settings.provider {
            ModelProvider::Openai => Arc::new(OpenAiChatBackend::new(settings)?),
            ModelProvider::Gemini => Arc::new(GeminiBackend::new(settings)?),
        };
        info!(
            "Model gateway: provider={:?}, model={}, timeout={:?}",
            settings.provider, settings.model, settings.request_timeout
        );
        Ok(Self::new(backend, settings.request_timeout, settings.retry_delay))
    }

    pub async fn generate(&self, context: &PromptContext) -> Result<ModelReply> {
        debug!(
            "Generating with {} messages ({} bytes)",
            context.messages().len(),
            context.content_len()
        );

        for attempt in 1..=MAX_ATTEMPTS {
            let outcome = match tokio::time::timeout(self.timeout, self.backend.complete(context)).await
            {
                Ok(result) => result,
                Err(_elapsed) => Err(CompanionError::Timeout(self.timeout)),
            };

            match outcome {
                Ok(raw) => {
                    let content = sanitize_reply(&raw)?;
                    return Ok(ModelReply {
                        content,
                        model: self.backend.model_name().to_string(),
                        attempts: attempt,
                    });
                }
                Err(CompanionError::Timeout(_)) if attempt < MAX_ATTEMPTS => {
                    warn!(
                        "Model call timed out (attempt {}/{}), retrying in {:?}",
                        attempt, MAX_ATTEMPTS, self.retry_delay
                    );
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(CompanionError::Timeout(_)) => {
                    return Err(CompanionError::Timeout(self.timeout));
                }
                Err(e) => return Err(e),
            }
        }

        Err(CompanionError::Timeout(self.timeout))
    }
}

fn think_tags() -> &'static Regex {
    static THINK: OnceLock<Regex> = OnceLock::new();
    THINK.get_or_init(|| Regex::new(r"(?s)<think>.*?(</think>|$)").expect("think-tag pattern"))
}

/// Strip reasoning blocks some models emit before the reply proper.
pub(crate) fn sanitize_reply(raw: &str) -> Result<String> {
    let reply = think_tags().replace_all(raw, "").trim().to_string();
    if reply.is_empty() {
        return Err(CompanionError::upstream(None, "empty completion"));
    }
    Ok(reply)
}
