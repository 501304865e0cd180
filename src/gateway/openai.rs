//! OpenAI-compatible Chat Completions backend (OpenAI, Ollama, LM Studio, vLLM)

use super::http::{api_key_from_env, build_client, check_response_status, map_reqwest_error};
use super::ModelBackend;
use crate::context::{PromptContext, PromptRole};
use crate::{CompanionError, ModelSettings, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

impl ChatResponse {
    fn into_text(self) -> Result<String> {
        let choice = self
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| CompanionError::upstream(None, "response had no choices"))?;
        if let Some(reason) = choice.finish_reason.as_deref() {
            if reason == "content_filter" {
                return Err(CompanionError::upstream(None, "reply blocked by content filter"));
            }
        }
        Ok(choice.message.content.unwrap_or_default())
    }
}

pub struct OpenAiChatBackend {
    client: Client,
    model: String,
    base_url: String,
    api_key: Option<String>,
    max_output_tokens: u32,
    temperature: f32,
    timeout: Duration,
}

impl OpenAiChatBackend {
    pub fn new(settings: &ModelSettings) -> Result<Self> {
        let api_key = api_key_from_env(&settings.api_key_env);
        if api_key.is_none() {
            // Local servers (Ollama, LM Studio) accept unauthenticated requests
            warn!(
                "{} is not set; sending unauthenticated requests to {}",
                settings.api_key_env, settings.base_url
            );
        }
        Ok(Self {
            client: build_client(settings.request_timeout)?,
            model: settings.model.clone(),
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            api_key,
            max_output_tokens: settings.max_output_tokens,
            temperature: settings.temperature,
            timeout: settings.request_timeout,
        })
    }

    pub(crate) fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    /// POST a JSON body to the completions endpoint and return the text of
    /// the first choice.
    pub(crate) async fn post(&self, body: &impl Serialize) -> Result<String> {
        let mut request = self
            .client
            .post(self.endpoint())
            .header("Content-Type", "application/json");
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .json(body)
            .send()
            .await
            .map_err(|e| map_reqwest_error(e, self.timeout))?;
        let response = check_response_status(response, self.timeout).await?;

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| CompanionError::upstream(None, format!("malformed response: {e}")))?;
        parsed.into_text()
    }

    pub(crate) fn model(&self) -> &str {
        &self.model
    }

    pub(crate) fn max_output_tokens(&self) -> u32 {
        self.max_output_tokens
    }
}

fn role_name(role: PromptRole) -> &'static str {
    match role {
        PromptRole::System => "system",
        PromptRole::User => "user",
        PromptRole::Assistant => "assistant",
    }
}

#[async_trait::async_trait]
impl ModelBackend for OpenAiChatBackend {
    async fn complete(&self, context: &PromptContext) -> Result<String> {
        let request = ChatRequest {
            model: &self.model,
            messages: context
                .messages()
                .iter()
                .map(|m| ChatMessage {
                    role: role_name(m.role),
                    content: &m.content,
                })
                .collect(),
            max_tokens: self.max_output_tokens,
            temperature: self.temperature,
            stream: false,
        };
        debug!(
            "Chat completion: model={} messages={}",
            self.model,
            request.messages.len()
        );
        self.post(&request).await
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}
