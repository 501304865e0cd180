//! Google Gemini `generateContent` backend

use super::http::{api_key_from_env, build_client, check_response_status, map_reqwest_error};
use super::ModelBackend;
use crate::context::{PromptContext, PromptRole};
use crate::{CompanionError, ModelSettings, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest<'a> {
    system_instruction: GeminiContent<'a>,
    contents: Vec<GeminiContent<'a>>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
struct GeminiContent<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'static str>,
    parts: Vec<TextPart<'a>>,
}

#[derive(Debug, Serialize)]
struct TextPart<'a> {
    text: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    max_output_tokens: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    #[serde(default)]
    block_reason: Option<String>,
}

impl GenerateResponse {
    fn into_text(self) -> Result<String> {
        if let Some(reason) = self.prompt_feedback.and_then(|f| f.block_reason) {
            return Err(CompanionError::upstream(None, format!("prompt blocked: {reason}")));
        }
        let candidate = self
            .candidates
            .into_iter()
            .next()
            .ok_or_else(|| CompanionError::upstream(None, "response had no candidates"))?;
        if candidate.finish_reason.as_deref() == Some("SAFETY") {
            return Err(CompanionError::upstream(None, "reply blocked by safety filter"));
        }
        Ok(candidate
            .content
            .map(|c| {
                c.parts
                    .into_iter()
                    .filter_map(|p| p.text)
                    .collect::<String>()
            })
            .unwrap_or_default())
    }
}

pub struct GeminiBackend {
    client: Client,
    model: String,
    base_url: String,
    api_key: String,
    max_output_tokens: u32,
    temperature: f32,
    timeout: Duration,
}

impl GeminiBackend {
    pub fn new(settings: &ModelSettings) -> Result<Self> {
        let api_key = api_key_from_env(&settings.api_key_env).ok_or_else(|| {
            CompanionError::Configuration(format!("{} is not set", settings.api_key_env))
        })?;
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

    fn endpoint(&self, model: &str) -> String {
        format!("{}/models/{}:generateContent", self.base_url, model)
    }

    /// POST a JSON body to `generateContent` for `model` and return the
    /// concatenated text of the first candidate.
    pub(crate) async fn post(&self, model: &str, body: &impl Serialize) -> Result<String> {
        let response = self
            .client
            .post(self.endpoint(model))
            .header("Content-Type", "application/json")
            .header("x-goog-api-key", &self.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| map_reqwest_error(e, self.timeout))?;
        let response = check_response_status(response, self.timeout).await?;

        let parsed: GenerateResponse = response
            .json()
            .await
            .map_err(|e| CompanionError::upstream(None, format!("malformed response: {e}")))?;
        parsed.into_text()
    }

    pub(crate) fn max_output_tokens(&self) -> u32 {
        self.max_output_tokens
    }

    fn build_request<'a>(&self, context: &'a PromptContext) -> GenerateRequest<'a> {
        let contents = context
            .turns()
            .iter()
            .map(|m| GeminiContent {
                role: Some(match m.role {
                    PromptRole::Assistant => "model",
                    _ => "user",
                }),
                parts: vec![TextPart { text: &m.content }],
            })
            .collect();

        GenerateRequest {
            system_instruction: GeminiContent {
                role: None,
                parts: vec![TextPart {
                    text: context.system(),
                }],
            },
            contents,
            generation_config: GenerationConfig {
                temperature: self.temperature,
                max_output_tokens: self.max_output_tokens,
            },
        }
    }
}

#[async_trait::async_trait]
impl ModelBackend for GeminiBackend {
    async fn complete(&self, context: &PromptContext) -> Result<String> {
        let request = self.build_request(context);
        debug!(
            "Gemini generateContent: model={} contents={}",
            self.model,
            request.contents.len()
        );
        self.post(&self.model, &request).await
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}
