//! Loading `CompanionConfig` from `<data_dir>/config.toml`
//!
//! **Model name** (precedence):
//!   1. `[model] model` in config.toml
//!   2. `COMPANION_MODEL` environment variable
//!   3. the provider default
//!
//! API keys are never read from the file, only from the environment variable
//! named by `api_key_env`.

use crate::{
    CancelPolicy, CompanionConfig, CompanionError, ModelProvider, ModelSettings, Result,
};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

pub const CONFIG_FILE: &str = "config.toml";
pub const MODEL_ENV: &str = "COMPANION_MODEL";
pub const HOME_ENV: &str = "COMPANION_HOME";
/// Upper bound for `[model] temperature`. Decoding stays low-temperature.
pub const MAX_TEMPERATURE: f32 = 0.5;

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigToml {
    model: Option<ModelToml>,
    conversation: Option<ConversationToml>,
    speech: Option<SpeechToml>,
    vision: Option<VisionToml>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ModelToml {
    provider: Option<ModelProvider>,
    model: Option<String>,
    base_url: Option<String>,
    api_key_env: Option<String>,
    max_output_tokens: Option<u32>,
    temperature: Option<f32>,
    request_timeout_secs: Option<u64>,
    retry_delay_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConversationToml {
    window_size: Option<usize>,
    persist_timeout_ms: Option<u64>,
    on_cancel: Option<CancelPolicy>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct SpeechToml {
    region: Option<String>,
    key_env: Option<String>,
    voice: Option<String>,
    language: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct VisionToml {
    model: Option<String>,
    max_dimension: Option<u32>,
    max_bytes: Option<usize>,
}

/// `$COMPANION_HOME`, else `~/.companion`
pub fn default_data_dir() -> Result<PathBuf> {
    if let Ok(home) = std::env::var(HOME_ENV) {
        if !home.trim().is_empty() {
            return Ok(PathBuf::from(home));
        }
    }
    let home = dirs::home_dir()
        .ok_or_else(|| CompanionError::Configuration("could not find home directory".into()))?;
    Ok(home.join(".companion"))
}

/// Read `<data_dir>/config.toml` (optional) and apply environment overrides.
pub async fn load(data_dir: &Path) -> Result<CompanionConfig> {
    let env_model = std::env::var(MODEL_ENV)
        .ok()
        .filter(|m| !m.trim().is_empty());
    load_with_env(data_dir, env_model).await
}

async fn load_with_env(data_dir: &Path, env_model: Option<String>) -> Result<CompanionConfig> {
    let path = data_dir.join(CONFIG_FILE);
    let file = match tokio::fs::read_to_string(&path).await {
        Ok(content) => toml::from_str::<ConfigToml>(&content)
            .map_err(|e| CompanionError::Configuration(format!("{}: {e}", path.display())))?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("No {} found, using defaults", path.display());
            ConfigToml::default()
        }
        Err(e) => return Err(e.into()),
    };
    Ok(resolve(data_dir.to_path_buf(), file, env_model))
}

fn resolve(data_dir: PathBuf, file: ConfigToml, env_model: Option<String>) -> CompanionConfig {
    let mut config = CompanionConfig::new(data_dir);

    let model_toml = file.model.unwrap_or_default();
    let mut model = ModelSettings::for_provider(model_toml.provider.unwrap_or_default());
    if let Some(name) = model_toml.model.or(env_model) {
        model.model = name;
    }
    if let Some(url) = model_toml.base_url {
        model.base_url = url;
    }
    if let Some(env) = model_toml.api_key_env {
        model.api_key_env = env;
    }
    if let Some(tokens) = model_toml.max_output_tokens {
        model.max_output_tokens = tokens.max(1);
    }
    if let Some(temperature) = model_toml.temperature {
        model.temperature = temperature.clamp(0.0, MAX_TEMPERATURE);
    }
    if let Some(secs) = model_toml.request_timeout_secs {
        model.request_timeout = Duration::from_secs(secs.max(1));
    }
    if let Some(ms) = model_toml.retry_delay_ms {
        model.retry_delay = Duration::from_millis(ms);
    }
    config = config.with_model(model);

    if let Some(conversation) = file.conversation {
        if let Some(size) = conversation.window_size {
            config = config.with_window_size(size);
        }
        if let Some(ms) = conversation.persist_timeout_ms {
            config = config.with_persist_timeout(Duration::from_millis(ms.max(1)));
        }
        if let Some(policy) = conversation.on_cancel {
            config = config.with_cancel_policy(policy);
        }
    }

    if let Some(speech) = file.speech {
        config.speech.region = speech.region.or(config.speech.region);
        if let Some(key_env) = speech.key_env {
            config.speech.key_env = key_env;
        }
        if let Some(voice) = speech.voice {
            config.speech.voice = voice;
        }
        if let Some(language) = speech.language {
            config.speech.language = language;
        }
    }

    if let Some(vision) = file.vision {
        config.vision.model = vision.model.or(config.vision.model);
        if let Some(dim) = vision.max_dimension {
            config.vision.max_dimension = dim.max(1);
        }
        if let Some(bytes) = vision.max_bytes {
            config.vision.max_bytes = bytes;
        }
    }

    config
}
