//! HTTP plumbing shared by the model backends

use crate::{CompanionError, Result};
use reqwest::{Client, StatusCode};
use std::time::Duration;

/// Cap on backend error detail carried in errors
const MAX_ERROR_DETAIL_CHARS: usize = 500;

pub(crate) fn build_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .timeout(timeout)
        .connect_timeout(Duration::from_secs(10))
        .user_agent(concat!("companion/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| CompanionError::Configuration(format!("http client: {e}")))
}

/// Turn a non-2xx response into the matching typed error.
pub(crate) async fn check_response_status(
    response: reqwest::Response,
    timeout: Duration,
) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after);
        return Err(CompanionError::RateLimit { retry_after });
    }
    if status == StatusCode::REQUEST_TIMEOUT || status == StatusCode::GATEWAY_TIMEOUT {
        return Err(CompanionError::Timeout(timeout));
    }

    let body = response.text().await.unwrap_or_default();
    let detail = truncate_error_detail(&extract_error_detail(&body), MAX_ERROR_DETAIL_CHARS);
    let detail = if detail.is_empty() {
        status
            .canonical_reason()
            .unwrap_or("request failed")
            .to_string()
    } else {
        detail
    };
    Err(CompanionError::upstream(Some(status.as_u16()), detail))
}

/// Retry-After in delta-seconds form; HTTP dates are ignored.
pub(crate) fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

pub(crate) fn extract_error_detail(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return String::new();
    }

    if let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) {
        if let Some(msg) = value
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(|m| m.as_str())
        {
            return msg.to_string();
        }
        if let Some(msg) = value.get("message").and_then(|m| m.as_str()) {
            return msg.to_string();
        }
        if let Some(msg) = value.get("error").and_then(|e| e.as_str()) {
            return msg.to_string();
        }
    }

    trimmed.to_string()
}

pub(crate) fn truncate_error_detail(detail: &str, max_chars: usize) -> String {
    if detail.chars().count() <= max_chars {
        return detail.to_string();
    }

    let mut truncated = detail.chars().take(max_chars).collect::<String>();
    truncated.push_str("... [truncated]");
    truncated
}

pub(crate) fn map_reqwest_error(e: reqwest::Error, timeout: Duration) -> CompanionError {
    if e.is_timeout() {
        CompanionError::Timeout(timeout)
    } else if e.is_connect() {
        CompanionError::upstream(None, format!("network: {e}"))
    } else {
        CompanionError::upstream(e.status().map(|s| s.as_u16()), e.to_string())
    }
}

/// Read the API key named by `env_key`; `None` if unset or blank.
pub(crate) fn api_key_from_env(env_key: &str) -> Option<String> {
    std::env::var(env_key)
        .ok()
        .map(|k| k.trim().to_string())
        .filter(|k| !k.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_error_detail_shapes() {
        assert_eq!(
            extract_error_detail(r#"{"error":{"message":"quota exceeded","code":429}}"#),
            "quota exceeded"
        );
        assert_eq!(extract_error_detail(r#"{"message":"bad key"}"#), "bad key");
        assert_eq!(extract_error_detail(r#"{"error":"nope"}"#), "nope");
        assert_eq!(extract_error_detail("  plain text  "), "plain text");
        assert_eq!(extract_error_detail(""), "");
    }

    #[test]
    fn test_truncate_error_detail() {
        assert_eq!(truncate_error_detail("short", 10), "short");
        assert_eq!(truncate_error_detail("abcdef", 3), "abc... [truncated]");
    }

    #[test]
    fn test_parse_retry_after() {
        assert_eq!(parse_retry_after("7"), Some(Duration::from_secs(7)));
        assert_eq!(parse_retry_after(" 0 "), Some(Duration::from_secs(0)));
        assert_eq!(parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"), None);
    }
}
