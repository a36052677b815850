use cyder_tools::log::warn;
use reqwest::{
    header::{HeaderMap, RETRY_AFTER},
    StatusCode,
};
use serde_json::Value;
use thiserror::Error;

const MAX_UPSTREAM_MESSAGE: usize = 300;

/// Upstream failures, normalized across provider families.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProviderError {
    #[error("provider rate limited: {message}")]
    RateLimited {
        retry_after: Option<u64>,
        message: String,
    },
    #[error("provider rejected the API key: {0}")]
    InvalidKey(String),
    #[error("provider account quota exhausted: {0}")]
    UpstreamQuotaExceeded(String),
    #[error("provider temporarily unavailable: {0}")]
    Transient(String),
    #[error("provider error: {0}")]
    Unknown(String),
}

impl ProviderError {
    pub fn kind(&self) -> &'static str {
        match self {
            ProviderError::RateLimited { .. } => "provider_rate_limited",
            ProviderError::InvalidKey(_) => "provider_invalid_key",
            ProviderError::UpstreamQuotaExceeded(_) => "provider_quota_exceeded",
            ProviderError::Transient(_) => "provider_transient",
            ProviderError::Unknown(_) => "provider_error",
        }
    }

    /// Whether opening the stream again may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Transient(_))
    }
}

/// Transport failures carry the upstream URL, so only a fixed message leaves
/// the gateway. The full error goes to the log.
impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        warn!("request to provider failed: {}", err);
        let message = if err.is_timeout() {
            "provider timed out"
        } else if err.is_body() || err.is_decode() {
            "provider stream interrupted"
        } else {
            "provider unreachable"
        };
        ProviderError::Transient(message.to_string())
    }
}

pub fn parse_retry_after(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
}

/// Pulls a human readable message out of a provider error body. All three
/// families nest it as `error.message`; some proxies use a top-level `message`.
pub fn upstream_message(body: &str) -> String {
    let message = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            v.pointer("/error/message")
                .or_else(|| v.get("message"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.trim().to_string());
    truncate(message)
}

fn truncate(mut message: String) -> String {
    if message.len() > MAX_UPSTREAM_MESSAGE {
        let mut end = MAX_UPSTREAM_MESSAGE;
        while !message.is_char_boundary(end) {
            end -= 1;
        }
        message.truncate(end);
        message.push_str("...");
    }
    message
}

/// Maps a non-success HTTP response to the error taxonomy.
pub fn map_http_error(status: StatusCode, retry_after: Option<u64>, body: &str) -> ProviderError {
    let message = upstream_message(body);
    match status.as_u16() {
        429 if body.contains("insufficient_quota") => ProviderError::UpstreamQuotaExceeded(message),
        429 => ProviderError::RateLimited {
            retry_after,
            message,
        },
        401 | 403 => ProviderError::InvalidKey(message),
        402 => ProviderError::UpstreamQuotaExceeded(message),
        408 | 500..=599 => ProviderError::Transient(format!("HTTP {}: {}", status.as_u16(), message)),
        _ => ProviderError::Unknown(format!("HTTP {}: {}", status.as_u16(), message)),
    }
}

/// Maps an error type carried inside a stream event. OpenAI and Anthropic use
/// snake_case type names, Gemini uses gRPC status names.
pub fn map_error_type(error_type: &str, message: &str) -> ProviderError {
    let message = truncate(message.to_string());
    match error_type {
        "rate_limit_error" | "rate_limit_exceeded" | "RESOURCE_EXHAUSTED" => {
            ProviderError::RateLimited {
                retry_after: None,
                message,
            }
        }
        "insufficient_quota" | "billing_error" => ProviderError::UpstreamQuotaExceeded(message),
        "authentication_error" | "permission_error" | "invalid_api_key" | "UNAUTHENTICATED"
        | "PERMISSION_DENIED" => ProviderError::InvalidKey(message),
        "overloaded_error" | "api_error" | "server_error" | "timeout_error" | "UNAVAILABLE"
        | "INTERNAL" | "DEADLINE_EXCEEDED" => ProviderError::Transient(message),
        _ => ProviderError::Unknown(message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_status_mapping() {
        let err = map_http_error(
            StatusCode::TOO_MANY_REQUESTS,
            Some(12),
            r#"{"error":{"message":"Rate limit reached"}}"#,
        );
        assert_eq!(
            err,
            ProviderError::RateLimited {
                retry_after: Some(12),
                message: "Rate limit reached".to_string()
            }
        );

        let err = map_http_error(
            StatusCode::TOO_MANY_REQUESTS,
            None,
            r#"{"error":{"type":"insufficient_quota","message":"You exceeded your current quota"}}"#,
        );
        assert_eq!(err.kind(), "provider_quota_exceeded");

        assert_eq!(map_http_error(StatusCode::UNAUTHORIZED, None, "").kind(), "provider_invalid_key");
        assert!(map_http_error(StatusCode::BAD_GATEWAY, None, "oops").is_transient());
        assert!(map_http_error(StatusCode::from_u16(529).unwrap(), None, "").is_transient());
        assert_eq!(map_http_error(StatusCode::BAD_REQUEST, None, "bad").kind(), "provider_error");
    }

    #[test]
    fn retry_after_header_is_parsed() {
        let mut headers = HeaderMap::new();
        assert_eq!(parse_retry_after(&headers), None);
        headers.insert(RETRY_AFTER, "30".parse().unwrap());
        assert_eq!(parse_retry_after(&headers), Some(30));
    }

    #[test]
    fn stream_error_types() {
        assert_eq!(map_error_type("overloaded_error", "busy").kind(), "provider_transient");
        assert_eq!(map_error_type("RESOURCE_EXHAUSTED", "slow").kind(), "provider_rate_limited");
        assert_eq!(map_error_type("PERMISSION_DENIED", "no").kind(), "provider_invalid_key");
        assert_eq!(map_error_type("something_new", "?").kind(), "provider_error");
    }

    #[tokio::test]
    async fn transport_errors_hide_the_upstream_url() {
        let err = reqwest::Client::new()
            .get("http://127.0.0.1:1/v1/secret-path?key=abc")
            .send()
            .await
            .unwrap_err();
        let err = ProviderError::from(err);
        assert!(err.is_transient());
        let text = err.to_string();
        assert!(!text.contains("secret-path"));
        assert!(!text.contains("127.0.0.1"));
        assert_eq!(text, "provider temporarily unavailable: provider unreachable");
    }

    #[test]
    fn long_messages_are_truncated() {
        let body = "x".repeat(1000);
        let message = upstream_message(&body);
        assert!(message.len() <= MAX_UPSTREAM_MESSAGE + 3);
        assert!(message.ends_with("..."));
    }
}
