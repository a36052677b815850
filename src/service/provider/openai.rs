use async_trait::async_trait;
use cyder_tools::log::debug;
use serde_json::{json, Value};

use super::error::map_error_type;
use super::http::{send_streaming, sse_chunks, EventDecoder};
use super::{ChatRequest, ChunkStream, ModelRoute, ProviderAdapter, ProviderError, TokenChunk};
use crate::schema::enum_def::{MessageRole, ProviderType};
use crate::utils::billing::UsageInfo;
use crate::utils::sse::SseEvent;

/// OpenAI-compatible `/v1/chat/completions` streaming.
pub struct OpenAiAdapter {
    client: reqwest::Client,
}

impl OpenAiAdapter {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

fn role_name(role: MessageRole) -> &'static str {
    match role {
        MessageRole::System => "system",
        MessageRole::User => "user",
        MessageRole::Assistant => "assistant",
    }
}

pub fn build_body(route: &ModelRoute, request: &ChatRequest) -> Value {
    let messages: Vec<Value> = request
        .messages
        .iter()
        .map(|m| json!({ "role": role_name(m.role), "content": m.content }))
        .collect();
    let mut body = json!({
        "model": route.upstream_model,
        "messages": messages,
        "stream": true,
        "stream_options": { "include_usage": true },
        "max_tokens": request.max_tokens,
    });
    if let Some(temperature) = request.temperature {
        body["temperature"] = json!(temperature);
    }
    body
}

#[async_trait]
impl ProviderAdapter for OpenAiAdapter {
    fn provider_type(&self) -> ProviderType {
        ProviderType::Openai
    }

    async fn stream(
        &self,
        route: &ModelRoute,
        request: &ChatRequest,
    ) -> Result<ChunkStream, ProviderError> {
        let url = route.endpoint("/v1/chat/completions");
        let body = build_body(route, request);
        debug!("[openai] POST {} model {}", url, route.upstream_model);
        let builder = self
            .client
            .post(&url)
            .bearer_auth(&route.api_key)
            .json(&body);
        let response = send_streaming(self, builder).await?;
        Ok(sse_chunks(response, OpenAiDecoder::default()))
    }
}

#[derive(Default)]
pub struct OpenAiDecoder {
    usage: Option<UsageInfo>,
    finished: bool,
}

impl EventDecoder for OpenAiDecoder {
    fn decode(&mut self, event: SseEvent) -> Vec<Result<TokenChunk, ProviderError>> {
        let data = event.data.trim();
        if data.is_empty() {
            return Vec::new();
        }
        if data == "[DONE]" {
            return vec![Ok(TokenChunk::Done(self.usage))];
        }

        let value: Value = match serde_json::from_str(data) {
            Ok(v) => v,
            Err(e) => {
                return vec![Err(ProviderError::Unknown(format!(
                    "malformed stream chunk: {}",
                    e
                )))];
            }
        };

        if let Some(error) = value.get("error") {
            let message = error.get("message").and_then(Value::as_str).unwrap_or("upstream error");
            let error_type = error
                .get("code")
                .and_then(Value::as_str)
                .or_else(|| error.get("type").and_then(Value::as_str))
                .unwrap_or("");
            return vec![Err(map_error_type(error_type, message))];
        }

        let mut out = Vec::new();
        if let Some(choice) = value.pointer("/choices/0") {
            if let Some(text) = choice.pointer("/delta/content").and_then(Value::as_str) {
                if !text.is_empty() {
                    out.push(Ok(TokenChunk::Content(text.to_string())));
                }
            }
            if choice.get("finish_reason").is_some_and(|r| !r.is_null()) {
                self.finished = true;
            }
        }
        if let Some(usage) = value.get("usage").filter(|u| !u.is_null()) {
            let field = |name: &str| usage.get(name).and_then(Value::as_i64).unwrap_or(0) as i32;
            let mut reported = UsageInfo::new(field("prompt_tokens"), field("completion_tokens"));
            reported.total_tokens = reported.total_tokens.max(field("total_tokens"));
            let merged = match self.usage {
                Some(mut current) => {
                    current.merge(reported);
                    current
                }
                None => reported,
            };
            self.usage = Some(merged);
            out.push(Ok(TokenChunk::Usage(merged)));
        }
        out
    }

    fn finish(&mut self) -> Result<TokenChunk, ProviderError> {
        if self.finished {
            Ok(TokenChunk::Done(self.usage))
        } else {
            Err(ProviderError::Transient(
                "provider closed the stream before completion".to_string(),
            ))
        }
    }
}
