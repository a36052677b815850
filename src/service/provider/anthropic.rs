use async_trait::async_trait;
use cyder_tools::log::debug;
use serde_json::{json, Value};

use super::error::map_error_type;
use super::http::{send_streaming, sse_chunks, EventDecoder};
use super::{ChatRequest, ChunkStream, ModelRoute, ProviderAdapter, ProviderError, TokenChunk};
use crate::schema::enum_def::{MessageRole, ProviderType};
use crate::utils::billing::UsageInfo;
use crate::utils::sse::SseEvent;

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Anthropic-compatible `/v1/messages` streaming.
pub struct AnthropicAdapter {
    client: reqwest::Client,
}

impl AnthropicAdapter {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

/// The Messages API wants strictly alternating turns that open with the
/// user. Consecutive same-role turns are merged and leading assistant turns
/// (left over from a truncated history) are dropped.
fn alternating_turns(request: &ChatRequest) -> Vec<(MessageRole, String)> {
    let mut turns: Vec<(MessageRole, String)> = Vec::new();
    for message in request.turns() {
        if turns.is_empty() && message.role == MessageRole::Assistant {
            continue;
        }
        match turns.last_mut() {
            Some((role, content)) if *role == message.role => {
                content.push_str("\n\n");
                content.push_str(&message.content);
            }
            _ => turns.push((message.role, message.content.clone())),
        }
    }
    turns
}

pub fn build_body(route: &ModelRoute, request: &ChatRequest) -> Value {
    let messages: Vec<Value> = alternating_turns(request)
        .into_iter()
        .map(|(role, content)| {
            let role = if role == MessageRole::Assistant { "assistant" } else { "user" };
            json!({ "role": role, "content": content })
        })
        .collect();
    let mut body = json!({
        "model": route.upstream_model,
        "messages": messages,
        "max_tokens": request.max_tokens,
        "stream": true,
    });
    if let Some(system) = request.system_prompt() {
        body["system"] = json!(system);
    }
    if let Some(temperature) = request.temperature {
        body["temperature"] = json!(temperature);
    }
    body
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    fn provider_type(&self) -> ProviderType {
        ProviderType::Anthropic
    }

    async fn stream(
        &self,
        route: &ModelRoute,
        request: &ChatRequest,
    ) -> Result<ChunkStream, ProviderError> {
        let url = route.endpoint("/v1/messages");
        let body = build_body(route, request);
        debug!("[anthropic] POST {} model {}", url, route.upstream_model);
        let builder = self
            .client
            .post(&url)
            .header("x-api-key", &route.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body);
        let response = send_streaming(self, builder).await?;
        Ok(sse_chunks(response, AnthropicDecoder::default()))
    }
}

#[derive(Default)]
pub struct AnthropicDecoder {
    usage: UsageInfo,
    reported: bool,
    stopped: bool,
}

impl AnthropicDecoder {
    fn report(&mut self, input: Option<i64>, output: Option<i64>) -> Option<TokenChunk> {
        if input.is_none() && output.is_none() {
            return None;
        }
        self.usage.merge(UsageInfo::new(
            input.unwrap_or(0) as i32,
            output.unwrap_or(0) as i32,
        ));
        self.reported = true;
        Some(TokenChunk::Usage(self.usage))
    }

    fn final_usage(&self) -> Option<UsageInfo> {
        self.reported.then_some(self.usage)
    }
}

impl EventDecoder for AnthropicDecoder {
    fn decode(&mut self, event: SseEvent) -> Vec<Result<TokenChunk, ProviderError>> {
        if event.data.trim().is_empty() {
            return Vec::new();
        }
        let value: Value = match serde_json::from_str(&event.data) {
            Ok(v) => v,
            Err(e) => {
                return vec![Err(ProviderError::Unknown(format!(
                    "malformed stream event: {}",
                    e
                )))];
            }
        };
        let event_type = event
            .event
            .as_deref()
            .or_else(|| value.get("type").and_then(Value::as_str))
            .unwrap_or("");

        match event_type {
            "message_start" => {
                let usage = value.pointer("/message/usage");
                let field = |name: &str| usage.and_then(|u| u.get(name)).and_then(Value::as_i64);
                self.report(field("input_tokens"), field("output_tokens"))
                    .map(Ok)
                    .into_iter()
                    .collect()
            }
            "content_block_delta" => {
                let delta = value.get("delta");
                let is_text = delta
                    .and_then(|d| d.get("type"))
                    .and_then(Value::as_str)
                    .is_some_and(|t| t == "text_delta");
                match delta.and_then(|d| d.get("text")).and_then(Value::as_str) {
                    Some(text) if is_text && !text.is_empty() => {
                        vec![Ok(TokenChunk::Content(text.to_string()))]
                    }
                    _ => Vec::new(),
                }
            }
            "message_delta" => {
                if value.pointer("/delta/stop_reason").is_some_and(|r| !r.is_null()) {
                    self.stopped = true;
                }
                let usage = value.get("usage");
                let field = |name: &str| usage.and_then(|u| u.get(name)).and_then(Value::as_i64);
                self.report(field("input_tokens"), field("output_tokens"))
                    .map(Ok)
                    .into_iter()
                    .collect()
            }
            "message_stop" => vec![Ok(TokenChunk::Done(self.final_usage()))],
            "error" => {
                let error_type = value.pointer("/error/type").and_then(Value::as_str).unwrap_or("");
                let message = value
                    .pointer("/error/message")
                    .and_then(Value::as_str)
                    .unwrap_or("upstream error");
                vec![Err(map_error_type(error_type, message))]
            }
            _ => Vec::new(),
        }
    }

    fn finish(&mut self) -> Result<TokenChunk, ProviderError> {
        if self.stopped {
            Ok(TokenChunk::Done(self.final_usage()))
        } else {
            Err(ProviderError::Transient(
                "provider closed the stream before message_stop".to_string(),
            ))
        }
    }
}
