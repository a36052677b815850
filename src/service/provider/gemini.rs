use async_trait::async_trait;
use cyder_tools::log::debug;
use serde_json::{json, Value};

use super::error::map_error_type;
use super::http::{send_streaming, sse_chunks, EventDecoder};
use super::{ChatRequest, ChunkStream, ModelRoute, ProviderAdapter, ProviderError, TokenChunk};
use crate::schema::enum_def::{MessageRole, ProviderType};
use crate::utils::billing::UsageInfo;
use crate::utils::sse::SseEvent;

/// Gemini `:streamGenerateContent` over SSE.
pub struct GeminiAdapter {
    client: reqwest::Client,
}

impl GeminiAdapter {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

pub fn build_body(request: &ChatRequest) -> Value {
    let contents: Vec<Value> = request
        .turns()
        .map(|m| {
            let role = if m.role == MessageRole::Assistant { "model" } else { "user" };
            json!({ "role": role, "parts": [{ "text": m.content }] })
        })
        .collect();
    let mut generation_config = json!({ "maxOutputTokens": request.max_tokens });
    if let Some(temperature) = request.temperature {
        generation_config["temperature"] = json!(temperature);
    }
    let mut body = json!({
        "contents": contents,
        "generationConfig": generation_config,
    });
    if let Some(system) = request.system_prompt() {
        body["systemInstruction"] = json!({ "parts": [{ "text": system }] });
    }
    body
}

#[async_trait]
impl ProviderAdapter for GeminiAdapter {
    fn provider_type(&self) -> ProviderType {
        ProviderType::Gemini
    }

    async fn stream(
        &self,
        route: &ModelRoute,
        request: &ChatRequest,
    ) -> Result<ChunkStream, ProviderError> {
        let url = route.endpoint(&format!(
            "/v1beta/models/{}:streamGenerateContent?alt=sse",
            route.upstream_model
        ));
        debug!("[gemini] POST {}", url);
        let builder = self
            .client
            .post(&url)
            .header("x-goog-api-key", &route.api_key)
            .json(&build_body(request));
        let response = send_streaming(self, builder).await?;
        Ok(sse_chunks(response, GeminiDecoder::default()))
    }
}

/// Gemini has no explicit end marker: the last chunk carries `finishReason`
/// and the body then closes.
#[derive(Default)]
pub struct GeminiDecoder {
    usage: Option<UsageInfo>,
    finished: bool,
}

impl EventDecoder for GeminiDecoder {
    fn decode(&mut self, event: SseEvent) -> Vec<Result<TokenChunk, ProviderError>> {
        if event.data.trim().is_empty() {
            return Vec::new();
        }
        let value: Value = match serde_json::from_str(&event.data) {
            Ok(v) => v,
            Err(e) => {
                return vec![Err(ProviderError::Unknown(format!(
                    "malformed stream chunk: {}",
                    e
                )))];
            }
        };

        if let Some(error) = value.get("error") {
            let status = error.get("status").and_then(Value::as_str).unwrap_or("");
            let message = error.get("message").and_then(Value::as_str).unwrap_or("upstream error");
            return vec![Err(map_error_type(status, message))];
        }

        let mut out = Vec::new();
        if let Some(candidate) = value.pointer("/candidates/0") {
            let text: String = candidate
                .pointer("/content/parts")
                .and_then(Value::as_array)
                .map(|parts| {
                    parts
                        .iter()
                        .filter_map(|p| p.get("text").and_then(Value::as_str))
                        .collect()
                })
                .unwrap_or_default();
            if !text.is_empty() {
                out.push(Ok(TokenChunk::Content(text)));
            }
            if candidate.get("finishReason").is_some_and(|r| !r.is_null()) {
                self.finished = true;
            }
        }
        if let Some(metadata) = value.get("usageMetadata") {
            let field = |name: &str| metadata.get(name).and_then(Value::as_i64).unwrap_or(0) as i32;
            let mut usage = UsageInfo::new(field("promptTokenCount"), field("candidatesTokenCount"));
            usage.total_tokens = usage.total_tokens.max(field("totalTokenCount"));
            self.usage = Some(usage);
            out.push(Ok(TokenChunk::Usage(usage)));
        }
        out
    }

    fn finish(&mut self) -> Result<TokenChunk, ProviderError> {
        if self.finished {
            Ok(TokenChunk::Done(self.usage))
        } else {
            Err(ProviderError::Transient(
                "provider closed the stream before a finish reason".to_string(),
            ))
        }
    }
}
