use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use cyder_tools::log::info;
use futures::stream::BoxStream;
use reqwest::StatusCode;
use serde::Serialize;

use crate::config::ProviderConfig;
use crate::controller::error::GatewayError;
use crate::schema::enum_def::{MessageRole, ProviderType};
use crate::utils::billing::{self, Pricing, UsageInfo};

pub mod anthropic;
pub mod error;
pub mod gemini;
pub mod http;
pub mod openai;

#[cfg(test)]
pub mod scripted;

pub use error::ProviderError;

/// One item of a provider stream.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenChunk {
    Content(String),
    /// Partial or cumulative usage reported mid-stream.
    Usage(UsageInfo),
    /// Terminal marker, with the final usage when the provider reported one.
    Done(Option<UsageInfo>),
}

pub type ChunkStream = BoxStream<'static, Result<TokenChunk, ProviderError>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptMessage {
    pub role: MessageRole,
    pub content: String,
}

impl PromptMessage {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Provider-neutral chat request. System messages come first.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub messages: Vec<PromptMessage>,
    pub max_tokens: i32,
    pub temperature: Option<f32>,
}

impl ChatRequest {
    pub fn system_prompt(&self) -> Option<String> {
        let parts: Vec<&str> = self
            .messages
            .iter()
            .filter(|m| m.role == MessageRole::System)
            .map(|m| m.content.as_str())
            .collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join("\n\n"))
        }
    }

    pub fn turns(&self) -> impl Iterator<Item = &PromptMessage> {
        self.messages.iter().filter(|m| m.role != MessageRole::System)
    }

    pub fn estimated_input_tokens(&self) -> i32 {
        billing::estimate_input_tokens(self.messages.iter().map(|m| m.content.chars().count()))
    }
}

/// Everything needed to call one model on one provider.
#[derive(Debug, Clone)]
pub struct ModelRoute {
    pub provider_key: String,
    pub provider_type: ProviderType,
    pub model_name: String,
    pub upstream_model: String,
    pub base_url: String,
    pub api_key: String,
    pub pricing: Pricing,
    pub max_output_tokens: Option<i32>,
}

impl ModelRoute {
    pub fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }
}

#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn provider_type(&self) -> ProviderType;

    /// Opens the upstream stream. Chunks are produced lazily as the caller
    /// polls; dropping the stream aborts the upstream request.
    async fn stream(
        &self,
        route: &ModelRoute,
        request: &ChatRequest,
    ) -> Result<ChunkStream, ProviderError>;

    /// Upper-bound cost of `request`: estimated prompt plus the whole output allowance.
    fn estimate_cost(&self, route: &ModelRoute, request: &ChatRequest) -> i64 {
        billing::estimate_cost(
            request.estimated_input_tokens(),
            request.max_tokens,
            &route.pricing,
        )
    }

    fn map_error(&self, status: StatusCode, retry_after: Option<u64>, body: &str) -> ProviderError {
        error::map_http_error(status, retry_after, body)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelInfo {
    pub name: String,
    pub provider: String,
    pub provider_type: ProviderType,
    pub max_output_tokens: Option<i32>,
}

/// Maps client-facing model names to an adapter and its route.
#[derive(Default)]
pub struct ProviderRouter {
    routes: HashMap<String, (Arc<dyn ProviderAdapter>, ModelRoute)>,
    order: Vec<String>,
}

impl ProviderRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(
        providers: &[ProviderConfig],
        proxy: Option<&str>,
    ) -> Result<Self, GatewayError> {
        let mut router = Self::new();
        for provider in providers {
            let client = http::build_http_client(provider.use_proxy, proxy)
                .map_err(GatewayError::Internal)?;
            let adapter: Arc<dyn ProviderAdapter> = match provider.provider_type {
                ProviderType::Openai => Arc::new(openai::OpenAiAdapter::new(client)),
                ProviderType::Anthropic => Arc::new(anthropic::AnthropicAdapter::new(client)),
                ProviderType::Gemini => Arc::new(gemini::GeminiAdapter::new(client)),
            };
            for model in &provider.models {
                let route = ModelRoute {
                    provider_key: provider.key.clone(),
                    provider_type: provider.provider_type,
                    model_name: model.name.clone(),
                    upstream_model: model
                        .upstream_name
                        .clone()
                        .filter(|s| !s.is_empty())
                        .unwrap_or_else(|| model.name.clone()),
                    base_url: provider.base_url.clone(),
                    api_key: provider.api_key.clone(),
                    pricing: model.pricing,
                    max_output_tokens: model.max_output_tokens,
                };
                router.register(adapter.clone(), route)?;
            }
            info!(
                "provider '{}' ({}) registered with {} model(s)",
                provider.key,
                provider.provider_type,
                provider.models.len()
            );
        }
        Ok(router)
    }

    pub fn register(
        &mut self,
        adapter: Arc<dyn ProviderAdapter>,
        route: ModelRoute,
    ) -> Result<(), GatewayError> {
        if self.routes.contains_key(&route.model_name) {
            return Err(GatewayError::Internal(format!(
                "model '{}' is configured more than once",
                route.model_name
            )));
        }
        self.order.push(route.model_name.clone());
        self.routes.insert(route.model_name.clone(), (adapter, route));
        Ok(())
    }

    pub fn route(&self, model_name: &str) -> Result<(Arc<dyn ProviderAdapter>, ModelRoute), GatewayError> {
        self.routes
            .get(model_name)
            .map(|(adapter, route)| (adapter.clone(), route.clone()))
            .ok_or_else(|| GatewayError::UnknownModel(model_name.to_string()))
    }

    pub fn models(&self) -> Vec<ModelInfo> {
        self.order
            .iter()
            .filter_map(|name| self.routes.get(name))
            .map(|(_, route)| ModelInfo {
                name: route.model_name.clone(),
                provider: route.provider_key.clone(),
                provider_type: route.provider_type,
                max_output_tokens: route.max_output_tokens,
            })
            .collect()
    }
}
