use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::{ChatRequest, ChunkStream, ModelRoute, ProviderAdapter, ProviderError, TokenChunk};
use crate::schema::enum_def::ProviderType;
use crate::utils::billing::Pricing;

/// Test double replaying a fixed sequence of chunks.
pub struct ScriptedAdapter {
    items: Vec<Result<TokenChunk, ProviderError>>,
    open_failures: Mutex<VecDeque<ProviderError>>,
    delay: Option<Duration>,
    open_delay: Option<Duration>,
    hang_at_end: bool,
    opened: AtomicUsize,
    pulled: Arc<AtomicUsize>,
    last_request: Mutex<Option<ChatRequest>>,
}

impl ScriptedAdapter {
    pub fn new(items: Vec<Result<TokenChunk, ProviderError>>) -> Self {
        Self {
            items,
            open_failures: Mutex::new(VecDeque::new()),
            delay: None,
            open_delay: None,
            hang_at_end: false,
            opened: AtomicUsize::new(0),
            pulled: Arc::new(AtomicUsize::new(0)),
            last_request: Mutex::new(None),
        }
    }

    /// Content chunks followed by `Done` with the given usage.
    pub fn completing(chunks: &[&str], usage: Option<crate::utils::billing::UsageInfo>) -> Self {
        let mut items: Vec<_> = chunks
            .iter()
            .map(|c| Ok(TokenChunk::Content(c.to_string())))
            .collect();
        items.push(Ok(TokenChunk::Done(usage)));
        Self::new(items)
    }

    /// Errors returned by successive `stream` calls before the script plays.
    pub fn failing_open(self, errors: Vec<ProviderError>) -> Self {
        *self.open_failures.lock().unwrap() = errors.into();
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Slow handshake: `stream` waits this long before answering.
    pub fn with_open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = Some(delay);
        self
    }

    /// Never ends after the last item, like a stalled upstream.
    pub fn hanging(mut self) -> Self {
        self.hang_at_end = true;
        self
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn pulled(&self) -> usize {
        self.pulled.load(Ordering::SeqCst)
    }

    pub fn last_request(&self) -> Option<ChatRequest> {
        self.last_request.lock().unwrap().clone()
    }

    pub fn route(model_name: &str, pricing: Pricing) -> ModelRoute {
        ModelRoute {
            provider_key: "scripted".to_string(),
            provider_type: ProviderType::Openai,
            model_name: model_name.to_string(),
            upstream_model: model_name.to_string(),
            base_url: "http://scripted.invalid".to_string(),
            api_key: String::new(),
            pricing,
            max_output_tokens: Some(512),
        }
    }
}

#[async_trait]
impl ProviderAdapter for ScriptedAdapter {
    fn provider_type(&self) -> ProviderType {
        ProviderType::Openai
    }

    async fn stream(
        &self,
        _route: &ModelRoute,
        request: &ChatRequest,
    ) -> Result<ChunkStream, ProviderError> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        *self.last_request.lock().unwrap() = Some(request.clone());
        if let Some(delay) = self.open_delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = self.open_failures.lock().unwrap().pop_front() {
            return Err(err);
        }

        let items = self.items.clone();
        let delay = self.delay;
        let hang = self.hang_at_end;
        let pulled = self.pulled.clone();
        Ok(Box::pin(async_stream::stream! {
            for item in items {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                pulled.fetch_add(1, Ordering::SeqCst);
                yield item;
            }
            if hang {
                futures::future::pending::<()>().await;
            }
        }))
    }
}
