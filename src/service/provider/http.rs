use std::time::Duration;

use cyder_tools::log::{debug, error};
use futures::StreamExt;
use reqwest::Proxy;

use super::error::parse_retry_after;
use super::{ChunkStream, ProviderAdapter, ProviderError, TokenChunk};
use crate::utils::sse::{SseEvent, SseParser};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Turns provider SSE events into token chunks. One decoder per stream.
pub trait EventDecoder: Send + 'static {
    fn decode(&mut self, event: SseEvent) -> Vec<Result<TokenChunk, ProviderError>>;

    /// Called once when the upstream body ends without a terminal item.
    fn finish(&mut self) -> Result<TokenChunk, ProviderError>;
}

pub fn build_http_client(use_proxy: bool, proxy: Option<&str>) -> Result<reqwest::Client, String> {
    let mut client_builder = reqwest::Client::builder().connect_timeout(CONNECT_TIMEOUT);
    if use_proxy {
        if let Some(proxy_url) = proxy {
            let proxy = Proxy::https(proxy_url).map_err(|e| {
                error!("Invalid proxy URL '{}': {}", proxy_url, e);
                format!("invalid proxy configuration: {}", e)
            })?;
            client_builder = client_builder.proxy(proxy);
        }
    }
    client_builder.build().map_err(|e| {
        error!("Failed to build reqwest client: {}", e);
        format!("failed to build HTTP client: {}", e)
    })
}

/// Sends the request and hands back the response if the provider accepted it.
pub async fn send_streaming<A: ProviderAdapter + ?Sized>(
    adapter: &A,
    request: reqwest::RequestBuilder,
) -> Result<reqwest::Response, ProviderError> {
    let response = request.send().await?;
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let retry_after = parse_retry_after(response.headers());
    let body = response.text().await.unwrap_or_default();
    debug!("provider responded {} with body: {}", status, body);
    Err(adapter.map_error(status, retry_after, &body))
}

/// Lazily decodes an SSE response body. The stream ends after the first
/// terminal item (`Done` or an error).
pub fn sse_chunks<D: EventDecoder>(response: reqwest::Response, decoder: D) -> ChunkStream {
    let bytes = response.bytes_stream();
    Box::pin(async_stream::stream! {
        futures::pin_mut!(bytes);
        let mut parser = SseParser::new();
        let mut decoder = decoder;
        let mut terminated = false;

        while let Some(item) = bytes.next().await {
            let chunk = match item {
                Ok(chunk) => chunk,
                Err(e) => {
                    yield Err(ProviderError::from(e));
                    terminated = true;
                    break;
                }
            };
            for event in parser.process(&chunk) {
                for out in decoder.decode(event) {
                    let terminal = matches!(out, Ok(TokenChunk::Done(_)) | Err(_));
                    yield out;
                    if terminal {
                        terminated = true;
                        break;
                    }
                }
                if terminated {
                    break;
                }
            }
            if terminated {
                break;
            }
        }

        if !terminated {
            yield decoder.finish();
        }
    })
}

/// Replays a fixed SSE transcript through a decoder, as `sse_chunks` would.
#[cfg(test)]
pub fn decode_transcript<D: EventDecoder>(
    mut decoder: D,
    transcript: &str,
) -> Vec<Result<TokenChunk, ProviderError>> {
    let mut parser = SseParser::new();
    let mut out = Vec::new();
    for event in parser.process(transcript.as_bytes()) {
        for item in decoder.decode(event) {
            let terminal = matches!(item, Ok(TokenChunk::Done(_)) | Err(_));
            out.push(item);
            if terminal {
                return out;
            }
        }
    }
    out.push(decoder.finish());
    out
}
