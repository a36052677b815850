use std::convert::Infallible;
use std::time::{Duration, Instant};

use bytes::Bytes;
use cyder_tools::log::{debug, error, info, warn};
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::provider::{ChunkStream, ModelRoute, ProviderError, TokenChunk};
use super::quota::{QuotaGuard, ReservationHandle};
use super::usage_recorder::{UsageRecord, UsageRecorder};
use crate::database::conversation::ChatMessage;
use crate::database::{run_blocking, DbPool};
use crate::schema::enum_def::MessageRole;
use crate::utils::billing::{calculate_cost, estimate_tokens, micros_to_amount, UsageInfo};
use crate::utils::sse::SseEvent;
use crate::utils::{now_millis, ID_GENERATOR};

pub const CLIENT_DISCONNECTED: &str = "client_disconnected";

pub type RelayBody = BoxStream<'static, Result<Bytes, Infallible>>;

/// Everything the relay needs to finish a request on its own.
#[derive(Debug, Clone)]
pub struct RelayContext {
    pub user_id: i64,
    pub department_id: i64,
    pub conversation_id: i64,
    pub route: ModelRoute,
    pub reservation: ReservationHandle,
    /// Prompt size estimate, used when the provider never reports usage.
    pub estimated_input_tokens: i32,
    pub started_at: Instant,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RelayOutcome {
    Completed { message_id: i64 },
    Failed { kind: String },
    Disconnected,
}

#[derive(Serialize)]
struct StartEvent<'a> {
    conversation_id: i64,
    model: &'a str,
}

#[derive(Serialize)]
struct ChunkEvent<'a> {
    index: usize,
    content: &'a str,
}

#[derive(Serialize)]
struct DoneEvent {
    conversation_id: i64,
    message_id: i64,
    usage: UsageInfo,
    cost: f64,
}

#[derive(Serialize)]
struct ErrorEvent<'a> {
    kind: &'a str,
    msg: &'a str,
}

pub fn error_event(kind: &str, msg: &str) -> Bytes {
    SseEvent::json("error", &ErrorEvent { kind, msg }).to_bytes()
}

enum Step {
    Chunk(TokenChunk),
    Ended,
    Failed(ProviderError),
    Disconnected,
}

enum StreamEnd {
    Completed,
    Failed(ProviderError),
    Disconnected,
}

#[derive(Default)]
struct StreamState {
    content: String,
    usage: Option<UsageInfo>,
    chunk_count: i32,
    first_chunk_ms: Option<i64>,
}

impl StreamState {
    fn merge_usage(&mut self, usage: UsageInfo) {
        match self.usage.as_mut() {
            Some(current) => current.merge(usage),
            None => self.usage = Some(usage),
        }
    }

    fn reported_usage(&self) -> Option<UsageInfo> {
        self.usage.filter(|u| !u.is_empty())
    }
}

/// Pumps a provider stream to the client as SSE and settles the request
/// (history, usage log, quota) once the stream ends, however it ends.
#[derive(Clone)]
pub struct StreamRelay {
    db: DbPool,
    quota: QuotaGuard,
    recorder: UsageRecorder,
    idle_timeout: Duration,
    buffer: usize,
}

impl StreamRelay {
    pub fn new(
        db: DbPool,
        quota: QuotaGuard,
        recorder: UsageRecorder,
        idle_timeout: Duration,
        buffer: usize,
    ) -> Self {
        Self {
            db,
            quota,
            recorder,
            idle_timeout,
            buffer: buffer.max(1),
        }
    }

    /// Starts the reader task. The returned body yields SSE frames as they
    /// arrive; dropping it is how a client disconnect is observed.
    pub fn spawn(&self, ctx: RelayContext, upstream: ChunkStream) -> (RelayBody, JoinHandle<RelayOutcome>) {
        let (tx, mut rx) = mpsc::channel::<Bytes>(self.buffer);
        let relay = self.clone();
        let handle = tokio::spawn(async move { relay.run(ctx, upstream, tx).await });

        let body = async_stream::stream! {
            while let Some(frame) = rx.recv().await {
                yield Ok::<_, Infallible>(frame);
            }
        };
        (Box::pin(body), handle)
    }

    async fn run(self, ctx: RelayContext, mut upstream: ChunkStream, tx: mpsc::Sender<Bytes>) -> RelayOutcome {
        let mut state = StreamState::default();
        let start = SseEvent::json(
            "start",
            &StartEvent {
                conversation_id: ctx.conversation_id,
                model: &ctx.route.model_name,
            },
        );

        let end = if tx.send(start.to_bytes()).await.is_err() {
            StreamEnd::Disconnected
        } else {
            loop {
                let step = tokio::select! {
                    biased;
                    _ = tx.closed() => Step::Disconnected,
                    next = tokio::time::timeout(self.idle_timeout, upstream.next()) => match next {
                        Err(_) => Step::Failed(ProviderError::Transient(format!(
                            "no data from provider for {:?}",
                            self.idle_timeout
                        ))),
                        Ok(None) => Step::Ended,
                        Ok(Some(Ok(chunk))) => Step::Chunk(chunk),
                        Ok(Some(Err(e))) => Step::Failed(e),
                    },
                };

                match step {
                    Step::Chunk(TokenChunk::Content(text)) => {
                        if text.is_empty() {
                            continue;
                        }
                        if state.first_chunk_ms.is_none() {
                            state.first_chunk_ms = Some(ctx.started_at.elapsed().as_millis() as i64);
                        }
                        let frame = SseEvent::json(
                            "chunk",
                            &ChunkEvent {
                                index: state.chunk_count as usize,
                                content: &text,
                            },
                        );
                        state.content.push_str(&text);
                        state.chunk_count += 1;
                        if tx.send(frame.to_bytes()).await.is_err() {
                            break StreamEnd::Disconnected;
                        }
                    }
                    Step::Chunk(TokenChunk::Usage(usage)) => state.merge_usage(usage),
                    Step::Chunk(TokenChunk::Done(usage)) => {
                        if let Some(usage) = usage {
                            state.merge_usage(usage);
                        }
                        break StreamEnd::Completed;
                    }
                    Step::Ended => {
                        break StreamEnd::Failed(ProviderError::Transient(
                            "provider stream ended without completion".to_string(),
                        ));
                    }
                    Step::Failed(e) => break StreamEnd::Failed(e),
                    Step::Disconnected => break StreamEnd::Disconnected,
                }
            }
        };
        // Stop consuming the provider before settling.
        drop(upstream);

        match end {
            StreamEnd::Completed => self.complete(&ctx, state, &tx).await,
            StreamEnd::Failed(e) => {
                warn!(
                    "stream for reservation {} failed after {} chunk(s): {}",
                    ctx.reservation.id, state.chunk_count, e
                );
                let _ = tx.send(error_event(e.kind(), &e.to_string())).await;
                self.settle_partial(&ctx, &state, e.kind(), Some(e.to_string())).await;
                RelayOutcome::Failed {
                    kind: e.kind().to_string(),
                }
            }
            StreamEnd::Disconnected => {
                info!(
                    "client disconnected from reservation {} after {} chunk(s)",
                    ctx.reservation.id, state.chunk_count
                );
                self.settle_partial(&ctx, &state, CLIENT_DISCONNECTED, None).await;
                RelayOutcome::Disconnected
            }
        }
    }

    async fn complete(&self, ctx: &RelayContext, state: StreamState, tx: &mpsc::Sender<Bytes>) -> RelayOutcome {
        let usage = state.reported_usage().unwrap_or_else(|| {
            debug!(
                "provider reported no usage for reservation {}, estimating",
                ctx.reservation.id
            );
            UsageInfo::new(
                ctx.estimated_input_tokens,
                estimate_tokens(state.content.chars().count()),
            )
        });
        let cost = calculate_cost(&usage, &ctx.route.pricing);

        let message = ChatMessage {
            id: ID_GENERATOR.generate_id(),
            conversation_id: ctx.conversation_id,
            role: MessageRole::Assistant,
            content: state.content.clone(),
            model_name: Some(ctx.route.model_name.clone()),
            input_tokens: Some(usage.input_tokens),
            output_tokens: Some(usage.output_tokens),
            cost: Some(cost),
            created_at: now_millis(),
        };
        let saved = run_blocking(&self.db, move |conn| ChatMessage::append(conn, &message)).await;

        let outcome = match saved {
            Ok(saved) => {
                let done = SseEvent::json(
                    "done",
                    &DoneEvent {
                        conversation_id: ctx.conversation_id,
                        message_id: saved.id,
                        usage,
                        cost: micros_to_amount(cost),
                    },
                );
                let _ = tx.send(done.to_bytes()).await;
                self.recorder.record(self.usage_record(ctx, &state, usage, cost, None, None));
                RelayOutcome::Completed { message_id: saved.id }
            }
            Err(e) => {
                error!(
                    "failed to store assistant message for conversation {}: {}",
                    ctx.conversation_id, e
                );
                let _ = tx.send(error_event(e.kind(), &e.public_message())).await;
                self.recorder.record(self.usage_record(
                    ctx,
                    &state,
                    usage,
                    cost,
                    Some(e.kind()),
                    Some(e.to_string()),
                ));
                RelayOutcome::Failed {
                    kind: e.kind().to_string(),
                }
            }
        };

        // The provider billed the call either way.
        if let Err(e) = self
            .quota
            .reconcile(&ctx.reservation, cost, usage.total_tokens as i64)
            .await
        {
            error!("failed to reconcile reservation {}: {}", ctx.reservation.id, e);
        }
        outcome
    }

    /// Charges whatever usage the provider reported before the stream ended,
    /// or returns the whole hold when it reported none.
    async fn settle_partial(
        &self,
        ctx: &RelayContext,
        state: &StreamState,
        error_kind: &str,
        error_message: Option<String>,
    ) {
        let partial = state.reported_usage();
        let cost = partial
            .map(|usage| calculate_cost(&usage, &ctx.route.pricing))
            .unwrap_or(0);

        self.recorder.record(self.usage_record(
            ctx,
            state,
            partial.unwrap_or_default(),
            cost,
            Some(error_kind),
            error_message,
        ));

        let settled = match partial {
            Some(usage) => self
                .quota
                .reconcile(&ctx.reservation, cost, usage.total_tokens as i64)
                .await
                .map(|_| ()),
            None => self.quota.release(&ctx.reservation).await.map(|_| ()),
        };
        if let Err(e) = settled {
            error!("failed to settle reservation {}: {}", ctx.reservation.id, e);
        }
    }

    fn usage_record(
        &self,
        ctx: &RelayContext,
        state: &StreamState,
        usage: UsageInfo,
        cost: i64,
        error_kind: Option<&str>,
        error_message: Option<String>,
    ) -> UsageRecord {
        UsageRecord {
            user_id: ctx.user_id,
            department_id: ctx.department_id,
            reservation_id: ctx.reservation.id,
            conversation_id: Some(ctx.conversation_id),
            model_name: ctx.route.model_name.clone(),
            provider: ctx.route.provider_key.clone(),
            usage,
            cost,
            response_time_ms: ctx.started_at.elapsed().as_millis() as i64,
            first_chunk_ms: state.first_chunk_ms,
            chunk_count: state.chunk_count,
            success: error_kind.is_none(),
            error_kind: error_kind.map(str::to_string),
            error_message,
        }
    }
}
