use std::sync::Arc;
use std::time::Instant;

use cyder_tools::log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};

use super::app_state::AppState;
use super::provider::{
    ChatRequest, ChunkStream, ModelRoute, PromptMessage, ProviderAdapter, ProviderError,
};
use super::quota::ReservationHandle;
use super::relay::{RelayBody, RelayContext, CLIENT_DISCONNECTED};
use super::usage_recorder::UsageRecord;
use crate::config::ChatConfig;
use crate::controller::error::GatewayError;
use crate::controller::gatekeeper::Caller;
use crate::database::attachment::FileAttachment;
use crate::database::conversation::{ChatMessage, Conversation};
use crate::database::department::Department;
use crate::database::project::Project;
use crate::database::run_blocking;
use crate::schema::enum_def::MessageRole;
use crate::utils::billing::{micros_to_amount, UsageInfo};
use crate::utils::{now_millis, ID_GENERATOR};

const TITLE_CHARS: usize = 50;

#[derive(Debug, Clone, Deserialize)]
pub struct ChatPayload {
    pub message: String,
    pub model: String,
    #[serde(default)]
    pub conversation_id: Option<i64>,
    #[serde(default)]
    pub file_attachment_ids: Vec<i64>,
    #[serde(default)]
    pub project_id: Option<i64>,
    #[serde(default)]
    pub max_tokens: Option<i32>,
    #[serde(default)]
    pub temperature: Option<f32>,
}

impl ChatPayload {
    fn validate(&self) -> Result<(), GatewayError> {
        if self.message.trim().is_empty() {
            return Err(GatewayError::ParamInvalid("message must not be empty".to_string()));
        }
        if self.model.trim().is_empty() {
            return Err(GatewayError::ParamInvalid("model must not be empty".to_string()));
        }
        if self.max_tokens.is_some_and(|n| n <= 0) {
            return Err(GatewayError::ParamInvalid(
                "max_tokens must be positive".to_string(),
            ));
        }
        if self.temperature.is_some_and(|t| !(0.0..=2.0).contains(&t)) {
            return Err(GatewayError::ParamInvalid(
                "temperature must be between 0 and 2".to_string(),
            ));
        }
        Ok(())
    }
}

/// Stored state the prompt is assembled from. Loading it never writes.
struct PromptContext {
    conversation: Option<Conversation>,
    system_prompt: Option<String>,
    attachments: Vec<FileAttachment>,
    history: Vec<ChatMessage>,
}

async fn load_context(
    state: &AppState,
    caller: &Caller,
    payload: &ChatPayload,
) -> Result<PromptContext, GatewayError> {
    let user_id = caller.user_id;
    let conversation_id = payload.conversation_id;
    let project_id = payload.project_id;
    let attachment_ids = payload.file_attachment_ids.clone();
    let history_limit = state.chat.history_limit;

    run_blocking(&state.db, move |conn| {
        let conversation = conversation_id
            .map(|id| Conversation::get_owned(conn, id, user_id))
            .transpose()?;
        let project = project_id
            .or_else(|| conversation.as_ref().and_then(|c| c.project_id))
            .map(|id| Project::get_owned(conn, id, user_id))
            .transpose()?;
        let attachments = FileAttachment::list_owned(conn, &attachment_ids, user_id)?;
        let history = match &conversation {
            Some(c) if history_limit > 0 => ChatMessage::recent(conn, c.id, history_limit)?,
            _ => Vec::new(),
        };
        Ok(PromptContext {
            conversation,
            system_prompt: project
                .and_then(|p| p.system_prompt)
                .filter(|s| !s.trim().is_empty()),
            attachments,
            history,
        })
    })
    .await
}

/// Extracted attachment text, capped at `max_chars` characters in total.
fn attachment_context(attachments: &[FileAttachment], max_chars: usize) -> Option<String> {
    let mut remaining = max_chars;
    let mut blocks = Vec::new();
    for attachment in attachments {
        if remaining == 0 {
            break;
        }
        let text = attachment.extracted_text.as_deref().unwrap_or("").trim();
        if text.is_empty() {
            continue;
        }
        let taken: String = text.chars().take(remaining).collect();
        remaining -= taken.chars().count();
        blocks.push(format!("[Attachment: {}]\n{}", attachment.filename, taken));
    }
    if blocks.is_empty() {
        None
    } else {
        Some(blocks.join("\n\n"))
    }
}

fn resolve_max_tokens(requested: Option<i32>, route: &ModelRoute, default: i32) -> i32 {
    let wanted = requested.or(route.max_output_tokens).unwrap_or(default);
    match route.max_output_tokens {
        Some(cap) if cap > 0 => wanted.min(cap),
        _ => wanted,
    }
}

fn build_request(
    route: &ModelRoute,
    chat: &ChatConfig,
    payload: &ChatPayload,
    context: &PromptContext,
) -> ChatRequest {
    let mut messages = Vec::with_capacity(context.history.len() + 2);
    if let Some(system) = &context.system_prompt {
        messages.push(PromptMessage::new(MessageRole::System, system.clone()));
    }
    messages.extend(
        context
            .history
            .iter()
            .filter(|m| m.role != MessageRole::System)
            .map(|m| PromptMessage::new(m.role, m.content.clone())),
    );
    let content = match attachment_context(&context.attachments, chat.max_attachment_chars) {
        Some(files) => format!("{}\n\n{}", files, payload.message),
        None => payload.message.clone(),
    };
    messages.push(PromptMessage::new(MessageRole::User, content));

    ChatRequest {
        messages,
        max_tokens: resolve_max_tokens(payload.max_tokens, route, chat.default_max_output_tokens),
        temperature: payload.temperature,
    }
}

/// Creates the conversation when needed and stores the user's message.
/// Returns the conversation id.
async fn persist_user_message(
    state: &AppState,
    caller: &Caller,
    payload: &ChatPayload,
    existing: Option<&Conversation>,
    route: &ModelRoute,
) -> Result<i64, GatewayError> {
    let now = now_millis();
    let (conversation_id, new_conversation) = match existing {
        Some(conversation) => (conversation.id, None),
        None => {
            let conversation = Conversation {
                id: ID_GENERATOR.generate_id(),
                user_id: caller.user_id,
                project_id: payload.project_id,
                title: payload.message.trim().chars().take(TITLE_CHARS).collect(),
                model_name: route.model_name.clone(),
                created_at: now,
                updated_at: now,
            };
            (conversation.id, Some(conversation))
        }
    };
    let message = ChatMessage {
        id: ID_GENERATOR.generate_id(),
        conversation_id,
        role: MessageRole::User,
        content: payload.message.clone(),
        model_name: None,
        input_tokens: None,
        output_tokens: None,
        cost: None,
        created_at: now,
    };

    run_blocking(&state.db, move |conn| {
        if let Some(conversation) = &new_conversation {
            Conversation::create(conn, conversation)?;
        }
        ChatMessage::append(conn, &message)?;
        Ok(conversation_id)
    })
    .await
}

/// Opens the provider stream, retrying once on a transient failure. Nothing
/// has reached the client yet, so a restart is safe.
async fn open_stream(
    adapter: &dyn ProviderAdapter,
    route: &ModelRoute,
    request: &ChatRequest,
) -> Result<ChunkStream, ProviderError> {
    match adapter.stream(route, request).await {
        Err(e) if e.is_transient() => {
            warn!("opening stream for '{}' failed, retrying once: {}", route.model_name, e);
            adapter.stream(route, request).await
        }
        other => other,
    }
}

async fn release_quietly(state: &AppState, reservation: &ReservationHandle) {
    if let Err(e) = state.quota.release(reservation).await {
        error!("failed to release reservation {}: {}", reservation.id, e);
    }
}

/// Token allowance held for a request: the prompt estimate plus the full
/// output budget.
fn estimated_tokens(request: &ChatRequest) -> i64 {
    request.estimated_input_tokens() as i64 + request.max_tokens as i64
}

/// What a chat request would cost, computed without reserving anything.
#[derive(Debug, Clone, Serialize)]
pub struct CostEstimate {
    pub model: String,
    pub estimated_input_tokens: i32,
    pub max_output_tokens: i32,
    pub estimated_tokens: i64,
    pub estimated_cost: f64,
    pub remaining_budget: f64,
    pub within_quota: bool,
}

/// Prices a chat payload the same way `start_chat` does, against a snapshot
/// of the caller's department.
pub async fn estimate_chat(
    state: &AppState,
    caller: &Caller,
    payload: &ChatPayload,
) -> Result<CostEstimate, GatewayError> {
    payload.validate()?;
    let (adapter, route) = state.router.route(&payload.model)?;
    let context = load_context(state, caller, payload).await?;
    let request = build_request(&route, &state.chat, payload, &context);
    let cost = adapter.estimate_cost(&route, &request);
    let tokens = estimated_tokens(&request);

    let department_id = caller.department_id;
    let department = run_blocking(&state.db, move |conn| Department::get(conn, department_id)).await?;
    debug!(
        "estimated '{}' for user {}: {} ({} tokens)",
        route.model_name, caller.user_id, cost, tokens
    );
    Ok(CostEstimate {
        model: route.model_name,
        estimated_input_tokens: request.estimated_input_tokens(),
        max_output_tokens: request.max_tokens,
        estimated_tokens: tokens,
        estimated_cost: micros_to_amount(cost),
        remaining_budget: micros_to_amount(department.remaining()),
        within_quota: department.admits(cost, tokens),
    })
}

/// Owns a fresh reservation until the relay takes it over. If the request
/// future is dropped first (the client went away), the hold is returned and
/// the attempt is logged as a disconnect.
struct ReservationGuard {
    state: Arc<AppState>,
    reservation: ReservationHandle,
    user_id: i64,
    department_id: i64,
    conversation_id: Option<i64>,
    model_name: String,
    provider: String,
    started_at: Instant,
    is_armed: bool,
}

impl ReservationGuard {
    fn new(
        state: Arc<AppState>,
        caller: &Caller,
        route: &ModelRoute,
        reservation: ReservationHandle,
        started_at: Instant,
    ) -> Self {
        Self {
            state,
            reservation,
            user_id: caller.user_id,
            department_id: caller.department_id,
            conversation_id: None,
            model_name: route.model_name.clone(),
            provider: route.provider_key.clone(),
            started_at,
            is_armed: true,
        }
    }

    fn failure_record(&self, error_kind: &str, error_message: Option<String>) -> UsageRecord {
        UsageRecord {
            user_id: self.user_id,
            department_id: self.department_id,
            reservation_id: self.reservation.id,
            conversation_id: self.conversation_id,
            model_name: self.model_name.clone(),
            provider: self.provider.clone(),
            usage: UsageInfo::default(),
            cost: 0,
            response_time_ms: self.started_at.elapsed().as_millis() as i64,
            first_chunk_ms: None,
            chunk_count: 0,
            success: false,
            error_kind: Some(error_kind.to_string()),
            error_message,
        }
    }

    fn disarm(&mut self) -> ReservationHandle {
        self.is_armed = false;
        self.reservation.clone()
    }
}

impl Drop for ReservationGuard {
    fn drop(&mut self) {
        if self.is_armed {
            let state = Arc::clone(&self.state);
            let reservation = self.reservation.clone();
            let record = self.failure_record(CLIENT_DISCONNECTED, None);
            tokio::spawn(async move {
                warn!(
                    "request for reservation {} was cancelled before streaming",
                    reservation.id
                );
                state.recorder.record(record);
                release_quietly(&state, &reservation).await;
            });
        }
    }
}

/// Runs the accept path of a chat request and hands the provider stream to
/// the relay. Every error returned here happens before the first SSE byte.
pub async fn start_chat(
    state: &Arc<AppState>,
    caller: &Caller,
    payload: ChatPayload,
) -> Result<RelayBody, GatewayError> {
    let started_at = Instant::now();
    payload.validate()?;

    let (adapter, route) = state.router.route(&payload.model)?;
    let context = load_context(state, caller, &payload).await?;
    let request = build_request(&route, &state.chat, &payload, &context);
    let estimated_cost = adapter.estimate_cost(&route, &request);
    info!(
        "chat request from user {} ({:?}) to '{}', estimated cost {}",
        caller.user_id, caller.role, route.model_name, estimated_cost
    );

    let reservation = state
        .quota
        .reserve(
            caller.department_id,
            caller.user_id,
            &route.model_name,
            estimated_cost,
            estimated_tokens(&request),
        )
        .await?;
    let mut guard = ReservationGuard::new(state.clone(), caller, &route, reservation, started_at);

    let conversation_id = match persist_user_message(
        state,
        caller,
        &payload,
        context.conversation.as_ref(),
        &route,
    )
    .await
    {
        Ok(id) => id,
        Err(e) => {
            error!("failed to store user message: {}", e);
            let reservation = guard.disarm();
            release_quietly(state, &reservation).await;
            return Err(e);
        }
    };
    guard.conversation_id = Some(conversation_id);

    let upstream = match open_stream(adapter.as_ref(), &route, &request).await {
        Ok(upstream) => upstream,
        Err(e) => {
            warn!("provider '{}' refused the stream: {}", route.provider_key, e);
            state
                .recorder
                .record(guard.failure_record(e.kind(), Some(e.to_string())));
            let reservation = guard.disarm();
            release_quietly(state, &reservation).await;
            return Err(e.into());
        }
    };

    let reservation = guard.disarm();
    debug!(
        "stream opened for conversation {} (reservation {})",
        conversation_id, reservation.id
    );
    let ctx = RelayContext {
        user_id: caller.user_id,
        department_id: caller.department_id,
        conversation_id,
        estimated_input_tokens: request.estimated_input_tokens(),
        route,
        reservation,
        started_at,
    };
    let (body, _relay) = state.relay.spawn(ctx, upstream);
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::testing::{
        seed_attachment, seed_department, seed_project, seed_user, test_db, TestDb,
    };
    use crate::database::usage_log::UsageLog;
    use crate::schema::enum_def::UserRole;
    use crate::service::app_state::test_state;
    use crate::service::provider::scripted::ScriptedAdapter;
    use crate::service::provider::ProviderRouter;
    use crate::utils::billing::Pricing;
    use futures::StreamExt;
    use std::time::Duration;

    const PRICING: Pricing = Pricing {
        input_price_per_1k: 1_000,
        output_price_per_1k: 1_000,
        request_price: 0,
    };

    fn payload(message: &str, model: &str) -> ChatPayload {
        ChatPayload {
            message: message.to_string(),
            model: model.to_string(),
            conversation_id: None,
            file_attachment_ids: Vec::new(),
            project_id: None,
            max_tokens: Some(100),
            temperature: None,
        }
    }

    struct Fixture {
        db: TestDb,
        state: Arc<AppState>,
        caller: Caller,
        adapter: Arc<ScriptedAdapter>,
    }

    fn fixture(adapter: ScriptedAdapter, budget: i64) -> Fixture {
        let db = test_db();
        let dept = seed_department(&db.pool, budget, 0, None);
        let user = seed_user(&db.pool, Some(dept.id));
        let adapter = Arc::new(adapter);
        let mut router = ProviderRouter::new();
        router
            .register(adapter.clone(), ScriptedAdapter::route("scripted", PRICING))
            .unwrap();
        let state = test_state(&db.pool, router);
        Fixture {
            db,
            state,
            caller: Caller {
                user_id: user.id,
                department_id: dept.id,
                role: UserRole::Member,
            },
            adapter,
        }
    }

    fn department(f: &Fixture) -> Department {
        Department::get(&mut f.db.pool.get_connection().unwrap(), f.caller.department_id).unwrap()
    }

    #[test]
    fn attachments_are_capped_in_total() {
        let attachment = |name: &str, text: &str| FileAttachment {
            id: 1,
            user_id: 1,
            filename: name.to_string(),
            extracted_text: Some(text.to_string()),
            created_at: 0,
        };
        let files = [attachment("a.txt", "12345"), attachment("b.txt", "67890")];
        assert_eq!(
            attachment_context(&files, 7).unwrap(),
            "[Attachment: a.txt]\n12345\n\n[Attachment: b.txt]\n67"
        );
        assert!(attachment_context(&files, 0).is_none());
    }

    #[test]
    fn max_tokens_respect_model_cap() {
        let route = ScriptedAdapter::route("scripted", PRICING);
        assert_eq!(resolve_max_tokens(Some(100), &route, 1024), 100);
        assert_eq!(resolve_max_tokens(Some(4096), &route, 1024), 512);
        assert_eq!(resolve_max_tokens(None, &route, 1024), 512);

        let mut uncapped = route.clone();
        uncapped.max_output_tokens = None;
        assert_eq!(resolve_max_tokens(None, &uncapped, 1024), 1024);
    }

    #[test]
    fn invalid_payloads_are_rejected() {
        assert!(payload("  ", "scripted").validate().is_err());
        let mut p = payload("hi", "scripted");
        p.temperature = Some(3.5);
        assert!(p.validate().is_err());
        p.temperature = Some(0.7);
        p.max_tokens = Some(0);
        assert!(p.validate().is_err());
    }

    #[tokio::test]
    async fn unknown_model_touches_no_budget() {
        let f = fixture(ScriptedAdapter::completing(&["x"], None), 10_000_000);
        let result = start_chat(&f.state, &f.caller, payload("hi", "nonexistent-model")).await;
        assert!(matches!(result, Err(GatewayError::UnknownModel(_))));

        let dept = department(&f);
        assert_eq!(dept.reserved_cost, 0);
        assert_eq!(dept.reserved_requests, 0);
        assert_eq!(f.adapter.opened(), 0);
    }

    #[tokio::test]
    async fn prompt_carries_project_history_and_attachments() {
        let f = fixture(
            ScriptedAdapter::completing(&["fine"], Some(UsageInfo::new(10, 2))),
            10_000_000,
        );
        let project = seed_project(&f.db.pool, f.caller.user_id, "You answer in French.");
        let file = seed_attachment(&f.db.pool, f.caller.user_id, "notes.txt", "budget is 5k");

        let mut first = payload("first question", "scripted");
        first.project_id = Some(project.id);
        let body = start_chat(&f.state, &f.caller, first).await.unwrap();
        let _: Vec<_> = body.collect().await;

        let conversation = Conversation::list_by_user(
            &mut f.db.pool.get_connection().unwrap(),
            f.caller.user_id,
        )
        .unwrap()
        .remove(0);
        assert_eq!(conversation.title, "first question");

        let mut second = payload("second question", "scripted");
        second.conversation_id = Some(conversation.id);
        second.file_attachment_ids = vec![file.id];
        let body = start_chat(&f.state, &f.caller, second).await.unwrap();
        let _: Vec<_> = body.collect().await;

        let request = f.adapter.last_request().unwrap();
        assert_eq!(request.system_prompt().as_deref(), Some("You answer in French."));
        let turns: Vec<_> = request.turns().map(|m| (m.role, m.content.clone())).collect();
        assert_eq!(
            turns,
            vec![
                (MessageRole::User, "first question".to_string()),
                (MessageRole::Assistant, "fine".to_string()),
                (
                    MessageRole::User,
                    "[Attachment: notes.txt]\nbudget is 5k\n\nsecond question".to_string()
                ),
            ]
        );
        assert_eq!(request.max_tokens, 100);
    }

    #[tokio::test]
    async fn transient_open_failure_is_retried_once() {
        let adapter = ScriptedAdapter::completing(&["ok"], Some(UsageInfo::new(5, 1)))
            .failing_open(vec![ProviderError::Transient("connection reset".into())]);
        let f = fixture(adapter, 10_000_000);

        let body = start_chat(&f.state, &f.caller, payload("hi", "scripted")).await.unwrap();
        let _: Vec<_> = body.collect().await;
        assert_eq!(f.adapter.opened(), 2);
        assert_eq!(department(&f).request_count, 1);
    }

    #[tokio::test]
    async fn refused_stream_releases_and_records_failure() {
        let adapter = ScriptedAdapter::completing(&["never"], None).failing_open(vec![
            ProviderError::Transient("down".into()),
            ProviderError::Transient("still down".into()),
        ]);
        let f = fixture(adapter, 10_000_000);

        let result = start_chat(&f.state, &f.caller, payload("hi", "scripted")).await;
        assert!(matches!(
            result,
            Err(GatewayError::Provider(ProviderError::Transient(_)))
        ));

        let dept = department(&f);
        assert_eq!(dept.reserved_cost, 0);
        assert_eq!(dept.used_cost, 0);

        f.state.recorder.flush().await;
        let logs = UsageLog::list_by_department(
            &mut f.db.pool.get_connection().unwrap(),
            f.caller.department_id,
            10,
        )
        .unwrap();
        assert_eq!(logs.len(), 1);
        assert!(!logs[0].success);
        assert_eq!(logs[0].error_kind.as_deref(), Some("provider_transient"));
    }

    #[tokio::test]
    async fn dropped_request_still_settles_its_hold() {
        let adapter = ScriptedAdapter::completing(&["late"], Some(UsageInfo::new(5, 1)))
            .with_open_delay(Duration::from_millis(500));
        let f = fixture(adapter, 10_000_000);

        let state = f.state.clone();
        let caller = f.caller.clone();
        let request = tokio::spawn(async move {
            start_chat(&state, &caller, payload("hi", "scripted"))
                .await
                .map(|_| ())
        });
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(department(&f).reserved_requests, 1);
        request.abort();

        let mut settled = false;
        for _ in 0..50 {
            if department(&f).reserved_requests == 0 {
                settled = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(settled, "hold was never settled");
        let dept = department(&f);
        assert_eq!(dept.reserved_cost, 0);
        assert_eq!(dept.used_cost, 0);

        f.state.recorder.flush().await;
        let logs = UsageLog::list_by_department(
            &mut f.db.pool.get_connection().unwrap(),
            f.caller.department_id,
            10,
        )
        .unwrap();
        assert_eq!(logs.len(), 1);
        assert!(!logs[0].success);
        assert_eq!(logs[0].error_kind.as_deref(), Some(CLIENT_DISCONNECTED));
    }

    #[tokio::test]
    async fn estimate_reserves_nothing() {
        let f = fixture(ScriptedAdapter::completing(&["x"], None), 10_000_000);
        let estimate = estimate_chat(&f.state, &f.caller, &payload("abcdefgh", "scripted"))
            .await
            .unwrap();

        // 8 chars plus framing overhead, and the full 100-token output budget.
        assert_eq!(estimate.estimated_input_tokens, 6);
        assert_eq!(estimate.max_output_tokens, 100);
        assert_eq!(estimate.estimated_tokens, 106);
        assert_eq!(estimate.estimated_cost, 0.000106);
        assert_eq!(estimate.remaining_budget, 10.0);
        assert!(estimate.within_quota);

        let dept = department(&f);
        assert_eq!(dept.reserved_cost, 0);
        assert_eq!(dept.reserved_requests, 0);
        assert_eq!(f.adapter.opened(), 0);
    }

    #[tokio::test]
    async fn estimate_flags_requests_over_budget() {
        let f = fixture(ScriptedAdapter::completing(&["x"], None), 50);
        let estimate = estimate_chat(&f.state, &f.caller, &payload("hi", "scripted"))
            .await
            .unwrap();
        assert!(!estimate.within_quota);
        assert_eq!(estimate.remaining_budget, 0.00005);
    }

    #[tokio::test]
    async fn exhausted_budget_is_rejected_before_the_provider() {
        let f = fixture(ScriptedAdapter::completing(&["x"], None), 10);
        let result = start_chat(&f.state, &f.caller, payload("hi", "scripted")).await;
        assert!(matches!(result, Err(GatewayError::QuotaExceeded { remaining: 10 })));
        assert_eq!(f.adapter.opened(), 0);
    }

    #[tokio::test]
    async fn foreign_conversation_is_forbidden() {
        let f = fixture(ScriptedAdapter::completing(&["x"], None), 10_000_000);
        let other = seed_user(&f.db.pool, Some(f.caller.department_id));
        let now = now_millis();
        let theirs = Conversation::create(
            &mut f.db.pool.get_connection().unwrap(),
            &Conversation {
                id: ID_GENERATOR.generate_id(),
                user_id: other.id,
                project_id: None,
                title: "private".to_string(),
                model_name: "scripted".to_string(),
                created_at: now,
                updated_at: now,
            },
        )
        .unwrap();

        let mut p = payload("peek", "scripted");
        p.conversation_id = Some(theirs.id);
        let result = start_chat(&f.state, &f.caller, p).await;
        assert!(matches!(result, Err(GatewayError::Forbidden(_))));
        assert_eq!(department(&f).reserved_cost, 0);
    }
}
