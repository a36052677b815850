use std::sync::Arc;

use axum::{
    body::Body,
    extract::{rejection::JsonRejection, Path, State},
    http::{
        header::{CACHE_CONTROL, CONTENT_TYPE},
        StatusCode,
    },
    middleware,
    response::Response,
    routing::{get, post},
    Extension, Json,
};
use cyder_tools::log::debug;

use super::error::GatewayError;
use super::gatekeeper::{gatekeeper_middleware, Caller};
use crate::database::conversation::{ChatMessage, Conversation};
use crate::database::run_blocking;
use crate::service::app_state::{create_state_router, AppState, StateRouter};
use crate::service::chat::{estimate_chat, start_chat, ChatPayload, CostEstimate};
use crate::service::provider::ModelInfo;
use crate::service::quota::QuotaStatus;
use crate::utils::HttpResult;

async fn chat_stream(
    State(app_state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    payload: Result<Json<ChatPayload>, JsonRejection>,
) -> Result<Response, GatewayError> {
    let Json(payload) = payload.map_err(|e| GatewayError::ParamInvalid(e.body_text()))?;
    let body = start_chat(&app_state, &caller, payload).await?;

    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, "text/event-stream")
        .header(CACHE_CONTROL, "no-cache")
        .header("x-accel-buffering", "no")
        .body(Body::from_stream(body))
        .map_err(|e| GatewayError::Internal(format!("failed to build stream response: {}", e)))
}

async fn list_models(State(app_state): State<Arc<AppState>>) -> HttpResult<Vec<ModelInfo>> {
    HttpResult::new(app_state.router.models())
}

async fn estimate_cost(
    State(app_state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    payload: Result<Json<ChatPayload>, JsonRejection>,
) -> Result<HttpResult<CostEstimate>, GatewayError> {
    let Json(payload) = payload.map_err(|e| GatewayError::ParamInvalid(e.body_text()))?;
    Ok(HttpResult::new(estimate_chat(&app_state, &caller, &payload).await?))
}

async fn quota_status(
    State(app_state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
) -> Result<HttpResult<QuotaStatus>, GatewayError> {
    let status = app_state.quota.status(caller.department_id).await?;
    Ok(HttpResult::new(status))
}

async fn list_messages(
    State(app_state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(conversation_id): Path<i64>,
) -> Result<HttpResult<Vec<ChatMessage>>, GatewayError> {
    let user_id = caller.user_id;
    let messages = run_blocking(&app_state.db, move |conn| {
        Conversation::get_owned(conn, conversation_id, user_id)?;
        ChatMessage::list(conn, conversation_id)
    })
    .await?;
    debug!(
        "user {} read {} message(s) of conversation {}",
        user_id,
        messages.len(),
        conversation_id
    );
    Ok(HttpResult::new(messages))
}

pub fn create_chat_router(app_state: &Arc<AppState>) -> StateRouter {
    create_state_router().nest(
        "/chat",
        create_state_router()
            .route("/stream", post(chat_stream))
            .route("/models", get(list_models))
            .route("/estimate-cost", post(estimate_cost))
            .route("/quota", get(quota_status))
            .route("/conversations/{id}/messages", get(list_messages))
            .route_layer(middleware::from_fn_with_state(
                app_state.clone(),
                gatekeeper_middleware,
            )),
    )
}

#[cfg(test)]
mod tests {
    use axum::{http::Request, Router};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use super::*;
    use crate::controller::create_router;
    use crate::database::department::Department;
    use crate::database::testing::{seed_department, seed_user, test_db, TestDb};
    use crate::service::app_state::{test_state, TEST_JWT_SECRET};
    use crate::service::provider::scripted::ScriptedAdapter;
    use crate::service::provider::ProviderRouter;
    use crate::utils::auth::{issue_access_token, AuthKeys};
    use crate::utils::billing::{Pricing, UsageInfo};
    use crate::utils::sse::SseParser;

    const PRICING: Pricing = Pricing {
        input_price_per_1k: 1_000,
        output_price_per_1k: 1_000,
        request_price: 0,
    };

    struct Harness {
        db: TestDb,
        app: Router,
        department_id: i64,
        token: String,
    }

    fn harness(budget: i64, used: i64) -> Harness {
        let db = test_db();
        let dept = seed_department(&db.pool, budget, used, None);
        let user = seed_user(&db.pool, Some(dept.id));
        let mut router = ProviderRouter::new();
        router
            .register(
                Arc::new(ScriptedAdapter::completing(
                    &["Hel", "lo"],
                    Some(UsageInfo::new(20, 2)),
                )),
                ScriptedAdapter::route("scripted", PRICING),
            )
            .unwrap();
        let state = test_state(&db.pool, router);
        Harness {
            app: create_router(state, "/api"),
            department_id: dept.id,
            token: issue_access_token(&AuthKeys::new(TEST_JWT_SECRET), user.id),
            db,
        }
    }

    fn post_chat(token: Option<&str>, body: Value) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/api/chat/stream")
            .header(CONTENT_TYPE, "application/json");
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {}", token));
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    fn get(token: &str, uri: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .header("authorization", format!("Bearer {}", token))
            .body(Body::empty())
            .unwrap()
    }

    async fn body_bytes(response: Response) -> bytes::Bytes {
        axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap()
    }

    async fn body_json(response: Response) -> Value {
        serde_json::from_slice(&body_bytes(response).await).unwrap()
    }

    fn department(h: &Harness) -> Department {
        Department::get(&mut h.db.pool.get_connection().unwrap(), h.department_id).unwrap()
    }

    #[tokio::test]
    async fn missing_token_is_unauthorized() {
        let h = harness(10_000_000, 0);
        let response = h
            .app
            .clone()
            .oneshot(post_chat(None, json!({"message": "hi", "model": "scripted"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(response).await["kind"], "unauthorized");
    }

    #[tokio::test]
    async fn unknown_model_is_rejected_without_touching_budget() {
        let h = harness(10_000_000, 0);
        let response = h
            .app
            .clone()
            .oneshot(post_chat(
                Some(&h.token),
                json!({"message": "hi", "model": "nonexistent-model"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["kind"], "unknown_model");

        let dept = department(&h);
        assert_eq!(dept.reserved_cost, 0);
        assert_eq!(dept.used_cost, 0);
    }

    #[tokio::test]
    async fn malformed_body_is_invalid_request() {
        let h = harness(10_000_000, 0);
        let response = h
            .app
            .clone()
            .oneshot(post_chat(Some(&h.token), json!({"model": "scripted"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["kind"], "invalid_request");
    }

    #[tokio::test]
    async fn exhausted_department_gets_429() {
        let h = harness(10_000_000, 9_999_990);
        let response = h
            .app
            .clone()
            .oneshot(post_chat(
                Some(&h.token),
                json!({"message": "hi", "model": "scripted", "max_tokens": 100}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let body = body_json(response).await;
        assert_eq!(body["kind"], "quota_exceeded");
        assert_eq!(body["remaining_budget"], 0.00001);
    }

    #[tokio::test]
    async fn streams_events_and_stores_history() {
        let h = harness(10_000_000, 0);
        let response = h
            .app
            .clone()
            .oneshot(post_chat(
                Some(&h.token),
                json!({"message": "say hello", "model": "scripted", "max_tokens": 50}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CONTENT_TYPE], "text/event-stream");

        let events = SseParser::new().process(&body_bytes(response).await);
        let names: Vec<_> = events.iter().filter_map(|e| e.event.as_deref()).collect();
        assert_eq!(names, vec!["start", "chunk", "chunk", "done"]);
        let done: Value = serde_json::from_str(&events[3].data).unwrap();
        let conversation_id = done["conversation_id"].as_i64().unwrap();
        assert_eq!(done["usage"]["total_tokens"], 22);

        // 20 input and 2 output tokens at 1000 micro-units per 1k.
        let dept = department(&h);
        assert_eq!(dept.used_cost, 22);
        assert_eq!(dept.reserved_cost, 0);

        let response = h
            .app
            .clone()
            .oneshot(get(
                &h.token,
                &format!("/api/chat/conversations/{}/messages", conversation_id),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        let messages = body["data"].as_array().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["role"], "user");
        assert_eq!(messages[1]["content"], "Hello");
    }

    #[tokio::test]
    async fn other_users_conversations_are_forbidden() {
        let h = harness(10_000_000, 0);
        let response = h
            .app
            .clone()
            .oneshot(post_chat(
                Some(&h.token),
                json!({"message": "mine", "model": "scripted"}),
            ))
            .await
            .unwrap();
        let events = SseParser::new().process(&body_bytes(response).await);
        let start: Value = serde_json::from_str(&events[0].data).unwrap();
        let conversation_id = start["conversation_id"].as_i64().unwrap();

        let intruder = seed_user(&h.db.pool, Some(h.department_id));
        let token = issue_access_token(&AuthKeys::new(TEST_JWT_SECRET), intruder.id);
        let response = h
            .app
            .clone()
            .oneshot(get(
                &token,
                &format!("/api/chat/conversations/{}/messages", conversation_id),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn quota_reflects_settled_usage() {
        let h = harness(10_000_000, 0);
        let response = h
            .app
            .clone()
            .oneshot(post_chat(
                Some(&h.token),
                json!({"message": "hello", "model": "scripted"}),
            ))
            .await
            .unwrap();
        body_bytes(response).await;

        let response = h
            .app
            .clone()
            .oneshot(get(&h.token, "/api/chat/quota"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["data"]["department_id"], h.department_id);
        assert_eq!(body["data"]["used_cost"], 0.000022);
        assert_eq!(body["data"]["reserved_cost"], 0.0);
        assert_eq!(body["data"]["request_count"], 1);
        assert_eq!(body["data"]["token_count"], 22);
    }

    #[tokio::test]
    async fn estimate_cost_leaves_budget_untouched() {
        let h = harness(10_000_000, 0);
        let response = h
            .app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/chat/estimate-cost")
                    .header(CONTENT_TYPE, "application/json")
                    .header("authorization", format!("Bearer {}", h.token))
                    .body(Body::from(
                        json!({"message": "hi", "model": "scripted", "max_tokens": 10}).to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["data"]["model"], "scripted");
        assert_eq!(body["data"]["max_output_tokens"], 10);
        assert_eq!(body["data"]["within_quota"], true);
        assert_eq!(department(&h).reserved_requests, 0);
    }

    #[tokio::test]
    async fn lists_routable_models() {
        let h = harness(10_000_000, 0);
        let response = h
            .app
            .clone()
            .oneshot(get(&h.token, "/api/chat/models"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["code"], 0);
        assert_eq!(body["data"][0]["name"], "scripted");
    }
}
