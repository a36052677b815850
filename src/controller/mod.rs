use std::sync::Arc;

use axum::{
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Router,
};
use tower_http::cors::CorsLayer;

use crate::service::app_state::{create_state_router, AppState, StateRouter};
use crate::utils::HttpResult;
use chat::create_chat_router;

pub mod chat;
pub mod error;
pub mod gatekeeper;

async fn health() -> HttpResult<&'static str> {
    HttpResult::new("ok")
}

pub async fn handle_404() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, "not found")
}

fn create_api_router(app_state: &Arc<AppState>) -> StateRouter {
    create_state_router()
        .route("/health", get(health))
        .merge(create_chat_router(app_state))
}

/// Full application router with every API route mounted under `base_path`.
pub fn create_router(app_state: Arc<AppState>, base_path: &str) -> Router {
    let api = create_api_router(&app_state);
    let base_path = base_path.trim_end_matches('/');
    let routes = if base_path.is_empty() {
        api
    } else {
        create_state_router().nest(base_path, api)
    };
    routes
        .fallback(handle_404)
        .layer(CorsLayer::permissive())
        .with_state(app_state)
}
