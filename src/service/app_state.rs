use std::sync::Arc;

use axum::Router;
use cyder_tools::log::info;

use super::provider::ProviderRouter;
use super::quota::QuotaGuard;
use super::relay::StreamRelay;
use super::usage_recorder::UsageRecorder;
use crate::config::{ChatConfig, FinalConfig, QuotaConfig};
use crate::controller::error::GatewayError;
use crate::database::DbPool;
use crate::utils::auth::AuthKeys;

pub struct AppState {
    pub db: DbPool,
    pub quota: QuotaGuard,
    pub router: ProviderRouter,
    pub recorder: UsageRecorder,
    pub relay: StreamRelay,
    pub auth: AuthKeys,
    pub chat: ChatConfig,
}

impl AppState {
    /// Wires the request-path services around one pool. Spawns the usage
    /// writer, so it must run inside the runtime.
    pub fn new(
        db: DbPool,
        router: ProviderRouter,
        auth: AuthKeys,
        quota_config: &QuotaConfig,
        chat: ChatConfig,
    ) -> Self {
        let quota = QuotaGuard::new(db.clone(), quota_config.reservation_ttl());
        let recorder = UsageRecorder::spawn(db.clone());
        let relay = StreamRelay::new(
            db.clone(),
            quota.clone(),
            recorder.clone(),
            chat.stream_idle_timeout(),
            chat.relay_buffer,
        );
        Self {
            db,
            quota,
            router,
            recorder,
            relay,
            auth,
            chat,
        }
    }
}

pub fn create_app_state(config: &FinalConfig) -> Result<Arc<AppState>, GatewayError> {
    let db = DbPool::establish(&config.db_url)?;
    info!("database ready at {}", redact_db_url(&config.db_url));
    let router = ProviderRouter::from_config(&config.providers, config.proxy.as_deref())?;
    let auth = AuthKeys::new(config.jwt_secret.as_bytes());
    Ok(Arc::new(AppState::new(
        db,
        router,
        auth,
        &config.quota,
        config.chat.clone(),
    )))
}

fn redact_db_url(db_url: &str) -> String {
    match (db_url.find("://"), db_url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***{}", &db_url[..scheme_end], &db_url[at..])
        }
        _ => db_url.to_string(),
    }
}

pub type StateRouter = Router<Arc<AppState>>;

pub fn create_state_router() -> StateRouter {
    Router::<Arc<AppState>>::new()
}

#[cfg(test)]
pub const TEST_JWT_SECRET: &[u8] = b"gateway-test-secret";

#[cfg(test)]
pub fn test_state(db: &DbPool, router: ProviderRouter) -> Arc<AppState> {
    Arc::new(AppState::new(
        db.clone(),
        router,
        AuthKeys::new(TEST_JWT_SECRET),
        &QuotaConfig::default(),
        ChatConfig::default(),
    ))
}
