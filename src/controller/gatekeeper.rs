use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{header::AUTHORIZATION, HeaderMap},
    middleware::Next,
    response::Response,
};
use cyder_tools::log::{debug, warn};

use super::error::GatewayError;
use crate::database::run_blocking;
use crate::database::user::AppUser;
use crate::schema::enum_def::UserRole;
use crate::service::app_state::AppState;
use crate::utils::auth::decode_access_token;

/// The authenticated user behind a request, inserted into request extensions.
#[derive(Debug, Clone)]
pub struct Caller {
    pub user_id: i64,
    pub department_id: i64,
    pub role: UserRole,
}

fn bearer_token(headers: &HeaderMap) -> Result<&str, GatewayError> {
    let header = headers
        .get(AUTHORIZATION)
        .ok_or_else(|| GatewayError::Unauthorized("missing authorization header".to_string()))?
        .to_str()
        .map_err(|_| GatewayError::Unauthorized("malformed authorization header".to_string()))?;
    let mut parts = header.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some(scheme), Some(token)) if scheme.eq_ignore_ascii_case("bearer") => Ok(token),
        _ => Err(GatewayError::Unauthorized(
            "expected a bearer token".to_string(),
        )),
    }
}

pub async fn authenticate(state: &AppState, token: &str) -> Result<Caller, GatewayError> {
    let user_id = decode_access_token(&state.auth, token).map_err(|e| {
        debug!("rejected access token: {:?}", e);
        GatewayError::Unauthorized("invalid or expired token".to_string())
    })?;

    let user = run_blocking(&state.db, move |conn| AppUser::find(conn, user_id)).await?;
    let user = match user {
        Some(user) if user.is_active => user,
        Some(user) => {
            warn!("inactive user {} attempted a request", user.id);
            return Err(GatewayError::Unauthorized("user is inactive".to_string()));
        }
        None => return Err(GatewayError::Unauthorized("unknown user".to_string())),
    };
    let department_id = user.department_id.ok_or_else(|| {
        warn!("user {} has no department", user.id);
        GatewayError::Forbidden("user is not assigned to a department".to_string())
    })?;

    debug!(
        "authenticated user {} ({:?}) in department {}",
        user.id, user.role, department_id
    );
    Ok(Caller {
        user_id: user.id,
        department_id,
        role: user.role,
    })
}

pub async fn gatekeeper_middleware(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Result<Response, GatewayError> {
    let token = bearer_token(req.headers())?.to_string();
    let caller = authenticate(&state, &token).await?;
    req.extensions_mut().insert(caller);
    Ok(next.run(req).await)
}
