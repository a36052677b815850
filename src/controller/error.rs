use axum::{
    Json,
    http::{HeaderValue, StatusCode, header::RETRY_AFTER},
    response::{IntoResponse, Response},
};
use cyder_tools::log::error;
use serde_json::json;
use thiserror::Error;

use crate::service::provider::ProviderError;
use crate::utils::billing::micros_to_amount;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("department quota exceeded")]
    QuotaExceeded { remaining: i64 },
    #[error("model '{0}' is not available")]
    UnknownModel(String),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    ParamInvalid(String),
    #[error("{0}")]
    NotFound(String),
    #[error("database error: {0}")]
    Database(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Stable machine-readable kind, shared by JSON bodies and SSE error events.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::QuotaExceeded { .. } => "quota_exceeded",
            GatewayError::UnknownModel(_) => "unknown_model",
            GatewayError::Provider(e) => e.kind(),
            GatewayError::Unauthorized(_) => "unauthorized",
            GatewayError::Forbidden(_) => "forbidden",
            GatewayError::ParamInvalid(_) => "invalid_request",
            GatewayError::NotFound(_) => "not_found",
            GatewayError::Database(_) | GatewayError::Internal(_) => "service_unavailable",
        }
    }

    fn code(&self) -> u32 {
        match self {
            GatewayError::ParamInvalid(_) => 1001,
            GatewayError::NotFound(_) => 1002,
            GatewayError::Unauthorized(_) => 1003,
            GatewayError::Forbidden(_) => 1004,
            GatewayError::QuotaExceeded { .. } => 2001,
            GatewayError::UnknownModel(_) => 2002,
            GatewayError::Provider(_) => 3001,
            GatewayError::Database(_) => 1100,
            GatewayError::Internal(_) => 0,
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            GatewayError::QuotaExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::UnknownModel(_) | GatewayError::ParamInvalid(_) => StatusCode::BAD_REQUEST,
            GatewayError::Provider(ProviderError::RateLimited { .. }) => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::Provider(_) => StatusCode::BAD_GATEWAY,
            GatewayError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            GatewayError::Forbidden(_) => StatusCode::FORBIDDEN,
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::Database(_) | GatewayError::Internal(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
        }
    }

    /// Message safe to show to the caller. Internal failures never leak details.
    pub fn public_message(&self) -> String {
        match self {
            GatewayError::Database(_) | GatewayError::Internal(_) => {
                "service temporarily unavailable".to_string()
            }
            other => other.to_string(),
        }
    }
}

impl From<diesel::result::Error> for GatewayError {
    fn from(err: diesel::result::Error) -> Self {
        GatewayError::Database(err.to_string())
    }
}

impl From<r2d2::Error> for GatewayError {
    fn from(err: r2d2::Error) -> Self {
        GatewayError::Database(format!("connection pool: {}", err))
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        if matches!(self, GatewayError::Database(_) | GatewayError::Internal(_)) {
            error!("request failed with internal error: {}", self);
        }
        let status = self.status();
        let mut body = json!({
            "code": self.code(),
            "kind": self.kind(),
            "msg": self.public_message(),
        });
        match &self {
            GatewayError::QuotaExceeded { remaining } => {
                body["remaining_budget"] = json!(micros_to_amount(*remaining));
            }
            GatewayError::Provider(ProviderError::RateLimited {
                retry_after: Some(secs),
                ..
            }) => {
                body["retry_after"] = json!(secs);
            }
            _ => {}
        }

        let mut response = (status, Json(body)).into_response();
        if let GatewayError::Provider(ProviderError::RateLimited {
            retry_after: Some(secs),
            ..
        }) = &self
        {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(RETRY_AFTER, value);
            }
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn quota_exceeded_reports_remaining_budget() {
        let response = GatewayError::QuotaExceeded { remaining: 500_000 }.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let body = body_json(response).await;
        assert_eq!(body["kind"], "quota_exceeded");
        assert_eq!(body["remaining_budget"], 0.5);
    }

    #[tokio::test]
    async fn database_errors_are_masked() {
        let response =
            GatewayError::Database("relation \"department\" does not exist".into()).into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = body_json(response).await;
        assert_eq!(body["kind"], "service_unavailable");
        assert!(!body["msg"].as_str().unwrap().contains("department"));
    }

    #[tokio::test]
    async fn rate_limit_echoes_retry_after() {
        let err = GatewayError::from(ProviderError::RateLimited {
            retry_after: Some(7),
            message: "slow down".into(),
        });
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get(RETRY_AFTER).unwrap(), "7");
        let body = body_json(response).await;
        assert_eq!(body["kind"], "provider_rate_limited");
        assert_eq!(body["retry_after"], 7);
    }
}
