use cyder_tools::auth::{decode_jwt, DecodingKey, EncodingKey, JwtError, JwtValidation};
use serde::{Deserialize, Serialize};

const ISSUER: &str = "aidock";

/// HMAC key pair for bearer tokens. Tokens are issued by the account service;
/// the gateway only verifies them.
pub struct AuthKeys {
    #[cfg_attr(not(test), allow(dead_code))]
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl AuthKeys {
    pub fn new(secret: &[u8]) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct AccessClaims {
    aud: String,
    exp: u64,
    iat: u64,
    iss: String,
    sub: String,
}

/// Verifies an access token and returns the user id carried in `aud`.
pub fn decode_access_token(keys: &AuthKeys, token: &str) -> Result<i64, JwtError> {
    let validate = JwtValidation {
        validate_aud: false,
        issuer: ISSUER,
        required_spec: &["sub", "iat", "exp"],
    };
    let claims = decode_jwt::<AccessClaims>(&keys.decoding, token, validate)?;
    claims.aud.parse::<i64>().map_err(|_| JwtError::Parse)
}

#[cfg(test)]
pub fn issue_access_token(keys: &AuthKeys, user_id: i64) -> String {
    let now = chrono::Utc::now().timestamp() as u64;
    let claims = AccessClaims {
        aud: user_id.to_string(),
        exp: now + 3600,
        iat: now,
        iss: ISSUER.to_string(),
        sub: "ACCESS_TOKEN".to_string(),
    };
    cyder_tools::auth::issue_jwt(&keys.encoding, &claims)
}
