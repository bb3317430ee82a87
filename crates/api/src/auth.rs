//! Bearer-token authentication
//!
//! Resolves a request to a user identity. Token issuance lives in the
//! identity service; this side only validates HS256 access tokens and
//! extracts the subject.

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{header, request::Parts},
};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ApiError;
use crate::state::AppState;

/// JWT claims for Shelfscore access tokens
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (user ID)
    pub sub: Uuid,
    /// Email
    pub email: String,
    /// Issued at
    pub iat: i64,
    /// Expiration
    pub exp: i64,
}

/// Validates access tokens
#[derive(Clone)]
pub struct JwtVerifier {
    decoding_key: DecodingKey,
}

impl JwtVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
        }
    }

    /// Validate a token and return its claims
    pub fn verify(&self, token: &str) -> Result<Claims, ApiError> {
        let validation = Validation::new(Algorithm::HS256);
        decode::<Claims>(token, &self.decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(|_| ApiError::InvalidToken)
    }
}

/// The resolved identity of an authenticated request
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: Uuid,
    pub email: String,
}

#[async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .ok_or(ApiError::Unauthorized)?;

        let claims = state.jwt.verify(token)?;
        Ok(AuthUser {
            user_id: claims.sub,
            email: claims.email,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use time::{Duration, OffsetDateTime};

    fn token_for(secret: &str, exp_offset: Duration) -> String {
        let now = OffsetDateTime::now_utc();
        let claims = Claims {
            sub: Uuid::new_v4(),
            email: "user@example.com".to_string(),
            iat: now.unix_timestamp(),
            exp: (now + exp_offset).unix_timestamp(),
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn test_valid_token_verifies() {
        let verifier = JwtVerifier::new("test-secret");
        let token = token_for("test-secret", Duration::hours(1));
        let claims = verifier.verify(&token).unwrap();
        assert_eq!(claims.email, "user@example.com");
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let verifier = JwtVerifier::new("test-secret");
        let token = token_for("other-secret", Duration::hours(1));
        assert!(matches!(verifier.verify(&token), Err(ApiError::InvalidToken)));
    }

    #[test]
    fn test_expired_token_rejected() {
        let verifier = JwtVerifier::new("test-secret");
        let token = token_for("test-secret", Duration::hours(-2));
        assert!(matches!(verifier.verify(&token), Err(ApiError::InvalidToken)));
    }
}
