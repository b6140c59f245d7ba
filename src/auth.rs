//! Bearer-token authentication.
//!
//! Tokens are minted by the storefront's auth service; this crate only
//! verifies them (HS256 with a shared secret) and exposes the caller's id
//! through the [`AuthUser`] extractor.

use axum::{
    async_trait,
    extract::{FromRef, FromRequestParts},
    http::{header, request::Parts},
};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::errors::ServiceError;

/// JWT claims accepted by the API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String, // Subject (user ID)
    pub exp: i64,
    pub iat: i64,
    pub iss: String,
    pub aud: String,
}

/// Token verification settings
#[derive(Clone)]
pub struct AuthConfig {
    secret: Arc<str>,
    pub issuer: String,
    pub audience: String,
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("issuer", &self.issuer)
            .field("audience", &self.audience)
            .finish_non_exhaustive()
    }
}

impl AuthConfig {
    pub fn new(secret: impl Into<String>, issuer: impl Into<String>, audience: impl Into<String>) -> Self {
        Self {
            secret: Arc::from(secret.into()),
            issuer: issuer.into(),
            audience: audience.into(),
        }
    }

    pub fn from_app_config(config: &AppConfig) -> Self {
        Self::new(
            config.jwt_secret.clone(),
            config.jwt_issuer.clone(),
            config.jwt_audience.clone(),
        )
    }

    /// Verifies signature, expiry, issuer and audience.
    pub fn validate_token(&self, token: &str) -> Result<Claims, ServiceError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[self.issuer.as_str()]);
        validation.set_audience(&[self.audience.as_str()]);

        decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &validation,
        )
        .map(|data| data.claims)
        .map_err(|e| match e.kind() {
            jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
                ServiceError::Unauthorized("Token expired".to_string())
            }
            _ => {
                debug!(error = %e, "rejected bearer token");
                ServiceError::Unauthorized("Invalid token".to_string())
            }
        })
    }

    /// Mints a token for `user_id`. Used by tests and local tooling.
    pub fn issue_token(&self, user_id: Uuid, ttl: Duration) -> Result<String, ServiceError> {
        let now = Utc::now();
        let claims = Claims {
            sub: user_id.to_string(),
            exp: (now + ttl).timestamp(),
            iat: now.timestamp(),
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
        };

        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )
        .map_err(|e| ServiceError::InternalError(format!("token creation failed: {}", e)))
    }
}

/// Authenticated caller, extracted from `Authorization: Bearer <jwt>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthUser {
    pub user_id: Uuid,
}

#[async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    AuthConfig: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = ServiceError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let auth = AuthConfig::from_ref(state);

        let token = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .ok_or_else(|| ServiceError::Unauthorized("Missing bearer token".to_string()))?;

        let claims = auth.validate_token(token)?;
        let user_id = Uuid::parse_str(&claims.sub)
            .map_err(|_| ServiceError::Unauthorized("Invalid token subject".to_string()))?;

        Ok(AuthUser { user_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> AuthConfig {
        AuthConfig::new("k9Vq2xLr7TzP4mWc8HsN3bYd6FjQ1gAe", "storefront-auth", "storefront-api")
    }

    #[test]
    fn issued_tokens_validate() {
        let auth = config();
        let user_id = Uuid::new_v4();
        let token = auth.issue_token(user_id, Duration::minutes(5)).unwrap();
        let claims = auth.validate_token(&token).unwrap();
        assert_eq!(claims.sub, user_id.to_string());
    }

    #[test]
    fn rejects_expired_and_foreign_tokens() {
        let auth = config();
        let expired = auth
            .issue_token(Uuid::new_v4(), Duration::minutes(-10))
            .unwrap();
        assert!(matches!(
            auth.validate_token(&expired),
            Err(ServiceError::Unauthorized(msg)) if msg == "Token expired"
        ));

        let other_audience = AuthConfig::new(
            "k9Vq2xLr7TzP4mWc8HsN3bYd6FjQ1gAe",
            "storefront-auth",
            "admin-console",
        );
        let token = other_audience
            .issue_token(Uuid::new_v4(), Duration::minutes(5))
            .unwrap();
        assert!(auth.validate_token(&token).is_err());

        let other_secret =
            AuthConfig::new("Zx8Qw2Er4Ty6Ui8Op0As2Df4Gh6Jk8Lm", "storefront-auth", "storefront-api");
        let token = other_secret
            .issue_token(Uuid::new_v4(), Duration::minutes(5))
            .unwrap();
        assert!(auth.validate_token(&token).is_err());
    }

    #[tokio::test]
    async fn extractor_requires_bearer_header() {
        let auth = config();
        let user_id = Uuid::new_v4();
        let token = auth.issue_token(user_id, Duration::minutes(5)).unwrap();

        let (mut parts, _) = axum::http::Request::builder()
            .header(header::AUTHORIZATION, format!("Bearer {}", token))
            .body(())
            .unwrap()
            .into_parts();
        let user = AuthUser::from_request_parts(&mut parts, &auth).await.unwrap();
        assert_eq!(user.user_id, user_id);

        let (mut parts, _) = axum::http::Request::builder()
            .body(())
            .unwrap()
            .into_parts();
        assert!(matches!(
            AuthUser::from_request_parts(&mut parts, &auth).await,
            Err(ServiceError::Unauthorized(_))
        ));
    }
}
