use std::sync::Arc;

use argon2::password_hash::{PasswordHash, SaltString};
use argon2::{Argon2, PasswordHasher, PasswordVerifier};
use axum::async_trait;
use axum::{extract::Extension, Json};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use rand_core::OsRng;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::error::{AppError, AppResult};
use crate::extractor::{ApiForm, AuthUser};
use crate::models::Validate;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Principal {
    pub username: String,
}

/// Decides who may obtain a token and whether a token subject is still a known
/// principal.
#[async_trait]
pub trait CredentialVerifier: Send + Sync {
    async fn verify(&self, username: &str, password: &str) -> AppResult<Option<Principal>>;

    async fn principal(&self, subject: &str) -> Option<Principal>;
}

/// A single configured principal whose password is kept only as an argon2 hash.
pub struct StaticCredentials {
    username: String,
    password_hash: String,
}

impl StaticCredentials {
    pub fn new(username: &str, password: &str) -> AppResult<Self> {
        let salt = SaltString::generate(&mut OsRng);
        let hash = Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| AppError::Message(format!("Hashing failed: {}", e)))?;
        Ok(Self {
            username: username.to_string(),
            password_hash: hash.to_string(),
        })
    }
}

#[async_trait]
impl CredentialVerifier for StaticCredentials {
    async fn verify(&self, username: &str, password: &str) -> AppResult<Option<Principal>> {
        let parsed = PasswordHash::new(&self.password_hash).map_err(|e| {
            error!(?e, "Hash parse error");
            AppError::Message(format!("Hash error: {}", e))
        })?;
        let password_ok = Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok();
        if username != self.username || !password_ok {
            return Ok(None);
        }
        Ok(Some(Principal {
            username: self.username.clone(),
        }))
    }

    async fn principal(&self, subject: &str) -> Option<Principal> {
        (subject == self.username).then(|| Principal {
            username: self.username.clone(),
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub iat: usize,
    pub exp: usize,
}

/// HS256 signing and validation keys plus the lifetime of issued tokens.
pub struct TokenKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl: Duration,
}

impl TokenKeys {
    pub fn new(secret: &str, ttl: Duration) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            ttl,
        }
    }

    pub fn issue(&self, subject: &str) -> AppResult<String> {
        let now = Utc::now();
        let claims = Claims {
            sub: subject.to_string(),
            iat: now.timestamp().max(0) as usize,
            exp: (now + self.ttl).timestamp().max(0) as usize,
        };
        encode(&Header::default(), &claims, &self.encoding).map_err(|e| {
            error!(?e, "Token encoding error");
            AppError::Message("Token error".into())
        })
    }

    pub fn validate(&self, token: &str) -> AppResult<Claims> {
        decode::<Claims>(token, &self.decoding, &Validation::default())
            .map(|data| data.claims)
            .map_err(|e| {
                warn!(error = %e, "rejected bearer token");
                AppError::Unauthorized
            })
    }
}

#[derive(Deserialize)]
pub struct TokenRequest {
    pub username: String,
    pub password: String,
}

impl Validate for TokenRequest {
    fn validate(&self) -> AppResult<()> {
        if self.username.trim().is_empty() {
            return Err(AppError::invalid("username", "must not be empty"));
        }
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: String,
}

/// OAuth2 password flow: form-encoded `username` and `password`.
pub async fn issue_token(
    Extension(verifier): Extension<Arc<dyn CredentialVerifier>>,
    Extension(keys): Extension<Arc<TokenKeys>>,
    ApiForm(form): ApiForm<TokenRequest>,
) -> AppResult<Json<TokenResponse>> {
    let principal = verifier
        .verify(&form.username, &form.password)
        .await?
        .ok_or(AppError::Unauthorized)?;
    let access_token = keys.issue(&principal.username)?;
    info!(username = %principal.username, "access token issued");
    Ok(Json(TokenResponse {
        access_token,
        token_type: "bearer".into(),
    }))
}

pub async fn current_user(AuthUser { principal }: AuthUser) -> Json<Principal> {
    Json(principal)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_credentials_accept_only_the_configured_pair() {
        let credentials = StaticCredentials::new("admin", "s3cret").unwrap();
        assert_eq!(
            credentials.verify("admin", "s3cret").await.unwrap(),
            Some(Principal {
                username: "admin".into()
            })
        );
        assert_eq!(credentials.verify("admin", "wrong").await.unwrap(), None);
        assert_eq!(credentials.verify("root", "s3cret").await.unwrap(), None);
        assert!(credentials.principal("admin").await.is_some());
        assert!(credentials.principal("root").await.is_none());
    }

    #[test]
    fn issued_token_validates_with_same_secret() {
        let keys = TokenKeys::new("secret", Duration::minutes(30));
        let token = keys.issue("admin").unwrap();
        let claims = keys.validate(&token).unwrap();
        assert_eq!(claims.sub, "admin");
        assert!(claims.exp > claims.iat);
    }

    #[test]
    fn token_signed_with_other_secret_is_rejected() {
        let token = TokenKeys::new("other", Duration::minutes(30))
            .issue("admin")
            .unwrap();
        let keys = TokenKeys::new("secret", Duration::minutes(30));
        assert!(matches!(keys.validate(&token), Err(AppError::Unauthorized)));
    }

    #[test]
    fn expired_token_is_rejected() {
        let keys = TokenKeys::new("secret", Duration::minutes(-10));
        let token = keys.issue("admin").unwrap();
        assert!(matches!(keys.validate(&token), Err(AppError::Unauthorized)));
    }
}
