use std::sync::Arc;

use axum::async_trait;
use axum::{
    extract::{
        path::ErrorKind,
        rejection::{FormRejection, JsonRejection, PathRejection, QueryRejection},
        FromRequest, FromRequestParts, Path, Query, RawPathParams,
    },
    http::{header, request::Parts, HeaderMap, Request},
    Form, Json,
};
use serde::de::DeserializeOwned;

use crate::auth::{CredentialVerifier, Principal, TokenKeys};
use crate::error::AppError;
use crate::models::Validate;

/// The authenticated caller. Every business route takes one, so a request without a
/// valid bearer token never reaches a handler body.
pub struct AuthUser {
    pub principal: Principal,
}

/// The auth scheme is matched case-insensitively.
fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    Some(token.trim()).filter(|token| !token.is_empty())
}

#[async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let token = bearer_token(&parts.headers).ok_or(AppError::Unauthorized)?;
        let keys = parts
            .extensions
            .get::<Arc<TokenKeys>>()
            .ok_or_else(|| AppError::Message("token keys not configured".into()))?;
        let claims = keys.validate(token)?;
        let verifier = parts
            .extensions
            .get::<Arc<dyn CredentialVerifier>>()
            .cloned()
            .ok_or_else(|| AppError::Message("credential verifier not configured".into()))?;
        let principal = verifier
            .principal(&claims.sub)
            .await
            .ok_or(AppError::Unauthorized)?;
        Ok(AuthUser { principal })
    }
}

/// Pulls the field name out of serde messages such as "missing field `patientId`".
fn field_from_message(message: &str) -> Option<String> {
    ["missing field `", "unknown field `", "duplicate field `"]
        .iter()
        .find_map(|marker| {
            let start = message.find(marker)? + marker.len();
            let len = message[start..].find('`')?;
            Some(message[start..start + len].to_string())
        })
}

fn rejection_error(fallback: &str, message: String) -> AppError {
    let field = field_from_message(&message).unwrap_or_else(|| fallback.to_string());
    AppError::invalid(field, message)
}

/// JSON body that is deserialized and validated, rejecting with a 400 naming the
/// offending field.
pub struct ApiJson<T>(pub T);

#[async_trait]
impl<S, B, T> FromRequest<S, B> for ApiJson<T>
where
    Json<T>: FromRequest<S, B, Rejection = JsonRejection>,
    T: Validate,
    S: Send + Sync,
    B: Send + 'static,
{
    type Rejection = AppError;

    async fn from_request(req: Request<B>, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state)
            .await
            .map_err(|rejection| rejection_error("body", rejection.body_text()))?;
        value.validate()?;
        Ok(Self(value))
    }
}

/// Form-encoded counterpart of [`ApiJson`].
pub struct ApiForm<T>(pub T);

#[async_trait]
impl<S, B, T> FromRequest<S, B> for ApiForm<T>
where
    Form<T>: FromRequest<S, B, Rejection = FormRejection>,
    T: Validate,
    S: Send + Sync,
    B: Send + 'static,
{
    type Rejection = AppError;

    async fn from_request(req: Request<B>, state: &S) -> Result<Self, Self::Rejection> {
        let Form(value) = Form::<T>::from_request(req, state)
            .await
            .map_err(|rejection| rejection_error("body", rejection.body_text()))?;
        value.validate()?;
        Ok(Self(value))
    }
}

/// Query-string counterpart of [`ApiJson`].
pub struct ApiQuery<T>(pub T);

#[async_trait]
impl<S, T> FromRequestParts<S> for ApiQuery<T>
where
    Query<T>: FromRequestParts<S, Rejection = QueryRejection>,
    T: Validate,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Query(value) = Query::<T>::from_request_parts(parts, state)
            .await
            .map_err(|rejection| rejection_error("query", rejection.body_text()))?;
        value.validate()?;
        Ok(Self(value))
    }
}

/// Path parameters whose parse failures are reported against the route parameter name.
pub struct ApiPath<T>(pub T);

#[async_trait]
impl<S, T> FromRequestParts<S> for ApiPath<T>
where
    T: DeserializeOwned + Send,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let rejection = match Path::<T>::from_request_parts(parts, state).await {
            Ok(Path(value)) => return Ok(Self(value)),
            Err(rejection) => rejection,
        };
        let keyed = match &rejection {
            PathRejection::FailedToDeserializePathParams(inner) => match inner.kind() {
                ErrorKind::ParseErrorAtKey { key, .. } => Some(key.clone()),
                ErrorKind::InvalidUtf8InPathParam { key } => Some(key.clone()),
                _ => None,
            },
            _ => None,
        };
        let field = match keyed {
            Some(key) => key,
            // single-value paths report no key; use the only parameter there is
            None => RawPathParams::from_request_parts(parts, state)
                .await
                .ok()
                .and_then(|params| params.iter().next().map(|(key, _)| key.to_string()))
                .unwrap_or_else(|| "path".to_string()),
        };
        Err(AppError::invalid(field, rejection.body_text()))
    }
}
