use axum::{
    extract::Extension,
    http::StatusCode,
    routing::get,
    Json, Router,
};

use crate::db::Database;
use crate::error::AppResult;
use crate::extractor::{ApiJson, ApiPath, ApiQuery, AuthUser};
use crate::models::{AuthorizationFilter, AuthorizationRequest, DecisionRequest, NewAuthorization};

use super::service;

// key: authorizations-api -> rest endpoints
pub fn routes() -> Router {
    Router::new()
        .route("/authorizations", get(list_authorizations).post(submit_authorization))
        .route(
            "/authorizations/:id",
            get(get_authorization).patch(decide_authorization),
        )
}

pub async fn submit_authorization(
    Extension(db): Extension<Database>,
    AuthUser { principal }: AuthUser,
    ApiJson(payload): ApiJson<NewAuthorization>,
) -> AppResult<(StatusCode, Json<AuthorizationRequest>)> {
    let mut session = db.open_session().await?;
    let authorization = service::submit_authorization(&mut session, &payload).await?;
    session.commit().await?;
    tracing::debug!(username = %principal.username, id = authorization.id, "submit handled");
    Ok((StatusCode::CREATED, Json(authorization)))
}

pub async fn list_authorizations(
    Extension(db): Extension<Database>,
    _user: AuthUser,
    ApiQuery(filter): ApiQuery<AuthorizationFilter>,
) -> AppResult<Json<Vec<AuthorizationRequest>>> {
    let mut session = db.open_session().await?;
    let authorizations = service::list_authorizations(&mut session, &filter).await?;
    session.commit().await?;
    Ok(Json(authorizations))
}

pub async fn get_authorization(
    Extension(db): Extension<Database>,
    _user: AuthUser,
    ApiPath(id): ApiPath<i64>,
) -> AppResult<Json<AuthorizationRequest>> {
    let mut session = db.open_session().await?;
    let authorization = service::get_authorization(&mut session, id).await?;
    session.commit().await?;
    Ok(Json(authorization))
}

pub async fn decide_authorization(
    Extension(db): Extension<Database>,
    AuthUser { principal }: AuthUser,
    ApiPath(id): ApiPath<i64>,
    ApiJson(payload): ApiJson<DecisionRequest>,
) -> AppResult<Json<AuthorizationRequest>> {
    let mut session = db.open_session().await?;
    let authorization = service::decide_authorization(&mut session, id, &payload).await?;
    session.commit().await?;
    tracing::debug!(username = %principal.username, id, "decision handled");
    Ok(Json(authorization))
}
