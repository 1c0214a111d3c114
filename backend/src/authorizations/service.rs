use chrono::Utc;
use sqlx::Row;
use tracing::info;

use crate::catalog;
use crate::db::Session;
use crate::error::{is_write_conflict, AppError, AppResult};
use crate::models::{
    timestamp_text, AuthorizationFilter, AuthorizationRequest, AuthorizationStatus,
    DecisionRequest, NewAuthorization, Validate,
};

const AUTHORIZATION_COLUMNS: &str = "id, patient_id, provider_id, treatment_id, justification, \
    status, requested_at, decided_at, decision_notes";

// key: authorization-lifecycle -> submit
/// Every reference must resolve before a PENDING request is written.
pub async fn submit_authorization(
    session: &mut Session,
    request: &NewAuthorization,
) -> AppResult<AuthorizationRequest> {
    request.validate()?;
    catalog::require_patient(session, request.patient_id).await?;
    catalog::require_provider(session, request.provider_id).await?;
    catalog::require_treatment(session, request.treatment_id).await?;

    let row = sqlx::query(
        r#"
        INSERT INTO authorization_requests (
            patient_id,
            provider_id,
            treatment_id,
            justification,
            status,
            requested_at
        ) VALUES ($1, $2, $3, $4, $5, $6)
        RETURNING id
        "#,
    )
    .bind(request.patient_id)
    .bind(request.provider_id)
    .bind(request.treatment_id)
    .bind(request.justification.clone())
    .bind(AuthorizationStatus::Pending.as_str())
    .bind(timestamp_text(Utc::now()))
    .fetch_one(&mut **session)
    .await
    .map_err(|e| {
        tracing::error!(?e, "DB error inserting authorization request");
        AppError::Db(e)
    })?;
    let id: i64 = row.try_get("id")?;
    info!(
        authorization_id = id,
        patient_id = request.patient_id,
        provider_id = request.provider_id,
        treatment_id = request.treatment_id,
        "authorization submitted"
    );
    get_authorization(session, id).await
}

pub async fn find_authorization(
    session: &mut Session,
    id: i64,
) -> AppResult<Option<AuthorizationRequest>> {
    let row = sqlx::query(&format!(
        "SELECT {AUTHORIZATION_COLUMNS} FROM authorization_requests WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(&mut **session)
    .await?;
    Ok(row.as_ref().map(AuthorizationRequest::from_row).transpose()?)
}

pub async fn get_authorization(session: &mut Session, id: i64) -> AppResult<AuthorizationRequest> {
    find_authorization(session, id)
        .await?
        .ok_or(AppError::NotFound("authorization"))
}

// key: authorization-lifecycle -> decide
/// Only PENDING requests can be decided, and a decision is never reversed. The update
/// is conditional on the stored status so concurrent deciders cannot both succeed.
pub async fn decide_authorization(
    session: &mut Session,
    id: i64,
    decision: &DecisionRequest,
) -> AppResult<AuthorizationRequest> {
    decision.validate()?;
    let current = get_authorization(session, id).await?;
    if current.status.is_decided() {
        return Err(AppError::InvalidState(format!(
            "authorization {id} is already {}",
            current.status
        )));
    }

    apply_decision(session, id, decision).await?;
    info!(authorization_id = id, decision = %decision.decision, "authorization decided");
    get_authorization(session, id).await
}

/// Moves a PENDING request to its decision. Zero affected rows, or a write the store
/// rejects as conflicting, means another decider got there first.
pub(crate) async fn apply_decision(
    session: &mut Session,
    id: i64,
    decision: &DecisionRequest,
) -> AppResult<()> {
    let result = sqlx::query(
        "UPDATE authorization_requests \
         SET status = $1, decided_at = $2, decision_notes = $3 \
         WHERE id = $4 AND status = $5",
    )
    .bind(decision.decision.as_str())
    .bind(timestamp_text(Utc::now()))
    .bind(decision.notes.clone())
    .bind(id)
    .bind(AuthorizationStatus::Pending.as_str())
    .execute(&mut **session)
    .await
    .map_err(|e| {
        if is_write_conflict(&e) {
            return decided_concurrently(id);
        }
        tracing::error!(?e, "DB error deciding authorization request");
        AppError::Db(e)
    })?;
    if result.rows_affected() == 0 {
        return Err(decided_concurrently(id));
    }
    Ok(())
}

fn decided_concurrently(id: i64) -> AppError {
    AppError::InvalidState(format!("authorization {id} was decided concurrently"))
}

enum FilterValue {
    Id(i64),
    Text(&'static str),
}

/// Newest requests first. An empty filter lists everything, one page at a time.
pub async fn list_authorizations(
    session: &mut Session,
    filter: &AuthorizationFilter,
) -> AppResult<Vec<AuthorizationRequest>> {
    let mut conditions = Vec::new();
    let mut values = Vec::new();
    if let Some(patient_id) = filter.patient_id {
        values.push(FilterValue::Id(patient_id));
        conditions.push(format!("patient_id = ${}", values.len()));
    }
    if let Some(provider_id) = filter.provider_id {
        values.push(FilterValue::Id(provider_id));
        conditions.push(format!("provider_id = ${}", values.len()));
    }
    if let Some(status) = filter.status {
        values.push(FilterValue::Text(status.as_str()));
        conditions.push(format!("status = ${}", values.len()));
    }

    let page = filter.page();
    let mut sql = format!("SELECT {AUTHORIZATION_COLUMNS} FROM authorization_requests");
    if !conditions.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&conditions.join(" AND "));
    }
    sql.push_str(&format!(
        " ORDER BY requested_at DESC, id DESC LIMIT {} OFFSET {}",
        page.limit, page.offset
    ));

    let mut query = sqlx::query(&sql);
    for value in values {
        query = match value {
            FilterValue::Id(id) => query.bind(id),
            FilterValue::Text(text) => query.bind(text),
        };
    }
    let rows = query.fetch_all(&mut **session).await?;
    Ok(rows
        .iter()
        .map(AuthorizationRequest::from_row)
        .collect::<Result<Vec<_>, _>>()?)
}
