use axum::{extract::Extension, routing::get, Json, Router};
use chrono::{NaiveDate, TimeZone, Utc};
use sqlx::Row;

use crate::catalog;
use crate::db::{Database, Session};
use crate::error::{AppError, AppResult};
use crate::extractor::{ApiQuery, AuthUser};
use crate::models::{
    timestamp_text, AuthorizationStatus, AuthorizationTally, InvoiceStatus, InvoiceTally,
    ReportQuery, SubjectType, UsageReport, Validate,
};

pub fn routes() -> Router {
    Router::new().route("/reports", get(usage_report))
}

/// Half-open `[from 00:00, to + 1 day 00:00)` bounds in stored timestamp form.
fn window_bounds(from: NaiveDate, to: NaiveDate) -> AppResult<(String, String)> {
    let start = from
        .and_hms_opt(0, 0, 0)
        .ok_or_else(|| AppError::invalid("from", "out of range"))?;
    let end = to
        .succ_opt()
        .and_then(|day| day.and_hms_opt(0, 0, 0))
        .ok_or_else(|| AppError::invalid("to", "out of range"))?;
    Ok((
        timestamp_text(Utc.from_utc_datetime(&start)),
        timestamp_text(Utc.from_utc_datetime(&end)),
    ))
}

fn decode_status<T>(row: &sqlx::any::AnyRow) -> AppResult<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let status: String = row.try_get("status")?;
    status
        .parse()
        .map_err(|e: T::Err| AppError::Db(sqlx::Error::Decode(Box::new(e))))
}

// key: usage-report -> on-demand aggregation
/// Both dates are inclusive. A known subject with no activity gets a zeroed report.
pub async fn generate_usage_report(
    session: &mut Session,
    query: &ReportQuery,
) -> AppResult<UsageReport> {
    query.validate()?;
    let (subject_name, column) = match query.subject_type {
        SubjectType::Patient => (
            catalog::require_patient(session, query.subject_id)
                .await?
                .full_name(),
            "patient_id",
        ),
        SubjectType::Provider => (
            catalog::require_provider(session, query.subject_id)
                .await?
                .name,
            "provider_id",
        ),
    };
    let (start, end) = window_bounds(query.from, query.to)?;

    let rows = sqlx::query(&format!(
        "SELECT status FROM authorization_requests \
         WHERE {column} = $1 AND requested_at >= $2 AND requested_at < $3"
    ))
    .bind(query.subject_id)
    .bind(start.clone())
    .bind(end.clone())
    .fetch_all(&mut **session)
    .await?;
    let mut authorizations = AuthorizationTally::default();
    for row in &rows {
        authorizations.record(decode_status::<AuthorizationStatus>(row)?);
    }

    let rows = sqlx::query(&format!(
        "SELECT i.status AS status, i.amount AS amount FROM invoices i \
         JOIN authorization_requests a ON a.id = i.authorization_id \
         WHERE a.{column} = $1 AND i.issued_at >= $2 AND i.issued_at < $3"
    ))
    .bind(query.subject_id)
    .bind(start)
    .bind(end)
    .fetch_all(&mut **session)
    .await?;
    let mut invoices = InvoiceTally::default();
    for row in &rows {
        let amount: f64 = row.try_get("amount")?;
        invoices.record(decode_status::<InvoiceStatus>(row)?, amount);
    }

    tracing::info!(
        subject_id = query.subject_id,
        subject_type = ?query.subject_type,
        authorizations = authorizations.total,
        invoices = invoices.count,
        "usage report generated"
    );
    Ok(UsageReport {
        subject_id: query.subject_id,
        subject_type: query.subject_type,
        subject_name,
        from: query.from,
        to: query.to,
        authorizations,
        invoices,
    })
}

pub async fn usage_report(
    Extension(db): Extension<Database>,
    _user: AuthUser,
    ApiQuery(query): ApiQuery<ReportQuery>,
) -> AppResult<Json<UsageReport>> {
    let mut session = db.open_session().await?;
    let report = generate_usage_report(&mut session, &query).await?;
    session.commit().await?;
    Ok(Json(report))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_covers_whole_days() {
        let day = NaiveDate::from_ymd_opt(2024, 1, 31).unwrap();
        let (start, end) = window_bounds(day, day).unwrap();
        assert_eq!(start, "2024-01-31T00:00:00.000000Z");
        assert_eq!(end, "2024-02-01T00:00:00.000000Z");
    }

    #[test]
    fn window_rejects_last_representable_day() {
        assert!(window_bounds(NaiveDate::MAX, NaiveDate::MAX).is_err());
    }
}
