use chrono::Utc;
use sqlx::Row;
use tracing::info;

use crate::authorizations;
use crate::catalog;
use crate::db::Session;
use crate::error::{is_unique_violation, is_write_conflict, AppError, AppResult};
use crate::models::{
    timestamp_text, AuthorizationStatus, Invoice, InvoiceLine, InvoiceStatus, NewInvoice,
    NewInvoiceLine, Validate,
};

const INVOICE_COLUMNS: &str = "i.id AS id, i.authorization_id AS authorization_id, \
    i.amount AS amount, i.status AS status, i.issued_at AS issued_at";

pub async fn find_invoice(
    session: &mut Session,
    authorization_id: i64,
) -> AppResult<Option<Invoice>> {
    let row = sqlx::query(&format!(
        "SELECT {INVOICE_COLUMNS} FROM invoices i WHERE i.authorization_id = $1"
    ))
    .bind(authorization_id)
    .fetch_optional(&mut **session)
    .await?;
    match row.as_ref().map(Invoice::from_row).transpose()? {
        Some(invoice) => Ok(Some(with_lines(session, invoice).await?)),
        None => Ok(None),
    }
}

async fn with_lines(session: &mut Session, mut invoice: Invoice) -> AppResult<Invoice> {
    let rows = sqlx::query(
        "SELECT id, invoice_id, concept, amount FROM invoice_lines \
         WHERE invoice_id = $1 ORDER BY id",
    )
    .bind(invoice.id)
    .fetch_all(&mut **session)
    .await?;
    invoice.lines = rows
        .iter()
        .map(InvoiceLine::from_row)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(invoice)
}

pub(crate) async fn insert_lines(
    session: &mut Session,
    invoice_id: i64,
    lines: &[NewInvoiceLine],
) -> AppResult<()> {
    for line in lines {
        sqlx::query("INSERT INTO invoice_lines (invoice_id, concept, amount) VALUES ($1, $2, $3)")
            .bind(invoice_id)
            .bind(line.concept.trim().to_string())
            .bind(line.amount)
            .execute(&mut **session)
            .await?;
    }
    Ok(())
}

/// Fails with NotFound while the authorization is undecided, rejected, or not yet billed.
pub async fn get_invoice_status(session: &mut Session, authorization_id: i64) -> AppResult<Invoice> {
    find_invoice(session, authorization_id)
        .await?
        .ok_or(AppError::NotFound("invoice"))
}

pub async fn list_invoices_for_patient(
    session: &mut Session,
    patient_id: i64,
) -> AppResult<Vec<Invoice>> {
    catalog::require_patient(session, patient_id).await?;
    let rows = sqlx::query(&format!(
        "SELECT {INVOICE_COLUMNS} FROM invoices i \
         JOIN authorization_requests a ON a.id = i.authorization_id \
         WHERE a.patient_id = $1 \
         ORDER BY i.issued_at DESC, i.id DESC"
    ))
    .bind(patient_id)
    .fetch_all(&mut **session)
    .await?;
    let mut invoices = Vec::with_capacity(rows.len());
    for row in &rows {
        invoices.push(with_lines(session, Invoice::from_row(row)?).await?);
    }
    Ok(invoices)
}

// key: billing-invoices -> issue
/// At most one invoice per authorization, and only once it is APPROVED.
pub async fn create_invoice(session: &mut Session, request: &NewInvoice) -> AppResult<Invoice> {
    request.validate()?;
    let authorization =
        authorizations::get_authorization(session, request.authorization_id).await?;
    if authorization.status != AuthorizationStatus::Approved {
        return Err(AppError::InvalidState(format!(
            "authorization {} is {}; only APPROVED authorizations can be invoiced",
            authorization.id, authorization.status
        )));
    }
    if find_invoice(session, authorization.id).await?.is_some() {
        return Err(already_invoiced(authorization.id));
    }

    let row = sqlx::query(
        "INSERT INTO invoices (authorization_id, amount, status, issued_at) \
         VALUES ($1, $2, $3, $4) RETURNING id",
    )
    .bind(authorization.id)
    .bind(request.amount)
    .bind(InvoiceStatus::Open.as_str())
    .bind(timestamp_text(Utc::now()))
    .fetch_one(&mut **session)
    .await
    .map_err(|e| {
        if is_unique_violation(&e) || is_write_conflict(&e) {
            return already_invoiced(authorization.id);
        }
        tracing::error!(?e, "DB error inserting invoice");
        AppError::Db(e)
    })?;
    let id: i64 = row.try_get("id")?;
    insert_lines(session, id, &request.lines).await?;
    info!(
        invoice_id = id,
        authorization_id = authorization.id,
        amount = request.amount,
        lines = request.lines.len(),
        "invoice issued"
    );
    get_invoice_status(session, authorization.id).await
}

// key: billing-invoices -> settle
pub async fn update_invoice_status(
    session: &mut Session,
    authorization_id: i64,
    status: InvoiceStatus,
) -> AppResult<Invoice> {
    let invoice = get_invoice_status(session, authorization_id).await?;
    if !invoice.status.can_transition_to(status) {
        return Err(AppError::InvalidState(format!(
            "invoice {} cannot move from {} to {}",
            invoice.id, invoice.status, status
        )));
    }
    apply_invoice_status(session, &invoice, status).await?;
    info!(invoice_id = invoice.id, from = %invoice.status, to = %status, "invoice status updated");
    get_invoice_status(session, authorization_id).await
}

/// Writes `next` only if the invoice still has the status it was read with.
pub(crate) async fn apply_invoice_status(
    session: &mut Session,
    invoice: &Invoice,
    next: InvoiceStatus,
) -> AppResult<()> {
    let result = sqlx::query("UPDATE invoices SET status = $1 WHERE id = $2 AND status = $3")
        .bind(next.as_str())
        .bind(invoice.id)
        .bind(invoice.status.as_str())
        .execute(&mut **session)
        .await
        .map_err(|e| {
            if is_write_conflict(&e) {
                return updated_concurrently(invoice.id);
            }
            tracing::error!(?e, "DB error updating invoice status");
            AppError::Db(e)
        })?;
    if result.rows_affected() == 0 {
        return Err(updated_concurrently(invoice.id));
    }
    Ok(())
}

fn updated_concurrently(invoice_id: i64) -> AppError {
    AppError::InvalidState(format!("invoice {invoice_id} was updated concurrently"))
}

fn already_invoiced(authorization_id: i64) -> AppError {
    AppError::InvalidState(format!(
        "authorization {authorization_id} already has an invoice"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::models::{DecisionRequest, NewAuthorization, NewPatient, NewProvider, NewTreatment};
    use chrono::NaiveDate;

    async fn invoiced(session: &mut Session) -> Invoice {
        let patient = catalog::create_patient(
            session,
            &NewPatient {
                first_name: "Elena".into(),
                last_name: "Vidal".into(),
                birth_date: NaiveDate::from_ymd_opt(1988, 11, 3).unwrap(),
                member_number: "D400".into(),
                insured: None,
            },
        )
        .await
        .unwrap();
        let provider = catalog::create_provider(
            session,
            &NewProvider {
                name: "Policlínica Sur".into(),
                specialty: None,
            },
        )
        .await
        .unwrap();
        let treatment = catalog::create_treatment(
            session,
            &NewTreatment {
                code: "RX-TOR".into(),
                description: "Radiografía de tórax".into(),
                cost: 35.0,
            },
        )
        .await
        .unwrap();
        let authorization = authorizations::submit_authorization(
            session,
            &NewAuthorization {
                patient_id: patient.id,
                provider_id: provider.id,
                treatment_id: treatment.id,
                justification: None,
            },
        )
        .await
        .unwrap();
        authorizations::decide_authorization(
            session,
            authorization.id,
            &DecisionRequest {
                decision: AuthorizationStatus::Approved,
                notes: None,
            },
        )
        .await
        .unwrap();
        create_invoice(
            session,
            &NewInvoice {
                authorization_id: authorization.id,
                amount: 35.0,
                lines: vec![NewInvoiceLine {
                    concept: "Radiografía de tórax".into(),
                    amount: 35.0,
                }],
            },
        )
        .await
        .unwrap()
    }

    async fn session() -> (Database, Session) {
        let database = Database::connect_in_memory().await.unwrap();
        database.ensure_schema().await.unwrap();
        let session = database.open_session().await.unwrap();
        (database, session)
    }

    #[tokio::test]
    async fn invoice_is_returned_with_its_lines() {
        let (_db, mut session) = session().await;
        let invoice = invoiced(&mut session).await;
        assert_eq!(invoice.lines.len(), 1);
        assert_eq!(invoice.lines[0].invoice_id, invoice.id);
        assert_eq!(invoice.lines[0].concept, "Radiografía de tórax");
    }

    #[tokio::test]
    async fn second_invoice_row_violates_uniqueness() {
        let (_db, mut session) = session().await;
        let invoice = invoiced(&mut session).await;
        let err = sqlx::query(
            "INSERT INTO invoices (authorization_id, amount, status, issued_at) \
             VALUES ($1, $2, $3, $4)",
        )
        .bind(invoice.authorization_id)
        .bind(10.0)
        .bind(InvoiceStatus::Open.as_str())
        .bind(timestamp_text(Utc::now()))
        .execute(&mut *session)
        .await
        .unwrap_err();
        assert!(is_unique_violation(&err), "got {err:?}");
        assert!(!is_write_conflict(&err));
    }

    #[tokio::test]
    async fn stale_status_write_loses() {
        let (_db, mut session) = session().await;
        let stale = invoiced(&mut session).await;
        apply_invoice_status(&mut session, &stale, InvoiceStatus::Paid)
            .await
            .unwrap();
        // still believes the invoice is OPEN
        let late = apply_invoice_status(&mut session, &stale, InvoiceStatus::Disputed).await;
        assert!(matches!(late, Err(AppError::InvalidState(_))), "got {late:?}");

        let stored = get_invoice_status(&mut session, stale.authorization_id)
            .await
            .unwrap();
        assert_eq!(stored.status, InvoiceStatus::Paid);
    }
}
