use axum::{
    extract::Extension,
    http::StatusCode,
    routing::get,
    Json, Router,
};

use crate::db::Database;
use crate::error::AppResult;
use crate::extractor::{ApiJson, ApiPath, ApiQuery, AuthUser};
use crate::models::{Invoice, InvoiceQuery, InvoiceStatusUpdate, NewInvoice};

use super::service;

// key: billing-api -> rest endpoints
pub fn routes() -> Router {
    Router::new()
        .route("/invoices", get(list_invoices).post(create_invoice))
        .route(
            "/invoices/:authorizationId",
            get(get_invoice_status).patch(update_invoice_status),
        )
}

pub async fn get_invoice_status(
    Extension(db): Extension<Database>,
    _user: AuthUser,
    ApiPath(authorization_id): ApiPath<i64>,
) -> AppResult<Json<Invoice>> {
    let mut session = db.open_session().await?;
    let invoice = service::get_invoice_status(&mut session, authorization_id).await?;
    session.commit().await?;
    Ok(Json(invoice))
}

pub async fn list_invoices(
    Extension(db): Extension<Database>,
    _user: AuthUser,
    ApiQuery(query): ApiQuery<InvoiceQuery>,
) -> AppResult<Json<Vec<Invoice>>> {
    let mut session = db.open_session().await?;
    let invoices = service::list_invoices_for_patient(&mut session, query.patient_id).await?;
    session.commit().await?;
    Ok(Json(invoices))
}

pub async fn create_invoice(
    Extension(db): Extension<Database>,
    _user: AuthUser,
    ApiJson(payload): ApiJson<NewInvoice>,
) -> AppResult<(StatusCode, Json<Invoice>)> {
    let mut session = db.open_session().await?;
    let invoice = service::create_invoice(&mut session, &payload).await?;
    session.commit().await?;
    Ok((StatusCode::CREATED, Json(invoice)))
}

pub async fn update_invoice_status(
    Extension(db): Extension<Database>,
    _user: AuthUser,
    ApiPath(authorization_id): ApiPath<i64>,
    ApiJson(payload): ApiJson<InvoiceStatusUpdate>,
) -> AppResult<Json<Invoice>> {
    let mut session = db.open_session().await?;
    let invoice =
        service::update_invoice_status(&mut session, authorization_id, payload.status).await?;
    session.commit().await?;
    Ok(Json(invoice))
}
