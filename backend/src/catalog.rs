use axum::{
    http::StatusCode,
    routing::get,
    Extension, Json, Router,
};
use serde::Serialize;
use tracing::info;

use crate::db::{Database, Session};
use crate::error::{is_unique_violation, AppError, AppResult};
use crate::extractor::{ApiJson, ApiPath, ApiQuery, AuthUser};
use crate::models::{
    ClinicService, ClinicServiceQuery, NewClinicService, NewPatient, NewProvider, NewTreatment,
    Patient, Provider, Treatment, Validate,
};

const PATIENT_COLUMNS: &str = "id, first_name, last_name, birth_date, member_number, insured";
const PROVIDER_COLUMNS: &str = "id, name, specialty";
const TREATMENT_COLUMNS: &str = "id, code, description, cost";
const CLINIC_SERVICE_COLUMNS: &str =
    "id, name, description, service_type, price, covered, duration_minutes";

pub fn routes() -> Router {
    Router::new()
        .route("/patients", get(list_patients_handler).post(create_patient_handler))
        .route("/patients/verify/:member_number", get(verify_membership))
        .route("/providers", get(list_providers_handler).post(create_provider_handler))
        .route("/treatments", get(list_treatments_handler).post(create_treatment_handler))
        .route(
            "/clinic-services",
            get(list_clinic_services_handler).post(create_clinic_service_handler),
        )
}

fn conflict(error: sqlx::Error, message: &str) -> AppError {
    if is_unique_violation(&error) {
        AppError::InvalidState(message.to_string())
    } else {
        tracing::error!(?error, "DB error writing reference data");
        AppError::Db(error)
    }
}

pub async fn create_patient(session: &mut Session, payload: &NewPatient) -> AppResult<Patient> {
    payload.validate()?;
    let row = sqlx::query(
        "INSERT INTO patients (first_name, last_name, birth_date, member_number, insured) \
         VALUES ($1, $2, $3, $4, $5) RETURNING id",
    )
    .bind(payload.first_name.trim().to_string())
    .bind(payload.last_name.trim().to_string())
    .bind(payload.birth_date.format("%Y-%m-%d").to_string())
    .bind(payload.member_number.trim().to_string())
    .bind(payload.insured.unwrap_or(true))
    .fetch_one(&mut **session)
    .await
    .map_err(|e| conflict(e, "member number already registered"))?;
    let id: i64 = sqlx::Row::try_get(&row, "id")?;
    info!(patient_id = id, "patient registered");
    require_patient(session, id).await
}

pub async fn find_patient(session: &mut Session, id: i64) -> AppResult<Option<Patient>> {
    let row = sqlx::query(&format!("SELECT {PATIENT_COLUMNS} FROM patients WHERE id = $1"))
        .bind(id)
        .fetch_optional(&mut **session)
        .await?;
    Ok(row.as_ref().map(Patient::from_row).transpose()?)
}

pub async fn require_patient(session: &mut Session, id: i64) -> AppResult<Patient> {
    find_patient(session, id).await?.ok_or(AppError::NotFound("patient"))
}

pub async fn find_patient_by_member_number(
    session: &mut Session,
    member_number: &str,
) -> AppResult<Option<Patient>> {
    let row = sqlx::query(&format!(
        "SELECT {PATIENT_COLUMNS} FROM patients WHERE member_number = $1"
    ))
    .bind(member_number.trim().to_string())
    .fetch_optional(&mut **session)
    .await?;
    Ok(row.as_ref().map(Patient::from_row).transpose()?)
}

pub async fn list_patients(session: &mut Session) -> AppResult<Vec<Patient>> {
    let rows = sqlx::query(&format!("SELECT {PATIENT_COLUMNS} FROM patients ORDER BY id"))
        .fetch_all(&mut **session)
        .await?;
    Ok(rows.iter().map(Patient::from_row).collect::<Result<Vec<_>, _>>()?)
}

pub async fn create_provider(session: &mut Session, payload: &NewProvider) -> AppResult<Provider> {
    payload.validate()?;
    let row = sqlx::query("INSERT INTO providers (name, specialty) VALUES ($1, $2) RETURNING id")
        .bind(payload.name.trim().to_string())
        .bind(payload.specialty.clone())
        .fetch_one(&mut **session)
        .await?;
    let id: i64 = sqlx::Row::try_get(&row, "id")?;
    info!(provider_id = id, "provider registered");
    require_provider(session, id).await
}

pub async fn find_provider(session: &mut Session, id: i64) -> AppResult<Option<Provider>> {
    let row = sqlx::query(&format!("SELECT {PROVIDER_COLUMNS} FROM providers WHERE id = $1"))
        .bind(id)
        .fetch_optional(&mut **session)
        .await?;
    Ok(row.as_ref().map(Provider::from_row).transpose()?)
}

pub async fn require_provider(session: &mut Session, id: i64) -> AppResult<Provider> {
    find_provider(session, id).await?.ok_or(AppError::NotFound("provider"))
}

pub async fn list_providers(session: &mut Session) -> AppResult<Vec<Provider>> {
    let rows = sqlx::query(&format!("SELECT {PROVIDER_COLUMNS} FROM providers ORDER BY id"))
        .fetch_all(&mut **session)
        .await?;
    Ok(rows.iter().map(Provider::from_row).collect::<Result<Vec<_>, _>>()?)
}

pub async fn create_treatment(
    session: &mut Session,
    payload: &NewTreatment,
) -> AppResult<Treatment> {
    payload.validate()?;
    let row = sqlx::query(
        "INSERT INTO treatments (code, description, cost) VALUES ($1, $2, $3) RETURNING id",
    )
    .bind(payload.code.trim().to_string())
    .bind(payload.description.trim().to_string())
    .bind(payload.cost)
    .fetch_one(&mut **session)
    .await
    .map_err(|e| conflict(e, "treatment code already registered"))?;
    let id: i64 = sqlx::Row::try_get(&row, "id")?;
    info!(treatment_id = id, "treatment registered");
    require_treatment(session, id).await
}

pub async fn find_treatment(session: &mut Session, id: i64) -> AppResult<Option<Treatment>> {
    let row = sqlx::query(&format!("SELECT {TREATMENT_COLUMNS} FROM treatments WHERE id = $1"))
        .bind(id)
        .fetch_optional(&mut **session)
        .await?;
    Ok(row.as_ref().map(Treatment::from_row).transpose()?)
}

pub async fn require_treatment(session: &mut Session, id: i64) -> AppResult<Treatment> {
    find_treatment(session, id).await?.ok_or(AppError::NotFound("treatment"))
}

pub async fn list_treatments(session: &mut Session) -> AppResult<Vec<Treatment>> {
    let rows = sqlx::query(&format!("SELECT {TREATMENT_COLUMNS} FROM treatments ORDER BY id"))
        .fetch_all(&mut **session)
        .await?;
    Ok(rows.iter().map(Treatment::from_row).collect::<Result<Vec<_>, _>>()?)
}

pub async fn create_clinic_service(
    session: &mut Session,
    payload: &NewClinicService,
) -> AppResult<ClinicService> {
    payload.validate()?;
    let row = sqlx::query(
        "INSERT INTO clinic_services \
         (name, description, service_type, price, covered, duration_minutes) \
         VALUES ($1, $2, $3, $4, $5, $6) RETURNING id",
    )
    .bind(payload.name.trim().to_string())
    .bind(payload.description.trim().to_string())
    .bind(payload.service_type.trim().to_string())
    .bind(payload.price)
    .bind(payload.covered)
    .bind(payload.duration_minutes)
    .fetch_one(&mut **session)
    .await?;
    let id: i64 = sqlx::Row::try_get(&row, "id")?;
    info!(clinic_service_id = id, covered = payload.covered, "clinic service registered");
    let row = sqlx::query(&format!(
        "SELECT {CLINIC_SERVICE_COLUMNS} FROM clinic_services WHERE id = $1"
    ))
    .bind(id)
    .fetch_one(&mut **session)
    .await?;
    Ok(ClinicService::from_row(&row)?)
}

/// `Some(true)` keeps only services the insurance covers; `Some(false)` only the rest.
pub async fn list_clinic_services(
    session: &mut Session,
    covered: Option<bool>,
) -> AppResult<Vec<ClinicService>> {
    let rows = match covered {
        Some(covered) => {
            sqlx::query(&format!(
                "SELECT {CLINIC_SERVICE_COLUMNS} FROM clinic_services \
                 WHERE covered = $1 ORDER BY id"
            ))
            .bind(covered)
            .fetch_all(&mut **session)
            .await?
        }
        None => {
            sqlx::query(&format!(
                "SELECT {CLINIC_SERVICE_COLUMNS} FROM clinic_services ORDER BY id"
            ))
            .fetch_all(&mut **session)
            .await?
        }
    };
    Ok(rows
        .iter()
        .map(ClinicService::from_row)
        .collect::<Result<Vec<_>, _>>()?)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Membership {
    pub patient_id: i64,
    pub full_name: String,
    pub member_number: String,
    pub insured: bool,
}

async fn list_patients_handler(
    Extension(db): Extension<Database>,
    _user: AuthUser,
) -> AppResult<Json<Vec<Patient>>> {
    let mut session = db.open_session().await?;
    let patients = list_patients(&mut session).await?;
    session.commit().await?;
    Ok(Json(patients))
}

async fn create_patient_handler(
    Extension(db): Extension<Database>,
    _user: AuthUser,
    ApiJson(payload): ApiJson<NewPatient>,
) -> AppResult<(StatusCode, Json<Patient>)> {
    let mut session = db.open_session().await?;
    let patient = create_patient(&mut session, &payload).await?;
    session.commit().await?;
    Ok((StatusCode::CREATED, Json(patient)))
}

async fn verify_membership(
    Extension(db): Extension<Database>,
    _user: AuthUser,
    ApiPath(member_number): ApiPath<String>,
) -> AppResult<Json<Membership>> {
    let mut session = db.open_session().await?;
    let patient = find_patient_by_member_number(&mut session, &member_number)
        .await?
        .ok_or(AppError::NotFound("patient"))?;
    session.commit().await?;
    Ok(Json(Membership {
        patient_id: patient.id,
        full_name: patient.full_name(),
        member_number: patient.member_number,
        insured: patient.insured,
    }))
}

async fn list_providers_handler(
    Extension(db): Extension<Database>,
    _user: AuthUser,
) -> AppResult<Json<Vec<Provider>>> {
    let mut session = db.open_session().await?;
    let providers = list_providers(&mut session).await?;
    session.commit().await?;
    Ok(Json(providers))
}

async fn create_provider_handler(
    Extension(db): Extension<Database>,
    _user: AuthUser,
    ApiJson(payload): ApiJson<NewProvider>,
) -> AppResult<(StatusCode, Json<Provider>)> {
    let mut session = db.open_session().await?;
    let provider = create_provider(&mut session, &payload).await?;
    session.commit().await?;
    Ok((StatusCode::CREATED, Json(provider)))
}

async fn list_treatments_handler(
    Extension(db): Extension<Database>,
    _user: AuthUser,
) -> AppResult<Json<Vec<Treatment>>> {
    let mut session = db.open_session().await?;
    let treatments = list_treatments(&mut session).await?;
    session.commit().await?;
    Ok(Json(treatments))
}

async fn create_treatment_handler(
    Extension(db): Extension<Database>,
    _user: AuthUser,
    ApiJson(payload): ApiJson<NewTreatment>,
) -> AppResult<(StatusCode, Json<Treatment>)> {
    let mut session = db.open_session().await?;
    let treatment = create_treatment(&mut session, &payload).await?;
    session.commit().await?;
    Ok((StatusCode::CREATED, Json(treatment)))
}

async fn list_clinic_services_handler(
    Extension(db): Extension<Database>,
    _user: AuthUser,
    ApiQuery(query): ApiQuery<ClinicServiceQuery>,
) -> AppResult<Json<Vec<ClinicService>>> {
    let mut session = db.open_session().await?;
    let services = list_clinic_services(&mut session, query.covered).await?;
    session.commit().await?;
    Ok(Json(services))
}

async fn create_clinic_service_handler(
    Extension(db): Extension<Database>,
    _user: AuthUser,
    ApiJson(payload): ApiJson<NewClinicService>,
) -> AppResult<(StatusCode, Json<ClinicService>)> {
    let mut session = db.open_session().await?;
    let service = create_clinic_service(&mut session, &payload).await?;
    session.commit().await?;
    Ok((StatusCode::CREATED, Json(service)))
}
