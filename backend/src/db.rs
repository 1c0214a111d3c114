use std::time::Duration;

use anyhow::Context;
use chrono::{NaiveDate, TimeZone, Utc};
use sqlx::any::{AnyKind, AnyPool, AnyPoolOptions};
use sqlx::{Any, Row, Transaction};
use tracing::{info, warn};

use crate::billing;
use crate::catalog;
use crate::error::{AppError, AppResult};
use crate::models::{
    timestamp_text, AuthorizationStatus, InvoiceStatus, NewClinicService, NewInvoiceLine,
    NewPatient, NewProvider, NewTreatment,
};

/// Unit of work bounding one request's reads and writes. Rolled back on drop unless
/// committed.
pub type Session = Transaction<'static, Any>;

/// Process-wide handle to the relational store, created once at startup and handed
/// to request handlers through an `Extension` layer.
#[derive(Clone, Debug)]
pub struct Database {
    pool: AnyPool,
}

impl Database {
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, sqlx::Error> {
        let pool = AnyPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(url)
            .await?;
        if pool.any_kind() == AnyKind::Sqlite {
            // readers keep going while a request writes
            sqlx::query("PRAGMA journal_mode = WAL").execute(&pool).await?;
        }
        Ok(Self { pool })
    }

    /// Tries the primary store once and falls back to the file-backed store. The two
    /// stores are independent; nothing is migrated between them.
    pub async fn connect_with_fallback(
        primary: &str,
        fallback: &str,
        max_connections: u32,
    ) -> anyhow::Result<Self> {
        info!("connecting to primary database");
        match Self::connect(primary, max_connections).await {
            Ok(database) => {
                info!(kind = ?database.kind(), "connected to primary database");
                Ok(database)
            }
            Err(error) => {
                warn!(%error, fallback, "primary database unavailable; using fallback store");
                let database = Self::connect(fallback, max_connections)
                    .await
                    .with_context(|| format!("failed to open fallback database {fallback}"))?;
                info!(kind = ?database.kind(), "connected to fallback database");
                Ok(database)
            }
        }
    }

    /// Private in-memory SQLite store. A single connection that is never recycled keeps
    /// the data alive for the lifetime of the pool.
    pub async fn connect_in_memory() -> Result<Self, sqlx::Error> {
        let pool = AnyPoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        Ok(Self { pool })
    }

    pub fn kind(&self) -> AnyKind {
        self.pool.any_kind()
    }

    pub async fn open_session(&self) -> AppResult<Session> {
        self.pool.begin().await.map_err(|e| {
            tracing::error!(?e, "failed to open database session");
            AppError::Db(e)
        })
    }

    pub async fn ensure_schema(&self) -> Result<(), sqlx::Error> {
        for statement in schema_statements(self.kind()) {
            sqlx::query(&statement).execute(&self.pool).await?;
        }
        info!("database schema ready");
        Ok(())
    }

    /// Inserts demo patients, providers and treatments when the store has no patients yet.
    pub async fn seed_reference_data(&self) -> AppResult<()> {
        let mut session = self.open_session().await?;
        let row = sqlx::query("SELECT COUNT(*) AS count FROM patients")
            .fetch_one(&mut *session)
            .await?;
        let count: i64 = row.try_get("count")?;
        if count > 0 {
            return Ok(());
        }

        for patient in demo_patients() {
            catalog::create_patient(&mut session, &patient).await?;
        }
        for provider in demo_providers() {
            catalog::create_provider(&mut session, &provider).await?;
        }
        for treatment in demo_treatments() {
            catalog::create_treatment(&mut session, &treatment).await?;
        }
        for service in demo_clinic_services() {
            catalog::create_clinic_service(&mut session, &service).await?;
        }
        session.commit().await?;
        info!("seeded reference data");
        Ok(())
    }

    /// Adds a short decided history on top of the reference data: an approved and paid
    /// request, a rejected one, and an approved one with an open invoice. Skipped once
    /// any authorization request exists.
    pub async fn seed_sample_activity(&self) -> AppResult<()> {
        let mut session = self.open_session().await?;
        let row = sqlx::query("SELECT COUNT(*) AS count FROM authorization_requests")
            .fetch_one(&mut *session)
            .await?;
        let count: i64 = row.try_get("count")?;
        if count > 0 {
            return Ok(());
        }

        let patients = catalog::list_patients(&mut session).await?;
        let providers = catalog::list_providers(&mut session).await?;
        let treatments = catalog::list_treatments(&mut session).await?;
        if patients.len() < 2 || providers.len() < 2 || treatments.len() < 3 {
            warn!("reference data incomplete; skipping sample activity");
            return Ok(());
        }

        let approved = insert_sample_request(
            &mut session,
            SampleRequest {
                patient_id: patients[0].id,
                provider_id: providers[0].id,
                treatment_id: treatments[1].id,
                status: AuthorizationStatus::Approved,
                requested_at: sample_instant(2023, 1, 15)?,
                decided_at: sample_instant(2023, 1, 16)?,
                notes: "Autorización aprobada sin observaciones",
            },
        )
        .await?;
        insert_sample_invoice(
            &mut session,
            approved,
            InvoiceStatus::Paid,
            sample_instant(2023, 1, 20)?,
            &[("Consulta médica", 50.0), ("Resonancia magnética", 500.0)],
        )
        .await?;

        insert_sample_request(
            &mut session,
            SampleRequest {
                patient_id: patients[1].id,
                provider_id: providers[1].id,
                treatment_id: treatments[2].id,
                status: AuthorizationStatus::Rejected,
                requested_at: sample_instant(2023, 2, 10)?,
                decided_at: sample_instant(2023, 2, 11)?,
                notes: "Falta documentación médica de respaldo",
            },
        )
        .await?;

        let consultation = insert_sample_request(
            &mut session,
            SampleRequest {
                patient_id: patients[1].id,
                provider_id: providers[0].id,
                treatment_id: treatments[0].id,
                status: AuthorizationStatus::Approved,
                requested_at: sample_instant(2023, 2, 13)?,
                decided_at: sample_instant(2023, 2, 14)?,
                notes: "Consulta cubierta",
            },
        )
        .await?;
        insert_sample_invoice(
            &mut session,
            consultation,
            InvoiceStatus::Open,
            sample_instant(2023, 2, 15)?,
            &[("Consulta médica", 50.0)],
        )
        .await?;

        session.commit().await?;
        info!("seeded sample activity");
        Ok(())
    }
}

struct SampleRequest {
    patient_id: i64,
    provider_id: i64,
    treatment_id: i64,
    status: AuthorizationStatus,
    requested_at: String,
    decided_at: String,
    notes: &'static str,
}

fn sample_instant(year: i32, month: u32, day: u32) -> AppResult<String> {
    NaiveDate::from_ymd_opt(year, month, day)
        .and_then(|date| date.and_hms_opt(9, 0, 0))
        .map(|naive| timestamp_text(Utc.from_utc_datetime(&naive)))
        .ok_or_else(|| AppError::Message(format!("invalid sample date {year}-{month}-{day}")))
}

async fn insert_sample_request(session: &mut Session, request: SampleRequest) -> AppResult<i64> {
    let row = sqlx::query(
        "INSERT INTO authorization_requests \
         (patient_id, provider_id, treatment_id, status, requested_at, decided_at, decision_notes) \
         VALUES ($1, $2, $3, $4, $5, $6, $7) RETURNING id",
    )
    .bind(request.patient_id)
    .bind(request.provider_id)
    .bind(request.treatment_id)
    .bind(request.status.as_str())
    .bind(request.requested_at)
    .bind(request.decided_at)
    .bind(request.notes)
    .fetch_one(&mut **session)
    .await?;
    let id: i64 = row.try_get("id")?;
    Ok(id)
}

async fn insert_sample_invoice(
    session: &mut Session,
    authorization_id: i64,
    status: InvoiceStatus,
    issued_at: String,
    lines: &[(&str, f64)],
) -> AppResult<()> {
    let amount: f64 = lines.iter().map(|(_, amount)| amount).sum();
    let row = sqlx::query(
        "INSERT INTO invoices (authorization_id, amount, status, issued_at) \
         VALUES ($1, $2, $3, $4) RETURNING id",
    )
    .bind(authorization_id)
    .bind(amount)
    .bind(status.as_str())
    .bind(issued_at)
    .fetch_one(&mut **session)
    .await?;
    let invoice_id: i64 = row.try_get("id")?;
    let lines: Vec<NewInvoiceLine> = lines
        .iter()
        .map(|(concept, amount)| NewInvoiceLine {
            concept: concept.to_string(),
            amount: *amount,
        })
        .collect();
    billing::service::insert_lines(session, invoice_id, &lines).await
}

fn schema_statements(kind: AnyKind) -> Vec<String> {
    let id = match kind {
        AnyKind::Postgres => "BIGSERIAL PRIMARY KEY",
        _ => "INTEGER PRIMARY KEY AUTOINCREMENT",
    };
    vec![
        format!(
            "CREATE TABLE IF NOT EXISTS patients (
                id {id},
                first_name TEXT NOT NULL,
                last_name TEXT NOT NULL,
                birth_date TEXT NOT NULL,
                member_number TEXT NOT NULL UNIQUE,
                insured BOOLEAN NOT NULL DEFAULT TRUE
            )"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS providers (
                id {id},
                name TEXT NOT NULL,
                specialty TEXT
            )"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS treatments (
                id {id},
                code TEXT NOT NULL UNIQUE,
                description TEXT NOT NULL,
                cost DOUBLE PRECISION NOT NULL
            )"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS authorization_requests (
                id {id},
                patient_id BIGINT NOT NULL REFERENCES patients (id),
                provider_id BIGINT NOT NULL REFERENCES providers (id),
                treatment_id BIGINT NOT NULL REFERENCES treatments (id),
                justification TEXT,
                status TEXT NOT NULL CHECK (status IN ('PENDING', 'APPROVED', 'REJECTED')),
                requested_at TEXT NOT NULL,
                decided_at TEXT,
                decision_notes TEXT
            )"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS invoices (
                id {id},
                authorization_id BIGINT NOT NULL UNIQUE REFERENCES authorization_requests (id),
                amount DOUBLE PRECISION NOT NULL,
                status TEXT NOT NULL CHECK (status IN ('OPEN', 'PAID', 'DISPUTED')),
                issued_at TEXT NOT NULL
            )"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS invoice_lines (
                id {id},
                invoice_id BIGINT NOT NULL REFERENCES invoices (id),
                concept TEXT NOT NULL,
                amount DOUBLE PRECISION NOT NULL
            )"
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS clinic_services (
                id {id},
                name TEXT NOT NULL,
                description TEXT NOT NULL,
                service_type TEXT NOT NULL,
                price DOUBLE PRECISION NOT NULL,
                covered BOOLEAN NOT NULL DEFAULT FALSE,
                duration_minutes BIGINT NOT NULL
            )"
        ),
        "CREATE INDEX IF NOT EXISTS idx_authorization_requests_patient \
            ON authorization_requests (patient_id)"
            .to_string(),
        "CREATE INDEX IF NOT EXISTS idx_authorization_requests_provider \
            ON authorization_requests (provider_id)"
            .to_string(),
        "CREATE INDEX IF NOT EXISTS idx_authorization_requests_requested_at \
            ON authorization_requests (requested_at)"
            .to_string(),
        "CREATE INDEX IF NOT EXISTS idx_invoice_lines_invoice ON invoice_lines (invoice_id)"
            .to_string(),
    ]
}

fn demo_date(year: i32, month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, day).unwrap_or(NaiveDate::MIN)
}

fn demo_patients() -> Vec<NewPatient> {
    vec![
        NewPatient {
            first_name: "Juan".into(),
            last_name: "Pérez".into(),
            birth_date: demo_date(1980, 5, 15),
            member_number: "A12345".into(),
            insured: Some(true),
        },
        NewPatient {
            first_name: "María".into(),
            last_name: "González".into(),
            birth_date: demo_date(1975, 10, 22),
            member_number: "A67890".into(),
            insured: Some(true),
        },
    ]
}

fn demo_providers() -> Vec<NewProvider> {
    vec![
        NewProvider {
            name: "Clínica Central".into(),
            specialty: Some("Medicina general".into()),
        },
        NewProvider {
            name: "Dra. Ana Ruiz".into(),
            specialty: Some("Traumatología".into()),
        },
    ]
}

fn demo_treatments() -> Vec<NewTreatment> {
    vec![
        NewTreatment {
            code: "CONS-GEN".into(),
            description: "Consulta médica general".into(),
            cost: 50.0,
        },
        NewTreatment {
            code: "RES-MAG".into(),
            description: "Resonancia magnética".into(),
            cost: 500.0,
        },
        NewTreatment {
            code: "CIR-AMB".into(),
            description: "Cirugía ambulatoria".into(),
            cost: 1200.0,
        },
    ]
}

fn demo_clinic_services() -> Vec<NewClinicService> {
    let service = |name: &str, service_type: &str, price: f64, covered: bool, minutes: i64| {
        NewClinicService {
            name: name.into(),
            description: format!("{name} en la clínica"),
            service_type: service_type.into(),
            price,
            covered,
            duration_minutes: minutes,
        }
    };
    vec![
        service("Consulta médica general", "Consulta", 50.0, true, 20),
        service("Resonancia magnética", "Diagnóstico por imagen", 500.0, true, 45),
        service("Fisioterapia", "Rehabilitación", 40.0, true, 45),
        service("Tratamiento estético facial", "Estética", 120.0, false, 60),
    ]
}
