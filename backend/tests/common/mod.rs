#![allow(dead_code)]

use chrono::NaiveDate;
use mutua_backend::catalog;
use mutua_backend::db::{Database, Session};
use mutua_backend::models::{NewPatient, NewProvider, NewTreatment};

/// A fresh in-memory store holding one patient, one provider and one treatment.
pub struct Fixture {
    pub db: Database,
    pub session: Session,
    pub patient_id: i64,
    pub provider_id: i64,
    pub treatment_id: i64,
}

pub async fn fixture() -> Fixture {
    let db = Database::connect_in_memory().await.unwrap();
    db.ensure_schema().await.unwrap();
    let mut session = db.open_session().await.unwrap();

    let patient = catalog::create_patient(
        &mut session,
        &NewPatient {
            first_name: "Juan".into(),
            last_name: "Pérez".into(),
            birth_date: NaiveDate::from_ymd_opt(1980, 5, 15).unwrap(),
            member_number: "A12345".into(),
            insured: Some(true),
        },
    )
    .await
    .unwrap();
    let provider = catalog::create_provider(
        &mut session,
        &NewProvider {
            name: "Clínica Central".into(),
            specialty: Some("Medicina general".into()),
        },
    )
    .await
    .unwrap();
    let treatment = catalog::create_treatment(
        &mut session,
        &NewTreatment {
            code: "RES-MAG".into(),
            description: "Resonancia magnética".into(),
            cost: 500.0,
        },
    )
    .await
    .unwrap();

    Fixture {
        db,
        session,
        patient_id: patient.id,
        provider_id: provider.id,
        treatment_id: treatment.id,
    }
}

pub async fn second_patient(session: &mut Session) -> i64 {
    catalog::create_patient(
        session,
        &NewPatient {
            first_name: "María".into(),
            last_name: "González".into(),
            birth_date: NaiveDate::from_ymd_opt(1975, 10, 22).unwrap(),
            member_number: "A67890".into(),
            insured: Some(true),
        },
    )
    .await
    .unwrap()
    .id
}

pub const TEST_SECRET: &str = "integration-test-secret";
pub const TEST_USER: &str = "admin";
pub const TEST_PASSWORD: &str = "password";

/// The full HTTP application over a seeded in-memory store.
pub async fn test_app() -> (axum::Router, std::sync::Arc<mutua_backend::auth::TokenKeys>) {
    use std::sync::Arc;

    use mutua_backend::auth::{CredentialVerifier, StaticCredentials, TokenKeys};
    use mutua_backend::AppContext;

    let db = Database::connect_in_memory().await.unwrap();
    db.ensure_schema().await.unwrap();
    db.seed_reference_data().await.unwrap();
    let tokens = Arc::new(TokenKeys::new(TEST_SECRET, chrono::Duration::minutes(30)));
    let credentials: Arc<dyn CredentialVerifier> =
        Arc::new(StaticCredentials::new(TEST_USER, TEST_PASSWORD).unwrap());
    let app = mutua_backend::app(AppContext {
        db,
        tokens: tokens.clone(),
        credentials,
    });
    (app, tokens)
}
