//! Two sessions racing over one file-backed store. The slower session reads before the
//! faster one commits, so its checks pass and only the write can catch the conflict.

use mutua_backend::authorizations::{decide_authorization, get_authorization, submit_authorization};
use mutua_backend::billing::{create_invoice, get_invoice_status, update_invoice_status};
use mutua_backend::db::{Database, Session};
use mutua_backend::error::AppError;
use mutua_backend::models::{
    AuthorizationStatus, DecisionRequest, InvoiceStatus, NewAuthorization, NewInvoice,
};
use tempfile::{tempdir, TempDir};

async fn file_database() -> (TempDir, Database) {
    let dir = tempdir().unwrap();
    let url = format!("sqlite://{}?mode=rwc", dir.path().join("mutua.db").display());
    let database = Database::connect(&url, 2).await.unwrap();
    database.ensure_schema().await.unwrap();
    database.seed_reference_data().await.unwrap();
    (dir, database)
}

async fn pending_request(database: &Database) -> i64 {
    let mut session = database.open_session().await.unwrap();
    let created = submit_authorization(
        &mut session,
        &NewAuthorization {
            patient_id: 1,
            provider_id: 1,
            treatment_id: 2,
            justification: None,
        },
    )
    .await
    .unwrap();
    session.commit().await.unwrap();
    created.id
}

fn decision(status: AuthorizationStatus) -> DecisionRequest {
    DecisionRequest {
        decision: status,
        notes: None,
    }
}

async fn approve(database: &Database, id: i64) {
    let mut session = database.open_session().await.unwrap();
    decide_authorization(&mut session, id, &decision(AuthorizationStatus::Approved))
        .await
        .unwrap();
    session.commit().await.unwrap();
}

async fn reader(database: &Database, id: i64) -> Session {
    let mut session = database.open_session().await.unwrap();
    get_authorization(&mut session, id).await.unwrap();
    session
}

#[tokio::test]
async fn only_one_decider_wins() {
    let (_dir, database) = file_database().await;
    let id = pending_request(&database).await;

    let mut slow = reader(&database, id).await;
    approve(&database, id).await;

    let late = decide_authorization(&mut slow, id, &decision(AuthorizationStatus::Rejected)).await;
    assert!(matches!(late, Err(AppError::InvalidState(_))), "got {late:?}");
    drop(slow);

    let mut session = database.open_session().await.unwrap();
    let stored = get_authorization(&mut session, id).await.unwrap();
    assert_eq!(stored.status, AuthorizationStatus::Approved);
}

#[tokio::test]
async fn only_one_invoice_is_issued() {
    let (_dir, database) = file_database().await;
    let id = pending_request(&database).await;
    approve(&database, id).await;
    let request = NewInvoice {
        authorization_id: id,
        amount: 500.0,
        lines: Vec::new(),
    };

    let mut slow = reader(&database, id).await;
    let mut fast = database.open_session().await.unwrap();
    create_invoice(&mut fast, &request).await.unwrap();
    fast.commit().await.unwrap();

    let late = create_invoice(&mut slow, &request).await;
    assert!(matches!(late, Err(AppError::InvalidState(_))), "got {late:?}");
}

#[tokio::test]
async fn stale_settlement_is_rejected() {
    let (_dir, database) = file_database().await;
    let id = pending_request(&database).await;
    approve(&database, id).await;
    let mut session = database.open_session().await.unwrap();
    create_invoice(
        &mut session,
        &NewInvoice {
            authorization_id: id,
            amount: 500.0,
            lines: Vec::new(),
        },
    )
    .await
    .unwrap();
    session.commit().await.unwrap();

    let mut slow = database.open_session().await.unwrap();
    let seen = get_invoice_status(&mut slow, id).await.unwrap();
    assert_eq!(seen.status, InvoiceStatus::Open);

    let mut fast = database.open_session().await.unwrap();
    update_invoice_status(&mut fast, id, InvoiceStatus::Paid)
        .await
        .unwrap();
    fast.commit().await.unwrap();

    let late = update_invoice_status(&mut slow, id, InvoiceStatus::Disputed).await;
    assert!(matches!(late, Err(AppError::InvalidState(_))), "got {late:?}");
    drop(slow);

    let mut session = database.open_session().await.unwrap();
    let stored = get_invoice_status(&mut session, id).await.unwrap();
    assert_eq!(stored.status, InvoiceStatus::Paid);
}
