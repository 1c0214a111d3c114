mod common;

use mutua_backend::authorizations::{decide_authorization, submit_authorization};
use mutua_backend::billing::{
    create_invoice, get_invoice_status, list_invoices_for_patient, update_invoice_status,
};
use mutua_backend::db::Session;
use mutua_backend::error::AppError;
use mutua_backend::models::{
    AuthorizationStatus, DecisionRequest, InvoiceStatus, NewAuthorization, NewInvoice,
};

use common::{fixture, second_patient, Fixture};

async fn authorization(
    session: &mut Session,
    refs: (i64, i64, i64),
    outcome: Option<AuthorizationStatus>,
) -> i64 {
    let (patient_id, provider_id, treatment_id) = refs;
    let created = submit_authorization(
        session,
        &NewAuthorization {
            patient_id,
            provider_id,
            treatment_id,
            justification: None,
        },
    )
    .await
    .unwrap();
    if let Some(decision) = outcome {
        decide_authorization(
            session,
            created.id,
            &DecisionRequest {
                decision,
                notes: None,
            },
        )
        .await
        .unwrap();
    }
    created.id
}

fn ids(fx: &Fixture) -> (i64, i64, i64) {
    (fx.patient_id, fx.provider_id, fx.treatment_id)
}

#[tokio::test]
async fn approved_authorization_is_invoiced_open() {
    let mut fx = fixture().await;
    let refs = ids(&fx);
    let approved = authorization(&mut fx.session, refs, Some(AuthorizationStatus::Approved)).await;

    let invoice = create_invoice(
        &mut fx.session,
        &NewInvoice {
            authorization_id: approved,
            amount: 150.0,
            lines: Vec::new(),
        },
    )
    .await
    .unwrap();
    assert_eq!(invoice.authorization_id, approved);
    assert_eq!(invoice.status, InvoiceStatus::Open);

    let status = get_invoice_status(&mut fx.session, approved).await.unwrap();
    assert_eq!(status.id, invoice.id);
    assert_eq!(status.status, InvoiceStatus::Open);
    assert!((status.amount - 150.0).abs() < f64::EPSILON);
}

#[tokio::test]
async fn undecided_or_rejected_authorizations_cannot_be_invoiced() {
    let mut fx = fixture().await;
    let refs = ids(&fx);
    let pending = authorization(&mut fx.session, refs, None).await;
    let rejected = authorization(&mut fx.session, refs, Some(AuthorizationStatus::Rejected)).await;

    for authorization_id in [pending, rejected] {
        let result = create_invoice(
            &mut fx.session,
            &NewInvoice {
                authorization_id,
                amount: 80.0,
                lines: Vec::new(),
            },
        )
        .await;
        assert!(matches!(result, Err(AppError::InvalidState(_))));
        let status = get_invoice_status(&mut fx.session, authorization_id).await;
        assert!(matches!(status, Err(AppError::NotFound("invoice"))));
    }
}

#[tokio::test]
async fn second_invoice_for_same_authorization_is_rejected() {
    let mut fx = fixture().await;
    let refs = ids(&fx);
    let approved = authorization(&mut fx.session, refs, Some(AuthorizationStatus::Approved)).await;
    let request = NewInvoice {
        authorization_id: approved,
        amount: 150.0,
        lines: Vec::new(),
    };
    create_invoice(&mut fx.session, &request).await.unwrap();
    let duplicate = create_invoice(&mut fx.session, &request).await;
    assert!(matches!(duplicate, Err(AppError::InvalidState(_))));
}

#[tokio::test]
async fn invoice_requires_known_authorization_and_positive_amount() {
    let mut fx = fixture().await;
    let refs = ids(&fx);
    let missing = create_invoice(
        &mut fx.session,
        &NewInvoice {
            authorization_id: 404,
            amount: 10.0,
            lines: Vec::new(),
        },
    )
    .await;
    assert!(matches!(missing, Err(AppError::NotFound("authorization"))));

    let approved = authorization(&mut fx.session, refs, Some(AuthorizationStatus::Approved)).await;
    let zero = create_invoice(
        &mut fx.session,
        &NewInvoice {
            authorization_id: approved,
            amount: 0.0,
            lines: Vec::new(),
        },
    )
    .await;
    match zero {
        Err(AppError::InvalidArgument { field, .. }) => assert_eq!(field, "amount"),
        other => panic!("expected InvalidArgument, got {other:?}"),
    }
}

#[tokio::test]
async fn patient_invoices_are_listed_newest_first() {
    let mut fx = fixture().await;
    let refs = ids(&fx);
    let other_patient = second_patient(&mut fx.session).await;

    let mut expected = Vec::new();
    for amount in [100.0, 250.0] {
        let approved =
            authorization(&mut fx.session, refs, Some(AuthorizationStatus::Approved)).await;
        let invoice = create_invoice(
            &mut fx.session,
            &NewInvoice {
                authorization_id: approved,
                amount,
                lines: Vec::new(),
            },
        )
        .await
        .unwrap();
        expected.push(invoice.id);
    }
    let foreign = authorization(
        &mut fx.session,
        (other_patient, fx.provider_id, fx.treatment_id),
        Some(AuthorizationStatus::Approved),
    )
    .await;
    create_invoice(
        &mut fx.session,
        &NewInvoice {
            authorization_id: foreign,
            amount: 75.0,
            lines: Vec::new(),
        },
    )
    .await
    .unwrap();

    let listed = list_invoices_for_patient(&mut fx.session, fx.patient_id)
        .await
        .unwrap();
    let listed_ids: Vec<i64> = listed.iter().map(|i| i.id).collect();
    expected.reverse();
    assert_eq!(listed_ids, expected);

    let unknown = list_invoices_for_patient(&mut fx.session, 999).await;
    assert!(matches!(unknown, Err(AppError::NotFound("patient"))));
}

#[tokio::test]
async fn patient_without_invoices_gets_empty_list() {
    let mut fx = fixture().await;
    let listed = list_invoices_for_patient(&mut fx.session, fx.patient_id)
        .await
        .unwrap();
    assert!(listed.is_empty());
}

#[tokio::test]
async fn invoice_settlement_follows_allowed_transitions() {
    let mut fx = fixture().await;
    let refs = ids(&fx);
    let approved = authorization(&mut fx.session, refs, Some(AuthorizationStatus::Approved)).await;
    create_invoice(
        &mut fx.session,
        &NewInvoice {
            authorization_id: approved,
            amount: 500.0,
            lines: Vec::new(),
        },
    )
    .await
    .unwrap();

    let disputed = update_invoice_status(&mut fx.session, approved, InvoiceStatus::Disputed)
        .await
        .unwrap();
    assert_eq!(disputed.status, InvoiceStatus::Disputed);

    let paid = update_invoice_status(&mut fx.session, approved, InvoiceStatus::Paid)
        .await
        .unwrap();
    assert_eq!(paid.status, InvoiceStatus::Paid);

    let reopened = update_invoice_status(&mut fx.session, approved, InvoiceStatus::Open).await;
    assert!(matches!(reopened, Err(AppError::InvalidState(_))));
    let stored = get_invoice_status(&mut fx.session, approved).await.unwrap();
    assert_eq!(stored.status, InvoiceStatus::Paid);
}
