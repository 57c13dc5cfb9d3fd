mod common;

use chrono::{Duration, Utc};
use clinipay_gateway::database::memory::InvoiceStatus;
use clinipay_gateway::domain::{PaymentStatus, VerificationMethod};
use clinipay_gateway::payments::error::PaymentError;
use clinipay_gateway::payments::providers::manual;
use clinipay_gateway::payments::types::SettlementState;
use clinipay_gateway::services::verification::{EvidenceInput, VerifyPaymentRequest};
use clinipay_gateway::services::GatewayError;
use clinipay_gateway::workers::settlement_monitor::{
    CycleSummary, SettlementMonitorConfig, SettlementMonitorWorker,
};
use common::{approve, card_config, provenance, request, FakeProvider, Gateway, CARD};
use rust_decimal_macros::dec;

#[tokio::test]
async fn test_manual_verification_confirms_and_pays_invoice() {
    let gw = Gateway::new();
    let payment = gw.pay("INV-300", manual::CASH, dec!(12000)).await;

    let request = VerifyPaymentRequest {
        approved: true,
        code: None,
        notes: Some("counted twice".to_string()),
        evidence: vec![EvidenceInput {
            file_name: "receipt.jpg".to_string(),
            url: "https://files.test/receipt.jpg".to_string(),
            content_type: Some("image/jpeg".to_string()),
        }],
    };
    let confirmed = gw
        .verification
        .verify(payment.id, request, "cashier-7")
        .await
        .unwrap();

    assert_eq!(confirmed.status, PaymentStatus::Confirmed);
    assert_eq!(confirmed.verified_by.as_deref(), Some("cashier-7"));
    assert_eq!(confirmed.verification_method, Some(VerificationMethod::Manual));
    assert_eq!(confirmed.verification_notes.as_deref(), Some("counted twice"));
    assert_eq!(confirmed.evidence.len(), 1);
    assert!(confirmed.confirmed_at.is_some());

    let invoice = gw.store.invoice("INV-300").await.unwrap();
    assert_eq!(invoice.status, InvoiceStatus::Paid);
    assert_eq!(invoice.paid_by, Some(payment.id));
}

#[tokio::test]
async fn test_declined_verification_rejects() {
    let gw = Gateway::new();
    let payment = gw.pay("INV-301", manual::CASH, dec!(12000)).await;

    let rejected = gw
        .verification
        .verify(
            payment.id,
            VerifyPaymentRequest {
                approved: false,
                notes: Some("no cash in drawer".to_string()),
                ..Default::default()
            },
            "supervisor-2",
        )
        .await
        .unwrap();

    assert_eq!(rejected.status, PaymentStatus::Rejected);
    assert!(rejected.failed_at.is_some());
    assert_eq!(
        gw.store.invoice("INV-301").await.unwrap().status,
        InvoiceStatus::Open
    );
}

#[tokio::test]
async fn test_cheque_number_must_match() {
    let gw = Gateway::new();
    gw.store.open_invoice("INV-302").await;
    let mut cheque = request("INV-302", manual::CHEQUE, dec!(25000));
    cheque.details = Some(serde_json::json!({
        "cheque_number": "004512",
        "cheque_bank": "First Bank",
    }));
    let payment = gw
        .orchestrator
        .initiate(cheque, provenance())
        .await
        .unwrap()
        .payment;

    let rejected = gw
        .verification
        .verify(
            payment.id,
            VerifyPaymentRequest {
                approved: true,
                code: Some("999999".to_string()),
                ..Default::default()
            },
            "finance-1",
        )
        .await
        .unwrap();

    assert_eq!(rejected.status, PaymentStatus::Rejected);
    assert!(rejected
        .failure_reason
        .as_deref()
        .unwrap()
        .contains("cheque_number"));
}

#[tokio::test]
async fn test_only_awaiting_payments_can_be_verified() {
    let gw = Gateway::new();
    let processing = gw.pay("INV-303", CARD, dec!(12000)).await;

    let err = gw
        .verification
        .verify(processing.id, approve(), "cashier-1")
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::InvalidStateTransition { .. }));

    let confirmed = gw.confirmed_cash_payment("INV-304", dec!(500)).await;
    let err = gw
        .verification
        .verify(confirmed.id, approve(), "cashier-1")
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::InvalidStateTransition { .. }));
}

#[tokio::test]
async fn test_failed_invoice_write_rolls_back_confirmation() {
    let gw = Gateway::new();
    let payment = gw.pay("INV-305", manual::CASH, dec!(12000)).await;
    gw.store.fail_invoice_writes(true).await;

    let err = gw
        .verification
        .verify(payment.id, approve(), "cashier-1")
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::Database(_)));

    let unchanged = gw.reload(&payment).await;
    assert_eq!(unchanged.status, PaymentStatus::AwaitingVerification);
    assert!(unchanged.confirmed_at.is_none());
    assert_eq!(
        gw.store.invoice("INV-305").await.unwrap().status,
        InvoiceStatus::Open
    );
    assert_eq!(gw.store.invoice_paid_count().await, 0);

    // And the payment can still be confirmed afterwards
    gw.store.fail_invoice_writes(false).await;
    let confirmed = gw
        .verification
        .verify(payment.id, approve(), "cashier-1")
        .await
        .unwrap();
    assert_eq!(confirmed.status, PaymentStatus::Confirmed);
}

#[tokio::test]
async fn test_bulk_verification_isolates_failures() {
    let gw = Gateway::new();
    let mut ids = Vec::new();
    for i in 0..5 {
        let payment = gw
            .pay(&format!("INV-31{}", i), manual::CASH, dec!(1000))
            .await;
        ids.push(payment.id);
    }
    ids[2] = uuid::Uuid::new_v4();

    let report = gw
        .verification
        .bulk_verify(ids.clone(), "supervisor-1", Some("end of shift".to_string()))
        .await;

    assert_eq!(report.total, 5);
    assert_eq!(report.succeeded, 4);
    assert_eq!(report.failed, 1);
    assert_eq!(report.results.len(), 5);
    for (item, id) in report.results.iter().zip(&ids) {
        assert_eq!(item.payment_id, *id);
    }
    assert!(!report.results[2].success);
    assert!(report.results[2].error.is_some());

    let confirmed = gw.orchestrator.get(ids[0]).await.unwrap();
    assert_eq!(confirmed.status, PaymentStatus::Confirmed);
    assert_eq!(confirmed.verification_method, Some(VerificationMethod::Bulk));
    assert_eq!(gw.store.invoice_paid_count().await, 4);
}

#[tokio::test]
async fn test_auto_verify_follows_provider_status() {
    let gw = Gateway::new();
    let payment = gw.pay("INV-320", CARD, dec!(8000)).await;
    let external_id = payment.external_transaction_id.clone().unwrap();

    gw.card.report_status(Ok(Some(SettlementState::Processing)));
    let still = gw.verification.auto_verify(&external_id).await.unwrap();
    assert_eq!(still.status, PaymentStatus::Processing);

    gw.card.report_status(Err(PaymentError::NetworkError {
        message: "connection reset".to_string(),
    }));
    let err = gw.verification.auto_verify(&external_id).await.unwrap_err();
    assert!(matches!(err, GatewayError::Provider(_)));
    assert_eq!(gw.reload(&payment).await.status, PaymentStatus::Processing);

    gw.card.report_status(Ok(Some(SettlementState::Completed)));
    let confirmed = gw.verification.auto_verify(&external_id).await.unwrap();
    assert_eq!(confirmed.status, PaymentStatus::Confirmed);
    assert_eq!(
        confirmed.verification_method,
        Some(VerificationMethod::Automatic)
    );

    let err = gw.verification.auto_verify("TXN-MISSING").await.unwrap_err();
    assert!(matches!(err, GatewayError::NotFound { .. }));
}

#[tokio::test]
async fn test_settlement_monitor_polls_and_expires() {
    let gw = Gateway::new();
    let fresh = gw.pay("INV-330", CARD, dec!(1000)).await;
    let mut overdue = gw.pay("INV-331", CARD, dec!(1000)).await;
    let mut stale = gw.pay("INV-332", CARD, dec!(1000)).await;

    // Card settles in 60s and gives up after 600s
    overdue.processed_at = Some(Utc::now() - Duration::seconds(120));
    stale.processed_at = Some(Utc::now() - Duration::seconds(700));
    gw.store.put_payment(overdue.clone()).await;
    gw.store.put_payment(stale.clone()).await;
    // Cash is never polled
    gw.pay("INV-333", manual::CASH, dec!(1000)).await;

    gw.card.report_status(Ok(Some(SettlementState::Completed)));
    let worker = SettlementMonitorWorker::new(
        gw.registry.clone(),
        gw.stores.clone(),
        gw.verification.clone(),
        gw.side_effects.clone(),
        SettlementMonitorConfig::default(),
    );

    let summary = worker.run_cycle().await.unwrap();
    assert_eq!(
        summary,
        CycleSummary {
            examined: 3,
            polled: 1,
            confirmed: 1,
            failed: 0,
            expired: 1,
        }
    );

    assert_eq!(gw.reload(&fresh).await.status, PaymentStatus::Processing);
    assert_eq!(gw.reload(&overdue).await.status, PaymentStatus::Confirmed);
    let expired = gw.reload(&stale).await;
    assert_eq!(expired.status, PaymentStatus::Failed);
    assert!(expired.failure_reason.is_some());

    // Nothing left to do on the next pass
    let summary = worker.run_cycle().await.unwrap();
    assert_eq!(summary.examined, 1);
    assert_eq!(summary.polled, 0);
}

#[tokio::test]
async fn test_status_check_does_not_bypass_manual_approval() {
    let mut config = card_config();
    config.manual_approval_required = true;
    let gw = Gateway::with_card(FakeProvider::new(config));
    let payment = gw.pay("INV-340", CARD, dec!(8000)).await;
    assert_eq!(payment.status, PaymentStatus::AwaitingVerification);
    let external_id = payment.external_transaction_id.clone().unwrap();

    gw.card.report_status(Ok(Some(SettlementState::Completed)));
    let noted = gw.verification.auto_verify(&external_id).await.unwrap();

    assert_eq!(noted.status, PaymentStatus::AwaitingVerification);
    assert!(noted.confirmed_at.is_none());
    assert_eq!(noted.metadata["provider_report"]["source"], "status_check");
    assert_eq!(gw.store.invoice_paid_count().await, 0);
}
