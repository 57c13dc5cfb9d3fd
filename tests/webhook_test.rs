mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use clinipay_gateway::api;
use clinipay_gateway::database::memory::InvoiceStatus;
use clinipay_gateway::domain::PaymentStatus;
use clinipay_gateway::services::{GatewayError, WebhookOutcome};
use clinipay_gateway::domain::VerificationMethod;
use common::{approve, card_config, webhook, FakeProvider, Gateway, CARD};
use rust_decimal_macros::dec;
use tower::ServiceExt;

fn external_id(payment: &clinipay_gateway::domain::Payment) -> String {
    payment.external_transaction_id.clone().unwrap()
}

#[tokio::test]
async fn test_tampered_webhook_is_rejected_without_side_effects() {
    let gw = Gateway::new();
    let payment = gw.pay("INV-200", CARD, dec!(4000)).await;
    let (mut body, signature) = webhook(&external_id(&payment), "success");
    body.push(b' ');

    let err = gw
        .orchestrator
        .handle_webhook(CARD, &body, Some(&signature))
        .await
        .unwrap_err();

    assert!(matches!(err, GatewayError::SignatureVerification { .. }));
    assert_eq!(gw.reload(&payment).await.status, PaymentStatus::Processing);

    let err = gw
        .orchestrator
        .handle_webhook(CARD, &body, None)
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::SignatureVerification { .. }));
}

#[tokio::test]
async fn test_completed_webhook_confirms_once() {
    let gw = Gateway::new();
    let payment = gw.pay("INV-201", CARD, dec!(4000)).await;
    let (body, signature) = webhook(&external_id(&payment), "success");

    let outcome = gw
        .orchestrator
        .handle_webhook(CARD, &body, Some(&signature))
        .await
        .unwrap();
    assert_eq!(
        outcome,
        WebhookOutcome::Applied {
            payment_id: payment.id,
            status: PaymentStatus::Confirmed,
        }
    );

    let confirmed = gw.reload(&payment).await;
    assert_eq!(confirmed.status, PaymentStatus::Confirmed);
    assert_eq!(confirmed.verified_by.as_deref(), Some(CARD));
    assert_eq!(
        gw.store.invoice("INV-201").await.unwrap().status,
        InvoiceStatus::Paid
    );

    // Redelivery changes nothing
    let outcome = gw
        .orchestrator
        .handle_webhook(CARD, &body, Some(&signature))
        .await
        .unwrap();
    assert_eq!(
        outcome,
        WebhookOutcome::Duplicate {
            payment_id: payment.id,
            status: PaymentStatus::Confirmed,
        }
    );
    assert_eq!(gw.store.invoice_paid_count().await, 1);
    assert_eq!(gw.reload(&payment).await.updated_at, confirmed.updated_at);
}

#[tokio::test]
async fn test_failed_webhook_fails_processing_payment() {
    let gw = Gateway::new();
    let payment = gw.pay("INV-202", CARD, dec!(4000)).await;
    let (body, signature) = webhook(&external_id(&payment), "declined");

    let outcome = gw
        .orchestrator
        .handle_webhook(CARD, &body, Some(&signature))
        .await
        .unwrap();

    assert!(matches!(
        outcome,
        WebhookOutcome::Applied {
            status: PaymentStatus::Failed,
            ..
        }
    ));
    let failed = gw.reload(&payment).await;
    assert_eq!(failed.status, PaymentStatus::Failed);
    assert!(failed.failed_at.is_some());
    assert_eq!(
        gw.store.invoice("INV-202").await.unwrap().status,
        InvoiceStatus::Open
    );
}

#[tokio::test]
async fn test_unknown_and_unsettled_webhooks_are_ignored() {
    let gw = Gateway::new();
    let payment = gw.pay("INV-203", CARD, dec!(4000)).await;

    let (body, signature) = webhook("TXN-NOT-OURS", "success");
    let outcome = gw
        .orchestrator
        .handle_webhook(CARD, &body, Some(&signature))
        .await
        .unwrap();
    assert_eq!(outcome, WebhookOutcome::Ignored);

    let (body, signature) = webhook(&external_id(&payment), "processing");
    let outcome = gw
        .orchestrator
        .handle_webhook(CARD, &body, Some(&signature))
        .await
        .unwrap();
    assert_eq!(outcome, WebhookOutcome::Ignored);
    assert_eq!(gw.reload(&payment).await.status, PaymentStatus::Processing);
}

#[tokio::test]
async fn test_late_failure_does_not_undo_confirmation() {
    let gw = Gateway::new();
    let payment = gw.pay("INV-204", CARD, dec!(4000)).await;

    let (body, signature) = webhook(&external_id(&payment), "success");
    gw.orchestrator
        .handle_webhook(CARD, &body, Some(&signature))
        .await
        .unwrap();

    let (body, signature) = webhook(&external_id(&payment), "failed");
    let outcome = gw
        .orchestrator
        .handle_webhook(CARD, &body, Some(&signature))
        .await
        .unwrap();

    assert_eq!(outcome, WebhookOutcome::Ignored);
    assert_eq!(gw.reload(&payment).await.status, PaymentStatus::Confirmed);
}

#[tokio::test]
async fn test_webhook_endpoint_status_codes() {
    let gw = Gateway::new();
    let payment = gw.pay("INV-205", CARD, dec!(4000)).await;
    let (body, signature) = webhook(&external_id(&payment), "success");

    let post = |path: &str, body: Vec<u8>, signature: Option<&str>| {
        let mut builder = Request::builder()
            .method("POST")
            .uri(path)
            .header("content-type", "application/json");
        if let Some(signature) = signature {
            builder = builder.header("x-webhook-signature", signature);
        }
        builder.body(Body::from(body)).unwrap()
    };

    let response = api::router(gw.app_state())
        .oneshot(post(
            "/payments/webhook/test_card",
            body.clone(),
            Some("deadbeef"),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(gw.reload(&payment).await.status, PaymentStatus::Processing);

    let response = api::router(gw.app_state())
        .oneshot(post(
            "/payments/webhook/test_card",
            body.clone(),
            Some(&signature),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(json["status"], "ok");
    assert_eq!(gw.reload(&payment).await.status, PaymentStatus::Confirmed);

    // Unknown transaction looks the same as a known one
    let (unknown, unknown_signature) = webhook("TXN-NOT-OURS", "success");
    let response = api::router(gw.app_state())
        .oneshot(post(
            "/payments/webhook/test_card",
            unknown,
            Some(&unknown_signature),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = api::router(gw.app_state())
        .oneshot(post("/payments/webhook/bitpay", body, Some(&signature)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_webhook_leaves_manual_approval_to_the_verifier() {
    let mut config = card_config();
    config.manual_approval_required = true;
    let gw = Gateway::with_card(FakeProvider::new(config));
    let payment = gw.pay("INV-206", CARD, dec!(4000)).await;
    assert_eq!(payment.status, PaymentStatus::AwaitingVerification);

    let (body, signature) = webhook(&external_id(&payment), "success");
    let outcome = gw
        .orchestrator
        .handle_webhook(CARD, &body, Some(&signature))
        .await
        .unwrap();
    assert_eq!(
        outcome,
        WebhookOutcome::PendingVerification {
            payment_id: payment.id
        }
    );

    let noted = gw.reload(&payment).await;
    assert_eq!(noted.status, PaymentStatus::AwaitingVerification);
    assert!(noted.verified_by.is_none());
    assert_eq!(noted.metadata["provider_report"]["state"], "completed");
    assert_eq!(noted.metadata["provider_report"]["source"], "webhook");
    assert_eq!(gw.store.invoice_paid_count().await, 0);

    let confirmed = gw
        .verification
        .verify(payment.id, approve(), "finance-1")
        .await
        .unwrap();
    assert_eq!(confirmed.status, PaymentStatus::Confirmed);
    assert_eq!(confirmed.verification_method, Some(VerificationMethod::Manual));
    assert_eq!(gw.store.invoice_paid_count().await, 1);
}

#[tokio::test]
async fn test_webhook_is_scoped_to_the_issuing_provider() {
    let gw = Gateway::new();
    let payment = gw.pay("INV-207", CARD, dec!(4000)).await;

    // Another payment elsewhere carries the same provider transaction id
    let mut foreign = gw.pay("INV-208", CARD, dec!(1000)).await;
    foreign.id = uuid::Uuid::new_v4();
    foreign.provider = "other_gateway".to_string();
    foreign.merchant_reference = "PAY-FOREIGN-0001".to_string();
    foreign.external_transaction_id = payment.external_transaction_id.clone();
    foreign.initiated_at = payment.initiated_at + chrono::Duration::seconds(5);
    gw.store.put_payment(foreign).await;

    let (body, signature) = webhook(&external_id(&payment), "success");
    let outcome = gw
        .orchestrator
        .handle_webhook(CARD, &body, Some(&signature))
        .await
        .unwrap();

    assert_eq!(
        outcome,
        WebhookOutcome::Applied {
            payment_id: payment.id,
            status: PaymentStatus::Confirmed,
        }
    );
}

#[tokio::test]
async fn test_pending_payment_is_untouched_when_webhook_confirmation_fails() {
    let gw = Gateway::new();
    let mut payment = gw.pay("INV-209", CARD, dec!(4000)).await;
    payment.status = PaymentStatus::Pending;
    payment.processed_at = None;
    gw.store.put_payment(payment.clone()).await;
    gw.store.fail_invoice_writes(true).await;

    let (body, signature) = webhook(&external_id(&payment), "success");
    let err = gw
        .orchestrator
        .handle_webhook(CARD, &body, Some(&signature))
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::Database(_)));
    let unchanged = gw.reload(&payment).await;
    assert_eq!(unchanged.status, PaymentStatus::Pending);
    assert!(unchanged.processed_at.is_none());

    // Redelivery after the outage goes through in one step
    gw.store.fail_invoice_writes(false).await;
    let outcome = gw
        .orchestrator
        .handle_webhook(CARD, &body, Some(&signature))
        .await
        .unwrap();
    assert!(matches!(
        outcome,
        WebhookOutcome::Applied {
            status: PaymentStatus::Confirmed,
            ..
        }
    ));
    assert_eq!(gw.store.invoice_paid_count().await, 1);
}
