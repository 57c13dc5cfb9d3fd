//! The one write that must be atomic: promoting a payment to CONFIRMED and
//! marking its invoice paid in the same unit of work.

use crate::database::error::DatabaseError;
use crate::database::repository::PaymentStore;
use crate::domain::{Payment, PaymentStatus, StatusUpdate};
use crate::services::error::GatewayResult;
use crate::services::events::{PaymentEventType, SideEffects};
use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

/// Confirm `payment` (read in `payment.status`) and mark its invoice paid.
///
/// A PENDING payment passes through PROCESSING inside the same unit of work.
/// Either every row changes or none does. Events fire only after commit.
pub(crate) async fn confirm_and_mark_paid(
    payments: &dyn PaymentStore,
    side_effects: &SideEffects,
    payment: &Payment,
    update: &StatusUpdate,
    at: DateTime<Utc>,
) -> GatewayResult<Payment> {
    let mut uow = payments.begin().await?;

    let staged = async {
        let mut from = payment.status;
        if from == PaymentStatus::Pending {
            uow.transition_status(
                payment.id,
                from,
                PaymentStatus::Processing,
                &StatusUpdate::default(),
                at,
            )
            .await?;
            from = PaymentStatus::Processing;
        }
        let confirmed = uow
            .transition_status(payment.id, from, PaymentStatus::Confirmed, update, at)
            .await?;
        let newly_paid = uow
            .mark_invoice_paid(&confirmed.invoice_id, confirmed.id, at)
            .await?;
        Ok::<_, DatabaseError>((confirmed, newly_paid))
    }
    .await;

    let (confirmed, newly_paid) = match staged {
        Ok(staged) => staged,
        Err(e) => {
            if let Err(rollback_err) = uow.rollback().await {
                error!(
                    payment_id = %payment.id,
                    error = %rollback_err,
                    "rollback after failed confirmation failed"
                );
            }
            return Err(e.into());
        }
    };

    uow.commit().await?;

    if !newly_paid {
        warn!(
            payment_id = %confirmed.id,
            invoice_id = %confirmed.invoice_id,
            "invoice was already paid; payment confirmed without a second invoice write"
        );
    }

    info!(
        payment_id = %confirmed.id,
        merchant_reference = %confirmed.merchant_reference,
        from_state = %payment.status,
        to_state = %confirmed.status,
        "payment confirmed"
    );

    side_effects.emit(PaymentEventType::PaymentConfirmed, &confirmed);
    Ok(confirmed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::memory::{InMemoryStore, InvoiceStatus};
    use crate::domain::payment::tests::sample_payment;
    use crate::services::error::GatewayError;

    async fn processing_payment(store: &InMemoryStore) -> Payment {
        let payment = sample_payment();
        store.open_invoice(&payment.invoice_id).await;
        store.insert_payment(&payment).await.unwrap();
        store
            .transition_status(
                payment.id,
                PaymentStatus::Pending,
                PaymentStatus::Processing,
                &StatusUpdate::default(),
                Utc::now(),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_confirmation_marks_invoice_paid() {
        let store = InMemoryStore::new();
        let payment = processing_payment(&store).await;

        let confirmed = confirm_and_mark_paid(
            &store,
            &SideEffects::default(),
            &payment,
            &StatusUpdate::default(),
            Utc::now(),
        )
        .await
        .unwrap();

        assert_eq!(confirmed.status, PaymentStatus::Confirmed);
        let invoice = store.invoice(&payment.invoice_id).await.unwrap();
        assert_eq!(invoice.status, InvoiceStatus::Paid);
        assert_eq!(invoice.paid_by, Some(payment.id));
    }

    #[tokio::test]
    async fn test_failed_invoice_write_rolls_back_payment() {
        let store = InMemoryStore::new();
        let payment = processing_payment(&store).await;
        store.fail_invoice_writes(true).await;

        let err = confirm_and_mark_paid(
            &store,
            &SideEffects::default(),
            &payment,
            &StatusUpdate::default(),
            Utc::now(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, GatewayError::Database(_)));
        let stored = store.find_payment(payment.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PaymentStatus::Processing);
        assert!(stored.confirmed_at.is_none());
        let invoice = store.invoice(&payment.invoice_id).await.unwrap();
        assert_eq!(invoice.status, InvoiceStatus::Open);
    }

    #[tokio::test]
    async fn test_pending_payment_stays_pending_when_confirmation_fails() {
        let store = InMemoryStore::new();
        let payment = sample_payment();
        store.open_invoice(&payment.invoice_id).await;
        store.insert_payment(&payment).await.unwrap();
        store.fail_invoice_writes(true).await;

        let err = confirm_and_mark_paid(
            &store,
            &SideEffects::default(),
            &payment,
            &StatusUpdate::default(),
            Utc::now(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, GatewayError::Database(_)));
        let stored = store.find_payment(payment.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PaymentStatus::Pending);
        assert!(stored.processed_at.is_none());

        store.fail_invoice_writes(false).await;
        let confirmed = confirm_and_mark_paid(
            &store,
            &SideEffects::default(),
            &payment,
            &StatusUpdate::default(),
            Utc::now(),
        )
        .await
        .unwrap();
        assert_eq!(confirmed.status, PaymentStatus::Confirmed);
        assert!(confirmed.processed_at.is_some());
    }
}
