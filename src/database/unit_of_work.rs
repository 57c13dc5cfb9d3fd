use crate::database::error::DatabaseError;
use crate::database::repository::UnitOfWork;
use crate::database::{
    invoice_repository, payment_repository, reconciliation_repository, refund_repository,
};
use crate::domain::{
    Payment, PaymentStatus, ReconciliationRecord, ReconciliationStatus, Refund, RefundStatus,
    RefundUpdate, ResolutionAction, StatusUpdate,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{Postgres, Transaction};
use uuid::Uuid;

/// A unit of work over one Postgres transaction. Rows are locked with
/// `FOR UPDATE` on first read and every write is still guarded on the status it
/// was read in.
pub struct PgUnitOfWork {
    tx: Transaction<'static, Postgres>,
}

impl PgUnitOfWork {
    pub fn new(tx: Transaction<'static, Postgres>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl UnitOfWork for PgUnitOfWork {
    async fn lock_payment(&mut self, id: Uuid) -> Result<Payment, DatabaseError> {
        payment_repository::lock_payment(&mut self.tx, id).await
    }

    async fn transition_status(
        &mut self,
        id: Uuid,
        expected: PaymentStatus,
        target: PaymentStatus,
        update: &StatusUpdate,
        at: DateTime<Utc>,
    ) -> Result<Payment, DatabaseError> {
        payment_repository::transition_in(&mut self.tx, id, expected, target, update, at).await
    }

    async fn mark_invoice_paid(
        &mut self,
        invoice_id: &str,
        payment_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        invoice_repository::mark_invoice_paid(&mut self.tx, invoice_id, payment_id, at).await
    }

    async fn adjust_payment_amount(
        &mut self,
        id: Uuid,
        amount: Decimal,
        at: DateTime<Utc>,
    ) -> Result<Payment, DatabaseError> {
        let mut payment = payment_repository::lock_payment(&mut self.tx, id).await?;
        let status = payment.status;
        payment.adjust_amount(amount, at);
        payment_repository::write_payment(&mut self.tx, &payment, status).await?;
        Ok(payment)
    }

    async fn refunds_for_payment(&mut self, payment_id: Uuid) -> Result<Vec<Refund>, DatabaseError> {
        refund_repository::refunds_for_payment(&mut self.tx, payment_id).await
    }

    async fn insert_refund(&mut self, refund: &Refund) -> Result<(), DatabaseError> {
        refund_repository::insert_refund(&mut self.tx, refund).await
    }

    async fn transition_refund(
        &mut self,
        id: Uuid,
        expected: RefundStatus,
        target: RefundStatus,
        update: &RefundUpdate,
        at: DateTime<Utc>,
    ) -> Result<Refund, DatabaseError> {
        let mut refund = refund_repository::lock_refund(&mut self.tx, id).await?;
        if refund.status != expected {
            return Err(DatabaseError::stale("Refund", id, expected, refund.status));
        }
        refund.apply_transition(target, update, at)?;
        refund_repository::write_refund(&mut self.tx, &refund, expected).await?;
        Ok(refund)
    }

    async fn resolve_reconciliation(
        &mut self,
        id: Uuid,
        expected: ReconciliationStatus,
        action: ResolutionAction,
        resolver: &str,
        notes: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<ReconciliationRecord, DatabaseError> {
        let mut record = reconciliation_repository::lock_record(&mut self.tx, id).await?;
        if record.status != expected {
            return Err(DatabaseError::stale(
                "ReconciliationRecord",
                id,
                expected,
                record.status,
            ));
        }
        record.resolve(action, resolver, notes, at)?;
        reconciliation_repository::write_resolution(&mut self.tx, &record, expected).await?;
        Ok(record)
    }

    async fn commit(self: Box<Self>) -> Result<(), DatabaseError> {
        self.tx.commit().await.map_err(DatabaseError::from_sqlx)
    }

    async fn rollback(self: Box<Self>) -> Result<(), DatabaseError> {
        self.tx.rollback().await.map_err(DatabaseError::from_sqlx)
    }
}
