//! Persistence seams used by the services.
//!
//! Every status write is a compare-and-swap: callers pass the status they
//! read and the write fails with `StaleState` if another writer got there
//! first. Writes that must land together go through a [`UnitOfWork`].

use crate::database::error::DatabaseError;
use crate::domain::{
    AuditAnnotation, Payment, PaymentStatus, ReconciliationRecord, ReconciliationStatus, Refund,
    RefundStatus, RefundUpdate, ResolutionAction, StatusUpdate,
};
use crate::services::risk::PayerHistory;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use uuid::Uuid;

#[async_trait]
pub trait PaymentStore: Send + Sync {
    /// Fails with `UniqueViolation` when the merchant reference is taken
    async fn insert_payment(&self, payment: &Payment) -> Result<(), DatabaseError>;

    async fn find_payment(&self, id: Uuid) -> Result<Option<Payment>, DatabaseError>;

    /// Most recent payment carrying this provider transaction id
    async fn find_by_external_transaction_id(
        &self,
        external_transaction_id: &str,
    ) -> Result<Option<Payment>, DatabaseError>;

    /// Provider transaction ids are only unique per provider
    async fn find_by_provider_transaction(
        &self,
        provider: &str,
        external_transaction_id: &str,
    ) -> Result<Option<Payment>, DatabaseError>;

    async fn merchant_reference_exists(&self, reference: &str) -> Result<bool, DatabaseError>;

    /// Single-row CAS outside of a unit of work
    async fn transition_status(
        &self,
        id: Uuid,
        expected: PaymentStatus,
        target: PaymentStatus,
        update: &StatusUpdate,
        at: DateTime<Utc>,
    ) -> Result<Payment, DatabaseError>;

    /// Save a provider settlement report without moving the payment, guarded on `expected`
    async fn record_provider_report(
        &self,
        id: Uuid,
        expected: PaymentStatus,
        report: &serde_json::Value,
        at: DateTime<Utc>,
    ) -> Result<Payment, DatabaseError>;

    async fn payer_history(
        &self,
        patient_id: &str,
        velocity_since: DateTime<Utc>,
        failures_since: DateTime<Utc>,
    ) -> Result<PayerHistory, DatabaseError>;

    /// Sum of amounts of payments that still count towards the provider's volume
    async fn provider_volume_since(
        &self,
        provider: &str,
        since: DateTime<Utc>,
    ) -> Result<Decimal, DatabaseError>;

    /// Unsettled payments of `amount` in `currency` initiated on `date`
    async fn find_unconfirmed_by_amount_on(
        &self,
        amount: Decimal,
        currency: &str,
        date: NaiveDate,
    ) -> Result<Vec<Payment>, DatabaseError>;

    /// Payments whose `confirmed_at` falls in `[from, to]`
    async fn find_confirmed_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Payment>, DatabaseError>;

    async fn find_processing_for_providers(
        &self,
        providers: &[String],
    ) -> Result<Vec<Payment>, DatabaseError>;

    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, DatabaseError>;
}

#[async_trait]
pub trait ReconciliationStore: Send + Sync {
    async fn insert_records(&self, records: &[ReconciliationRecord]) -> Result<(), DatabaseError>;

    async fn find_record(&self, id: Uuid) -> Result<Option<ReconciliationRecord>, DatabaseError>;

    async fn list_batch(&self, batch_id: Uuid) -> Result<Vec<ReconciliationRecord>, DatabaseError>;

    /// Annotations are the only change allowed after resolution
    async fn append_annotation(
        &self,
        id: Uuid,
        annotation: &AuditAnnotation,
    ) -> Result<ReconciliationRecord, DatabaseError>;
}

#[async_trait]
pub trait RefundStore: Send + Sync {
    async fn find_refund(&self, id: Uuid) -> Result<Option<Refund>, DatabaseError>;

    async fn list_for_payment(&self, payment_id: Uuid) -> Result<Vec<Refund>, DatabaseError>;
}

/// The invoice collaborator's read side
#[async_trait]
pub trait InvoiceLedger: Send + Sync {
    async fn is_open_for_payment(&self, invoice_id: &str) -> Result<bool, DatabaseError>;
}

/// Writes that commit or roll back together.
///
/// Dropping a unit of work without calling `commit` discards it.
#[async_trait]
pub trait UnitOfWork: Send {
    /// Reads and locks the payment for the rest of the unit of work
    async fn lock_payment(&mut self, id: Uuid) -> Result<Payment, DatabaseError>;

    async fn transition_status(
        &mut self,
        id: Uuid,
        expected: PaymentStatus,
        target: PaymentStatus,
        update: &StatusUpdate,
        at: DateTime<Utc>,
    ) -> Result<Payment, DatabaseError>;

    /// Returns `false` when the invoice was already paid
    async fn mark_invoice_paid(
        &mut self,
        invoice_id: &str,
        payment_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    async fn adjust_payment_amount(
        &mut self,
        id: Uuid,
        amount: Decimal,
        at: DateTime<Utc>,
    ) -> Result<Payment, DatabaseError>;

    async fn refunds_for_payment(&mut self, payment_id: Uuid) -> Result<Vec<Refund>, DatabaseError>;

    async fn insert_refund(&mut self, refund: &Refund) -> Result<(), DatabaseError>;

    async fn transition_refund(
        &mut self,
        id: Uuid,
        expected: RefundStatus,
        target: RefundStatus,
        update: &RefundUpdate,
        at: DateTime<Utc>,
    ) -> Result<Refund, DatabaseError>;

    async fn resolve_reconciliation(
        &mut self,
        id: Uuid,
        expected: ReconciliationStatus,
        action: ResolutionAction,
        resolver: &str,
        notes: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<ReconciliationRecord, DatabaseError>;

    async fn commit(self: Box<Self>) -> Result<(), DatabaseError>;

    async fn rollback(self: Box<Self>) -> Result<(), DatabaseError>;
}

/// Store handles shared by the services
#[derive(Clone)]
pub struct Stores {
    pub payments: Arc<dyn PaymentStore>,
    pub reconciliations: Arc<dyn ReconciliationStore>,
    pub refunds: Arc<dyn RefundStore>,
    pub invoices: Arc<dyn InvoiceLedger>,
}

impl Stores {
    pub fn in_memory(store: crate::database::memory::InMemoryStore) -> Self {
        let shared = Arc::new(store);
        Self {
            payments: shared.clone(),
            reconciliations: shared.clone(),
            refunds: shared.clone(),
            invoices: shared,
        }
    }

    #[cfg(feature = "database")]
    pub fn postgres(pool: sqlx::PgPool) -> Self {
        use crate::database::{
            invoice_repository::PgInvoiceLedger, payment_repository::PgPaymentStore,
            reconciliation_repository::PgReconciliationStore, refund_repository::PgRefundStore,
        };

        Self {
            payments: Arc::new(PgPaymentStore::new(pool.clone())),
            reconciliations: Arc::new(PgReconciliationStore::new(pool.clone())),
            refunds: Arc::new(PgRefundStore::new(pool.clone())),
            invoices: Arc::new(PgInvoiceLedger::new(pool)),
        }
    }
}
