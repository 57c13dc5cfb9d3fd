//! In-process store used with `SKIP_EXTERNALS=true` and by the test suite.
//!
//! A unit of work stages its writes and remembers the version of every row it
//! read. Commit takes the write lock, checks those versions against the live
//! rows and either applies everything or nothing.

use crate::database::error::{DatabaseError, DatabaseErrorKind};
use crate::database::repository::{
    InvoiceLedger, PaymentStore, ReconciliationStore, RefundStore, UnitOfWork,
};
use crate::domain::{
    AuditAnnotation, Payment, PaymentStatus, ReconciliationRecord, ReconciliationStatus, Refund,
    RefundStatus, RefundUpdate, ResolutionAction, StatusUpdate,
};
use crate::services::risk::PayerHistory;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvoiceStatus {
    Open,
    Paid,
    Void,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvoiceEntry {
    pub status: InvoiceStatus,
    pub paid_by: Option<Uuid>,
    pub paid_at: Option<DateTime<Utc>>,
}

impl InvoiceEntry {
    fn open() -> Self {
        Self {
            status: InvoiceStatus::Open,
            paid_by: None,
            paid_at: None,
        }
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    payments: HashMap<Uuid, Payment>,
    /// Bumped on every committed write; a locked payment counts as written
    payment_versions: HashMap<Uuid, u64>,
    records: HashMap<Uuid, ReconciliationRecord>,
    refunds: HashMap<Uuid, Refund>,
    invoices: HashMap<String, InvoiceEntry>,
    invoice_paid_writes: u64,
    fail_invoice_writes: bool,
    /// Unknown invoices are treated as open
    permissive_invoices: bool,
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    state: Arc<RwLock<MemoryState>>,
}

impl MemoryState {
    fn payment_version(&self, id: &Uuid) -> u64 {
        self.payment_versions.get(id).copied().unwrap_or(0)
    }

    fn bump_payment(&mut self, id: Uuid) {
        *self.payment_versions.entry(id).or_insert(0) += 1;
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store that accepts any invoice id as open; for running without the billing service
    pub fn permissive() -> Self {
        let state = MemoryState {
            permissive_invoices: true,
            ..Default::default()
        };
        Self {
            state: Arc::new(RwLock::new(state)),
        }
    }

    pub async fn open_invoice(&self, invoice_id: &str) {
        let mut state = self.state.write().await;
        state
            .invoices
            .insert(invoice_id.to_string(), InvoiceEntry::open());
    }

    pub async fn void_invoice(&self, invoice_id: &str) {
        let mut state = self.state.write().await;
        if let Some(entry) = state.invoices.get_mut(invoice_id) {
            entry.status = InvoiceStatus::Void;
        }
    }

    pub async fn invoice(&self, invoice_id: &str) -> Option<InvoiceEntry> {
        self.state.read().await.invoices.get(invoice_id).cloned()
    }

    /// Number of committed mark-paid writes
    pub async fn invoice_paid_count(&self) -> u64 {
        self.state.read().await.invoice_paid_writes
    }

    /// Makes every `mark_invoice_paid` fail until switched off again
    pub async fn fail_invoice_writes(&self, fail: bool) {
        self.state.write().await.fail_invoice_writes = fail;
    }

    pub async fn payment_count(&self) -> usize {
        self.state.read().await.payments.len()
    }

    /// Overwrite a payment row as-is
    pub async fn put_payment(&self, payment: Payment) {
        let mut state = self.state.write().await;
        state.bump_payment(payment.id);
        state.payments.insert(payment.id, payment);
    }
}

fn apply_payment_transition(
    payment: &mut Payment,
    expected: PaymentStatus,
    target: PaymentStatus,
    update: &StatusUpdate,
    at: DateTime<Utc>,
) -> Result<(), DatabaseError> {
    if payment.status != expected {
        return Err(DatabaseError::stale("Payment", payment.id, expected, payment.status));
    }
    payment.apply_transition(target, update, at)?;
    Ok(())
}

#[async_trait]
impl PaymentStore for InMemoryStore {
    async fn insert_payment(&self, payment: &Payment) -> Result<(), DatabaseError> {
        let mut state = self.state.write().await;
        if state
            .payments
            .values()
            .any(|p| p.merchant_reference == payment.merchant_reference)
        {
            return Err(DatabaseError::new(DatabaseErrorKind::UniqueViolation {
                constraint: "payments_merchant_reference_key".to_string(),
            }));
        }
        state.bump_payment(payment.id);
        state.payments.insert(payment.id, payment.clone());
        Ok(())
    }

    async fn find_payment(&self, id: Uuid) -> Result<Option<Payment>, DatabaseError> {
        Ok(self.state.read().await.payments.get(&id).cloned())
    }

    async fn find_by_external_transaction_id(
        &self,
        external_transaction_id: &str,
    ) -> Result<Option<Payment>, DatabaseError> {
        let state = self.state.read().await;
        Ok(state
            .payments
            .values()
            .filter(|p| p.external_transaction_id.as_deref() == Some(external_transaction_id))
            .max_by_key(|p| p.initiated_at)
            .cloned())
    }

    async fn find_by_provider_transaction(
        &self,
        provider: &str,
        external_transaction_id: &str,
    ) -> Result<Option<Payment>, DatabaseError> {
        let state = self.state.read().await;
        Ok(state
            .payments
            .values()
            .find(|p| {
                p.provider == provider
                    && p.external_transaction_id.as_deref() == Some(external_transaction_id)
            })
            .cloned())
    }

    async fn merchant_reference_exists(&self, reference: &str) -> Result<bool, DatabaseError> {
        let state = self.state.read().await;
        Ok(state
            .payments
            .values()
            .any(|p| p.merchant_reference == reference))
    }

    async fn transition_status(
        &self,
        id: Uuid,
        expected: PaymentStatus,
        target: PaymentStatus,
        update: &StatusUpdate,
        at: DateTime<Utc>,
    ) -> Result<Payment, DatabaseError> {
        let mut state = self.state.write().await;
        let payment = state
            .payments
            .get_mut(&id)
            .ok_or_else(|| DatabaseError::not_found("Payment", id))?;
        let mut next = payment.clone();
        apply_payment_transition(&mut next, expected, target, update, at)?;
        *payment = next.clone();
        state.bump_payment(id);
        Ok(next)
    }

    async fn record_provider_report(
        &self,
        id: Uuid,
        expected: PaymentStatus,
        report: &serde_json::Value,
        at: DateTime<Utc>,
    ) -> Result<Payment, DatabaseError> {
        let mut state = self.state.write().await;
        let payment = state
            .payments
            .get_mut(&id)
            .ok_or_else(|| DatabaseError::not_found("Payment", id))?;
        if payment.status != expected {
            return Err(DatabaseError::stale("Payment", id, expected, payment.status));
        }
        payment.record_provider_report(report.clone(), at);
        let recorded = payment.clone();
        state.bump_payment(id);
        Ok(recorded)
    }

    async fn payer_history(
        &self,
        patient_id: &str,
        velocity_since: DateTime<Utc>,
        failures_since: DateTime<Utc>,
    ) -> Result<PayerHistory, DatabaseError> {
        let state = self.state.read().await;
        let mut history = PayerHistory::default();
        for payment in state.payments.values().filter(|p| p.patient_id == patient_id) {
            history.prior_payments += 1;
            if payment.initiated_at >= velocity_since {
                history.payments_in_velocity_window += 1;
            }
            let failed = matches!(payment.status, PaymentStatus::Failed | PaymentStatus::Rejected);
            if failed && payment.failed_at.is_some_and(|at| at >= failures_since) {
                history.recent_failures += 1;
            }
        }
        Ok(history)
    }

    async fn provider_volume_since(
        &self,
        provider: &str,
        since: DateTime<Utc>,
    ) -> Result<Decimal, DatabaseError> {
        let state = self.state.read().await;
        Ok(state
            .payments
            .values()
            .filter(|p| {
                p.provider == provider && p.initiated_at >= since && p.status.counts_towards_volume()
            })
            .map(|p| p.amount)
            .sum())
    }

    async fn find_unconfirmed_by_amount_on(
        &self,
        amount: Decimal,
        currency: &str,
        date: NaiveDate,
    ) -> Result<Vec<Payment>, DatabaseError> {
        let state = self.state.read().await;
        let mut found: Vec<Payment> = state
            .payments
            .values()
            .filter(|p| {
                p.status.is_unsettled()
                    && p.amount == amount
                    && p.currency.eq_ignore_ascii_case(currency)
                    && p.initiated_at.date_naive() == date
            })
            .cloned()
            .collect();
        found.sort_by_key(|p| p.initiated_at);
        Ok(found)
    }

    async fn find_confirmed_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Payment>, DatabaseError> {
        let state = self.state.read().await;
        let mut found: Vec<Payment> = state
            .payments
            .values()
            .filter(|p| p.confirmed_at.is_some_and(|at| at >= from && at <= to))
            .cloned()
            .collect();
        found.sort_by_key(|p| p.confirmed_at);
        Ok(found)
    }

    async fn find_processing_for_providers(
        &self,
        providers: &[String],
    ) -> Result<Vec<Payment>, DatabaseError> {
        let state = self.state.read().await;
        let mut found: Vec<Payment> = state
            .payments
            .values()
            .filter(|p| p.status == PaymentStatus::Processing && providers.contains(&p.provider))
            .cloned()
            .collect();
        found.sort_by_key(|p| p.initiated_at);
        Ok(found)
    }

    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, DatabaseError> {
        Ok(Box::new(MemoryUnitOfWork {
            state: self.state.clone(),
            payments: HashMap::new(),
            payment_versions: HashMap::new(),
            refunds: HashMap::new(),
            records: HashMap::new(),
            invoices: HashMap::new(),
            invoice_marks: 0,
        }))
    }
}

#[async_trait]
impl ReconciliationStore for InMemoryStore {
    async fn insert_records(&self, records: &[ReconciliationRecord]) -> Result<(), DatabaseError> {
        let mut state = self.state.write().await;
        for record in records {
            state.records.insert(record.id, record.clone());
        }
        Ok(())
    }

    async fn find_record(&self, id: Uuid) -> Result<Option<ReconciliationRecord>, DatabaseError> {
        Ok(self.state.read().await.records.get(&id).cloned())
    }

    async fn list_batch(&self, batch_id: Uuid) -> Result<Vec<ReconciliationRecord>, DatabaseError> {
        let state = self.state.read().await;
        let mut records: Vec<ReconciliationRecord> = state
            .records
            .values()
            .filter(|r| r.batch_id == batch_id)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }

    async fn append_annotation(
        &self,
        id: Uuid,
        annotation: &AuditAnnotation,
    ) -> Result<ReconciliationRecord, DatabaseError> {
        let mut state = self.state.write().await;
        let record = state
            .records
            .get_mut(&id)
            .ok_or_else(|| DatabaseError::not_found("ReconciliationRecord", id))?;
        record.annotate(&annotation.author, &annotation.note, annotation.created_at);
        Ok(record.clone())
    }
}

#[async_trait]
impl RefundStore for InMemoryStore {
    async fn find_refund(&self, id: Uuid) -> Result<Option<Refund>, DatabaseError> {
        Ok(self.state.read().await.refunds.get(&id).cloned())
    }

    async fn list_for_payment(&self, payment_id: Uuid) -> Result<Vec<Refund>, DatabaseError> {
        let state = self.state.read().await;
        let mut refunds: Vec<Refund> = state
            .refunds
            .values()
            .filter(|r| r.payment_id == payment_id)
            .cloned()
            .collect();
        refunds.sort_by_key(|r| r.requested_at);
        Ok(refunds)
    }
}

#[async_trait]
impl InvoiceLedger for InMemoryStore {
    async fn is_open_for_payment(&self, invoice_id: &str) -> Result<bool, DatabaseError> {
        let state = self.state.read().await;
        Ok(match state.invoices.get(invoice_id) {
            Some(entry) => entry.status == InvoiceStatus::Open,
            None => state.permissive_invoices,
        })
    }
}

/// Row read inside a unit of work: the version it was read at and the staged value
struct Staged<T> {
    base: Option<T>,
    current: T,
}

pub struct MemoryUnitOfWork {
    state: Arc<RwLock<MemoryState>>,
    payments: HashMap<Uuid, Staged<Payment>>,
    payment_versions: HashMap<Uuid, u64>,
    refunds: HashMap<Uuid, Staged<Refund>>,
    records: HashMap<Uuid, Staged<ReconciliationRecord>>,
    invoices: HashMap<String, Staged<InvoiceEntry>>,
    invoice_marks: u64,
}

fn unchanged<K: Eq + Hash, T: PartialEq>(
    live: &HashMap<K, T>,
    key: &K,
    base: &Option<T>,
) -> bool {
    live.get(key) == base.as_ref()
}

impl MemoryUnitOfWork {
    async fn payment_mut(&mut self, id: Uuid) -> Result<&mut Payment, DatabaseError> {
        if !self.payments.contains_key(&id) {
            let state = self.state.read().await;
            let live = state
                .payments
                .get(&id)
                .cloned()
                .ok_or_else(|| DatabaseError::not_found("Payment", id))?;
            self.payment_versions.insert(id, state.payment_version(&id));
            drop(state);
            self.payments.insert(
                id,
                Staged {
                    base: Some(live.clone()),
                    current: live,
                },
            );
        }
        self.payments
            .get_mut(&id)
            .map(|s| &mut s.current)
            .ok_or_else(|| DatabaseError::not_found("Payment", id))
    }

    async fn refund_mut(&mut self, id: Uuid) -> Result<&mut Refund, DatabaseError> {
        if !self.refunds.contains_key(&id) {
            let live = self
                .state
                .read()
                .await
                .refunds
                .get(&id)
                .cloned()
                .ok_or_else(|| DatabaseError::not_found("Refund", id))?;
            self.refunds.insert(
                id,
                Staged {
                    base: Some(live.clone()),
                    current: live,
                },
            );
        }
        self.refunds
            .get_mut(&id)
            .map(|s| &mut s.current)
            .ok_or_else(|| DatabaseError::not_found("Refund", id))
    }

    async fn record_mut(&mut self, id: Uuid) -> Result<&mut ReconciliationRecord, DatabaseError> {
        if !self.records.contains_key(&id) {
            let live = self
                .state
                .read()
                .await
                .records
                .get(&id)
                .cloned()
                .ok_or_else(|| DatabaseError::not_found("ReconciliationRecord", id))?;
            self.records.insert(
                id,
                Staged {
                    base: Some(live.clone()),
                    current: live,
                },
            );
        }
        self.records
            .get_mut(&id)
            .map(|s| &mut s.current)
            .ok_or_else(|| DatabaseError::not_found("ReconciliationRecord", id))
    }
}

#[async_trait]
impl UnitOfWork for MemoryUnitOfWork {
    async fn lock_payment(&mut self, id: Uuid) -> Result<Payment, DatabaseError> {
        Ok(self.payment_mut(id).await?.clone())
    }

    async fn transition_status(
        &mut self,
        id: Uuid,
        expected: PaymentStatus,
        target: PaymentStatus,
        update: &StatusUpdate,
        at: DateTime<Utc>,
    ) -> Result<Payment, DatabaseError> {
        let payment = self.payment_mut(id).await?;
        let mut next = payment.clone();
        apply_payment_transition(&mut next, expected, target, update, at)?;
        *payment = next.clone();
        Ok(next)
    }

    async fn mark_invoice_paid(
        &mut self,
        invoice_id: &str,
        payment_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        if !self.invoices.contains_key(invoice_id) {
            let state = self.state.read().await;
            if state.fail_invoice_writes {
                return Err(DatabaseError::new(DatabaseErrorKind::Query {
                    message: format!("invoice {} could not be updated", invoice_id),
                }));
            }
            let base = state.invoices.get(invoice_id).cloned();
            let current = match (&base, state.permissive_invoices) {
                (Some(entry), _) => entry.clone(),
                (None, true) => InvoiceEntry::open(),
                (None, false) => return Err(DatabaseError::not_found("Invoice", invoice_id)),
            };
            drop(state);
            self.invoices
                .insert(invoice_id.to_string(), Staged { base, current });
        } else if self.state.read().await.fail_invoice_writes {
            return Err(DatabaseError::new(DatabaseErrorKind::Query {
                message: format!("invoice {} could not be updated", invoice_id),
            }));
        }

        let entry = self
            .invoices
            .get_mut(invoice_id)
            .map(|s| &mut s.current)
            .ok_or_else(|| DatabaseError::not_found("Invoice", invoice_id))?;
        if entry.status != InvoiceStatus::Open {
            return Ok(false);
        }
        entry.status = InvoiceStatus::Paid;
        entry.paid_by = Some(payment_id);
        entry.paid_at = Some(at);
        self.invoice_marks += 1;
        Ok(true)
    }

    async fn adjust_payment_amount(
        &mut self,
        id: Uuid,
        amount: Decimal,
        at: DateTime<Utc>,
    ) -> Result<Payment, DatabaseError> {
        let payment = self.payment_mut(id).await?;
        payment.adjust_amount(amount, at);
        Ok(payment.clone())
    }

    async fn refunds_for_payment(&mut self, payment_id: Uuid) -> Result<Vec<Refund>, DatabaseError> {
        let mut refunds: HashMap<Uuid, Refund> = self
            .state
            .read()
            .await
            .refunds
            .values()
            .filter(|r| r.payment_id == payment_id)
            .map(|r| (r.id, r.clone()))
            .collect();
        for staged in self.refunds.values() {
            if staged.current.payment_id == payment_id {
                refunds.insert(staged.current.id, staged.current.clone());
            }
        }
        let mut refunds: Vec<Refund> = refunds.into_values().collect();
        refunds.sort_by_key(|r| r.requested_at);
        Ok(refunds)
    }

    async fn insert_refund(&mut self, refund: &Refund) -> Result<(), DatabaseError> {
        if let Some(reconciliation_id) = refund.reconciliation_id {
            let state = self.state.read().await;
            let taken = state
                .refunds
                .values()
                .chain(self.refunds.values().map(|s| &s.current))
                .any(|r| r.reconciliation_id == Some(reconciliation_id));
            if taken {
                return Err(DatabaseError::new(DatabaseErrorKind::UniqueViolation {
                    constraint: "refunds_reconciliation_id_key".to_string(),
                }));
            }
        }
        self.refunds.insert(
            refund.id,
            Staged {
                base: None,
                current: refund.clone(),
            },
        );
        Ok(())
    }

    async fn transition_refund(
        &mut self,
        id: Uuid,
        expected: RefundStatus,
        target: RefundStatus,
        update: &RefundUpdate,
        at: DateTime<Utc>,
    ) -> Result<Refund, DatabaseError> {
        let refund = self.refund_mut(id).await?;
        if refund.status != expected {
            return Err(DatabaseError::stale("Refund", id, expected, refund.status));
        }
        let mut next = refund.clone();
        next.apply_transition(target, update, at)?;
        *refund = next.clone();
        Ok(next)
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
        let record = self.record_mut(id).await?;
        if record.status != expected {
            return Err(DatabaseError::stale(
                "ReconciliationRecord",
                id,
                expected,
                record.status,
            ));
        }
        let mut next = record.clone();
        next.resolve(action, resolver, notes, at)?;
        *record = next.clone();
        Ok(next)
    }

    async fn commit(self: Box<Self>) -> Result<(), DatabaseError> {
        let this = *self;
        let mut state = this.state.write().await;

        for (id, staged) in &this.payments {
            let read_version = this.payment_versions.get(id).copied().unwrap_or(0);
            if state.payment_version(id) != read_version
                || !unchanged(&state.payments, id, &staged.base)
            {
                return Err(DatabaseError::stale("Payment", id, "read version", "newer version"));
            }
        }
        for (id, staged) in &this.refunds {
            if !unchanged(&state.refunds, id, &staged.base) {
                return Err(DatabaseError::stale("Refund", id, "read version", "newer version"));
            }
        }
        for (id, staged) in &this.records {
            if !unchanged(&state.records, id, &staged.base) {
                return Err(DatabaseError::stale(
                    "ReconciliationRecord",
                    id,
                    "read version",
                    "newer version",
                ));
            }
        }
        for (id, staged) in &this.invoices {
            if !unchanged(&state.invoices, id, &staged.base) {
                return Err(DatabaseError::stale("Invoice", id, "read version", "newer version"));
            }
        }

        for (id, staged) in this.payments {
            state.bump_payment(id);
            state.payments.insert(id, staged.current);
        }
        for (id, staged) in this.refunds {
            state.refunds.insert(id, staged.current);
        }
        for (id, staged) in this.records {
            state.records.insert(id, staged.current);
        }
        for (id, staged) in this.invoices {
            state.invoices.insert(id, staged.current);
        }
        state.invoice_paid_writes += this.invoice_marks;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), DatabaseError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::payment::tests::sample_payment;

    #[tokio::test]
    async fn test_duplicate_merchant_reference_rejected() {
        let store = InMemoryStore::new();
        let first = sample_payment();
        let mut second = sample_payment();
        second.merchant_reference = first.merchant_reference.clone();

        store.insert_payment(&first).await.unwrap();
        let err = store.insert_payment(&second).await.unwrap_err();
        assert!(matches!(err.kind, DatabaseErrorKind::UniqueViolation { .. }));
    }

    #[tokio::test]
    async fn test_cas_fails_on_unexpected_status() {
        let store = InMemoryStore::new();
        let payment = sample_payment();
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
            .unwrap();

        let err = store
            .transition_status(
                payment.id,
                PaymentStatus::Pending,
                PaymentStatus::Processing,
                &StatusUpdate::default(),
                Utc::now(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err.kind, DatabaseErrorKind::StaleState { .. }));
    }

    #[tokio::test]
    async fn test_uncommitted_unit_of_work_leaves_no_trace() {
        let store = InMemoryStore::new();
        let payment = sample_payment();
        store.insert_payment(&payment).await.unwrap();
        store.open_invoice(&payment.invoice_id).await;

        let mut uow = store.begin().await.unwrap();
        uow.transition_status(
            payment.id,
            PaymentStatus::Pending,
            PaymentStatus::Processing,
            &StatusUpdate::default(),
            Utc::now(),
        )
        .await
        .unwrap();
        assert!(uow
            .mark_invoice_paid(&payment.invoice_id, payment.id, Utc::now())
            .await
            .unwrap());
        uow.rollback().await.unwrap();

        let stored = store.find_payment(payment.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PaymentStatus::Pending);
        assert_eq!(
            store.invoice(&payment.invoice_id).await.unwrap().status,
            InvoiceStatus::Open
        );
        assert_eq!(store.invoice_paid_count().await, 0);
    }

    #[tokio::test]
    async fn test_commit_detects_concurrent_write() {
        let store = InMemoryStore::new();
        let payment = sample_payment();
        store.insert_payment(&payment).await.unwrap();

        let mut uow = store.begin().await.unwrap();
        uow.transition_status(
            payment.id,
            PaymentStatus::Pending,
            PaymentStatus::Processing,
            &StatusUpdate::default(),
            Utc::now(),
        )
        .await
        .unwrap();

        store
            .transition_status(
                payment.id,
                PaymentStatus::Pending,
                PaymentStatus::Cancelled,
                &StatusUpdate::default(),
                Utc::now(),
            )
            .await
            .unwrap();

        assert!(uow.commit().await.is_err());
        let stored = store.find_payment(payment.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PaymentStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_invoice_marked_paid_once() {
        let store = InMemoryStore::new();
        let payment = sample_payment();
        store.open_invoice(&payment.invoice_id).await;

        let mut uow = store.begin().await.unwrap();
        assert!(uow
            .mark_invoice_paid(&payment.invoice_id, payment.id, Utc::now())
            .await
            .unwrap());
        uow.commit().await.unwrap();

        let mut uow = store.begin().await.unwrap();
        assert!(!uow
            .mark_invoice_paid(&payment.invoice_id, payment.id, Utc::now())
            .await
            .unwrap());
        uow.commit().await.unwrap();

        assert_eq!(store.invoice_paid_count().await, 1);
        assert!(!store.is_open_for_payment(&payment.invoice_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_locked_payment_serialises_units_of_work() {
        let store = InMemoryStore::new();
        let payment = sample_payment();
        store.insert_payment(&payment).await.unwrap();

        let mut first = store.begin().await.unwrap();
        let mut second = store.begin().await.unwrap();
        first.lock_payment(payment.id).await.unwrap();
        second.lock_payment(payment.id).await.unwrap();

        let refund = |amount| {
            Refund::request(payment.id, amount, "NGN", "overcharge", "clerk", None, Utc::now())
        };
        first.insert_refund(&refund(Decimal::new(600, 0))).await.unwrap();
        second.insert_refund(&refund(Decimal::new(600, 0))).await.unwrap();

        first.commit().await.unwrap();
        assert!(second.commit().await.is_err());
        assert_eq!(store.list_for_payment(payment.id).await.unwrap().len(), 1);
    }
}
