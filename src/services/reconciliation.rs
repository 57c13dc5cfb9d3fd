//! Reconciliation engine
//!
//! Matches statement lines reported by banks and providers against stored
//! payments, flags payments with no external evidence, and resolves the
//! resulting discrepancies. Resolution side effects run in the same unit of
//! work as the record's status change, so resolving twice fails before any
//! second adjustment or refund.

use crate::database::repository::Stores;
use crate::domain::refund::reserved_total;
use crate::domain::{
    AuditAnnotation, DiscrepancyType, ExternalTransaction, Payment, PaymentStatus,
    ReconciliationRecord, ReconciliationReport, Refund, ResolutionAction,
};
use crate::payments::registry::ProviderRegistry;
use crate::services::error::{GatewayError, GatewayResult};
use crate::services::refunds::{finish, stage_refund, RefundDraft};
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolveDiscrepancyRequest {
    pub action: ResolutionAction,
    #[serde(default)]
    pub notes: Option<String>,
    /// Refund amount for `initiate_refund`; defaults to the absolute difference
    #[serde(default)]
    pub refund_amount: Option<Decimal>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResolutionOutcome {
    pub record: ReconciliationRecord,
    /// Payment after an amount adjustment
    pub payment: Option<Payment>,
    /// Refund spawned by the resolution
    pub refund: Option<Refund>,
}

#[derive(Clone)]
pub struct ReconciliationService {
    registry: ProviderRegistry,
    stores: Stores,
}

impl ReconciliationService {
    pub fn new(registry: ProviderRegistry, stores: Stores) -> Self {
        Self { registry, stores }
    }

    pub async fn batch(&self, batch_id: Uuid) -> GatewayResult<Vec<ReconciliationRecord>> {
        let records = self.stores.reconciliations.list_batch(batch_id).await?;
        if records.is_empty() {
            return Err(GatewayError::not_found("ReconciliationBatch", batch_id));
        }
        Ok(records)
    }

    pub async fn get(&self, record_id: Uuid) -> GatewayResult<ReconciliationRecord> {
        self.stores
            .reconciliations
            .find_record(record_id)
            .await?
            .ok_or_else(|| GatewayError::not_found("ReconciliationRecord", record_id))
    }

    /// Classify every statement line and persist the batch.
    ///
    /// Lines are processed one at a time; a lookup failure on one line leaves
    /// it INVESTIGATING with an annotation instead of failing the batch.
    pub async fn reconcile(
        &self,
        lines: Vec<ExternalTransaction>,
    ) -> GatewayResult<ReconciliationReport> {
        if lines.is_empty() {
            return Err(GatewayError::validation("records", "batch is empty"));
        }
        for (index, line) in lines.iter().enumerate() {
            validate_line(index, line)?;
        }

        let batch_id = Uuid::new_v4();
        let now = Utc::now();
        let mut matched_payments: HashSet<Uuid> = HashSet::new();
        let mut records = Vec::with_capacity(lines.len());

        for line in &lines {
            let mut record = ReconciliationRecord::from_external(batch_id, line, now);
            match self.locate_payment(line, &matched_payments).await {
                Ok(Some(payment)) => {
                    if !matched_payments.insert(payment.id) {
                        record.annotate(
                            "system",
                            "payment already matched by another line in this batch",
                            now,
                        );
                    }
                    record.classify_against(
                        payment.id,
                        payment.amount,
                        &payment.currency,
                        payment.provider_fee,
                    );
                }
                Ok(None) => record.mark_unmatched(),
                Err(e) => {
                    warn!(
                        external_transaction_id = %line.external_transaction_id,
                        error = %e,
                        "payment lookup failed during reconciliation"
                    );
                    record.mark_unmatched();
                    record.annotate("system", &format!("lookup failed: {}", e), now);
                }
            }
            records.push(record);
        }

        let (from, to) = batch_window(&lines);
        let confirmed = self.stores.payments.find_confirmed_between(from, to).await?;
        for payment in confirmed
            .into_iter()
            .filter(|p| !matched_payments.contains(&p.id))
        {
            let confirmed_at = payment.confirmed_at.unwrap_or(payment.updated_at);
            records.push(ReconciliationRecord::missing_externally(
                batch_id,
                payment.id,
                payment.amount,
                confirmed_at,
                now,
            ));
        }

        self.stores.reconciliations.insert_records(&records).await?;

        let report = ReconciliationReport::from_records(batch_id, lines.len(), records);
        info!(
            batch_id = %batch_id,
            total = report.total_records,
            matched = report.matched,
            mismatched = report.mismatched,
            investigating = report.investigating,
            missing_externally = report.missing_externally,
            "reconciliation batch finished"
        );
        Ok(report)
    }

    /// External id, then the caller's payment id hint, then a same-day amount match
    async fn locate_payment(
        &self,
        line: &ExternalTransaction,
        already_matched: &HashSet<Uuid>,
    ) -> GatewayResult<Option<Payment>> {
        let payments = &self.stores.payments;

        if let Some(payment) = payments
            .find_by_external_transaction_id(&line.external_transaction_id)
            .await?
        {
            return Ok(Some(payment));
        }

        if let Some(hint) = line.payment_id {
            if let Some(payment) = payments.find_payment(hint).await? {
                return Ok(Some(payment));
            }
        }

        let candidates = payments
            .find_unconfirmed_by_amount_on(
                line.amount,
                &line.currency.to_uppercase(),
                line.transaction_date.date_naive(),
            )
            .await?;
        Ok(candidates
            .into_iter()
            .find(|p| !already_matched.contains(&p.id)))
    }

    /// Resolve an open discrepancy and apply the chosen action.
    pub async fn resolve_discrepancy(
        &self,
        record_id: Uuid,
        request: ResolveDiscrepancyRequest,
        resolver: &str,
    ) -> GatewayResult<ResolutionOutcome> {
        let record = self.get(record_id).await?;
        if !record.status.is_open_discrepancy() {
            return Err(GatewayError::InvalidStateTransition {
                from: record.status.to_string(),
                to: request.action.target_status().to_string(),
            });
        }

        let now = Utc::now();
        let mut uow = self.stores.payments.begin().await?;

        let staged = async {
            let resolved = uow
                .resolve_reconciliation(
                    record.id,
                    record.status,
                    request.action,
                    resolver,
                    request.notes.clone(),
                    now,
                )
                .await?;

            let mut outcome = ResolutionOutcome {
                record: resolved,
                payment: None,
                refund: None,
            };

            match request.action {
                ResolutionAction::AdjustAmount => {
                    let payment_id = linked_payment(&record)?;
                    let amount = record.external_amount.ok_or_else(|| {
                        GatewayError::validation(
                            "action",
                            "record has no external amount to adjust to",
                        )
                    })?;
                    let payment = uow.lock_payment(payment_id).await?;
                    let refunds = uow.refunds_for_payment(payment_id).await?;
                    check_adjustment(&record, &payment, amount, &refunds)?;
                    let adjusted = uow.adjust_payment_amount(payment_id, amount, now).await?;
                    outcome.payment = Some(adjusted);
                }
                ResolutionAction::InitiateRefund => {
                    let payment_id = linked_payment(&record)?;
                    let amount = request
                        .refund_amount
                        .or_else(|| record.amount_difference.map(|d| d.abs()))
                        .filter(|a| *a > Decimal::ZERO)
                        .ok_or_else(|| {
                            GatewayError::validation(
                                "refund_amount",
                                "required when the record has no amount difference",
                            )
                        })?;
                    let reason = format!("reconciliation {}", record.id);
                    let draft = RefundDraft {
                        payment_id,
                        amount,
                        reason: &reason,
                        requested_by: resolver,
                        reconciliation_id: Some(record.id),
                    };
                    outcome.refund =
                        Some(stage_refund(uow.as_mut(), &self.registry, draft, now).await?);
                }
                ResolutionAction::WriteOff | ResolutionAction::ContactProvider => {}
            }
            Ok::<_, GatewayError>(outcome)
        }
        .await;

        let outcome = finish(uow, staged).await?;
        info!(
            record_id = %outcome.record.id,
            action = outcome.record.resolution_action.map(|a| a.as_str()).unwrap_or("-"),
            to_state = %outcome.record.status,
            resolver = %resolver,
            "discrepancy resolved"
        );
        Ok(outcome)
    }

    /// Append an audit note; allowed in every status
    pub async fn annotate(
        &self,
        record_id: Uuid,
        author: &str,
        note: &str,
    ) -> GatewayResult<ReconciliationRecord> {
        if note.trim().is_empty() {
            return Err(GatewayError::validation("note", "is required"));
        }
        let annotation = AuditAnnotation {
            author: author.to_string(),
            note: note.trim().to_string(),
            created_at: Utc::now(),
        };
        Ok(self
            .stores
            .reconciliations
            .append_annotation(record_id, &annotation)
            .await?)
    }
}

fn linked_payment(record: &ReconciliationRecord) -> GatewayResult<Uuid> {
    record.payment_id.ok_or_else(|| {
        GatewayError::validation("action", "record is not linked to a payment")
    })
}

/// An amount can only be rewritten on a settled payment, from a same-currency
/// amount mismatch, and never below its fees or what refunds already hold.
fn check_adjustment(
    record: &ReconciliationRecord,
    payment: &Payment,
    amount: Decimal,
    refunds: &[Refund],
) -> GatewayResult<()> {
    if record.discrepancy_type != Some(DiscrepancyType::AmountMismatch) {
        return Err(GatewayError::validation(
            "action",
            "adjust_amount only applies to amount mismatches",
        ));
    }
    let same_currency = record
        .external_currency
        .as_deref()
        .map(|c| c.eq_ignore_ascii_case(&payment.currency))
        .unwrap_or(false);
    if !same_currency {
        return Err(GatewayError::validation(
            "action",
            "statement currency differs from the payment currency",
        ));
    }
    if !matches!(
        payment.status,
        PaymentStatus::Confirmed | PaymentStatus::PartiallyRefunded
    ) {
        return Err(GatewayError::InvalidStateTransition {
            from: payment.status.to_string(),
            to: PaymentStatus::Confirmed.to_string(),
        });
    }
    if amount < payment.total_fees {
        return Err(GatewayError::validation(
            "action",
            format!(
                "adjusted amount {} is below the payment's fees {}",
                amount, payment.total_fees
            ),
        ));
    }
    let reserved = reserved_total(refunds);
    if amount < reserved {
        return Err(GatewayError::RefundExceedsPayment {
            requested: reserved.to_string(),
            refundable: amount.to_string(),
        });
    }
    Ok(())
}

fn validate_line(index: usize, line: &ExternalTransaction) -> GatewayResult<()> {
    let field = |name: &str| format!("records[{}].{}", index, name);
    if line.external_transaction_id.trim().is_empty() {
        return Err(GatewayError::validation(
            &field("external_transaction_id"),
            "is required",
        ));
    }
    if line.amount <= Decimal::ZERO {
        return Err(GatewayError::validation(
            &field("amount"),
            "must be greater than zero",
        ));
    }
    if line.currency.trim().len() != 3 {
        return Err(GatewayError::validation(
            &field("currency"),
            "must be a 3-letter ISO code",
        ));
    }
    Ok(())
}

/// Whole UTC days spanned by the batch's transaction dates
fn batch_window(lines: &[ExternalTransaction]) -> (DateTime<Utc>, DateTime<Utc>) {
    let dates = lines.iter().map(|l| l.transaction_date.date_naive());
    let first = dates.clone().min();
    let last = dates.max();
    match (first, last) {
        (Some(first), Some(last)) => {
            let start = first.and_hms_opt(0, 0, 0).map(|t| t.and_utc());
            let end = last
                .and_hms_opt(0, 0, 0)
                .map(|t| t.and_utc() + Duration::days(1) - Duration::nanoseconds(1));
            match (start, end) {
                (Some(start), Some(end)) => (start, end),
                _ => (Utc::now(), Utc::now()),
            }
        }
        _ => (Utc::now(), Utc::now()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn line(id: &str, day: u32) -> ExternalTransaction {
        ExternalTransaction {
            payment_id: None,
            external_transaction_id: id.to_string(),
            amount: dec!(1000.00),
            currency: "NGN".to_string(),
            fee: None,
            transaction_date: Utc.with_ymd_and_hms(2026, 10, day, 13, 0, 0).unwrap(),
            source_document: "statement-oct.csv".to_string(),
        }
    }

    #[test]
    fn test_batch_window_covers_whole_days() {
        let (from, to) = batch_window(&[line("A", 17), line("B", 15)]);
        assert_eq!(from, Utc.with_ymd_and_hms(2026, 10, 15, 0, 0, 0).unwrap());
        assert!(to > Utc.with_ymd_and_hms(2026, 10, 17, 23, 59, 59).unwrap());
        assert!(to < Utc.with_ymd_and_hms(2026, 10, 18, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_line_validation_names_the_field() {
        let mut bad = line("A", 15);
        bad.amount = dec!(0);
        let err = validate_line(3, &bad).unwrap_err();
        assert!(matches!(
            err,
            GatewayError::Validation { ref field, .. } if field == "records[3].amount"
        ));
    }

    fn settled(status: PaymentStatus) -> Payment {
        let mut payment = crate::domain::payment::tests::sample_payment();
        payment.status = status;
        payment
    }

    fn mismatch_for(payment: &Payment, amount: Decimal, currency: &str) -> ReconciliationRecord {
        let mut statement = line("BANK-9", 15);
        statement.amount = amount;
        statement.currency = currency.to_string();
        let mut record = ReconciliationRecord::from_external(Uuid::new_v4(), &statement, Utc::now());
        record.classify_against(payment.id, payment.amount, &payment.currency, payment.provider_fee);
        record
    }

    #[test]
    fn test_adjustment_accepts_same_currency_mismatch() {
        let payment = settled(PaymentStatus::Confirmed);
        let record = mismatch_for(&payment, dec!(1005), "NGN");
        assert!(check_adjustment(&record, &payment, dec!(1005), &[]).is_ok());
    }

    #[test]
    fn test_adjustment_refuses_currency_mismatch() {
        let payment = settled(PaymentStatus::Confirmed);
        let record = mismatch_for(&payment, dec!(2), "USD");
        assert_eq!(record.discrepancy_type, Some(DiscrepancyType::CurrencyMismatch));

        let err = check_adjustment(&record, &payment, dec!(2), &[]).unwrap_err();
        assert!(matches!(err, GatewayError::Validation { .. }));
    }

    #[test]
    fn test_adjustment_cannot_drop_below_fees_or_refunds() {
        let payment = settled(PaymentStatus::PartiallyRefunded);
        let record = mismatch_for(&payment, dec!(10), "NGN");
        let err = check_adjustment(&record, &payment, dec!(10), &[]).unwrap_err();
        assert!(matches!(err, GatewayError::Validation { .. }));

        let mut refund = Refund::request(payment.id, dec!(600), "NGN", "overcharge", "cashier", None, Utc::now());
        refund.status = crate::domain::RefundStatus::Completed;
        let err = check_adjustment(&record, &payment, dec!(500), &[refund]).unwrap_err();
        assert!(matches!(err, GatewayError::RefundExceedsPayment { .. }));
    }

    #[test]
    fn test_adjustment_requires_a_settled_payment() {
        for status in [PaymentStatus::Failed, PaymentStatus::Cancelled, PaymentStatus::Refunded] {
            let payment = settled(status);
            let record = mismatch_for(&payment, dec!(1005), "NGN");
            let err = check_adjustment(&record, &payment, dec!(1005), &[]).unwrap_err();
            assert!(matches!(err, GatewayError::InvalidStateTransition { .. }));
        }
    }
}
