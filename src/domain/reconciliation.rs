use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::payment::InvalidTransition;

/// Two amounts closer than this are considered equal
pub fn matching_tolerance() -> Decimal {
    Decimal::new(1, 2)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReconciliationStatus {
    Pending,
    Matched,
    Mismatch,
    Investigating,
    Resolved,
    WrittenOff,
}

impl ReconciliationStatus {
    pub fn valid_transitions(&self) -> &'static [ReconciliationStatus] {
        match self {
            ReconciliationStatus::Pending => &[
                ReconciliationStatus::Matched,
                ReconciliationStatus::Mismatch,
                ReconciliationStatus::Investigating,
            ],
            ReconciliationStatus::Mismatch | ReconciliationStatus::Investigating => &[
                ReconciliationStatus::Resolved,
                ReconciliationStatus::WrittenOff,
            ],
            ReconciliationStatus::Matched
            | ReconciliationStatus::Resolved
            | ReconciliationStatus::WrittenOff => &[],
        }
    }

    pub fn can_transition_to(&self, target: ReconciliationStatus) -> bool {
        self.valid_transitions().contains(&target)
    }

    pub fn is_open_discrepancy(&self) -> bool {
        matches!(
            self,
            ReconciliationStatus::Mismatch | ReconciliationStatus::Investigating
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReconciliationStatus::Pending => "PENDING",
            ReconciliationStatus::Matched => "MATCHED",
            ReconciliationStatus::Mismatch => "MISMATCH",
            ReconciliationStatus::Investigating => "INVESTIGATING",
            ReconciliationStatus::Resolved => "RESOLVED",
            ReconciliationStatus::WrittenOff => "WRITTEN_OFF",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "PENDING" => Some(ReconciliationStatus::Pending),
            "MATCHED" => Some(ReconciliationStatus::Matched),
            "MISMATCH" => Some(ReconciliationStatus::Mismatch),
            "INVESTIGATING" => Some(ReconciliationStatus::Investigating),
            "RESOLVED" => Some(ReconciliationStatus::Resolved),
            "WRITTEN_OFF" => Some(ReconciliationStatus::WrittenOff),
            _ => None,
        }
    }
}

impl fmt::Display for ReconciliationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DiscrepancyType {
    AmountMismatch,
    CurrencyMismatch,
    /// External record with no payment in the system
    Missing,
    /// Confirmed payment with no external evidence
    MissingExternally,
}

impl DiscrepancyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiscrepancyType::AmountMismatch => "AMOUNT_MISMATCH",
            DiscrepancyType::CurrencyMismatch => "CURRENCY_MISMATCH",
            DiscrepancyType::Missing => "MISSING",
            DiscrepancyType::MissingExternally => "MISSING_EXTERNALLY",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "AMOUNT_MISMATCH" => Some(DiscrepancyType::AmountMismatch),
            "CURRENCY_MISMATCH" => Some(DiscrepancyType::CurrencyMismatch),
            "MISSING" => Some(DiscrepancyType::Missing),
            "MISSING_EXTERNALLY" => Some(DiscrepancyType::MissingExternally),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionAction {
    /// Overwrite the payment's recorded amount with the external amount
    AdjustAmount,
    InitiateRefund,
    WriteOff,
    ContactProvider,
}

impl ResolutionAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionAction::AdjustAmount => "adjust_amount",
            ResolutionAction::InitiateRefund => "initiate_refund",
            ResolutionAction::WriteOff => "write_off",
            ResolutionAction::ContactProvider => "contact_provider",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "adjust_amount" => Some(ResolutionAction::AdjustAmount),
            "initiate_refund" => Some(ResolutionAction::InitiateRefund),
            "write_off" => Some(ResolutionAction::WriteOff),
            "contact_provider" => Some(ResolutionAction::ContactProvider),
            _ => None,
        }
    }

    /// Status the record lands in once the action is applied
    pub fn target_status(&self) -> ReconciliationStatus {
        match self {
            ResolutionAction::WriteOff => ReconciliationStatus::WrittenOff,
            _ => ReconciliationStatus::Resolved,
        }
    }
}

/// One line of a provider or bank statement
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExternalTransaction {
    #[serde(default)]
    pub payment_id: Option<Uuid>,
    pub external_transaction_id: String,
    pub amount: Decimal,
    pub currency: String,
    #[serde(default)]
    pub fee: Option<Decimal>,
    pub transaction_date: DateTime<Utc>,
    pub source_document: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuditAnnotation {
    pub author: String,
    pub note: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReconciliationRecord {
    pub id: Uuid,
    pub batch_id: Uuid,
    pub payment_id: Option<Uuid>,

    pub external_transaction_id: Option<String>,
    pub external_amount: Option<Decimal>,
    pub external_currency: Option<String>,
    pub external_fee: Option<Decimal>,
    pub transaction_date: DateTime<Utc>,
    pub source_document: Option<String>,

    pub recorded_amount: Option<Decimal>,
    /// external - recorded
    pub amount_difference: Option<Decimal>,
    pub fee_difference: Option<Decimal>,

    pub status: ReconciliationStatus,
    pub discrepancy_type: Option<DiscrepancyType>,

    pub resolution_action: Option<ResolutionAction>,
    pub resolved_by: Option<String>,
    pub resolution_notes: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,

    pub annotations: Vec<AuditAnnotation>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ReconciliationRecord {
    /// Record for a statement line, still PENDING until classified
    pub fn from_external(batch_id: Uuid, external: &ExternalTransaction, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            batch_id,
            payment_id: None,
            external_transaction_id: Some(external.external_transaction_id.clone()),
            external_amount: Some(external.amount),
            external_currency: Some(external.currency.to_uppercase()),
            external_fee: external.fee,
            transaction_date: external.transaction_date,
            source_document: Some(external.source_document.clone()),
            recorded_amount: None,
            amount_difference: None,
            fee_difference: None,
            status: ReconciliationStatus::Pending,
            discrepancy_type: None,
            resolution_action: None,
            resolved_by: None,
            resolution_notes: None,
            resolved_at: None,
            annotations: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Record for an in-system payment that no statement line covered
    pub fn missing_externally(
        batch_id: Uuid,
        payment_id: Uuid,
        recorded_amount: Decimal,
        confirmed_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            batch_id,
            payment_id: Some(payment_id),
            external_transaction_id: None,
            external_amount: None,
            external_currency: None,
            external_fee: None,
            transaction_date: confirmed_at,
            source_document: None,
            recorded_amount: Some(recorded_amount),
            amount_difference: None,
            fee_difference: None,
            status: ReconciliationStatus::Investigating,
            discrepancy_type: Some(DiscrepancyType::MissingExternally),
            resolution_action: None,
            resolved_by: None,
            resolution_notes: None,
            resolved_at: None,
            annotations: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Classify against the recorded payment amount and fee.
    pub fn classify_against(
        &mut self,
        payment_id: Uuid,
        recorded_amount: Decimal,
        recorded_currency: &str,
        recorded_fee: Decimal,
    ) {
        self.payment_id = Some(payment_id);
        self.recorded_amount = Some(recorded_amount);

        let external_amount = self.external_amount.unwrap_or(Decimal::ZERO);
        let difference = external_amount - recorded_amount;
        self.amount_difference = Some(difference);
        self.fee_difference = self.external_fee.map(|fee| fee - recorded_fee);

        let same_currency = self
            .external_currency
            .as_deref()
            .map(|c| c.eq_ignore_ascii_case(recorded_currency))
            .unwrap_or(false);

        if !same_currency {
            self.status = ReconciliationStatus::Mismatch;
            self.discrepancy_type = Some(DiscrepancyType::CurrencyMismatch);
        } else if difference.abs() < matching_tolerance() {
            self.status = ReconciliationStatus::Matched;
            self.discrepancy_type = None;
        } else {
            self.status = ReconciliationStatus::Mismatch;
            self.discrepancy_type = Some(DiscrepancyType::AmountMismatch);
        }
    }

    pub fn mark_unmatched(&mut self) {
        self.status = ReconciliationStatus::Investigating;
        self.discrepancy_type = Some(DiscrepancyType::Missing);
    }

    /// Close the discrepancy. Resolved records never change again.
    pub fn resolve(
        &mut self,
        action: ResolutionAction,
        resolver: &str,
        notes: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<(), InvalidTransition> {
        let target = action.target_status();
        if !self.status.can_transition_to(target) {
            return Err(InvalidTransition::new(self.status, target));
        }
        self.status = target;
        self.resolution_action = Some(action);
        self.resolved_by = Some(resolver.to_string());
        self.resolution_notes = notes;
        self.resolved_at = Some(at);
        self.updated_at = at;
        Ok(())
    }

    pub fn annotate(&mut self, author: &str, note: &str, at: DateTime<Utc>) {
        self.annotations.push(AuditAnnotation {
            author: author.to_string(),
            note: note.to_string(),
            created_at: at,
        });
        self.updated_at = at;
    }
}

/// Outcome of one reconciliation batch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationReport {
    pub batch_id: Uuid,
    pub total_records: usize,
    pub matched: usize,
    pub mismatched: usize,
    pub investigating: usize,
    pub missing_externally: usize,
    /// Sum of amount differences across mismatched records
    pub net_difference: Decimal,
    pub records: Vec<ReconciliationRecord>,
}

impl ReconciliationReport {
    pub fn from_records(batch_id: Uuid, total_records: usize, records: Vec<ReconciliationRecord>) -> Self {
        let count = |status: ReconciliationStatus| records.iter().filter(|r| r.status == status).count();
        let missing_externally = records
            .iter()
            .filter(|r| r.discrepancy_type == Some(DiscrepancyType::MissingExternally))
            .count();
        let net_difference = records
            .iter()
            .filter(|r| r.status == ReconciliationStatus::Mismatch)
            .filter_map(|r| r.amount_difference)
            .sum();

        let matched = count(ReconciliationStatus::Matched);
        let mismatched = count(ReconciliationStatus::Mismatch);
        let investigating = count(ReconciliationStatus::Investigating).saturating_sub(missing_externally);

        Self {
            batch_id,
            total_records,
            matched,
            mismatched,
            investigating,
            missing_externally,
            net_difference,
            records,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn statement_line(amount: Decimal) -> ExternalTransaction {
        ExternalTransaction {
            payment_id: None,
            external_transaction_id: "CARD-0a1b2c3d4e5f".to_string(),
            amount,
            currency: "NGN".to_string(),
            fee: Some(dec!(15.00)),
            transaction_date: Utc::now(),
            source_document: "statement-2026-10-18.csv".to_string(),
        }
    }

    #[test]
    fn test_classify_matched_within_tolerance() {
        let mut record = ReconciliationRecord::from_external(Uuid::new_v4(), &statement_line(dec!(1000.005)), Utc::now());
        record.classify_against(Uuid::new_v4(), dec!(1000.00), "NGN", dec!(15.00));

        assert_eq!(record.status, ReconciliationStatus::Matched);
        assert_eq!(record.discrepancy_type, None);
        assert_eq!(record.fee_difference, Some(dec!(0.00)));
    }

    #[test]
    fn test_classify_amount_mismatch_records_signed_difference() {
        let mut record = ReconciliationRecord::from_external(Uuid::new_v4(), &statement_line(dec!(995.00)), Utc::now());
        record.classify_against(Uuid::new_v4(), dec!(1000.00), "NGN", dec!(15.00));

        assert_eq!(record.status, ReconciliationStatus::Mismatch);
        assert_eq!(record.discrepancy_type, Some(DiscrepancyType::AmountMismatch));
        assert_eq!(record.amount_difference, Some(dec!(-5.00)));
    }

    #[test]
    fn test_classify_currency_mismatch() {
        let mut line = statement_line(dec!(1000.00));
        line.currency = "usd".to_string();
        let mut record = ReconciliationRecord::from_external(Uuid::new_v4(), &line, Utc::now());
        record.classify_against(Uuid::new_v4(), dec!(1000.00), "NGN", dec!(15.00));

        assert_eq!(record.status, ReconciliationStatus::Mismatch);
        assert_eq!(record.discrepancy_type, Some(DiscrepancyType::CurrencyMismatch));
    }

    #[test]
    fn test_resolve_only_from_open_discrepancy() {
        let mut record = ReconciliationRecord::from_external(Uuid::new_v4(), &statement_line(dec!(1000.00)), Utc::now());
        record.classify_against(Uuid::new_v4(), dec!(1000.00), "NGN", dec!(15.00));
        assert!(record
            .resolve(ResolutionAction::WriteOff, "auditor", None, Utc::now())
            .is_err());

        let mut record = ReconciliationRecord::from_external(Uuid::new_v4(), &statement_line(dec!(1.00)), Utc::now());
        record.mark_unmatched();
        record
            .resolve(ResolutionAction::ContactProvider, "auditor", Some("called bank".into()), Utc::now())
            .unwrap();
        assert_eq!(record.status, ReconciliationStatus::Resolved);

        let second = record.resolve(ResolutionAction::WriteOff, "auditor", None, Utc::now());
        assert!(second.is_err());
        assert_eq!(record.resolution_action, Some(ResolutionAction::ContactProvider));
    }

    #[test]
    fn test_annotations_allowed_after_resolution() {
        let mut record = ReconciliationRecord::from_external(Uuid::new_v4(), &statement_line(dec!(1.00)), Utc::now());
        record.mark_unmatched();
        record
            .resolve(ResolutionAction::WriteOff, "auditor", None, Utc::now())
            .unwrap();
        record.annotate("auditor", "approved by finance", Utc::now());

        assert_eq!(record.status, ReconciliationStatus::WrittenOff);
        assert_eq!(record.annotations.len(), 1);
    }

    #[test]
    fn test_report_counts() {
        let batch = Uuid::new_v4();
        let mut matched = ReconciliationRecord::from_external(batch, &statement_line(dec!(10.00)), Utc::now());
        matched.classify_against(Uuid::new_v4(), dec!(10.00), "NGN", dec!(15.00));
        let mut mismatch = ReconciliationRecord::from_external(batch, &statement_line(dec!(15.00)), Utc::now());
        mismatch.classify_against(Uuid::new_v4(), dec!(10.00), "NGN", dec!(15.00));
        let mut missing = ReconciliationRecord::from_external(batch, &statement_line(dec!(7.00)), Utc::now());
        missing.mark_unmatched();
        let missing_ext = ReconciliationRecord::missing_externally(batch, Uuid::new_v4(), dec!(20.00), Utc::now(), Utc::now());

        let report = ReconciliationReport::from_records(batch, 3, vec![matched, mismatch, missing, missing_ext]);
        assert_eq!(report.matched, 1);
        assert_eq!(report.mismatched, 1);
        assert_eq!(report.investigating, 1);
        assert_eq!(report.missing_externally, 1);
        assert_eq!(report.net_difference, dec!(5.00));
    }
}
