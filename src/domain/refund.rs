use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::payment::InvalidTransition;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RefundStatus {
    Requested,
    Approved,
    Processed,
    Completed,
    Rejected,
    Failed,
}

impl RefundStatus {
    pub fn valid_transitions(&self) -> &'static [RefundStatus] {
        match self {
            RefundStatus::Requested => &[RefundStatus::Approved, RefundStatus::Rejected],
            RefundStatus::Approved => &[RefundStatus::Processed, RefundStatus::Failed],
            RefundStatus::Processed => &[RefundStatus::Completed, RefundStatus::Failed],
            RefundStatus::Completed | RefundStatus::Rejected | RefundStatus::Failed => &[],
        }
    }

    pub fn can_transition_to(&self, target: RefundStatus) -> bool {
        self.valid_transitions().contains(&target)
    }

    /// Refunds that still reserve part of the payment amount
    pub fn reserves_amount(&self) -> bool {
        !matches!(self, RefundStatus::Rejected | RefundStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RefundStatus::Requested => "REQUESTED",
            RefundStatus::Approved => "APPROVED",
            RefundStatus::Processed => "PROCESSED",
            RefundStatus::Completed => "COMPLETED",
            RefundStatus::Rejected => "REJECTED",
            RefundStatus::Failed => "FAILED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "REQUESTED" => Some(RefundStatus::Requested),
            "APPROVED" => Some(RefundStatus::Approved),
            "PROCESSED" => Some(RefundStatus::Processed),
            "COMPLETED" => Some(RefundStatus::Completed),
            "REJECTED" => Some(RefundStatus::Rejected),
            "FAILED" => Some(RefundStatus::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for RefundStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Refund {
    pub id: Uuid,
    pub payment_id: Uuid,
    /// Set when a reconciliation resolution spawned the refund; unique
    pub reconciliation_id: Option<Uuid>,
    pub amount: Decimal,
    pub currency: String,
    pub reason: String,
    pub status: RefundStatus,
    pub external_refund_id: Option<String>,
    pub failure_reason: Option<String>,

    pub requested_by: String,
    pub requested_at: DateTime<Utc>,
    pub approved_by: Option<String>,
    pub approved_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Fields written together with a refund status change
#[derive(Debug, Clone, Default)]
pub struct RefundUpdate {
    pub actor: Option<String>,
    pub external_refund_id: Option<String>,
    pub failure_reason: Option<String>,
}

impl Refund {
    pub fn request(
        payment_id: Uuid,
        amount: Decimal,
        currency: &str,
        reason: &str,
        requested_by: &str,
        reconciliation_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            payment_id,
            reconciliation_id,
            amount,
            currency: currency.to_string(),
            reason: reason.to_string(),
            status: RefundStatus::Requested,
            external_refund_id: None,
            failure_reason: None,
            requested_by: requested_by.to_string(),
            requested_at: now,
            approved_by: None,
            approved_at: None,
            processed_at: None,
            completed_at: None,
            updated_at: now,
        }
    }

    pub fn apply_transition(
        &mut self,
        target: RefundStatus,
        update: &RefundUpdate,
        at: DateTime<Utc>,
    ) -> Result<(), InvalidTransition> {
        if !self.status.can_transition_to(target) {
            return Err(InvalidTransition::new(self.status, target));
        }

        match target {
            RefundStatus::Approved | RefundStatus::Rejected => {
                self.approved_by = update.actor.clone();
                self.approved_at = Some(at);
            }
            RefundStatus::Processed => {
                self.processed_at = Some(at);
                if update.external_refund_id.is_some() {
                    self.external_refund_id = update.external_refund_id.clone();
                }
            }
            RefundStatus::Completed => self.completed_at = Some(at),
            _ => {}
        }
        if update.failure_reason.is_some() {
            self.failure_reason = update.failure_reason.clone();
        }

        self.status = target;
        self.updated_at = at;
        Ok(())
    }
}

/// Amount of `payment_amount` not yet reserved by other refunds
pub fn refundable_balance(payment_amount: Decimal, refunds: &[Refund]) -> Decimal {
    (payment_amount - reserved_total(refunds)).max(Decimal::ZERO)
}

/// Sum of refunds that are completed or still in flight
pub fn reserved_total(refunds: &[Refund]) -> Decimal {
    refunds
        .iter()
        .filter(|r| r.status.reserves_amount())
        .map(|r| r.amount)
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn refund(amount: Decimal, status: RefundStatus) -> Refund {
        let mut r = Refund::request(Uuid::new_v4(), amount, "NGN", "overcharge", "cashier", None, Utc::now());
        r.status = status;
        r
    }

    #[test]
    fn test_refund_lifecycle() {
        let mut r = refund(dec!(100), RefundStatus::Requested);
        let approve = RefundUpdate {
            actor: Some("finance-lead".to_string()),
            ..Default::default()
        };
        r.apply_transition(RefundStatus::Approved, &approve, Utc::now()).unwrap();
        r.apply_transition(RefundStatus::Processed, &RefundUpdate::default(), Utc::now()).unwrap();
        r.apply_transition(RefundStatus::Completed, &RefundUpdate::default(), Utc::now()).unwrap();

        assert_eq!(r.status, RefundStatus::Completed);
        assert_eq!(r.approved_by.as_deref(), Some("finance-lead"));
        assert!(r.completed_at.is_some());
    }

    #[test]
    fn test_cannot_skip_approval() {
        let mut r = refund(dec!(100), RefundStatus::Requested);
        let err = r
            .apply_transition(RefundStatus::Processed, &RefundUpdate::default(), Utc::now())
            .unwrap_err();
        assert_eq!(err.from, "REQUESTED");
        assert_eq!(r.status, RefundStatus::Requested);
    }

    #[test]
    fn test_refundable_balance_ignores_rejected_and_failed() {
        let refunds = vec![
            refund(dec!(300), RefundStatus::Completed),
            refund(dec!(200), RefundStatus::Requested),
            refund(dec!(400), RefundStatus::Rejected),
            refund(dec!(400), RefundStatus::Failed),
        ];
        assert_eq!(refundable_balance(dec!(1000), &refunds), dec!(500));
    }
}
