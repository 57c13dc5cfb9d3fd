//! Payment entity and its lifecycle state machine.
//!
//! A payment is created once by the orchestrator and afterwards only ever
//! moves along the edges returned by [`PaymentStatus::valid_transitions`].
//! [`Payment::apply_transition`] is the single place that enforces those edges
//! and stamps the lifecycle milestones.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Payment lifecycle state
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    /// Record created, provider not yet answered
    Pending,
    /// Provider accepted the attempt, settlement is asynchronous
    Processing,
    /// Provider needs proof of payment before settlement
    AwaitingVerification,
    /// Reserved lifecycle label; no edge leads here
    Verified,
    /// Settled and linked invoice marked paid
    Confirmed,
    Rejected,
    Failed,
    Cancelled,
    Refunded,
    PartiallyRefunded,
}

impl PaymentStatus {
    pub const ALL: [PaymentStatus; 10] = [
        PaymentStatus::Pending,
        PaymentStatus::Processing,
        PaymentStatus::AwaitingVerification,
        PaymentStatus::Verified,
        PaymentStatus::Confirmed,
        PaymentStatus::Rejected,
        PaymentStatus::Failed,
        PaymentStatus::Cancelled,
        PaymentStatus::Refunded,
        PaymentStatus::PartiallyRefunded,
    ];

    /// Get all valid transitions from this state
    pub fn valid_transitions(&self) -> &'static [PaymentStatus] {
        match self {
            PaymentStatus::Pending => &[
                PaymentStatus::Processing,
                PaymentStatus::AwaitingVerification,
                PaymentStatus::Failed,
                PaymentStatus::Cancelled,
            ],
            PaymentStatus::Processing => &[
                PaymentStatus::Confirmed,
                PaymentStatus::Failed,
                PaymentStatus::Cancelled,
            ],
            PaymentStatus::AwaitingVerification => {
                &[PaymentStatus::Confirmed, PaymentStatus::Rejected]
            }
            PaymentStatus::Confirmed => &[
                PaymentStatus::Refunded,
                PaymentStatus::PartiallyRefunded,
            ],
            PaymentStatus::PartiallyRefunded => &[PaymentStatus::Refunded],
            PaymentStatus::Verified
            | PaymentStatus::Rejected
            | PaymentStatus::Failed
            | PaymentStatus::Cancelled
            | PaymentStatus::Refunded => &[],
        }
    }

    pub fn can_transition_to(&self, target: PaymentStatus) -> bool {
        self.valid_transitions().contains(&target)
    }

    /// Check if this is a terminal state
    pub fn is_terminal(&self) -> bool {
        self.valid_transitions().is_empty()
    }

    /// Payments that have not settled yet
    pub fn is_unsettled(&self) -> bool {
        matches!(
            self,
            PaymentStatus::Pending | PaymentStatus::Processing | PaymentStatus::AwaitingVerification
        )
    }

    /// Whether the payment counts towards a provider's daily volume
    pub fn counts_towards_volume(&self) -> bool {
        !matches!(
            self,
            PaymentStatus::Failed | PaymentStatus::Cancelled | PaymentStatus::Rejected
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "PENDING",
            PaymentStatus::Processing => "PROCESSING",
            PaymentStatus::AwaitingVerification => "AWAITING_VERIFICATION",
            PaymentStatus::Verified => "VERIFIED",
            PaymentStatus::Confirmed => "CONFIRMED",
            PaymentStatus::Rejected => "REJECTED",
            PaymentStatus::Failed => "FAILED",
            PaymentStatus::Cancelled => "CANCELLED",
            PaymentStatus::Refunded => "REFUNDED",
            PaymentStatus::PartiallyRefunded => "PARTIALLY_REFUNDED",
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentStatus {
    type Err = UnknownStatus;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_uppercase();
        PaymentStatus::ALL
            .iter()
            .copied()
            .find(|s| s.as_str() == normalized)
            .ok_or_else(|| UnknownStatus(value.to_string()))
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown status: {0}")]
pub struct UnknownStatus(pub String);

/// Raised when a lifecycle edge is not in the transition table
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid state transition from {from} to {to}")]
pub struct InvalidTransition {
    pub from: String,
    pub to: String,
}

impl InvalidTransition {
    pub fn new(from: impl fmt::Display, to: impl fmt::Display) -> Self {
        Self {
            from: from.to_string(),
            to: to.to_string(),
        }
    }
}

/// How a payment was confirmed or rejected
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VerificationMethod {
    Manual,
    Automatic,
    Webhook,
    Bulk,
}

impl VerificationMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerificationMethod::Manual => "manual",
            VerificationMethod::Automatic => "automatic",
            VerificationMethod::Webhook => "webhook",
            VerificationMethod::Bulk => "bulk",
        }
    }
}

impl FromStr for VerificationMethod {
    type Err = UnknownStatus;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "manual" => Ok(VerificationMethod::Manual),
            "automatic" | "api" => Ok(VerificationMethod::Automatic),
            "webhook" => Ok(VerificationMethod::Webhook),
            "bulk" => Ok(VerificationMethod::Bulk),
            _ => Err(UnknownStatus(value.to_string())),
        }
    }
}

/// Proof of payment attached during verification (receipt scan, bank slip, ...)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EvidenceAttachment {
    pub file_name: String,
    pub url: String,
    pub content_type: Option<String>,
    pub uploaded_at: DateTime<Utc>,
}

/// Verification metadata stamped alongside a CONFIRMED/REJECTED transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationStamp {
    pub method: VerificationMethod,
    pub verified_by: String,
    pub notes: Option<String>,
    pub evidence: Vec<EvidenceAttachment>,
}

/// Fields written together with a status change
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusUpdate {
    pub external_transaction_id: Option<String>,
    pub failure_reason: Option<String>,
    pub cancellation_reason: Option<String>,
    pub verification: Option<VerificationStamp>,
}

impl StatusUpdate {
    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            failure_reason: Some(reason.into()),
            ..Default::default()
        }
    }

    pub fn verified(stamp: VerificationStamp) -> Self {
        Self {
            verification: Some(stamp),
            ..Default::default()
        }
    }
}

/// Request provenance captured at initiation
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Provenance {
    pub created_by: String,
    pub client_ip: Option<String>,
    pub user_agent: Option<String>,
    pub device_fingerprint: Option<String>,
}

/// The transactional payment record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Payment {
    pub id: Uuid,
    pub merchant_reference: String,
    pub external_transaction_id: Option<String>,

    pub invoice_id: String,
    pub patient_id: String,
    pub facility_id: String,
    pub provider: String,

    pub amount: Decimal,
    pub currency: String,
    pub fx_rate: Decimal,
    pub amount_in_settlement_currency: Decimal,
    pub provider_fee: Decimal,
    pub platform_fee: Decimal,
    pub total_fees: Decimal,
    pub net_amount: Decimal,

    pub status: PaymentStatus,

    pub verification_method: Option<VerificationMethod>,
    pub verified_by: Option<String>,
    pub verified_at: Option<DateTime<Utc>>,
    pub verification_notes: Option<String>,
    pub evidence: Vec<EvidenceAttachment>,

    pub risk_score: u8,
    pub fraud_flags: Vec<String>,
    pub is_suspicious: bool,

    pub initiated_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    pub cancellation_reason: Option<String>,

    pub provenance: Provenance,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Everything the orchestrator knows before the provider is called
#[derive(Debug, Clone)]
pub struct NewPayment {
    pub merchant_reference: String,
    pub invoice_id: String,
    pub patient_id: String,
    pub facility_id: String,
    pub provider: String,
    pub amount: Decimal,
    pub currency: String,
    pub fx_rate: Decimal,
    pub amount_in_settlement_currency: Decimal,
    pub provider_fee: Decimal,
    pub platform_fee: Decimal,
    pub risk_score: u8,
    pub fraud_flags: Vec<String>,
    pub is_suspicious: bool,
    pub provenance: Provenance,
    pub metadata: serde_json::Value,
}

impl Payment {
    pub fn new(new: NewPayment, now: DateTime<Utc>) -> Self {
        let total_fees = new.provider_fee + new.platform_fee;
        Self {
            id: Uuid::new_v4(),
            merchant_reference: new.merchant_reference,
            external_transaction_id: None,
            invoice_id: new.invoice_id,
            patient_id: new.patient_id,
            facility_id: new.facility_id,
            provider: new.provider,
            amount: new.amount,
            currency: new.currency,
            fx_rate: new.fx_rate,
            amount_in_settlement_currency: new.amount_in_settlement_currency,
            provider_fee: new.provider_fee,
            platform_fee: new.platform_fee,
            total_fees,
            net_amount: new.amount - total_fees,
            status: PaymentStatus::Pending,
            verification_method: None,
            verified_by: None,
            verified_at: None,
            verification_notes: None,
            evidence: Vec::new(),
            risk_score: new.risk_score.min(100),
            fraud_flags: new.fraud_flags,
            is_suspicious: new.is_suspicious,
            initiated_at: now,
            processed_at: None,
            confirmed_at: None,
            failed_at: None,
            cancelled_at: None,
            failure_reason: None,
            cancellation_reason: None,
            provenance: new.provenance,
            metadata: new.metadata,
            created_at: now,
            updated_at: now,
        }
    }

    /// `net_amount == amount - provider_fee - platform_fee`
    pub fn is_net_amount_consistent(&self) -> bool {
        self.total_fees == self.provider_fee + self.platform_fee
            && self.net_amount == self.amount - self.provider_fee - self.platform_fee
    }

    /// Move to `target`, stamping the milestone that belongs to it.
    ///
    /// Leaves `self` untouched when the edge is not legal.
    pub fn apply_transition(
        &mut self,
        target: PaymentStatus,
        update: &StatusUpdate,
        at: DateTime<Utc>,
    ) -> Result<(), InvalidTransition> {
        if !self.status.can_transition_to(target) {
            return Err(InvalidTransition::new(self.status, target));
        }

        if let Some(external_id) = &update.external_transaction_id {
            if self.external_transaction_id.is_none() {
                self.external_transaction_id = Some(external_id.clone());
            }
        }

        match target {
            PaymentStatus::Processing | PaymentStatus::AwaitingVerification => {
                self.processed_at.get_or_insert(at);
            }
            PaymentStatus::Confirmed => {
                self.confirmed_at.get_or_insert(at);
            }
            PaymentStatus::Failed | PaymentStatus::Rejected => {
                self.failed_at = Some(at);
                if update.failure_reason.is_some() {
                    self.failure_reason = update.failure_reason.clone();
                }
            }
            PaymentStatus::Cancelled => {
                self.cancelled_at = Some(at);
                self.cancellation_reason = update.cancellation_reason.clone();
            }
            _ => {}
        }

        if let Some(stamp) = &update.verification {
            self.verification_method = Some(stamp.method);
            self.verified_by = Some(stamp.verified_by.clone());
            self.verified_at = Some(at);
            if stamp.notes.is_some() {
                self.verification_notes = stamp.notes.clone();
            }
            self.evidence.extend(stamp.evidence.iter().cloned());
        }

        self.status = target;
        self.updated_at = at;
        Ok(())
    }

    /// Replace the recorded amount, keeping fees and the net invariant intact.
    pub fn adjust_amount(&mut self, amount: Decimal, at: DateTime<Utc>) {
        self.amount = amount;
        self.amount_in_settlement_currency = amount * self.fx_rate;
        self.net_amount = self.amount - self.provider_fee - self.platform_fee;
        self.updated_at = at;
    }

    /// Keep the provider's latest settlement report under `metadata.provider_report`
    /// for whoever verifies the payment.
    pub fn record_provider_report(&mut self, report: serde_json::Value, at: DateTime<Utc>) {
        if !self.metadata.is_object() {
            self.metadata = serde_json::json!({});
        }
        if let Some(map) = self.metadata.as_object_mut() {
            map.insert("provider_report".to_string(), report);
        }
        self.updated_at = at;
    }
}
