//! Core entities and their lifecycle rules. No I/O lives here.

pub mod payment;
pub mod reconciliation;
pub mod refund;

pub use payment::{
    EvidenceAttachment, InvalidTransition, NewPayment, Payment, PaymentStatus, Provenance,
    StatusUpdate, VerificationMethod, VerificationStamp,
};
pub use reconciliation::{
    AuditAnnotation, DiscrepancyType, ExternalTransaction, ReconciliationRecord,
    ReconciliationReport, ReconciliationStatus, ResolutionAction,
};
pub use refund::{Refund, RefundStatus, RefundUpdate};
