//! Services module for the payment workflows

pub(crate) mod confirmation;
pub mod error;
pub mod events;
pub mod fee_calculation;
pub mod notification;
pub mod payment_orchestrator;
pub mod reconciliation;
pub mod refunds;
pub mod risk;
pub mod verification;

pub use error::{GatewayError, GatewayResult};
pub use events::{EventPublisher, PaymentEventType, SideEffects};
pub use fee_calculation::FeeCalculationService;
pub use notification::Notifier;
pub use payment_orchestrator::{
    InitiatePaymentRequest, InitiatedPayment, PaymentOrchestrator, WebhookOutcome,
};
pub use reconciliation::ReconciliationService;
pub use refunds::RefundService;
pub use risk::RiskService;
pub use verification::VerificationService;
