//! Shared fixtures for the integration tests: an in-memory gateway and a
//! scriptable provider.

#![allow(dead_code)]

use async_trait::async_trait;
use clinipay_gateway::api::AppState;
use clinipay_gateway::config::GatewayConfig;
use clinipay_gateway::database::memory::InMemoryStore;
use clinipay_gateway::database::Stores;
use clinipay_gateway::domain::{Payment, Provenance};
use clinipay_gateway::health::HealthChecker;
use clinipay_gateway::payments::error::{PaymentError, PaymentResult};
use clinipay_gateway::payments::provider::PaymentProvider;
use clinipay_gateway::payments::providers::ManualProvider;
use clinipay_gateway::payments::registry::ProviderRegistry;
use clinipay_gateway::payments::types::{
    ChannelType, FeeStructure, PaymentRequest, ProcessPaymentResponse, ProviderConfig,
    RefundResponse, SettlementState, VerificationResult, VerificationType, WebhookNotification,
    WebhookVerificationResult,
};
use clinipay_gateway::payments::providers::manual;
use clinipay_gateway::payments::utils::{check_webhook_signature, sign_hmac_sha256_hex};
use clinipay_gateway::services::payment_orchestrator::InitiatePaymentRequest;
use clinipay_gateway::services::verification::VerifyPaymentRequest;
use clinipay_gateway::services::risk::{RiskConfig, RiskService};
use clinipay_gateway::services::{
    FeeCalculationService, PaymentOrchestrator, ReconciliationService, RefundService,
    SideEffects, VerificationService,
};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const CARD: &str = "test_card";
pub const WEBHOOK_SECRET: &str = "whsec_test_secret";

/// How the fake provider answers `process_payment`
#[derive(Debug, Clone)]
pub enum Answer {
    Accept(SettlementState),
    Decline(String),
    Error,
    /// Never answers within the test timeout
    Hang,
}

/// Card-like provider whose answers are set by the test
pub struct FakeProvider {
    config: ProviderConfig,
    answer: Mutex<Answer>,
    status: Mutex<PaymentResult<Option<SettlementState>>>,
    process_calls: AtomicUsize,
}

impl FakeProvider {
    pub fn new(config: ProviderConfig) -> Self {
        Self {
            config,
            answer: Mutex::new(Answer::Accept(SettlementState::Pending)),
            status: Mutex::new(Ok(None)),
            process_calls: AtomicUsize::new(0),
        }
    }

    pub fn card() -> Self {
        Self::new(card_config())
    }

    pub fn answer_with(&self, answer: Answer) {
        *self.answer.lock().unwrap() = answer;
    }

    /// What `get_payment_status` reports from now on
    pub fn report_status(&self, status: PaymentResult<Option<SettlementState>>) {
        *self.status.lock().unwrap() = status;
    }

    pub fn process_calls(&self) -> usize {
        self.process_calls.load(Ordering::SeqCst)
    }
}

pub fn card_config() -> ProviderConfig {
    let mut config = ProviderConfig::new(CARD, ChannelType::BankCard, VerificationType::Hybrid);
    config.supported_currencies = vec!["NGN".to_string(), "USD".to_string()];
    config.supports_refunds = true;
    config.supports_partial_refunds = true;
    config.fees = FeeStructure {
        percentage: dec!(1.5),
        fixed: Decimal::ZERO,
        min_fee: Some(dec!(5)),
        max_fee: Some(dec!(500)),
    };
    config.expected_processing_secs = 60;
    config.max_processing_secs = 600;
    config.webhook_secret = Some(WEBHOOK_SECRET.to_string());
    config
}

#[async_trait]
impl PaymentProvider for FakeProvider {
    fn config(&self) -> &ProviderConfig {
        &self.config
    }

    async fn process_payment(
        &self,
        request: PaymentRequest,
    ) -> PaymentResult<ProcessPaymentResponse> {
        self.validate_request(&request)?;
        self.process_calls.fetch_add(1, Ordering::SeqCst);
        let answer = self.answer.lock().unwrap().clone();
        match answer {
            Answer::Accept(state) => Ok(ProcessPaymentResponse {
                accepted: true,
                external_transaction_id: Some(self.config.generate_transaction_id()),
                settlement_state: state,
                redirect_url: Some("https://checkout.test/pay".to_string()),
                qr_payload: None,
                requires_manual_verification: false,
                message: None,
                provider_data: None,
            }),
            Answer::Decline(reason) => Ok(ProcessPaymentResponse::declined(reason)),
            Answer::Error => Err(PaymentError::ProviderError {
                provider: self.config.name.clone(),
                message: "upstream returned 502".to_string(),
                provider_code: None,
                retryable: true,
            }),
            Answer::Hang => {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Err(PaymentError::NetworkError {
                    message: "unreachable".to_string(),
                })
            }
        }
    }

    async fn verify_payment(
        &self,
        _payment: &Payment,
        _code: Option<&str>,
    ) -> PaymentResult<VerificationResult> {
        Ok(VerificationResult {
            verified: true,
            message: None,
        })
    }

    async fn refund_payment(
        &self,
        _payment: &Payment,
        _amount: Decimal,
        _reason: &str,
    ) -> PaymentResult<RefundResponse> {
        Ok(RefundResponse {
            external_refund_id: Some(self.config.generate_transaction_id()),
            settlement_state: SettlementState::Processing,
        })
    }

    async fn get_payment_status(
        &self,
        _external_transaction_id: &str,
    ) -> PaymentResult<Option<SettlementState>> {
        self.status.lock().unwrap().clone()
    }

    fn verify_webhook(
        &self,
        payload: &[u8],
        signature: Option<&str>,
    ) -> PaymentResult<WebhookVerificationResult> {
        Ok(check_webhook_signature(
            &self.config.name,
            self.config.webhook_secret.as_deref(),
            payload,
            signature,
        ))
    }

    fn handle_webhook(&self, payload: &[u8]) -> PaymentResult<Option<WebhookNotification>> {
        let body: serde_json::Value = serde_json::from_slice(payload)
            .map_err(|e| PaymentError::validation(e.to_string(), "payload"))?;
        let (Some(id), Some(status)) = (body["transaction_id"].as_str(), body["status"].as_str())
        else {
            return Ok(None);
        };
        Ok(Some(WebhookNotification {
            external_transaction_id: id.to_string(),
            settlement_state: SettlementState::from_provider_status(status),
            failure_reason: body["reason"].as_str().map(str::to_string),
            raw: body.clone(),
            received_at: chrono::Utc::now(),
        }))
    }
}

/// Signed webhook body for the fake provider
pub fn webhook(transaction_id: &str, status: &str) -> (Vec<u8>, String) {
    let body = serde_json::to_vec(&json!({
        "transaction_id": transaction_id,
        "status": status,
    }))
    .unwrap();
    let signature = sign_hmac_sha256_hex(&body, WEBHOOK_SECRET);
    (body, signature)
}

pub fn gateway_config() -> GatewayConfig {
    GatewayConfig {
        provider_timeout: Duration::from_millis(200),
        ..GatewayConfig::default()
    }
}

/// Risk settings that never flag the time of day
pub fn quiet_risk() -> RiskConfig {
    RiskConfig {
        unusual_hours_start: 0,
        unusual_hours_end: 0,
        ..RiskConfig::default()
    }
}

pub struct Gateway {
    pub store: InMemoryStore,
    pub stores: Stores,
    pub registry: ProviderRegistry,
    pub card: Arc<FakeProvider>,
    pub orchestrator: PaymentOrchestrator,
    pub verification: VerificationService,
    pub refunds: RefundService,
    pub reconciliation: ReconciliationService,
    pub side_effects: SideEffects,
}

impl Gateway {
    /// Cash, cheque and the fake card provider over an empty in-memory store
    pub fn new() -> Self {
        Self::with_card(FakeProvider::card())
    }

    pub fn with_card(card: FakeProvider) -> Self {
        let card = Arc::new(card);
        let registry = ProviderRegistry::new()
            .with(Arc::new(ManualProvider::new(manual::cash_config()).unwrap()))
            .with(Arc::new(ManualProvider::new(manual::cheque_config()).unwrap()))
            .with(card.clone());

        let store = InMemoryStore::new();
        let stores = Stores::in_memory(store.clone());
        let config = gateway_config();
        let side_effects = SideEffects::default();

        let orchestrator = PaymentOrchestrator::new(
            registry.clone(),
            stores.clone(),
            FeeCalculationService::new(&config),
            RiskService::new(quiet_risk()),
            config.clone(),
            side_effects.clone(),
        );
        let verification =
            VerificationService::new(registry.clone(), stores.clone(), &config, side_effects.clone());
        let refunds =
            RefundService::new(registry.clone(), stores.clone(), &config, side_effects.clone());
        let reconciliation = ReconciliationService::new(registry.clone(), stores.clone());

        Self {
            store,
            stores,
            registry,
            card,
            orchestrator,
            verification,
            refunds,
            reconciliation,
            side_effects,
        }
    }

    /// Initiate on an open invoice and return the stored payment
    pub async fn pay(&self, invoice_id: &str, provider: &str, amount: Decimal) -> Payment {
        self.store.open_invoice(invoice_id).await;
        self.orchestrator
            .initiate(request(invoice_id, provider, amount), provenance())
            .await
            .expect("initiation should succeed")
            .payment
    }

    /// A cash payment taken all the way to CONFIRMED
    pub async fn confirmed_cash_payment(&self, invoice_id: &str, amount: Decimal) -> Payment {
        let payment = self.pay(invoice_id, manual::CASH, amount).await;
        self.verification
            .verify(payment.id, approve(), "cashier-1")
            .await
            .expect("verification should succeed")
    }

    /// HTTP state over the same services and store
    pub fn app_state(&self) -> AppState {
        AppState {
            orchestrator: Arc::new(self.orchestrator.clone()),
            verification: Arc::new(self.verification.clone()),
            reconciliation: Arc::new(self.reconciliation.clone()),
            refunds: Arc::new(self.refunds.clone()),
            health_checker: HealthChecker::new(self.registry.list_available_providers()),
        }
    }

    pub async fn reload(&self, payment: &Payment) -> Payment {
        self.orchestrator.get(payment.id).await.unwrap()
    }
}

pub fn request(invoice_id: &str, provider: &str, amount: Decimal) -> InitiatePaymentRequest {
    InitiatePaymentRequest {
        invoice_id: invoice_id.to_string(),
        patient_id: "PAT-1001".to_string(),
        facility_id: "FAC-LAGOS-01".to_string(),
        provider: provider.to_string(),
        amount,
        currency: None,
        phone_number: Some("+2348031234567".to_string()),
        details: None,
        metadata: None,
    }
}

pub fn provenance() -> Provenance {
    Provenance {
        created_by: "front-desk".to_string(),
        client_ip: Some("10.0.0.7".to_string()),
        user_agent: Some("integration-tests".to_string()),
        device_fingerprint: None,
    }
}

pub fn approve() -> VerifyPaymentRequest {
    VerifyPaymentRequest {
        approved: true,
        ..Default::default()
    }
}
