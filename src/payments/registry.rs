use crate::payments::error::{PaymentError, PaymentResult};
use crate::payments::provider::PaymentProvider;
use crate::payments::providers::{
    bank_transfer, card_gateway, manual, mobile_wallet, BankTransferProvider, CardGatewayProvider,
    ManualProvider, MobileWalletProvider,
};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

const DEFAULT_ENABLED: &str = "card_gateway,mobile_wallet,bank_transfer,local_bank,cash,cheque";

/// Adapters keyed by provider name. Built once at startup and shared.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn PaymentProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provider: Arc<dyn PaymentProvider>) -> &mut Self {
        self.providers
            .insert(provider.name().to_lowercase(), provider);
        self
    }

    pub fn with(mut self, provider: Arc<dyn PaymentProvider>) -> Self {
        self.register(provider);
        self
    }

    pub fn get(&self, name: &str) -> PaymentResult<Arc<dyn PaymentProvider>> {
        self.providers
            .get(&name.trim().to_lowercase())
            .cloned()
            .ok_or_else(|| PaymentError::ValidationError {
                message: format!("unknown or disabled provider: {}", name),
                field: Some("provider".to_string()),
            })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.providers.contains_key(&name.trim().to_lowercase())
    }

    pub fn list_available_providers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn PaymentProvider>> {
        self.providers.values()
    }

    /// Builds the adapters listed in `ENABLED_PAYMENT_PROVIDERS`
    pub fn from_env() -> PaymentResult<Self> {
        let enabled_raw = std::env::var("ENABLED_PAYMENT_PROVIDERS")
            .unwrap_or_else(|_| DEFAULT_ENABLED.to_string());

        let mut registry = Self::new();
        for part in enabled_raw.split(',') {
            let name = part.trim().to_lowercase();
            if name.is_empty() {
                continue;
            }
            let provider: Arc<dyn PaymentProvider> = match name.as_str() {
                card_gateway::CARD_GATEWAY => Arc::new(CardGatewayProvider::from_env()?),
                mobile_wallet::MOBILE_WALLET => Arc::new(MobileWalletProvider::from_env()?),
                bank_transfer::BANK_TRANSFER => Arc::new(BankTransferProvider::from_env()?),
                bank_transfer::LOCAL_BANK => Arc::new(BankTransferProvider::local_bank_from_env()?),
                manual::CASH => Arc::new(ManualProvider::cash()?),
                manual::CHEQUE => Arc::new(ManualProvider::cheque()?),
                other => {
                    return Err(PaymentError::ValidationError {
                        message: format!("unsupported provider: {}", other),
                        field: Some("ENABLED_PAYMENT_PROVIDERS".to_string()),
                    })
                }
            };
            registry.register(provider);
        }

        info!(
            providers = ?registry.list_available_providers(),
            "payment providers registered"
        );
        Ok(registry)
    }
}
