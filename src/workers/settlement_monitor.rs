//! Settlement monitor worker
//!
//! Payments on API-capable channels can sit in PROCESSING when a webhook
//! never arrives. Each cycle the worker polls the provider for payments past
//! the provider's expected latency and fails the ones past its maximum.

use crate::config::ConfigError;
use crate::database::repository::Stores;
use crate::domain::{Payment, PaymentStatus, StatusUpdate};
use crate::payments::registry::ProviderRegistry;
use crate::services::error::GatewayError;
use crate::services::events::{PaymentEventType, SideEffects};
use crate::services::verification::VerificationService;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Custom error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("database error: {0}")]
    Database(#[from] crate::database::error::DatabaseError),

    #[error("gateway error: {0}")]
    Gateway(#[from] GatewayError),
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SettlementMonitorConfig {
    pub enabled: bool,
    /// How often the worker wakes up
    pub poll_interval: Duration,
    /// Maximum number of payments looked at per cycle
    pub batch_size: usize,
}

impl Default for SettlementMonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval: Duration::from_secs(60),
            batch_size: 100,
        }
    }
}

impl SettlementMonitorConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            enabled: std::env::var("SETTLEMENT_MONITOR_ENABLED")
                .map(|v| v.trim().eq_ignore_ascii_case("true"))
                .unwrap_or(defaults.enabled),
            poll_interval: match std::env::var("SETTLEMENT_MONITOR_INTERVAL_SECS") {
                Ok(raw) => Duration::from_secs(raw.trim().parse().map_err(|_| {
                    ConfigError::InvalidValue("SETTLEMENT_MONITOR_INTERVAL_SECS".to_string())
                })?),
                Err(_) => defaults.poll_interval,
            },
            batch_size: match std::env::var("SETTLEMENT_MONITOR_BATCH_SIZE") {
                Ok(raw) => raw.trim().parse().map_err(|_| {
                    ConfigError::InvalidValue("SETTLEMENT_MONITOR_BATCH_SIZE".to_string())
                })?,
                Err(_) => defaults.batch_size,
            },
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.enabled && self.poll_interval.is_zero() {
            return Err(ConfigError::InvalidValue(
                "SETTLEMENT_MONITOR_INTERVAL_SECS".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::InvalidValue(
                "SETTLEMENT_MONITOR_BATCH_SIZE".to_string(),
            ));
        }
        Ok(())
    }
}

/// What a cycle did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleSummary {
    pub examined: usize,
    pub polled: usize,
    pub confirmed: usize,
    pub failed: usize,
    pub expired: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Wait,
    Poll,
    Expire,
}

fn action_for(age: Duration, expected: Duration, max: Duration) -> Action {
    if age >= max {
        Action::Expire
    } else if age >= expected {
        Action::Poll
    } else {
        Action::Wait
    }
}

fn age_of(payment: &Payment, now: DateTime<Utc>) -> Duration {
    let since = payment.processed_at.unwrap_or(payment.initiated_at);
    now.signed_duration_since(since).to_std().unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

pub struct SettlementMonitorWorker {
    registry: ProviderRegistry,
    stores: Stores,
    verification: VerificationService,
    side_effects: SideEffects,
    config: SettlementMonitorConfig,
}

impl SettlementMonitorWorker {
    pub fn new(
        registry: ProviderRegistry,
        stores: Stores,
        verification: VerificationService,
        side_effects: SideEffects,
        config: SettlementMonitorConfig,
    ) -> Self {
        Self {
            registry,
            stores,
            verification,
            side_effects,
            config,
        }
    }

    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            batch_size = self.config.batch_size,
            "settlement monitor worker started"
        );

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("settlement monitor worker stopping");
                        break;
                    }
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {
                    match self.run_cycle().await {
                        Ok(summary) if summary.examined > 0 => info!(
                            examined = summary.examined,
                            polled = summary.polled,
                            confirmed = summary.confirmed,
                            failed = summary.failed,
                            expired = summary.expired,
                            "settlement monitor cycle finished"
                        ),
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "settlement monitor cycle failed"),
                    }
                }
            }
        }

        info!("settlement monitor worker stopped");
    }

    /// One pass over the PROCESSING payments of pollable providers
    pub async fn run_cycle(&self) -> Result<CycleSummary, MonitorError> {
        let providers: Vec<String> = self
            .registry
            .iter()
            .filter(|p| p.config().verification_type.supports_polling())
            .map(|p| p.name().to_string())
            .collect();
        if providers.is_empty() {
            return Ok(CycleSummary::default());
        }

        let mut pending = self
            .stores
            .payments
            .find_processing_for_providers(&providers)
            .await?;
        pending.truncate(self.config.batch_size);

        let now = Utc::now();
        let mut summary = CycleSummary {
            examined: pending.len(),
            ..Default::default()
        };

        for payment in pending {
            let config = self
                .registry
                .get(&payment.provider)
                .map_err(GatewayError::from)?
                .config()
                .clone();
            let action = action_for(
                age_of(&payment, now),
                Duration::from_secs(config.expected_processing_secs),
                Duration::from_secs(config.max_processing_secs),
            );

            match action {
                Action::Wait => {}
                Action::Expire => {
                    if self.expire(&payment).await? {
                        summary.expired += 1;
                    }
                }
                Action::Poll => {
                    let external_id = match payment.external_transaction_id.as_deref() {
                        Some(id) => id,
                        None => {
                            debug!(payment_id = %payment.id, "no provider transaction id to poll");
                            continue;
                        }
                    };
                    summary.polled += 1;
                    match self.verification.auto_verify(external_id).await {
                        Ok(updated) if updated.status == PaymentStatus::Confirmed => {
                            summary.confirmed += 1
                        }
                        Ok(updated)
                            if matches!(
                                updated.status,
                                PaymentStatus::Failed | PaymentStatus::Rejected
                            ) =>
                        {
                            summary.failed += 1
                        }
                        Ok(_) => {}
                        // Racing webhook already moved it
                        Err(GatewayError::InvalidStateTransition { .. }) => {}
                        Err(GatewayError::Database(e)) => return Err(e.into()),
                        Err(e) => warn!(
                            payment_id = %payment.id,
                            provider = %payment.provider,
                            error = %e,
                            "status poll failed"
                        ),
                    }
                }
            }
        }

        Ok(summary)
    }

    /// Returns `false` when another writer moved the payment first
    async fn expire(&self, payment: &Payment) -> Result<bool, MonitorError> {
        let result = self
            .stores
            .payments
            .transition_status(
                payment.id,
                PaymentStatus::Processing,
                PaymentStatus::Failed,
                &StatusUpdate::failed("settlement not confirmed within the provider's window"),
                Utc::now(),
            )
            .await
            .map_err(GatewayError::from);

        match result {
            Ok(failed) => {
                warn!(
                    payment_id = %failed.id,
                    provider = %failed.provider,
                    from_state = %payment.status,
                    to_state = %failed.status,
                    "payment expired while processing"
                );
                self.side_effects.emit(PaymentEventType::PaymentFailed, &failed);
                Ok(true)
            }
            Err(GatewayError::InvalidStateTransition { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_thresholds() {
        let expected = Duration::from_secs(300);
        let max = Duration::from_secs(3600);

        assert_eq!(action_for(Duration::from_secs(10), expected, max), Action::Wait);
        assert_eq!(action_for(Duration::from_secs(300), expected, max), Action::Poll);
        assert_eq!(action_for(Duration::from_secs(3599), expected, max), Action::Poll);
        assert_eq!(action_for(Duration::from_secs(3600), expected, max), Action::Expire);
    }

    #[test]
    fn test_config_rejects_zero_batch() {
        let config = SettlementMonitorConfig {
            batch_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        assert!(SettlementMonitorConfig::default().validate().is_ok());
    }
}
