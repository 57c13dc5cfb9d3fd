use crate::config::GatewayConfig;
use crate::payments::types::{FeeStructure, ProviderConfig};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Currencies without a minor unit
const ZERO_DECIMAL_CURRENCIES: &[&str] = &["UGX", "RWF", "XOF", "XAF", "JPY", "KRW"];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FeeBreakdown {
    pub amount: Decimal,
    pub currency: String,
    pub provider: ProviderFee,
    pub platform: PlatformFee,
    pub total: Decimal,
    pub net_amount: Decimal,
    /// total / amount * 100
    pub effective_rate: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProviderFee {
    pub name: String,
    pub percent: Decimal,
    pub fixed: Decimal,
    pub min_fee: Option<Decimal>,
    pub max_fee: Option<Decimal>,
    pub calculated: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlatformFee {
    pub percent: Decimal,
    pub calculated: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SettlementConversion {
    pub rate: Decimal,
    pub settlement_currency: String,
    pub amount: Decimal,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FeeError {
    #[error("no FX rate configured for {from} -> {to}")]
    MissingFxRate { from: String, to: String },
}

/// Number of decimal places money is kept at in `currency`
pub fn minor_unit_scale(currency: &str) -> u32 {
    if ZERO_DECIMAL_CURRENCIES
        .iter()
        .any(|c| c.eq_ignore_ascii_case(currency))
    {
        0
    } else {
        2
    }
}

/// Half-away-from-zero rounding to the currency's minor unit
pub fn round_money(value: Decimal, currency: &str) -> Decimal {
    value.round_dp_with_strategy(
        minor_unit_scale(currency),
        RoundingStrategy::MidpointAwayFromZero,
    )
}

/// `amount * pct / 100 + fixed`, clamped to `[min_fee, max_fee]`, then rounded
pub fn calculate_provider_fee(amount: Decimal, currency: &str, fees: &FeeStructure) -> Decimal {
    let mut fee = amount * fees.percentage / Decimal::ONE_HUNDRED + fees.fixed;
    if let Some(min) = fees.min_fee {
        fee = fee.max(min);
    }
    if let Some(max) = fees.max_fee {
        fee = fee.min(max);
    }
    round_money(fee, currency)
}

/// Pure fee and FX arithmetic over static configuration
#[derive(Debug, Clone)]
pub struct FeeCalculationService {
    platform_fee_percent: Decimal,
    settlement_currency: String,
    fx_rates: HashMap<String, Decimal>,
}

impl FeeCalculationService {
    pub fn new(config: &GatewayConfig) -> Self {
        Self {
            platform_fee_percent: config.platform_fee_percent,
            settlement_currency: config.settlement_currency.to_uppercase(),
            fx_rates: config.fx_rates.clone(),
        }
    }

    pub fn platform_fee(&self, amount: Decimal, currency: &str) -> Decimal {
        round_money(
            amount * self.platform_fee_percent / Decimal::ONE_HUNDRED,
            currency,
        )
    }

    pub fn calculate_fees(
        &self,
        amount: Decimal,
        currency: &str,
        provider: &ProviderConfig,
    ) -> FeeBreakdown {
        let provider_fee = calculate_provider_fee(amount, currency, &provider.fees);
        let platform_fee = self.platform_fee(amount, currency);
        let total = provider_fee + platform_fee;
        let effective_rate = if amount > Decimal::ZERO {
            (total / amount * Decimal::ONE_HUNDRED).round_dp(4)
        } else {
            Decimal::ZERO
        };

        FeeBreakdown {
            amount,
            currency: currency.to_uppercase(),
            provider: ProviderFee {
                name: provider.name.clone(),
                percent: provider.fees.percentage,
                fixed: provider.fees.fixed,
                min_fee: provider.fees.min_fee,
                max_fee: provider.fees.max_fee,
                calculated: provider_fee,
            },
            platform: PlatformFee {
                percent: self.platform_fee_percent,
                calculated: platform_fee,
            },
            total,
            net_amount: amount - total,
            effective_rate,
        }
    }

    pub fn settlement_currency(&self) -> &str {
        &self.settlement_currency
    }

    /// Normalise `amount` into the settlement currency
    pub fn convert_to_settlement(
        &self,
        amount: Decimal,
        currency: &str,
    ) -> Result<SettlementConversion, FeeError> {
        let rate = if currency.eq_ignore_ascii_case(&self.settlement_currency) {
            Decimal::ONE
        } else {
            *self
                .fx_rates
                .get(&currency.to_uppercase())
                .ok_or_else(|| FeeError::MissingFxRate {
                    from: currency.to_uppercase(),
                    to: self.settlement_currency.clone(),
                })?
        };

        Ok(SettlementConversion {
            rate,
            settlement_currency: self.settlement_currency.clone(),
            amount: round_money(amount * rate, &self.settlement_currency),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payments::types::{ChannelType, VerificationType};
    use rust_decimal_macros::dec;

    fn fees(percentage: Decimal, fixed: Decimal, min: Option<Decimal>, max: Option<Decimal>) -> FeeStructure {
        FeeStructure {
            percentage,
            fixed,
            min_fee: min,
            max_fee: max,
        }
    }

    #[test]
    fn test_fee_clamped_to_minimum() {
        let structure = fees(dec!(1.5), dec!(0), Some(dec!(5)), Some(dec!(500)));
        assert_eq!(calculate_provider_fee(dec!(100), "NGN", &structure), dec!(5.00));
    }

    #[test]
    fn test_fee_clamped_to_maximum() {
        let structure = fees(dec!(1.5), dec!(0), Some(dec!(5)), Some(dec!(500)));
        assert_eq!(calculate_provider_fee(dec!(1000000), "NGN", &structure), dec!(500));
    }

    #[test]
    fn test_fee_rounds_half_away_from_zero() {
        // 0.5% of 1001 = 5.005
        let structure = fees(dec!(0.5), dec!(0), None, None);
        assert_eq!(calculate_provider_fee(dec!(1001), "NGN", &structure), dec!(5.01));
    }

    #[test]
    fn test_zero_decimal_currency_rounding() {
        let structure = fees(dec!(1.5), dec!(0), None, None);
        // 1.5% of 1030 = 15.45
        assert_eq!(calculate_provider_fee(dec!(1030), "UGX", &structure), dec!(15));
        assert_eq!(minor_unit_scale("ugx"), 0);
        assert_eq!(minor_unit_scale("NGN"), 2);
    }

    #[test]
    fn test_breakdown_net_amount() {
        let service = FeeCalculationService::new(&GatewayConfig::default());
        let mut provider = ProviderConfig::new("card_gateway", ChannelType::BankCard, VerificationType::Webhook);
        provider.fees = fees(dec!(1.5), dec!(100), None, Some(dec!(2000)));

        let breakdown = service.calculate_fees(dec!(10000), "NGN", &provider);
        assert_eq!(breakdown.provider.calculated, dec!(250.00));
        assert_eq!(breakdown.platform.calculated, dec!(50.00));
        assert_eq!(breakdown.total, dec!(300.00));
        assert_eq!(breakdown.net_amount, dec!(9700.00));
        assert_eq!(breakdown.effective_rate, dec!(3));
    }

    #[test]
    fn test_settlement_conversion() {
        let mut config = GatewayConfig::default();
        config.fx_rates.insert("USD".to_string(), dec!(1550.50));
        let service = FeeCalculationService::new(&config);

        let converted = service.convert_to_settlement(dec!(10), "usd").unwrap();
        assert_eq!(converted.rate, dec!(1550.50));
        assert_eq!(converted.amount, dec!(15505.00));

        let same = service.convert_to_settlement(dec!(10), "NGN").unwrap();
        assert_eq!(same.rate, Decimal::ONE);

        assert!(matches!(
            service.convert_to_settlement(dec!(10), "EUR"),
            Err(FeeError::MissingFxRate { .. })
        ));
    }
}
