//! Fraud/risk scoring applied at initiation.
//!
//! Each check that fires adds its weight and a tag; the score is capped at 100.
//! A decline recommendation marks the payment suspicious but does not stop it,
//! the facility decides what to do with flagged payments.

use crate::config::ConfigError;
use chrono::{DateTime, Duration, FixedOffset, Timelike, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;

pub const WEIGHT_UNUSUAL_AMOUNT: u8 = 25;
pub const WEIGHT_HIGH_VELOCITY: u8 = 30;
pub const WEIGHT_UNUSUAL_HOURS: u8 = 15;
pub const WEIGHT_LARGE_FIRST_TRANSACTION: u8 = 20;
pub const WEIGHT_NEGATIVE_HISTORY: u8 = 40;

const REVIEW_THRESHOLD: u8 = 30;
const DECLINE_THRESHOLD: u8 = 60;

#[derive(Debug, Clone)]
pub struct RiskConfig {
    /// Amount (settlement currency) at or above which a payment is unusual
    pub large_amount_threshold: Decimal,
    pub velocity_max_payments: u32,
    pub velocity_window: Duration,
    /// Local hours `[start, end)` considered unusual
    pub unusual_hours_start: u32,
    pub unusual_hours_end: u32,
    /// Offset of facility local time from UTC, in hours
    pub utc_offset_hours: i32,
    pub first_transaction_threshold: Decimal,
    pub negative_history_failures: u32,
    pub negative_history_window: Duration,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            large_amount_threshold: Decimal::new(500_000, 0),
            velocity_max_payments: 5,
            velocity_window: Duration::minutes(60),
            unusual_hours_start: 0,
            unusual_hours_end: 5,
            utc_offset_hours: 1,
            first_transaction_threshold: Decimal::new(100_000, 0),
            negative_history_failures: 2,
            negative_history_window: Duration::days(30),
        }
    }
}

fn env_parse<T: FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(key.to_string())),
        Err(_) => Ok(default),
    }
}

impl RiskConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let d = RiskConfig::default();
        Ok(RiskConfig {
            large_amount_threshold: env_parse("RISK_LARGE_AMOUNT", d.large_amount_threshold)?,
            velocity_max_payments: env_parse("RISK_VELOCITY_MAX_PAYMENTS", d.velocity_max_payments)?,
            velocity_window: Duration::minutes(env_parse(
                "RISK_VELOCITY_WINDOW_MINUTES",
                d.velocity_window.num_minutes(),
            )?),
            unusual_hours_start: env_parse("RISK_UNUSUAL_HOURS_START", d.unusual_hours_start)?,
            unusual_hours_end: env_parse("RISK_UNUSUAL_HOURS_END", d.unusual_hours_end)?,
            utc_offset_hours: env_parse("RISK_UTC_OFFSET_HOURS", d.utc_offset_hours)?,
            first_transaction_threshold: env_parse(
                "RISK_FIRST_TRANSACTION_AMOUNT",
                d.first_transaction_threshold,
            )?,
            negative_history_failures: env_parse(
                "RISK_NEGATIVE_HISTORY_FAILURES",
                d.negative_history_failures,
            )?,
            negative_history_window: Duration::days(env_parse(
                "RISK_NEGATIVE_HISTORY_DAYS",
                d.negative_history_window.num_days(),
            )?),
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.unusual_hours_start > 23 || self.unusual_hours_end > 24 {
            return Err(ConfigError::InvalidValue(
                "RISK_UNUSUAL_HOURS_START/END".to_string(),
            ));
        }
        if !(-12..=14).contains(&self.utc_offset_hours) {
            return Err(ConfigError::InvalidValue("RISK_UTC_OFFSET_HOURS".to_string()));
        }
        if self.velocity_window <= Duration::zero() || self.negative_history_window <= Duration::zero()
        {
            return Err(ConfigError::ValidationFailed(
                "risk windows must be positive".to_string(),
            ));
        }
        if self.large_amount_threshold <= Decimal::ZERO
            || self.first_transaction_threshold <= Decimal::ZERO
        {
            return Err(ConfigError::ValidationFailed(
                "risk amount thresholds must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskCheck {
    UnusualAmount,
    HighVelocity,
    UnusualHours,
    LargeFirstTransaction,
    NegativeHistory,
}

impl RiskCheck {
    pub fn weight(&self) -> u8 {
        match self {
            RiskCheck::UnusualAmount => WEIGHT_UNUSUAL_AMOUNT,
            RiskCheck::HighVelocity => WEIGHT_HIGH_VELOCITY,
            RiskCheck::UnusualHours => WEIGHT_UNUSUAL_HOURS,
            RiskCheck::LargeFirstTransaction => WEIGHT_LARGE_FIRST_TRANSACTION,
            RiskCheck::NegativeHistory => WEIGHT_NEGATIVE_HISTORY,
        }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            RiskCheck::UnusualAmount => "unusual_amount",
            RiskCheck::HighVelocity => "high_velocity",
            RiskCheck::UnusualHours => "unusual_hours",
            RiskCheck::LargeFirstTransaction => "large_first_transaction",
            RiskCheck::NegativeHistory => "negative_history",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskRecommendation {
    Approve,
    Review,
    Decline,
}

impl RiskRecommendation {
    pub fn from_score(score: u8) -> Self {
        if score < REVIEW_THRESHOLD {
            RiskRecommendation::Approve
        } else if score < DECLINE_THRESHOLD {
            RiskRecommendation::Review
        } else {
            RiskRecommendation::Decline
        }
    }
}

/// What the store knows about the patient's earlier payments
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PayerHistory {
    pub prior_payments: u32,
    pub payments_in_velocity_window: u32,
    pub recent_failures: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub score: u8,
    pub checks: Vec<RiskCheck>,
    pub recommendation: RiskRecommendation,
}

impl RiskAssessment {
    pub fn is_suspicious(&self) -> bool {
        self.recommendation != RiskRecommendation::Approve
    }

    pub fn tags(&self) -> Vec<String> {
        let mut tags: Vec<String> = Vec::with_capacity(self.checks.len());
        for check in &self.checks {
            let tag = check.tag().to_string();
            if !tags.contains(&tag) {
                tags.push(tag);
            }
        }
        tags
    }
}

#[derive(Debug, Clone)]
pub struct RiskService {
    config: RiskConfig,
}

impl RiskService {
    pub fn new(config: RiskConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    fn is_unusual_hour(&self, at: DateTime<Utc>) -> bool {
        let hour = match FixedOffset::east_opt(self.config.utc_offset_hours * 3600) {
            Some(offset) => at.with_timezone(&offset).hour(),
            None => at.hour(),
        };
        let (start, end) = (self.config.unusual_hours_start, self.config.unusual_hours_end);
        if start <= end {
            hour >= start && hour < end
        } else {
            // window wraps midnight, e.g. 22..5
            hour >= start || hour < end
        }
    }

    /// Score a payment of `settlement_amount` made at `at`
    pub fn assess(
        &self,
        settlement_amount: Decimal,
        history: &PayerHistory,
        at: DateTime<Utc>,
    ) -> RiskAssessment {
        let mut checks = Vec::new();

        if settlement_amount >= self.config.large_amount_threshold {
            checks.push(RiskCheck::UnusualAmount);
        }
        if history.payments_in_velocity_window >= self.config.velocity_max_payments {
            checks.push(RiskCheck::HighVelocity);
        }
        if self.is_unusual_hour(at) {
            checks.push(RiskCheck::UnusualHours);
        }
        if history.prior_payments == 0
            && settlement_amount >= self.config.first_transaction_threshold
        {
            checks.push(RiskCheck::LargeFirstTransaction);
        }
        if history.recent_failures >= self.config.negative_history_failures {
            checks.push(RiskCheck::NegativeHistory);
        }

        let score = checks
            .iter()
            .map(|c| u32::from(c.weight()))
            .sum::<u32>()
            .min(100) as u8;

        RiskAssessment {
            score,
            checks,
            recommendation: RiskRecommendation::from_score(score),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn service() -> RiskService {
        RiskService::new(RiskConfig::default())
    }

    fn midday() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 18, 11, 0, 0).unwrap()
    }

    fn history() -> PayerHistory {
        PayerHistory {
            prior_payments: 3,
            ..Default::default()
        }
    }

    #[test]
    fn test_clean_payment_is_approved() {
        let assessment = service().assess(dec!(15000), &history(), midday());
        assert_eq!(assessment.score, 0);
        assert_eq!(assessment.recommendation, RiskRecommendation::Approve);
        assert!(!assessment.is_suspicious());
    }

    #[test]
    fn test_unusual_amount_and_hours_needs_review() {
        // 01:30 UTC is 02:30 at the default +1 offset
        let night = Utc.with_ymd_and_hms(2026, 10, 18, 1, 30, 0).unwrap();
        let assessment = service().assess(dec!(750000), &history(), night);

        assert_eq!(assessment.score, 40);
        assert_eq!(assessment.recommendation, RiskRecommendation::Review);
        assert_eq!(assessment.tags(), vec!["unusual_amount", "unusual_hours"]);
        assert!(assessment.is_suspicious());
    }

    #[test]
    fn test_score_is_capped_at_100() {
        let night = Utc.with_ymd_and_hms(2026, 10, 18, 2, 0, 0).unwrap();
        let bad = PayerHistory {
            prior_payments: 0,
            payments_in_velocity_window: 9,
            recent_failures: 4,
        };
        let assessment = service().assess(dec!(900000), &bad, night);
        assert_eq!(assessment.score, 100);
        assert_eq!(assessment.checks.len(), 5);
        assert_eq!(assessment.recommendation, RiskRecommendation::Decline);
    }

    #[test]
    fn test_recommendation_boundaries() {
        assert_eq!(RiskRecommendation::from_score(29), RiskRecommendation::Approve);
        assert_eq!(RiskRecommendation::from_score(30), RiskRecommendation::Review);
        assert_eq!(RiskRecommendation::from_score(59), RiskRecommendation::Review);
        assert_eq!(RiskRecommendation::from_score(60), RiskRecommendation::Decline);
    }

    #[test]
    fn test_wrapping_hours_window() {
        let service = RiskService::new(RiskConfig {
            unusual_hours_start: 22,
            unusual_hours_end: 5,
            utc_offset_hours: 0,
            ..Default::default()
        });
        let late = Utc.with_ymd_and_hms(2026, 10, 18, 23, 0, 0).unwrap();
        assert!(service.is_unusual_hour(late));
        assert!(!service.is_unusual_hour(midday()));
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(RiskConfig::default().validate().is_ok());
        let bad = RiskConfig {
            utc_offset_hours: 20,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }
}
