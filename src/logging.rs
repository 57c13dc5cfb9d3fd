//! Tracing subscriber setup and log-safe formatting helpers

use crate::config::{LogFormat, LoggingConfig};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global subscriber. `RUST_LOG` wins over `LOG_LEVEL`.
///
/// Calling it twice is harmless; the second call is ignored.
pub fn init_tracing(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.to_lowercase()));

    let registry = tracing_subscriber::registry().with(filter);

    match config.format {
        LogFormat::Json => {
            let layer = fmt::layer()
                .json()
                .with_current_span(true)
                .with_target(true);
            registry.with(layer).try_init().ok();
        }
        LogFormat::Plain => {
            let layer = fmt::layer().with_target(true).with_line_number(true);
            registry.with(layer).try_init().ok();
        }
    }
}

/// Keep the country prefix and last four digits of a phone number
pub fn mask_phone(phone: &str) -> String {
    let digits: Vec<char> = phone.chars().collect();
    if digits.len() <= 8 {
        return "*".repeat(digits.len());
    }
    let head: String = digits[..4].iter().collect();
    let tail: String = digits[digits.len() - 4..].iter().collect();
    format!("{}{}{}", head, "*".repeat(digits.len() - 8), tail)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_phone_hides_middle_digits() {
        assert_eq!(mask_phone("+2348031234567"), "+234******4567");
        assert_eq!(mask_phone("12345"), "*****");
    }
}
