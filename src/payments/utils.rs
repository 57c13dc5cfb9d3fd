use crate::payments::error::{PaymentError, PaymentResult};
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use sha2::Sha256;
use std::time::Duration;
use tracing::warn;

type HmacSha256 = Hmac<Sha256>;

#[derive(Clone)]
pub struct PaymentHttpClient {
    client: Client,
    provider: String,
    timeout: Duration,
    max_retries: u32,
}

impl PaymentHttpClient {
    pub fn new(provider: &str, timeout: Duration, max_retries: u32) -> PaymentResult<Self> {
        let client =
            Client::builder()
                .timeout(timeout)
                .build()
                .map_err(|e| PaymentError::NetworkError {
                    message: format!("failed to initialize HTTP client: {}", e),
                })?;

        Ok(Self {
            client,
            provider: provider.to_string(),
            timeout,
            max_retries,
        })
    }

    /// JSON request with retries on 429 and 5xx, backing off 1s, 2s, 4s...
    pub async fn request_json<T: DeserializeOwned>(
        &self,
        method: reqwest::Method,
        url: &str,
        bearer_token: Option<&str>,
        body: Option<&JsonValue>,
    ) -> PaymentResult<T> {
        let mut last_error = None;
        for attempt in 0..=self.max_retries {
            let mut request = self.client.request(method.clone(), url).timeout(self.timeout);
            if let Some(token) = bearer_token {
                request = request.bearer_auth(token);
            }
            if let Some(payload) = body {
                request = request.json(payload);
            }

            let response = request
                .send()
                .await
                .map_err(|e| PaymentError::NetworkError {
                    message: format!("{} request failed: {}", self.provider, e),
                });

            match response {
                Ok(resp) => {
                    let status = resp.status();
                    let text = resp.text().await.unwrap_or_default();
                    if status.is_success() {
                        return serde_json::from_str::<T>(&text).map_err(|e| {
                            PaymentError::ProviderError {
                                provider: self.provider.clone(),
                                message: format!("invalid provider JSON response: {}", e),
                                provider_code: None,
                                retryable: false,
                            }
                        });
                    }

                    if status.as_u16() == 429 {
                        if attempt < self.max_retries {
                            tokio::time::sleep(Duration::from_secs(1 << attempt)).await;
                            continue;
                        }
                        return Err(PaymentError::RateLimitError {
                            message: format!("{} rate limit exceeded", self.provider),
                            retry_after_seconds: None,
                        });
                    }

                    if status.is_server_error() && attempt < self.max_retries {
                        warn!(
                            provider = %self.provider,
                            status = %status,
                            attempt = attempt + 1,
                            "provider server error, retrying"
                        );
                        tokio::time::sleep(Duration::from_secs(1 << attempt)).await;
                        continue;
                    }

                    return Err(PaymentError::ProviderError {
                        provider: self.provider.clone(),
                        message: format!("HTTP {}: {}", status, text),
                        provider_code: Some(status.as_u16().to_string()),
                        retryable: status.is_server_error(),
                    });
                }
                Err(e) => {
                    last_error = Some(e);
                    if attempt < self.max_retries {
                        tokio::time::sleep(Duration::from_secs(1 << attempt)).await;
                        continue;
                    }
                }
            }
        }

        Err(last_error.unwrap_or(PaymentError::NetworkError {
            message: format!("{} request failed", self.provider),
        }))
    }
}

/// Constant-time check of a hex HMAC-SHA256 signature over the raw body
pub fn verify_hmac_sha256_hex(payload: &[u8], secret: &str, signature: &str) -> bool {
    let expected = match hex::decode(signature.trim()) {
        Ok(bytes) => bytes,
        Err(_) => return false,
    };
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(v) => v,
        Err(_) => return false,
    };
    mac.update(payload);
    mac.verify_slice(&expected).is_ok()
}

/// Hex HMAC-SHA256 signature, used by tests and outbound callbacks
pub fn sign_hmac_sha256_hex(payload: &[u8], secret: &str) -> String {
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(v) => v,
        Err(_) => return String::new(),
    };
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

/// Shared webhook check for HMAC-signed providers
pub fn check_webhook_signature(
    provider: &str,
    secret: Option<&str>,
    payload: &[u8],
    signature: Option<&str>,
) -> crate::payments::types::WebhookVerificationResult {
    use crate::payments::types::WebhookVerificationResult;

    let reason = match (secret, signature) {
        (None, _) => Some(format!("{} webhook secret not configured", provider)),
        (_, None) => Some("missing signature header".to_string()),
        (Some(secret), Some(signature)) => {
            if verify_hmac_sha256_hex(payload, secret, signature) {
                None
            } else {
                Some("signature mismatch".to_string())
            }
        }
    };

    WebhookVerificationResult {
        valid: reason.is_none(),
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hmac_round_trip_and_tamper_detection() {
        let payload = br#"{"event":"charge.completed","id":"CARD-1"}"#;
        let signature = sign_hmac_sha256_hex(payload, "whsec");

        assert!(verify_hmac_sha256_hex(payload, "whsec", &signature));
        assert!(!verify_hmac_sha256_hex(payload, "other", &signature));
        assert!(!verify_hmac_sha256_hex(
            br#"{"event":"charge.completed","id":"CARD-2"}"#,
            "whsec",
            &signature
        ));
        assert!(!verify_hmac_sha256_hex(payload, "whsec", "not-hex"));
    }

    #[test]
    fn missing_secret_or_header_is_invalid() {
        let result = check_webhook_signature("card_gateway", None, b"{}", Some("ab"));
        assert!(!result.valid);
        let result = check_webhook_signature("card_gateway", Some("s"), b"{}", None);
        assert_eq!(result.reason.as_deref(), Some("missing signature header"));
    }
}
