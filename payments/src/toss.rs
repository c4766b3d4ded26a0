//! A billing-key tokenization provider, shaped after Toss Payments: issue and
//! charge billing keys, HMAC-SHA256 webhook signatures.

use api::rest::RestClient;
use api_core::error::AppApiError;
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;

use crate::provider::{
    CanonicalWebhookEvent, CardMetadata, ChargeResult, PaymentIntent,
    PaymentProvider, ProviderConfig, ProviderError, ProviderKind,
};

type HmacSha256 = Hmac<Sha256>;

pub struct TossProvider {
    client: RestClient,
    config: ProviderConfig,
}

impl TossProvider {
    pub fn new(config: ProviderConfig, from: impl Into<std::borrow::Cow<'static, str>>) -> Self {
        Self {
            client: RestClient::new(from, "toss"),
            config,
        }
    }
}

#[derive(Serialize)]
struct IssueBillingKeyRequest<'a> {
    #[serde(rename = "customerKey")]
    customer_key: &'a str,
    #[serde(rename = "authKey")]
    auth_key: &'a str,
}

#[derive(Deserialize)]
struct IssueBillingKeyResponse {
    #[serde(rename = "billingKey")]
    billing_key: String,
    card: Option<CardResponse>,
}

#[derive(Deserialize)]
struct CardResponse {
    #[serde(rename = "issuerCode")]
    issuer_code: Option<String>,
    number: Option<String>,
}

#[derive(Serialize)]
struct ChargeBillingKeyRequest<'a> {
    #[serde(rename = "customerKey")]
    customer_key: &'a str,
    #[serde(rename = "orderId")]
    order_id: &'a str,
    #[serde(rename = "orderName")]
    order_name: &'a str,
    amount: Decimal,
}

#[derive(Deserialize)]
struct ChargeBillingKeyResponse {
    #[serde(rename = "paymentKey")]
    payment_key: String,
    status: String,
    #[serde(rename = "approvedAt")]
    approved_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[async_trait]
impl PaymentProvider for TossProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Toss
    }

    async fn issue_billing_key(
        &self,
        customer_key: &str,
        auth_key: &str,
    ) -> Result<(String, CardMetadata), ProviderError> {
        let url = format!("{}/v1/billing/authorizations/issue", self.config.base_url);
        let body = IssueBillingKeyRequest {
            customer_key,
            auth_key,
        };
        let req = self
            .client
            .post(&url, &body)
            .bearer_auth(&self.config.secret_key);
        let resp: IssueBillingKeyResponse = self
            .client
            .send::<_, AppApiError>(req)
            .await
            .map_err(to_provider_error)?;
        let metadata = CardMetadata {
            brand: resp.card.as_ref().and_then(|c| c.issuer_code.clone()),
            last4: resp
                .card
                .as_ref()
                .and_then(|c| c.number.as_ref())
                .map(|n| n.chars().rev().take(4).collect::<String>())
                .map(|rev| rev.chars().rev().collect()),
        };
        Ok((resp.billing_key, metadata))
    }

    async fn charge_billing_key(
        &self,
        billing_key: &str,
        customer_key: &str,
        order_id: &str,
        order_name: &str,
        amount: Decimal,
    ) -> Result<ChargeResult, ProviderError> {
        let url = format!("{}/v1/billing/{billing_key}", self.config.base_url);
        let body = ChargeBillingKeyRequest {
            customer_key,
            order_id,
            order_name,
            amount,
        };
        let req = self
            .client
            .post(&url, &body)
            .bearer_auth(&self.config.secret_key);
        let resp: ChargeBillingKeyResponse = self
            .client
            .send::<_, AppApiError>(req)
            .await
            .map_err(to_provider_error)?;
        Ok(ChargeResult {
            payment_id: resp.payment_key,
            status: resp.status,
            approved_at: resp.approved_at,
        })
    }

    async fn initialize_payment(
        &self,
        _order_id: &str,
        _amount: Decimal,
        _currency: &str,
        _metadata: Value,
    ) -> Result<PaymentIntent, ProviderError> {
        Err(ProviderError::not_implemented("initialize_payment"))
    }

    async fn confirm_payment(
        &self,
        _order_id: &str,
        _provider_intent_id: &str,
    ) -> Result<ChargeResult, ProviderError> {
        Err(ProviderError::not_implemented("confirm_payment"))
    }

    fn verify_webhook(
        &self,
        payload_bytes: &[u8],
        signature: &str,
        secret: &str,
    ) -> Result<CanonicalWebhookEvent, ProviderError> {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|e| verification_error(e.to_string()))?;
        mac.update(payload_bytes);
        let expected = mac.finalize().into_bytes();
        let expected_hex = hex_encode(&expected);
        if !constant_time_eq(expected_hex.as_bytes(), signature.as_bytes()) {
            return Err(verification_error("signature mismatch".to_owned()));
        }

        let payload: Value = serde_json::from_slice(payload_bytes)
            .map_err(|e| verification_error(format!("malformed webhook payload: {e}")))?;
        let event_kind = payload
            .get("eventType")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_owned();
        let provider_event_id = payload
            .get("eventId")
            .and_then(Value::as_str)
            .ok_or_else(|| verification_error("missing eventId".to_owned()))?
            .to_owned();

        Ok(CanonicalWebhookEvent {
            provider_event_id,
            event_kind,
            payload,
        })
    }
}

fn verification_error(message: String) -> ProviderError {
    ProviderError {
        code: "SIGNATURE_VERIFICATION_FAILED".to_owned(),
        message,
        details: Value::Null,
        retryable: false,
    }
}

fn to_provider_error(err: AppApiError) -> ProviderError {
    ProviderError {
        code: format!("{:?}", err.kind),
        message: err.msg,
        details: err.data,
        retryable: matches!(
            err.kind,
            api_core::error::AppErrorKindImpl::Transient
                | api_core::error::AppErrorKindImpl::Connect
                | api_core::error::AppErrorKindImpl::Timeout
        ),
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut acc, b| {
        let _ = write!(acc, "{b:02x}");
        acc
    })
}

/// Constant-time byte comparison to avoid timing side channels on signature
/// checks.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn verify_webhook_accepts_valid_signature() {
        let provider = TossProvider::new(
            ProviderConfig {
                base_url: "https://api.tosspayments.com".to_owned(),
                secret_key: "sk_test".to_owned(),
                webhook_secret: "whsec_test".to_owned(),
            },
            "test",
        );
        let payload = br#"{"eventType":"PAYMENT_STATUS_CHANGED","eventId":"evt_1"}"#;
        let mut mac = HmacSha256::new_from_slice(b"whsec_test").unwrap();
        mac.update(payload);
        let sig = hex_encode(&mac.finalize().into_bytes());

        let event = provider
            .verify_webhook(payload, &sig, "whsec_test")
            .unwrap();
        assert_eq!(event.provider_event_id, "evt_1");
        assert_eq!(event.event_kind, "PAYMENT_STATUS_CHANGED");
    }

    #[test]
    fn verify_webhook_rejects_bad_signature() {
        let provider = TossProvider::new(
            ProviderConfig {
                base_url: "https://api.tosspayments.com".to_owned(),
                secret_key: "sk_test".to_owned(),
                webhook_secret: "whsec_test".to_owned(),
            },
            "test",
        );
        let payload = br#"{"eventType":"PAYMENT_STATUS_CHANGED","eventId":"evt_1"}"#;
        let err = provider
            .verify_webhook(payload, "deadbeef", "whsec_test")
            .unwrap_err();
        assert_eq!(err.code, "SIGNATURE_VERIFICATION_FAILED");
    }
}
