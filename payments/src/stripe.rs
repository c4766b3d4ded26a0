//! A hosted-checkout subscription provider, shaped after Stripe: payment
//! intents, webhook signatures over `timestamp.payload`.

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

pub struct StripeProvider {
    client: RestClient,
    config: ProviderConfig,
}

impl StripeProvider {
    pub fn new(config: ProviderConfig, from: impl Into<std::borrow::Cow<'static, str>>) -> Self {
        Self {
            client: RestClient::new(from, "stripe"),
            config,
        }
    }
}

#[derive(Serialize)]
struct CreatePaymentIntentRequest<'a> {
    amount: Decimal,
    currency: &'a str,
    metadata: Value,
}

#[derive(Deserialize)]
struct PaymentIntentResponse {
    id: String,
    client_secret: Option<String>,
    status: String,
}

#[async_trait]
impl PaymentProvider for StripeProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Stripe
    }

    async fn issue_billing_key(
        &self,
        _customer_key: &str,
        _auth_key: &str,
    ) -> Result<(String, CardMetadata), ProviderError> {
        Err(ProviderError::not_implemented("issue_billing_key"))
    }

    async fn charge_billing_key(
        &self,
        _billing_key: &str,
        _customer_key: &str,
        _order_id: &str,
        _order_name: &str,
        _amount: Decimal,
    ) -> Result<ChargeResult, ProviderError> {
        Err(ProviderError::not_implemented("charge_billing_key"))
    }

    async fn initialize_payment(
        &self,
        order_id: &str,
        amount: Decimal,
        currency: &str,
        metadata: Value,
    ) -> Result<PaymentIntent, ProviderError> {
        let url = format!("{}/v1/payment_intents", self.config.base_url);
        let mut metadata = metadata;
        if let Value::Object(map) = &mut metadata {
            map.insert("order_id".to_owned(), Value::String(order_id.to_owned()));
        }
        let body = CreatePaymentIntentRequest {
            amount,
            currency,
            metadata,
        };
        let req = self
            .client
            .post(&url, &body)
            .bearer_auth(&self.config.secret_key);
        let resp: PaymentIntentResponse = self
            .client
            .send::<_, AppApiError>(req)
            .await
            .map_err(to_provider_error)?;
        Ok(PaymentIntent {
            provider_intent_id: resp.id,
            client_secret: resp.client_secret,
        })
    }

    async fn confirm_payment(
        &self,
        _order_id: &str,
        provider_intent_id: &str,
    ) -> Result<ChargeResult, ProviderError> {
        let url = format!(
            "{}/v1/payment_intents/{provider_intent_id}/confirm",
            self.config.base_url
        );
        let req = self
            .client
            .post(&url, &())
            .bearer_auth(&self.config.secret_key);
        let resp: PaymentIntentResponse = self
            .client
            .send::<_, AppApiError>(req)
            .await
            .map_err(to_provider_error)?;
        Ok(ChargeResult {
            payment_id: resp.id,
            status: resp.status,
            approved_at: None,
        })
    }

    /// Stripe-style: header carries `t=<unix_ts>,v1=<hex_hmac>`; the signed
    /// payload is `"{timestamp}.{body}"`.
    fn verify_webhook(
        &self,
        payload_bytes: &[u8],
        signature: &str,
        secret: &str,
    ) -> Result<CanonicalWebhookEvent, ProviderError> {
        let (timestamp, v1) = parse_signature_header(signature)
            .ok_or_else(|| verification_error("malformed signature header".to_owned()))?;

        let mut signed_payload = Vec::with_capacity(timestamp.len() + 1 + payload_bytes.len());
        signed_payload.extend_from_slice(timestamp.as_bytes());
        signed_payload.push(b'.');
        signed_payload.extend_from_slice(payload_bytes);

        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|e| verification_error(e.to_string()))?;
        mac.update(&signed_payload);
        let expected = mac.finalize().into_bytes();
        let expected_hex = hex_encode(&expected);
        if !constant_time_eq(expected_hex.as_bytes(), v1.as_bytes()) {
            return Err(verification_error("signature mismatch".to_owned()));
        }

        let payload: Value = serde_json::from_slice(payload_bytes)
            .map_err(|e| verification_error(format!("malformed webhook payload: {e}")))?;
        let event_kind = payload
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_owned();
        let provider_event_id = payload
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| verification_error("missing id".to_owned()))?
            .to_owned();

        Ok(CanonicalWebhookEvent {
            provider_event_id,
            event_kind,
            payload,
        })
    }
}

fn parse_signature_header(header: &str) -> Option<(&str, &str)> {
    let mut timestamp = None;
    let mut v1 = None;
    for part in header.split(',') {
        let mut kv = part.splitn(2, '=');
        match (kv.next(), kv.next()) {
            (Some("t"), Some(v)) => timestamp = Some(v),
            (Some("v1"), Some(v)) => v1 = Some(v),
            _ => {}
        }
    }
    Some((timestamp?, v1?))
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

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod test {
    use super::*;

    fn provider() -> StripeProvider {
        StripeProvider::new(
            ProviderConfig {
                base_url: "https://api.stripe.com".to_owned(),
                secret_key: "sk_test".to_owned(),
                webhook_secret: "whsec_test".to_owned(),
            },
            "test",
        )
    }

    #[test]
    fn verify_webhook_accepts_valid_signature() {
        let payload = br#"{"type":"invoice.paid","id":"evt_1"}"#;
        let timestamp = "1700000000";
        let mut signed = Vec::new();
        signed.extend_from_slice(timestamp.as_bytes());
        signed.push(b'.');
        signed.extend_from_slice(payload);
        let mut mac = HmacSha256::new_from_slice(b"whsec_test").unwrap();
        mac.update(&signed);
        let v1 = hex_encode(&mac.finalize().into_bytes());
        let header = format!("t={timestamp},v1={v1}");

        let event = provider().verify_webhook(payload, &header, "whsec_test").unwrap();
        assert_eq!(event.provider_event_id, "evt_1");
        assert_eq!(event.event_kind, "invoice.paid");
    }

    #[test]
    fn verify_webhook_rejects_wrong_secret() {
        let payload = br#"{"type":"invoice.paid","id":"evt_1"}"#;
        let header = "t=1700000000,v1=deadbeef";
        let err = provider().verify_webhook(payload, header, "whsec_test").unwrap_err();
        assert_eq!(err.code, "SIGNATURE_VERIFICATION_FAILED");
    }

    #[test]
    fn parse_signature_header_requires_both_fields() {
        assert!(parse_signature_header("t=123").is_none());
        assert!(parse_signature_header("v1=abc").is_none());
        assert_eq!(parse_signature_header("t=123,v1=abc"), Some(("123", "abc")));
    }
}
