//! The [`PaymentProvider`] trait and its factory.

use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde_json::Value;

/// Tags the concrete provider backing a [`PaymentProvider`] trait object.
/// Adding a new provider means adding a variant here and a match arm in
/// [`create_provider`] — call sites never change.
#[derive(Copy, Clone, Debug, Eq, PartialEq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum ProviderKind {
    Toss,
    Stripe,
}

/// Per-provider base URL and shared secret, loaded from [`Config`] at
/// startup (one entry per [`ProviderKind`]).
///
/// [`Config`]: ../../server/struct.Config.html
#[derive(Clone, Debug)]
pub struct ProviderConfig {
    pub base_url: String,
    pub secret_key: String,
    pub webhook_secret: String,
}

/// Uniform error shape across providers: `{code, message, details}`.
#[derive(Clone, Debug, thiserror::Error)]
#[error("provider error {code}: {message}")]
pub struct ProviderError {
    pub code: String,
    pub message: String,
    pub details: Value,
    /// Callers must treat this as non-retryable.
    pub retryable: bool,
}

impl ProviderError {
    pub fn not_implemented(op: &str) -> Self {
        Self {
            code: "NOT_IMPLEMENTED".to_owned(),
            message: format!("{op} is not implemented by this provider"),
            details: Value::Null,
            retryable: false,
        }
    }
}

#[derive(Clone, Debug)]
pub struct CardMetadata {
    pub brand: Option<String>,
    pub last4: Option<String>,
}

#[derive(Clone, Debug)]
pub struct ChargeResult {
    pub payment_id: String,
    pub status: String,
    pub approved_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Clone, Debug)]
pub struct PaymentIntent {
    pub provider_intent_id: String,
    pub client_secret: Option<String>,
}

/// An event normalized out of a provider's raw webhook payload: enough for
/// C7/C8 to dispatch without knowing the provider's wire format.
#[derive(Clone, Debug)]
pub struct CanonicalWebhookEvent {
    pub provider_event_id: String,
    pub event_kind: String,
    pub payload: Value,
}

/// The capability set every payment provider must offer. Two providers
/// implement this trait against this spec: a billing-key tokenization
/// provider ([`toss::TossProvider`]) and a hosted-checkout subscription
/// provider ([`stripe::StripeProvider`]). A provider that doesn't support an
/// operation returns [`ProviderError::not_implemented`], which callers must
/// treat as non-retryable.
///
/// [`toss::TossProvider`]: crate::toss::TossProvider
/// [`stripe::StripeProvider`]: crate::stripe::StripeProvider
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    async fn issue_billing_key(
        &self,
        customer_key: &str,
        auth_key: &str,
    ) -> Result<(String, CardMetadata), ProviderError>;

    async fn charge_billing_key(
        &self,
        billing_key: &str,
        customer_key: &str,
        order_id: &str,
        order_name: &str,
        amount: Decimal,
    ) -> Result<ChargeResult, ProviderError>;

    async fn initialize_payment(
        &self,
        order_id: &str,
        amount: Decimal,
        currency: &str,
        metadata: Value,
    ) -> Result<PaymentIntent, ProviderError>;

    async fn confirm_payment(
        &self,
        order_id: &str,
        provider_intent_id: &str,
    ) -> Result<ChargeResult, ProviderError>;

    /// Verifies `signature` over `payload_bytes` using `secret`, then
    /// normalizes the payload into a [`CanonicalWebhookEvent`]. Returns
    /// `Err` on signature mismatch or malformed payload.
    fn verify_webhook(
        &self,
        payload_bytes: &[u8],
        signature: &str,
        secret: &str,
    ) -> Result<CanonicalWebhookEvent, ProviderError>;
}

/// The single point where provider configuration becomes a provider
/// instance. Adding a new provider requires adding a match arm here.
pub fn create_provider(
    kind: ProviderKind,
    config: ProviderConfig,
    from: impl Into<std::borrow::Cow<'static, str>>,
) -> Arc<dyn PaymentProvider> {
    match kind {
        ProviderKind::Toss => Arc::new(crate::toss::TossProvider::new(config, from)),
        ProviderKind::Stripe => Arc::new(crate::stripe::StripeProvider::new(config, from)),
    }
}
