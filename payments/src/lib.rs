//! Uniform adapter over heterogeneous payment providers (C6).
//!
//! [`PaymentProvider`] is the single capability set the rest of the service
//! consumes; [`create_provider`] is the only place that converts a
//! [`ProviderKind`] into a concrete implementation, mirroring the
//! `create_provider` pattern used by the reference control-layer's payment
//! module.

pub mod provider;
pub mod stripe;
pub mod toss;

pub use provider::{
    create_provider, CanonicalWebhookEvent, CardMetadata, ChargeResult,
    PaymentIntent, PaymentProvider, ProviderConfig, ProviderError, ProviderKind,
};
