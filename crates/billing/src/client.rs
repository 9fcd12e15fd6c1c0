//! Stripe client configuration
//!
//! Thin wrapper around the async-stripe client. Everything above this layer
//! goes through the [`crate::gateway::PaymentGateway`] trait so the state
//! machine and tests never depend on the concrete SDK.

use crate::error::{BillingError, BillingResult};

/// Stripe configuration loaded from environment
#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    pub webhook_secret: String,
    /// Base URL the checkout session redirects back to
    pub return_url: String,
}

impl StripeConfig {
    pub fn from_env() -> BillingResult<Self> {
        let secret_key = std::env::var("STRIPE_SECRET_KEY")
            .map_err(|_| BillingError::Config("STRIPE_SECRET_KEY not set".to_string()))?;
        let webhook_secret = std::env::var("STRIPE_WEBHOOK_SECRET")
            .map_err(|_| BillingError::Config("STRIPE_WEBHOOK_SECRET not set".to_string()))?;
        let return_url = std::env::var("BILLING_RETURN_URL")
            .unwrap_or_else(|_| "https://app.boxhq.io/billing".to_string());

        Ok(Self {
            secret_key,
            webhook_secret,
            return_url,
        })
    }
}

/// Shared Stripe API client
#[derive(Clone)]
pub struct StripeClient {
    client: stripe::Client,
    config: StripeConfig,
}

impl StripeClient {
    pub fn new(config: StripeConfig) -> Self {
        let client = stripe::Client::new(config.secret_key.clone());
        Self { client, config }
    }

    pub fn from_env() -> BillingResult<Self> {
        Ok(Self::new(StripeConfig::from_env()?))
    }

    /// Access the underlying async-stripe client
    pub fn inner(&self) -> &stripe::Client {
        &self.client
    }

    pub fn config(&self) -> &StripeConfig {
        &self.config
    }
}
