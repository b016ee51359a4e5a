//! Stripe client configuration

use crate::error::{BillingError, BillingResult};

/// Stripe credentials and webhook configuration
#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    /// Signing secret for webhook payload verification, when the embedding
    /// transport performs verification.
    pub webhook_secret: Option<String>,
}

impl StripeConfig {
    pub fn from_env() -> BillingResult<Self> {
        let secret_key = std::env::var("STRIPE_SECRET_KEY")
            .map_err(|_| BillingError::Config("STRIPE_SECRET_KEY not set".to_string()))?;
        let webhook_secret = std::env::var("STRIPE_WEBHOOK_SECRET").ok();
        Ok(Self {
            secret_key,
            webhook_secret,
        })
    }
}

/// Wrapper around the Stripe API client
#[derive(Clone)]
pub struct StripeClient {
    inner: stripe::Client,
    config: StripeConfig,
}

impl StripeClient {
    pub fn new(config: StripeConfig) -> Self {
        let inner = stripe::Client::new(config.secret_key.clone());
        Self { inner, config }
    }

    pub fn from_env() -> BillingResult<Self> {
        Ok(Self::new(StripeConfig::from_env()?))
    }

    pub fn inner(&self) -> &stripe::Client {
        &self.inner
    }

    pub fn config(&self) -> &StripeConfig {
        &self.config
    }
}
