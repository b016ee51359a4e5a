//! Stripe-backed provider gateway
//!
//! Implements [`PaymentProvider`] against the Stripe API. Responses are
//! serialized back to JSON and run through the same flatteners the webhook
//! path uses, so API-fetched and event-delivered objects always read
//! identically downstream.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Serialize;
use stripe::{
    CheckoutSession, CreateSubscription, CreateSubscriptionItems, Customer, CustomerId, Invoice,
    InvoiceId, ListCheckoutSessions, PaymentIntentId, Subscription, SubscriptionId,
    UpdateSubscription, UpdateSubscriptionItems,
};
use stripe::generated::billing::subscription::SubscriptionProrationBehavior;

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};
use crate::provider::{
    PaymentProvider, ProviderCheckoutSession, ProviderCustomer, ProviderInvoice,
    ProviderSubscription, SubscriptionUpdate,
};

#[derive(Clone)]
pub struct StripeGateway {
    stripe: StripeClient,
}

impl StripeGateway {
    pub fn new(stripe: StripeClient) -> Self {
        Self { stripe }
    }
}

fn parse_id<T: std::str::FromStr>(raw: &str, what: &str) -> BillingResult<T>
where
    T::Err: std::fmt::Display,
{
    raw.parse::<T>()
        .map_err(|e| BillingError::Provider(format!("Invalid {} id '{}': {}", what, raw, e)))
}

fn to_object<T: Serialize>(value: &T) -> BillingResult<serde_json::Value> {
    Ok(serde_json::to_value(value)?)
}

#[async_trait]
impl PaymentProvider for StripeGateway {
    async fn subscription(&self, subscription_id: &str) -> BillingResult<ProviderSubscription> {
        let sub_id: SubscriptionId = parse_id(subscription_id, "subscription")?;
        let subscription = Subscription::retrieve(self.stripe.inner(), &sub_id, &[]).await?;
        ProviderSubscription::from_object(&to_object(&subscription)?)
    }

    async fn update_subscription(
        &self,
        subscription_id: &str,
        update: SubscriptionUpdate,
    ) -> BillingResult<ProviderSubscription> {
        let sub_id: SubscriptionId = parse_id(subscription_id, "subscription")?;

        // The price lives on the subscription item, so the current item id
        // is needed to swap it in place.
        let current = Subscription::retrieve(self.stripe.inner(), &sub_id, &[]).await?;
        let item_id = current
            .items
            .data
            .first()
            .map(|item| item.id.to_string())
            .ok_or_else(|| {
                BillingError::Provider(format!(
                    "Subscription {} has no items to update",
                    subscription_id
                ))
            })?;

        let params = UpdateSubscription {
            items: Some(vec![UpdateSubscriptionItems {
                id: Some(item_id),
                price: update.price_id,
                quantity: update.quantity,
                ..Default::default()
            }]),
            metadata: update.metadata,
            // Charge the prorated difference immediately on upgrades
            proration_behavior: Some(SubscriptionProrationBehavior::CreateProrations),
            ..Default::default()
        };

        let subscription = Subscription::update(self.stripe.inner(), &sub_id, params).await?;
        ProviderSubscription::from_object(&to_object(&subscription)?)
    }

    async fn create_subscription(
        &self,
        customer_id: &str,
        price_id: &str,
        quantity: u64,
        metadata: HashMap<String, String>,
    ) -> BillingResult<ProviderSubscription> {
        let customer_id: CustomerId = parse_id(customer_id, "customer")?;

        let mut params = CreateSubscription::new(customer_id);
        params.items = Some(vec![CreateSubscriptionItems {
            price: Some(price_id.to_string()),
            quantity: Some(quantity),
            ..Default::default()
        }]);
        params.metadata = Some(metadata);

        let subscription = Subscription::create(self.stripe.inner(), params).await?;
        ProviderSubscription::from_object(&to_object(&subscription)?)
    }

    async fn invoice(&self, invoice_id: &str) -> BillingResult<ProviderInvoice> {
        let invoice_id: InvoiceId = parse_id(invoice_id, "invoice")?;
        let invoice = Invoice::retrieve(self.stripe.inner(), &invoice_id, &[]).await?;
        ProviderInvoice::from_object(&to_object(&invoice)?)
    }

    async fn checkout_sessions_for_payment_intent(
        &self,
        payment_intent_id: &str,
    ) -> BillingResult<Vec<ProviderCheckoutSession>> {
        let payment_intent_id: PaymentIntentId = parse_id(payment_intent_id, "payment intent")?;

        let mut params = ListCheckoutSessions::new();
        params.payment_intent = Some(payment_intent_id);
        let sessions = CheckoutSession::list(self.stripe.inner(), &params).await?;

        sessions
            .data
            .iter()
            .map(|s| ProviderCheckoutSession::from_object(&to_object(s)?))
            .collect()
    }

    async fn checkout_sessions_for_customer(
        &self,
        customer_id: &str,
        limit: u64,
    ) -> BillingResult<Vec<ProviderCheckoutSession>> {
        let customer_id: CustomerId = parse_id(customer_id, "customer")?;

        let mut params = ListCheckoutSessions::new();
        params.customer = Some(customer_id);
        params.limit = Some(limit);
        let sessions = CheckoutSession::list(self.stripe.inner(), &params).await?;

        sessions
            .data
            .iter()
            .map(|s| ProviderCheckoutSession::from_object(&to_object(s)?))
            .collect()
    }

    async fn customer(&self, customer_id: &str) -> BillingResult<ProviderCustomer> {
        let customer_id: CustomerId = parse_id(customer_id, "customer")?;
        let customer = Customer::retrieve(self.stripe.inner(), &customer_id, &[]).await?;
        Ok(ProviderCustomer {
            id: customer.id.to_string(),
            metadata: customer.metadata.unwrap_or_default(),
        })
    }
}
