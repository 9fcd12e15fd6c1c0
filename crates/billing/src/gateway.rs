//! Narrow payment-gateway interface
//!
//! The state machine, plan-change workflow and tests depend only on this
//! trait, never on the concrete Stripe SDK. The gateway's own retry and auth
//! semantics are out of scope here; we call it and persist the identifiers
//! and timestamps it returns.

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use time::OffsetDateTime;

use boxhq_shared::BoxId;

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};

/// Upper bound on any single gateway call. Mutations that hold row locks
/// must never wait on a stuck gateway longer than this.
pub const GATEWAY_CALL_TIMEOUT: Duration = Duration::from_secs(15);

/// Bound a gateway call to `limit`. Elapse surfaces as an
/// `ExternalService` error, retryable like any other gateway failure.
pub async fn with_timeout<T>(
    limit: Duration,
    call: impl std::future::Future<Output = BillingResult<T>>,
) -> BillingResult<T> {
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(BillingError::ExternalService(
            "payment gateway call timed out".to_string(),
        )),
    }
}

/// A checkout session created at the gateway
#[derive(Debug, Clone)]
pub struct GatewayCheckoutSession {
    pub session_id: String,
    pub url: String,
}

/// Gateway view of a subscription after a mutation
#[derive(Debug, Clone)]
pub struct GatewaySubscription {
    pub subscription_id: String,
    pub status: String,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
}

/// Gateway view of an invoice
#[derive(Debug, Clone)]
pub struct GatewayInvoice {
    pub invoice_id: String,
    pub amount_due_cents: i64,
    pub status: Option<String>,
}

/// Payment gateway operations the billing core needs
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Create a checkout session for a plan purchase
    async fn create_checkout_session(
        &self,
        box_id: BoxId,
        price_id: &str,
        customer_id: Option<&str>,
    ) -> BillingResult<GatewayCheckoutSession>;

    /// Create or update the gateway customer for a box, returning its id
    async fn sync_customer(
        &self,
        box_id: BoxId,
        email: &str,
        name: Option<&str>,
    ) -> BillingResult<String>;

    /// Move an existing subscription to a new price
    async fn update_subscription_price(
        &self,
        subscription_id: &str,
        price_id: &str,
    ) -> BillingResult<GatewaySubscription>;

    /// Cancel a subscription, either at period end or immediately
    async fn cancel_subscription(
        &self,
        subscription_id: &str,
        at_period_end: bool,
    ) -> BillingResult<GatewaySubscription>;

    /// Revoke (immediately delete) a subscription
    async fn revoke_subscription(&self, subscription_id: &str) -> BillingResult<()>;

    /// Fetch the most recent invoice for a subscription
    async fn latest_invoice(&self, subscription_id: &str) -> BillingResult<Option<GatewayInvoice>>;
}

fn parse_ts(ts: i64) -> Option<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(ts).ok()
}

fn gateway_subscription(sub: &stripe::Subscription) -> GatewaySubscription {
    GatewaySubscription {
        subscription_id: sub.id.to_string(),
        status: sub.status.to_string(),
        current_period_start: parse_ts(sub.current_period_start),
        current_period_end: parse_ts(sub.current_period_end),
        cancel_at_period_end: sub.cancel_at_period_end,
    }
}

/// Stripe-backed gateway implementation
#[derive(Clone)]
pub struct StripeGateway {
    stripe: StripeClient,
}

impl StripeGateway {
    pub fn new(stripe: StripeClient) -> Self {
        Self { stripe }
    }
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    async fn create_checkout_session(
        &self,
        box_id: BoxId,
        price_id: &str,
        customer_id: Option<&str>,
    ) -> BillingResult<GatewayCheckoutSession> {
        let return_url = &self.stripe.config().return_url;
        let success_url = format!("{}?checkout=success", return_url);
        let cancel_url = format!("{}?checkout=canceled", return_url);

        let mut params = stripe::CreateCheckoutSession::new();
        params.mode = Some(stripe::CheckoutSessionMode::Subscription);
        params.success_url = Some(&success_url);
        params.cancel_url = Some(&cancel_url);
        params.line_items = Some(vec![stripe::CreateCheckoutSessionLineItems {
            price: Some(price_id.to_string()),
            quantity: Some(1),
            ..Default::default()
        }]);
        if let Some(customer) = customer_id {
            params.customer = Some(customer.parse().map_err(|e| {
                BillingError::ExternalService(format!("invalid customer id: {}", e))
            })?);
        }
        let mut metadata = HashMap::new();
        metadata.insert("box_id".to_string(), box_id.to_string());
        params.metadata = Some(metadata);

        let session = stripe::CheckoutSession::create(self.stripe.inner(), params).await?;

        let url = session.url.ok_or_else(|| {
            BillingError::ExternalService("checkout session has no URL".to_string())
        })?;

        tracing::info!(box_id = %box_id, session_id = %session.id, "Created checkout session");

        Ok(GatewayCheckoutSession {
            session_id: session.id.to_string(),
            url,
        })
    }

    async fn sync_customer(
        &self,
        box_id: BoxId,
        email: &str,
        name: Option<&str>,
    ) -> BillingResult<String> {
        let mut metadata = HashMap::new();
        metadata.insert("box_id".to_string(), box_id.to_string());

        let mut params = stripe::CreateCustomer::new();
        params.email = Some(email);
        params.name = name;
        params.metadata = Some(metadata);

        let customer = stripe::Customer::create(self.stripe.inner(), params).await?;

        tracing::info!(box_id = %box_id, customer_id = %customer.id, "Synced gateway customer");

        Ok(customer.id.to_string())
    }

    async fn update_subscription_price(
        &self,
        subscription_id: &str,
        price_id: &str,
    ) -> BillingResult<GatewaySubscription> {
        let sub_id: stripe::SubscriptionId = subscription_id.parse().map_err(|e| {
            BillingError::ExternalService(format!("invalid subscription id: {}", e))
        })?;

        let current = stripe::Subscription::retrieve(self.stripe.inner(), &sub_id, &[]).await?;
        let item_id = current
            .items
            .data
            .first()
            .map(|item| item.id.to_string())
            .ok_or_else(|| BillingError::ExternalService("subscription has no items".to_string()))?;

        let params = stripe::UpdateSubscription {
            items: Some(vec![stripe::UpdateSubscriptionItems {
                id: Some(item_id),
                price: Some(price_id.to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        };

        let updated = stripe::Subscription::update(self.stripe.inner(), &sub_id, params).await?;
        Ok(gateway_subscription(&updated))
    }

    async fn cancel_subscription(
        &self,
        subscription_id: &str,
        at_period_end: bool,
    ) -> BillingResult<GatewaySubscription> {
        let sub_id: stripe::SubscriptionId = subscription_id.parse().map_err(|e| {
            BillingError::ExternalService(format!("invalid subscription id: {}", e))
        })?;

        let updated = if at_period_end {
            let params = stripe::UpdateSubscription {
                cancel_at_period_end: Some(true),
                ..Default::default()
            };
            stripe::Subscription::update(self.stripe.inner(), &sub_id, params).await?
        } else {
            let params = stripe::CancelSubscription {
                cancellation_details: None,
                invoice_now: None,
                prorate: None,
            };
            stripe::Subscription::cancel(self.stripe.inner(), &sub_id, params).await?
        };

        Ok(gateway_subscription(&updated))
    }

    async fn revoke_subscription(&self, subscription_id: &str) -> BillingResult<()> {
        let sub_id: stripe::SubscriptionId = subscription_id.parse().map_err(|e| {
            BillingError::ExternalService(format!("invalid subscription id: {}", e))
        })?;

        let params = stripe::CancelSubscription {
            cancellation_details: None,
            invoice_now: None,
            prorate: None,
        };
        stripe::Subscription::cancel(self.stripe.inner(), &sub_id, params).await?;

        tracing::info!(subscription_id = %subscription_id, "Revoked gateway subscription");
        Ok(())
    }

    async fn latest_invoice(&self, subscription_id: &str) -> BillingResult<Option<GatewayInvoice>> {
        let mut params = stripe::ListInvoices::new();
        params.subscription = Some(subscription_id.parse().map_err(|e| {
            BillingError::ExternalService(format!("invalid subscription id: {}", e))
        })?);
        params.limit = Some(1);

        let invoices = stripe::Invoice::list(self.stripe.inner(), &params).await?;

        Ok(invoices
            .data
            .into_iter()
            .next()
            .map(|invoice| GatewayInvoice {
                invoice_id: invoice.id.to_string(),
                amount_due_cents: invoice.amount_due.unwrap_or(0),
                status: invoice.status.map(|s| s.to_string()),
            }))
    }
}

/// Gateway stub for tests on paths that never reach the gateway
#[cfg(test)]
pub(crate) struct UnreachableGateway;

#[cfg(test)]
#[async_trait]
impl PaymentGateway for UnreachableGateway {
    async fn create_checkout_session(
        &self,
        _box_id: BoxId,
        _price_id: &str,
        _customer_id: Option<&str>,
    ) -> BillingResult<GatewayCheckoutSession> {
        Err(BillingError::ExternalService(
            "gateway not available in this test".to_string(),
        ))
    }

    async fn sync_customer(
        &self,
        _box_id: BoxId,
        _email: &str,
        _name: Option<&str>,
    ) -> BillingResult<String> {
        Err(BillingError::ExternalService(
            "gateway not available in this test".to_string(),
        ))
    }

    async fn update_subscription_price(
        &self,
        _subscription_id: &str,
        _price_id: &str,
    ) -> BillingResult<GatewaySubscription> {
        Err(BillingError::ExternalService(
            "gateway not available in this test".to_string(),
        ))
    }

    async fn cancel_subscription(
        &self,
        _subscription_id: &str,
        _at_period_end: bool,
    ) -> BillingResult<GatewaySubscription> {
        Err(BillingError::ExternalService(
            "gateway not available in this test".to_string(),
        ))
    }

    async fn revoke_subscription(&self, _subscription_id: &str) -> BillingResult<()> {
        Err(BillingError::ExternalService(
            "gateway not available in this test".to_string(),
        ))
    }

    async fn latest_invoice(
        &self,
        _subscription_id: &str,
    ) -> BillingResult<Option<GatewayInvoice>> {
        Err(BillingError::ExternalService(
            "gateway not available in this test".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_with_timeout_passes_results_through() {
        let ok = with_timeout(Duration::from_secs(1), async { Ok(7_i64) }).await;
        assert_eq!(ok.unwrap(), 7);

        let err: BillingResult<()> = with_timeout(Duration::from_secs(1), async {
            Err(BillingError::ExternalService("card declined".to_string()))
        })
        .await;
        match err {
            Err(BillingError::ExternalService(msg)) => assert_eq!(msg, "card declined"),
            other => panic!("expected gateway error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_with_timeout_bounds_stuck_calls() {
        let result: BillingResult<()> = with_timeout(
            Duration::from_millis(10),
            std::future::pending::<BillingResult<()>>(),
        )
        .await;
        match result {
            Err(BillingError::ExternalService(msg)) => assert!(msg.contains("timed out")),
            other => panic!("expected timeout error, got {:?}", other),
        }
    }
}
