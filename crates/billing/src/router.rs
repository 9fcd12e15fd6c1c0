//! Event router
//!
//! Bridges raw gateway webhook events into the billing core: claim through
//! the event store, resolve the box the event belongs to, dispatch on the
//! typed event kind, and finalize the stored record. Unknown event types
//! are recorded as unhandled without error; handler failures mark the event
//! failed and stay eligible for retry.

use serde::Deserialize;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use boxhq_shared::BoxId;

use crate::error::{BillingError, BillingResult};
use crate::events::{BillingEvent, ClaimOutcome, EventStore};
use crate::plans::PlanService;
use crate::subscriptions::{
    SubscriptionService, SubscriptionStatus, TransitionContext,
};

/// A raw inbound event from the payment gateway
#[derive(Debug, Clone, Deserialize)]
pub struct InboundEvent {
    /// Provider event id, the dedup key
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    /// Provider payload; `data.object` carries the affected resource
    pub data: serde_json::Value,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Typed event kinds the router dispatches on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    CheckoutCompleted,
    SubscriptionCreated,
    SubscriptionUpdated,
    SubscriptionCanceled,
    SubscriptionRevoked,
    CustomerUpdated,
    PaymentSucceeded,
    PaymentFailed,
    Unknown,
}

impl EventKind {
    pub fn parse(event_type: &str) -> Self {
        match event_type {
            "checkout.session.completed" => EventKind::CheckoutCompleted,
            "customer.subscription.created" => EventKind::SubscriptionCreated,
            "customer.subscription.updated" => EventKind::SubscriptionUpdated,
            "customer.subscription.deleted" => EventKind::SubscriptionCanceled,
            "customer.subscription.revoked" => EventKind::SubscriptionRevoked,
            "customer.updated" => EventKind::CustomerUpdated,
            "invoice.payment_succeeded" | "invoice.paid" => EventKind::PaymentSucceeded,
            "invoice.payment_failed" => EventKind::PaymentFailed,
            _ => EventKind::Unknown,
        }
    }
}

/// The resource fields the router reads from `data.object`.
/// Unknown keys are ignored; every field is optional because payload shape
/// varies per event type.
#[derive(Debug, Clone, Default, Deserialize)]
struct EventObject {
    id: Option<String>,
    customer: Option<String>,
    subscription: Option<String>,
    status: Option<String>,
    current_period_start: Option<i64>,
    current_period_end: Option<i64>,
    #[serde(default)]
    metadata: serde_json::Value,
    plan: Option<EventPlan>,
}

#[derive(Debug, Clone, Deserialize)]
struct EventPlan {
    id: Option<String>,
    amount: Option<i64>,
}

impl EventObject {
    fn from_event(event: &InboundEvent) -> Self {
        event
            .data
            .get("object")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default()
    }

    fn box_id_from_metadata(&self) -> Option<BoxId> {
        self.metadata
            .get("box_id")
            .and_then(|v| v.as_str())
            .and_then(|s| Uuid::parse_str(s).ok())
            .map(BoxId::from)
    }
}

/// Outcome of ingesting one event
#[derive(Debug, Clone)]
pub enum RouterOutcome {
    /// Event ran; `handled = false` means the type was not ours
    Processed { event_id: Uuid, handled: bool },
    /// Duplicate delivery of an already-processed event
    Duplicate { event_id: Uuid },
}

/// Per-event result of a retry pass
#[derive(Debug)]
pub struct RetryResult {
    pub external_id: String,
    pub result: BillingResult<RouterOutcome>,
}

/// Routes inbound gateway events to the billing services
#[derive(Clone)]
pub struct EventRouter {
    pool: PgPool,
    store: EventStore,
    subscriptions: SubscriptionService,
    plans: PlanService,
}

impl EventRouter {
    pub fn new(
        pool: PgPool,
        store: EventStore,
        subscriptions: SubscriptionService,
        plans: PlanService,
    ) -> Self {
        Self {
            pool,
            store,
            subscriptions,
            plans,
        }
    }

    /// Ingest one event: claim, resolve, dispatch, finalize.
    ///
    /// Handler errors mark the stored event failed and propagate to the
    /// caller, so the gateway retries the delivery and the worker retries
    /// the stored record.
    pub async fn ingest(&self, event: InboundEvent) -> BillingResult<RouterOutcome> {
        let payload = serde_json::json!({
            "data": event.data,
            "metadata": event.metadata,
        });

        let claimed = match self.store.claim(&event.id, &event.event_type, &payload).await? {
            ClaimOutcome::AlreadyProcessed(record) => {
                return Ok(RouterOutcome::Duplicate {
                    event_id: record.id,
                });
            }
            ClaimOutcome::Claimed(record) => record,
        };

        match self.dispatch(&event).await {
            Ok(handled) => {
                self.store.mark_processed(claimed.id, handled).await?;
                tracing::info!(
                    external_id = %event.id,
                    event_type = %event.event_type,
                    handled = handled,
                    "Processed billing event"
                );
                Ok(RouterOutcome::Processed {
                    event_id: claimed.id,
                    handled,
                })
            }
            Err(e) => {
                tracing::error!(
                    external_id = %event.id,
                    event_type = %event.event_type,
                    error = %e,
                    "Billing event handler failed"
                );
                self.store.mark_failed(claimed.id, &e.to_string()).await?;
                Err(e)
            }
        }
    }

    /// Re-run stored failed events still within `max_retries`.
    /// Each event is independent; one failure never stops the pass.
    pub async fn retry_failed(&self, max_retries: i32) -> BillingResult<Vec<RetryResult>> {
        let failed = self.store.failed_events(max_retries).await?;
        let mut results = Vec::with_capacity(failed.len());

        for record in failed {
            let result = self.retry_one(&record).await;
            if let Err(e) = &result {
                tracing::warn!(
                    external_id = %record.external_id,
                    retry_count = record.retry_count,
                    error = %e,
                    "Event retry failed"
                );
            }
            results.push(RetryResult {
                external_id: record.external_id,
                result,
            });
        }

        Ok(results)
    }

    async fn retry_one(&self, record: &BillingEvent) -> BillingResult<RouterOutcome> {
        let data = record
            .payload
            .get("data")
            .cloned()
            .unwrap_or(serde_json::Value::Null);
        let metadata = record
            .payload
            .get("metadata")
            .cloned()
            .unwrap_or(serde_json::Value::Null);

        self.ingest(InboundEvent {
            id: record.external_id.clone(),
            event_type: record.event_type.clone(),
            data,
            metadata,
        })
        .await
    }

    /// Dispatch a claimed event. Returns whether the type was handled.
    async fn dispatch(&self, event: &InboundEvent) -> BillingResult<bool> {
        let kind = EventKind::parse(&event.event_type);
        let object = EventObject::from_event(event);

        match kind {
            EventKind::Unknown => {
                tracing::debug!(
                    event_type = %event.event_type,
                    "Ignoring unhandled event type"
                );
                Ok(false)
            }
            EventKind::CustomerUpdated => {
                self.handle_customer_updated(&object).await?;
                Ok(true)
            }
            EventKind::CheckoutCompleted => {
                self.handle_checkout_completed(event, &object).await?;
                Ok(true)
            }
            EventKind::SubscriptionCreated | EventKind::SubscriptionUpdated => {
                self.handle_subscription_sync(event, &object).await?;
                Ok(true)
            }
            EventKind::SubscriptionCanceled => {
                self.handle_status_event(event, &object, SubscriptionStatus::Canceled, "gateway_cancellation")
                    .await?;
                Ok(true)
            }
            EventKind::SubscriptionRevoked => {
                self.handle_status_event(event, &object, SubscriptionStatus::Canceled, "gateway_revocation")
                    .await?;
                Ok(true)
            }
            EventKind::PaymentSucceeded => {
                self.handle_status_event(event, &object, SubscriptionStatus::Active, "payment_succeeded")
                    .await?;
                Ok(true)
            }
            EventKind::PaymentFailed => {
                self.handle_status_event(event, &object, SubscriptionStatus::PastDue, "payment_failed")
                    .await?;
                Ok(true)
            }
        }
    }

    /// Resolve the box an event belongs to: explicit `metadata.box_id`
    /// first, then the customer id, then the subscription id.
    async fn resolve_box_id(
        &self,
        event: &InboundEvent,
        object: &EventObject,
    ) -> BillingResult<Option<BoxId>> {
        if let Some(box_id) = object.box_id_from_metadata() {
            return Ok(Some(box_id));
        }
        if let Some(box_id) = event
            .metadata
            .get("box_id")
            .and_then(|v| v.as_str())
            .and_then(|s| Uuid::parse_str(s).ok())
        {
            return Ok(Some(BoxId::from(box_id)));
        }

        if let Some(customer) = object.customer.as_deref() {
            let found: Option<BoxId> =
                sqlx::query_scalar("SELECT id FROM boxes WHERE stripe_customer_id = $1")
                    .bind(customer)
                    .fetch_optional(&self.pool)
                    .await?;
            if found.is_some() {
                return Ok(found);
            }
        }

        // Invoice events reference the subscription; subscription events
        // carry it as the object id.
        let subscription_id = object.subscription.as_deref().or(object.id.as_deref());
        if let Some(subscription_id) = subscription_id {
            if let Some(sub) = self.subscriptions.find_by_external_id(subscription_id).await? {
                return Ok(Some(sub.box_id));
            }
        }

        Ok(None)
    }

    async fn handle_customer_updated(&self, object: &EventObject) -> BillingResult<()> {
        let (Some(customer_id), Some(box_id)) = (object.id.as_deref(), object.box_id_from_metadata())
        else {
            tracing::debug!("Customer update without box metadata, nothing to sync");
            return Ok(());
        };

        sqlx::query("UPDATE boxes SET stripe_customer_id = $2, updated_at = NOW() WHERE id = $1")
            .bind(box_id)
            .bind(customer_id)
            .execute(&self.pool)
            .await?;

        tracing::info!(box_id = %box_id, customer_id = %customer_id, "Linked gateway customer");
        Ok(())
    }

    /// Checkout completion: link the customer and let the follow-up
    /// subscription.created event carry the full subscription state.
    async fn handle_checkout_completed(
        &self,
        event: &InboundEvent,
        object: &EventObject,
    ) -> BillingResult<()> {
        let box_id = self
            .resolve_box_id(event, object)
            .await?
            .ok_or_else(|| BillingError::InvalidEvent("checkout event has no resolvable box".to_string()))?;

        if let Some(customer) = object.customer.as_deref() {
            sqlx::query(
                "UPDATE boxes SET stripe_customer_id = $2, updated_at = NOW() WHERE id = $1",
            )
            .bind(box_id)
            .bind(customer)
            .execute(&self.pool)
            .await?;
        }

        tracing::info!(
            box_id = %box_id,
            session_id = ?object.id,
            subscription_id = ?object.subscription,
            "Checkout completed"
        );
        Ok(())
    }

    /// Subscription created/updated: upsert the local row from gateway
    /// state, running status-transition side effects when the status moved.
    async fn handle_subscription_sync(
        &self,
        event: &InboundEvent,
        object: &EventObject,
    ) -> BillingResult<()> {
        let external_id = object
            .id
            .as_deref()
            .ok_or_else(|| BillingError::InvalidEvent("subscription event without id".to_string()))?;
        let box_id = self
            .resolve_box_id(event, object)
            .await?
            .ok_or_else(|| {
                BillingError::InvalidEvent(format!(
                    "subscription {} has no resolvable box",
                    external_id
                ))
            })?;

        let status = object
            .status
            .as_deref()
            .and_then(SubscriptionStatus::parse)
            .ok_or_else(|| {
                BillingError::InvalidEvent(format!(
                    "subscription event with unrecognized status {:?}",
                    object.status
                ))
            })?;

        // Transition first so side effects see the old status; the upsert
        // then refreshes period bounds and amounts.
        self.subscriptions
            .transition(
                box_id,
                status,
                TransitionContext {
                    external_event_id: Some(event.id.clone()),
                    ..Default::default()
                },
            )
            .await?;

        let plan = match object.plan.as_ref().and_then(|p| p.id.as_deref()) {
            Some(price_id) => self.plans.plan_by_stripe_price(price_id).await?,
            None => None,
        };
        let existing = self.subscriptions.find_by_external_id(external_id).await?;
        let plan_id = plan
            .as_ref()
            .map(|p| p.id)
            .or(existing.as_ref().map(|s| s.plan_id));

        let Some(plan_id) = plan_id else {
            return Err(BillingError::InvalidEvent(format!(
                "subscription {} has no resolvable plan",
                external_id
            )));
        };

        let now = OffsetDateTime::now_utc();
        let period_start = object
            .current_period_start
            .and_then(|ts| OffsetDateTime::from_unix_timestamp(ts).ok())
            .unwrap_or(now);
        let period_end = object
            .current_period_end
            .and_then(|ts| OffsetDateTime::from_unix_timestamp(ts).ok())
            .unwrap_or(now);
        let amount_cents = object
            .plan
            .as_ref()
            .and_then(|p| p.amount)
            .or(plan.as_ref().map(|p| p.monthly_price_cents))
            .unwrap_or(0);

        self.subscriptions
            .upsert_from_gateway(
                box_id,
                plan_id,
                status,
                period_start,
                period_end,
                amount_cents,
                external_id,
                object.customer.as_deref(),
            )
            .await?;

        Ok(())
    }

    /// Pure status event (payment results, cancellations). A missing box is
    /// tolerated: the event is for a tenant we no longer track.
    async fn handle_status_event(
        &self,
        event: &InboundEvent,
        object: &EventObject,
        status: SubscriptionStatus,
        reason: &str,
    ) -> BillingResult<()> {
        let Some(box_id) = self.resolve_box_id(event, object).await? else {
            tracing::warn!(
                external_id = %event.id,
                event_type = %event.event_type,
                "Status event has no resolvable box, skipping"
            );
            return Ok(());
        };

        self.subscriptions
            .transition(
                box_id,
                status,
                TransitionContext {
                    external_event_id: Some(event.id.clone()),
                    reason: Some(reason.to_string()),
                    ..Default::default()
                },
            )
            .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_kind_parse() {
        assert_eq!(
            EventKind::parse("customer.subscription.updated"),
            EventKind::SubscriptionUpdated
        );
        assert_eq!(
            EventKind::parse("invoice.payment_failed"),
            EventKind::PaymentFailed
        );
        assert_eq!(EventKind::parse("invoice.paid"), EventKind::PaymentSucceeded);
        assert_eq!(EventKind::parse("charge.refunded"), EventKind::Unknown);
    }

    #[test]
    fn test_object_box_id_from_metadata() {
        let box_id = Uuid::new_v4();
        let event = InboundEvent {
            id: "evt_1".to_string(),
            event_type: "customer.subscription.updated".to_string(),
            data: serde_json::json!({
                "object": {
                    "id": "sub_123",
                    "status": "active",
                    "metadata": { "box_id": box_id.to_string() }
                }
            }),
            metadata: serde_json::Value::Null,
        };

        let object = EventObject::from_event(&event);
        assert_eq!(object.id.as_deref(), Some("sub_123"));
        assert_eq!(object.box_id_from_metadata(), Some(BoxId::from(box_id)));
    }

    #[test]
    fn test_object_tolerates_unknown_shape() {
        let event = InboundEvent {
            id: "evt_2".to_string(),
            event_type: "charge.refunded".to_string(),
            data: serde_json::json!({ "object": { "amount": "not-a-number" } }),
            metadata: serde_json::Value::Null,
        };
        let object = EventObject::from_event(&event);
        assert!(object.id.is_none());
        assert!(object.box_id_from_metadata().is_none());
    }
}
