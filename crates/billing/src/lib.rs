// Billing crate clippy configuration
// These are intentional patterns in this crate:
#![allow(clippy::too_many_arguments)] // Audit records and gateway upserts carry many fields
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! BoxHQ Billing Module
//!
//! Subscription lifecycle engine for gym boxes: Stripe integration, usage
//! metering against plan limits, overage billing and plan changes.
//!
//! ## Features
//!
//! - **Event Store & Router**: Durable, idempotent ingestion of gateway events
//! - **Subscription State Machine**: Status transitions with side effects
//! - **Grace Periods**: Policy-driven windows before enforcement bites
//! - **Usage Ledger**: Per-role member counts against plan limits
//! - **Overage Billing**: Monthly charges for seats above the plan
//! - **Plan Changes**: Request/approve workflow with proration
//! - **Invariants**: Runnable consistency checks over the billing tables

pub mod client;
pub mod error;
pub mod events;
pub mod gateway;
pub mod grace;
pub mod invariants;
pub mod notify;
pub mod overage;
pub mod plans;
pub mod proration;
pub mod router;
pub mod subscriptions;
pub mod usage;

#[cfg(test)]
mod edge_case_tests;

// Client
pub use client::{StripeClient, StripeConfig};

// Error
pub use error::{BillingError, BillingResult};

// Events
pub use events::{BillingEvent, ClaimOutcome, EventStore, MAX_EVENT_RETRIES};

// Router
pub use router::{EventKind, EventRouter, InboundEvent, RetryResult, RouterOutcome};

// Gateway
pub use gateway::{
    with_timeout, GatewayCheckoutSession, GatewayInvoice, GatewaySubscription, PaymentGateway,
    StripeGateway, GATEWAY_CALL_TIMEOUT,
};

// Grace
pub use grace::{
    grace_policy, GraceOverrides, GracePeriod, GracePeriodService, GraceReason, GraceSeverity,
    OpenGraceResult,
};

// Notifications
pub use notify::{
    DbNotificationDispatcher, NoopNotificationDispatcher, NotificationDispatcher,
    NotificationPriority, NotificationRequest,
};

// Plans
pub use plans::{Plan, PlanService, DEFAULT_OVERAGE_RATE_CENTS};

// Subscriptions
pub use subscriptions::{
    project_box_status, ChangeType, Subscription, SubscriptionService, SubscriptionStatus,
    TransitionContext, TransitionOutcome,
};

// Usage
pub use usage::{
    BoxBillingProfile, BoxUsage, EnforcementOutcome, RoleUsage, UsageEventInput, UsageService,
};

// Overage
pub use overage::{
    calculate_overage, calculate_overage_for_period, OverageBilling, OverageLineItem,
    OverageOutcome, OverageRunSummary, OverageService, TenantOverageResult,
};

// Proration
pub use proration::{
    prorated_amount, PlanChangeKind, PlanChangeRequest, PlanChangeResult, PlanChangeService,
    ProrationType,
};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

use sqlx::PgPool;
use std::sync::Arc;

/// Main billing service that combines all billing functionality
pub struct BillingService {
    pub events: EventStore,
    pub router: EventRouter,
    pub subscriptions: SubscriptionService,
    pub grace: GracePeriodService,
    pub usage: UsageService,
    pub overage: OverageService,
    pub plans: PlanService,
    pub plan_changes: PlanChangeService,
    pub invariants: InvariantChecker,
}

impl BillingService {
    /// Create a new billing service from environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let stripe = StripeClient::from_env()?;
        Ok(Self::build(stripe, pool))
    }

    /// Create a new billing service with explicit config
    pub fn new(config: StripeConfig, pool: PgPool) -> Self {
        Self::build(StripeClient::new(config), pool)
    }

    fn build(stripe: StripeClient, pool: PgPool) -> Self {
        let gateway: Arc<dyn PaymentGateway> = Arc::new(StripeGateway::new(stripe));
        let notifier: Arc<dyn NotificationDispatcher> =
            Arc::new(DbNotificationDispatcher::new(pool.clone()));

        let events = EventStore::new(pool.clone());
        let plans = PlanService::new(pool.clone());
        let grace = GracePeriodService::new(pool.clone(), notifier.clone());
        let subscriptions =
            SubscriptionService::new(pool.clone(), grace.clone(), gateway.clone());
        let usage = UsageService::new(
            pool.clone(),
            plans.clone(),
            grace.clone(),
            notifier.clone(),
        );
        let overage = OverageService::new(pool.clone(), usage.clone(), notifier);
        let plan_changes = PlanChangeService::new(
            pool.clone(),
            plans.clone(),
            subscriptions.clone(),
            grace.clone(),
            gateway,
        );
        let router = EventRouter::new(
            pool.clone(),
            events.clone(),
            subscriptions.clone(),
            plans.clone(),
        );
        let invariants = InvariantChecker::new(pool);

        Self {
            events,
            router,
            subscriptions,
            grace,
            usage,
            overage,
            plans,
            plan_changes,
            invariants,
        }
    }
}
