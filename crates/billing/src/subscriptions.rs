//! Subscription state machine
//!
//! Owns the canonical subscription status per box and the side effects of
//! each transition: grace periods, the coarser box-visible status projection
//! and the immutable `subscription_changes` audit trail.
//!
//! Transitions are idempotent in effect. Inbound gateway events can arrive
//! duplicated or out of causal order, so re-applying the current status is a
//! no-op and ordering-sensitive fields are simply overwritten by the latest
//! processed event.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::sync::Arc;
use time::OffsetDateTime;
use uuid::Uuid;

use boxhq_shared::{BoxId, BoxStatus, UserId};

use crate::error::{BillingError, BillingResult};
use crate::gateway::{with_timeout, PaymentGateway, GATEWAY_CALL_TIMEOUT};
use crate::grace::{GraceOverrides, GracePeriodService, GraceReason};

/// Subscription lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Trial,
    Active,
    PastDue,
    Canceled,
    Incomplete,
    Paused,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Trial => "trial",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Canceled => "canceled",
            SubscriptionStatus::Incomplete => "incomplete",
            SubscriptionStatus::Paused => "paused",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "trial" | "trialing" => Some(SubscriptionStatus::Trial),
            "active" => Some(SubscriptionStatus::Active),
            "past_due" => Some(SubscriptionStatus::PastDue),
            "canceled" | "cancelled" => Some(SubscriptionStatus::Canceled),
            "incomplete" | "incomplete_expired" => Some(SubscriptionStatus::Incomplete),
            "paused" => Some(SubscriptionStatus::Paused),
            _ => None,
        }
    }

    /// Terminal for the subscription row; the box can still start a new one
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Canceled | SubscriptionStatus::Incomplete
        )
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Box-visible projection of a subscription status.
///
/// `past_due` stays `active` while its payment-failed grace period runs;
/// terminal statuses suspend the box.
pub fn project_box_status(status: SubscriptionStatus) -> BoxStatus {
    match status {
        SubscriptionStatus::Trial => BoxStatus::Trial,
        SubscriptionStatus::Active | SubscriptionStatus::PastDue => BoxStatus::Active,
        SubscriptionStatus::Canceled
        | SubscriptionStatus::Incomplete
        | SubscriptionStatus::Paused => BoxStatus::Suspended,
    }
}

/// A subscription row
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Subscription {
    pub id: Uuid,
    pub box_id: BoxId,
    pub plan_id: Uuid,
    pub status: String,
    pub current_period_start: OffsetDateTime,
    pub current_period_end: OffsetDateTime,
    pub cancel_at_period_end: bool,
    pub canceled_at: Option<OffsetDateTime>,
    pub amount_cents: i64,
    pub stripe_subscription_id: Option<String>,
    pub stripe_customer_id: Option<String>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl Subscription {
    pub fn status_enum(&self) -> Option<SubscriptionStatus> {
        SubscriptionStatus::parse(&self.status)
    }
}

/// Context carried into a transition for the audit trail
#[derive(Debug, Clone, Default)]
pub struct TransitionContext {
    pub external_event_id: Option<String>,
    pub actor: Option<UserId>,
    pub reason: Option<String>,
    /// Set when the caller writes its own audit record for this change,
    /// so one logical act stays one row in `subscription_changes`
    pub skip_audit: bool,
}

/// Outcome of a transition call
#[derive(Debug, Clone)]
pub enum TransitionOutcome {
    /// Status changed and side effects ran
    Applied(Subscription),
    /// Subscription already had the target status; nothing to do
    Unchanged(Subscription),
    /// No live subscription exists for this box
    NoActiveSubscription,
}

/// Kinds of audit record written to `subscription_changes`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeType {
    StatusTransition,
    Cancellation,
    Reactivation,
    PlanChange,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::StatusTransition => "status_transition",
            ChangeType::Cancellation => "cancellation",
            ChangeType::Reactivation => "reactivation",
            ChangeType::PlanChange => "plan_change",
        }
    }
}

/// Subscription service: the state machine plus cancellation/reactivation
#[derive(Clone)]
pub struct SubscriptionService {
    pool: PgPool,
    grace: GracePeriodService,
    gateway: Arc<dyn PaymentGateway>,
}

impl SubscriptionService {
    pub fn new(pool: PgPool, grace: GracePeriodService, gateway: Arc<dyn PaymentGateway>) -> Self {
        Self {
            pool,
            grace,
            gateway,
        }
    }

    /// The box's live subscription, if any (terminal rows excluded)
    pub async fn live_subscription(&self, box_id: BoxId) -> BillingResult<Option<Subscription>> {
        Ok(sqlx::query_as::<_, Subscription>(
            r#"
            SELECT * FROM subscriptions
            WHERE box_id = $1 AND status IN ('trial', 'active', 'past_due', 'paused')
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(box_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    /// Most recent subscription row regardless of status
    pub async fn latest_subscription(&self, box_id: BoxId) -> BillingResult<Option<Subscription>> {
        Ok(sqlx::query_as::<_, Subscription>(
            "SELECT * FROM subscriptions WHERE box_id = $1 ORDER BY created_at DESC LIMIT 1",
        )
        .bind(box_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    pub async fn find_by_external_id(
        &self,
        stripe_subscription_id: &str,
    ) -> BillingResult<Option<Subscription>> {
        Ok(sqlx::query_as::<_, Subscription>(
            "SELECT * FROM subscriptions WHERE stripe_subscription_id = $1",
        )
        .bind(stripe_subscription_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    /// Upsert a subscription from gateway state, keyed on the external
    /// subscription id. Used on checkout completion and gateway sync events;
    /// the partial unique index keeps a second concurrent checkout from
    /// producing two active rows.
    #[allow(clippy::too_many_arguments)]
    pub async fn upsert_from_gateway(
        &self,
        box_id: BoxId,
        plan_id: Uuid,
        status: SubscriptionStatus,
        period_start: OffsetDateTime,
        period_end: OffsetDateTime,
        amount_cents: i64,
        stripe_subscription_id: &str,
        stripe_customer_id: Option<&str>,
    ) -> BillingResult<Subscription> {
        let subscription: Subscription = sqlx::query_as(
            r#"
            INSERT INTO subscriptions (
                box_id, plan_id, status, current_period_start, current_period_end,
                amount_cents, stripe_subscription_id, stripe_customer_id
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (stripe_subscription_id) DO UPDATE SET
                plan_id = EXCLUDED.plan_id,
                status = EXCLUDED.status,
                current_period_start = EXCLUDED.current_period_start,
                current_period_end = EXCLUDED.current_period_end,
                amount_cents = EXCLUDED.amount_cents,
                stripe_customer_id = EXCLUDED.stripe_customer_id,
                updated_at = NOW()
            RETURNING *
            "#,
        )
        .bind(box_id)
        .bind(plan_id)
        .bind(status.as_str())
        .bind(period_start)
        .bind(period_end)
        .bind(amount_cents)
        .bind(stripe_subscription_id)
        .bind(stripe_customer_id)
        .fetch_one(&self.pool)
        .await?;

        self.sync_box_status(box_id, project_box_status(status)).await?;

        tracing::info!(
            box_id = %box_id,
            subscription_id = %subscription.id,
            status = %status,
            "Upserted subscription from gateway"
        );

        Ok(subscription)
    }

    /// Apply a status transition for a box.
    ///
    /// No-ops with an explicit outcome when there is no live subscription or
    /// when the status already matches (duplicate or stale event).
    pub async fn transition(
        &self,
        box_id: BoxId,
        new_status: SubscriptionStatus,
        ctx: TransitionContext,
    ) -> BillingResult<TransitionOutcome> {
        // Entering active may revive a terminal row (payment recovered after
        // cancellation); every other transition needs a live subscription.
        let subscription = if new_status == SubscriptionStatus::Active {
            self.latest_subscription(box_id).await?
        } else {
            self.live_subscription(box_id).await?
        };

        let Some(subscription) = subscription else {
            tracing::info!(
                box_id = %box_id,
                new_status = %new_status,
                "Transition requested but box has no subscription"
            );
            return Ok(TransitionOutcome::NoActiveSubscription);
        };

        let old_status = subscription.status_enum();
        if old_status == Some(new_status) {
            tracing::debug!(
                box_id = %box_id,
                status = %new_status,
                "Subscription already in target status"
            );
            return Ok(TransitionOutcome::Unchanged(subscription));
        }

        let updated: Subscription = sqlx::query_as(
            r#"
            UPDATE subscriptions
            SET status = $2,
                canceled_at = CASE WHEN $2 = 'canceled' THEN NOW() ELSE canceled_at END,
                updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(subscription.id)
        .bind(new_status.as_str())
        .fetch_one(&self.pool)
        .await?;

        self.sync_box_status(box_id, project_box_status(new_status)).await?;

        if !ctx.skip_audit {
            self.record_change(
                box_id,
                subscription.id,
                ChangeType::StatusTransition,
                subscription.plan_id,
                subscription.plan_id,
                old_status.map(|s| s.as_str().to_string()),
                Some(new_status.as_str().to_string()),
                OffsetDateTime::now_utc(),
                None,
                ctx.actor,
                ctx.reason.as_deref(),
            )
            .await?;
        }

        self.run_transition_effects(box_id, new_status, &ctx).await?;

        tracing::info!(
            box_id = %box_id,
            from = ?old_status,
            to = %new_status,
            external_event_id = ?ctx.external_event_id,
            "Subscription status transition"
        );

        Ok(TransitionOutcome::Applied(updated))
    }

    /// Per-transition side effects
    async fn run_transition_effects(
        &self,
        box_id: BoxId,
        new_status: SubscriptionStatus,
        ctx: &TransitionContext,
    ) -> BillingResult<()> {
        match new_status {
            SubscriptionStatus::PastDue => {
                self.grace
                    .open(box_id, GraceReason::PaymentFailed, GraceOverrides::default())
                    .await?;
            }
            SubscriptionStatus::Canceled => {
                self.grace
                    .open(
                        box_id,
                        GraceReason::SubscriptionCanceled,
                        GraceOverrides::default(),
                    )
                    .await?;
            }
            SubscriptionStatus::Active => {
                self.grace
                    .resolve_for_reasons(
                        box_id,
                        &[GraceReason::PaymentFailed, GraceReason::BillingIssue],
                        "payment_received",
                        ctx.actor,
                    )
                    .await?;
            }
            _ => {}
        }
        Ok(())
    }

    /// Cancel a box's subscription.
    ///
    /// Immediate cancellation transitions to `canceled` now (opening the
    /// blocking grace period); deferred cancellation keeps the subscription
    /// logically active until the period boundary, with the audit record
    /// carrying the period end as the effective date.
    pub async fn cancel(
        &self,
        box_id: BoxId,
        cancel_at_period_end: bool,
        reason: Option<&str>,
        actor: Option<UserId>,
    ) -> BillingResult<Subscription> {
        let subscription = self.live_subscription(box_id).await?.ok_or_else(|| {
            BillingError::NotFound(format!("no active subscription for box {}", box_id))
        })?;

        // Gateway first: a failed gateway call must not leave local state
        // half-canceled. ExternalService errors are retryable by the caller.
        if let Some(external_id) = subscription.stripe_subscription_id.as_deref() {
            with_timeout(
                GATEWAY_CALL_TIMEOUT,
                self.gateway
                    .cancel_subscription(external_id, cancel_at_period_end),
            )
            .await?;
        }

        let updated: Subscription = sqlx::query_as(
            r#"
            UPDATE subscriptions
            SET cancel_at_period_end = $2, updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(subscription.id)
        .bind(cancel_at_period_end)
        .fetch_one(&self.pool)
        .await?;

        let effective_date = if cancel_at_period_end {
            subscription.current_period_end
        } else {
            OffsetDateTime::now_utc()
        };

        self.record_change(
            box_id,
            subscription.id,
            ChangeType::Cancellation,
            subscription.plan_id,
            subscription.plan_id,
            Some(subscription.status.clone()),
            Some(SubscriptionStatus::Canceled.as_str().to_string()),
            effective_date,
            None,
            actor,
            reason,
        )
        .await?;

        let result = if cancel_at_period_end {
            tracing::info!(
                box_id = %box_id,
                subscription_id = %subscription.id,
                effective_date = %effective_date,
                "Scheduled cancellation at period end"
            );
            updated
        } else {
            match self
                .transition(
                    box_id,
                    SubscriptionStatus::Canceled,
                    TransitionContext {
                        actor,
                        reason: reason.map(|r| r.to_string()),
                        skip_audit: true,
                        ..Default::default()
                    },
                )
                .await?
            {
                TransitionOutcome::Applied(sub) | TransitionOutcome::Unchanged(sub) => sub,
                TransitionOutcome::NoActiveSubscription => updated,
            }
        };

        Ok(result)
    }

    /// Reverse a pending cancellation or a terminal `canceled` status.
    ///
    /// Clears the cancellation flags, transitions to `active` and resolves
    /// the cancellation-related grace periods.
    pub async fn reactivate(
        &self,
        box_id: BoxId,
        actor: Option<UserId>,
    ) -> BillingResult<Subscription> {
        let subscription = self.latest_subscription(box_id).await?.ok_or_else(|| {
            BillingError::NotFound(format!("no subscription for box {}", box_id))
        })?;

        let pending_cancellation = subscription.cancel_at_period_end;
        let terminal = subscription
            .status_enum()
            .map(|s| s == SubscriptionStatus::Canceled)
            .unwrap_or(false);

        if !pending_cancellation && !terminal {
            return Err(BillingError::InvalidState(format!(
                "subscription for box {} is not canceled or pending cancellation",
                box_id
            )));
        }

        if let Some(external_id) = subscription.stripe_subscription_id.as_deref() {
            if pending_cancellation && !terminal {
                // Still live at the gateway: just undo cancel_at_period_end
                with_timeout(
                    GATEWAY_CALL_TIMEOUT,
                    self.gateway.cancel_subscription(external_id, false),
                )
                .await
                .map_err(|e| {
                    tracing::error!(box_id = %box_id, error = %e, "Gateway reactivation failed");
                    e
                })?;
            }
        }

        let updated: Subscription = sqlx::query_as(
            r#"
            UPDATE subscriptions
            SET cancel_at_period_end = false,
                canceled_at = NULL,
                updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(subscription.id)
        .fetch_one(&self.pool)
        .await?;

        let updated = match self
            .transition(
                box_id,
                SubscriptionStatus::Active,
                TransitionContext {
                    actor,
                    reason: Some("reactivation".to_string()),
                    skip_audit: true,
                    ..Default::default()
                },
            )
            .await?
        {
            TransitionOutcome::Applied(sub) | TransitionOutcome::Unchanged(sub) => sub,
            TransitionOutcome::NoActiveSubscription => updated,
        };

        self.grace
            .resolve_for_reasons(
                box_id,
                &[GraceReason::SubscriptionCanceled, GraceReason::BillingIssue],
                "subscription_reactivated",
                actor,
            )
            .await?;

        self.record_change(
            box_id,
            subscription.id,
            ChangeType::Reactivation,
            subscription.plan_id,
            subscription.plan_id,
            Some(subscription.status.clone()),
            Some(SubscriptionStatus::Active.as_str().to_string()),
            OffsetDateTime::now_utc(),
            None,
            actor,
            Some("reactivation"),
        )
        .await?;

        tracing::info!(
            box_id = %box_id,
            subscription_id = %subscription.id,
            "Reactivated subscription"
        );

        Ok(updated)
    }

    /// Make deferred cancellations effective once their period has lapsed.
    /// Run hourly by the worker; each box is processed independently.
    pub async fn process_period_end_cancellations(&self) -> BillingResult<usize> {
        let due: Vec<Subscription> = sqlx::query_as(
            r#"
            SELECT * FROM subscriptions
            WHERE cancel_at_period_end = true
              AND current_period_end <= NOW()
              AND status NOT IN ('canceled', 'incomplete')
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut processed = 0;
        for subscription in due {
            let result = self
                .transition(
                    subscription.box_id,
                    SubscriptionStatus::Canceled,
                    TransitionContext {
                        reason: Some("period_end_cancellation".to_string()),
                        ..Default::default()
                    },
                )
                .await;

            match result {
                Ok(_) => processed += 1,
                Err(e) => {
                    tracing::error!(
                        box_id = %subscription.box_id,
                        subscription_id = %subscription.id,
                        error = %e,
                        "Failed to process period-end cancellation"
                    );
                }
            }
        }

        if processed > 0 {
            tracing::info!(processed = processed, "Processed period-end cancellations");
        }

        Ok(processed)
    }

    /// Update the box-visible status projection
    async fn sync_box_status(&self, box_id: BoxId, status: BoxStatus) -> BillingResult<()> {
        sqlx::query("UPDATE boxes SET status = $2, updated_at = NOW() WHERE id = $1")
            .bind(box_id)
            .bind(status.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Write an immutable audit record for a subscription change
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn record_change(
        &self,
        box_id: BoxId,
        subscription_id: Uuid,
        change_type: ChangeType,
        from_plan_id: Uuid,
        to_plan_id: Uuid,
        from_status: Option<String>,
        to_status: Option<String>,
        effective_date: OffsetDateTime,
        prorated_amount_cents: Option<i64>,
        actor: Option<UserId>,
        reason: Option<&str>,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO subscription_changes (
                box_id, subscription_id, change_type, from_plan_id, to_plan_id,
                from_status, to_status, effective_date, prorated_amount_cents,
                actor_id, reason
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(box_id)
        .bind(subscription_id)
        .bind(change_type.as_str())
        .bind(from_plan_id)
        .bind(to_plan_id)
        .bind(from_status)
        .bind(to_status)
        .bind(effective_date)
        .bind(prorated_amount_cents)
        .bind(actor)
        .bind(reason)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_parse_gateway_aliases() {
        assert_eq!(
            SubscriptionStatus::parse("trialing"),
            Some(SubscriptionStatus::Trial)
        );
        assert_eq!(
            SubscriptionStatus::parse("cancelled"),
            Some(SubscriptionStatus::Canceled)
        );
        assert_eq!(
            SubscriptionStatus::parse("incomplete_expired"),
            Some(SubscriptionStatus::Incomplete)
        );
        assert_eq!(SubscriptionStatus::parse("unpaid"), None);
    }

    #[test]
    fn test_box_status_projection() {
        assert_eq!(project_box_status(SubscriptionStatus::Trial), BoxStatus::Trial);
        assert_eq!(project_box_status(SubscriptionStatus::Active), BoxStatus::Active);
        // past_due stays box-visible active while the grace period runs
        assert_eq!(project_box_status(SubscriptionStatus::PastDue), BoxStatus::Active);
        assert_eq!(
            project_box_status(SubscriptionStatus::Canceled),
            BoxStatus::Suspended
        );
        assert_eq!(
            project_box_status(SubscriptionStatus::Incomplete),
            BoxStatus::Suspended
        );
        assert_eq!(
            project_box_status(SubscriptionStatus::Paused),
            BoxStatus::Suspended
        );
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(SubscriptionStatus::Canceled.is_terminal());
        assert!(SubscriptionStatus::Incomplete.is_terminal());
        assert!(!SubscriptionStatus::PastDue.is_terminal());
        assert!(!SubscriptionStatus::Paused.is_terminal());
    }

    use crate::gateway::UnreachableGateway;
    use crate::notify::NoopNotificationDispatcher;

    async fn seed_box_with_subscription(pool: &PgPool) -> BoxId {
        let box_id: BoxId =
            sqlx::query_scalar("INSERT INTO boxes (name) VALUES ('Iron Works') RETURNING id")
                .fetch_one(pool)
                .await
                .unwrap();
        let plan_id: Uuid = sqlx::query_scalar(
            r#"
            INSERT INTO plans (tier, athlete_limit, coach_limit, monthly_price_cents)
            VALUES ('grow', 75, 5, 9900)
            RETURNING id
            "#,
        )
        .fetch_one(pool)
        .await
        .unwrap();
        sqlx::query(
            r#"
            INSERT INTO subscriptions (
                box_id, plan_id, status, current_period_start, current_period_end
            )
            VALUES ($1, $2, 'active', NOW(), NOW() + INTERVAL '30 days')
            "#,
        )
        .bind(box_id)
        .bind(plan_id)
        .execute(pool)
        .await
        .unwrap();
        box_id
    }

    #[sqlx::test(migrations = "../../migrations")]
    async fn immediate_cancel_writes_one_audit_row(pool: PgPool) {
        let box_id = seed_box_with_subscription(&pool).await;
        let grace = GracePeriodService::new(pool.clone(), Arc::new(NoopNotificationDispatcher));
        let service = SubscriptionService::new(pool.clone(), grace, Arc::new(UnreachableGateway));

        let canceled = service
            .cancel(box_id, false, Some("closing the box"), None)
            .await
            .unwrap();
        assert_eq!(canceled.status, "canceled");

        // One logical act, one audit row
        let changes: Vec<(String,)> = sqlx::query_as(
            "SELECT change_type FROM subscription_changes WHERE box_id = $1",
        )
        .bind(box_id)
        .fetch_all(&pool)
        .await
        .unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].0, "cancellation");

        let box_status: String = sqlx::query_scalar("SELECT status FROM boxes WHERE id = $1")
            .bind(box_id)
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(box_status, "suspended");
    }
}
