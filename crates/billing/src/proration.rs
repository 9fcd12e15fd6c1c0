//! Proration and the plan-change workflow
//!
//! A plan change is a two-step request/approve flow. The request is
//! classified by monthly price, the approval computes the prorated charge or
//! credit and applies the new plan to the subscription and the box limits in
//! one transaction. Approval is one-way; a processed request never goes back
//! to pending.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::sync::Arc;
use time::OffsetDateTime;
use uuid::Uuid;

use boxhq_shared::{BoxId, MemberRole, UserId};

use crate::error::{BillingError, BillingResult};
use crate::gateway::{with_timeout, PaymentGateway, GATEWAY_CALL_TIMEOUT};
use crate::grace::{GracePeriodService, GraceReason};
use crate::plans::{Plan, PlanService};
use crate::subscriptions::{ChangeType, Subscription, SubscriptionService};

/// Direction of a plan change, by monthly price
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanChangeKind {
    Upgrade,
    Downgrade,
    Lateral,
}

impl PlanChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanChangeKind::Upgrade => "upgrade",
            PlanChangeKind::Downgrade => "downgrade",
            PlanChangeKind::Lateral => "lateral",
        }
    }

    pub fn classify(from_monthly_cents: i64, to_monthly_cents: i64) -> Self {
        match to_monthly_cents.cmp(&from_monthly_cents) {
            std::cmp::Ordering::Greater => PlanChangeKind::Upgrade,
            std::cmp::Ordering::Less => PlanChangeKind::Downgrade,
            std::cmp::Ordering::Equal => PlanChangeKind::Lateral,
        }
    }
}

/// When the change takes effect and how it is charged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProrationType {
    /// Charge/credit the difference for the remainder of the period
    Immediate,
    /// Apply at the next period boundary, no proration
    NextPeriod,
    /// Apply now without charging the difference
    None,
}

impl ProrationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProrationType::Immediate => "immediate",
            ProrationType::NextPeriod => "next_period",
            ProrationType::None => "none",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "immediate" => Some(ProrationType::Immediate),
            "next_period" => Some(ProrationType::NextPeriod),
            "none" => Some(ProrationType::None),
            _ => None,
        }
    }
}

/// Prorated amount for switching plans mid-period, in cents.
///
/// Both prices are spread over the current period's total days; the
/// difference in daily rate is charged (positive) or credited (negative)
/// for each remaining day. Zero remaining days or a zero-length period
/// prorate to nothing.
pub fn prorated_amount(
    old_monthly_cents: i64,
    new_monthly_cents: i64,
    total_days: i64,
    remaining_days: i64,
) -> i64 {
    if total_days <= 0 || remaining_days <= 0 {
        return 0;
    }
    let old_daily = old_monthly_cents as f64 / total_days as f64;
    let new_daily = new_monthly_cents as f64 / total_days as f64;
    ((new_daily - old_daily) * remaining_days as f64).round() as i64
}

fn period_days(subscription: &Subscription, now: OffsetDateTime) -> (i64, i64) {
    let total = (subscription.current_period_end - subscription.current_period_start).whole_days();
    let remaining = (subscription.current_period_end - now).whole_days().max(0);
    (total, remaining.min(total.max(0)))
}

/// Limit-exceeded grace reasons remediated by landing on `plan`, given the
/// box's current active member counts. Only reasons whose seats now fit are
/// remediated; a downgrade that still leaves a role over its limit keeps
/// that role's grace period open.
fn remediated_reasons(plan: &Plan, athlete_count: i64, coach_count: i64) -> Vec<GraceReason> {
    let mut reasons = Vec::new();
    if athlete_count <= plan.limit_for_role(MemberRole::Athlete) {
        reasons.push(GraceReason::AthleteLimitExceeded);
    }
    if coach_count <= plan.limit_for_role(MemberRole::Coach) {
        reasons.push(GraceReason::CoachLimitExceeded);
    }
    reasons
}

/// A plan change request row
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct PlanChangeRequest {
    pub id: Uuid,
    pub box_id: BoxId,
    pub subscription_id: Uuid,
    pub from_plan_id: Uuid,
    pub to_plan_id: Uuid,
    pub change_kind: String,
    pub proration_type: String,
    pub status: String,
    pub prorated_amount_cents: Option<i64>,
    pub requested_by: Option<UserId>,
    pub approved_by: Option<UserId>,
    pub reason: Option<String>,
    pub created_at: OffsetDateTime,
    pub processed_at: Option<OffsetDateTime>,
}

/// Result of approving a plan change
#[derive(Debug, Clone)]
pub struct PlanChangeResult {
    pub request: PlanChangeRequest,
    pub subscription: Subscription,
    pub prorated_amount_cents: i64,
}

/// Plan change service
#[derive(Clone)]
pub struct PlanChangeService {
    pool: PgPool,
    plans: PlanService,
    subscriptions: SubscriptionService,
    grace: GracePeriodService,
    gateway: Arc<dyn PaymentGateway>,
}

impl PlanChangeService {
    pub fn new(
        pool: PgPool,
        plans: PlanService,
        subscriptions: SubscriptionService,
        grace: GracePeriodService,
        gateway: Arc<dyn PaymentGateway>,
    ) -> Self {
        Self {
            pool,
            plans,
            subscriptions,
            grace,
            gateway,
        }
    }

    pub async fn find_request(&self, request_id: Uuid) -> BillingResult<PlanChangeRequest> {
        sqlx::query_as::<_, PlanChangeRequest>(
            "SELECT * FROM plan_change_requests WHERE id = $1",
        )
        .bind(request_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| {
            BillingError::NotFound(format!("plan change request {} not found", request_id))
        })
    }

    /// Create a pending plan change request for a box.
    ///
    /// Validates the live subscription and the target plan, classifies the
    /// change by monthly price, and persists it for approval.
    pub async fn request_change(
        &self,
        box_id: BoxId,
        to_plan_id: Uuid,
        proration_type: ProrationType,
        requested_by: Option<UserId>,
        reason: Option<&str>,
    ) -> BillingResult<PlanChangeRequest> {
        let subscription = self
            .subscriptions
            .live_subscription(box_id)
            .await?
            .ok_or_else(|| {
                BillingError::NotFound(format!("no active subscription for box {}", box_id))
            })?;

        if subscription.plan_id == to_plan_id {
            return Err(BillingError::InvalidState(
                "box is already on the requested plan".to_string(),
            ));
        }

        let from_plan = self.plans.plan_by_id(subscription.plan_id).await?;
        let to_plan = self.plans.plan_by_id(to_plan_id).await?;

        let kind =
            PlanChangeKind::classify(from_plan.monthly_price_cents, to_plan.monthly_price_cents);

        let request: PlanChangeRequest = sqlx::query_as(
            r#"
            INSERT INTO plan_change_requests (
                box_id, subscription_id, from_plan_id, to_plan_id,
                change_kind, proration_type, status, requested_by, reason
            )
            VALUES ($1, $2, $3, $4, $5, $6, 'pending', $7, $8)
            RETURNING *
            "#,
        )
        .bind(box_id)
        .bind(subscription.id)
        .bind(from_plan.id)
        .bind(to_plan.id)
        .bind(kind.as_str())
        .bind(proration_type.as_str())
        .bind(requested_by)
        .bind(reason)
        .fetch_one(&self.pool)
        .await?;

        tracing::info!(
            box_id = %box_id,
            request_id = %request.id,
            kind = %kind.as_str(),
            from_plan = %from_plan.tier,
            to_plan = %to_plan.tier,
            "Created plan change request"
        );

        Ok(request)
    }

    /// Approve and apply a pending plan change.
    ///
    /// The gateway price update runs first, outside the transaction and
    /// bounded by the call timeout, so a gateway failure leaves the request
    /// pending and retryable and a stuck gateway never holds row locks. The
    /// subscription/plan/box updates and the audit row then run in one
    /// transaction with the request row locked and its pending status
    /// re-checked, so two concurrent approvals cannot both apply.
    pub async fn process_request(
        &self,
        request_id: Uuid,
        approver: Option<UserId>,
    ) -> BillingResult<PlanChangeResult> {
        let request = self.find_request(request_id).await?;
        if request.status != "pending" {
            return Err(BillingError::InvalidState(format!(
                "plan change request {} is {}, not pending",
                request_id, request.status
            )));
        }

        let subscription: Subscription =
            sqlx::query_as("SELECT * FROM subscriptions WHERE id = $1")
                .bind(request.subscription_id)
                .fetch_optional(&self.pool)
                .await?
                .ok_or_else(|| {
                    BillingError::NotFound(format!(
                        "subscription {} for request {} not found",
                        request.subscription_id, request_id
                    ))
                })?;

        let from_plan = self.plans.plan_by_id(request.from_plan_id).await?;
        let to_plan = self.plans.plan_by_id(request.to_plan_id).await?;

        let proration_type = ProrationType::parse(&request.proration_type)
            .unwrap_or(ProrationType::None);

        let now = OffsetDateTime::now_utc();
        let prorated_cents = match proration_type {
            ProrationType::Immediate => {
                let (total_days, remaining_days) = period_days(&subscription, now);
                prorated_amount(
                    from_plan.monthly_price_cents,
                    to_plan.monthly_price_cents,
                    total_days,
                    remaining_days,
                )
            }
            ProrationType::NextPeriod | ProrationType::None => 0,
        };

        if let (Some(external_id), Some(price_id)) = (
            subscription.stripe_subscription_id.as_deref(),
            to_plan.stripe_price_id.as_deref(),
        ) {
            with_timeout(
                GATEWAY_CALL_TIMEOUT,
                self.gateway.update_subscription_price(external_id, price_id),
            )
            .await?;
        }

        let mut tx = self.pool.begin().await?;

        // Re-check under the row lock; a concurrent approval that slipped
        // between the pre-check and here wins, and we bail out.
        let request: PlanChangeRequest = sqlx::query_as(
            "SELECT * FROM plan_change_requests WHERE id = $1 FOR UPDATE",
        )
        .bind(request_id)
        .fetch_one(&mut *tx)
        .await?;

        if request.status != "pending" {
            return Err(BillingError::InvalidState(format!(
                "plan change request {} is {}, not pending",
                request_id, request.status
            )));
        }

        let updated_subscription: Subscription = sqlx::query_as(
            r#"
            UPDATE subscriptions
            SET plan_id = $2, amount_cents = $3, updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(subscription.id)
        .bind(to_plan.id)
        .bind(to_plan.monthly_price_cents)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE boxes
            SET plan_id = $2, athlete_limit = $3, coach_limit = $4, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(request.box_id)
        .bind(to_plan.id)
        .bind(to_plan.athlete_limit)
        .bind(to_plan.coach_limit)
        .execute(&mut *tx)
        .await?;

        let approved: PlanChangeRequest = sqlx::query_as(
            r#"
            UPDATE plan_change_requests
            SET status = 'approved',
                approved_by = $2,
                prorated_amount_cents = $3,
                processed_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(request_id)
        .bind(approver)
        .bind(prorated_cents)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO subscription_changes (
                box_id, subscription_id, change_type, from_plan_id, to_plan_id,
                from_status, to_status, effective_date, prorated_amount_cents,
                actor_id, reason
            )
            VALUES ($1, $2, $3, $4, $5, $6, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(request.box_id)
        .bind(subscription.id)
        .bind(ChangeType::PlanChange.as_str())
        .bind(from_plan.id)
        .bind(to_plan.id)
        .bind(&subscription.status)
        .bind(now)
        .bind(prorated_cents)
        .bind(approver)
        .bind(request.reason.as_deref())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        self.resolve_remediated_grace(&request, &to_plan, approver)
            .await?;

        tracing::info!(
            box_id = %request.box_id,
            request_id = %request_id,
            from_plan = %from_plan.tier,
            to_plan = %to_plan.tier,
            prorated_cents = prorated_cents,
            "Applied plan change"
        );

        Ok(PlanChangeResult {
            request: approved,
            subscription: updated_subscription,
            prorated_amount_cents: prorated_cents,
        })
    }

    /// Close out grace periods the applied plan change remediates:
    /// limit-exceeded periods whose seats now fit under the new limits, and
    /// billing-issue holds when the change is an upgrade.
    async fn resolve_remediated_grace(
        &self,
        request: &PlanChangeRequest,
        to_plan: &Plan,
        approver: Option<UserId>,
    ) -> BillingResult<()> {
        let counts: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT role, COUNT(*) FROM box_members
            WHERE box_id = $1 AND status = 'active'
            GROUP BY role
            "#,
        )
        .bind(request.box_id)
        .fetch_all(&self.pool)
        .await?;
        let count_for = |role: MemberRole| -> i64 {
            counts
                .iter()
                .find(|(r, _)| r == role.as_str())
                .map(|(_, c)| *c)
                .unwrap_or(0)
        };

        let mut reasons = remediated_reasons(
            to_plan,
            count_for(MemberRole::Athlete),
            count_for(MemberRole::Coach),
        );
        if request.change_kind == PlanChangeKind::Upgrade.as_str() {
            reasons.push(GraceReason::BillingIssue);
        }

        let resolved = self
            .grace
            .resolve_for_reasons(request.box_id, &reasons, "plan_changed", approver)
            .await?;
        if resolved > 0 {
            tracing::info!(
                box_id = %request.box_id,
                resolved = resolved,
                "Plan change resolved open grace periods"
            );
        }
        Ok(())
    }

    /// Cancel a pending request. Processed requests cannot be canceled.
    pub async fn cancel_request(
        &self,
        request_id: Uuid,
        actor: Option<UserId>,
    ) -> BillingResult<PlanChangeRequest> {
        let canceled: Option<PlanChangeRequest> = sqlx::query_as(
            r#"
            UPDATE plan_change_requests
            SET status = 'canceled', processed_at = NOW(), approved_by = $2
            WHERE id = $1 AND status = 'pending'
            RETURNING *
            "#,
        )
        .bind(request_id)
        .bind(actor)
        .fetch_optional(&self.pool)
        .await?;

        match canceled {
            Some(request) => {
                tracing::info!(request_id = %request_id, "Canceled plan change request");
                Ok(request)
            }
            None => {
                let request = self.find_request(request_id).await?;
                Err(BillingError::InvalidState(format!(
                    "plan change request {} is {}, not pending",
                    request_id, request.status
                )))
            }
        }
    }

    /// Pending requests for a box, oldest first
    pub async fn pending_requests(&self, box_id: BoxId) -> BillingResult<Vec<PlanChangeRequest>> {
        Ok(sqlx::query_as::<_, PlanChangeRequest>(
            r#"
            SELECT * FROM plan_change_requests
            WHERE box_id = $1 AND status = 'pending'
            ORDER BY created_at ASC
            "#,
        )
        .bind(box_id)
        .fetch_all(&self.pool)
        .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prorated_upgrade() {
        // 30-day period, 10 days remaining, 3000 -> 6000 monthly
        assert_eq!(prorated_amount(3000, 6000, 30, 10), 1000);
    }

    #[test]
    fn test_prorated_downgrade_credits() {
        assert_eq!(prorated_amount(6000, 3000, 30, 10), -1000);
    }

    #[test]
    fn test_proration_degenerate_periods() {
        assert_eq!(prorated_amount(3000, 6000, 0, 10), 0);
        assert_eq!(prorated_amount(3000, 6000, 30, 0), 0);
        assert_eq!(prorated_amount(3000, 6000, -1, 10), 0);
    }

    #[test]
    fn test_classification_by_price() {
        assert_eq!(PlanChangeKind::classify(3000, 6000), PlanChangeKind::Upgrade);
        assert_eq!(PlanChangeKind::classify(6000, 3000), PlanChangeKind::Downgrade);
        assert_eq!(PlanChangeKind::classify(3000, 3000), PlanChangeKind::Lateral);
    }

    #[test]
    fn test_proration_type_round_trip() {
        for pt in [
            ProrationType::Immediate,
            ProrationType::NextPeriod,
            ProrationType::None,
        ] {
            assert_eq!(ProrationType::parse(pt.as_str()), Some(pt));
        }
        assert_eq!(ProrationType::parse("deferred"), None);
    }

    fn plan_with_limits(athlete_limit: i32, coach_limit: i32) -> Plan {
        Plan {
            id: Uuid::new_v4(),
            tier: "pro".to_string(),
            version: 1,
            is_current: true,
            athlete_limit,
            coach_limit,
            monthly_price_cents: 19900,
            athlete_overage_rate_cents: None,
            coach_overage_rate_cents: None,
            stripe_price_id: None,
            created_at: OffsetDateTime::now_utc(),
        }
    }

    #[test]
    fn test_remediated_reasons_follow_new_limits() {
        let plan = plan_with_limits(150, 5);

        // 80 athletes now fit, 7 coaches still do not
        let reasons = remediated_reasons(&plan, 80, 7);
        assert!(reasons.contains(&GraceReason::AthleteLimitExceeded));
        assert!(!reasons.contains(&GraceReason::CoachLimitExceeded));

        // Both roles covered
        let reasons = remediated_reasons(&plan, 150, 5);
        assert_eq!(reasons.len(), 2);

        // Downgrade that covers neither role remediates nothing
        let small = plan_with_limits(10, 1);
        assert!(remediated_reasons(&small, 80, 7).is_empty());
    }

    use crate::gateway::UnreachableGateway;
    use crate::grace::GraceOverrides;
    use crate::notify::NoopNotificationDispatcher;

    #[sqlx::test(migrations = "../../migrations")]
    async fn upgrade_resolves_limit_grace_period(pool: PgPool) {
        let box_id: BoxId = sqlx::query_scalar(
            "INSERT INTO boxes (name, athlete_limit, coach_limit) VALUES ('Iron Works', 75, 5) RETURNING id",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        let from_plan: Uuid = sqlx::query_scalar(
            r#"
            INSERT INTO plans (tier, athlete_limit, coach_limit, monthly_price_cents)
            VALUES ('grow', 75, 5, 9900)
            RETURNING id
            "#,
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        let to_plan: Uuid = sqlx::query_scalar(
            r#"
            INSERT INTO plans (tier, athlete_limit, coach_limit, monthly_price_cents)
            VALUES ('pro', 150, 10, 19900)
            RETURNING id
            "#,
        )
        .fetch_one(&pool)
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
        .bind(from_plan)
        .execute(&pool)
        .await
        .unwrap();
        // 80 athletes, over the grow limit of 75 but under pro's 150
        sqlx::query(
            r#"
            INSERT INTO box_members (box_id, user_id, role)
            SELECT $1, gen_random_uuid(), 'athlete' FROM generate_series(1, 80)
            "#,
        )
        .bind(box_id)
        .execute(&pool)
        .await
        .unwrap();

        let plans = PlanService::new(pool.clone());
        let grace = GracePeriodService::new(pool.clone(), Arc::new(NoopNotificationDispatcher));
        let gateway: Arc<dyn PaymentGateway> = Arc::new(UnreachableGateway);
        let subscriptions =
            SubscriptionService::new(pool.clone(), grace.clone(), gateway.clone());
        let service = PlanChangeService::new(
            pool.clone(),
            plans,
            subscriptions,
            grace.clone(),
            gateway,
        );

        let opened = grace
            .open(
                box_id,
                GraceReason::AthleteLimitExceeded,
                GraceOverrides::default(),
            )
            .await
            .unwrap();
        assert!(!opened.was_existing);

        let request = service
            .request_change(box_id, to_plan, ProrationType::NextPeriod, None, None)
            .await
            .unwrap();
        assert_eq!(request.change_kind, "upgrade");

        let result = service.process_request(request.id, None).await.unwrap();
        assert_eq!(result.request.status, "approved");
        assert_eq!(result.subscription.plan_id, to_plan);

        // The upgrade covers the 80 athletes, so the grace period is gone
        assert!(grace
            .find_open(box_id, GraceReason::AthleteLimitExceeded)
            .await
            .unwrap()
            .is_none());

        let athlete_limit: i32 =
            sqlx::query_scalar("SELECT athlete_limit FROM boxes WHERE id = $1")
                .bind(box_id)
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(athlete_limit, 150);
    }
}
