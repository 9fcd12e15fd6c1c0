//! Usage ledger and limit enforcement
//!
//! Tracks per-role member counts against plan limits, appends immutable
//! usage events tagged with the billing period they fall into, and runs the
//! enforcement pass: limit-exceeded grace periods for boxes without overage
//! billing, approaching-limit warnings for everyone else.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use boxhq_shared::{BoxId, MemberRole, UserId};

use crate::error::{BillingError, BillingResult};
use crate::grace::{GraceOverrides, GracePeriodService, GraceReason};
use crate::notify::{NotificationDispatcher, NotificationPriority, NotificationRequest};
use crate::plans::{PlanService, DEFAULT_OVERAGE_RATE_CENTS};

/// Warning threshold as a fraction of the seat limit
const APPROACHING_LIMIT_THRESHOLD: f64 = 0.9;

/// Billing-relevant columns of a box row
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct BoxBillingProfile {
    pub id: BoxId,
    pub name: String,
    pub status: String,
    pub plan_id: Option<Uuid>,
    pub athlete_limit: i32,
    pub coach_limit: i32,
    pub overage_enabled: bool,
    pub stripe_customer_id: Option<String>,
}

impl BoxBillingProfile {
    pub fn stored_limit_for_role(&self, role: MemberRole) -> i64 {
        match role {
            MemberRole::Athlete => self.athlete_limit as i64,
            MemberRole::Coach => self.coach_limit as i64,
        }
    }
}

/// Usage of a single role against its limit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleUsage {
    pub role: MemberRole,
    pub current: i64,
    pub limit: i64,
    pub percentage: f64,
    pub over_limit: bool,
    pub overage_quantity: i64,
    pub overage_rate_cents: i64,
    pub estimated_overage_cents: i64,
}

/// Full usage snapshot for a box
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoxUsage {
    pub box_id: BoxId,
    pub overage_enabled: bool,
    pub athletes: RoleUsage,
    pub coaches: RoleUsage,
    pub computed_at: OffsetDateTime,
}

impl BoxUsage {
    pub fn role_usage(&self, role: MemberRole) -> &RoleUsage {
        match role {
            MemberRole::Athlete => &self.athletes,
            MemberRole::Coach => &self.coaches,
        }
    }

    pub fn any_over_limit(&self) -> bool {
        self.athletes.over_limit || self.coaches.over_limit
    }
}

/// An append-only usage event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageEventInput {
    pub event_type: String,
    pub role: Option<MemberRole>,
    pub quantity: i64,
    pub billable: bool,
    pub user_id: Option<UserId>,
    pub metadata: serde_json::Value,
}

/// Result of an enforcement pass
#[derive(Debug, Clone, Default)]
pub struct EnforcementOutcome {
    pub grace_periods_opened: Vec<GraceReason>,
    pub warnings_sent: Vec<MemberRole>,
}

/// Usage ledger service
#[derive(Clone)]
pub struct UsageService {
    pool: PgPool,
    plans: PlanService,
    grace: GracePeriodService,
    notifier: Arc<dyn NotificationDispatcher>,
}

impl UsageService {
    pub fn new(
        pool: PgPool,
        plans: PlanService,
        grace: GracePeriodService,
        notifier: Arc<dyn NotificationDispatcher>,
    ) -> Self {
        Self {
            pool,
            plans,
            grace,
            notifier,
        }
    }

    pub async fn box_profile(&self, box_id: BoxId) -> BillingResult<BoxBillingProfile> {
        sqlx::query_as::<_, BoxBillingProfile>(
            r#"
            SELECT id, name, status, plan_id, athlete_limit, coach_limit,
                   overage_enabled, stripe_customer_id
            FROM boxes WHERE id = $1
            "#,
        )
        .bind(box_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| BillingError::NotFound(format!("box {} not found", box_id)))
    }

    /// Count active members per role against the current plan limits.
    ///
    /// Plan limits win when the box has a plan; the box-stored limits are
    /// the fallback for boxes mid-migration or without a plan row.
    pub async fn compute_usage(&self, box_id: BoxId) -> BillingResult<BoxUsage> {
        let profile = self.box_profile(box_id).await?;

        let plan = match profile.plan_id {
            Some(plan_id) => self.plans.find_plan(plan_id).await?,
            None => None,
        };

        let counts: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT role, COUNT(*) FROM box_members
            WHERE box_id = $1 AND status = 'active'
            GROUP BY role
            "#,
        )
        .bind(box_id)
        .fetch_all(&self.pool)
        .await?;

        let count_for = |role: MemberRole| -> i64 {
            counts
                .iter()
                .find(|(r, _)| r == role.as_str())
                .map(|(_, c)| *c)
                .unwrap_or(0)
        };

        let usage_for = |role: MemberRole| -> RoleUsage {
            let current = count_for(role);
            let limit = plan
                .as_ref()
                .map(|p| p.limit_for_role(role))
                .unwrap_or_else(|| profile.stored_limit_for_role(role));
            let rate = plan
                .as_ref()
                .map(|p| p.overage_rate_for_role(role))
                .unwrap_or(DEFAULT_OVERAGE_RATE_CENTS);
            let overage_quantity = (current - limit).max(0);
            RoleUsage {
                role,
                current,
                limit,
                percentage: if limit > 0 {
                    (current as f64 / limit as f64) * 100.0
                } else {
                    0.0
                },
                over_limit: current > limit,
                overage_quantity,
                overage_rate_cents: rate,
                estimated_overage_cents: overage_quantity * rate,
            }
        };

        Ok(BoxUsage {
            box_id,
            overage_enabled: profile.overage_enabled,
            athletes: usage_for(MemberRole::Athlete),
            coaches: usage_for(MemberRole::Coach),
            computed_at: OffsetDateTime::now_utc(),
        })
    }

    /// Append usage events, tagged with the box's current billing period.
    ///
    /// Falls back to the calendar month when the box has no live
    /// subscription (trial boxes still accumulate usage history).
    pub async fn record_usage_events(
        &self,
        box_id: BoxId,
        events: &[UsageEventInput],
    ) -> BillingResult<usize> {
        if events.is_empty() {
            return Ok(0);
        }

        let (period_start, period_end) = self.current_billing_period(box_id).await?;

        let mut tx = self.pool.begin().await?;
        for event in events {
            sqlx::query(
                r#"
                INSERT INTO usage_events (
                    box_id, event_type, role, quantity, billable, user_id,
                    period_start, period_end, metadata
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                "#,
            )
            .bind(box_id)
            .bind(&event.event_type)
            .bind(event.role.map(|r| r.as_str()))
            .bind(event.quantity)
            .bind(event.billable)
            .bind(event.user_id)
            .bind(period_start)
            .bind(period_end)
            .bind(&event.metadata)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        tracing::info!(
            box_id = %box_id,
            count = events.len(),
            "Recorded usage events"
        );

        Ok(events.len())
    }

    /// Run the enforcement pass after membership changes.
    ///
    /// The triggering events are appended to the ledger first, then usage is
    /// recomputed. Overage-disabled boxes over a limit get a limit-exceeded
    /// grace period; boxes at or above 90% of a limit (but not over) get one
    /// approaching-limit warning per role per check.
    pub async fn enforce_limits(
        &self,
        box_id: BoxId,
        triggering_events: &[UsageEventInput],
    ) -> BillingResult<EnforcementOutcome> {
        self.record_usage_events(box_id, triggering_events).await?;

        let usage = self.compute_usage(box_id).await?;
        let mut outcome = EnforcementOutcome::default();

        for role in MemberRole::all() {
            let role_usage = usage.role_usage(role);

            if role_usage.over_limit {
                if usage.overage_enabled {
                    tracing::debug!(
                        box_id = %box_id,
                        role = %role,
                        overage = role_usage.overage_quantity,
                        "Over limit with overage billing enabled, no enforcement"
                    );
                    continue;
                }

                let reason = match role {
                    MemberRole::Athlete => GraceReason::AthleteLimitExceeded,
                    MemberRole::Coach => GraceReason::CoachLimitExceeded,
                };
                let result = self
                    .grace
                    .open(box_id, reason, GraceOverrides::default())
                    .await?;
                if !result.was_existing {
                    outcome.grace_periods_opened.push(reason);
                }

                tracing::warn!(
                    box_id = %box_id,
                    role = %role,
                    current = role_usage.current,
                    limit = role_usage.limit,
                    was_existing = result.was_existing,
                    "Member limit exceeded"
                );
            } else if role_usage.limit > 0
                && role_usage.current as f64 >= role_usage.limit as f64 * APPROACHING_LIMIT_THRESHOLD
            {
                self.send_approaching_limit_warning(box_id, role_usage).await;
                outcome.warnings_sent.push(role);
            }
        }

        Ok(outcome)
    }

    async fn send_approaching_limit_warning(&self, box_id: BoxId, usage: &RoleUsage) {
        let request = NotificationRequest::new(
            box_id,
            "approaching_member_limit",
            format!(
                "approaching_limit_{}_{}_{}",
                box_id,
                usage.role.as_str(),
                usage.current
            ),
        )
        .priority(NotificationPriority::High)
        .title(format!("Approaching {} limit", usage.role))
        .message(format!(
            "Your box is using {} of {} {} seats ({:.0}%). Upgrade your plan to add more.",
            usage.current, usage.limit, usage.role, usage.percentage
        ))
        .action_url("https://app.boxhq.io/billing/plans")
        .data(serde_json::json!({
            "role": usage.role.as_str(),
            "current": usage.current,
            "limit": usage.limit,
        }));

        if let Err(e) = self.notifier.create_notification(request).await {
            tracing::warn!(
                box_id = %box_id,
                role = %usage.role,
                error = %e,
                "Failed to send approaching-limit warning"
            );
        }
    }

    /// Billing period for the box: the live subscription's current period,
    /// or the current calendar month as an approximation.
    async fn current_billing_period(
        &self,
        box_id: BoxId,
    ) -> BillingResult<(OffsetDateTime, OffsetDateTime)> {
        let period: Option<(OffsetDateTime, OffsetDateTime)> = sqlx::query_as(
            r#"
            SELECT current_period_start, current_period_end FROM subscriptions
            WHERE box_id = $1 AND status IN ('trial', 'active', 'past_due', 'paused')
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(box_id)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(period) = period {
            return Ok(period);
        }

        let now = OffsetDateTime::now_utc();
        let start = now
            .replace_day(1)
            .map_err(|e| BillingError::InvalidState(format!("bad period start: {}", e)))?
            .replace_time(time::Time::MIDNIGHT);
        let days = time::util::days_in_year_month(now.year(), now.month());
        let end = start + Duration::days(days as i64);
        Ok((start, end))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn role_usage(current: i64, limit: i64, rate: i64) -> RoleUsage {
        let overage = (current - limit).max(0);
        RoleUsage {
            role: MemberRole::Athlete,
            current,
            limit,
            percentage: if limit > 0 {
                (current as f64 / limit as f64) * 100.0
            } else {
                0.0
            },
            over_limit: current > limit,
            overage_quantity: overage,
            overage_rate_cents: rate,
            estimated_overage_cents: overage * rate,
        }
    }

    #[test]
    fn test_over_limit_estimate() {
        let usage = role_usage(80, 75, 100);
        assert!(usage.over_limit);
        assert_eq!(usage.overage_quantity, 5);
        assert_eq!(usage.estimated_overage_cents, 500);
    }

    #[test]
    fn test_at_limit_is_not_over() {
        let usage = role_usage(75, 75, 100);
        assert!(!usage.over_limit);
        assert_eq!(usage.overage_quantity, 0);
        assert_eq!(usage.estimated_overage_cents, 0);
    }

    #[test]
    fn test_approaching_threshold() {
        let usage = role_usage(68, 75, 100);
        assert!(usage.current as f64 >= usage.limit as f64 * APPROACHING_LIMIT_THRESHOLD);
        assert!(!usage.over_limit);

        let usage = role_usage(67, 75, 100);
        assert!((usage.current as f64) < usage.limit as f64 * APPROACHING_LIMIT_THRESHOLD);
    }
}
