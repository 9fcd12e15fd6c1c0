//! Grace period management
//!
//! A grace period is a time-bounded window during which a box keeps access
//! despite a limit or payment problem. At most one unresolved, unexpired
//! period may exist per (box, reason); the dedup settles through a partial
//! unique index so it holds under concurrent openers too.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use boxhq_shared::{BoxId, UserId};

use crate::error::{BillingError, BillingResult};
use crate::notify::{NotificationDispatcher, NotificationPriority, NotificationRequest};

/// Why a grace period was opened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GraceReason {
    AthleteLimitExceeded,
    CoachLimitExceeded,
    TrialEnding,
    PaymentFailed,
    SubscriptionCanceled,
    BillingIssue,
}

impl GraceReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            GraceReason::AthleteLimitExceeded => "athlete_limit_exceeded",
            GraceReason::CoachLimitExceeded => "coach_limit_exceeded",
            GraceReason::TrialEnding => "trial_ending",
            GraceReason::PaymentFailed => "payment_failed",
            GraceReason::SubscriptionCanceled => "subscription_canceled",
            GraceReason::BillingIssue => "billing_issue",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "athlete_limit_exceeded" => Some(GraceReason::AthleteLimitExceeded),
            "coach_limit_exceeded" => Some(GraceReason::CoachLimitExceeded),
            "trial_ending" => Some(GraceReason::TrialEnding),
            "payment_failed" => Some(GraceReason::PaymentFailed),
            "subscription_canceled" => Some(GraceReason::SubscriptionCanceled),
            "billing_issue" => Some(GraceReason::BillingIssue),
            _ => None,
        }
    }
}

impl std::fmt::Display for GraceReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How hard the deadline bites
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GraceSeverity {
    Warning,
    Critical,
    /// Access is cut immediately when the period opens (0-day window)
    Blocking,
}

impl GraceSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            GraceSeverity::Warning => "warning",
            GraceSeverity::Critical => "critical",
            GraceSeverity::Blocking => "blocking",
        }
    }
}

/// Default duration and severity per reason
pub fn grace_policy(reason: GraceReason) -> (i64, GraceSeverity) {
    match reason {
        GraceReason::AthleteLimitExceeded => (14, GraceSeverity::Warning),
        GraceReason::CoachLimitExceeded => (14, GraceSeverity::Warning),
        GraceReason::TrialEnding => (7, GraceSeverity::Critical),
        GraceReason::PaymentFailed => (3, GraceSeverity::Critical),
        GraceReason::SubscriptionCanceled => (0, GraceSeverity::Blocking),
        GraceReason::BillingIssue => (7, GraceSeverity::Warning),
    }
}

/// Caller overrides for the static policy
#[derive(Debug, Clone, Copy, Default)]
pub struct GraceOverrides {
    pub duration_days: Option<i64>,
    pub severity: Option<GraceSeverity>,
}

/// A grace period row
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct GracePeriod {
    pub id: Uuid,
    pub box_id: BoxId,
    pub reason: String,
    pub severity: String,
    pub opened_at: OffsetDateTime,
    pub ends_at: OffsetDateTime,
    pub resolved: bool,
    pub resolved_at: Option<OffsetDateTime>,
    pub resolution: Option<String>,
    pub resolved_by: Option<UserId>,
    pub auto_resolved: bool,
}

impl GracePeriod {
    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        self.ends_at <= now
    }
}

/// Result of an `open` call
#[derive(Debug, Clone)]
pub struct OpenGraceResult {
    pub period: GracePeriod,
    /// True when an unresolved, unexpired period already covered this reason
    pub was_existing: bool,
}

/// Service owning grace period lifecycle
#[derive(Clone)]
pub struct GracePeriodService {
    pool: PgPool,
    notifier: Arc<dyn NotificationDispatcher>,
}

impl GracePeriodService {
    pub fn new(pool: PgPool, notifier: Arc<dyn NotificationDispatcher>) -> Self {
        Self { pool, notifier }
    }

    /// Open a grace period for (box, reason), deduplicated.
    ///
    /// Returns the existing period unchanged when one is already open and
    /// unexpired. A stale unresolved-but-expired period is auto-resolved
    /// first so the partial unique index frees up.
    pub async fn open(
        &self,
        box_id: BoxId,
        reason: GraceReason,
        overrides: GraceOverrides,
    ) -> BillingResult<OpenGraceResult> {
        let now = OffsetDateTime::now_utc();

        if let Some(existing) = self.find_open(box_id, reason).await? {
            if !existing.is_expired(now) {
                tracing::debug!(
                    box_id = %box_id,
                    reason = %reason,
                    grace_period_id = %existing.id,
                    "Grace period already open"
                );
                return Ok(OpenGraceResult {
                    period: existing,
                    was_existing: true,
                });
            }
            // Expired but never swept: close it out so a fresh one can open
            self.resolve_internal(existing.id, "expired", None, true).await?;
        }

        let (default_days, default_severity) = grace_policy(reason);
        let duration_days = overrides.duration_days.unwrap_or(default_days);
        let severity = overrides.severity.unwrap_or(default_severity);
        let ends_at = now + Duration::days(duration_days);

        let inserted: Option<GracePeriod> = sqlx::query_as(
            r#"
            INSERT INTO grace_periods (box_id, reason, severity, opened_at, ends_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (box_id, reason) WHERE resolved = false DO NOTHING
            RETURNING *
            "#,
        )
        .bind(box_id)
        .bind(reason.as_str())
        .bind(severity.as_str())
        .bind(now)
        .bind(ends_at)
        .fetch_optional(&self.pool)
        .await?;

        let period = match inserted {
            Some(period) => period,
            None => {
                // Lost the race to a concurrent opener; their row wins
                let existing = self.find_open(box_id, reason).await?.ok_or_else(|| {
                    BillingError::Conflict(format!(
                        "grace period insert conflicted but no open period found for box {}",
                        box_id
                    ))
                })?;
                return Ok(OpenGraceResult {
                    period: existing,
                    was_existing: true,
                });
            }
        };

        tracing::info!(
            box_id = %box_id,
            reason = %reason,
            severity = %severity.as_str(),
            ends_at = %ends_at,
            "Opened grace period"
        );

        // Best-effort: a dead notification service must not fail the open
        let request = NotificationRequest::new(
            box_id,
            "grace_period_opened",
            format!("grace_opened_{}_{}", box_id, period.id),
        )
        .priority(match severity {
            GraceSeverity::Warning => NotificationPriority::Normal,
            GraceSeverity::Critical => NotificationPriority::High,
            GraceSeverity::Blocking => NotificationPriority::Urgent,
        })
        .title("Action needed on your subscription")
        .message(format!(
            "A {} issue needs your attention before {}.",
            reason,
            ends_at.date()
        ))
        .data(serde_json::json!({
            "reason": reason.as_str(),
            "severity": severity.as_str(),
            "ends_at": ends_at.to_string(),
        }));

        if let Err(e) = self.notifier.create_notification(request).await {
            tracing::warn!(
                box_id = %box_id,
                reason = %reason,
                error = %e,
                "Failed to send grace period notification"
            );
        }

        Ok(OpenGraceResult {
            period,
            was_existing: false,
        })
    }

    /// Resolve a single grace period
    pub async fn resolve(
        &self,
        grace_period_id: Uuid,
        resolution: &str,
        actor: Option<UserId>,
        auto_resolved: bool,
    ) -> BillingResult<GracePeriod> {
        let period = self
            .resolve_internal(grace_period_id, resolution, actor, auto_resolved)
            .await?;

        let request = NotificationRequest::new(
            period.box_id,
            "grace_period_resolved",
            format!("grace_resolved_{}_{}", period.box_id, period.id),
        )
        .title("Issue resolved")
        .message(format!(
            "The {} issue on your account is resolved.",
            period.reason
        ))
        .data(serde_json::json!({
            "reason": period.reason,
            "resolution": resolution,
        }));

        if let Err(e) = self.notifier.create_notification(request).await {
            tracing::warn!(
                grace_period_id = %grace_period_id,
                error = %e,
                "Failed to send grace resolution notification"
            );
        }

        Ok(period)
    }

    async fn resolve_internal(
        &self,
        grace_period_id: Uuid,
        resolution: &str,
        actor: Option<UserId>,
        auto_resolved: bool,
    ) -> BillingResult<GracePeriod> {
        let period: Option<GracePeriod> = sqlx::query_as(
            r#"
            UPDATE grace_periods
            SET resolved = true,
                resolved_at = NOW(),
                resolution = $2,
                resolved_by = $3,
                auto_resolved = $4
            WHERE id = $1 AND resolved = false
            RETURNING *
            "#,
        )
        .bind(grace_period_id)
        .bind(resolution)
        .bind(actor)
        .bind(auto_resolved)
        .fetch_optional(&self.pool)
        .await?;

        let period = period.ok_or_else(|| {
            BillingError::NotFound(format!("open grace period {} not found", grace_period_id))
        })?;

        tracing::info!(
            grace_period_id = %grace_period_id,
            box_id = %period.box_id,
            reason = %period.reason,
            resolution = %resolution,
            auto_resolved = auto_resolved,
            "Resolved grace period"
        );

        Ok(period)
    }

    /// Bulk-resolve all open periods matching the given reasons.
    ///
    /// Called whenever a remediating action occurs (plan upgrade, payment
    /// success, overage billing enabled). Returns how many were resolved.
    pub async fn resolve_for_reasons(
        &self,
        box_id: BoxId,
        reasons: &[GraceReason],
        resolution: &str,
        actor: Option<UserId>,
    ) -> BillingResult<u64> {
        if reasons.is_empty() {
            return Ok(0);
        }
        let reason_strs: Vec<&str> = reasons.iter().map(|r| r.as_str()).collect();

        let resolved = sqlx::query(
            r#"
            UPDATE grace_periods
            SET resolved = true,
                resolved_at = NOW(),
                resolution = $3,
                resolved_by = $4,
                auto_resolved = ($4 IS NULL)
            WHERE box_id = $1 AND reason = ANY($2) AND resolved = false
            "#,
        )
        .bind(box_id)
        .bind(&reason_strs)
        .bind(resolution)
        .bind(actor)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if resolved > 0 {
            tracing::info!(
                box_id = %box_id,
                reasons = ?reason_strs,
                resolved = resolved,
                resolution = %resolution,
                "Bulk-resolved grace periods"
            );
        }

        Ok(resolved)
    }

    /// Read-only query for periods ending within the window.
    ///
    /// Used by the scheduler to warn boxes ahead of the deadline; resolves
    /// nothing itself.
    pub async fn sweep_expiring(&self, days_ahead: i64) -> BillingResult<Vec<GracePeriod>> {
        let cutoff = OffsetDateTime::now_utc() + Duration::days(days_ahead);

        Ok(sqlx::query_as::<_, GracePeriod>(
            r#"
            SELECT * FROM grace_periods
            WHERE resolved = false AND ends_at <= $1 AND ends_at > NOW()
            ORDER BY ends_at
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?)
    }

    /// Auto-resolve periods whose deadline has passed, returning them so the
    /// caller can enforce remediation. Run by the daily sweep job.
    pub async fn expire_overdue(&self) -> BillingResult<Vec<GracePeriod>> {
        let expired: Vec<GracePeriod> = sqlx::query_as(
            r#"
            UPDATE grace_periods
            SET resolved = true,
                resolved_at = NOW(),
                resolution = 'expired',
                auto_resolved = true
            WHERE resolved = false AND ends_at <= NOW()
            RETURNING *
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        if !expired.is_empty() {
            tracing::info!(count = expired.len(), "Expired overdue grace periods");
        }

        Ok(expired)
    }

    pub async fn find_open(
        &self,
        box_id: BoxId,
        reason: GraceReason,
    ) -> BillingResult<Option<GracePeriod>> {
        Ok(sqlx::query_as::<_, GracePeriod>(
            "SELECT * FROM grace_periods WHERE box_id = $1 AND reason = $2 AND resolved = false",
        )
        .bind(box_id)
        .bind(reason.as_str())
        .fetch_optional(&self.pool)
        .await?)
    }

    pub async fn open_periods(&self, box_id: BoxId) -> BillingResult<Vec<GracePeriod>> {
        Ok(sqlx::query_as::<_, GracePeriod>(
            "SELECT * FROM grace_periods WHERE box_id = $1 AND resolved = false ORDER BY ends_at",
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
    fn test_policy_table() {
        assert_eq!(
            grace_policy(GraceReason::AthleteLimitExceeded),
            (14, GraceSeverity::Warning)
        );
        assert_eq!(
            grace_policy(GraceReason::PaymentFailed),
            (3, GraceSeverity::Critical)
        );
        assert_eq!(
            grace_policy(GraceReason::SubscriptionCanceled),
            (0, GraceSeverity::Blocking)
        );
        assert_eq!(
            grace_policy(GraceReason::BillingIssue),
            (7, GraceSeverity::Warning)
        );
    }

    #[test]
    fn test_reason_round_trip() {
        for reason in [
            GraceReason::AthleteLimitExceeded,
            GraceReason::CoachLimitExceeded,
            GraceReason::TrialEnding,
            GraceReason::PaymentFailed,
            GraceReason::SubscriptionCanceled,
            GraceReason::BillingIssue,
        ] {
            assert_eq!(GraceReason::parse(reason.as_str()), Some(reason));
        }
        assert_eq!(GraceReason::parse("unknown_reason"), None);
    }

    #[test]
    fn test_zero_day_policy_expires_immediately() {
        let (days, severity) = grace_policy(GraceReason::SubscriptionCanceled);
        assert_eq!(days, 0);
        assert_eq!(severity, GraceSeverity::Blocking);

        let now = OffsetDateTime::now_utc();
        let ends_at = now + Duration::days(days);
        assert!(ends_at <= now);
    }

    use crate::notify::NoopNotificationDispatcher;

    #[sqlx::test(migrations = "../../migrations")]
    async fn second_open_reuses_the_open_period(pool: PgPool) {
        let box_id: BoxId =
            sqlx::query_scalar("INSERT INTO boxes (name) VALUES ('Iron Works') RETURNING id")
                .fetch_one(&pool)
                .await
                .unwrap();
        let grace = GracePeriodService::new(pool, Arc::new(NoopNotificationDispatcher));

        let first = grace
            .open(box_id, GraceReason::PaymentFailed, GraceOverrides::default())
            .await
            .unwrap();
        assert!(!first.was_existing);

        let second = grace
            .open(box_id, GraceReason::PaymentFailed, GraceOverrides::default())
            .await
            .unwrap();
        assert!(second.was_existing);
        assert_eq!(second.period.id, first.period.id);

        // A different reason opens its own period
        let other = grace
            .open(box_id, GraceReason::BillingIssue, GraceOverrides::default())
            .await
            .unwrap();
        assert!(!other.was_existing);

        // Resolution frees the (box, reason) slot for a fresh period
        grace
            .resolve(first.period.id, "payment_received", None, false)
            .await
            .unwrap();
        let reopened = grace
            .open(box_id, GraceReason::PaymentFailed, GraceOverrides::default())
            .await
            .unwrap();
        assert!(!reopened.was_existing);
        assert_ne!(reopened.period.id, first.period.id);
    }
}
