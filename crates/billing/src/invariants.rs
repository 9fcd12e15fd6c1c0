//! Billing invariant checks
//!
//! Runnable consistency checks over the billing tables. Each check is a
//! read-only SQL query; violations carry enough context to debug without
//! reproducing the query by hand. The worker runs the full set nightly and
//! after webhook replays.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use boxhq_shared::BoxId;

use crate::error::BillingResult;

/// A single invariant violation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// Affected box
    pub box_id: BoxId,
    /// Human-readable description of the violation
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// System may be charging incorrectly
    Critical,
    /// Data inconsistency that needs attention
    High,
    /// Potential issue, should investigate
    Medium,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
        }
    }
}

/// Summary of a full invariant run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

#[derive(Debug, sqlx::FromRow)]
struct MultipleSubsRow {
    box_id: BoxId,
    sub_count: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct DuplicateGraceRow {
    box_id: BoxId,
    reason: String,
    period_count: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct DuplicateOverageRow {
    box_id: BoxId,
    period_start: OffsetDateTime,
    period_end: OffsetDateTime,
    record_count: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct UnapprovedRow {
    request_id: Uuid,
    box_id: BoxId,
    status: String,
}

#[derive(Debug, sqlx::FromRow)]
struct CanceledNoTimestampRow {
    sub_id: Uuid,
    box_id: BoxId,
}

/// Service for running billing invariant checks
pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run every invariant check and return a summary
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        violations.extend(self.check_single_active_subscription().await?);
        violations.extend(self.check_single_unresolved_grace_period().await?);
        violations.extend(self.check_unique_overage_per_period().await?);
        violations.extend(self.check_approved_requests_have_approver().await?);
        violations.extend(self.check_canceled_has_timestamp().await?);

        let checks_run = Self::available_checks().len();
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();
        let checks_passed = checks_run - checks_failed;

        Ok(InvariantCheckSummary {
            checked_at: now,
            checks_run,
            checks_passed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        })
    }

    /// At most one live subscription per box.
    ///
    /// Two live subscriptions would double-bill the box and make the
    /// status projection ambiguous.
    async fn check_single_active_subscription(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<MultipleSubsRow> = sqlx::query_as(
            r#"
            SELECT box_id, COUNT(*) as sub_count
            FROM subscriptions
            WHERE status IN ('trial', 'active', 'past_due', 'paused')
            GROUP BY box_id
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "single_active_subscription".to_string(),
                box_id: row.box_id,
                description: format!(
                    "Box has {} live subscriptions (expected 1)",
                    row.sub_count
                ),
                context: serde_json::json!({
                    "subscription_count": row.sub_count,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// At most one unresolved grace period per (box, reason)
    async fn check_single_unresolved_grace_period(
        &self,
    ) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<DuplicateGraceRow> = sqlx::query_as(
            r#"
            SELECT box_id, reason, COUNT(*) as period_count
            FROM grace_periods
            WHERE resolved = false
            GROUP BY box_id, reason
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "single_unresolved_grace_period".to_string(),
                box_id: row.box_id,
                description: format!(
                    "Box has {} unresolved grace periods for reason '{}' (expected at most 1)",
                    row.period_count, row.reason
                ),
                context: serde_json::json!({
                    "reason": row.reason,
                    "period_count": row.period_count,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// At most one overage record per (box, billing period)
    async fn check_unique_overage_per_period(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<DuplicateOverageRow> = sqlx::query_as(
            r#"
            SELECT box_id, period_start, period_end, COUNT(*) as record_count
            FROM overage_billing
            GROUP BY box_id, period_start, period_end
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "unique_overage_per_period".to_string(),
                box_id: row.box_id,
                description: format!(
                    "Box has {} overage records for period {} - {} (double-charge risk)",
                    row.record_count,
                    row.period_start.date(),
                    row.period_end.date()
                ),
                context: serde_json::json!({
                    "period_start": row.period_start,
                    "period_end": row.period_end,
                    "record_count": row.record_count,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Approved plan change requests must record who approved them
    async fn check_approved_requests_have_approver(
        &self,
    ) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<UnapprovedRow> = sqlx::query_as(
            r#"
            SELECT id as request_id, box_id, status
            FROM plan_change_requests
            WHERE status = 'approved' AND approved_by IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "approved_requests_have_approver".to_string(),
                box_id: row.box_id,
                description: "Approved plan change request has no approver recorded".to_string(),
                context: serde_json::json!({
                    "request_id": row.request_id,
                    "status": row.status,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Canceled subscriptions carry the cancellation timestamp
    async fn check_canceled_has_timestamp(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<CanceledNoTimestampRow> = sqlx::query_as(
            r#"
            SELECT id as sub_id, box_id
            FROM subscriptions
            WHERE status = 'canceled' AND canceled_at IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "canceled_has_timestamp".to_string(),
                box_id: row.box_id,
                description: "Canceled subscription has no canceled_at timestamp".to_string(),
                context: serde_json::json!({
                    "subscription_id": row.sub_id,
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Run a single invariant check by name
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            "single_active_subscription" => self.check_single_active_subscription().await,
            "single_unresolved_grace_period" => self.check_single_unresolved_grace_period().await,
            "unique_overage_per_period" => self.check_unique_overage_per_period().await,
            "approved_requests_have_approver" => {
                self.check_approved_requests_have_approver().await
            }
            "canceled_has_timestamp" => self.check_canceled_has_timestamp().await,
            _ => Ok(vec![]),
        }
    }

    /// Names of all available invariant checks
    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "single_active_subscription",
            "single_unresolved_grace_period",
            "unique_overage_per_period",
            "approved_requests_have_approver",
            "canceled_has_timestamp",
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_violation_severity_display() {
        assert_eq!(ViolationSeverity::Critical.to_string(), "CRITICAL");
        assert_eq!(ViolationSeverity::High.to_string(), "HIGH");
        assert_eq!(ViolationSeverity::Medium.to_string(), "MEDIUM");
    }

    #[test]
    fn test_available_checks() {
        let checks = InvariantChecker::available_checks();
        assert_eq!(checks.len(), 5);
        assert!(checks.contains(&"single_active_subscription"));
        assert!(checks.contains(&"unique_overage_per_period"));
    }
}
