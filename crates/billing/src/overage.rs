//! Overage billing engine
//!
//! Converts seats used above a plan's limit into a billed charge at the end
//! of each billing period. The arithmetic is a pure function; the billing
//! record is idempotent per (box, period) via a unique constraint, so a
//! re-run of the monthly job never double-charges a box.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use time::OffsetDateTime;
use uuid::Uuid;

use boxhq_shared::{BoxId, MemberRole};

use crate::error::{is_unique_violation, BillingError, BillingResult};
use crate::notify::{NotificationDispatcher, NotificationPriority, NotificationRequest};
use crate::usage::{BoxUsage, UsageService};

/// Tenants processed per batch in the monthly run
const OVERAGE_BATCH_SIZE: usize = 10;
/// Pause between batches so the run never saturates the pool
const OVERAGE_BATCH_DELAY_MS: u64 = 500;

/// Overage for one role in one period
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverageLineItem {
    pub role: MemberRole,
    pub limit: i64,
    pub used: i64,
    pub overage_quantity: i64,
    pub rate_cents: i64,
    pub amount_cents: i64,
}

/// Pure overage arithmetic: seats over the limit times the per-seat rate.
/// At or below the limit there is nothing to bill.
pub fn calculate_overage(
    role: MemberRole,
    used: i64,
    limit: i64,
    rate_cents: i64,
) -> Option<OverageLineItem> {
    let overage_quantity = used - limit;
    if overage_quantity <= 0 {
        return None;
    }
    Some(OverageLineItem {
        role,
        limit,
        used,
        overage_quantity,
        rate_cents,
        amount_cents: overage_quantity * rate_cents,
    })
}

/// Full-period breakdown over a usage snapshot: per-role line items and the
/// total, or `None` when no role is over its limit. Pure function of the
/// snapshot; the same inputs always produce the same breakdown.
pub fn calculate_overage_for_period(usage: &BoxUsage) -> Option<(Vec<OverageLineItem>, i64)> {
    let mut line_items = Vec::new();
    for role in MemberRole::all() {
        let role_usage = usage.role_usage(role);
        if let Some(item) = calculate_overage(
            role,
            role_usage.current,
            role_usage.limit,
            role_usage.overage_rate_cents,
        ) {
            line_items.push(item);
        }
    }
    if line_items.is_empty() {
        return None;
    }
    let total = line_items.iter().map(|item| item.amount_cents).sum();
    Some((line_items, total))
}

/// A persisted overage billing record
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct OverageBilling {
    pub id: Uuid,
    pub box_id: BoxId,
    pub period_start: OffsetDateTime,
    pub period_end: OffsetDateTime,
    pub line_items: serde_json::Value,
    pub total_amount_cents: i64,
    pub order_id: Option<Uuid>,
    pub status: String,
    pub created_at: OffsetDateTime,
}

/// Outcome of creating an overage record for one box and period
#[derive(Debug, Clone)]
pub enum OverageOutcome {
    /// New record and order created
    Billed(OverageBilling),
    /// A record for this (box, period) already existed
    AlreadyBilled(OverageBilling),
    /// No usage above any limit this period
    NoOverage,
}

/// One box's result within a monthly run
#[derive(Debug, Clone)]
pub struct TenantOverageResult {
    pub box_id: BoxId,
    pub result: BillingResult<OverageOutcome>,
}

/// Summary of a monthly overage run
#[derive(Debug, Default)]
pub struct OverageRunSummary {
    pub candidates: usize,
    pub billed: usize,
    pub already_billed: usize,
    pub no_overage: usize,
    pub failed: usize,
    pub total_billed_cents: i64,
    pub results: Vec<TenantOverageResult>,
}

impl OverageRunSummary {
    fn record(&mut self, result: TenantOverageResult) {
        match &result.result {
            Ok(OverageOutcome::Billed(record)) => {
                self.billed += 1;
                self.total_billed_cents += record.total_amount_cents;
            }
            Ok(OverageOutcome::AlreadyBilled(_)) => self.already_billed += 1,
            Ok(OverageOutcome::NoOverage) => self.no_overage += 1,
            Err(_) => self.failed += 1,
        }
        self.results.push(result);
    }
}

/// Overage billing service
#[derive(Clone)]
pub struct OverageService {
    pool: PgPool,
    usage: UsageService,
    notifier: Arc<dyn NotificationDispatcher>,
}

impl OverageService {
    pub fn new(
        pool: PgPool,
        usage: UsageService,
        notifier: Arc<dyn NotificationDispatcher>,
    ) -> Self {
        Self {
            pool,
            usage,
            notifier,
        }
    }

    pub async fn find_for_period(
        &self,
        box_id: BoxId,
        period_start: OffsetDateTime,
        period_end: OffsetDateTime,
    ) -> BillingResult<Option<OverageBilling>> {
        Ok(sqlx::query_as::<_, OverageBilling>(
            r#"
            SELECT * FROM overage_billing
            WHERE box_id = $1 AND period_start = $2 AND period_end = $3
            "#,
        )
        .bind(box_id)
        .bind(period_start)
        .bind(period_end)
        .fetch_optional(&self.pool)
        .await?)
    }

    /// Bill a box's overage for one period.
    ///
    /// Computes current usage, builds the per-role line items, then inserts
    /// the billing record and its payable order in one transaction. The
    /// unique constraint on (box, period) turns a concurrent duplicate into
    /// `AlreadyBilled` with the winning record.
    pub async fn create_overage_billing(
        &self,
        box_id: BoxId,
        period_start: OffsetDateTime,
        period_end: OffsetDateTime,
    ) -> BillingResult<OverageOutcome> {
        if let Some(existing) = self.find_for_period(box_id, period_start, period_end).await? {
            return Ok(OverageOutcome::AlreadyBilled(existing));
        }

        let usage = self.usage.compute_usage(box_id).await?;

        let Some((line_items, total_amount_cents)) = calculate_overage_for_period(&usage) else {
            return Ok(OverageOutcome::NoOverage);
        };

        let line_items_json = serde_json::to_value(&line_items)
            .map_err(|e| BillingError::InvalidState(format!("line item encoding: {}", e)))?;

        let mut tx = self.pool.begin().await?;

        let order_id: Uuid = sqlx::query_scalar(
            r#"
            INSERT INTO orders (box_id, order_type, description, amount_cents, status)
            VALUES ($1, 'overage', $2, $3, 'pending')
            RETURNING id
            "#,
        )
        .bind(box_id)
        .bind(format!(
            "Member overage for {} - {}",
            period_start.date(),
            period_end.date()
        ))
        .bind(total_amount_cents)
        .fetch_one(&mut *tx)
        .await?;

        let inserted: Result<OverageBilling, sqlx::Error> = sqlx::query_as(
            r#"
            INSERT INTO overage_billing (
                box_id, period_start, period_end, line_items,
                total_amount_cents, order_id, status
            )
            VALUES ($1, $2, $3, $4, $5, $6, 'pending')
            RETURNING *
            "#,
        )
        .bind(box_id)
        .bind(period_start)
        .bind(period_end)
        .bind(&line_items_json)
        .bind(total_amount_cents)
        .bind(order_id)
        .fetch_one(&mut *tx)
        .await;

        let record = match inserted {
            Ok(record) => record,
            Err(e) if is_unique_violation(&e) => {
                // Lost the race to a concurrent run; roll back our order and
                // return the record that won.
                tx.rollback().await?;
                let existing = self
                    .find_for_period(box_id, period_start, period_end)
                    .await?
                    .ok_or(BillingError::Conflict(
                        "overage record vanished after unique violation".to_string(),
                    ))?;
                return Ok(OverageOutcome::AlreadyBilled(existing));
            }
            Err(e) => return Err(e.into()),
        };

        tx.commit().await?;

        tracing::info!(
            box_id = %box_id,
            overage_id = %record.id,
            total_cents = total_amount_cents,
            items = line_items.len(),
            "Created overage billing record"
        );

        self.notify_overage_billed(box_id, &record).await;

        Ok(OverageOutcome::Billed(record))
    }

    async fn notify_overage_billed(&self, box_id: BoxId, record: &OverageBilling) {
        let request = NotificationRequest::new(
            box_id,
            "overage_billed",
            format!("overage_billed_{}_{}", box_id, record.id),
        )
        .priority(NotificationPriority::Normal)
        .title("Overage charge created")
        .message(format!(
            "Your box used more seats than your plan includes. An overage charge of ${:.2} was created.",
            record.total_amount_cents as f64 / 100.0
        ))
        .action_url("https://app.boxhq.io/billing")
        .data(serde_json::json!({
            "overage_id": record.id,
            "total_amount_cents": record.total_amount_cents,
        }));

        if let Err(e) = self.notifier.create_notification(request).await {
            tracing::warn!(box_id = %box_id, error = %e, "Failed to send overage notification");
        }
    }

    /// Monthly run: bill overage for every overage-enabled box with a live
    /// paid subscription whose period just ended.
    ///
    /// Tenants are processed in bounded batches with a pause between
    /// batches. A failing tenant is recorded and never aborts the run; the
    /// summary carries every tenant's result.
    pub async fn process_monthly_overage_billing(&self) -> BillingResult<OverageRunSummary> {
        let candidates: Vec<(BoxId, OffsetDateTime, OffsetDateTime)> = sqlx::query_as(
            r#"
            SELECT b.id, s.current_period_start, s.current_period_end
            FROM boxes b
            JOIN subscriptions s ON s.box_id = b.id
            WHERE b.overage_enabled = true
              AND s.status IN ('active', 'past_due')
              AND s.current_period_end <= NOW()
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut summary = OverageRunSummary {
            candidates: candidates.len(),
            ..Default::default()
        };

        tracing::info!(candidates = candidates.len(), "Starting monthly overage run");

        for batch in candidates.chunks(OVERAGE_BATCH_SIZE) {
            for (box_id, period_start, period_end) in batch {
                let result = self
                    .create_overage_billing(*box_id, *period_start, *period_end)
                    .await;

                if let Err(e) = &result {
                    tracing::error!(
                        box_id = %box_id,
                        error = %e,
                        "Overage billing failed for box"
                    );
                }

                summary.record(TenantOverageResult {
                    box_id: *box_id,
                    result,
                });
            }

            if batch.len() == OVERAGE_BATCH_SIZE {
                tokio::time::sleep(StdDuration::from_millis(OVERAGE_BATCH_DELAY_MS)).await;
            }
        }

        tracing::info!(
            candidates = summary.candidates,
            billed = summary.billed,
            already_billed = summary.already_billed,
            no_overage = summary.no_overage,
            failed = summary.failed,
            total_billed_cents = summary.total_billed_cents,
            "Monthly overage run complete"
        );

        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_calculate_overage_above_limit() {
        let item = calculate_overage(MemberRole::Athlete, 80, 75, 100).unwrap();
        assert_eq!(item.overage_quantity, 5);
        assert_eq!(item.amount_cents, 500);
    }

    #[test]
    fn test_calculate_overage_at_or_below_limit() {
        assert!(calculate_overage(MemberRole::Athlete, 75, 75, 100).is_none());
        assert!(calculate_overage(MemberRole::Coach, 3, 5, 100).is_none());
    }

    #[test]
    fn test_period_breakdown() {
        let usage = BoxUsage {
            box_id: BoxId::new(),
            overage_enabled: true,
            athletes: crate::usage::RoleUsage {
                role: MemberRole::Athlete,
                current: 80,
                limit: 75,
                percentage: 106.7,
                over_limit: true,
                overage_quantity: 5,
                overage_rate_cents: 100,
                estimated_overage_cents: 500,
            },
            coaches: crate::usage::RoleUsage {
                role: MemberRole::Coach,
                current: 4,
                limit: 5,
                percentage: 80.0,
                over_limit: false,
                overage_quantity: 0,
                overage_rate_cents: 100,
                estimated_overage_cents: 0,
            },
            computed_at: OffsetDateTime::now_utc(),
        };

        let (items, total) = calculate_overage_for_period(&usage).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].role, MemberRole::Athlete);
        assert_eq!(total, 500);

        let mut within = usage.clone();
        within.athletes.current = 70;
        within.athletes.over_limit = false;
        within.athletes.overage_quantity = 0;
        assert!(calculate_overage_for_period(&within).is_none());
    }

    #[test]
    fn test_run_summary_accounting() {
        let mut summary = OverageRunSummary::default();
        let record = OverageBilling {
            id: Uuid::new_v4(),
            box_id: BoxId::new(),
            period_start: OffsetDateTime::now_utc(),
            period_end: OffsetDateTime::now_utc(),
            line_items: serde_json::json!([]),
            total_amount_cents: 500,
            order_id: None,
            status: "pending".to_string(),
            created_at: OffsetDateTime::now_utc(),
        };

        summary.record(TenantOverageResult {
            box_id: record.box_id,
            result: Ok(OverageOutcome::Billed(record.clone())),
        });
        summary.record(TenantOverageResult {
            box_id: BoxId::new(),
            result: Ok(OverageOutcome::AlreadyBilled(record)),
        });
        summary.record(TenantOverageResult {
            box_id: BoxId::new(),
            result: Ok(OverageOutcome::NoOverage),
        });
        summary.record(TenantOverageResult {
            box_id: BoxId::new(),
            result: Err(BillingError::Conflict("lost race".to_string())),
        });

        assert_eq!(summary.billed, 1);
        assert_eq!(summary.already_billed, 1);
        assert_eq!(summary.no_overage, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.total_billed_cents, 500);
    }
}
