//! Plan catalog
//!
//! Plans are versioned; only one version per tier is current. Changing a
//! plan's limits or price creates a new version so historical overage and
//! proration records keep pointing at the terms that were actually sold.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use boxhq_shared::MemberRole;

use crate::error::{BillingError, BillingResult};

/// Fallback per-seat overage rate in cents when the plan does not carry one
pub const DEFAULT_OVERAGE_RATE_CENTS: i64 = 100;

/// A versioned subscription plan
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Plan {
    pub id: Uuid,
    pub tier: String,
    pub version: i32,
    pub is_current: bool,
    pub athlete_limit: i32,
    pub coach_limit: i32,
    pub monthly_price_cents: i64,
    pub athlete_overage_rate_cents: Option<i64>,
    pub coach_overage_rate_cents: Option<i64>,
    pub stripe_price_id: Option<String>,
    pub created_at: OffsetDateTime,
}

impl Plan {
    pub fn limit_for_role(&self, role: MemberRole) -> i64 {
        match role {
            MemberRole::Athlete => self.athlete_limit as i64,
            MemberRole::Coach => self.coach_limit as i64,
        }
    }

    /// Per-seat overage rate, falling back to the hard default
    pub fn overage_rate_for_role(&self, role: MemberRole) -> i64 {
        let rate = match role {
            MemberRole::Athlete => self.athlete_overage_rate_cents,
            MemberRole::Coach => self.coach_overage_rate_cents,
        };
        rate.unwrap_or(DEFAULT_OVERAGE_RATE_CENTS)
    }
}

/// Read-side service over the plan catalog
#[derive(Clone)]
pub struct PlanService {
    pool: PgPool,
}

impl PlanService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn plan_by_id(&self, plan_id: Uuid) -> BillingResult<Plan> {
        sqlx::query_as::<_, Plan>("SELECT * FROM plans WHERE id = $1")
            .bind(plan_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("plan {} not found", plan_id)))
    }

    pub async fn find_plan(&self, plan_id: Uuid) -> BillingResult<Option<Plan>> {
        Ok(sqlx::query_as::<_, Plan>("SELECT * FROM plans WHERE id = $1")
            .bind(plan_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    /// The current version for a tier, if the tier exists
    pub async fn current_plan_for_tier(&self, tier: &str) -> BillingResult<Option<Plan>> {
        Ok(sqlx::query_as::<_, Plan>(
            "SELECT * FROM plans WHERE tier = $1 AND is_current = true",
        )
        .bind(tier)
        .fetch_optional(&self.pool)
        .await?)
    }

    /// Look up the newest plan version selling a given gateway price
    pub async fn plan_by_stripe_price(&self, price_id: &str) -> BillingResult<Option<Plan>> {
        Ok(sqlx::query_as::<_, Plan>(
            "SELECT * FROM plans WHERE stripe_price_id = $1 ORDER BY version DESC LIMIT 1",
        )
        .bind(price_id)
        .fetch_optional(&self.pool)
        .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(athlete_rate: Option<i64>) -> Plan {
        Plan {
            id: Uuid::new_v4(),
            tier: "grow".to_string(),
            version: 1,
            is_current: true,
            athlete_limit: 75,
            coach_limit: 5,
            monthly_price_cents: 9900,
            athlete_overage_rate_cents: athlete_rate,
            coach_overage_rate_cents: None,
            stripe_price_id: Some("price_grow_monthly".to_string()),
            created_at: OffsetDateTime::now_utc(),
        }
    }

    #[test]
    fn test_limit_for_role() {
        let plan = plan(Some(150));
        assert_eq!(plan.limit_for_role(MemberRole::Athlete), 75);
        assert_eq!(plan.limit_for_role(MemberRole::Coach), 5);
    }

    #[test]
    fn test_overage_rate_fallback() {
        let plan = plan(None);
        assert_eq!(
            plan.overage_rate_for_role(MemberRole::Athlete),
            DEFAULT_OVERAGE_RATE_CENTS
        );
        let plan = self::plan(Some(150));
        assert_eq!(plan.overage_rate_for_role(MemberRole::Athlete), 150);
    }
}
