//! Billing event store
//!
//! Every inbound gateway event is claimed here before any handler runs. The
//! claim is a single atomic upsert keyed on the provider's event id, so
//! duplicate deliveries and concurrent workers settle at the database: one
//! caller gets `Claimed`, everyone else observing a processed record gets
//! `AlreadyProcessed`.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

/// Retry budget for failed events before they need manual attention
pub const MAX_EVENT_RETRIES: i32 = 5;

/// A stored billing event
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct BillingEvent {
    pub id: Uuid,
    pub external_id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub status: String,
    pub processed: bool,
    pub handled: Option<bool>,
    pub retry_count: i32,
    pub last_error: Option<String>,
    pub created_at: OffsetDateTime,
    pub processed_at: Option<OffsetDateTime>,
}

/// Result of attempting to claim an event for processing
#[derive(Debug, Clone)]
pub enum ClaimOutcome {
    /// This caller owns processing; the record reflects the claim
    Claimed(BillingEvent),
    /// The event already ran to completion; skip all side effects
    AlreadyProcessed(BillingEvent),
}

/// Durable store for inbound billing events
#[derive(Clone)]
pub struct EventStore {
    pool: PgPool,
}

impl EventStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Claim an event by external id.
    ///
    /// First delivery inserts the record as `processing`. A redelivery of an
    /// unfinished event re-claims it and bumps `retry_count`. A redelivery
    /// of a processed event changes nothing and reports `AlreadyProcessed`.
    pub async fn claim(
        &self,
        external_id: &str,
        event_type: &str,
        payload: &serde_json::Value,
    ) -> BillingResult<ClaimOutcome> {
        let event: BillingEvent = sqlx::query_as(
            r#"
            INSERT INTO billing_events (external_id, event_type, payload, status, processed)
            VALUES ($1, $2, $3, 'processing', false)
            ON CONFLICT (external_id) DO UPDATE SET
                status = CASE
                    WHEN billing_events.processed THEN billing_events.status
                    ELSE 'processing'
                END,
                retry_count = CASE
                    WHEN billing_events.processed THEN billing_events.retry_count
                    ELSE billing_events.retry_count + 1
                END
            RETURNING *
            "#,
        )
        .bind(external_id)
        .bind(event_type)
        .bind(payload)
        .fetch_one(&self.pool)
        .await?;

        if event.processed {
            tracing::debug!(
                external_id = %external_id,
                event_type = %event_type,
                "Duplicate delivery of processed event"
            );
            return Ok(ClaimOutcome::AlreadyProcessed(event));
        }

        if event.retry_count > 0 {
            tracing::info!(
                external_id = %external_id,
                retry_count = event.retry_count,
                "Re-claimed unfinished event"
            );
        }

        Ok(ClaimOutcome::Claimed(event))
    }

    /// Finalize a successfully processed event. `handled = false` means the
    /// event type was recognized as not ours; it still never runs again.
    pub async fn mark_processed(&self, id: Uuid, handled: bool) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE billing_events
            SET status = 'processed', processed = true, handled = $2,
                last_error = NULL, processed_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(handled)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record a handler failure. The event stays unprocessed and eligible
    /// for retry until `MAX_EVENT_RETRIES`.
    pub async fn mark_failed(&self, id: Uuid, error: &str) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE billing_events
            SET status = 'failed', last_error = $2
            WHERE id = $1 AND processed = false
            "#,
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Failed events still within their retry budget, oldest first
    pub async fn failed_events(&self, max_retries: i32) -> BillingResult<Vec<BillingEvent>> {
        Ok(sqlx::query_as::<_, BillingEvent>(
            r#"
            SELECT * FROM billing_events
            WHERE status = 'failed' AND processed = false AND retry_count < $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(max_retries)
        .fetch_all(&self.pool)
        .await?)
    }

    pub async fn find_by_external_id(
        &self,
        external_id: &str,
    ) -> BillingResult<Option<BillingEvent>> {
        Ok(sqlx::query_as::<_, BillingEvent>(
            "SELECT * FROM billing_events WHERE external_id = $1",
        )
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(status: &str, processed: bool, retry_count: i32) -> BillingEvent {
        BillingEvent {
            id: Uuid::new_v4(),
            external_id: "evt_test_1".to_string(),
            event_type: "invoice.payment_failed".to_string(),
            payload: serde_json::json!({}),
            status: status.to_string(),
            processed,
            handled: None,
            retry_count,
            last_error: None,
            created_at: OffsetDateTime::now_utc(),
            processed_at: None,
        }
    }

    #[test]
    fn test_retry_budget_predicate() {
        // Mirrors the failed_events WHERE clause
        let eligible = |e: &BillingEvent| {
            e.status == "failed" && !e.processed && e.retry_count < MAX_EVENT_RETRIES
        };

        assert!(eligible(&event("failed", false, 0)));
        assert!(eligible(&event("failed", false, MAX_EVENT_RETRIES - 1)));
        assert!(!eligible(&event("failed", false, MAX_EVENT_RETRIES)));
        assert!(!eligible(&event("processed", true, 0)));
        assert!(!eligible(&event("processing", false, 1)));
    }

    #[sqlx::test(migrations = "../../migrations")]
    async fn duplicate_delivery_settles_as_already_processed(pool: PgPool) {
        let store = EventStore::new(pool);
        let payload = serde_json::json!({"data": {"object": {"id": "sub_1"}}});

        let ClaimOutcome::Claimed(record) =
            store.claim("evt_dup", "invoice.paid", &payload).await.unwrap()
        else {
            panic!("first delivery must claim");
        };
        store.mark_processed(record.id, true).await.unwrap();

        // Redelivery changes nothing and reports the processed record
        match store.claim("evt_dup", "invoice.paid", &payload).await.unwrap() {
            ClaimOutcome::AlreadyProcessed(event) => {
                assert!(event.processed);
                assert_eq!(event.handled, Some(true));
                assert_eq!(event.retry_count, 0);
            }
            ClaimOutcome::Claimed(_) => panic!("processed event must not be re-claimed"),
        }
    }

    #[sqlx::test(migrations = "../../migrations")]
    async fn failed_event_reclaims_within_budget(pool: PgPool) {
        let store = EventStore::new(pool);
        let payload = serde_json::json!({});

        let ClaimOutcome::Claimed(record) = store
            .claim("evt_fail", "invoice.payment_failed", &payload)
            .await
            .unwrap()
        else {
            panic!("first delivery must claim");
        };
        store.mark_failed(record.id, "handler error").await.unwrap();

        // An unfinished redelivery re-claims and bumps the retry count
        let ClaimOutcome::Claimed(retried) = store
            .claim("evt_fail", "invoice.payment_failed", &payload)
            .await
            .unwrap()
        else {
            panic!("unfinished event must be re-claimed");
        };
        assert_eq!(retried.retry_count, 1);
        store.mark_failed(retried.id, "handler error").await.unwrap();

        assert_eq!(store.failed_events(MAX_EVENT_RETRIES).await.unwrap().len(), 1);
        // A tighter budget excludes the event
        assert!(store.failed_events(1).await.unwrap().is_empty());
    }
}
