//! Notification dispatch
//!
//! Billing only ever *creates* notifications; content formatting and channel
//! delivery live elsewhere. Dispatch is always best-effort relative to the
//! billing transaction: call sites log failures and move on, so a dead
//! notification service can never corrupt billing state.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use boxhq_shared::{BoxId, UserId};

use crate::error::BillingResult;

/// Notification priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationPriority {
    Low,
    Normal,
    High,
    Urgent,
}

impl NotificationPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationPriority::Low => "low",
            NotificationPriority::Normal => "normal",
            NotificationPriority::High => "high",
            NotificationPriority::Urgent => "urgent",
        }
    }
}

/// A request to create a billing notification
#[derive(Debug, Clone, Serialize)]
pub struct NotificationRequest {
    pub box_id: BoxId,
    pub user_id: Option<UserId>,
    pub notification_type: String,
    pub priority: NotificationPriority,
    pub title: String,
    pub message: String,
    pub action_url: Option<String>,
    pub channels: Vec<String>,
    pub data: serde_json::Value,
    /// Deterministic per logical event so repeated triggers do not spam
    /// duplicates, e.g. `limit_exceeded_{box}_{role}_{overage}`.
    pub dedup_key: String,
}

impl NotificationRequest {
    pub fn new(box_id: BoxId, notification_type: &str, dedup_key: String) -> Self {
        Self {
            box_id,
            user_id: None,
            notification_type: notification_type.to_string(),
            priority: NotificationPriority::Normal,
            title: String::new(),
            message: String::new(),
            action_url: None,
            channels: vec!["in_app".to_string()],
            data: serde_json::json!({}),
            dedup_key,
        }
    }

    pub fn priority(mut self, priority: NotificationPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn action_url(mut self, url: impl Into<String>) -> Self {
        self.action_url = Some(url.into());
        self
    }

    pub fn data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }
}

/// Collaborator interface for creating notifications
#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
    async fn create_notification(&self, request: NotificationRequest) -> BillingResult<()>;
}

/// Dispatcher writing into the shared notifications inbox table.
///
/// The dedup key has a unique index, so re-dispatching the same logical
/// notification is a no-op.
#[derive(Clone)]
pub struct DbNotificationDispatcher {
    pool: PgPool,
}

impl DbNotificationDispatcher {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl NotificationDispatcher for DbNotificationDispatcher {
    async fn create_notification(&self, request: NotificationRequest) -> BillingResult<()> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO notifications (
                box_id, user_id, notification_type, category, priority,
                title, message, action_url, channels, data, dedup_key
            )
            VALUES ($1, $2, $3, 'billing', $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (dedup_key) DO NOTHING
            "#,
        )
        .bind(request.box_id)
        .bind(request.user_id)
        .bind(&request.notification_type)
        .bind(request.priority.as_str())
        .bind(&request.title)
        .bind(&request.message)
        .bind(&request.action_url)
        .bind(&request.channels)
        .bind(&request.data)
        .bind(&request.dedup_key)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if inserted == 0 {
            tracing::debug!(
                dedup_key = %request.dedup_key,
                "Notification already exists, skipped"
            );
        } else {
            tracing::info!(
                box_id = %request.box_id,
                notification_type = %request.notification_type,
                dedup_key = %request.dedup_key,
                "Created billing notification"
            );
        }

        Ok(())
    }
}

/// No-op dispatcher for tests and minimal deployments
#[derive(Debug, Clone, Default)]
pub struct NoopNotificationDispatcher;

#[async_trait]
impl NotificationDispatcher for NoopNotificationDispatcher {
    async fn create_notification(&self, request: NotificationRequest) -> BillingResult<()> {
        tracing::debug!(
            box_id = %request.box_id,
            notification_type = %request.notification_type,
            "Notification dispatch disabled, dropping"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let box_id = BoxId::new();
        let request = NotificationRequest::new(box_id, "payment_failed", format!("pf_{}", box_id))
            .priority(NotificationPriority::Urgent)
            .title("Payment failed")
            .message("We could not charge your card.");

        assert_eq!(request.notification_type, "payment_failed");
        assert_eq!(request.priority, NotificationPriority::Urgent);
        assert_eq!(request.channels, vec!["in_app".to_string()]);
        assert!(request.dedup_key.starts_with("pf_"));
    }
}
