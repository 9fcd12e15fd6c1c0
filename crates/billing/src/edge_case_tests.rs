// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for Billing System
//!
//! Tests critical boundary conditions in:
//! - Overage calculations
//! - Proration arithmetic
//! - Grace period policy
//! - Subscription status handling
//! - Event routing and retry bounds
//! - Notification dedup keys

#[cfg(test)]
mod overage_tests {
    use crate::overage::calculate_overage;
    use boxhq_shared::MemberRole;

    // =========================================================================
    // One seat over the limit - smallest billable overage
    // =========================================================================
    #[test]
    fn test_single_seat_overage() {
        let item = calculate_overage(MemberRole::Athlete, 76, 75, 100).unwrap();
        assert_eq!(item.overage_quantity, 1);
        assert_eq!(item.amount_cents, 100);
    }

    // =========================================================================
    // Exactly at the limit - nothing billable
    // =========================================================================
    #[test]
    fn test_exactly_at_limit_no_charge() {
        assert!(calculate_overage(MemberRole::Athlete, 75, 75, 100).is_none());
    }

    // =========================================================================
    // Zero members against a positive limit
    // =========================================================================
    #[test]
    fn test_empty_box_no_charge() {
        assert!(calculate_overage(MemberRole::Athlete, 0, 75, 100).is_none());
    }

    // =========================================================================
    // Zero limit - every member is overage
    // =========================================================================
    #[test]
    fn test_zero_limit_bills_everything() {
        let item = calculate_overage(MemberRole::Coach, 3, 0, 200).unwrap();
        assert_eq!(item.overage_quantity, 3);
        assert_eq!(item.amount_cents, 600);
    }

    // =========================================================================
    // Large box - no overflow at realistic scales
    // =========================================================================
    #[test]
    fn test_large_overage_amounts() {
        let item = calculate_overage(MemberRole::Athlete, 100_000, 75, 250).unwrap();
        assert_eq!(item.overage_quantity, 99_925);
        assert_eq!(item.amount_cents, 24_981_250);
    }
}

#[cfg(test)]
mod proration_tests {
    use crate::proration::{prorated_amount, PlanChangeKind};

    // =========================================================================
    // Mid-period upgrade: 30-day period, 10 days left, 3000 -> 6000
    // =========================================================================
    #[test]
    fn test_upgrade_charges_difference_for_remaining_days() {
        assert_eq!(prorated_amount(3000, 6000, 30, 10), 1000);
    }

    // =========================================================================
    // Downgrade mirrors the upgrade as a credit
    // =========================================================================
    #[test]
    fn test_downgrade_credits_difference() {
        assert_eq!(prorated_amount(6000, 3000, 30, 10), -1000);
    }

    // =========================================================================
    // Change on the last day of the period
    // =========================================================================
    #[test]
    fn test_last_day_prorates_one_day() {
        assert_eq!(prorated_amount(3000, 6000, 30, 1), 100);
    }

    // =========================================================================
    // Change at the period boundary - nothing to prorate
    // =========================================================================
    #[test]
    fn test_period_boundary_prorates_nothing() {
        assert_eq!(prorated_amount(3000, 6000, 30, 0), 0);
        assert_eq!(prorated_amount(3000, 6000, 0, 0), 0);
    }

    // =========================================================================
    // Fractional daily rates round to the nearest cent
    // =========================================================================
    #[test]
    fn test_fractional_daily_rate_rounds() {
        // (10000 - 9900) / 31 per day * 7 days = 22.58 -> 23
        assert_eq!(prorated_amount(9900, 10000, 31, 7), 23);
    }

    // =========================================================================
    // Lateral move between equal-priced plans prorates to zero
    // =========================================================================
    #[test]
    fn test_lateral_change_is_free() {
        assert_eq!(prorated_amount(5000, 5000, 30, 15), 0);
        assert_eq!(PlanChangeKind::classify(5000, 5000), PlanChangeKind::Lateral);
    }
}

#[cfg(test)]
mod grace_period_tests {
    use crate::grace::{grace_policy, GraceReason, GraceSeverity};

    // =========================================================================
    // Policy table matches the documented enforcement windows
    // =========================================================================
    #[test]
    fn test_policy_durations() {
        assert_eq!(grace_policy(GraceReason::AthleteLimitExceeded).0, 14);
        assert_eq!(grace_policy(GraceReason::CoachLimitExceeded).0, 14);
        assert_eq!(grace_policy(GraceReason::TrialEnding).0, 7);
        assert_eq!(grace_policy(GraceReason::PaymentFailed).0, 3);
        assert_eq!(grace_policy(GraceReason::SubscriptionCanceled).0, 0);
        assert_eq!(grace_policy(GraceReason::BillingIssue).0, 7);
    }

    // =========================================================================
    // Cancellation is the only immediately-blocking reason
    // =========================================================================
    #[test]
    fn test_only_cancellation_blocks_immediately() {
        for reason in [
            GraceReason::AthleteLimitExceeded,
            GraceReason::CoachLimitExceeded,
            GraceReason::TrialEnding,
            GraceReason::PaymentFailed,
            GraceReason::BillingIssue,
        ] {
            let (days, severity) = grace_policy(reason);
            assert!(days > 0, "{:?} should allow a grace window", reason);
            assert_ne!(severity, GraceSeverity::Blocking);
        }

        let (days, severity) = grace_policy(GraceReason::SubscriptionCanceled);
        assert_eq!(days, 0);
        assert_eq!(severity, GraceSeverity::Blocking);
    }

    // =========================================================================
    // Reason strings survive a round trip through storage
    // =========================================================================
    #[test]
    fn test_reason_storage_round_trip() {
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
}

#[cfg(test)]
mod subscription_tests {
    use crate::subscriptions::{project_box_status, SubscriptionStatus};
    use boxhq_shared::BoxStatus;

    // =========================================================================
    // past_due keeps the box usable while its grace period runs
    // =========================================================================
    #[test]
    fn test_past_due_box_stays_active() {
        assert_eq!(project_box_status(SubscriptionStatus::PastDue), BoxStatus::Active);
    }

    // =========================================================================
    // Every terminal status suspends the box
    // =========================================================================
    #[test]
    fn test_terminal_statuses_suspend() {
        for status in [SubscriptionStatus::Canceled, SubscriptionStatus::Incomplete] {
            assert!(status.is_terminal());
            assert_eq!(project_box_status(status), BoxStatus::Suspended);
        }
    }

    // =========================================================================
    // Gateway status aliases normalize to our statuses
    // =========================================================================
    #[test]
    fn test_gateway_alias_normalization() {
        assert_eq!(
            SubscriptionStatus::parse("trialing").map(|s| s.as_str()),
            Some("trial")
        );
        assert_eq!(
            SubscriptionStatus::parse("incomplete_expired").map(|s| s.as_str()),
            Some("incomplete")
        );
    }
}

#[cfg(test)]
mod event_tests {
    use crate::events::MAX_EVENT_RETRIES;
    use crate::router::{EventKind, InboundEvent};
    use uuid::Uuid;

    // =========================================================================
    // Unknown event types route to Unknown, never to an error
    // =========================================================================
    #[test]
    fn test_unknown_event_types_are_tolerated() {
        for event_type in [
            "charge.refunded",
            "payment_intent.created",
            "invoice.finalized",
            "",
        ] {
            assert_eq!(EventKind::parse(event_type), EventKind::Unknown);
        }
    }

    // =========================================================================
    // Retry budget boundary
    // =========================================================================
    #[test]
    fn test_retry_budget_boundary() {
        assert!(MAX_EVENT_RETRIES - 1 < MAX_EVENT_RETRIES);
        assert!(MAX_EVENT_RETRIES > 0, "events must get at least one retry");
    }

    // =========================================================================
    // Inbound events deserialize from the provider envelope shape
    // =========================================================================
    #[test]
    fn test_inbound_event_envelope_deserialization() {
        let box_id = Uuid::new_v4();
        let raw = serde_json::json!({
            "id": "evt_1NirD82eZvKYlo2CIabcdef",
            "type": "customer.subscription.updated",
            "data": {
                "object": {
                    "id": "sub_1Nir",
                    "status": "past_due",
                    "metadata": { "box_id": box_id.to_string() }
                }
            }
        });

        let event: InboundEvent = serde_json::from_value(raw).unwrap();
        assert_eq!(event.event_type, "customer.subscription.updated");
        assert_eq!(EventKind::parse(&event.event_type), EventKind::SubscriptionUpdated);
        assert_eq!(
            event.data["object"]["metadata"]["box_id"],
            serde_json::json!(box_id.to_string())
        );
    }
}

#[cfg(test)]
mod notification_tests {
    use crate::notify::NotificationRequest;
    use boxhq_shared::BoxId;

    // =========================================================================
    // Dedup keys are deterministic per logical event
    // =========================================================================
    #[test]
    fn test_dedup_keys_deterministic() {
        let box_id = BoxId::new();
        let a = NotificationRequest::new(
            box_id,
            "approaching_member_limit",
            format!("approaching_limit_{}_athlete_68", box_id),
        );
        let b = NotificationRequest::new(
            box_id,
            "approaching_member_limit",
            format!("approaching_limit_{}_athlete_68", box_id),
        );
        assert_eq!(a.dedup_key, b.dedup_key);

        // A different count is a different logical event
        let c = NotificationRequest::new(
            box_id,
            "approaching_member_limit",
            format!("approaching_limit_{}_athlete_69", box_id),
        );
        assert_ne!(a.dedup_key, c.dedup_key);
    }
}
