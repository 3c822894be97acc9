//! Subscription snapshots
//!
//! The payments provider delivers subscription updates as a current snapshot
//! plus the previous values of whatever changed. Both halves are validated
//! into typed structures here, once, so the classifier and handlers never
//! touch loose JSON. Snapshots are constructed per inbound event and
//! discarded after handling.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use crate::error::{EngineError, EngineResult};

/// Billing model of a line item's price
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageType {
    /// Fixed seat count billed up front
    #[default]
    Licensed,
    /// Usage reported during the period
    Metered,
}

/// Provider subscription status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Trialing,
    PastDue,
    Canceled,
    Unpaid,
    Incomplete,
    /// Any status this engine has no special handling for
    #[serde(other)]
    Unknown,
}

/// One subscription line item
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionItem {
    pub id: String,
    #[serde(default)]
    pub quantity: Option<u64>,
    #[serde(with = "time::serde::timestamp")]
    pub current_period_start: OffsetDateTime,
    #[serde(with = "time::serde::timestamp")]
    pub current_period_end: OffsetDateTime,
    #[serde(default)]
    pub usage_type: UsageType,
}

/// Current attributes of a subscription at event time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionSnapshot {
    pub id: String,
    #[serde(default)]
    pub customer_id: Option<String>,
    pub status: SubscriptionStatus,
    #[serde(default)]
    pub cancel_at_period_end: bool,
    #[serde(default, with = "time::serde::timestamp::option")]
    pub cancel_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::timestamp::option")]
    pub trial_start: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::timestamp::option")]
    pub trial_end: Option<OffsetDateTime>,
    #[serde(default)]
    pub items: Vec<SubscriptionItem>,
}

impl SubscriptionSnapshot {
    /// Earliest `current_period_start` across line items, if any exist.
    /// This anchors the renewal idempotency key.
    pub fn earliest_period_start(&self) -> Option<OffsetDateTime> {
        self.items.iter().map(|i| i.current_period_start).min()
    }
}

/// The previous values of attributes that changed in this update.
/// Every field is optional: only what changed is present.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PreviousAttributes {
    pub status: Option<SubscriptionStatus>,
    pub cancel_at_period_end: Option<bool>,
    #[serde(with = "time::serde::timestamp::option")]
    pub cancel_at: Option<OffsetDateTime>,
    pub items: Option<Vec<SubscriptionItem>>,
}

impl PreviousAttributes {
    /// Look up the previous version of a line item by id.
    pub fn item(&self, item_id: &str) -> Option<&SubscriptionItem> {
        self.items
            .as_ref()
            .and_then(|items| items.iter().find(|i| i.id == item_id))
    }

    /// Earliest previous `current_period_start`, when the update carried
    /// previous items.
    pub fn earliest_period_start(&self) -> Option<OffsetDateTime> {
        self.items
            .as_ref()
            .and_then(|items| items.iter().map(|i| i.current_period_start).min())
    }
}

/// Validated payload of a subscription update event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdatePayload {
    pub subscription: SubscriptionSnapshot,
    #[serde(default)]
    pub previous_attributes: PreviousAttributes,
}

impl UpdatePayload {
    /// Validate an envelope detail into a typed update payload. Missing or
    /// mistyped required fields are permanent per-message failures.
    pub fn from_detail(detail: &Value) -> EngineResult<Self> {
        serde_json::from_value(detail.clone())
            .map_err(|e| EngineError::MalformedEvent(format!("invalid update payload: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn snapshot_parses_from_provider_shape() {
        let detail = json!({
            "subscription": {
                "id": "sub_1",
                "customer_id": "cus_9",
                "status": "active",
                "cancel_at_period_end": false,
                "items": [
                    {
                        "id": "si_1",
                        "quantity": 5,
                        "current_period_start": 1772323200,
                        "current_period_end": 1774742400,
                        "usage_type": "licensed"
                    },
                    {
                        "id": "si_2",
                        "current_period_start": 1772323200,
                        "current_period_end": 1774742400,
                        "usage_type": "metered"
                    }
                ]
            },
            "previous_attributes": {
                "items": [
                    {
                        "id": "si_1",
                        "quantity": 2,
                        "current_period_start": 1772323200,
                        "current_period_end": 1774742400
                    }
                ]
            }
        });

        let payload = UpdatePayload::from_detail(&detail).unwrap();
        assert_eq!(payload.subscription.id, "sub_1");
        assert_eq!(payload.subscription.status, SubscriptionStatus::Active);
        assert_eq!(payload.subscription.items.len(), 2);
        assert_eq!(payload.subscription.items[0].quantity, Some(5));
        assert_eq!(payload.subscription.items[1].quantity, None);
        assert_eq!(payload.subscription.items[1].usage_type, UsageType::Metered);
        assert_eq!(
            payload.previous_attributes.item("si_1").and_then(|i| i.quantity),
            Some(2)
        );
        assert!(payload.previous_attributes.item("si_2").is_none());
    }

    #[test]
    fn unknown_status_falls_back() {
        let snapshot: SubscriptionSnapshot = serde_json::from_value(json!({
            "id": "sub_1",
            "status": "paused",
            "items": []
        }))
        .unwrap();
        assert_eq!(snapshot.status, SubscriptionStatus::Unknown);
    }

    #[test]
    fn missing_previous_attributes_defaults_to_empty() {
        let payload = UpdatePayload::from_detail(&json!({
            "subscription": {"id": "sub_1", "status": "active", "items": []}
        }))
        .unwrap();
        assert!(payload.previous_attributes.items.is_none());
        assert!(payload.previous_attributes.cancel_at.is_none());
    }

    #[test]
    fn missing_subscription_is_malformed() {
        let result = UpdatePayload::from_detail(&json!({"previous_attributes": {}}));
        assert!(matches!(result, Err(EngineError::MalformedEvent(_))));
    }

    #[test]
    fn earliest_period_start_takes_the_minimum() {
        let snapshot: SubscriptionSnapshot = serde_json::from_value(json!({
            "id": "sub_1",
            "status": "active",
            "items": [
                {"id": "si_1", "current_period_start": 200, "current_period_end": 300},
                {"id": "si_2", "current_period_start": 100, "current_period_end": 300}
            ]
        }))
        .unwrap();
        assert_eq!(
            snapshot.earliest_period_start().map(|t| t.unix_timestamp()),
            Some(100)
        );
    }
}
