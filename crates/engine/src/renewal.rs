//! Renewal handling
//!
//! A renewal is announced exactly once per billing period: the idempotency
//! key anchors on the subscription id plus the earliest period start across
//! line items, so redeliveries of one renewal collide while the next period
//! claims a fresh key. One aggregate event lists every item's renewed
//! period, with metered-usage items tagged distinctly from fixed seats.

use std::sync::Arc;

use serde_json::json;
use time::OffsetDateTime;

use crate::bus::{EventBus, EventEntry};
use crate::config::EngineConfig;
use crate::envelope::EventEnvelope;
use crate::error::{EngineError, EngineResult};
use crate::idempotency::{event_key, IdempotencyGuard};
use crate::snapshot::UpdatePayload;

/// Detail type of the aggregate renewal event
pub const RENEWAL_EVENT: &str = "subscription.renewed";

/// Renewal idempotency key: subscription id + earliest period start
pub fn renewal_key(subscription_id: &str, earliest_start: OffsetDateTime) -> String {
    event_key(RENEWAL_EVENT, subscription_id, earliest_start)
}

/// Handler for `Renewed` transitions
pub struct RenewalHandler {
    guard: Arc<IdempotencyGuard>,
    bus: Arc<dyn EventBus>,
    config: Arc<EngineConfig>,
}

impl RenewalHandler {
    pub fn new(
        guard: Arc<IdempotencyGuard>,
        bus: Arc<dyn EventBus>,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self { guard, bus, config }
    }

    /// Announce the renewal once. Returns false when this period was
    /// already announced by an earlier delivery.
    pub async fn handle(
        &self,
        envelope: &EventEnvelope,
        payload: &UpdatePayload,
    ) -> EngineResult<bool> {
        let subscription = &payload.subscription;
        let earliest_start = subscription.earliest_period_start().ok_or_else(|| {
            EngineError::MalformedEvent("renewal event with no line items".to_string())
        })?;

        let key = renewal_key(&subscription.id, earliest_start);
        let claim = self.guard.ensure(&key, None, None).await?;
        if claim.is_duplicate {
            tracing::info!(
                subscription_id = %subscription.id,
                period_start = earliest_start.unix_timestamp(),
                "Renewal period already announced"
            );
            return Ok(false);
        }

        let renewed_items: Vec<_> = subscription
            .items
            .iter()
            .map(|item| {
                json!({
                    "item_id": item.id,
                    "period_start": item.current_period_start.unix_timestamp(),
                    "period_end": item.current_period_end.unix_timestamp(),
                    "usage_type": item.usage_type,
                })
            })
            .collect();

        let entry = EventEntry {
            source: self.config.event_source.clone(),
            detail_type: RENEWAL_EVENT.to_string(),
            detail: json!({
                "subscription_id": subscription.id,
                "customer_id": subscription.customer_id,
                "period_start": earliest_start.unix_timestamp(),
                "renewed_items": renewed_items,
                "triggered_by": envelope.id,
            }),
            bus_name: self.config.primary_bus.clone(),
            time: Some(envelope.time),
        };

        let outcome = self.bus.publish(vec![entry]).await?;
        outcome.ensure_accepted()?;

        tracing::info!(
            subscription_id = %subscription.id,
            period_start = earliest_start.unix_timestamp(),
            items = subscription.items.len(),
            "Renewal announced"
        );

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InMemoryBus;
    use crate::ledger::{IdempotencyStore, InMemoryStore};
    use crate::snapshot::{
        PreviousAttributes, SubscriptionItem, SubscriptionSnapshot, SubscriptionStatus, UsageType,
    };
    use serde_json::json;
    use time::macros::datetime;
    use time::Duration;

    fn handler(bus: Arc<InMemoryBus>) -> RenewalHandler {
        RenewalHandler::new(
            Arc::new(IdempotencyGuard::new(
                Arc::new(InMemoryStore::new()) as Arc<dyn IdempotencyStore>
            )),
            bus,
            Arc::new(EngineConfig::default()),
        )
    }

    fn envelope(id: &str) -> EventEnvelope {
        EventEnvelope {
            id: id.to_string(),
            event_type: "customer.subscription.updated".to_string(),
            source: "payments.provider".to_string(),
            time: datetime!(2026-03-01 12:00:00 UTC),
            detail: json!({}),
        }
    }

    fn renewed_payload(period_start: OffsetDateTime) -> UpdatePayload {
        let licensed = SubscriptionItem {
            id: "si_1".to_string(),
            quantity: Some(4),
            current_period_start: period_start,
            current_period_end: period_start + Duration::days(30),
            usage_type: UsageType::Licensed,
        };
        let metered = SubscriptionItem {
            id: "si_2".to_string(),
            quantity: None,
            current_period_start: period_start,
            current_period_end: period_start + Duration::days(30),
            usage_type: UsageType::Metered,
        };
        UpdatePayload {
            subscription: SubscriptionSnapshot {
                id: "sub_1".to_string(),
                customer_id: Some("cus_1".to_string()),
                status: SubscriptionStatus::Active,
                cancel_at_period_end: false,
                cancel_at: None,
                trial_start: None,
                trial_end: None,
                items: vec![licensed, metered],
            },
            previous_attributes: PreviousAttributes::default(),
        }
    }

    #[tokio::test]
    async fn renewal_emits_one_aggregate_event() {
        let bus = Arc::new(InMemoryBus::new());
        let handler = handler(Arc::clone(&bus));
        let period = datetime!(2026-03-01 00:00:00 UTC);

        let announced = handler
            .handle(&envelope("evt_1"), &renewed_payload(period))
            .await
            .unwrap();

        assert!(announced);
        let published = bus.published().await;
        assert_eq!(published.len(), 1);
        let detail = &published[0].detail;
        assert_eq!(detail["renewed_items"].as_array().unwrap().len(), 2);
        assert_eq!(detail["renewed_items"][0]["usage_type"], "licensed");
        assert_eq!(detail["renewed_items"][1]["usage_type"], "metered");
    }

    #[tokio::test]
    async fn repeated_delivery_announces_once() {
        let bus = Arc::new(InMemoryBus::new());
        let handler = handler(Arc::clone(&bus));
        let period = datetime!(2026-03-01 00:00:00 UTC);

        let first = handler
            .handle(&envelope("evt_1"), &renewed_payload(period))
            .await
            .unwrap();
        // Redelivery carries a different envelope id but the same period
        let second = handler
            .handle(&envelope("evt_2"), &renewed_payload(period))
            .await
            .unwrap();

        assert!(first);
        assert!(!second);
        assert_eq!(bus.published().await.len(), 1);
    }

    #[tokio::test]
    async fn successive_periods_announce_separately() {
        let bus = Arc::new(InMemoryBus::new());
        let handler = handler(Arc::clone(&bus));

        let march = datetime!(2026-03-01 00:00:00 UTC);
        let april = datetime!(2026-04-01 00:00:00 UTC);

        assert!(handler
            .handle(&envelope("evt_1"), &renewed_payload(march))
            .await
            .unwrap());
        assert!(handler
            .handle(&envelope("evt_2"), &renewed_payload(april))
            .await
            .unwrap());
        assert_eq!(bus.published().await.len(), 2);
    }

    #[test]
    fn key_is_stable_per_period_and_distinct_across_periods() {
        let march = datetime!(2026-03-01 00:00:00 UTC);
        let april = datetime!(2026-04-01 00:00:00 UTC);

        assert_eq!(renewal_key("sub_1", march), renewal_key("sub_1", march));
        assert_ne!(renewal_key("sub_1", march), renewal_key("sub_1", april));
        assert_ne!(renewal_key("sub_1", march), renewal_key("sub_2", march));
    }

    #[tokio::test]
    async fn renewal_without_items_is_malformed() {
        let bus = Arc::new(InMemoryBus::new());
        let handler = handler(bus);
        let mut payload = renewed_payload(datetime!(2026-03-01 00:00:00 UTC));
        payload.subscription.items.clear();

        let result = handler.handle(&envelope("evt_1"), &payload).await;
        assert!(matches!(result, Err(EngineError::MalformedEvent(_))));
    }
}
