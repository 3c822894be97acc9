//! Inbound event routing
//!
//! One entry point for the inbound path: validate the envelope's payload,
//! classify the transition, dispatch to the matching handler. Event types
//! without a handler are logged and acknowledged so the transport does not
//! redeliver them forever.

use std::sync::Arc;

use serde_json::json;

use crate::bus::{EventBus, EventEntry};
use crate::cancellation::{CancellationHandler, ScheduledActionStore, UncancellationHandler};
use crate::config::EngineConfig;
use crate::envelope::EventEnvelope;
use crate::error::EngineResult;
use crate::idempotency::{event_key, IdempotencyGuard};
use crate::lifecycle::{classify, AutoUpgradePolicy, LifecycleTransition};
use crate::quantity::QuantityChangeHandler;
use crate::renewal::RenewalHandler;
use crate::snapshot::UpdatePayload;

/// Event type carrying a subscription update from the payments provider
pub const SUBSCRIPTION_UPDATED: &str = "customer.subscription.updated";

/// Detail type of the auto-upgrade recommendation event
pub const AUTO_UPGRADE_EVENT: &str = "subscription.auto_upgrade_recommended";

/// Routes inbound envelopes to lifecycle handlers.
///
/// All collaborators are built once at process start and injected here;
/// nothing is constructed implicitly.
pub struct EventRouter {
    guard: Arc<IdempotencyGuard>,
    bus: Arc<dyn EventBus>,
    config: Arc<EngineConfig>,
    policy: AutoUpgradePolicy,
    quantity: QuantityChangeHandler,
    cancellation: CancellationHandler,
    uncancellation: UncancellationHandler,
    renewal: RenewalHandler,
}

impl EventRouter {
    pub fn new(
        guard: Arc<IdempotencyGuard>,
        bus: Arc<dyn EventBus>,
        actions: Arc<dyn ScheduledActionStore>,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            policy: AutoUpgradePolicy::new(config.auto_upgrade_seat_threshold),
            quantity: QuantityChangeHandler::new(
                Arc::clone(&guard),
                Arc::clone(&bus),
                Arc::clone(&config),
            ),
            cancellation: CancellationHandler::new(
                Arc::clone(&guard),
                Arc::clone(&bus),
                Arc::clone(&actions),
                Arc::clone(&config),
            ),
            uncancellation: UncancellationHandler::new(actions),
            renewal: RenewalHandler::new(
                Arc::clone(&guard),
                Arc::clone(&bus),
                Arc::clone(&config),
            ),
            guard,
            bus,
            config,
        }
    }

    /// Process one inbound envelope end to end.
    pub async fn process(&self, envelope: &EventEnvelope) -> EngineResult<()> {
        match envelope.event_type.as_str() {
            SUBSCRIPTION_UPDATED => self.handle_update(envelope).await,
            _ => {
                tracing::info!(
                    event_type = %envelope.event_type,
                    event_id = %envelope.id,
                    "Received unhandled event type - no handler configured"
                );
                Ok(())
            }
        }
    }

    async fn handle_update(&self, envelope: &EventEnvelope) -> EngineResult<()> {
        let payload = UpdatePayload::from_detail(&envelope.detail)?;
        let transition = classify(&payload.subscription, &payload.previous_attributes);

        tracing::info!(
            subscription_id = %payload.subscription.id,
            transition = %transition,
            event_id = %envelope.id,
            "Classified subscription update"
        );

        match transition {
            LifecycleTransition::QuantityChanged => {
                self.quantity.handle(envelope, &payload).await?;
            }
            LifecycleTransition::Cancelling => {
                self.cancellation.handle(envelope, &payload).await?;
            }
            LifecycleTransition::Uncancelling => {
                self.uncancellation.handle(&payload).await?;
            }
            LifecycleTransition::Renewed => {
                self.renewal.handle(envelope, &payload).await?;
            }
            LifecycleTransition::OtherUpdate => {
                self.apply_policies(envelope, &payload).await?;
            }
        }

        Ok(())
    }

    /// Policy steps for updates with no lifecycle transition. Only invoked
    /// here, never as a side effect of classification.
    async fn apply_policies(
        &self,
        envelope: &EventEnvelope,
        payload: &UpdatePayload,
    ) -> EngineResult<()> {
        let decision = match self.policy.evaluate(&payload.subscription) {
            Some(decision) => decision,
            None => return Ok(()),
        };

        let key = event_key(AUTO_UPGRADE_EVENT, &decision.subscription_id, envelope.time);
        let claim = self.guard.ensure(&key, None, None).await?;
        if claim.is_duplicate {
            return Ok(());
        }

        let entry = EventEntry {
            source: self.config.event_source.clone(),
            detail_type: AUTO_UPGRADE_EVENT.to_string(),
            detail: json!({
                "subscription_id": decision.subscription_id,
                "seats": decision.seats,
                "threshold": decision.threshold,
                "triggered_by": envelope.id,
            }),
            bus_name: self.config.primary_bus.clone(),
            time: Some(envelope.time),
        };
        let outcome = self.bus.publish(vec![entry]).await?;
        outcome.ensure_accepted()?;

        tracing::info!(
            subscription_id = %decision.subscription_id,
            seats = decision.seats,
            "Auto-upgrade recommended"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InMemoryBus;
    use crate::cancellation::InMemoryActionStore;
    use crate::error::EngineError;
    use crate::ledger::{IdempotencyStore, InMemoryStore};
    use crate::quantity::LICENSE_UNIT_EVENT;
    use serde_json::json;
    use time::macros::datetime;

    struct Fixture {
        router: EventRouter,
        bus: Arc<InMemoryBus>,
        actions: Arc<InMemoryActionStore>,
    }

    fn fixture(auto_upgrade_seats: Option<u64>) -> Fixture {
        let bus = Arc::new(InMemoryBus::new());
        let actions = Arc::new(InMemoryActionStore::new());
        let config = EngineConfig {
            auto_upgrade_seat_threshold: auto_upgrade_seats,
            ..EngineConfig::default()
        };
        let router = EventRouter::new(
            Arc::new(IdempotencyGuard::new(
                Arc::new(InMemoryStore::new()) as Arc<dyn IdempotencyStore>
            )),
            Arc::clone(&bus) as Arc<dyn EventBus>,
            Arc::clone(&actions) as Arc<dyn ScheduledActionStore>,
            Arc::new(config),
        );
        Fixture {
            router,
            bus,
            actions,
        }
    }

    fn update_envelope(detail: serde_json::Value) -> EventEnvelope {
        EventEnvelope {
            id: "evt_1".to_string(),
            event_type: SUBSCRIPTION_UPDATED.to_string(),
            source: "payments.provider".to_string(),
            time: datetime!(2026-03-01 12:00:00 UTC),
            detail,
        }
    }

    fn item(id: &str, quantity: u64, start: i64) -> serde_json::Value {
        json!({
            "id": id,
            "quantity": quantity,
            "current_period_start": start,
            "current_period_end": start + 2_592_000,
        })
    }

    #[tokio::test]
    async fn quantity_update_routes_to_fan_out() {
        let fx = fixture(None);
        let envelope = update_envelope(json!({
            "subscription": {
                "id": "sub_1",
                "status": "active",
                "items": [item("si_1", 3, 1772323200)],
            },
            "previous_attributes": {
                "items": [item("si_1", 1, 1772323200)],
            }
        }));

        fx.router.process(&envelope).await.unwrap();

        let published = fx.bus.published().await;
        assert_eq!(published.len(), 2);
        assert!(published.iter().all(|e| e.detail_type == LICENSE_UNIT_EVENT));
    }

    #[tokio::test]
    async fn uncancelling_update_deletes_the_scheduled_action() {
        let fx = fixture(None);
        fx.actions
            .upsert(&crate::cancellation::ScheduledCancellation {
                subscription_id: "sub_1".to_string(),
                effective_at: datetime!(2026-04-01 00:00:00 UTC),
            })
            .await
            .unwrap();

        let envelope = update_envelope(json!({
            "subscription": {
                "id": "sub_1",
                "status": "active",
                "cancel_at_period_end": false,
                "items": [],
            },
            "previous_attributes": {
                "cancel_at_period_end": true,
            }
        }));

        fx.router.process(&envelope).await.unwrap();
        assert!(fx.actions.get("sub_1").await.is_none());
    }

    #[tokio::test]
    async fn unhandled_event_type_is_acknowledged() {
        let fx = fixture(None);
        let envelope = EventEnvelope {
            id: "evt_1".to_string(),
            event_type: "customer.subscription.created".to_string(),
            source: "payments.provider".to_string(),
            time: datetime!(2026-03-01 12:00:00 UTC),
            detail: json!({"anything": true}),
        };

        assert!(fx.router.process(&envelope).await.is_ok());
        assert!(fx.bus.published().await.is_empty());
    }

    #[tokio::test]
    async fn malformed_update_detail_is_rejected() {
        let fx = fixture(None);
        let envelope = update_envelope(json!({"no_subscription": true}));

        let result = fx.router.process(&envelope).await;
        assert!(matches!(result, Err(EngineError::MalformedEvent(_))));
    }

    #[tokio::test]
    async fn other_update_consults_the_auto_upgrade_policy() {
        let fx = fixture(Some(10));
        let envelope = update_envelope(json!({
            "subscription": {
                "id": "sub_1",
                "status": "active",
                "items": [item("si_1", 12, 1772323200)],
            },
            "previous_attributes": {}
        }));

        fx.router.process(&envelope).await.unwrap();

        let published = fx.bus.published().await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].detail_type, AUTO_UPGRADE_EVENT);
        assert_eq!(published[0].detail["seats"], 12);
    }

    #[tokio::test]
    async fn auto_upgrade_is_guarded_against_redelivery() {
        let fx = fixture(Some(10));
        let envelope = update_envelope(json!({
            "subscription": {
                "id": "sub_1",
                "status": "active",
                "items": [item("si_1", 12, 1772323200)],
            },
            "previous_attributes": {}
        }));

        fx.router.process(&envelope).await.unwrap();
        fx.router.process(&envelope).await.unwrap();

        assert_eq!(fx.bus.published().await.len(), 1);
    }

    #[tokio::test]
    async fn quantity_transition_does_not_hit_the_policy() {
        // A quantity change that also crosses the seat threshold only runs
        // the fan-out; the policy is exclusive to other_update
        let fx = fixture(Some(10));
        let envelope = update_envelope(json!({
            "subscription": {
                "id": "sub_1",
                "status": "active",
                "items": [item("si_1", 12, 1772323200)],
            },
            "previous_attributes": {
                "items": [item("si_1", 11, 1772323200)],
            }
        }));

        fx.router.process(&envelope).await.unwrap();

        let published = fx.bus.published().await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].detail_type, LICENSE_UNIT_EVENT);
    }
}
