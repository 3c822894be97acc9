//! Quantity change fan-out
//!
//! Each unit of a quantity increase becomes one distinct license-unit event
//! so downstream systems can track seats individually. The per-unit key uses
//! the absolute seat index: redeliveries of one increase collide on the same
//! keys, while a later increase starts where the previous quantity left off
//! and never collides. Decreases are logged only; removals belong to a
//! separate flow.

use std::sync::Arc;

use serde_json::json;

use crate::bus::{EventBus, EventEntry, MAX_ENTRIES_PER_PUBLISH};
use crate::config::EngineConfig;
use crate::envelope::EventEnvelope;
use crate::error::EngineResult;
use crate::idempotency::IdempotencyGuard;
use crate::snapshot::UpdatePayload;

/// Detail type of the per-unit license creation event
pub const LICENSE_UNIT_EVENT: &str = "license_unit.created";

/// Per-unit idempotency key: subscription, item, absolute seat index
pub(crate) fn unit_key(subscription_id: &str, item_id: &str, seat_index: u64) -> String {
    format!("license-unit-{}-{}-{}", subscription_id, item_id, seat_index)
}

/// Summary of one quantity-change handling pass
#[derive(Debug, Default, Clone, Copy)]
pub struct QuantityChangeReport {
    /// License-unit events published
    pub emitted: usize,
    /// Units skipped because their key was already claimed
    pub duplicates: usize,
    /// Items whose quantity decreased (no events emitted)
    pub decreases: usize,
    /// Items without a comparable previous quantity
    pub skipped: usize,
}

/// Handler for `QuantityChanged` transitions
pub struct QuantityChangeHandler {
    guard: Arc<IdempotencyGuard>,
    bus: Arc<dyn EventBus>,
    config: Arc<EngineConfig>,
}

impl QuantityChangeHandler {
    pub fn new(
        guard: Arc<IdempotencyGuard>,
        bus: Arc<dyn EventBus>,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self { guard, bus, config }
    }

    /// Diff every item against its previous quantity and emit one event per
    /// added unit. Entries go out in sequential batches capped at the bus
    /// limit; a failed batch propagates without re-emitting batches the bus
    /// already accepted.
    pub async fn handle(
        &self,
        envelope: &EventEnvelope,
        payload: &UpdatePayload,
    ) -> EngineResult<QuantityChangeReport> {
        let subscription = &payload.subscription;
        let mut report = QuantityChangeReport::default();
        let mut entries = Vec::new();

        for current_item in &subscription.items {
            let current_qty = match current_item.quantity {
                Some(q) => q,
                None => {
                    tracing::debug!(
                        subscription_id = %subscription.id,
                        item_id = %current_item.id,
                        "Item has no quantity - skipping diff"
                    );
                    report.skipped += 1;
                    continue;
                }
            };

            let previous_qty = match payload
                .previous_attributes
                .item(&current_item.id)
                .and_then(|i| i.quantity)
            {
                Some(q) => q,
                None => {
                    tracing::debug!(
                        subscription_id = %subscription.id,
                        item_id = %current_item.id,
                        "No previous quantity for item - skipping diff"
                    );
                    report.skipped += 1;
                    continue;
                }
            };

            if current_qty < previous_qty {
                tracing::info!(
                    subscription_id = %subscription.id,
                    item_id = %current_item.id,
                    removed = previous_qty - current_qty,
                    "Quantity decreased - removal is handled by the downgrade flow"
                );
                report.decreases += 1;
                continue;
            }

            for seat_index in previous_qty..current_qty {
                let key = unit_key(&subscription.id, &current_item.id, seat_index);
                let claim = self.guard.ensure(&key, None, None).await?;
                if claim.is_duplicate {
                    report.duplicates += 1;
                    continue;
                }

                entries.push(EventEntry {
                    source: self.config.event_source.clone(),
                    detail_type: LICENSE_UNIT_EVENT.to_string(),
                    detail: json!({
                        "subscription_id": subscription.id,
                        "customer_id": subscription.customer_id,
                        "item_id": current_item.id,
                        "unit_index": seat_index,
                        "quantity": current_qty,
                        "triggered_by": envelope.id,
                    }),
                    bus_name: self.config.primary_bus.clone(),
                    time: Some(envelope.time),
                });
            }
        }

        // Sequential capped batches: once a batch is accepted it stays
        // accepted, and a failure stops emission before the next batch.
        for batch in entries.chunks(MAX_ENTRIES_PER_PUBLISH) {
            let outcome = self.bus.publish(batch.to_vec()).await?;
            outcome.ensure_accepted()?;
            report.emitted += batch.len();
        }

        tracing::info!(
            subscription_id = %subscription.id,
            emitted = report.emitted,
            duplicates = report.duplicates,
            decreases = report.decreases,
            "Quantity change fan-out complete"
        );

        Ok(report)
    }
}
