//! Cancellation and uncancellation handling
//!
//! A cancelling subscription yields one cancellation notice per line item
//! whose billing period has not yet elapsed, plus a scheduled cancellation
//! action recorded for the subscription so an uncancellation later has
//! something to delete. Item attempts run independently and to completion;
//! failures are aggregated into a single error after the last attempt.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use sqlx::PgPool;
use time::OffsetDateTime;
use tokio::sync::Mutex;

use crate::bus::{EventBus, EventEntry};
use crate::config::EngineConfig;
use crate::envelope::EventEnvelope;
use crate::error::{EngineError, EngineResult};
use crate::idempotency::{event_key, IdempotencyGuard};
use crate::snapshot::UpdatePayload;

/// Detail type of the per-item cancellation notice
pub const CANCELLATION_EVENT: &str = "subscription_item.cancelling";

/// A pending cancellation action for a subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledCancellation {
    pub subscription_id: String,
    /// When the cancellation takes effect (latest unexpired period end)
    pub effective_at: OffsetDateTime,
}

/// Store of pending cancellation actions
#[async_trait]
pub trait ScheduledActionStore: Send + Sync {
    /// Record or refresh the pending cancellation for a subscription.
    async fn upsert(&self, action: &ScheduledCancellation) -> EngineResult<()>;

    /// Delete the pending cancellation. Returns false when none was
    /// scheduled for the subscription.
    async fn delete(&self, subscription_id: &str) -> EngineResult<bool>;
}

/// Postgres-backed scheduled-action store
pub struct PostgresActionStore {
    pool: PgPool,
}

impl PostgresActionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ScheduledActionStore for PostgresActionStore {
    async fn upsert(&self, action: &ScheduledCancellation) -> EngineResult<()> {
        sqlx::query(
            r#"
            INSERT INTO scheduled_cancellations (subscription_id, effective_at, created_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (subscription_id) DO UPDATE SET
                effective_at = EXCLUDED.effective_at,
                updated_at = NOW()
            "#,
        )
        .bind(&action.subscription_id)
        .bind(action.effective_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, subscription_id: &str) -> EngineResult<bool> {
        let result = sqlx::query("DELETE FROM scheduled_cancellations WHERE subscription_id = $1")
            .bind(subscription_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

/// In-memory scheduled-action store for tests and local development
#[derive(Default)]
pub struct InMemoryActionStore {
    actions: Mutex<HashMap<String, ScheduledCancellation>>,
}

impl InMemoryActionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, subscription_id: &str) -> Option<ScheduledCancellation> {
        self.actions.lock().await.get(subscription_id).cloned()
    }
}

#[async_trait]
impl ScheduledActionStore for InMemoryActionStore {
    async fn upsert(&self, action: &ScheduledCancellation) -> EngineResult<()> {
        self.actions
            .lock()
            .await
            .insert(action.subscription_id.clone(), action.clone());
        Ok(())
    }

    async fn delete(&self, subscription_id: &str) -> EngineResult<bool> {
        Ok(self.actions.lock().await.remove(subscription_id).is_some())
    }
}

/// Summary of one cancellation handling pass
#[derive(Debug, Default, Clone, Copy)]
pub struct CancellationReport {
    pub emitted: usize,
    pub duplicates: usize,
    pub skipped_elapsed: usize,
}

/// Handler for `Cancelling` transitions
pub struct CancellationHandler {
    guard: Arc<IdempotencyGuard>,
    bus: Arc<dyn EventBus>,
    actions: Arc<dyn ScheduledActionStore>,
    config: Arc<EngineConfig>,
}

impl CancellationHandler {
    pub fn new(
        guard: Arc<IdempotencyGuard>,
        bus: Arc<dyn EventBus>,
        actions: Arc<dyn ScheduledActionStore>,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            guard,
            bus,
            actions,
            config,
        }
    }

    /// Emit one cancellation notice per unexpired item and record the
    /// pending cancellation action. Every item attempt runs regardless of
    /// earlier failures; if any failed, one aggregate error is raised after
    /// the last attempt.
    pub async fn handle(
        &self,
        envelope: &EventEnvelope,
        payload: &UpdatePayload,
    ) -> EngineResult<CancellationReport> {
        let now = OffsetDateTime::now_utc();
        let subscription = &payload.subscription;
        let mut report = CancellationReport::default();

        let pending: Vec<_> = subscription
            .items
            .iter()
            .filter(|item| {
                if item.current_period_end > now {
                    true
                } else {
                    tracing::debug!(
                        subscription_id = %subscription.id,
                        item_id = %item.id,
                        "Billing period already elapsed - skipping cancellation notice"
                    );
                    false
                }
            })
            .collect();
        report.skipped_elapsed = subscription.items.len() - pending.len();

        // Record the pending action first; a storage failure here aborts the
        // whole message so the transport redelivers it.
        if let Some(effective_at) = pending.iter().map(|i| i.current_period_end).max() {
            self.actions
                .upsert(&ScheduledCancellation {
                    subscription_id: subscription.id.clone(),
                    effective_at,
                })
                .await?;
        }

        let attempted = pending.len();
        let mut failed = 0usize;
        for item in pending {
            let key = event_key(
                CANCELLATION_EVENT,
                &format!("{}-{}", subscription.id, item.id),
                item.current_period_end,
            );
            let claim = self.guard.ensure(&key, None, None).await?;
            if claim.is_duplicate {
                report.duplicates += 1;
                continue;
            }

            let entry = EventEntry {
                source: self.config.event_source.clone(),
                detail_type: CANCELLATION_EVENT.to_string(),
                detail: json!({
                    "subscription_id": subscription.id,
                    "customer_id": subscription.customer_id,
                    "item_id": item.id,
                    "period_end": item.current_period_end.unix_timestamp(),
                    "triggered_by": envelope.id,
                }),
                bus_name: self.config.primary_bus.clone(),
                time: Some(envelope.time),
            };

            let publish_result = self
                .bus
                .publish(vec![entry])
                .await
                .and_then(|outcome| outcome.ensure_accepted());
            match publish_result {
                Ok(()) => report.emitted += 1,
                Err(e) => {
                    tracing::error!(
                        subscription_id = %subscription.id,
                        item_id = %item.id,
                        error = %e,
                        "Failed to emit cancellation notice"
                    );
                    failed += 1;
                }
            }
        }

        if failed > 0 {
            return Err(EngineError::CancellationIncomplete { failed, attempted });
        }

        tracing::info!(
            subscription_id = %subscription.id,
            emitted = report.emitted,
            duplicates = report.duplicates,
            skipped_elapsed = report.skipped_elapsed,
            "Cancellation notices emitted"
        );

        Ok(report)
    }
}

/// Handler for `Uncancelling` transitions
pub struct UncancellationHandler {
    actions: Arc<dyn ScheduledActionStore>,
}

impl UncancellationHandler {
    pub fn new(actions: Arc<dyn ScheduledActionStore>) -> Self {
        Self { actions }
    }

    /// Delete the previously scheduled cancellation action. A missing action
    /// is informational, not an error: it may have fired already or never
    /// been recorded.
    pub async fn handle(&self, payload: &UpdatePayload) -> EngineResult<()> {
        let subscription_id = &payload.subscription.id;
        if self.actions.delete(subscription_id).await? {
            tracing::info!(
                subscription_id = %subscription_id,
                "Deleted scheduled cancellation"
            );
        } else {
            tracing::info!(
                subscription_id = %subscription_id,
                "No scheduled cancellation to delete"
            );
        }
        Ok(())
    }
}
