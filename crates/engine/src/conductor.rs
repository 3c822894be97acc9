//! Dead-letter retry conductor
//!
//! Consumes batches from the dead-letter transport and gives each message a
//! second, slower, strictly bounded retry tier: below the retry budget the
//! original payload is redriven to the primary bus with an incremented retry
//! envelope; at the budget it is relocated to the quarantine transport and
//! never redriven again. Messages are handled independently; a failure is
//! reported as a batch-item failure so the transport redelivers just that
//! message. The conductor never sleeps or backs off.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::Mutex;

use crate::bus::{EventBus, EventEntry};
use crate::config::EngineConfig;
use crate::envelope::{retry_count_from_attributes, EventEnvelope, RetryEnvelope};
use crate::error::{EngineError, EngineResult};

/// One message pulled from the dead-letter transport
#[derive(Debug, Clone)]
pub struct DeadLetterMessage {
    pub message_id: String,
    pub body: String,
    pub attributes: HashMap<String, String>,
}

/// An exhausted event relocated to quarantine, with everything a human
/// needs to inspect it later
#[derive(Debug, Clone, Serialize)]
pub struct QuarantineRecord {
    pub original_event: EventEnvelope,
    pub original_event_id: String,
    pub retry_count: u32,
    #[serde(with = "time::serde::rfc3339::option")]
    pub first_failure_time: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub exhausted_at: OffsetDateTime,
}

/// Fire-and-forget relocation target for exhausted messages
#[async_trait]
pub trait QuarantineSink: Send + Sync {
    async fn relocate(&self, record: &QuarantineRecord) -> EngineResult<()>;
}

/// Quarantine sink publishing records to a NATS subject
#[derive(Clone)]
pub struct NatsQuarantine {
    client: async_nats::Client,
    subject: String,
}

impl NatsQuarantine {
    pub fn new(client: async_nats::Client, subject: impl Into<String>) -> Self {
        Self {
            client,
            subject: subject.into(),
        }
    }
}

#[async_trait]
impl QuarantineSink for NatsQuarantine {
    async fn relocate(&self, record: &QuarantineRecord) -> EngineResult<()> {
        let payload = serde_json::to_vec(record)?;
        self.client
            .publish(self.subject.clone(), payload.into())
            .await
            .map_err(|e| EngineError::Quarantine(e.to_string()))
    }
}

/// In-memory quarantine for tests and local development
#[derive(Default)]
pub struct InMemoryQuarantine {
    records: Mutex<Vec<QuarantineRecord>>,
    fail_next: Mutex<usize>,
}

impl InMemoryQuarantine {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<QuarantineRecord> {
        self.records.lock().await.clone()
    }

    /// Reject the next `times` relocations.
    pub async fn fail_next(&self, times: usize) {
        *self.fail_next.lock().await = times;
    }
}

#[async_trait]
impl QuarantineSink for InMemoryQuarantine {
    async fn relocate(&self, record: &QuarantineRecord) -> EngineResult<()> {
        let mut fail_next = self.fail_next.lock().await;
        if *fail_next > 0 {
            *fail_next -= 1;
            return Err(EngineError::Quarantine("injected failure".to_string()));
        }
        self.records.lock().await.push(record.clone());
        Ok(())
    }
}

/// Counts for one processed batch
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RedriveSummary {
    pub redriven: usize,
    pub exhausted: usize,
    pub failed: usize,
}

/// What the dead-letter transport should do with the batch: every message
/// listed in `batch_item_failures` is kept for redelivery, the rest are
/// removed.
#[derive(Debug, Default, Clone)]
pub struct BatchDisposition {
    pub batch_item_failures: Vec<String>,
    pub summary: RedriveSummary,
}

enum MessageDisposition {
    Redriven,
    Quarantined,
}

/// The conductor itself. Independent of the lifecycle handlers; state per
/// message is purely a function of its retry count.
pub struct DeadLetterConductor {
    bus: Arc<dyn EventBus>,
    quarantine: Arc<dyn QuarantineSink>,
    config: Arc<EngineConfig>,
}

impl DeadLetterConductor {
    pub fn new(
        bus: Arc<dyn EventBus>,
        quarantine: Arc<dyn QuarantineSink>,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            bus,
            quarantine,
            config,
        }
    }

    /// Process one batch. Never returns an error: per-message failures are
    /// reported through `batch_item_failures` so the transport retries the
    /// redrive operation itself, independent of the business retry count.
    pub async fn process_batch(&self, messages: Vec<DeadLetterMessage>) -> BatchDisposition {
        let mut disposition = BatchDisposition::default();

        for message in messages {
            match self.process_message(&message).await {
                Ok(MessageDisposition::Redriven) => disposition.summary.redriven += 1,
                Ok(MessageDisposition::Quarantined) => disposition.summary.exhausted += 1,
                Err(e) => {
                    tracing::error!(
                        message_id = %message.message_id,
                        error = %e,
                        "Dead-letter redrive failed - leaving message for redelivery"
                    );
                    disposition.summary.failed += 1;
                    disposition
                        .batch_item_failures
                        .push(message.message_id.clone());
                }
            }
        }

        tracing::info!(
            redriven = disposition.summary.redriven,
            exhausted = disposition.summary.exhausted,
            failed = disposition.summary.failed,
            "Dead-letter batch complete"
        );

        disposition
    }

    async fn process_message(
        &self,
        message: &DeadLetterMessage,
    ) -> EngineResult<MessageDisposition> {
        let mut envelope = EventEnvelope::from_json(&message.body)?;
        let embedded = RetryEnvelope::from_detail(&envelope.detail);

        // Attributes are authoritative; an envelope from an earlier redrive
        // is the fallback; otherwise this is the first failure.
        let retry_count = match retry_count_from_attributes(&message.attributes)? {
            Some(count) => count,
            None => embedded.as_ref().map(|r| r.retry_count).unwrap_or(0),
        };

        if retry_count >= self.config.max_retries {
            let record = QuarantineRecord {
                original_event_id: embedded
                    .as_ref()
                    .map(|r| r.original_event_id.clone())
                    .unwrap_or_else(|| envelope.id.clone()),
                retry_count,
                first_failure_time: embedded.as_ref().map(|r| r.first_failure_time),
                exhausted_at: OffsetDateTime::now_utc(),
                original_event: envelope,
            };
            self.quarantine.relocate(&record).await?;
            tracing::warn!(
                event_id = %record.original_event_id,
                retry_count = retry_count,
                max_retries = self.config.max_retries,
                "Retry budget exhausted - event quarantined"
            );
            return Ok(MessageDisposition::Quarantined);
        }

        let now = OffsetDateTime::now_utc();
        let next = RetryEnvelope {
            retry_count: retry_count + 1,
            original_event_id: embedded
                .as_ref()
                .map(|r| r.original_event_id.clone())
                .unwrap_or_else(|| envelope.id.clone()),
            original_event_time: embedded
                .as_ref()
                .map(|r| r.original_event_time)
                .unwrap_or(envelope.time),
            first_failure_time: embedded.as_ref().map(|r| r.first_failure_time).unwrap_or(now),
            last_retry_time: now,
        };
        next.merge_into(&mut envelope.detail)?;

        let entry = EventEntry {
            source: envelope.source.clone(),
            detail_type: envelope.event_type.clone(),
            detail: envelope.detail.clone(),
            bus_name: self.config.primary_bus.clone(),
            // The original timestamp rides along so downstream ordering holds
            time: Some(envelope.time),
        };
        let outcome = self.bus.publish(vec![entry]).await?;
        outcome.ensure_accepted()?;

        tracing::info!(
            event_id = %envelope.id,
            retry_count = next.retry_count,
            "Redriven to primary bus"
        );
        Ok(MessageDisposition::Redriven)
    }
}
