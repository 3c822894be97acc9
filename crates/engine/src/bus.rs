//! Event bus abstraction
//!
//! Outbound business events go through the `EventBus` trait. A publish call
//! carries up to `MAX_ENTRIES_PER_PUBLISH` entries and reports per-entry
//! failures instead of failing wholesale; callers surface any non-zero
//! failed count as an error, never swallow it.
//!
//! Implementations:
//! - `NatsBus`: production implementation over a NATS client
//! - `InMemoryBus`: test/dev implementation with injectable failures

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use tokio::sync::Mutex;

use crate::error::{EngineError, EngineResult};

/// Largest entry count a single publish call may carry
pub const MAX_ENTRIES_PER_PUBLISH: usize = 10;

/// One outbound event entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEntry {
    pub source: String,
    pub detail_type: String,
    pub detail: Value,
    /// Logical bus the entry targets
    pub bus_name: String,
    /// Event time to preserve for downstream ordering; the bus stamps its
    /// own receive time when absent.
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub time: Option<OffsetDateTime>,
}

/// Per-entry failure detail from a publish call
#[derive(Debug, Clone)]
pub struct PublishFailure {
    /// Index of the failed entry within the submitted batch
    pub index: usize,
    pub detail_type: String,
    pub error: String,
}

/// Result of a publish call
#[derive(Debug, Clone, Default)]
pub struct PublishOutcome {
    pub accepted: usize,
    pub failed: Vec<PublishFailure>,
}

impl PublishOutcome {
    /// Surface a non-zero failed count as an error.
    pub fn ensure_accepted(self) -> EngineResult<()> {
        if self.failed.is_empty() {
            Ok(())
        } else {
            let failed = self.failed.len();
            Err(EngineError::PartialPublish {
                failed,
                attempted: self.accepted + failed,
            })
        }
    }
}

/// Stateless publish interface to the event bus
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish a batch of at most `MAX_ENTRIES_PER_PUBLISH` entries.
    /// Returns per-entry failures; errors only on transport-level problems
    /// (or an oversized batch).
    async fn publish(&self, entries: Vec<EventEntry>) -> EngineResult<PublishOutcome>;
}

fn check_batch_size(len: usize) -> EngineResult<()> {
    if len > MAX_ENTRIES_PER_PUBLISH {
        return Err(EngineError::Bus(format!(
            "publish batch of {} exceeds the {}-entry limit",
            len, MAX_ENTRIES_PER_PUBLISH
        )));
    }
    Ok(())
}

/// EventBus implementation over a NATS client.
///
/// Entries are published to `{bus_name}.{detail_type}` so consumers can
/// subscribe per bus or per event type with subject wildcards.
#[derive(Clone)]
pub struct NatsBus {
    client: async_nats::Client,
}

impl NatsBus {
    /// Wrap an already-connected NATS client.
    pub fn new(client: async_nats::Client) -> Self {
        Self { client }
    }

    fn subject(entry: &EventEntry) -> String {
        format!("{}.{}", entry.bus_name, entry.detail_type)
    }
}

#[async_trait]
impl EventBus for NatsBus {
    async fn publish(&self, entries: Vec<EventEntry>) -> EngineResult<PublishOutcome> {
        check_batch_size(entries.len())?;

        let mut outcome = PublishOutcome::default();
        for (index, entry) in entries.into_iter().enumerate() {
            let subject = Self::subject(&entry);
            let payload = match serde_json::to_vec(&entry) {
                Ok(bytes) => bytes,
                Err(e) => {
                    outcome.failed.push(PublishFailure {
                        index,
                        detail_type: entry.detail_type.clone(),
                        error: e.to_string(),
                    });
                    continue;
                }
            };

            match self.client.publish(subject, payload.into()).await {
                Ok(()) => outcome.accepted += 1,
                Err(e) => outcome.failed.push(PublishFailure {
                    index,
                    detail_type: entry.detail_type.clone(),
                    error: e.to_string(),
                }),
            }
        }

        Ok(outcome)
    }
}

/// In-memory bus for tests and local development.
///
/// Records everything accepted and supports injecting per-detail-type
/// failures so partial-batch behavior is testable.
#[derive(Default)]
pub struct InMemoryBus {
    published: Mutex<Vec<EventEntry>>,
    failures: Mutex<HashMap<String, usize>>,
    failed_ordinals: Mutex<Vec<usize>>,
    entries_seen: AtomicUsize,
    publish_calls: AtomicUsize,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Entries accepted so far, in publish order
    pub async fn published(&self) -> Vec<EventEntry> {
        self.published.lock().await.clone()
    }

    /// Number of publish calls made so far
    pub fn publish_calls(&self) -> usize {
        self.publish_calls.load(Ordering::SeqCst)
    }

    /// Reject the next `times` entries carrying this detail type.
    pub async fn fail_next(&self, detail_type: &str, times: usize) {
        self.failures
            .lock()
            .await
            .insert(detail_type.to_string(), times);
    }

    /// Reject the entry with this zero-based ordinal, counted across all
    /// publish calls on this bus.
    pub async fn fail_entry(&self, ordinal: usize) {
        self.failed_ordinals.lock().await.push(ordinal);
    }
}

#[async_trait]
impl EventBus for InMemoryBus {
    async fn publish(&self, entries: Vec<EventEntry>) -> EngineResult<PublishOutcome> {
        check_batch_size(entries.len())?;
        self.publish_calls.fetch_add(1, Ordering::SeqCst);

        let mut outcome = PublishOutcome::default();
        let mut failures = self.failures.lock().await;
        let failed_ordinals = self.failed_ordinals.lock().await;
        let mut published = self.published.lock().await;

        for (index, entry) in entries.into_iter().enumerate() {
            let ordinal = self.entries_seen.fetch_add(1, Ordering::SeqCst);
            let ordinal_failure = failed_ordinals.contains(&ordinal);
            let type_failure = match failures.get_mut(&entry.detail_type) {
                Some(remaining) if *remaining > 0 => {
                    *remaining -= 1;
                    true
                }
                _ => false,
            };

            if ordinal_failure || type_failure {
                outcome.failed.push(PublishFailure {
                    index,
                    detail_type: entry.detail_type.clone(),
                    error: "injected failure".to_string(),
                });
                continue;
            }
            outcome.accepted += 1;
            published.push(entry);
        }

        Ok(outcome)
    }
}
