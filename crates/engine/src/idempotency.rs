//! Idempotency guard
//!
//! Turns the ledger's conditional insert into the engine's dedup contract:
//! `ensure` claims a key exactly once and tells the caller whether it owns
//! the side effects, `batch_check` is an advisory read-only pre-check, and
//! `event_key` derives deterministic keys so repeated deliveries of one
//! logical event collide while distinct events do not.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use time::{Duration, OffsetDateTime};

use crate::config::DEFAULT_IDEMPOTENCY_TTL_SECONDS;
use crate::error::EngineResult;
use crate::ledger::{IdempotencyRecord, IdempotencyStore, InsertOutcome};

/// Outcome of an `ensure` claim
#[derive(Debug, Clone, Copy)]
pub struct Claim {
    /// True when another delivery already claimed the key. The caller must
    /// perform zero side effects.
    pub is_duplicate: bool,
}

/// One entry of an advisory batch check
#[derive(Debug, Clone)]
pub struct BatchCheck {
    pub is_duplicate: bool,
    pub existing_data: Option<Value>,
}

/// Deterministic idempotency key: `{event_type}-{resource_id}-{unix_ts}`
pub fn event_key(event_type: &str, resource_id: &str, timestamp: OffsetDateTime) -> String {
    format!(
        "{}-{}-{}",
        event_type,
        resource_id,
        timestamp.unix_timestamp()
    )
}

/// Guard over the idempotency ledger
pub struct IdempotencyGuard {
    store: Arc<dyn IdempotencyStore>,
    default_ttl_seconds: u64,
}

impl IdempotencyGuard {
    pub fn new(store: Arc<dyn IdempotencyStore>) -> Self {
        Self::with_ttl(store, DEFAULT_IDEMPOTENCY_TTL_SECONDS)
    }

    pub fn with_ttl(store: Arc<dyn IdempotencyStore>, default_ttl_seconds: u64) -> Self {
        Self {
            store,
            default_ttl_seconds,
        }
    }

    /// Claim `key` exactly once.
    ///
    /// The first successful claim wins; a `KeyExists` from the ledger means
    /// a concurrent or earlier delivery of the same logical event already
    /// owns it. Any other storage failure propagates untouched so the
    /// transport's native retry applies.
    pub async fn ensure(
        &self,
        key: &str,
        data: Option<Value>,
        ttl_seconds: Option<u64>,
    ) -> EngineResult<Claim> {
        let now = OffsetDateTime::now_utc();
        let ttl = ttl_seconds.unwrap_or(self.default_ttl_seconds);
        let record = IdempotencyRecord {
            key: key.to_string(),
            processed_at: now,
            expires_at: now + Duration::seconds(ttl as i64),
            data,
        };

        match self.store.put_if_absent(&record).await? {
            InsertOutcome::Inserted => {
                tracing::debug!(key = %key, ttl_seconds = ttl, "Claimed idempotency key");
                Ok(Claim {
                    is_duplicate: false,
                })
            }
            InsertOutcome::KeyExists => {
                tracing::info!(key = %key, "Duplicate delivery - skipping side effects");
                Ok(Claim { is_duplicate: true })
            }
        }
    }

    /// Advisory bulk pre-check, chunked to the store's per-request limit.
    ///
    /// This never claims anything: a key reported as fresh here can still
    /// lose the `ensure` race, so callers must claim before emitting. Empty
    /// input returns an empty map without touching the store.
    pub async fn batch_check(
        &self,
        keys: &[String],
    ) -> EngineResult<HashMap<String, BatchCheck>> {
        let mut result = HashMap::with_capacity(keys.len());
        if keys.is_empty() {
            return Ok(result);
        }

        for chunk in keys.chunks(self.store.batch_limit()) {
            let found = self.store.get_many(chunk).await?;
            let mut by_key: HashMap<&str, &IdempotencyRecord> =
                found.iter().map(|r| (r.key.as_str(), r)).collect();

            for key in chunk {
                let entry = match by_key.remove(key.as_str()) {
                    Some(record) => BatchCheck {
                        is_duplicate: true,
                        existing_data: record.data.clone(),
                    },
                    None => BatchCheck {
                        is_duplicate: false,
                        existing_data: None,
                    },
                };
                result.insert(key.clone(), entry);
            }
        }

        Ok(result)
    }
}
