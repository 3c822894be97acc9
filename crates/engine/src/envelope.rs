//! Event envelopes
//!
//! The inbound envelope is parsed and validated exactly once at the boundary;
//! everything past the router works on typed structures. The retry envelope
//! carries redrive bookkeeping for the dead-letter conductor and is merged
//! into the event detail under the `retry` key on each redrive cycle.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use crate::error::{EngineError, EngineResult};

/// Message attribute carrying the business retry count on dead-lettered
/// messages. Absent means zero.
pub const RETRY_COUNT_ATTRIBUTE: &str = "retry_count";

/// Key under which the retry envelope lives inside an event's detail
const RETRY_DETAIL_KEY: &str = "retry";

/// Inbound event envelope as delivered by the managed bus.
///
/// `detail` stays opaque here; type-specific payloads are parsed by the
/// matching handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub source: String,
    #[serde(with = "time::serde::rfc3339")]
    pub time: OffsetDateTime,
    pub detail: Value,
}

impl EventEnvelope {
    /// Parse a raw message body. Failures are permanent per-message errors,
    /// never candidates for business retry.
    pub fn from_json(raw: &str) -> EngineResult<Self> {
        serde_json::from_str(raw)
            .map_err(|e| EngineError::MalformedEvent(format!("unparseable envelope: {}", e)))
    }
}

/// Redrive bookkeeping attached to an event by the dead-letter conductor.
///
/// `retry_count` increases by exactly 1 per redrive cycle; once it reaches
/// the configured budget the event is quarantined and never redriven again.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryEnvelope {
    pub retry_count: u32,
    pub original_event_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub original_event_time: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub first_failure_time: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_retry_time: OffsetDateTime,
}

impl RetryEnvelope {
    /// Read a retry envelope previously merged into an event detail.
    pub fn from_detail(detail: &Value) -> Option<Self> {
        let raw = detail.get(RETRY_DETAIL_KEY)?;
        serde_json::from_value(raw.clone()).ok()
    }

    /// Merge this envelope into an event detail. The detail must be a JSON
    /// object; anything else cannot carry retry metadata.
    pub fn merge_into(&self, detail: &mut Value) -> EngineResult<()> {
        let object = detail.as_object_mut().ok_or_else(|| {
            EngineError::MalformedEvent("event detail is not a JSON object".to_string())
        })?;
        object.insert(RETRY_DETAIL_KEY.to_string(), serde_json::to_value(self)?);
        Ok(())
    }
}

/// Parse the business retry count from transport message attributes.
///
/// The count is typed once here, with an explicit default of 0 when the
/// attribute is absent. A present-but-non-numeric attribute is malformed
/// input, not a zero.
pub fn retry_count_from_attributes(
    attributes: &HashMap<String, String>,
) -> EngineResult<Option<u32>> {
    match attributes.get(RETRY_COUNT_ATTRIBUTE) {
        Some(raw) => raw
            .parse::<u32>()
            .map(Some)
            .map_err(|_| {
                EngineError::MalformedEvent(format!(
                    "non-numeric {} attribute: {}",
                    RETRY_COUNT_ATTRIBUTE, raw
                ))
            }),
        None => Ok(None),
    }
}
