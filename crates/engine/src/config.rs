//! Engine configuration
//!
//! All values have working defaults so the engine can run in dev/test without
//! any environment. Numeric values that fail to parse are configuration
//! errors, not silent fallbacks.

use crate::error::{EngineError, EngineResult};

/// Default retry budget before a dead-lettered event is quarantined
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Default idempotency claim lifetime (24h)
pub const DEFAULT_IDEMPOTENCY_TTL_SECONDS: u64 = 86_400;

/// Engine-wide configuration, built once at process start and passed
/// explicitly into every handler and the conductor.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// `source` stamped on every outbound bus entry
    pub event_source: String,
    /// Name of the primary bus outbound entries target
    pub primary_bus: String,
    /// Business retry budget enforced by the dead-letter conductor
    pub max_retries: u32,
    /// Idempotency claim lifetime, overridable per claim
    pub idempotency_ttl_seconds: u64,
    /// Seat count at which the auto-upgrade policy flags a subscription.
    /// `None` disables the policy.
    pub auto_upgrade_seat_threshold: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            event_source: "seatflow.billing".to_string(),
            primary_bus: "billing-events".to_string(),
            max_retries: DEFAULT_MAX_RETRIES,
            idempotency_ttl_seconds: DEFAULT_IDEMPOTENCY_TTL_SECONDS,
            auto_upgrade_seat_threshold: None,
        }
    }
}

impl EngineConfig {
    /// Build configuration from environment variables, falling back to
    /// defaults for anything unset.
    pub fn from_env() -> EngineResult<Self> {
        let defaults = Self::default();

        Ok(Self {
            event_source: env_or("SEATFLOW_EVENT_SOURCE", &defaults.event_source),
            primary_bus: env_or("SEATFLOW_PRIMARY_BUS", &defaults.primary_bus),
            max_retries: env_parsed("SEATFLOW_MAX_RETRIES", defaults.max_retries)?,
            idempotency_ttl_seconds: env_parsed(
                "SEATFLOW_IDEMPOTENCY_TTL_SECONDS",
                defaults.idempotency_ttl_seconds,
            )?,
            auto_upgrade_seat_threshold: match std::env::var("SEATFLOW_AUTO_UPGRADE_SEATS") {
                Ok(raw) => Some(parse_var("SEATFLOW_AUTO_UPGRADE_SEATS", &raw)?),
                Err(_) => None,
            },
        })
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> EngineResult<T> {
    match std::env::var(key) {
        Ok(raw) => parse_var(key, &raw),
        Err(_) => Ok(default),
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, raw: &str) -> EngineResult<T> {
    raw.parse()
        .map_err(|_| EngineError::Config(format!("invalid value for {}: {}", key, raw)))
}
