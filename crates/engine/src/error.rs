//! Engine error types

use thiserror::Error;

/// Result type for all engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors surfaced by the event-processing engine.
///
/// Duplicate claims and exhausted retry budgets are deliberately NOT errors:
/// they are ordinary outcomes (`Claim::is_duplicate`, quarantine dispositions)
/// and never abort a message. Everything here propagates to the invoking
/// transport so its native redelivery applies.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Idempotency ledger or scheduled-action store unavailable
    #[error("database error: {0}")]
    Database(String),

    /// Event bus transport failure (connection-level, not per-entry)
    #[error("event bus error: {0}")]
    Bus(String),

    /// The bus accepted some entries of a publish call and rejected others
    #[error("{failed} of {attempted} bus entries failed to publish")]
    PartialPublish { failed: usize, attempted: usize },

    /// One or more per-item cancellation notices failed after every
    /// attempt ran to completion
    #[error("{failed} of {attempted} cancellation notices failed")]
    CancellationIncomplete { failed: usize, attempted: usize },

    /// Unparseable body or missing required correlation fields.
    /// Permanent per-message failure; never routed through business retry.
    #[error("malformed event: {0}")]
    MalformedEvent(String),

    /// Quarantine transport rejected a relocation
    #[error("quarantine write failed: {0}")]
    Quarantine(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        EngineError::Database(err.to_string())
    }
}
