// Engine crate clippy configuration
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Seatflow Event Engine
//!
//! Turns at-least-once, possibly duplicated, possibly reordered deliveries
//! of billing lifecycle events into exactly-once-effective business events.
//!
//! ## Features
//!
//! - **Idempotency Guard**: conditional-insert claims so concurrent
//!   duplicate deliveries produce at most one side effect
//! - **Lifecycle Classifier**: pure, fixed-priority mapping of a
//!   current/previous snapshot to one business transition
//! - **Quantity Fan-out**: one license-unit event per added seat, with
//!   per-unit dedup keys
//! - **Cancellation / Uncancellation / Renewal**: per-item cancellation
//!   notices, scheduled-action bookkeeping, once-per-period renewals
//! - **Dead-Letter Retry Conductor**: bounded redrive tier with terminal
//!   quarantine

pub mod bus;
pub mod cancellation;
pub mod conductor;
pub mod config;
pub mod envelope;
pub mod error;
pub mod idempotency;
pub mod ledger;
pub mod lifecycle;
pub mod quantity;
pub mod renewal;
pub mod router;
pub mod snapshot;


// Bus
pub use bus::{
    EventBus, EventEntry, InMemoryBus, NatsBus, PublishFailure, PublishOutcome,
    MAX_ENTRIES_PER_PUBLISH,
};

// Cancellation
pub use cancellation::{
    CancellationHandler, CancellationReport, InMemoryActionStore, PostgresActionStore,
    ScheduledActionStore, ScheduledCancellation, UncancellationHandler, CANCELLATION_EVENT,
};

// Conductor
pub use conductor::{
    BatchDisposition, DeadLetterConductor, DeadLetterMessage, InMemoryQuarantine, NatsQuarantine,
    QuarantineRecord, QuarantineSink, RedriveSummary,
};

// Config
pub use config::{EngineConfig, DEFAULT_IDEMPOTENCY_TTL_SECONDS, DEFAULT_MAX_RETRIES};

// Envelope
pub use envelope::{
    retry_count_from_attributes, EventEnvelope, RetryEnvelope, RETRY_COUNT_ATTRIBUTE,
};

// Error
pub use error::{EngineError, EngineResult};

// Idempotency
pub use idempotency::{event_key, BatchCheck, Claim, IdempotencyGuard};

// Ledger
pub use ledger::{
    IdempotencyRecord, IdempotencyStore, InMemoryStore, InsertOutcome, PostgresStore,
};

// Lifecycle
pub use lifecycle::{classify, AutoUpgrade, AutoUpgradePolicy, LifecycleTransition};

// Quantity
pub use quantity::{QuantityChangeHandler, QuantityChangeReport, LICENSE_UNIT_EVENT};

// Renewal
pub use renewal::{renewal_key, RenewalHandler, RENEWAL_EVENT};

// Router
pub use router::{EventRouter, AUTO_UPGRADE_EVENT, SUBSCRIPTION_UPDATED};

// Snapshot
pub use snapshot::{
    PreviousAttributes, SubscriptionItem, SubscriptionSnapshot, SubscriptionStatus, UpdatePayload,
    UsageType,
};

use std::sync::Arc;

/// The assembled engine: inbound router plus dead-letter conductor sharing
/// one configuration. External clients (ledger store, bus, quarantine,
/// scheduled-action store) are built by the caller and injected once.
pub struct EngineService {
    pub router: EventRouter,
    pub conductor: DeadLetterConductor,
    pub guard: Arc<IdempotencyGuard>,
}

impl EngineService {
    pub fn new(
        store: Arc<dyn IdempotencyStore>,
        bus: Arc<dyn EventBus>,
        quarantine: Arc<dyn QuarantineSink>,
        actions: Arc<dyn ScheduledActionStore>,
        config: EngineConfig,
    ) -> Self {
        let config = Arc::new(config);
        let guard = Arc::new(IdempotencyGuard::with_ttl(
            store,
            config.idempotency_ttl_seconds,
        ));

        Self {
            router: EventRouter::new(
                Arc::clone(&guard),
                Arc::clone(&bus),
                actions,
                Arc::clone(&config),
            ),
            conductor: DeadLetterConductor::new(bus, quarantine, config),
            guard,
        }
    }
}
