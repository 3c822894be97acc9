//! Seatflow Worker
//!
//! Wires the event engine to its external collaborators and drives it:
//! - Postgres-backed idempotency ledger and scheduled-action store
//! - NATS event bus, dead-letter consumer, and quarantine sink
//!
//! Every client is built once at startup and passed explicitly into the
//! engine. The worker owns no business logic and no retry logic: failed
//! messages are left to the transport's own redelivery.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use seatflow_engine::{
    DeadLetterMessage, EngineConfig, EngineService, EventBus, EventEnvelope, IdempotencyStore,
    NatsBus, NatsQuarantine, PostgresActionStore, PostgresStore, QuarantineSink,
    ScheduledActionStore,
};
use sqlx::postgres::PgPoolOptions;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Transport wiring configuration, separate from the engine's own config
struct WorkerConfig {
    nats_url: String,
    inbound_subject: String,
    dead_letter_subject: String,
    quarantine_subject: String,
    dead_letter_batch_size: usize,
}

impl WorkerConfig {
    fn from_env() -> Self {
        let env_or = |key: &str, default: &str| {
            std::env::var(key).unwrap_or_else(|_| default.to_string())
        };
        Self {
            nats_url: env_or("NATS_URL", "nats://localhost:4222"),
            inbound_subject: env_or("SEATFLOW_INBOUND_SUBJECT", "billing.inbound"),
            dead_letter_subject: env_or("SEATFLOW_DEAD_LETTER_SUBJECT", "billing.dead_letter"),
            quarantine_subject: env_or("SEATFLOW_QUARANTINE_SUBJECT", "billing.quarantine"),
            dead_letter_batch_size: std::env::var("SEATFLOW_DEAD_LETTER_BATCH_SIZE")
                .ok()
                .and_then(|raw| raw.parse().ok())
                .unwrap_or(10),
        }
    }
}

/// Create a database connection pool
async fn create_db_pool() -> anyhow::Result<sqlx::PgPool> {
    #[allow(clippy::expect_used)] // Fail-fast on startup if required config is missing
    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&database_url)
        .await?;

    info!("Database pool created");
    Ok(pool)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Load environment
    dotenvy::dotenv().ok();

    info!("Starting Seatflow Worker");

    let pool = create_db_pool().await?;
    sqlx::migrate!("../../migrations").run(&pool).await?;

    let worker_config = WorkerConfig::from_env();
    let engine_config = EngineConfig::from_env()?;

    let nats = async_nats::connect(worker_config.nats_url.as_str()).await?;
    info!(url = %worker_config.nats_url, "Connected to NATS");

    // Build every external client once; the engine only ever sees these
    let store = Arc::new(PostgresStore::new(pool.clone())) as Arc<dyn IdempotencyStore>;
    let actions =
        Arc::new(PostgresActionStore::new(pool.clone())) as Arc<dyn ScheduledActionStore>;
    let bus = Arc::new(NatsBus::new(nats.clone())) as Arc<dyn EventBus>;
    let quarantine = Arc::new(NatsQuarantine::new(
        nats.clone(),
        worker_config.quarantine_subject.clone(),
    )) as Arc<dyn QuarantineSink>;

    let engine = Arc::new(EngineService::new(
        store,
        bus,
        quarantine,
        actions,
        engine_config,
    ));

    let inbound = nats
        .subscribe(worker_config.inbound_subject.clone())
        .await?;
    let dead_letters = nats
        .subscribe(worker_config.dead_letter_subject.clone())
        .await?;
    info!(
        inbound = %worker_config.inbound_subject,
        dead_letter = %worker_config.dead_letter_subject,
        "Subscribed to transport subjects"
    );

    let inbound_task = tokio::spawn(run_inbound(Arc::clone(&engine), inbound));
    let redrive_task = tokio::spawn(run_redrive(
        Arc::clone(&engine),
        dead_letters,
        worker_config.dead_letter_batch_size,
    ));

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, stopping consumers");
    inbound_task.abort();
    redrive_task.abort();

    Ok(())
}

/// Consume inbound events and feed them through the router.
async fn run_inbound(engine: Arc<EngineService>, mut messages: async_nats::Subscriber) {
    while let Some(message) = messages.next().await {
        let body = String::from_utf8_lossy(&message.payload).to_string();

        let envelope = match EventEnvelope::from_json(&body) {
            Ok(envelope) => envelope,
            Err(e) => {
                // Permanent failure: redelivering an unparseable body would
                // loop forever
                error!(error = %e, "Dropping malformed inbound message");
                continue;
            }
        };

        if let Err(e) = engine.router.process(&envelope).await {
            error!(
                event_id = %envelope.id,
                event_type = %envelope.event_type,
                error = %e,
                "Event processing failed - transport redelivery applies"
            );
        }
    }
    warn!("Inbound subscription closed");
}

/// Consume dead-lettered messages in small batches and hand them to the
/// conductor. Batch-item failures stay with the transport for redelivery.
async fn run_redrive(
    engine: Arc<EngineService>,
    mut messages: async_nats::Subscriber,
    batch_size: usize,
) {
    while let Some(first) = messages.next().await {
        let mut batch = vec![to_dead_letter(first)];

        // Opportunistically fill the batch without waiting for it
        while batch.len() < batch_size {
            match tokio::time::timeout(Duration::from_millis(100), messages.next()).await {
                Ok(Some(message)) => batch.push(to_dead_letter(message)),
                _ => break,
            }
        }

        let disposition = engine.conductor.process_batch(batch).await;
        if !disposition.batch_item_failures.is_empty() {
            warn!(
                failed = disposition.batch_item_failures.len(),
                "Dead-letter messages left for transport redelivery"
            );
        }
    }
    warn!("Dead-letter subscription closed");
}

/// Convert a transport message into the conductor's input shape.
fn to_dead_letter(message: async_nats::Message) -> DeadLetterMessage {
    let mut attributes = HashMap::new();
    if let Some(headers) = &message.headers {
        for (key, values) in headers.iter() {
            // Take the first value for each header
            if let Some(value) = values.first() {
                attributes.insert(key.to_string(), value.to_string());
            }
        }
    }

    let message_id = attributes
        .get("Nats-Msg-Id")
        .cloned()
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    DeadLetterMessage {
        message_id,
        body: String::from_utf8_lossy(&message.payload).to_string(),
        attributes,
    }
}
