//! Idempotency ledger
//!
//! A conditional-insert-or-fail key-value store. The conditional insert is
//! the engine's only concurrency-control primitive: whichever concurrent
//! writer lands first owns the key, everyone else sees `KeyExists` and must
//! perform zero side effects. Records are immutable once written and expire
//! at `expires_at`; an expired key is reclaimable.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde_json::Value;
use sqlx::PgPool;
use time::OffsetDateTime;
use tokio::sync::Mutex;

use crate::error::EngineResult;

/// A single claim recorded in the ledger
#[derive(Debug, Clone)]
pub struct IdempotencyRecord {
    pub key: String,
    pub processed_at: OffsetDateTime,
    pub expires_at: OffsetDateTime,
    pub data: Option<Value>,
}

/// Outcome of a conditional insert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The key was absent (or expired) and is now claimed by this writer
    Inserted,
    /// A live record already holds the key; the caller lost the race
    KeyExists,
}

/// Storage backend for idempotency claims
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Write `record` only if its key is absent or expired. `KeyExists` is
    /// the distinguishable condition-failed signal; any other storage
    /// failure propagates as an error.
    async fn put_if_absent(&self, record: &IdempotencyRecord) -> EngineResult<InsertOutcome>;

    /// Read-only lookup of live records for the given keys. Missing and
    /// expired keys are simply absent from the result.
    async fn get_many(&self, keys: &[String]) -> EngineResult<Vec<IdempotencyRecord>>;

    /// Largest key count a single `get_many` call may carry
    fn batch_limit(&self) -> usize {
        100
    }
}

/// Postgres-backed ledger.
///
/// The claim is a single atomic statement: the upsert only fires when the
/// existing row has expired, so exactly one concurrent writer gets a row
/// back and everyone else gets `KeyExists`.
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl IdempotencyStore for PostgresStore {
    async fn put_if_absent(&self, record: &IdempotencyRecord) -> EngineResult<InsertOutcome> {
        let claimed: Option<(String,)> = sqlx::query_as(
            r#"
            INSERT INTO idempotency_keys (key, processed_at, expires_at, data)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (key) DO UPDATE SET
                processed_at = EXCLUDED.processed_at,
                expires_at = EXCLUDED.expires_at,
                data = EXCLUDED.data
            WHERE idempotency_keys.expires_at <= NOW()
            RETURNING key
            "#,
        )
        .bind(&record.key)
        .bind(record.processed_at)
        .bind(record.expires_at)
        .bind(&record.data)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match claimed {
            Some(_) => InsertOutcome::Inserted,
            None => InsertOutcome::KeyExists,
        })
    }

    async fn get_many(&self, keys: &[String]) -> EngineResult<Vec<IdempotencyRecord>> {
        let rows: Vec<(String, OffsetDateTime, OffsetDateTime, Option<Value>)> = sqlx::query_as(
            r#"
            SELECT key, processed_at, expires_at, data
            FROM idempotency_keys
            WHERE key = ANY($1) AND expires_at > NOW()
            "#,
        )
        .bind(keys)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(key, processed_at, expires_at, data)| IdempotencyRecord {
                key,
                processed_at,
                expires_at,
                data,
            })
            .collect())
    }
}

/// In-memory ledger for tests and local development.
///
/// Counts store round-trips so tests can assert call behavior (e.g. the
/// empty batch check making zero calls).
#[derive(Default)]
pub struct InMemoryStore {
    records: Mutex<HashMap<String, IdempotencyRecord>>,
    calls: AtomicUsize,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of store round-trips made so far
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Snapshot of live keys, for test assertions
    pub async fn live_keys(&self) -> Vec<String> {
        let now = OffsetDateTime::now_utc();
        let records = self.records.lock().await;
        records
            .values()
            .filter(|r| r.expires_at > now)
            .map(|r| r.key.clone())
            .collect()
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryStore {
    async fn put_if_absent(&self, record: &IdempotencyRecord) -> EngineResult<InsertOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = OffsetDateTime::now_utc();
        let mut records = self.records.lock().await;

        if let Some(existing) = records.get(&record.key) {
            if existing.expires_at > now {
                return Ok(InsertOutcome::KeyExists);
            }
        }
        records.insert(record.key.clone(), record.clone());
        Ok(InsertOutcome::Inserted)
    }

    async fn get_many(&self, keys: &[String]) -> EngineResult<Vec<IdempotencyRecord>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = OffsetDateTime::now_utc();
        let records = self.records.lock().await;
        Ok(keys
            .iter()
            .filter_map(|key| records.get(key))
            .filter(|r| r.expires_at > now)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;

    fn record(key: &str, ttl_seconds: i64) -> IdempotencyRecord {
        let now = OffsetDateTime::now_utc();
        IdempotencyRecord {
            key: key.to_string(),
            processed_at: now,
            expires_at: now + Duration::seconds(ttl_seconds),
            data: None,
        }
    }

    #[tokio::test]
    async fn first_insert_wins_second_loses() {
        let store = InMemoryStore::new();

        let first = store.put_if_absent(&record("k1", 60)).await.unwrap();
        let second = store.put_if_absent(&record("k1", 60)).await.unwrap();

        assert_eq!(first, InsertOutcome::Inserted);
        assert_eq!(second, InsertOutcome::KeyExists);
    }

    #[tokio::test]
    async fn expired_key_is_reclaimable() {
        let store = InMemoryStore::new();

        store.put_if_absent(&record("k1", -10)).await.unwrap();
        let reclaimed = store.put_if_absent(&record("k1", 60)).await.unwrap();

        assert_eq!(reclaimed, InsertOutcome::Inserted);
    }

    #[tokio::test]
    async fn get_many_skips_expired_records() {
        let store = InMemoryStore::new();
        store.put_if_absent(&record("live", 60)).await.unwrap();
        store.put_if_absent(&record("dead", -10)).await.unwrap();

        let found = store
            .get_many(&["live".to_string(), "dead".to_string(), "never".to_string()])
            .await
            .unwrap();

        assert_eq!(found.len(), 1);
        assert_eq!(found[0].key, "live");
    }
}
