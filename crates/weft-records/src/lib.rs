#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **weft-records** – Keyed record stores for Weft.
//!
//! A record store holds at most one committed record per key. Transactions
//! check it on entry (the read-through short-circuit), write their staged
//! result through it on commit, and - under SERIALIZABLE isolation - take its
//! per-key lock for the duration of the scope. Drivers declare which
//! isolation levels they can honor; a mismatch is rejected when the
//! transaction is entered, not when it commits.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::OwnedMutexGuard;
use tracing::debug;

use weft_results::{PersistedResult, ResultFactory, ResultRef};

fn relock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

//─────────────────────────────
//  Isolation levels
//─────────────────────────────

/// How strictly concurrent transactions on the same key are separated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IsolationLevel {
    /// No cross-transaction locking; later entrants see committed records.
    ReadCommitted,
    /// A per-key exclusive lock serializes entries.
    Serializable,
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IsolationLevel::ReadCommitted => f.write_str("READ_COMMITTED"),
            IsolationLevel::Serializable => f.write_str("SERIALIZABLE"),
        }
    }
}

//─────────────────────────────
//  Records and the store trait
//─────────────────────────────

/// A committed `(key, result)` pair.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionRecord {
    /// Key the record is committed under.
    pub key: String,
    /// The committed result reference; a transaction may commit with nothing
    /// staged, in which case the record is empty.
    pub result: Option<ResultRef>,
}

/// Interface over keyed records with existence, read, write, locking and
/// isolation-support predicates.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Driver name used in diagnostics.
    fn name(&self) -> &'static str;

    /// Whether a committed record exists for `key`.
    async fn exists(&self, key: &str) -> bool;

    /// Read the committed record for `key`, if any.
    async fn read(&self, key: &str) -> Option<TransactionRecord>;

    /// Commit `result` under `key`. At most one committed record exists per
    /// key; on a conflict the first writer wins.
    async fn write(&self, key: &str, result: Option<ResultRef>) -> Result<()>;

    /// Take the per-key lock, waiting until the current holder releases it.
    /// A no-op for drivers without locking support.
    async fn acquire_lock(&self, key: &str);

    /// Release the per-key lock. Releasing a key that was never locked must
    /// be tolerated.
    fn release_lock(&self, key: &str);

    /// Whether this driver can honor `level`.
    fn supports_isolation_level(&self, level: IsolationLevel) -> bool;
}

//─────────────────────────────
//  In-memory driver
//─────────────────────────────

/// In-process record store with a per-key mutex. Supports SERIALIZABLE.
///
/// Lock acquisition parks the caller on a per-key async mutex; the owned
/// guard is parked in a holder table so `release_lock` can drop it by key
/// from any context.
#[derive(Default)]
pub struct MemoryRecordStore {
    records: Mutex<HashMap<String, TransactionRecord>>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    held: Mutex<HashMap<String, OwnedMutexGuard<()>>>,
}

impl MemoryRecordStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of committed records, for tests and introspection.
    pub fn record_count(&self) -> usize {
        relock(&self.records).len()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    fn name(&self) -> &'static str {
        "MemoryRecordStore"
    }

    async fn exists(&self, key: &str) -> bool {
        relock(&self.records).contains_key(key)
    }

    async fn read(&self, key: &str) -> Option<TransactionRecord> {
        relock(&self.records).get(key).cloned()
    }

    async fn write(&self, key: &str, result: Option<ResultRef>) -> Result<()> {
        relock(&self.records)
            .entry(key.to_string())
            .or_insert_with(|| TransactionRecord {
                key: key.to_string(),
                result,
            });
        Ok(())
    }

    async fn acquire_lock(&self, key: &str) {
        let lock = relock(&self.locks)
            .entry(key.to_string())
            .or_default()
            .clone();
        let guard = lock.lock_owned().await;
        debug!(key, "acquired record lock");
        relock(&self.held).insert(key.to_string(), guard);
    }

    fn release_lock(&self, key: &str) {
        if relock(&self.held).remove(key).is_some() {
            debug!(key, "released record lock");
        }
    }

    fn supports_isolation_level(&self, _level: IsolationLevel) -> bool {
        true
    }
}

//─────────────────────────────
//  Result-factory adapter
//─────────────────────────────

/// A record store backed by a [`ResultFactory`].
///
/// Reads build a persisted reference over the factory's storage block at the
/// record key; writes persist the staged reference (idempotently) or mint one
/// from a raw value. Concurrency is delegated to the underlying block, so
/// only READ_COMMITTED is supported and the lock operations are no-ops.
pub struct ResultFactoryStore {
    factory: ResultFactory,
    cache: Mutex<Option<PersistedResult>>,
}

impl ResultFactoryStore {
    /// Wrap `factory` as a record store.
    pub fn new(factory: ResultFactory) -> Self {
        Self {
            factory,
            cache: Mutex::new(None),
        }
    }

    /// The factory this store writes through.
    pub fn result_factory(&self) -> &ResultFactory {
        &self.factory
    }

    fn reference_for(&self, key: &str) -> PersistedResult {
        let reference = PersistedResult::from_parts(
            self.factory.serializer().tag().to_string(),
            key.to_string(),
            self.factory.storage_block_id(),
            None,
        );
        reference.hydrate(self.factory.storage_block(), self.factory.serializer());
        reference
    }
}

#[async_trait]
impl RecordStore for ResultFactoryStore {
    fn name(&self) -> &'static str {
        "ResultFactoryStore"
    }

    async fn exists(&self, key: &str) -> bool {
        let Some(record) = self.read(key).await else {
            return false;
        };
        let Some(ResultRef::Persisted(reference)) = record.result else {
            return false;
        };
        if reference.get().await.is_err() {
            return false;
        }
        // a payload past its expiration no longer counts as committed
        let live = match reference.expiration() {
            Some(expiration) => expiration > Utc::now(),
            None => true,
        };
        if live {
            *relock(&self.cache) = Some(reference);
        }
        live
    }

    async fn read(&self, key: &str) -> Option<TransactionRecord> {
        if let Some(cached) = relock(&self.cache).clone() {
            if cached.storage_key() == key {
                return Some(TransactionRecord {
                    key: key.to_string(),
                    result: Some(ResultRef::Persisted(cached)),
                });
            }
        }
        Some(TransactionRecord {
            key: key.to_string(),
            result: Some(ResultRef::Persisted(self.reference_for(key))),
        })
    }

    async fn write(&self, key: &str, result: Option<ResultRef>) -> Result<()> {
        match result {
            Some(ResultRef::Persisted(reference)) => {
                // already a reference; the write is idempotent
                reference.write(None).await?;
                Ok(())
            }
            Some(other) => {
                let value = other.get().await?;
                self.factory
                    .create_result(value, Some(key.to_string()), None, false)
                    .await?;
                Ok(())
            }
            None => Ok(()),
        }
    }

    async fn acquire_lock(&self, _key: &str) {}

    fn release_lock(&self, _key: &str) {}

    fn supports_isolation_level(&self, level: IsolationLevel) -> bool {
        level == IsolationLevel::ReadCommitted
    }
}
