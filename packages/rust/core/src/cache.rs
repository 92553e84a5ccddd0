//! Cache store: memoized operation results with single-flight computation.
//!
//! Entries persist in [`Storage`], so a restarted run with unchanged inputs
//! reproduces the same [`OperationKey`]s and reattaches to their values.
//! [`CacheStore::acquire_or_wait`] collapses concurrent requests for one key
//! into a single computation: the first caller gets a [`ComputeGuard`], the
//! others wait for it to publish or fail.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{Duration, Utc};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::watch;
use tracing::debug;

use bookmarks_shared::{BookmarkError, Result};
use bookmarks_storage::{CacheEntry, Storage};

// ---------------------------------------------------------------------------
// OperationKey
// ---------------------------------------------------------------------------

/// Deterministic identity of one operation invocation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OperationKey {
    operation: String,
    digest: String,
}

impl OperationKey {
    /// Hash the operation name together with the canonical JSON form of `inputs`.
    pub fn new<I: Serialize + ?Sized>(operation: &str, inputs: &I) -> Result<Self> {
        let value = serde_json::to_value(inputs).map_err(|e| {
            BookmarkError::parse(format!("cannot serialize inputs of {operation}: {e}"))
        })?;

        let mut canonical = String::new();
        write_canonical(&value, &mut canonical);

        let mut hasher = Sha256::new();
        hasher.update(operation.as_bytes());
        hasher.update([0u8]);
        hasher.update(canonical.as_bytes());

        Ok(Self {
            operation: operation.to_string(),
            digest: format!("{:x}", hasher.finalize()),
        })
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    /// Hex SHA-256 used as the storage key.
    pub fn digest(&self) -> &str {
        &self.digest
    }
}

impl std::fmt::Display for OperationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.operation, &self.digest[..12])
    }
}

/// JSON with object keys sorted at every level.
fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

// ---------------------------------------------------------------------------
// CacheStore
// ---------------------------------------------------------------------------

/// State of an in-flight computation as seen by its waiters.
#[derive(Debug, Clone)]
enum Flight {
    Pending,
    Published(CacheEntry),
    Failed(String),
}

/// Outcome of [`CacheStore::acquire_or_wait`].
pub enum Slot<'a> {
    /// Nobody has computed this key yet; the caller must compute and publish.
    Compute(ComputeGuard<'a>),
    /// A live cached value.
    Ready(CacheEntry),
    /// The concurrent computation of this key failed with this message.
    Failed(String),
}

/// Shared, persistent cache of operation results.
pub struct CacheStore {
    storage: Arc<Storage>,
    in_flight: Mutex<HashMap<String, watch::Receiver<Flight>>>,
}

impl CacheStore {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self {
            storage,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Live entry for `key`; expired entries are absent.
    pub async fn get(&self, key: &OperationKey) -> Result<Option<CacheEntry>> {
        self.storage.get_cache_entry(key.digest(), Utc::now()).await
    }

    /// Store `value_json` under `key` for `ttl`.
    pub async fn put(
        &self,
        key: &OperationKey,
        value_json: String,
        ttl: Duration,
    ) -> Result<CacheEntry> {
        let now = Utc::now();
        let entry = CacheEntry {
            key: key.digest().to_string(),
            operation: key.operation().to_string(),
            value_json,
            created_at: now,
            expires_at: now + ttl,
        };
        self.storage.put_cache_entry(&entry).await?;
        Ok(entry)
    }

    /// Drop the entry for `key` (e.g., when it no longer decodes).
    pub async fn invalidate(&self, key: &OperationKey) -> Result<()> {
        self.storage.delete_cache_entry(key.digest()).await?;
        Ok(())
    }

    /// Delete expired entries. Returns the number removed.
    pub async fn purge_expired(&self) -> Result<u64> {
        self.storage.purge_expired(Utc::now()).await
    }

    /// Return the cached value, or make the caller the single computer of `key`,
    /// or wait for the caller already computing it.
    pub async fn acquire_or_wait(&self, key: &OperationKey) -> Result<Slot<'_>> {
        loop {
            if let Some(entry) = self.get(key).await? {
                return Ok(Slot::Ready(entry));
            }

            let waiting = {
                let mut in_flight = self.lock_in_flight();
                match in_flight.get(key.digest()) {
                    Some(rx) => Err(rx.clone()),
                    None => {
                        let (tx, rx) = watch::channel(Flight::Pending);
                        in_flight.insert(key.digest().to_string(), rx);
                        Ok(tx)
                    }
                }
            };

            match waiting {
                Ok(tx) => {
                    let guard = ComputeGuard {
                        store: self,
                        key: key.clone(),
                        tx,
                    };
                    // A computer may have published and left between the lookup and
                    // the registration above.
                    if let Some(entry) = self.get(key).await? {
                        let _ = guard.tx.send(Flight::Published(entry.clone()));
                        return Ok(Slot::Ready(entry));
                    }
                    return Ok(Slot::Compute(guard));
                }
                Err(mut rx) => {
                    debug!(key = %key, "waiting for concurrent computation");
                    let flight = match rx.wait_for(|f| !matches!(f, Flight::Pending)).await {
                        Ok(flight) => flight.clone(),
                        // The computer went away without a result; start over.
                        Err(_) => continue,
                    };
                    match flight {
                        Flight::Published(entry) => return Ok(Slot::Ready(entry)),
                        Flight::Failed(message) => return Ok(Slot::Failed(message)),
                        Flight::Pending => continue,
                    }
                }
            }
        }
    }

    /// Number of keys currently being computed.
    pub fn in_flight(&self) -> usize {
        self.lock_in_flight().len()
    }

    fn lock_in_flight(&self) -> std::sync::MutexGuard<'_, HashMap<String, watch::Receiver<Flight>>> {
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

// ---------------------------------------------------------------------------
// ComputeGuard
// ---------------------------------------------------------------------------

/// Exclusive right to compute one key.
///
/// Dropping the guard without publishing or failing releases the key, and
/// waiters retry the lookup.
pub struct ComputeGuard<'a> {
    store: &'a CacheStore,
    key: OperationKey,
    tx: watch::Sender<Flight>,
}

impl ComputeGuard<'_> {
    /// Persist the result, then wake the waiters.
    pub async fn publish(self, value_json: String, ttl: Duration) -> Result<CacheEntry> {
        let entry = self.store.put(&self.key, value_json, ttl).await?;
        let _ = self.tx.send(Flight::Published(entry.clone()));
        Ok(entry)
    }

    /// Share a failure with the waiters. Nothing is cached.
    pub fn fail(self, message: impl Into<String>) {
        let _ = self.tx.send(Flight::Failed(message.into()));
    }
}

impl Drop for ComputeGuard<'_> {
    fn drop(&mut self) {
        self.store.lock_in_flight().remove(self.key.digest());
    }
}
