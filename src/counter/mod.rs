//! Counter store with per-key expiry
//!
//! Warm-up/recovery streaks, per-fingerprint alert cooldowns, batch dedup
//! flags and the incident-evaluation mutex all live here. The contract is a
//! plain counter-with-TTL key-value store. [`DbCounterStore`] persists the
//! keys in the database so one-shot CLI invocations share state;
//! [`MemoryCounterStore`] is the in-process variant for tests and could be
//! swapped for an external cache service without touching callers.

use crate::storage::Database;
use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Counter-with-TTL contract shared by every ephemeral coordination point
pub trait CounterStore {
    /// Atomically increment a key and return the new value
    fn increment(&self, key: &str) -> Result<u64>;

    /// Set or refresh the expiry on a key; no-op if the key is absent
    fn expire(&self, key: &str, ttl: Duration) -> Result<()>;

    /// Current value of a key, if present and unexpired
    fn get(&self, key: &str) -> Result<Option<u64>>;

    /// Remove a key
    fn delete(&self, key: &str) -> Result<()>;

    /// Set-if-absent flag with a TTL. Returns true when this call created
    /// the flag, false when it already existed (and was unexpired).
    fn acquire(&self, key: &str, ttl: Duration) -> Result<bool>;
}

/// Convenience: increment and stamp a TTL in one call (streak counters)
pub fn increment_with_ttl(store: &dyn CounterStore, key: &str, ttl: Duration) -> Result<u64> {
    let value = store.increment(key)?;
    store.expire(key, ttl)?;
    Ok(value)
}

/// Durable counter store backed by the `counters` table. State survives
/// process exits, so the batch dedup flags and incident streaks behave the
/// same whether driven by the scheduler or by repeated one-shot commands.
pub struct DbCounterStore<'a> {
    db: &'a Database,
}

impl<'a> DbCounterStore<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Drop every expired row
    pub fn purge_expired(&self) -> Result<usize> {
        self.db.counter_purge_expired(Utc::now())
    }
}

fn deadline(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    now + ChronoDuration::from_std(ttl).unwrap_or_default()
}

impl CounterStore for DbCounterStore<'_> {
    fn increment(&self, key: &str) -> Result<u64> {
        self.db.counter_increment(key, Utc::now())
    }

    fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let now = Utc::now();
        self.db.counter_expire(key, deadline(now, ttl), now)
    }

    fn get(&self, key: &str) -> Result<Option<u64>> {
        self.db.counter_get(key, Utc::now())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.db.counter_delete(key)
    }

    fn acquire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let now = Utc::now();
        self.db.counter_acquire(key, deadline(now, ttl), now)
    }
}

struct Entry {
    value: u64,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }
}

/// In-process counter store backed by a mutex-guarded map
///
/// Expiry is lazy: expired entries are dropped when touched, plus a bulk
/// `purge_expired` for long-running processes.
#[derive(Default)]
pub struct MemoryCounterStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryCounterStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every expired entry
    pub fn purge_expired(&self) {
        let now = Instant::now();
        self.entries.lock().retain(|_, e| !e.is_expired(now));
    }

    /// Number of live entries (testing and status surfaces)
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.lock().values().filter(|e| !e.is_expired(now)).count()
    }

    /// True when no live entries remain
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CounterStore for MemoryCounterStore {
    fn increment(&self, key: &str) -> Result<u64> {
        let now = Instant::now();
        let mut entries = self.entries.lock();

        match entries.get_mut(key) {
            Some(entry) if !entry.is_expired(now) => {
                entry.value += 1;
                Ok(entry.value)
            }
            _ => {
                entries.insert(
                    key.to_string(),
                    Entry {
                        value: 1,
                        expires_at: None,
                    },
                );
                Ok(1)
            }
        }
    }

    fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let now = Instant::now();
        let mut entries = self.entries.lock();

        if let Some(entry) = entries.get_mut(key) {
            if entry.is_expired(now) {
                entries.remove(key);
            } else {
                entry.expires_at = Some(now + ttl);
            }
        }
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<u64>> {
        let now = Instant::now();
        let mut entries = self.entries.lock();

        match entries.get(key) {
            Some(entry) if entry.is_expired(now) => {
                entries.remove(key);
                Ok(None)
            }
            Some(entry) => Ok(Some(entry.value)),
            None => Ok(None),
        }
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.entries.lock().remove(key);
        Ok(())
    }

    fn acquire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let mut entries = self.entries.lock();

        match entries.get(key) {
            Some(entry) if !entry.is_expired(now) => Ok(false),
            _ => {
                entries.insert(
                    key.to_string(),
                    Entry {
                        value: 1,
                        expires_at: Some(now + ttl),
                    },
                );
                Ok(true)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_increment_sequence() {
        let store = MemoryCounterStore::new();
        assert_eq!(store.increment("a").unwrap(), 1);
        assert_eq!(store.increment("a").unwrap(), 2);
        assert_eq!(store.increment("b").unwrap(), 1);
        assert_eq!(store.get("a").unwrap(), Some(2));
    }

    #[test]
    fn test_delete_resets() {
        let store = MemoryCounterStore::new();
        store.increment("a").unwrap();
        store.delete("a").unwrap();
        assert_eq!(store.get("a").unwrap(), None);
        assert_eq!(store.increment("a").unwrap(), 1);
    }

    #[test]
    fn test_expired_key_restarts_at_one() {
        let store = MemoryCounterStore::new();
        store.increment("streak").unwrap();
        store.increment("streak").unwrap();
        store.expire("streak", Duration::from_millis(0)).unwrap();
        // A broken streak self-resets rather than resuming.
        assert_eq!(store.increment("streak").unwrap(), 1);
    }

    #[test]
    fn test_acquire_is_exclusive() {
        let store = MemoryCounterStore::new();
        assert!(store.acquire("lock", Duration::from_secs(60)).unwrap());
        assert!(!store.acquire("lock", Duration::from_secs(60)).unwrap());
        store.delete("lock").unwrap();
        assert!(store.acquire("lock", Duration::from_secs(60)).unwrap());
    }

    #[test]
    fn test_acquire_after_expiry() {
        let store = MemoryCounterStore::new();
        assert!(store.acquire("flag", Duration::from_millis(0)).unwrap());
        assert!(store.acquire("flag", Duration::from_secs(60)).unwrap());
    }

    #[test]
    fn test_purge_expired() {
        let store = MemoryCounterStore::new();
        store.acquire("gone", Duration::from_millis(0)).unwrap();
        store.acquire("kept", Duration::from_secs(60)).unwrap();
        store.purge_expired();
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_db_store_shares_state_across_instances() {
        let db = Database::open_in_memory().unwrap();

        {
            let store = DbCounterStore::new(&db);
            assert_eq!(store.increment("streak").unwrap(), 1);
            assert_eq!(store.increment("streak").unwrap(), 2);
            assert!(store.acquire("batch:b-1", Duration::from_secs(300)).unwrap());
        }

        // A fresh store over the same database sees the same keys, the way
        // two one-shot command invocations would.
        let store = DbCounterStore::new(&db);
        assert_eq!(store.get("streak").unwrap(), Some(2));
        assert_eq!(store.increment("streak").unwrap(), 3);
        assert!(!store.acquire("batch:b-1", Duration::from_secs(300)).unwrap());
    }

    #[test]
    fn test_db_store_expiry() {
        let db = Database::open_in_memory().unwrap();
        let store = DbCounterStore::new(&db);

        store.increment("streak").unwrap();
        store.expire("streak", Duration::from_millis(0)).unwrap();
        assert_eq!(store.get("streak").unwrap(), None);
        assert_eq!(store.increment("streak").unwrap(), 1);

        assert!(store.acquire("flag", Duration::from_millis(0)).unwrap());
        assert!(store.acquire("flag", Duration::from_secs(60)).unwrap());
    }

    #[test]
    fn test_db_store_purge() {
        let db = Database::open_in_memory().unwrap();
        let store = DbCounterStore::new(&db);

        store.acquire("gone", Duration::from_millis(0)).unwrap();
        store.acquire("kept", Duration::from_secs(60)).unwrap();
        assert_eq!(store.purge_expired().unwrap(), 1);
        assert_eq!(store.get("kept").unwrap(), Some(1));
    }
}
