//! In-process sharded store.
//!
//! Each shard is a map of hashes guarded by its own lock, plus the registry of
//! atomic units loaded on it. Expiry follows the usual key-value store rules:
//! a fresh hash has no TTL, expired keys are invisible to every read, and they
//! are removed lazily on access or by [`MemoryStore::purge_expired`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use super::{AtomicUnit, ScriptId, ShardTxn, Store, StoreError};
use crate::clock::{Clock, SystemClock};
use crate::error::{KeyrateError, Result};

#[derive(Debug, Clone, Default)]
struct Entry {
    fields: HashMap<String, String>,
    /// Absolute expiry in clock milliseconds
    expires_at: Option<u64>,
}

impl Entry {
    fn is_expired(&self, now: u64) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }

    fn project(&self, fields: &[&str]) -> Vec<Option<String>> {
        fields.iter().map(|f| self.fields.get(*f).cloned()).collect()
    }
}

#[derive(Default)]
struct Shard {
    entries: HashMap<String, Entry>,
    scripts: HashMap<ScriptId, Arc<dyn AtomicUnit>>,
}

impl Shard {
    fn evict_if_expired(&mut self, key: &str, now: u64) {
        if self.entries.get(key).is_some_and(|e| e.is_expired(now)) {
            self.entries.remove(key);
        }
    }

    fn live(&mut self, key: &str, now: u64) -> Option<&mut Entry> {
        self.evict_if_expired(key, now);
        self.entries.get_mut(key)
    }

    fn purge(&mut self, now: u64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| !e.is_expired(now));
        before - self.entries.len()
    }
}

/// Writes staged by an atomic unit, applied to the shard only on success.
struct MemoryTxn<'a> {
    shard: &'a mut Shard,
    now: u64,
    staged: HashMap<String, Entry>,
}

impl<'a> MemoryTxn<'a> {
    fn new(shard: &'a mut Shard, now: u64) -> Self {
        Self {
            shard,
            now,
            staged: HashMap::new(),
        }
    }

    fn staged_entry(&mut self, key: &str) -> &mut Entry {
        let shard = &mut *self.shard;
        let now = self.now;
        self.staged
            .entry(key.to_string())
            .or_insert_with(|| shard.live(key, now).cloned().unwrap_or_default())
    }

    fn commit(self) -> usize {
        let written = self.staged.len();
        self.shard.entries.extend(self.staged);
        written
    }
}

impl ShardTxn for MemoryTxn<'_> {
    fn hmget(&mut self, key: &str, fields: &[&str]) -> Vec<Option<String>> {
        if let Some(entry) = self.staged.get(key) {
            return entry.project(fields);
        }
        match self.shard.live(key, self.now) {
            Some(entry) => entry.project(fields),
            None => vec![None; fields.len()],
        }
    }

    fn hmset(&mut self, key: &str, fields: &[(&str, String)]) {
        let entry = self.staged_entry(key);
        for (field, value) in fields {
            entry.fields.insert((*field).to_string(), value.clone());
        }
    }

    fn expire(&mut self, key: &str, ttl_secs: u64) -> bool {
        let exists = self.staged.contains_key(key) || self.shard.live(key, self.now).is_some();
        if !exists {
            return false;
        }
        let expires_at = self.now.saturating_add(ttl_secs.saturating_mul(1000));
        self.staged_entry(key).expires_at = Some(expires_at);
        true
    }
}

/// A sharded key-value store living in this process.
pub struct MemoryStore {
    shards: Vec<Mutex<Shard>>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("shards", &self.shards.len())
            .finish()
    }
}

impl MemoryStore {
    /// Create a store with `shards` shards expiring keys by the system clock.
    pub fn new(shards: usize) -> Result<Self> {
        Self::with_clock(shards, Arc::new(SystemClock))
    }

    /// Create a store whose key expiry follows `clock`.
    pub fn with_clock(shards: usize, clock: Arc<dyn Clock>) -> Result<Self> {
        if shards == 0 {
            return Err(KeyrateError::Config(
                "store needs at least one shard".to_string(),
            ));
        }

        info!(shards, "Creating in-memory store");

        Ok(Self {
            shards: (0..shards).map(|_| Mutex::new(Shard::default())).collect(),
            clock,
        })
    }

    fn shard(&self, shard: usize) -> std::result::Result<MutexGuard<'_, Shard>, StoreError> {
        self.shards
            .get(shard)
            .map(|s| s.lock())
            .ok_or(StoreError::NoSuchShard {
                shard,
                count: self.shards.len(),
            })
    }

    /// Remove every expired key, returning how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_ms();
        self.shards.iter().map(|s| s.lock().purge(now)).sum()
    }

    /// Number of live (unexpired) keys across all shards.
    pub fn len(&self) -> usize {
        let now = self.clock.now_ms();
        self.shards
            .iter()
            .map(|s| {
                s.lock()
                    .entries
                    .values()
                    .filter(|e| !e.is_expired(now))
                    .count()
            })
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remaining time to live of `key` in milliseconds, `None` if it is
    /// missing or has no expiry.
    pub fn ttl_ms(&self, shard: usize, key: &str) -> std::result::Result<Option<u64>, StoreError> {
        let now = self.clock.now_ms();
        let mut guard = self.shard(shard)?;
        Ok(guard
            .live(key, now)
            .and_then(|e| e.expires_at)
            .map(|at| at - now))
    }

    /// Drop every registered atomic unit, as a restarted store would.
    pub fn flush_scripts(&self) {
        for shard in &self.shards {
            shard.lock().scripts.clear();
        }
        warn!("Flushed all registered scripts");
    }

    /// Periodically purge expired keys until the store is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let store = Arc::downgrade(self);
        let every = every.max(Duration::from_millis(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(store) = store.upgrade() else {
                    break;
                };
                let purged = store.purge_expired();
                if purged > 0 {
                    debug!(purged, "Purged expired keys");
                }
            }
        })
    }
}

#[async_trait]
impl Store for MemoryStore {
    fn shard_count(&self) -> usize {
        self.shards.len()
    }

    async fn hmget(
        &self,
        shard: usize,
        key: &str,
        fields: &[&str],
    ) -> std::result::Result<Vec<Option<String>>, StoreError> {
        let now = self.clock.now_ms();
        let mut guard = self.shard(shard)?;
        Ok(match guard.live(key, now) {
            Some(entry) => entry.project(fields),
            None => vec![None; fields.len()],
        })
    }

    async fn hmset(
        &self,
        shard: usize,
        key: &str,
        fields: &[(&str, String)],
    ) -> std::result::Result<(), StoreError> {
        let now = self.clock.now_ms();
        let mut guard = self.shard(shard)?;
        guard.evict_if_expired(key, now);
        let entry = guard.entries.entry(key.to_string()).or_default();
        for (field, value) in fields {
            entry.fields.insert((*field).to_string(), value.clone());
        }
        Ok(())
    }

    async fn expire(
        &self,
        shard: usize,
        key: &str,
        ttl_secs: u64,
    ) -> std::result::Result<bool, StoreError> {
        let now = self.clock.now_ms();
        let mut guard = self.shard(shard)?;
        Ok(match guard.live(key, now) {
            Some(entry) => {
                entry.expires_at = Some(now.saturating_add(ttl_secs.saturating_mul(1000)));
                true
            }
            None => false,
        })
    }

    async fn exists(&self, shard: usize, key: &str) -> std::result::Result<bool, StoreError> {
        let now = self.clock.now_ms();
        let mut guard = self.shard(shard)?;
        Ok(guard.live(key, now).is_some())
    }

    async fn load_script(
        &self,
        shard: usize,
        unit: Arc<dyn AtomicUnit>,
    ) -> std::result::Result<ScriptId, StoreError> {
        let id = ScriptId::of(unit.as_ref());
        let mut guard = self.shard(shard)?;
        debug!(shard, script = unit.name(), id = %id, "Loaded script");
        guard.scripts.insert(id.clone(), unit);
        Ok(id)
    }

    async fn eval_script(
        &self,
        shard: usize,
        id: &ScriptId,
        keys: &[String],
        args: &[String],
    ) -> std::result::Result<i64, StoreError> {
        let now = self.clock.now_ms();
        let mut guard = self.shard(shard)?;
        let unit = guard
            .scripts
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NoScript(id.clone()))?;

        let mut txn = MemoryTxn::new(&mut guard, now);
        let reply = unit.run(&mut txn, keys, args)?;
        let written = txn.commit();

        trace!(shard, script = unit.name(), reply, written, "Evaluated script");
        Ok(reply)
    }
}
