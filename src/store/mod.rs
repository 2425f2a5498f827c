//! Key-value store capability interface.
//!
//! The rate limiter never talks to a concrete store client. It needs a narrow
//! set of operations: keyed multi-field reads and writes, key expiry, and the
//! ability to register an atomic unit once and then evaluate it on a chosen
//! shard. Everything a unit does while it runs is serialized against every
//! other operation on that shard.
//!
//! [`RedisStore`] shares state between processes and hosts by running each
//! unit's Lua [`source`](AtomicUnit::source) on the Redis server.
//! [`MemoryStore`] keeps everything in this process and runs the equivalent
//! native [`run`](AtomicUnit::run).

mod memory;
mod redis_store;
mod router;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use thiserror::Error;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;
pub use router::{key_slot, ShardRouter, SLOT_COUNT};

/// Errors raised by a store or by a unit running inside it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),
    #[error("No such script: {0}")]
    NoScript(ScriptId),
    #[error("Shard {shard} out of range ({count} shards)")]
    NoSuchShard { shard: usize, count: usize },
    #[error("Script error: {0}")]
    Script(String),
}

/// Handle to a registered atomic unit, as assigned by the store that loaded it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScriptId(String);

impl ScriptId {
    /// The id [`MemoryStore`] assigns to `unit`: the hex SHA-256 of its source.
    pub fn of(unit: &dyn AtomicUnit) -> Self {
        let digest = Sha256::digest(unit.source().as_bytes());
        Self(hex::encode(digest))
    }

    /// Wrap a digest returned by a store.
    pub fn from_digest(digest: impl Into<String>) -> Self {
        Self(digest.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ScriptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Operations available to an atomic unit while it holds its shard.
pub trait ShardTxn {
    /// Read `fields` of the hash at `key`; missing keys yield all `None`.
    fn hmget(&mut self, key: &str, fields: &[&str]) -> Vec<Option<String>>;

    /// Write `fields` into the hash at `key`, creating it if needed.
    fn hmset(&mut self, key: &str, fields: &[(&str, String)]);

    /// Set `key` to expire `ttl_secs` from now. Returns false if it does not exist.
    fn expire(&mut self, key: &str, ttl_secs: u64) -> bool;
}

/// A read-compute-write sequence executed by the store as one indivisible step.
///
/// A unit comes in two equivalent forms: a Lua script a remote store loads and
/// evaluates server-side, and a native `run` for in-process stores. Writes made
/// through the [`ShardTxn`] only become visible if `run` returns `Ok`.
pub trait AtomicUnit: Send + Sync {
    fn name(&self) -> &'static str;

    /// Lua body evaluated by the store, with `KEYS` and `ARGV` as passed to
    /// [`Store::eval_script`].
    fn source(&self) -> &str;

    fn run(
        &self,
        txn: &mut dyn ShardTxn,
        keys: &[String],
        args: &[String],
    ) -> Result<i64, StoreError>;
}

/// A sharded key-value store.
#[async_trait]
pub trait Store: Send + Sync {
    /// Number of shards; valid shard ids are `0..shard_count()`.
    fn shard_count(&self) -> usize;

    async fn hmget(
        &self,
        shard: usize,
        key: &str,
        fields: &[&str],
    ) -> Result<Vec<Option<String>>, StoreError>;

    async fn hmset(
        &self,
        shard: usize,
        key: &str,
        fields: &[(&str, String)],
    ) -> Result<(), StoreError>;

    async fn expire(&self, shard: usize, key: &str, ttl_secs: u64) -> Result<bool, StoreError>;

    async fn exists(&self, shard: usize, key: &str) -> Result<bool, StoreError>;

    /// Register `unit` on `shard`, returning the id to evaluate it by.
    async fn load_script(
        &self,
        shard: usize,
        unit: Arc<dyn AtomicUnit>,
    ) -> Result<ScriptId, StoreError>;

    /// Run a registered unit atomically on `shard`.
    async fn eval_script(
        &self,
        shard: usize,
        id: &ScriptId,
        keys: &[String],
        args: &[String],
    ) -> Result<i64, StoreError>;
}
