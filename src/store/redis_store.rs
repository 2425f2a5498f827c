//! Redis-backed sharded store.
//!
//! Each shard is an independent Redis server. Atomic units are registered with
//! `SCRIPT LOAD` and evaluated with `EVALSHA`, so every process pointed at the
//! same servers shares one set of buckets and Redis serializes the checks.

use std::sync::Arc;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Cmd, ErrorKind, FromRedisValue, RedisError};
use tracing::{debug, info, trace};

use super::{AtomicUnit, ScriptId, Store, StoreError};
use crate::error::{KeyrateError, Result};

/// A store spread across one Redis server per shard.
#[derive(Clone)]
pub struct RedisStore {
    shards: Vec<ConnectionManager>,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("shards", &self.shards.len())
            .finish()
    }
}

impl RedisStore {
    /// Connect to one Redis server per URL; shard `i` is `urls[i]`.
    pub async fn connect(urls: &[String]) -> Result<Self> {
        if urls.is_empty() {
            return Err(KeyrateError::Config(
                "redis store needs at least one url".to_string(),
            ));
        }

        let mut shards = Vec::with_capacity(urls.len());
        for url in urls {
            let client = redis::Client::open(url.as_str())
                .map_err(|e| KeyrateError::Config(format!("invalid redis url {}: {}", url, e)))?;
            let conn = ConnectionManager::new(client)
                .await
                .map_err(|e| StoreError::Unavailable(format!("{}: {}", url, e)))?;
            shards.push(conn);
        }

        info!(shards = shards.len(), "Connected to redis");
        Ok(Self { shards })
    }

    fn conn(&self, shard: usize) -> std::result::Result<ConnectionManager, StoreError> {
        self.shards
            .get(shard)
            .cloned()
            .ok_or(StoreError::NoSuchShard {
                shard,
                count: self.shards.len(),
            })
    }

    async fn query<T: FromRedisValue>(
        &self,
        shard: usize,
        cmd: &Cmd,
    ) -> std::result::Result<T, StoreError> {
        let mut conn = self.conn(shard)?;
        let value: T = cmd.query_async(&mut conn).await.map_err(map_redis_error)?;
        Ok(value)
    }
}

/// Replies the server produced are unit or command failures; anything else
/// means the shard could not be reached.
fn map_redis_error(e: RedisError) -> StoreError {
    match e.kind() {
        ErrorKind::ResponseError | ErrorKind::ExtensionError | ErrorKind::TypeError => {
            StoreError::Script(e.to_string())
        }
        _ => StoreError::Unavailable(e.to_string()),
    }
}

#[async_trait]
impl Store for RedisStore {
    fn shard_count(&self) -> usize {
        self.shards.len()
    }

    async fn hmget(
        &self,
        shard: usize,
        key: &str,
        fields: &[&str],
    ) -> std::result::Result<Vec<Option<String>>, StoreError> {
        let mut cmd = redis::cmd("HMGET");
        cmd.arg(key);
        for field in fields {
            cmd.arg(*field);
        }
        self.query(shard, &cmd).await
    }

    async fn hmset(
        &self,
        shard: usize,
        key: &str,
        fields: &[(&str, String)],
    ) -> std::result::Result<(), StoreError> {
        let mut cmd = redis::cmd("HSET");
        cmd.arg(key);
        for (field, value) in fields {
            cmd.arg(*field).arg(value.as_str());
        }
        let _: i64 = self.query(shard, &cmd).await?;
        Ok(())
    }

    async fn expire(
        &self,
        shard: usize,
        key: &str,
        ttl_secs: u64,
    ) -> std::result::Result<bool, StoreError> {
        let mut cmd = redis::cmd("EXPIRE");
        cmd.arg(key).arg(ttl_secs);
        let updated: i64 = self.query(shard, &cmd).await?;
        Ok(updated == 1)
    }

    async fn exists(&self, shard: usize, key: &str) -> std::result::Result<bool, StoreError> {
        let mut cmd = redis::cmd("EXISTS");
        cmd.arg(key);
        let found: i64 = self.query(shard, &cmd).await?;
        Ok(found > 0)
    }

    async fn load_script(
        &self,
        shard: usize,
        unit: Arc<dyn AtomicUnit>,
    ) -> std::result::Result<ScriptId, StoreError> {
        let mut cmd = redis::cmd("SCRIPT");
        cmd.arg("LOAD").arg(unit.source());
        let digest: String = self.query(shard, &cmd).await?;

        let id = ScriptId::from_digest(digest);
        debug!(shard, script = unit.name(), id = %id, "Loaded script");
        Ok(id)
    }

    async fn eval_script(
        &self,
        shard: usize,
        id: &ScriptId,
        keys: &[String],
        args: &[String],
    ) -> std::result::Result<i64, StoreError> {
        let mut cmd = redis::cmd("EVALSHA");
        cmd.arg(id.as_str()).arg(keys.len());
        for value in keys.iter().chain(args) {
            cmd.arg(value.as_str());
        }

        let mut conn = self.conn(shard)?;
        let result: redis::RedisResult<i64> = cmd.query_async(&mut conn).await;
        let reply = match result {
            Ok(reply) => reply,
            Err(e) if e.kind() == ErrorKind::NoScriptError => {
                return Err(StoreError::NoScript(id.clone()))
            }
            Err(e) => return Err(map_redis_error(e)),
        };

        trace!(shard, id = %id, reply, "Evaluated script");
        Ok(reply)
    }
}
