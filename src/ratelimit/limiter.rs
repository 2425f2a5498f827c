//! Keyed rate limiter façade.

use std::sync::Arc;

use tokio::sync::OnceCell;
use tracing::{debug, error, info, instrument, trace};

use super::decay::{BucketState, COUNT_FIELD, TIMESTAMP_FIELD};
use super::key::BucketKey;
use super::options::{CheckOptions, EffectiveLimit};
use super::script::{run_rate_check, RateCheck, RateCheckScript};
use crate::clock::{Clock, SystemClock};
use crate::config::LimiterConfig;
use crate::error::{KeyrateError, Result};
use crate::store::{AtomicUnit, ScriptId, ShardRouter, Store, StoreError};

/// A leaky-bucket rate limiter whose state lives in a shared, sharded store.
///
/// Any number of limiters, in any number of processes, pointed at the same
/// store and prefix enforce one limit per identifier. The limiter itself holds
/// no per-key state and takes no locks; each check is one atomic unit
/// evaluated on the shard owning the key.
pub struct RateLimiter {
    store: Arc<dyn Store>,
    router: ShardRouter,
    config: LimiterConfig,
    clock: Arc<dyn Clock>,
    /// Outcome of registering the rate-check unit, shared by every caller
    script: OnceCell<std::result::Result<ScriptId, StoreError>>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("router", &self.router)
            .field("config", &self.config)
            .field("script", &self.script.get())
            .finish()
    }
}

impl RateLimiter {
    /// Create a rate limiter over `store` with the given defaults.
    ///
    /// Nothing is sent to the store until the first check or [`ready`](Self::ready).
    pub fn new(store: Arc<dyn Store>, config: LimiterConfig) -> Result<Self> {
        config.validate()?;

        let shard_count = store.shard_count();
        if shard_count == 0 {
            return Err(KeyrateError::Config("store reports no shards".to_string()));
        }

        Ok(Self {
            store,
            router: ShardRouter::new(shard_count),
            config,
            clock: Arc::new(SystemClock),
            script: OnceCell::new(),
        })
    }

    /// Use `clock` for check timestamps instead of the system clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &LimiterConfig {
        &self.config
    }

    /// Register the rate-check unit on every shard, once.
    ///
    /// Concurrent callers share a single registration attempt and all see its
    /// outcome, including a failure.
    pub async fn ready(&self) -> Result<ScriptId> {
        let outcome = self
            .script
            .get_or_init(|| async {
                let unit: Arc<dyn AtomicUnit> = Arc::new(RateCheckScript);
                let loads = (0..self.router.shard_count())
                    .map(|shard| self.store.load_script(shard, unit.clone()));

                match futures::future::try_join_all(loads).await {
                    Ok(ids) => {
                        let id = ids
                            .into_iter()
                            .next()
                            .unwrap_or_else(|| ScriptId::of(unit.as_ref()));
                        info!(
                            script = %id,
                            shards = self.router.shard_count(),
                            "Rate check script registered"
                        );
                        Ok(id)
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to register rate check script");
                        Err(e)
                    }
                }
            })
            .await;

        outcome.clone().map_err(KeyrateError::from)
    }

    /// Record one or more operations for `identifier` if its bucket has room.
    ///
    /// Returns `Ok(())` when admitted and [`KeyrateError::LimitExceeded`] when
    /// the operations would push the bucket past its burst. Rejected checks
    /// leave the stored state untouched. Store failures are returned as-is.
    #[instrument(
        skip(self, options),
        fields(prefix = %self.config.prefix, op_count = ?options.op_count)
    )]
    pub async fn check(&self, identifier: &str, options: &CheckOptions) -> Result<()> {
        let limit = EffectiveLimit::resolve(&self.config, options)?;
        let script = self.ready().await?;

        let key = self.key_for(identifier);
        let shard = self.router.route(&key);
        let check = RateCheck::new(&limit, self.clock.now_ms());

        trace!(
            key = %key,
            shard = shard,
            rate = limit.rate,
            burst = limit.burst,
            op_count = limit.op_count,
            "Checking rate limit"
        );

        let admitted = run_rate_check(self.store.as_ref(), shard, &script, &key, &check)
            .await
            .map_err(|e| {
                error!(key = %key, shard = shard, error = %e, "Rate check failed");
                KeyrateError::Backend(e)
            })?;

        if admitted {
            Ok(())
        } else {
            debug!(
                key = %key,
                burst = limit.burst,
                op_count = limit.op_count,
                "Rate limit exceeded"
            );
            Err(KeyrateError::LimitExceeded { key })
        }
    }

    /// Read the stored state for `identifier` without recording anything.
    ///
    /// Returns `None` when the bucket has never been written or has expired.
    pub async fn state(&self, identifier: &str) -> Result<Option<BucketState>> {
        let key = self.key_for(identifier);
        let shard = self.router.route(&key);

        let fields = self
            .store
            .hmget(shard, &key, &[COUNT_FIELD, TIMESTAMP_FIELD])
            .await?;
        let [count, timestamp] = fields.as_slice() else {
            return Err(StoreError::Script(format!(
                "expected 2 fields from {}, got {}",
                key,
                fields.len()
            ))
            .into());
        };
        let state = BucketState::from_fields(count.as_deref(), timestamp.as_deref())
            .map_err(StoreError::Script)?;
        Ok(state)
    }

    /// The store key for `identifier`.
    pub fn key_for(&self, identifier: &str) -> String {
        BucketKey::new(&self.config.prefix, identifier).to_store_key()
    }

    /// The shard owning `identifier`'s bucket.
    pub fn shard_for(&self, identifier: &str) -> usize {
        self.router.route(&self.key_for(identifier))
    }
}
