//! The rate-check atomic unit.
//!
//! The whole read, decay, compare, write and expire sequence for one bucket is
//! registered with the store and runs there as a single step, so concurrent
//! checks on the same key are serialized by the store rather than by callers.
//!
//! Keys: `[bucket]`. Arguments: `[now_ms, rate, burst, op_count]`.
//! Replies `1` when admitted (state written, expiry refreshed) and `0` when
//! rejected (nothing written).
//!
//! [`RATE_CHECK_LUA`] is what a Redis shard evaluates; [`RateCheckScript::run`]
//! is the same algorithm for stores that execute units in process.

use tracing::debug;

use super::decay::{self, BucketState, COUNT_FIELD, TIMESTAMP_FIELD};
use super::options::EffectiveLimit;
use crate::store::{AtomicUnit, ScriptId, ShardTxn, Store, StoreError};

const ADMITTED: i64 = 1;
const REJECTED: i64 = 0;

/// Server-side body of the rate-check unit.
pub const RATE_CHECK_LUA: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local rate = tonumber(ARGV[2])
local burst = tonumber(ARGV[3])
local op_count = tonumber(ARGV[4])
if #KEYS ~= 1 or not (now and rate and burst and op_count) or rate <= 0 then
  return redis.error_reply('invalid rate_check arguments')
end

local count = op_count
local timestamp = now
local state = redis.call('HMGET', key, 'count', 'timestamp')
if state[1] and state[2] then
  local prior_count = tonumber(state[1])
  local prior_ts = tonumber(state[2])
  if not (prior_count and prior_ts) or prior_count < 0 or prior_ts < 0
      or prior_count % 1 ~= 0 or prior_ts % 1 ~= 0 then
    return redis.error_reply('invalid stored bucket state')
  end
  local elapsed = math.max(now - prior_ts, 0)
  local periods = math.floor(elapsed * rate / 1000)
  count = math.max(prior_count - periods, 0) + op_count
  timestamp = math.max(now, prior_ts)
end

if count > burst then
  return 0
end

redis.call('HSET', key, 'count', string.format('%d', count), 'timestamp', string.format('%d', timestamp))
redis.call('EXPIRE', key, string.format('%d', math.max(math.ceil(count / rate), 1)))
return 1
"#;

/// Arguments of one rate check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateCheck {
    pub now_ms: u64,
    pub rate: f64,
    pub burst: u64,
    pub op_count: u64,
}

impl RateCheck {
    pub fn new(limit: &EffectiveLimit, now_ms: u64) -> Self {
        Self {
            now_ms,
            rate: limit.rate,
            burst: limit.burst,
            op_count: limit.op_count,
        }
    }

    pub fn to_args(&self) -> Vec<String> {
        vec![
            self.now_ms.to_string(),
            self.rate.to_string(),
            self.burst.to_string(),
            self.op_count.to_string(),
        ]
    }

    pub fn from_args(args: &[String]) -> Result<Self, StoreError> {
        let [now_ms, rate, burst, op_count] = args else {
            return Err(StoreError::Script(format!(
                "rate_check takes 4 arguments, got {}",
                args.len()
            )));
        };

        let check = Self {
            now_ms: parse_arg("now_ms", now_ms)?,
            rate: parse_arg("rate", rate)?,
            burst: parse_arg("burst", burst)?,
            op_count: parse_arg("op_count", op_count)?,
        };
        if !(check.rate.is_finite() && check.rate > 0.0) {
            return Err(StoreError::Script(format!("invalid rate {}", check.rate)));
        }
        Ok(check)
    }
}

fn parse_arg<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, StoreError> {
    value
        .parse()
        .map_err(|_| StoreError::Script(format!("invalid {} argument {:?}", name, value)))
}

/// The rate-check unit as registered with a store.
#[derive(Debug, Default, Clone, Copy)]
pub struct RateCheckScript;

impl AtomicUnit for RateCheckScript {
    fn name(&self) -> &'static str {
        "rate_check"
    }

    fn source(&self) -> &str {
        RATE_CHECK_LUA
    }

    fn run(
        &self,
        txn: &mut dyn ShardTxn,
        keys: &[String],
        args: &[String],
    ) -> Result<i64, StoreError> {
        let [key] = keys else {
            return Err(StoreError::Script(format!(
                "rate_check takes 1 key, got {}",
                keys.len()
            )));
        };
        let check = RateCheck::from_args(args)?;

        let fields = txn.hmget(key, &[COUNT_FIELD, TIMESTAMP_FIELD]);
        let [count, timestamp] = fields.as_slice() else {
            return Err(StoreError::Script(format!(
                "expected 2 fields from {}, got {}",
                key,
                fields.len()
            )));
        };
        let prior = BucketState::from_fields(count.as_deref(), timestamp.as_deref())
            .map_err(StoreError::Script)?;

        let next = decay::next_state(prior, check.rate, check.now_ms, check.op_count);
        if next.count > check.burst {
            return Ok(REJECTED);
        }

        txn.hmset(key, &next.to_fields());
        txn.expire(key, decay::ttl_secs(next.count, check.rate));
        Ok(ADMITTED)
    }
}

/// Evaluate the registered rate-check unit for `key` on `shard`.
///
/// Returns whether the operations were admitted.
pub async fn run_rate_check<S: Store + ?Sized>(
    store: &S,
    shard: usize,
    script: &ScriptId,
    key: &str,
    check: &RateCheck,
) -> Result<bool, StoreError> {
    let reply = store
        .eval_script(shard, script, &[key.to_string()], &check.to_args())
        .await?;

    match reply {
        ADMITTED => Ok(true),
        REJECTED => Ok(false),
        other => {
            debug!(key = %key, reply = other, "Unexpected rate_check reply");
            Err(StoreError::Script(format!(
                "unexpected rate_check reply {}",
                other
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    /// A bare hash map standing in for a shard.
    #[derive(Default)]
    struct MapTxn {
        hashes: HashMap<String, HashMap<String, String>>,
        ttls: HashMap<String, u64>,
        /// Answer every read with no fields at all
        short_reads: bool,
    }

    impl ShardTxn for MapTxn {
        fn hmget(&mut self, key: &str, fields: &[&str]) -> Vec<Option<String>> {
            if self.short_reads {
                return Vec::new();
            }
            fields
                .iter()
                .map(|f| self.hashes.get(key).and_then(|h| h.get(*f)).cloned())
                .collect()
        }

        fn hmset(&mut self, key: &str, fields: &[(&str, String)]) {
            let hash = self.hashes.entry(key.to_string()).or_default();
            for (f, v) in fields {
                hash.insert(f.to_string(), v.clone());
            }
        }

        fn expire(&mut self, key: &str, ttl_secs: u64) -> bool {
            if !self.hashes.contains_key(key) {
                return false;
            }
            self.ttls.insert(key.to_string(), ttl_secs);
            true
        }
    }

    fn run(txn: &mut MapTxn, check: RateCheck) -> Result<i64, StoreError> {
        RateCheckScript.run(txn, &["b".to_string()], &check.to_args())
    }

    fn check(now_ms: u64, rate: f64, burst: u64, op_count: u64) -> RateCheck {
        RateCheck {
            now_ms,
            rate,
            burst,
            op_count,
        }
    }

    fn stored(txn: &MapTxn) -> (String, String) {
        let hash = &txn.hashes["b"];
        (hash["count"].clone(), hash["timestamp"].clone())
    }

    #[test]
    fn test_args_round_trip_fractional_rate() {
        let original = check(1_700_000_000_123, 0.1, 2, 1);
        assert_eq!(RateCheck::from_args(&original.to_args()).unwrap(), original);
    }

    #[test]
    fn test_bad_args() {
        let args = vec!["1".to_string(), "x".to_string(), "2".to_string(), "1".to_string()];
        assert!(matches!(
            RateCheck::from_args(&args),
            Err(StoreError::Script(_))
        ));
        assert!(RateCheck::from_args(&args[..3]).is_err());

        let zero_rate = vec!["1".to_string(), "0".to_string(), "2".to_string(), "1".to_string()];
        assert!(RateCheck::from_args(&zero_rate).is_err());
    }

    #[test]
    fn test_first_check_creates_state_with_ttl() {
        let mut txn = MapTxn::default();
        assert_eq!(run(&mut txn, check(5_000, 2.0, 10, 1)).unwrap(), ADMITTED);
        assert_eq!(stored(&txn), ("1".to_string(), "5000".to_string()));
        assert_eq!(txn.ttls["b"], 1);
    }

    #[test]
    fn test_admits_up_to_burst_inclusive() {
        let mut txn = MapTxn::default();
        txn.hmset(
            "b",
            &[("count", "30".to_string()), ("timestamp", "0".to_string())],
        );

        // 30 - 20 + 1 = 11
        assert_eq!(run(&mut txn, check(10_000, 2.0, 11, 1)).unwrap(), ADMITTED);
        assert_eq!(stored(&txn), ("11".to_string(), "10000".to_string()));
        assert_eq!(txn.ttls["b"], 6);
    }

    #[test]
    fn test_rejection_leaves_state_untouched() {
        let mut txn = MapTxn::default();
        txn.hmset(
            "b",
            &[("count", "2".to_string()), ("timestamp", "1000".to_string())],
        );

        assert_eq!(run(&mut txn, check(1_000, 0.1, 3, 2)).unwrap(), REJECTED);
        assert_eq!(stored(&txn), ("2".to_string(), "1000".to_string()));
        assert!(txn.ttls.is_empty());
    }

    #[test]
    fn test_partial_record_is_treated_as_absent() {
        let mut txn = MapTxn::default();
        txn.hmset("b", &[("count", "50".to_string())]);

        assert_eq!(run(&mut txn, check(1_000, 1.0, 3, 1)).unwrap(), ADMITTED);
        assert_eq!(stored(&txn), ("1".to_string(), "1000".to_string()));
    }

    #[test]
    fn test_malformed_record_is_an_error() {
        let mut txn = MapTxn::default();
        txn.hmset(
            "b",
            &[("count", "lots".to_string()), ("timestamp", "0".to_string())],
        );

        assert!(matches!(
            run(&mut txn, check(1_000, 1.0, 3, 1)),
            Err(StoreError::Script(_))
        ));
    }

    #[test]
    fn test_short_read_is_an_error() {
        let mut txn = MapTxn {
            short_reads: true,
            ..Default::default()
        };

        assert!(matches!(
            run(&mut txn, check(1_000, 1.0, 3, 1)),
            Err(StoreError::Script(_))
        ));
        assert!(txn.hashes.is_empty());
    }

    #[test]
    fn test_lua_source_follows_the_same_steps() {
        let source = RateCheckScript.source();
        let hmget = source.find("'HMGET', key, 'count', 'timestamp'").unwrap();
        let reject = source.find("if count > burst then").unwrap();
        let hset = source.find("'HSET', key, 'count'").unwrap();
        let expire = source.find("'EXPIRE', key").unwrap();
        assert!(hmget < reject && reject < hset && hset < expire);
        assert!(source.contains("math.floor(elapsed * rate / 1000)"));
        assert!(source.contains("math.max(math.ceil(count / rate), 1)"));
    }

    #[test]
    fn test_requires_exactly_one_key() {
        let mut txn = MapTxn::default();
        let args = check(0, 1.0, 1, 1).to_args();
        assert!(RateCheckScript.run(&mut txn, &[], &args).is_err());
        assert!(RateCheckScript
            .run(&mut txn, &["a".to_string(), "b".to_string()], &args)
            .is_err());
    }

    #[test]
    fn test_script_id_is_stable() {
        assert_eq!(ScriptId::of(&RateCheckScript), ScriptId::of(&RateCheckScript));
        assert_eq!(ScriptId::of(&RateCheckScript).as_str().len(), 64);
    }
}
