//! Leaky-bucket decay arithmetic.
//!
//! A bucket drains one unit every `1 / rate` seconds. Checking it first applies
//! the drain for the time elapsed since the last recorded write, then adds the
//! operations being requested.

use serde::{Deserialize, Serialize};

/// Hash field holding the bucket count.
pub const COUNT_FIELD: &str = "count";
/// Hash field holding the timestamp of the last write, in epoch milliseconds.
pub const TIMESTAMP_FIELD: &str = "timestamp";

/// Persisted state of one bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketState {
    /// Operations still outstanding
    pub count: u64,
    /// When `count` was last valid, in epoch milliseconds
    pub timestamp: u64,
}

impl BucketState {
    /// Parse the stored fields. A record missing either field is treated as
    /// absent; fields that are present but not integers are an error.
    pub fn from_fields(
        count: Option<&str>,
        timestamp: Option<&str>,
    ) -> Result<Option<Self>, String> {
        let (Some(count), Some(timestamp)) = (count, timestamp) else {
            return Ok(None);
        };

        let count = count
            .parse::<u64>()
            .map_err(|_| format!("invalid stored count {:?}", count))?;
        let timestamp = timestamp
            .parse::<u64>()
            .map_err(|_| format!("invalid stored timestamp {:?}", timestamp))?;

        Ok(Some(Self { count, timestamp }))
    }

    pub fn to_fields(&self) -> [(&'static str, String); 2] {
        [
            (COUNT_FIELD, self.count.to_string()),
            (TIMESTAMP_FIELD, self.timestamp.to_string()),
        ]
    }
}

/// Number of whole drain periods in `elapsed_ms` at `rate` Hz.
fn periods_elapsed(rate: f64, elapsed_ms: u64) -> u64 {
    // `as` saturates, so huge gaps clamp to u64::MAX
    (elapsed_ms as f64 * rate / 1000.0).floor() as u64
}

/// Drain `prior_count` for `elapsed_ms` at `rate` Hz, then add `op_count`.
pub fn compute_new_count(prior_count: u64, rate: f64, elapsed_ms: u64, op_count: u64) -> u64 {
    prior_count
        .saturating_sub(periods_elapsed(rate, elapsed_ms))
        .saturating_add(op_count)
}

/// The state a bucket moves to when `op_count` operations are recorded at `now_ms`.
///
/// A clock reading earlier than the stored timestamp counts as no elapsed time
/// and keeps the stored timestamp, so timestamps never move backwards.
pub fn next_state(prior: Option<BucketState>, rate: f64, now_ms: u64, op_count: u64) -> BucketState {
    match prior {
        None => BucketState {
            count: op_count,
            timestamp: now_ms,
        },
        Some(prior) => BucketState {
            count: compute_new_count(
                prior.count,
                rate,
                now_ms.saturating_sub(prior.timestamp),
                op_count,
            ),
            timestamp: now_ms.max(prior.timestamp),
        },
    }
}

/// Whole seconds until a bucket holding `count` drains completely at `rate` Hz.
pub fn ttl_secs(count: u64, rate: f64) -> u64 {
    ((count as f64 / rate).ceil() as u64).max(1)
}
