//! Leaky-bucket rate limiting over a shared store.

pub mod decay;
mod key;
mod limiter;
pub mod options;
mod script;

pub use decay::{compute_new_count, BucketState};
pub use key::BucketKey;
pub use limiter::RateLimiter;
pub use options::{CheckOptions, EffectiveLimit};
pub use script::{run_rate_check, RateCheck, RateCheckScript, RATE_CHECK_LUA};
