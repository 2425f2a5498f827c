//! Keyrate - distributed keyed rate limiting
//!
//! This crate decides whether to admit one more operation for an identifier
//! under a leaky-bucket policy: the bucket drains at a configurable rate and
//! rejects operations that would push it past a burst ceiling. Bucket state
//! lives in a shared, sharded key-value store, and every check runs there as a
//! single atomic unit, so independent callers enforce one consistent limit
//! per key.

pub mod clock;
pub mod config;
pub mod error;
pub mod ratelimit;
pub mod store;
