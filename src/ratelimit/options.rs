//! Per-call options and their merge with configured defaults.

use serde::{Deserialize, Serialize};

use crate::config::LimiterConfig;
use crate::error::{KeyrateError, Result};

/// Operations recorded by a check when the caller does not say.
pub const DEFAULT_OP_COUNT: u64 = 1;

/// Per-call overrides. Unset fields fall back to the limiter's configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckOptions {
    /// Decay rate in Hz
    #[serde(default)]
    pub rate: Option<f64>,
    /// Burst ceiling
    #[serde(default)]
    pub burst: Option<u64>,
    /// Operations this call accounts for
    #[serde(default)]
    pub op_count: Option<u64>,
}

impl CheckOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rate(mut self, rate: f64) -> Self {
        self.rate = Some(rate);
        self
    }

    pub fn burst(mut self, burst: u64) -> Self {
        self.burst = Some(burst);
        self
    }

    pub fn op_count(mut self, op_count: u64) -> Self {
        self.op_count = Some(op_count);
        self
    }
}

/// Fully resolved limit for one check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EffectiveLimit {
    pub rate: f64,
    pub burst: u64,
    pub op_count: u64,
}

impl EffectiveLimit {
    /// Merge `options` over `defaults` field by field and validate the result.
    pub fn resolve(defaults: &LimiterConfig, options: &CheckOptions) -> Result<Self> {
        let rate = options.rate.or(defaults.rate).ok_or_else(|| {
            KeyrateError::Config("no rate given and no default configured".to_string())
        })?;
        let burst = options.burst.or(defaults.burst).ok_or_else(|| {
            KeyrateError::Config("no burst given and no default configured".to_string())
        })?;
        let op_count = options.op_count.unwrap_or(DEFAULT_OP_COUNT);

        validate_rate(rate)?;
        validate_burst(burst)?;
        if op_count == 0 {
            return Err(KeyrateError::Config(
                "op_count must be positive".to_string(),
            ));
        }

        Ok(Self {
            rate,
            burst,
            op_count,
        })
    }
}

pub(crate) fn validate_rate(rate: f64) -> Result<()> {
    if rate.is_finite() && rate > 0.0 {
        Ok(())
    } else {
        Err(KeyrateError::Config(format!(
            "rate must be a positive number of Hz, got {}",
            rate
        )))
    }
}

pub(crate) fn validate_burst(burst: u64) -> Result<()> {
    if burst == 0 {
        return Err(KeyrateError::Config("burst must be positive".to_string()));
    }
    Ok(())
}
