use crate::error::{PoolError, PoolResult};

/// Percentage of total device memory kept free when no value is configured.
pub const DEFAULT_RESERVE_PERCENT: u32 = 5;

/// Bytes added to every request to model the runtime's per-allocation bookkeeping.
pub const DEFAULT_BLOCK_OVERHEAD: u64 = 32;

pub const RESERVE_ENV: &str = "HSA_POOL_RESERVE";
pub const BLOCK_OVERHEAD_ENV: &str = "HSA_POOL_BLOCK_OVERHEAD";
pub const ABORT_ON_EXHAUSTION_ENV: &str = "HSA_POOL_ABORT_ON_EXHAUSTION";

/// What `alloc` does when the device cannot satisfy a request even after a flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExhaustionPolicy {
    /// Return `PoolError::ResourceExhausted` to the caller.
    #[default]
    ReturnError,
    /// Log and abort the process.
    Abort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    pub reserve_percent: u32,
    pub block_overhead: u64,
    pub exhaustion: ExhaustionPolicy,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            reserve_percent: DEFAULT_RESERVE_PERCENT,
            block_overhead: DEFAULT_BLOCK_OVERHEAD,
            exhaustion: ExhaustionPolicy::ReturnError,
        }
    }
}

impl PoolConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn with_reserve_percent(mut self, percent: u32) -> Self {
        self.reserve_percent = percent;
        self
    }

    #[must_use]
    pub const fn with_block_overhead(mut self, bytes: u64) -> Self {
        self.block_overhead = bytes;
        self
    }

    #[must_use]
    pub const fn with_exhaustion_policy(mut self, policy: ExhaustionPolicy) -> Self {
        self.exhaustion = policy;
        self
    }

    /// Load from the process environment, falling back to defaults for unset variables.
    ///
    /// # Errors
    /// Returns `ConfigurationInvalid` for unparsable values or a reserve outside `0..=100`.
    pub fn from_env() -> PoolResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`PoolConfig::from_env`], reading variables through `lookup`.
    ///
    /// # Errors
    /// See [`PoolConfig::from_env`].
    pub fn from_lookup<F>(lookup: F) -> PoolResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(raw) = lookup(RESERVE_ENV) {
            // Parsed wide so that negative values are reported as out of range
            let pct = parse_number::<i64>(RESERVE_ENV, &raw)?;
            config.reserve_percent = u32::try_from(pct).map_err(|_| out_of_range(pct))?;
        }
        if let Some(raw) = lookup(BLOCK_OVERHEAD_ENV) {
            config.block_overhead = parse_number::<u64>(BLOCK_OVERHEAD_ENV, &raw)?;
        }
        if let Some(raw) = lookup(ABORT_ON_EXHAUSTION_ENV) {
            config.exhaustion = match raw.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => ExhaustionPolicy::Abort,
                "0" | "false" | "no" | "" => ExhaustionPolicy::ReturnError,
                other => {
                    return Err(PoolError::ConfigurationInvalid(format!(
                        "{ABORT_ON_EXHAUSTION_ENV}={other} is not a boolean"
                    )));
                }
            };
        }

        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// Returns `ConfigurationInvalid` if the reserve percentage exceeds 100.
    pub fn validate(&self) -> PoolResult<()> {
        if self.reserve_percent > 100 {
            return Err(out_of_range(i64::from(self.reserve_percent)));
        }
        Ok(())
    }

    /// Pool bucket of a `raw_size` request, `None` if it does not fit in a u64.
    #[must_use]
    pub const fn bucket_key(&self, raw_size: u64) -> Option<u64> {
        raw_size.checked_add(self.block_overhead)
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, raw: &str) -> PoolResult<T> {
    raw.trim()
        .parse()
        .map_err(|_| PoolError::ConfigurationInvalid(format!("{key}={raw} is not a number")))
}

fn out_of_range(pct: i64) -> PoolError {
    PoolError::ConfigurationInvalid(format!("reserve percentage {pct} is outside 0..=100"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key: &str| vars.get(key).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let config = PoolConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, PoolConfig::default());
        assert_eq!(config.reserve_percent, 5);
        assert_eq!(config.bucket_key(64), Some(96));
    }

    #[test]
    fn reads_all_variables() {
        let config = PoolConfig::from_lookup(lookup(&[
            (RESERVE_ENV, " 10 "),
            (BLOCK_OVERHEAD_ENV, "0"),
            (ABORT_ON_EXHAUSTION_ENV, "true"),
        ]))
        .unwrap();
        assert_eq!(config.reserve_percent, 10);
        assert_eq!(config.block_overhead, 0);
        assert_eq!(config.exhaustion, ExhaustionPolicy::Abort);
    }

    #[test]
    fn rejects_out_of_range_reserve() {
        for bad in ["101", "-1", "abc"] {
            let err = PoolConfig::from_lookup(lookup(&[(RESERVE_ENV, bad)])).unwrap_err();
            assert!(matches!(err, PoolError::ConfigurationInvalid(_)), "{bad}");
        }
        assert!(PoolConfig::new().with_reserve_percent(100).validate().is_ok());
        assert!(PoolConfig::new().with_reserve_percent(250).validate().is_err());
    }

    #[test]
    fn rejects_bad_boolean() {
        let err =
            PoolConfig::from_lookup(lookup(&[(ABORT_ON_EXHAUSTION_ENV, "maybe")])).unwrap_err();
        assert!(matches!(err, PoolError::ConfigurationInvalid(_)));
    }

    #[test]
    fn bucket_key_overflow() {
        assert_eq!(PoolConfig::new().bucket_key(u64::MAX), None);
        assert_eq!(
            PoolConfig::new().with_block_overhead(0).bucket_key(u64::MAX),
            Some(u64::MAX)
        );
    }
}
