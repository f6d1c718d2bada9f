use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

pub const DEFAULT_MAX_TOTAL: usize = 20;
pub const DEFAULT_MAX_PER_HOST: usize = 2;
pub const DEFAULT_CACHE_ENTRIES: usize = 1000;
pub const DEFAULT_CACHE_OBJECT_SIZE: u64 = 8192;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_REDIRECTS: usize = 10;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub pool: PoolConfig,
    pub cache: CacheConfig,
    pub request: RequestConfig,
}

impl EngineConfig {
    pub fn validate(&self) -> CoreResult<()> {
        self.pool.validate()?;
        self.request.validate()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub max_total: usize,
    pub default_max_per_host: usize,
    pub per_host: HashMap<String, usize>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_total: DEFAULT_MAX_TOTAL,
            default_max_per_host: DEFAULT_MAX_PER_HOST,
            per_host: HashMap::new(),
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> CoreResult<()> {
        check_bound("max_total", self.max_total)?;
        check_bound("default_max_per_host", self.default_max_per_host)?;
        for (host, limit) in &self.per_host {
            if host.trim().is_empty() {
                return Err(CoreError::InvalidArgument(
                    "per-host limit with empty host".to_string(),
                ));
            }
            check_bound(host, *limit)?;
        }
        Ok(())
    }
}

pub(crate) fn check_bound(name: &str, value: usize) -> CoreResult<()> {
    if value < 1 {
        return Err(CoreError::InvalidArgument(format!(
            "{} must be at least 1, got {}",
            name, value
        )));
    }
    Ok(())
}

/// Response cache sizing. `max_entries == 0` turns the cache off.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub max_entries: usize,
    pub max_object_size: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_CACHE_ENTRIES,
            max_object_size: DEFAULT_CACHE_OBJECT_SIZE,
        }
    }
}

impl CacheConfig {
    pub fn disabled() -> Self {
        Self {
            max_entries: 0,
            max_object_size: 0,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.max_entries > 0 && self.max_object_size > 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CookiePolicy {
    /// Keep cookies set by servers and send them back on later requests.
    #[default]
    Standard,
    Ignore,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestConfig {
    #[serde(with = "millis")]
    pub connect_timeout: Duration,
    /// Idle limit for a single read of the response body.
    #[serde(with = "millis")]
    pub read_timeout: Duration,
    pub cookie_policy: CookiePolicy,
    pub user_agent: String,
    pub max_redirects: usize,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_TIMEOUT,
            read_timeout: DEFAULT_TIMEOUT,
            cookie_policy: CookiePolicy::Standard,
            user_agent: format!("fetchpool/{}", env!("CARGO_PKG_VERSION")),
            max_redirects: DEFAULT_MAX_REDIRECTS,
        }
    }
}

impl RequestConfig {
    pub fn validate(&self) -> CoreResult<()> {
        if self.connect_timeout.is_zero() {
            return Err(CoreError::InvalidArgument(
                "connect_timeout must be positive".to_string(),
            ));
        }
        if self.read_timeout.is_zero() {
            return Err(CoreError::InvalidArgument(
                "read_timeout must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = EngineConfig::default();
        assert_eq!(config.pool.max_total, 20);
        assert_eq!(config.pool.default_max_per_host, 2);
        assert_eq!(config.cache.max_entries, 1000);
        assert_eq!(config.cache.max_object_size, 8192);
        assert_eq!(config.request.connect_timeout, Duration::from_secs(30));
        assert_eq!(config.request.read_timeout, Duration::from_secs(30));
        assert_eq!(config.request.cookie_policy, CookiePolicy::Standard);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_bounds_are_rejected() {
        let mut pool = PoolConfig::default();
        pool.max_total = 0;
        assert!(matches!(pool.validate(), Err(CoreError::InvalidArgument(_))));

        let mut pool = PoolConfig::default();
        pool.per_host.insert("example.com".to_string(), 0);
        assert!(matches!(pool.validate(), Err(CoreError::InvalidArgument(_))));
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let mut request = RequestConfig::default();
        request.read_timeout = Duration::ZERO;
        assert!(request.validate().is_err());
    }
}
