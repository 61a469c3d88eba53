use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;

/// Controls the log format
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level for the crate.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
    /// When set to true, backtraces are forced on.
    pub enable_backtraces: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
            enable_backtraces: true,
        }
    }
}

/// Control the metrics.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// host/port of statsd instance
    pub statsd: Option<String>,
    /// The prefix that should be added to all metrics.
    pub prefix: String,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: match env::var("STATSD_SERVER") {
                Ok(metrics_statsd) => Some(metrics_statsd),
                Err(_) => None,
            },
            prefix: "recache".into(),
            custom_tags: BTreeMap::new(),
        }
    }
}

/// The eviction policy used when a cache grows beyond its configured capacity.
///
/// Both variants trim the store down to half of `max_size` in one batch, rather
/// than evicting a single entry per insert once at capacity.
#[derive(Debug, Clone, Copy, Deserialize, Eq, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum EvictionPolicy {
    /// Evict entries with the lowest use count first.
    Lru {
        max_size: usize,
        #[serde(with = "humantime_serde")]
        check_interval: Duration,
    },
    /// Evict the entries created earliest first, regardless of use.
    Oldest {
        max_size: usize,
        #[serde(with = "humantime_serde")]
        check_interval: Duration,
    },
}

impl EvictionPolicy {
    pub fn max_size(&self) -> usize {
        match self {
            EvictionPolicy::Lru { max_size, .. } => *max_size,
            EvictionPolicy::Oldest { max_size, .. } => *max_size,
        }
    }

    pub fn check_interval(&self) -> Duration {
        match self {
            EvictionPolicy::Lru { check_interval, .. } => *check_interval,
            EvictionPolicy::Oldest { check_interval, .. } => *check_interval,
        }
    }

    pub(crate) fn kind(&self) -> &'static str {
        match self {
            EvictionPolicy::Lru { .. } => "lru",
            EvictionPolicy::Oldest { .. } => "oldest",
        }
    }
}

impl Default for EvictionPolicy {
    fn default() -> Self {
        EvictionPolicy::Lru {
            max_size: 1_000,
            check_interval: Duration::from_secs(3600),
        }
    }
}

/// Expiry settings for one cache instance.
#[derive(Debug, Clone, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    /// A name used to tag metrics and log lines for this cache.
    pub name: String,

    /// Absolute lifespan of an entry (entry age since last store).
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,

    /// Soft expiry window after which an entry is still served but flagged
    /// stale. Independent of `ttl`; a value exceeding `ttl` simply means the
    /// entry expires before it ever reports stale.
    #[serde(with = "humantime_serde")]
    pub stale_time: Duration,

    /// Capacity trimming behavior.
    pub eviction: EvictionPolicy,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            name: "default".into(),
            ttl: Duration::from_secs(24 * 3600),
            stale_time: Duration::from_secs(3600),
            eviction: EvictionPolicy::default(),
        }
    }
}

/// An error constructing a cache from a [`CacheConfig`].
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("max_size must be greater than 0")]
    InvalidMaxSize,
}

impl CacheConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.eviction.max_size() == 0 {
            return Err(ConfigError::InvalidMaxSize);
        }
        Ok(())
    }
}

/// The global config of the library.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Logging configuration.
    pub logging: Logging,

    /// Metrics configuration.
    pub metrics: Metrics,

    /// Default expiry and eviction settings for caches that do not carry their
    /// own [`CacheConfig`].
    pub cache: CacheConfig,
}

impl Config {
    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => {
                let f = fs::File::open(path)
                    .context(format!("failed to open config file {}", path.display()))?;
                serde_yaml::from_reader(f).context("failed to parse YAML config file")
            }
            None => Ok(Config::default()),
        }
    }
}

fn deserialize_level_filter<'de, D>(deserializer: D) -> Result<LevelFilter, D::Error>
where
    D: Deserializer<'de>,
{
    let s: String = Deserialize::deserialize(deserializer)?;
    s.parse().map_err(de::Error::custom)
}
