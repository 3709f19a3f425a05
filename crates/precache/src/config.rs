//! Configuration of the cache, its logging and its metrics.
//!
//! Configuration is read from a YAML file, where every section and field is optional:
//!
//! ```yaml
//! logging:
//!   level: debug
//! cache:
//!   max_deferred: 8
//!   sweep_interval: 30s
//!   evicter:
//!     type: lru
//!     retain: 128
//! ```

use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::Path;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;

use crate::evicter::{DelayEvicter, Evicter, LruEvicter};
use crate::getter::Getter;

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
    /// The log level.
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
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "precache".into(),
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Which [`Evicter`] a configured cache installs.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum EvicterConfig {
    /// Unused values are removed as soon as their last entry is closed.
    #[default]
    None,
    /// Keep the `retain` most recently unused values, see [`LruEvicter`].
    Lru {
        /// The number of unused values to keep.
        retain: usize,
    },
    /// Keep unused values for `delay`, see [`DelayEvicter`].
    Delay {
        /// How long unused values are kept.
        #[serde(with = "humantime_serde")]
        delay: Duration,
    },
}

impl EvicterConfig {
    /// Creates the configured evicter, if any.
    pub fn build<G: Getter>(&self) -> Option<Box<dyn Evicter<G>>> {
        match *self {
            EvicterConfig::None => None,
            EvicterConfig::Lru { retain } => Some(Box::new(LruEvicter::new(retain))),
            EvicterConfig::Delay { delay } => Some(Box::new(DelayEvicter::new(delay))),
        }
    }
}

/// Fine-tuning of a [`Cache`](crate::Cache).
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CacheConfig {
    /// The number of deferred getters that may run concurrently.
    ///
    /// Zero or less turns the deferred queue into a sink that never runs anything.
    pub max_deferred: isize,

    /// How often unused values kept by the evicter are reconsidered.
    ///
    /// Without this, they are only reconsidered whenever a new value is added.
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Option<Duration>,

    /// The evicter deciding which unused values are kept.
    pub evicter: EvicterConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            max_deferred: thread::available_parallelism().map_or(1, |n| n.get() as isize),
            sweep_interval: None,
            evicter: EvicterConfig::None,
        }
    }
}

/// The complete configuration file.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Logging configuration.
    pub logging: Logging,
    /// Metrics configuration.
    pub metrics: Metrics,
    /// Cache configuration.
    pub cache: CacheConfig,
}

impl Config {
    /// Loads the configuration from `path`, or the default configuration if no path is given.
    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            ),
            None => Ok(Config::default()),
        }
    }

    fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        // check for empty files explicitly
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        serde_yaml::from_str(&config).context("failed to parse config YAML")
    }
}

#[derive(Debug)]
struct LevelFilterVisitor;

impl de::Visitor<'_> for LevelFilterVisitor {
    type Value = LevelFilter;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        write!(
            formatter,
            r#"one of the strings "off", "error", "warn", "info", "debug", or "trace""#
        )
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match v {
            "off" => Ok(LevelFilter::OFF),
            "error" => Ok(LevelFilter::ERROR),
            "warn" => Ok(LevelFilter::WARN),
            "info" => Ok(LevelFilter::INFO),
            "debug" => Ok(LevelFilter::DEBUG),
            "trace" => Ok(LevelFilter::TRACE),
            _ => Err(de::Error::unknown_variant(
                v,
                &["off", "error", "warn", "info", "debug", "trace"],
            )),
        }
    }
}

fn deserialize_level_filter<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LevelFilter, D::Error> {
    deserializer.deserialize_str(LevelFilterVisitor)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = Config::get(None).unwrap();
        assert_eq!(cfg.logging.level, LevelFilter::INFO);
        assert_eq!(cfg.metrics.prefix, "precache");
        assert!(cfg.cache.max_deferred >= 1);
        assert_eq!(cfg.cache.evicter, EvicterConfig::None);
        assert_eq!(cfg.cache.sweep_interval, None);
    }

    #[test]
    fn test_cache_config() {
        let yaml = r#"
            logging:
              level: debug
              format: json
            cache:
              max_deferred: 0
              sweep_interval: 1m 30s
              evicter:
                type: delay
                delay: 10s
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(cfg.logging.level, LevelFilter::DEBUG);
        assert_eq!(cfg.logging.format, LogFormat::Json);
        assert_eq!(cfg.cache.max_deferred, 0);
        assert_eq!(cfg.cache.sweep_interval, Some(Duration::from_secs(90)));
        assert_eq!(
            cfg.cache.evicter,
            EvicterConfig::Delay {
                delay: Duration::from_secs(10)
            }
        );
    }

    #[test]
    fn test_lru_config() {
        let yaml = r#"
            cache:
              evicter:
                type: lru
                retain: 16
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(cfg.cache.evicter, EvicterConfig::Lru { retain: 16 });
        // unrelated sections keep their defaults
        assert!(cfg.logging.enable_backtraces);
        assert!(cfg.cache.max_deferred >= 1);
    }

    #[test]
    fn test_invalid_config() {
        let err = Config::from_reader("".as_bytes()).unwrap_err();
        assert_eq!(err.to_string(), "config file empty");

        let yaml = r#"
            logging:
              level: loud
        "#;
        let err = Config::from_reader(yaml.as_bytes()).unwrap_err();
        assert_eq!(err.to_string(), "failed to parse config YAML");

        let yaml = r#"
            cache:
              evicter:
                type: random
        "#;
        assert!(Config::from_reader(yaml.as_bytes()).is_err());
    }

    #[test]
    fn test_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "cache:\n  max_deferred: 3").unwrap();

        let cfg = Config::get(Some(file.path())).unwrap();
        assert_eq!(cfg.cache.max_deferred, 3);

        let missing = file.path().with_extension("missing");
        let err = Config::get(Some(&missing)).unwrap_err();
        assert_eq!(err.to_string(), "failed to open configuration file");
    }

    #[test]
    fn test_build_evicter() {
        assert!(EvicterConfig::None.build::<crate::test::CountingGetter>().is_none());
        assert!(
            EvicterConfig::Lru { retain: 1 }
                .build::<crate::test::CountingGetter>()
                .is_some()
        );
    }
}
