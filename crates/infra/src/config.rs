//! Worker configuration from `DRAWQ_*` environment variables.

use std::str::FromStr;
use std::time::Duration;

use drawq_messaging::{BrokerConfig, DEFAULT_CONSUME_TIMEOUT, WireFormat};

use crate::worker::{AckOrdering, RetryPolicy};

pub const DEFAULT_QUEUE: &str = "gacha.draw";
pub const DEFAULT_RESULT_PREFIX: &str = "gacha";

/// Accepted range for the consume wait, in seconds.
pub const CONSUME_TIMEOUT_RANGE_SECS: core::ops::RangeInclusive<u64> = 1..=3600;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{var} is set but empty")]
    Empty { var: &'static str },

    #[error("invalid value for {var}: {value:?} ({reason})")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error("{0}")]
    Inconsistent(String),
}

/// Everything a worker process needs, read once at startup.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    pub broker: BrokerConfig,
    pub queue: String,
    pub dead_letter_queue: Option<String>,
    /// Result store address; the broker address when unset.
    pub result_url: String,
    pub result_prefix: String,
    pub result_ttl: Option<Duration>,
    pub consume_timeout: Duration,
    pub retry: RetryPolicy,
    pub ack_ordering: AckOrdering,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        let broker = BrokerConfig::default();
        Self {
            result_url: broker.url.clone(),
            broker,
            queue: DEFAULT_QUEUE.to_string(),
            dead_letter_queue: None,
            result_prefix: DEFAULT_RESULT_PREFIX.to_string(),
            result_ttl: None,
            consume_timeout: DEFAULT_CONSUME_TIMEOUT,
            retry: RetryPolicy::default(),
            ack_ordering: AckOrdering::default(),
        }
    }
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup (the environment, a map in tests...).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Lookup(lookup);
        let defaults = Self::default();

        let url = env.string("DRAWQ_BROKER_URL")?.unwrap_or(defaults.broker.url);
        let mut broker = BrokerConfig::new(url.clone());
        if let Some(namespace) = env.string("DRAWQ_NAMESPACE")? {
            broker.namespace = namespace;
        }
        if let Some(name) = env.string("DRAWQ_CONSUMER_NAME")? {
            broker.consumer_name = name;
        }
        if let Some(format) = env.parsed::<WireFormat>("DRAWQ_WIRE_FORMAT")? {
            broker.wire_format = format;
        }

        let max_attempts = env.parsed::<u32>("DRAWQ_MAX_ATTEMPTS")?;
        let base_delay = env.millis("DRAWQ_RETRY_BASE_DELAY_MS")?;
        let max_delay = env.millis("DRAWQ_RETRY_MAX_DELAY_MS")?;
        let retry = RetryPolicy {
            max_attempts,
            base_delay: base_delay.unwrap_or(defaults.retry.base_delay),
            max_delay: max_delay.unwrap_or(defaults.retry.max_delay),
            ..defaults.retry
        };

        let config = Self {
            result_url: env.string("DRAWQ_RESULT_URL")?.unwrap_or(url),
            broker,
            queue: env.string("DRAWQ_QUEUE")?.unwrap_or(defaults.queue),
            dead_letter_queue: env.string("DRAWQ_DEAD_LETTER_QUEUE")?,
            result_prefix: env
                .string("DRAWQ_RESULT_PREFIX")?
                .unwrap_or(defaults.result_prefix),
            result_ttl: env.parsed::<u64>("DRAWQ_RESULT_TTL_SECS")?.map(Duration::from_secs),
            consume_timeout: env
                .parsed::<u64>("DRAWQ_CONSUME_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.consume_timeout),
            retry,
            ack_ordering: env
                .parsed::<AckOrdering>("DRAWQ_ACK_ORDERING")?
                .unwrap_or(defaults.ack_ordering),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let timeout = self.consume_timeout;
        let min = Duration::from_secs(*CONSUME_TIMEOUT_RANGE_SECS.start());
        let max = Duration::from_secs(*CONSUME_TIMEOUT_RANGE_SECS.end());
        if timeout < min || timeout > max {
            return Err(ConfigError::Invalid {
                var: "DRAWQ_CONSUME_TIMEOUT_SECS",
                value: timeout.as_secs().to_string(),
                reason: format!(
                    "must be between {} and {} seconds",
                    CONSUME_TIMEOUT_RANGE_SECS.start(),
                    CONSUME_TIMEOUT_RANGE_SECS.end()
                ),
            });
        }
        if self.retry.max_attempts == Some(0) {
            return Err(ConfigError::Invalid {
                var: "DRAWQ_MAX_ATTEMPTS",
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.retry.is_bounded() && self.dead_letter_queue.is_none() {
            return Err(ConfigError::Inconsistent(
                "DRAWQ_MAX_ATTEMPTS requires DRAWQ_DEAD_LETTER_QUEUE".to_string(),
            ));
        }
        if self.dead_letter_queue.as_deref() == Some(self.queue.as_str()) {
            return Err(ConfigError::Inconsistent(
                "DRAWQ_DEAD_LETTER_QUEUE must differ from DRAWQ_QUEUE".to_string(),
            ));
        }
        if self.result_prefix.contains(':') {
            return Err(ConfigError::Invalid {
                var: "DRAWQ_RESULT_PREFIX",
                value: self.result_prefix.clone(),
                reason: "must not contain ':'".to_string(),
            });
        }
        Ok(())
    }
}

struct Lookup<F>(F);

impl<F> Lookup<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, var: &'static str) -> Result<Option<String>, ConfigError> {
        match (self.0)(var) {
            None => Ok(None),
            Some(value) if value.trim().is_empty() => Err(ConfigError::Empty { var }),
            Some(value) => Ok(Some(value.trim().to_string())),
        }
    }

    fn parsed<T>(&self, var: &'static str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: core::fmt::Display,
    {
        self.string(var)?
            .map(|value| {
                value.parse::<T>().map_err(|e| ConfigError::Invalid {
                    var,
                    reason: e.to_string(),
                    value,
                })
            })
            .transpose()
    }

    fn millis(&self, var: &'static str) -> Result<Option<Duration>, ConfigError> {
        Ok(self.parsed::<u64>(var)?.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Result<WorkerConfig, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        WorkerConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_without_environment() {
        let config = config_from(&[]).unwrap();
        let defaults = WorkerConfig::default();

        // Consumer names are unique per call, everything else is fixed.
        assert_ne!(config.broker.consumer_name, defaults.broker.consumer_name);
        let config = WorkerConfig {
            broker: BrokerConfig {
                consumer_name: defaults.broker.consumer_name.clone(),
                ..config.broker
            },
            ..config
        };
        assert_eq!(config, defaults);
        assert_eq!(config.queue, "gacha.draw");
        assert_eq!(config.consume_timeout, Duration::from_secs(3));
        assert_eq!(config.broker.wire_format, WireFormat::Bson);
        assert_eq!(config.result_url, config.broker.url);
        assert!(!config.retry.is_bounded());
    }

    #[test]
    fn reads_every_variable() {
        let config = config_from(&[
            ("DRAWQ_BROKER_URL", "redis://mq:6379/2"),
            ("DRAWQ_NAMESPACE", "prod"),
            ("DRAWQ_CONSUMER_NAME", "worker-7"),
            ("DRAWQ_WIRE_FORMAT", "json"),
            ("DRAWQ_QUEUE", "gacha.premium"),
            ("DRAWQ_DEAD_LETTER_QUEUE", "gacha.premium.dead"),
            ("DRAWQ_RESULT_URL", "redis://cache:6379/0"),
            ("DRAWQ_RESULT_PREFIX", "premium"),
            ("DRAWQ_RESULT_TTL_SECS", "3600"),
            ("DRAWQ_CONSUME_TIMEOUT_SECS", "1"),
            ("DRAWQ_MAX_ATTEMPTS", "5"),
            ("DRAWQ_RETRY_BASE_DELAY_MS", "250"),
            ("DRAWQ_RETRY_MAX_DELAY_MS", "4000"),
            ("DRAWQ_ACK_ORDERING", "persist-first"),
        ])
        .unwrap();

        assert_eq!(config.broker.url, "redis://mq:6379/2");
        assert_eq!(config.broker.namespace, "prod");
        assert_eq!(config.broker.consumer_name, "worker-7");
        assert_eq!(config.broker.wire_format, WireFormat::Json);
        assert_eq!(config.queue, "gacha.premium");
        assert_eq!(config.dead_letter_queue.as_deref(), Some("gacha.premium.dead"));
        assert_eq!(config.result_url, "redis://cache:6379/0");
        assert_eq!(config.result_prefix, "premium");
        assert_eq!(config.result_ttl, Some(Duration::from_secs(3600)));
        assert_eq!(config.consume_timeout, Duration::from_secs(1));
        assert_eq!(config.retry.max_attempts, Some(5));
        assert_eq!(config.retry.base_delay, Duration::from_millis(250));
        assert_eq!(config.retry.max_delay, Duration::from_millis(4000));
        assert_eq!(config.ack_ordering, AckOrdering::PersistFirst);
    }

    #[test]
    fn bounded_retry_needs_a_dead_letter_queue() {
        let err = config_from(&[("DRAWQ_MAX_ATTEMPTS", "3")]).unwrap_err();
        assert!(matches!(err, ConfigError::Inconsistent(_)));
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(
            config_from(&[("DRAWQ_CONSUME_TIMEOUT_SECS", "soon")]),
            Err(ConfigError::Invalid { var: "DRAWQ_CONSUME_TIMEOUT_SECS", .. })
        ));
        assert!(matches!(
            config_from(&[("DRAWQ_WIRE_FORMAT", "pickle")]),
            Err(ConfigError::Invalid { var: "DRAWQ_WIRE_FORMAT", .. })
        ));
        assert!(matches!(
            config_from(&[("DRAWQ_QUEUE", "  ")]),
            Err(ConfigError::Empty { var: "DRAWQ_QUEUE" })
        ));
    }

    #[test]
    fn consume_timeout_must_stay_in_range() {
        for value in ["0", "3601", "18446744073709551615"] {
            assert!(
                matches!(
                    config_from(&[("DRAWQ_CONSUME_TIMEOUT_SECS", value)]),
                    Err(ConfigError::Invalid { var: "DRAWQ_CONSUME_TIMEOUT_SECS", .. })
                ),
                "{value} accepted"
            );
        }
        for value in ["1", "3600"] {
            assert!(config_from(&[("DRAWQ_CONSUME_TIMEOUT_SECS", value)]).is_ok());
        }
    }
}
