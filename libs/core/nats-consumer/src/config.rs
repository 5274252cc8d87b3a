//! Configuration for the pull consumer and the reply producer.

use crate::error::ConsumerError;
use serde::{Deserialize, Deserializer, Serialize};
use std::time::Duration;

/// Default number of workers.
pub const DEFAULT_CONCURRENCY: usize = 1;

/// Default upper bound for a single fetch, in milliseconds.
pub const DEFAULT_PULL_MAX_WAIT_MS: u64 = 10_000;

/// Consumer configuration.
///
/// Field names match the YAML keys of the service configuration file.
///
/// # Example
///
/// ```yaml
/// consumer:
///   nats_url: nats://localhost:4222
///   subject: wechat.message.received
///   consumer_name: bot-worker
///   concurrency: 4
///   pull_max_wait_ms: 5000
/// ```
///
/// `pull_max_wait: 5s` is accepted as well and wins over `pull_max_wait_ms`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConsumerConfig {
    /// NATS server URL
    pub nats_url: String,

    /// Subject to pull from
    pub subject: String,

    /// Durable consumer name
    pub consumer_name: String,

    /// Number of workers (0 means default)
    pub concurrency: usize,

    /// Max wait for one fetch in milliseconds (0 means default)
    pub pull_max_wait_ms: u64,

    /// Max wait as a duration string (`"5s"`, `"1m30s"`), folded into
    /// `pull_max_wait_ms` by `validate`
    #[serde(
        rename = "pull_max_wait",
        deserialize_with = "deserialize_duration",
        skip_serializing
    )]
    pub pull_max_wait_text: Option<Duration>,
}

impl ConsumerConfig {
    /// Create a configuration with the required fields set and defaults applied.
    pub fn new(
        nats_url: impl Into<String>,
        subject: impl Into<String>,
        consumer_name: impl Into<String>,
    ) -> Self {
        Self {
            nats_url: nats_url.into(),
            subject: subject.into(),
            consumer_name: consumer_name.into(),
            concurrency: DEFAULT_CONCURRENCY,
            pull_max_wait_ms: DEFAULT_PULL_MAX_WAIT_MS,
            pull_max_wait_text: None,
        }
    }

    /// Set the number of workers.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Set the fetch max wait.
    pub fn with_pull_max_wait(mut self, max_wait: Duration) -> Self {
        self.pull_max_wait_ms = duration_ms(max_wait);
        self.pull_max_wait_text = None;
        self
    }

    /// Fetch max wait as a duration.
    pub fn pull_max_wait(&self) -> Duration {
        Duration::from_millis(self.pull_max_wait_ms)
    }

    /// Apply defaults to zero-valued optional fields and reject missing required ones.
    pub fn validate(&mut self) -> Result<(), ConsumerError> {
        if let Some(max_wait) = self.pull_max_wait_text.take() {
            self.pull_max_wait_ms = duration_ms(max_wait);
        }
        if self.concurrency == 0 {
            self.concurrency = DEFAULT_CONCURRENCY;
        }
        if self.pull_max_wait_ms == 0 {
            self.pull_max_wait_ms = DEFAULT_PULL_MAX_WAIT_MS;
        }

        if self.nats_url.trim().is_empty() {
            return Err(ConsumerError::config("nats_url is required"));
        }
        if self.subject.trim().is_empty() {
            return Err(ConsumerError::config("subject is required"));
        }
        if self.consumer_name.trim().is_empty() {
            return Err(ConsumerError::config("consumer_name is required"));
        }
        Ok(())
    }
}

/// Producer configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProducerConfig {
    /// NATS server URL
    pub nats_url: String,

    /// Subject replies are published to
    pub subject: String,
}

impl ProducerConfig {
    pub fn new(nats_url: impl Into<String>, subject: impl Into<String>) -> Self {
        Self {
            nats_url: nats_url.into(),
            subject: subject.into(),
        }
    }

    /// Reject missing required fields.
    pub fn validate(&self) -> Result<(), ConsumerError> {
        if self.nats_url.trim().is_empty() {
            return Err(ConsumerError::config("nats_url is required"));
        }
        if self.subject.trim().is_empty() {
            return Err(ConsumerError::config("subject is required"));
        }
        Ok(())
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    let text = String::deserialize(deserializer)?;
    parse_duration(&text).map(Some).map_err(serde::de::Error::custom)
}

/// Parse a duration such as `500ms`, `5s`, `1.5s` or `1m30s`.
///
/// Units: `h`, `m`, `s`, `ms`, `us`, `ns`. A bare `0` is zero.
pub fn parse_duration(text: &str) -> Result<Duration, String> {
    let text = text.trim();
    if text == "0" {
        return Ok(Duration::ZERO);
    }
    if text.is_empty() {
        return Err("empty duration".to_string());
    }

    let invalid = || format!("invalid duration {text:?}");
    let mut total_nanos: u128 = 0;
    let mut rest = text;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        let (number, tail) = rest.split_at(number_len);

        let unit_len = tail
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(tail.len());
        let (unit, tail) = tail.split_at(unit_len);
        let unit_nanos: u128 = match unit {
            "h" => 3_600_000_000_000,
            "m" => 60_000_000_000,
            "s" => 1_000_000_000,
            "ms" => 1_000_000,
            "us" | "µs" => 1_000,
            "ns" => 1,
            "" => return Err(format!("missing unit in duration {text:?}")),
            other => return Err(format!("unknown unit {other:?} in duration {text:?}")),
        };

        let (whole, fraction) = number.split_once('.').unwrap_or((number, ""));
        if whole.is_empty() && fraction.is_empty() {
            return Err(invalid());
        }
        let whole: u128 = if whole.is_empty() {
            0
        } else {
            whole.parse().map_err(|_| invalid())?
        };
        let mut nanos = whole.checked_mul(unit_nanos).ok_or_else(invalid)?;
        if !fraction.is_empty() {
            let digits: u128 = fraction.parse().map_err(|_| invalid())?;
            let scale = 10u128.checked_pow(fraction.len() as u32).ok_or_else(invalid)?;
            nanos += digits.checked_mul(unit_nanos).ok_or_else(invalid)? / scale;
        }

        total_nanos = total_nanos.checked_add(nanos).ok_or_else(invalid)?;
        rest = tail;
    }

    let secs = u64::try_from(total_nanos / 1_000_000_000).map_err(|_| invalid())?;
    let subsec = (total_nanos % 1_000_000_000) as u32;
    Ok(Duration::new(secs, subsec))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_applies_defaults() {
        let mut config = ConsumerConfig {
            nats_url: "nats://localhost:4222".to_string(),
            subject: "test.subject".to_string(),
            consumer_name: "TEST_CONSUMER".to_string(),
            ..Default::default()
        };

        config.validate().unwrap();
        assert_eq!(config.concurrency, 1);
        assert_eq!(config.pull_max_wait(), Duration::from_secs(10));
    }

    #[test]
    fn test_validate_keeps_explicit_values() {
        let mut config = ConsumerConfig::new("nats://localhost:4222", "test.subject", "c")
            .with_concurrency(4)
            .with_pull_max_wait(Duration::from_secs(1));

        config.validate().unwrap();
        assert_eq!(config.concurrency, 4);
        assert_eq!(config.pull_max_wait_ms, 1000);
    }

    #[test]
    fn test_validate_rejects_missing_fields() {
        let mut config = ConsumerConfig::new("", "test.subject", "c");
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("nats_url"));

        let mut config = ConsumerConfig::new("nats://localhost:4222", " ", "c");
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("subject"));

        let mut config = ConsumerConfig::new("nats://localhost:4222", "test.subject", "");
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("consumer_name"));
    }

    #[test]
    fn test_deserialize_partial() {
        let config: ConsumerConfig = serde_json::from_str(
            r#"{"nats_url":"nats://n:4222","subject":"a.b","consumer_name":"bot"}"#,
        )
        .unwrap();
        assert_eq!(config.concurrency, 0);
        assert_eq!(config.pull_max_wait_ms, 0);
        assert_eq!(config.consumer_name, "bot");
    }

    #[test]
    fn test_pull_max_wait_duration_key() {
        let mut config: ConsumerConfig = serde_json::from_str(
            r#"{"nats_url":"nats://n:4222","subject":"a.b","consumer_name":"bot","pull_max_wait":"5s","pull_max_wait_ms":100}"#,
        )
        .unwrap();
        config.validate().unwrap();
        assert_eq!(config.pull_max_wait(), Duration::from_secs(5));
        assert_eq!(config.pull_max_wait_text, None);
    }

    #[test]
    fn test_unknown_consumer_key_rejected() {
        let result = serde_json::from_str::<ConsumerConfig>(
            r#"{"nats_url":"nats://n:4222","subject":"a.b","consumer_name":"bot","max_wait":"5s"}"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("500ms"), Ok(Duration::from_millis(500)));
        assert_eq!(parse_duration("5s"), Ok(Duration::from_secs(5)));
        assert_eq!(parse_duration("1.5s"), Ok(Duration::from_millis(1500)));
        assert_eq!(parse_duration("1m30s"), Ok(Duration::from_secs(90)));
        assert_eq!(parse_duration("0"), Ok(Duration::ZERO));
        assert!(parse_duration("5").is_err());
        assert!(parse_duration("5 parsecs").is_err());
        assert!(parse_duration("").is_err());
    }

    #[test]
    fn test_producer_config_validate() {
        assert!(ProducerConfig::new("nats://n:4222", "replies").validate().is_ok());
        assert!(ProducerConfig::new("nats://n:4222", "").validate().is_err());
        assert!(ProducerConfig::default().validate().is_err());
    }
}
