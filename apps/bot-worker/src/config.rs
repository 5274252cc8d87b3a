//! Service configuration loaded from YAML.

use clap::Parser;
use core_config::{env_or_default, load_yaml, ConfigError};
use nats_consumer::{ConsumerConfig, ProducerConfig};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Environment variable consulted when `--config` is not given.
pub const CONFIG_ENV_VAR: &str = "BOT_WORKER_CONFIG";

const DEFAULT_CONFIG_PATH: &str = "config/bot-worker.yaml";
const DEFAULT_HEALTH_PORT: u16 = 8081;

/// Command line arguments.
#[derive(Debug, Parser)]
#[command(name = "bot_worker", version, about = "Chat bot worker for NATS JetStream")]
pub struct Cli {
    /// Path to the YAML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,
}

impl Cli {
    /// `--config`, then `BOT_WORKER_CONFIG`, then the default path.
    pub fn config_path(&self) -> PathBuf {
        self.config
            .clone()
            .unwrap_or_else(|| PathBuf::from(env_or_default(CONFIG_ENV_VAR, DEFAULT_CONFIG_PATH)))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    #[serde(default)]
    pub logger: LoggerConfig,

    pub consumer: ConsumerConfig,

    /// Reply destination; without it messages are handled but not answered
    #[serde(default)]
    pub producer: Option<ProducerConfig>,

    #[serde(default)]
    pub reply_filter: Option<ReplyFilterConfig>,

    /// Prepended to the echoed content of every reply
    #[serde(default)]
    pub reply_prefix: String,

    #[serde(default = "default_health_port")]
    pub health_port: u16,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggerConfig {
    /// Filter directive used when `RUST_LOG` is unset
    #[serde(default = "default_level")]
    pub level: String,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
        }
    }
}

/// Only messages whose field matches `pattern` get a reply.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReplyFilterConfig {
    /// JSON pointer into the received message
    #[serde(default = "default_filter_field")]
    pub field: String,

    /// Regular expression
    pub pattern: String,
}

fn default_level() -> String {
    "info".to_string()
}

fn default_filter_field() -> String {
    "/content".to_string()
}

fn default_health_port() -> u16 {
    DEFAULT_HEALTH_PORT
}

impl AppConfig {
    /// Load and validate the file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let mut config: Self = load_yaml(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the consumer and producer sections before anything connects.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        self.consumer
            .validate()
            .map_err(|e| ConfigError::Invalid(format!("consumer: {}", e)))?;

        if let Some(producer) = &self.producer {
            producer
                .validate()
                .map_err(|e| ConfigError::Invalid(format!("producer: {}", e)))?;
        }

        if let Some(filter) = &self.reply_filter {
            if filter.pattern.is_empty() {
                return Err(ConfigError::Invalid(
                    "reply_filter: pattern is required".to_string(),
                ));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_config::parse_yaml;

    fn parse(yaml: &str) -> Result<AppConfig, ConfigError> {
        let mut config: AppConfig = parse_yaml(Path::new("test.yaml"), yaml)?;
        config.validate()?;
        Ok(config)
    }

    #[test]
    fn test_minimal_config_applies_defaults() {
        let config = parse(
            r#"
consumer:
  nats_url: nats://localhost:4222
  subject: wechat.message.received
  consumer_name: bot-worker
"#,
        )
        .unwrap();

        assert_eq!(config.logger.level, "info");
        assert_eq!(config.consumer.concurrency, 1);
        assert_eq!(config.consumer.pull_max_wait_ms, 10_000);
        assert_eq!(config.health_port, 8081);
        assert!(config.producer.is_none());
        assert!(config.reply_filter.is_none());
        assert!(config.reply_prefix.is_empty());
    }

    #[test]
    fn test_full_config() {
        let config = parse(
            r#"
logger:
  level: debug,nats_consumer=trace
consumer:
  nats_url: nats://nats:4222
  subject: wechat.message.received
  consumer_name: bot-worker
  concurrency: 4
  pull_max_wait_ms: 2000
producer:
  nats_url: nats://nats:4222
  subject: wechat.message.send
reply_filter:
  pattern: "^@bot"
reply_prefix: "echo: "
health_port: 9090
"#,
        )
        .unwrap();

        assert_eq!(config.logger.level, "debug,nats_consumer=trace");
        assert_eq!(config.consumer.concurrency, 4);
        assert_eq!(
            config.producer.as_ref().map(|p| p.subject.as_str()),
            Some("wechat.message.send")
        );
        let filter = config.reply_filter.unwrap();
        assert_eq!(filter.field, "/content");
        assert_eq!(filter.pattern, "^@bot");
        assert_eq!(config.reply_prefix, "echo: ");
        assert_eq!(config.health_port, 9090);
    }

    #[test]
    fn test_pull_max_wait_as_duration() {
        let config = parse(
            r#"
consumer:
  nats_url: nats://localhost:4222
  subject: wechat.message.received
  consumer_name: bot-worker
  pull_max_wait: 5s
"#,
        )
        .unwrap();
        assert_eq!(config.consumer.pull_max_wait_ms, 5_000);
    }

    #[test]
    fn test_unknown_consumer_field_rejected() {
        let result = parse(
            r#"
consumer:
  nats_url: nats://localhost:4222
  subject: a
  consumer_name: b
  max_wait: 5s
"#,
        );
        assert!(matches!(result, Err(ConfigError::Yaml { .. })));
    }

    #[test]
    fn test_unknown_field_rejected() {
        let result = parse(
            r#"
consumer:
  nats_url: nats://localhost:4222
  subject: a
  consumer_name: b
llm:
  model: gpt
"#,
        );
        assert!(matches!(result, Err(ConfigError::Yaml { .. })));
    }

    #[test]
    fn test_missing_consumer_subject_rejected() {
        let result = parse(
            r#"
consumer:
  nats_url: nats://localhost:4222
  consumer_name: bot-worker
"#,
        );
        match result {
            Err(ConfigError::Invalid(msg)) => assert!(msg.contains("subject")),
            other => panic!("expected invalid config, got {:?}", other),
        }
    }

    #[test]
    fn test_incomplete_producer_rejected() {
        let result = parse(
            r#"
consumer:
  nats_url: nats://localhost:4222
  subject: a
  consumer_name: b
producer:
  nats_url: nats://localhost:4222
"#,
        );
        match result {
            Err(ConfigError::Invalid(msg)) => assert!(msg.starts_with("producer")),
            other => panic!("expected invalid producer, got {:?}", other),
        }
    }

    #[test]
    fn test_config_path_resolution() {
        let explicit = Cli {
            config: Some(PathBuf::from("/etc/bot.yaml")),
        };
        assert_eq!(explicit.config_path(), PathBuf::from("/etc/bot.yaml"));

        let implicit = Cli { config: None };
        temp_env::with_var(CONFIG_ENV_VAR, Some("/from/env.yaml"), || {
            assert_eq!(implicit.config_path(), PathBuf::from("/from/env.yaml"));
        });
        temp_env::with_var_unset(CONFIG_ENV_VAR, || {
            assert_eq!(implicit.config_path(), PathBuf::from(DEFAULT_CONFIG_PATH));
        });
    }

    #[test]
    fn test_cli_parses_config_flag() {
        let cli = Cli::parse_from(["bot_worker", "--config", "custom.yaml"]);
        assert_eq!(cli.config, Some(PathBuf::from("custom.yaml")));
    }
}
