use counters::config::CounterStoreConfig;
use promotion::config::{FunnelConfig, PromotionConfig};
use quota::config::{ByteBudgetConfig, SessionQuotaConfig};
use serde::Deserialize;
use std::fs::File;

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct MetricsConfig {
    pub statsd_host: String,
    pub statsd_port: u16,
    #[serde(default = "default_metrics_prefix")]
    pub prefix: String,
}

fn default_metrics_prefix() -> String {
    "governor".into()
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct LoggingConfig {
    pub sentry_dsn: Option<String>,
    /// Used when `RUST_LOG` is not set.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            sentry_dsn: None,
            level: default_log_level(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct CommonConfig {
    pub metrics: Option<MetricsConfig>,
    pub logging: Option<LoggingConfig>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    #[serde(flatten)]
    pub common: CommonConfig,
    pub counter_store: CounterStoreConfig,
    pub byte_budget: ByteBudgetConfig,
    pub session_quota: SessionQuotaConfig,
    pub funnel: FunnelConfig,
    pub promotion: PromotionConfig,
}

impl Config {
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let file = File::open(path)?;
        let config: Config = serde_yaml::from_reader(file)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.counter_store
            .validate()
            .map_err(invalid("counter_store"))?;
        self.byte_budget.validate().map_err(invalid("byte_budget"))?;
        self.session_quota
            .validate()
            .map_err(invalid("session_quota"))?;
        self.funnel.validate().map_err(invalid("funnel"))?;
        self.promotion.validate().map_err(invalid("promotion"))?;
        Ok(())
    }
}

fn invalid<E: std::error::Error>(section: &'static str) -> impl FnOnce(E) -> ConfigError {
    move |err| ConfigError::Invalid {
        section,
        reason: err.to_string(),
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("could not load config from file: {0}")]
    LoadError(#[from] std::io::Error),
    #[error("could not parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),
    #[error("invalid {section} config: {reason}")]
    Invalid { section: &'static str, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_tmp_file(s: &str) -> tempfile::NamedTempFile {
        let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
        write!(tmp, "{}", s).expect("write yaml");

        tmp
    }

    #[test]
    fn test_full_config() {
        let yaml = r#"
            metrics:
                statsd_host: 127.0.0.1
                statsd_port: 8125
            logging:
                sentry_dsn: https://key@sentry.example.com/1
            counter_store:
                operation_timeout_ms: 100
            byte_budget:
                max_object_bytes: 1048576
                device_minute_bytes: 2097152
            session_quota:
                cache_ttl_secs: 60
            funnel:
                sample_limit: 500
            promotion:
                baseline_sample_rate: 0.01
                rate_limits:
                    crash: 10
            "#;
        let tmp = write_tmp_file(yaml);
        let config = Config::from_file(tmp.path()).expect("load config");

        let metrics = config.common.metrics.expect("metrics config");
        assert_eq!(metrics.statsd_port, 8125);
        assert_eq!(metrics.prefix, "governor");
        let logging = config.common.logging.expect("logging config");
        assert_eq!(logging.level, "info");
        assert!(logging.sentry_dsn.is_some());

        assert_eq!(config.counter_store.operation_timeout_ms, 100);
        assert_eq!(config.byte_budget.device_minute_bytes, 2 * 1024 * 1024);
        assert_eq!(config.session_quota.cache_ttl_secs, 60);
        assert_eq!(config.session_quota.lock_ttl_ms, 5_000);
        assert_eq!(config.funnel.sample_limit, 500);
        assert_eq!(
            config
                .promotion
                .rate_limit_for(promotion::PromotionReason::Crash),
            10
        );
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let tmp = write_tmp_file("{}");
        let config = Config::from_file(tmp.path()).expect("load config");
        assert_eq!(config, Config::default());
        assert!(config.common.metrics.is_none());
    }

    #[test]
    fn test_invalid_sections_are_named() {
        let tmp = write_tmp_file(
            r#"
            byte_budget:
                max_object_bytes: 0
            "#,
        );
        let err = Config::from_file(tmp.path()).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                section: "byte_budget",
                ..
            }
        ));
        assert_eq!(
            err.to_string(),
            "invalid byte_budget config: max_object_bytes cannot be 0"
        );
    }

    #[test]
    fn test_missing_file() {
        let err = Config::from_file(std::path::Path::new("/nonexistent/governor.yaml"));
        assert!(matches!(err, Err(ConfigError::LoadError(_))));
    }
}
