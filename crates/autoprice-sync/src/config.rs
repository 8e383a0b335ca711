//! Pipeline settings: environment first, optional YAML overlay, one validation pass.

use std::path::Path;
use std::time::Duration;

use autoprice_core::{LocationError, StorageLocation, TableRef};
use autoprice_storage::{PollPolicy, QueryContext};
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{key} is required")]
    Missing { key: &'static str },
    #[error("{key}={value:?} is invalid: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
    #[error("{key}: {source}")]
    Location {
        key: &'static str,
        #[source]
        source: LocationError,
    },
    #[error("reading config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Every key is optional; present values replace the built-in defaults and
/// are in turn replaced by environment variables.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub discovery_job: Option<String>,
    pub workgroup: Option<String>,
    pub query_output: Option<String>,
    pub sns_topic_arn: Option<String>,
    pub webhook_url: Option<String>,
    pub namespace: Option<String>,
    pub source_table: Option<String>,
    pub summary_table: Option<String>,
    pub summary_location: Option<String>,
    pub alert_threshold_pct: Option<f64>,
    pub source_wait_timeout_secs: Option<u64>,
    pub query_poll_interval_ms: Option<u64>,
    pub query_timeout_secs: Option<u64>,
    pub table_poll_interval_ms: Option<u64>,
    pub accepted_suffix: Option<String>,
    pub scheduler_enabled: Option<bool>,
    pub schedule_cron: Option<String>,
    pub web_port: Option<u16>,
    pub log_format: Option<LogFormat>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub discovery_job: Option<String>,
    pub workgroup: Option<String>,
    pub query_output: String,
    pub sns_topic_arn: Option<String>,
    pub webhook_url: Option<String>,
    pub namespace: String,
    pub source_table: String,
    pub summary_table: String,
    /// Kept raw: bootstrap rejects a malformed value, purge skips it.
    pub summary_location: Option<String>,
    pub alert_threshold_pct: f64,
    pub source_wait_timeout: Duration,
    pub query_poll_interval: Duration,
    /// `None` waits for the engine indefinitely.
    pub query_timeout: Option<Duration>,
    pub table_poll_interval: Duration,
    pub accepted_suffix: String,
    pub scheduler_enabled: bool,
    pub schedule_cron: String,
    pub web_port: u16,
    pub log_format: LogFormat,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            discovery_job: None,
            workgroup: Some("primary".to_string()),
            query_output: String::new(),
            sns_topic_arn: None,
            webhook_url: None,
            namespace: "autoprice_db".to_string(),
            source_table: "autoprice_upload".to_string(),
            summary_table: "autoprice_summary".to_string(),
            summary_location: None,
            alert_threshold_pct: 10.0,
            source_wait_timeout: Duration::from_secs(120),
            query_poll_interval: Duration::from_millis(1200),
            query_timeout: Some(Duration::from_secs(600)),
            table_poll_interval: Duration::from_millis(2000),
            accepted_suffix: ".csv".to_string(),
            scheduler_enabled: false,
            schedule_cron: "0 0 6 * * *".to_string(),
            web_port: 8000,
            log_format: LogFormat::Pretty,
        }
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_value<T: std::str::FromStr>(key: &'static str, raw: String) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    raw.parse().map_err(|e: T::Err| ConfigError::Invalid {
        key,
        reason: e.to_string(),
        value: raw,
    })
}

fn parse_flag(key: &'static str, raw: String) -> Result<bool, ConfigError> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            key,
            value: raw,
            reason: "expected a boolean".to_string(),
        }),
    }
}

fn parse_log_format(raw: String) -> Result<LogFormat, ConfigError> {
    match raw.to_ascii_lowercase().as_str() {
        "pretty" | "text" => Ok(LogFormat::Pretty),
        "json" => Ok(LogFormat::Json),
        _ => Err(ConfigError::Invalid {
            key: "AUTOPRICE_LOG_FORMAT",
            value: raw,
            reason: "expected pretty or json".to_string(),
        }),
    }
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        Self::resolve(ConfigFile::default(), lookup)
    }

    /// Loads `path`, then lets the process environment override it.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_yaml_file_with(path, |key| std::env::var(key).ok())
    }

    pub fn from_yaml_file_with(
        path: impl AsRef<Path>,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let file: ConfigFile = serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        Self::resolve(file, lookup)
    }

    fn resolve(file: ConfigFile, lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = |key: &str| non_blank(lookup(key));
        let defaults = Self::default();

        let workgroup = match env("ATHENA_WORKGROUP") {
            Some(v) => Some(v),
            None => match file.workgroup {
                Some(v) => non_blank(Some(v)),
                None => defaults.workgroup,
            },
        };
        let query_timeout_secs = match env("QUERY_TIMEOUT_SECS") {
            Some(raw) => Some(parse_value::<u64>("QUERY_TIMEOUT_SECS", raw)?),
            None => file.query_timeout_secs,
        };

        Ok(Self {
            discovery_job: env("GLUE_CRAWLER_NAME").or(non_blank(file.discovery_job)),
            workgroup,
            query_output: env("ATHENA_OUTPUT")
                .or(non_blank(file.query_output))
                .unwrap_or(defaults.query_output),
            sns_topic_arn: env("SNS_TOPIC_ARN").or(non_blank(file.sns_topic_arn)),
            webhook_url: env("ALERT_WEBHOOK_URL").or(non_blank(file.webhook_url)),
            namespace: env("DB_NAME")
                .or(non_blank(file.namespace))
                .unwrap_or(defaults.namespace),
            source_table: env("SRC_TABLE")
                .or(non_blank(file.source_table))
                .unwrap_or(defaults.source_table),
            summary_table: env("SUMMARY_TABLE")
                .or(non_blank(file.summary_table))
                .unwrap_or(defaults.summary_table),
            summary_location: env("SUMMARY_S3").or(non_blank(file.summary_location)),
            alert_threshold_pct: match env("ALERT_THRESHOLD_PCT") {
                Some(raw) => parse_value("ALERT_THRESHOLD_PCT", raw)?,
                None => file.alert_threshold_pct.unwrap_or(defaults.alert_threshold_pct),
            },
            source_wait_timeout: match env("SOURCE_WAIT_TIMEOUT_SECS") {
                Some(raw) => Duration::from_secs(parse_value("SOURCE_WAIT_TIMEOUT_SECS", raw)?),
                None => file
                    .source_wait_timeout_secs
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.source_wait_timeout),
            },
            query_poll_interval: match env("QUERY_POLL_INTERVAL_MS") {
                Some(raw) => Duration::from_millis(parse_value("QUERY_POLL_INTERVAL_MS", raw)?),
                None => file
                    .query_poll_interval_ms
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.query_poll_interval),
            },
            query_timeout: match query_timeout_secs {
                Some(0) => None,
                Some(secs) => Some(Duration::from_secs(secs)),
                None => defaults.query_timeout,
            },
            table_poll_interval: match env("TABLE_POLL_INTERVAL_MS") {
                Some(raw) => Duration::from_millis(parse_value("TABLE_POLL_INTERVAL_MS", raw)?),
                None => file
                    .table_poll_interval_ms
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.table_poll_interval),
            },
            accepted_suffix: env("AUTOPRICE_ACCEPTED_SUFFIX")
                .or(non_blank(file.accepted_suffix))
                .unwrap_or(defaults.accepted_suffix),
            scheduler_enabled: match env("AUTOPRICE_SCHEDULER_ENABLED") {
                Some(raw) => parse_flag("AUTOPRICE_SCHEDULER_ENABLED", raw)?,
                None => file.scheduler_enabled.unwrap_or(defaults.scheduler_enabled),
            },
            schedule_cron: env("AUTOPRICE_SCHEDULE_CRON")
                .or(non_blank(file.schedule_cron))
                .unwrap_or(defaults.schedule_cron),
            web_port: match env("AUTOPRICE_WEB_PORT") {
                Some(raw) => parse_value("AUTOPRICE_WEB_PORT", raw)?,
                None => file.web_port.unwrap_or(defaults.web_port),
            },
            log_format: match env("AUTOPRICE_LOG_FORMAT") {
                Some(raw) => parse_log_format(raw)?,
                None => file.log_format.unwrap_or(defaults.log_format),
            },
        })
    }

    /// Checks everything a run needs before any collaborator is touched.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.query_output.is_empty() {
            return Err(ConfigError::Missing { key: "ATHENA_OUTPUT" });
        }
        StorageLocation::split_uri(&self.query_output).map_err(|source| ConfigError::Location {
            key: "ATHENA_OUTPUT",
            source,
        })?;

        for (key, value) in [
            ("DB_NAME", &self.namespace),
            ("SRC_TABLE", &self.source_table),
            ("SUMMARY_TABLE", &self.summary_table),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::Missing { key });
            }
        }

        if !self.alert_threshold_pct.is_finite() || self.alert_threshold_pct < 0.0 {
            return Err(ConfigError::Invalid {
                key: "ALERT_THRESHOLD_PCT",
                value: self.alert_threshold_pct.to_string(),
                reason: "must be a finite, non-negative percentage".to_string(),
            });
        }

        for (key, value) in [
            ("QUERY_POLL_INTERVAL_MS", self.query_poll_interval),
            ("TABLE_POLL_INTERVAL_MS", self.table_poll_interval),
        ] {
            if value.is_zero() {
                return Err(ConfigError::Invalid {
                    key,
                    value: "0".to_string(),
                    reason: "poll interval must be non-zero".to_string(),
                });
            }
        }

        if self.scheduler_enabled && self.schedule_cron.trim().is_empty() {
            return Err(ConfigError::Missing {
                key: "AUTOPRICE_SCHEDULE_CRON",
            });
        }
        Ok(())
    }

    pub fn query_context(&self) -> QueryContext {
        QueryContext {
            namespace: self.namespace.clone(),
            workgroup: self.workgroup.clone(),
            output_location: self.query_output.clone(),
        }
    }

    pub fn poll_policy(&self) -> PollPolicy {
        PollPolicy {
            interval: self.query_poll_interval,
            timeout: self.query_timeout,
        }
    }

    pub fn source_ref(&self) -> TableRef {
        TableRef::new(&self.namespace, &self.source_table)
    }

    pub fn summary_ref(&self) -> TableRef {
        TableRef::new(&self.namespace, &self.summary_table)
    }
}
