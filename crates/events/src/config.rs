//! Event bus settings.
//!
//! Read once at startup from the environment (after `.env` is loaded by the
//! binary). Credentials never appear in `Debug` or `Display` output.

use std::fmt;
use std::time::Duration;

use crate::backoff::BackoffConfig;
use crate::broker::BrokerOptions;

/// Default number of retries for connecting and publishing.
pub const DEFAULT_RETRY_COUNT: u32 = 5;

/// Default delay before the first retry, in milliseconds.
pub const DEFAULT_RETRY_DELAY_MS: u64 = 2_000;

/// Default upper bound on the retry delay, in milliseconds.
pub const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 60_000;

/// Event bus configuration loaded from environment variables.
///
/// The service name doubles as the name of the durable queue the
/// service consumes from.
#[derive(Clone, PartialEq)]
pub struct EventBusConfig {
    /// Service identity; also the consumer queue name.
    pub service_name: String,
    /// Broker host name.
    pub connection: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Retries after the first attempt, for connecting and publishing.
    pub retry_count: u32,
    pub retry_delay: Duration,
    pub retry_max_delay: Duration,
}

impl EventBusConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                        | Default     |
    /// |--------------------------------|-------------|
    /// | `SERVICE_NAME`                 | (required)  |
    /// | `EVENT_BUS_CONNECTION`         | `localhost` |
    /// | `EVENT_BUS_USERNAME`           | unset       |
    /// | `EVENT_BUS_PASSWORD`           | unset       |
    /// | `EVENT_BUS_RETRY_COUNT`        | `5`         |
    /// | `EVENT_BUS_RETRY_DELAY_MS`     | `2000`      |
    /// | `EVENT_BUS_RETRY_MAX_DELAY_MS` | `60000`     |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    ///
    /// Empty values are treated as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let service_name = get("SERVICE_NAME").ok_or(ConfigError::Missing("SERVICE_NAME"))?;
        let connection = get("EVENT_BUS_CONNECTION").unwrap_or_else(|| "localhost".into());

        let retry_count = parse_or(
            get("EVENT_BUS_RETRY_COUNT"),
            "EVENT_BUS_RETRY_COUNT",
            DEFAULT_RETRY_COUNT,
        )?;
        let retry_delay_ms = parse_or(
            get("EVENT_BUS_RETRY_DELAY_MS"),
            "EVENT_BUS_RETRY_DELAY_MS",
            DEFAULT_RETRY_DELAY_MS,
        )?;
        let retry_max_delay_ms = parse_or(
            get("EVENT_BUS_RETRY_MAX_DELAY_MS"),
            "EVENT_BUS_RETRY_MAX_DELAY_MS",
            DEFAULT_RETRY_MAX_DELAY_MS,
        )?;

        Ok(Self {
            service_name,
            connection,
            username: get("EVENT_BUS_USERNAME"),
            password: get("EVENT_BUS_PASSWORD"),
            retry_count,
            retry_delay: Duration::from_millis(retry_delay_ms),
            retry_max_delay: Duration::from_millis(retry_max_delay_ms),
        })
    }

    /// Connection parameters handed to the broker.
    pub fn broker_options(&self) -> BrokerOptions {
        BrokerOptions {
            host: self.connection.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
        }
    }

    /// Retry policy for both connecting and publishing.
    pub fn backoff(&self) -> BackoffConfig {
        BackoffConfig {
            retry_count: self.retry_count,
            initial_delay: self.retry_delay,
            max_delay: self.retry_max_delay,
            ..Default::default()
        }
    }
}

fn parse_or<T: std::str::FromStr>(
    value: Option<String>,
    var: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match value {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { var, value: raw }),
    }
}

impl fmt::Display for EventBusConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ServiceName={}, EventBusConnection={}, EventBusRetryCount={}",
            self.service_name, self.connection, self.retry_count
        )
    }
}

impl fmt::Debug for EventBusConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBusConfig")
            .field("service_name", &self.service_name)
            .field("connection", &self.connection)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("retry_count", &self.retry_count)
            .field("retry_delay", &self.retry_delay)
            .field("retry_max_delay", &self.retry_max_delay)
            .finish()
    }
}

/// Errors raised while loading [`EventBusConfig`].
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} environment variable is required")]
    Missing(&'static str),

    #[error("{var} has an invalid value: {value:?}")]
    Invalid { var: &'static str, value: String },
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use assert_matches::assert_matches;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_only_service_name_is_set() {
        let config = EventBusConfig::from_lookup(lookup(&[("SERVICE_NAME", "groups")]))
            .expect("config should load");

        assert_eq!(config.service_name, "groups");
        assert_eq!(config.connection, "localhost");
        assert_eq!(config.retry_count, 5);
        assert_eq!(config.retry_delay, Duration::from_secs(2));
        assert!(config.username.is_none());
    }

    #[test]
    fn missing_service_name_is_an_error() {
        let err = EventBusConfig::from_lookup(lookup(&[])).unwrap_err();
        assert_eq!(err, ConfigError::Missing("SERVICE_NAME"));
    }

    #[test]
    fn invalid_retry_count_is_reported() {
        let err = EventBusConfig::from_lookup(lookup(&[
            ("SERVICE_NAME", "groups"),
            ("EVENT_BUS_RETRY_COUNT", "many"),
        ]))
        .unwrap_err();

        assert_matches!(err, ConfigError::Invalid { var: "EVENT_BUS_RETRY_COUNT", .. });
    }

    #[test]
    fn credentials_and_backoff_are_derived() {
        let config = EventBusConfig::from_lookup(lookup(&[
            ("SERVICE_NAME", "users"),
            ("EVENT_BUS_CONNECTION", "rabbitmq"),
            ("EVENT_BUS_USERNAME", "guest"),
            ("EVENT_BUS_PASSWORD", "secret"),
            ("EVENT_BUS_RETRY_COUNT", "3"),
            ("EVENT_BUS_RETRY_DELAY_MS", "100"),
        ]))
        .expect("config should load");

        let options = config.broker_options();
        assert_eq!(options.host, "rabbitmq");
        assert_eq!(options.username.as_deref(), Some("guest"));
        assert_eq!(options.password.as_deref(), Some("secret"));

        let backoff = config.backoff();
        assert_eq!(backoff.retry_count, 3);
        assert_eq!(backoff.initial_delay, Duration::from_millis(100));
        assert_eq!(backoff.max_attempts(), 4);
    }

    #[test]
    fn display_and_debug_never_show_the_password() {
        let config = EventBusConfig::from_lookup(lookup(&[
            ("SERVICE_NAME", "users"),
            ("EVENT_BUS_PASSWORD", "secret"),
        ]))
        .expect("config should load");

        assert_eq!(
            config.to_string(),
            "ServiceName=users, EventBusConnection=localhost, EventBusRetryCount=5"
        );
        assert!(!format!("{config:?}").contains("secret"));
    }
}
