//! Startup configuration, read once from the environment.
//!
//! Required values that are missing, and values that do not parse, are fatal:
//! the process must not come up half-configured.

use crate::errors::{Error, Result};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Clone)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub tls: bool,
    pub ca_path: Option<PathBuf>,
    pub keep_alive: Duration,
}

impl fmt::Debug for BrokerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"***")
            .field("tls", &self.tls)
            .field("ca_path", &self.ca_path)
            .field("keep_alive", &self.keep_alive)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicConfig {
    pub telemetry_namespace: String,
    pub telemetry_suffix: String,
    pub status_namespace: String,
    pub command_topic: String,
}

/// Bounds for the exponential reconnect delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectConfig {
    pub min_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub http_addr: String,
    pub identity_validate_url: String,
    pub broker: BrokerConfig,
    pub topics: TopicConfig,
    pub reconnect: ReconnectConfig,
    pub channel_capacity: usize,
    pub publish_timeout: Duration,
    pub require_pairing_on_transport: bool,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };

        let reconnect = ReconnectConfig {
            min_delay: Duration::from_secs(env.parsed("RECONNECT_MIN_DELAY_SECS", 1u64)?),
            max_delay: Duration::from_secs(env.parsed("RECONNECT_MAX_DELAY_SECS", 120u64)?),
        };
        if reconnect.min_delay.is_zero() || reconnect.max_delay < reconnect.min_delay {
            return Err(Error::Config(format!(
                "reconnect delays must satisfy 0 < min <= max, got {:?}..{:?}",
                reconnect.min_delay, reconnect.max_delay
            )));
        }

        let channel_capacity: usize = env.parsed("CHANNEL_CAPACITY", 1024)?;
        if channel_capacity == 0 {
            return Err(Error::Config("CHANNEL_CAPACITY must be positive".to_string()));
        }

        Ok(Self {
            database_url: env.required("DATABASE_URL")?,
            http_addr: env.optional("HTTP_ADDR", "0.0.0.0:8080"),
            identity_validate_url: env.required("IDENTITY_VALIDATE_URL")?,
            broker: BrokerConfig {
                host: env.required("MQTT_BROKER")?,
                port: env.parsed("MQTT_PORT", 8883)?,
                username: env.required("MQTT_USERNAME")?,
                password: env.required("MQTT_PASSWORD")?,
                tls: env.parsed("MQTT_TLS", true)?,
                ca_path: env.get("MQTT_CA_PATH").map(PathBuf::from),
                keep_alive: Duration::from_secs(env.parsed("MQTT_KEEP_ALIVE_SECS", 60u64)?),
            },
            topics: TopicConfig {
                telemetry_namespace: env.optional("TELEMETRY_NAMESPACE", "iot"),
                telemetry_suffix: env.optional("TELEMETRY_SUFFIX", "dht11"),
                status_namespace: env.optional("STATUS_NAMESPACE", "hydrosee"),
                command_topic: env.required("MQTT_COMMAND_TOPIC")?,
            },
            reconnect,
            channel_capacity,
            publish_timeout: Duration::from_secs(env.parsed("PUBLISH_TIMEOUT_SECS", 5u64)?),
            require_pairing_on_transport: env.parsed("MQTT_REQUIRE_PAIRING_TOKEN", false)?,
        })
    }

    /// Database URL without credentials, for logging.
    pub fn database_host(&self) -> &str {
        self.database_url.split('@').last().unwrap_or("***")
    }
}

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn required(&self, key: &str) -> Result<String> {
        self.get(key)
            .ok_or_else(|| Error::Config(format!("{} must be set", key)))
    }

    fn optional(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_string())
    }

    fn parsed<T>(&self, key: &str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        match self.get(key) {
            Some(raw) => raw
                .parse()
                .map_err(|e| Error::Config(format!("{}={:?} is invalid: {}", key, raw, e))),
            None => Ok(default),
        }
    }
}
