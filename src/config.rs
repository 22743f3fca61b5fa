// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Configuration
//!
//! Option types consumed by the connection factory, the resolvers, the
//! topology bootstrap, the consumer and the publisher. Every type is
//! `serde`-deserializable so the host can bind it from whatever source it
//! loads configuration from.

use crate::errors::AmqpError;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::{fmt, time::Duration};

const DEFAULT_AMQP_PORT: u16 = 5672;
const DEFAULT_AMQPS_PORT: u16 = 5671;

/// Connection settings for a single RabbitMQ cluster.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct RabbitMqOptions {
    /// Comma separated list of broker hosts, tried in order.
    pub server: String,
    /// AMQP port. `0` picks 5672, or 5671 when `use_ssl` is set.
    pub port: u16,
    pub username: String,
    pub password: String,
    pub vhost: String,
    pub use_ssl: bool,
    /// Comma separated list of management API hosts. Falls back to `server`.
    pub api_address: Option<String>,
    /// Name the connection advertises to the broker.
    pub connection_name: Option<String>,
}

impl Default for RabbitMqOptions {
    fn default() -> Self {
        RabbitMqOptions {
            server: "localhost".to_owned(),
            port: 0,
            username: "guest".to_owned(),
            password: "guest".to_owned(),
            vhost: "/".to_owned(),
            use_ssl: false,
            api_address: None,
            connection_name: None,
        }
    }
}

impl RabbitMqOptions {
    /// Effective AMQP port.
    pub fn port(&self) -> u16 {
        match (self.port, self.use_ssl) {
            (0, true) => DEFAULT_AMQPS_PORT,
            (0, false) => DEFAULT_AMQP_PORT,
            (port, _) => port,
        }
    }

    /// Broker hosts in the order they should be tried.
    pub fn endpoints(&self) -> Vec<&str> {
        self.server
            .split(',')
            .map(str::trim)
            .filter(|host| !host.is_empty())
            .collect()
    }

    /// Management API hosts, `api_address` when set, the broker hosts otherwise.
    pub fn api_addresses(&self) -> &str {
        match &self.api_address {
            Some(addresses) if !addresses.trim().is_empty() => addresses,
            _ => &self.server,
        }
    }

    /// Builds the AMQP URI for one endpoint of this cluster, with the
    /// credentials and the vhost percent-encoded.
    ///
    /// # Parameters
    /// - `endpoint`: One of the hosts returned by [`endpoints`](Self::endpoints).
    ///
    /// # Returns
    /// The URI, or `ConnectionError` when `endpoint` is not a valid host.
    pub fn amqp_uri(&self, endpoint: &str) -> Result<String, AmqpError> {
        let scheme = if self.use_ssl { "amqps" } else { "amqp" };
        let invalid = || AmqpError::ConnectionError(format!("invalid endpoint `{}`", endpoint));

        let mut uri = Url::parse(&format!("{}://{}:{}", scheme, endpoint, self.port()))
            .map_err(|_| invalid())?;
        uri.set_username(&self.username).map_err(|_| invalid())?;
        uri.set_password(Some(&self.password))
            .map_err(|_| invalid())?;
        uri.path_segments_mut()
            .map_err(|_| invalid())?
            .clear()
            .push(&self.vhost);

        Ok(uri.into())
    }
}

// Passwords never reach the logs.
impl fmt::Debug for RabbitMqOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RabbitMqOptions")
            .field("server", &self.server)
            .field("port", &self.port())
            .field("username", &self.username)
            .field("password", &"***")
            .field("vhost", &self.vhost)
            .field("use_ssl", &self.use_ssl)
            .field("api_address", &self.api_address)
            .field("connection_name", &self.connection_name)
            .finish()
    }
}

/// The ordered set of clusters a publisher fans out to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RabbitMqClusterOptions {
    pub clusters: Vec<RabbitMqOptions>,
}

/// Top level options of the Settix messaging layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SettixOptions {
    pub publisher: RabbitMqClusterOptions,
    pub consumer: RabbitMqOptions,
    pub resolver: ResolverOptions,
    pub retry: RetryPolicy,
    pub consumer_behavior: ConsumerOptions,
}

/// Bounds applied by the connection and channel resolvers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverOptions {
    /// How long a caller may wait for the resolver's critical section.
    #[serde(with = "millis")]
    pub lock_timeout: Duration,
    /// Grace period given to each connection when the resolver is closed.
    #[serde(with = "millis")]
    pub close_grace: Duration,
}

impl Default for ResolverOptions {
    fn default() -> Self {
        ResolverOptions {
            lock_timeout: Duration::from_secs(10),
            close_grace: Duration::from_secs(5),
        }
    }
}

/// Capped exponential backoff used while a broker is unreachable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    #[serde(with = "millis")]
    pub initial_delay: Duration,
    #[serde(with = "millis")]
    pub max_delay: Duration,
    pub multiplier: u32,
    /// `None` retries until cancelled.
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2,
            max_attempts: None,
        }
    }
}

impl RetryPolicy {
    /// A policy that waits the same delay between every attempt.
    pub fn fixed(delay: Duration) -> Self {
        RetryPolicy {
            initial_delay: delay,
            max_delay: delay,
            multiplier: 1,
            max_attempts: None,
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Delay to wait after the given failed attempt (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self
            .multiplier
            .max(1)
            .saturating_pow(attempt.saturating_sub(1));
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Whether another attempt is allowed after `attempt` failures.
    pub fn should_retry(&self, attempt: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempt < max)
    }
}

/// Consumer behaviour.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerOptions {
    pub prefetch_count: u16,
    #[serde(with = "millis")]
    pub drain_poll_interval: Duration,
    /// Upper bound on how long `stop` waits for an in-flight delivery.
    /// `None` waits for as long as the handler takes.
    #[serde(with = "opt_millis")]
    pub max_drain_wait: Option<Duration>,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        ConsumerOptions {
            prefetch_count: 1,
            drain_poll_interval: Duration::from_millis(10),
            max_drain_wait: None,
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

mod opt_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(value) => serializer.serialize_some(&(value.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}
