// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Connections
//!
//! [`LapinConnectionFactory`] opens physical connections, waiting out broker
//! restarts with a capped exponential backoff that honours a cancellation
//! token. [`ConnectionResolver`] keeps at most one live connection per key and
//! replaces closed ones.

use crate::{
    channel::{AmqpConnection, LapinConnection},
    config::{RabbitMqOptions, ResolverOptions, RetryPolicy},
    errors::AmqpError,
};
use async_trait::async_trait;
use lapin::{types::LongString, Connection, ConnectionProperties};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Opens broker connections for a cluster.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn create_connection(
        &self,
        options: &RabbitMqOptions,
    ) -> Result<Arc<dyn AmqpConnection>, AmqpError>;
}

/// [`ConnectionFactory`] backed by `lapin`.
///
/// Every endpoint of the cluster is tried in order on each attempt. Between
/// attempts the factory sleeps according to its [`RetryPolicy`]; the loop ends
/// when a connection opens, the policy runs out of attempts, or the
/// cancellation token fires.
pub struct LapinConnectionFactory {
    retry: RetryPolicy,
    cancellation: CancellationToken,
}

impl LapinConnectionFactory {
    pub fn new(retry: RetryPolicy, cancellation: CancellationToken) -> Self {
        LapinConnectionFactory {
            retry,
            cancellation,
        }
    }

    async fn try_endpoints(&self, options: &RabbitMqOptions) -> Result<Connection, AmqpError> {
        let endpoints = options.endpoints();
        if endpoints.is_empty() {
            return Err(AmqpError::ConnectionError("no endpoint configured".to_owned()));
        }

        let mut last_error = AmqpError::InternalError;
        for endpoint in endpoints {
            let mut properties = ConnectionProperties::default();
            if let Some(name) = &options.connection_name {
                properties = properties.with_connection_name(LongString::from(name.clone()));
            }

            let uri = match options.amqp_uri(endpoint) {
                Ok(uri) => uri,
                Err(err) => {
                    last_error = err;
                    continue;
                }
            };

            debug!(endpoint, "creating amqp connection...");
            match Connection::connect(&uri, properties).await {
                Ok(connection) => {
                    debug!(endpoint, "amqp connected");
                    return Ok(connection);
                }
                Err(err) => last_error = classify(err),
            }
        }

        Err(last_error)
    }
}

#[async_trait]
impl ConnectionFactory for LapinConnectionFactory {
    async fn create_connection(
        &self,
        options: &RabbitMqOptions,
    ) -> Result<Arc<dyn AmqpConnection>, AmqpError> {
        debug!(options = ?options, "loaded settix rabbitmq options");

        let mut attempt = 0;
        loop {
            if self.cancellation.is_cancelled() {
                return Err(AmqpError::Cancelled);
            }

            attempt += 1;
            let err = match self.try_endpoints(options).await {
                Ok(connection) => return Ok(Arc::new(LapinConnection::new(connection))),
                Err(err) => err,
            };

            match &err {
                AmqpError::BrokerUnreachable(_) => debug!(
                    error = err.to_string(),
                    attempt,
                    options = ?options,
                    "failed to create settix rabbitmq connection, retrying..."
                ),
                _ => warn!(
                    error = err.to_string(),
                    attempt,
                    options = ?options,
                    "failed to create settix rabbitmq connection, retrying..."
                ),
            }

            if !self.retry.should_retry(attempt) {
                return Err(err);
            }

            tokio::select! {
                _ = self.cancellation.cancelled() => return Err(AmqpError::Cancelled),
                _ = tokio::time::sleep(self.retry.delay_for(attempt)) => {}
            }
        }
    }
}

fn classify(err: lapin::Error) -> AmqpError {
    match err {
        lapin::Error::IOError(_) => AmqpError::BrokerUnreachable(err.to_string()),
        _ => AmqpError::ConnectionError(err.to_string()),
    }
}

/// Hands out one live connection per key, creating it lazily.
///
/// Lookups are lock free; creation runs in a critical section bounded by
/// `ResolverOptions::lock_timeout` and re-checks the cache after entering it.
pub struct ConnectionResolver {
    factory: Arc<dyn ConnectionFactory>,
    connections: RwLock<HashMap<String, Arc<dyn AmqpConnection>>>,
    creation: Mutex<()>,
    options: ResolverOptions,
}

impl ConnectionResolver {
    pub fn new(factory: Arc<dyn ConnectionFactory>, options: ResolverOptions) -> Self {
        ConnectionResolver {
            factory,
            connections: RwLock::new(HashMap::new()),
            creation: Mutex::new(()),
            options,
        }
    }

    pub async fn resolve(
        &self,
        key: &str,
        options: &RabbitMqOptions,
    ) -> Result<Arc<dyn AmqpConnection>, AmqpError> {
        if let Some(connection) = self.existing(key).await {
            return Ok(connection);
        }

        let _guard = tokio::time::timeout(self.options.lock_timeout, self.creation.lock())
            .await
            .map_err(|_| AmqpError::LockTimeout("connection resolver"))?;

        if let Some(connection) = self.existing(key).await {
            return Ok(connection);
        }

        let connection = self.factory.create_connection(options).await?;
        self.connections
            .write()
            .await
            .insert(key.to_owned(), connection.clone());

        Ok(connection)
    }

    /// Closes every tracked connection, each within the configured grace period.
    pub async fn close_all(&self) {
        let connections: Vec<_> = self.connections.write().await.drain().collect();
        for (key, connection) in connections {
            if let Err(err) = connection.close(self.options.close_grace).await {
                warn!(error = err.to_string(), key, "failure to close connection");
            }
        }
    }

    async fn existing(&self, key: &str) -> Option<Arc<dyn AmqpConnection>> {
        self.connections
            .read()
            .await
            .get(key)
            .filter(|connection| connection.is_open())
            .cloned()
    }
}
