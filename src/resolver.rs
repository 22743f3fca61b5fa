// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Channel Resolvers
//!
//! Channels are cached per key on top of the connections handed out by the
//! [`ConnectionResolver`]. A cached channel is either open or absent: a closed
//! channel is evicted before a replacement is created under the same key.
//!
//! - [`ConsumerChannelResolver`] keys channels by queue.
//! - [`PublisherChannelResolver`] keys channels by service, exchange and
//!   cluster, and makes sure the exchange exists before handing a channel out.

use crate::{
    channel::AmqpChannel,
    config::{RabbitMqOptions, ResolverOptions},
    connection::ConnectionResolver,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    naming,
};
use std::{collections::HashMap, future::Future, sync::Arc, time::Duration};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

/// Check-lock-check cache of channels, shared by both resolvers.
struct ChannelCache {
    channels: RwLock<HashMap<String, Arc<dyn AmqpChannel>>>,
    creation: Mutex<()>,
    lock_timeout: Duration,
    name: &'static str,
}

impl ChannelCache {
    fn new(name: &'static str, lock_timeout: Duration) -> Self {
        ChannelCache {
            channels: RwLock::new(HashMap::new()),
            creation: Mutex::new(()),
            lock_timeout,
            name,
        }
    }

    async fn get_or_create<F, Fut>(
        &self,
        key: &str,
        create: F,
    ) -> Result<Arc<dyn AmqpChannel>, AmqpError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Arc<dyn AmqpChannel>, AmqpError>>,
    {
        if let Some(channel) = self.open(key).await {
            return Ok(channel);
        }

        let _guard = tokio::time::timeout(self.lock_timeout, self.creation.lock())
            .await
            .map_err(|_| AmqpError::LockTimeout(self.name))?;

        if let Some(channel) = self.open(key).await {
            return Ok(channel);
        }

        if self.channels.write().await.remove(key).is_some() {
            debug!(key, "evicted closed channel");
        }

        let channel = create().await?;
        self.channels
            .write()
            .await
            .insert(key.to_owned(), channel.clone());

        Ok(channel)
    }

    async fn open(&self, key: &str) -> Option<Arc<dyn AmqpChannel>> {
        self.channels
            .read()
            .await
            .get(key)
            .filter(|channel| channel.is_open())
            .cloned()
    }
}

async fn open_confirmed_channel(
    connections: &ConnectionResolver,
    connection_key: &str,
    options: &RabbitMqOptions,
) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
    let connection = connections.resolve(connection_key, options).await?;
    let channel = connection.create_channel().await?;
    channel.confirm_select().await?;
    Ok(channel)
}

/// Channels per queue, used by consumers.
pub struct ConsumerChannelResolver {
    connections: Arc<ConnectionResolver>,
    cache: ChannelCache,
}

impl ConsumerChannelResolver {
    /// # Parameters
    /// * `connections` - Connection cache the channels are opened on
    /// * `options` - Lock timeout bounding concurrent resolves
    pub fn new(connections: Arc<ConnectionResolver>, options: &ResolverOptions) -> Self {
        ConsumerChannelResolver {
            connections,
            cache: ChannelCache::new("consumer channel resolver", options.lock_timeout),
        }
    }

    /// Resolves the channel for `resolve_key` over the connection cached under
    /// `bounded_context_key`.
    ///
    /// An open cached channel is returned as is; a closed one is replaced by a
    /// new channel in publisher-confirm mode.
    ///
    /// # Parameters
    /// * `resolve_key` - Cache key of the channel, compared case-insensitively
    /// * `options` - Cluster the connection is opened against
    /// * `bounded_context_key` - Cache key of the underlying connection
    ///
    /// # Returns
    /// The shared channel, or `LockTimeout` when the cache lock could not be
    /// taken in time
    pub async fn resolve(
        &self,
        resolve_key: &str,
        options: &RabbitMqOptions,
        bounded_context_key: &str,
    ) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        let key = resolve_key.to_lowercase();
        self.cache
            .get_or_create(&key, || {
                open_confirmed_channel(&self.connections, bounded_context_key, options)
            })
            .await
    }
}

/// Channels per service and exchange, used by the publisher.
pub struct PublisherChannelResolver {
    connections: Arc<ConnectionResolver>,
    cache: ChannelCache,
}

impl PublisherChannelResolver {
    /// # Parameters
    /// * `connections` - Connection cache the channels are opened on
    /// * `options` - Lock timeout bounding concurrent resolves
    pub fn new(connections: Arc<ConnectionResolver>, options: &ResolverOptions) -> Self {
        PublisherChannelResolver {
            connections,
            cache: ChannelCache::new("publisher channel resolver", options.lock_timeout),
        }
    }

    /// Resolves the channel publishing to `exchange` on one cluster.
    ///
    /// A new channel first checks that the exchange exists. Only when the
    /// broker reports it missing is it declared durable on a fresh channel;
    /// any other failure of the check is returned.
    ///
    /// # Parameters
    /// * `exchange` - Target exchange, empty for the default exchange
    /// * `options` - Cluster to publish to
    /// * `service_key` - Publishing service, part of the cache key
    ///
    /// # Returns
    /// The shared channel, or the broker or lock error that prevented it
    pub async fn resolve(
        &self,
        exchange: &str,
        options: &RabbitMqOptions,
        service_key: &str,
    ) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        let key = naming::publisher_channel_key(service_key, exchange, options);
        let connection_key = naming::connection_key(options);

        self.cache
            .get_or_create(&key, || async {
                let channel =
                    open_confirmed_channel(&self.connections, &connection_key, options).await?;
                if exchange.is_empty() {
                    return Ok(channel);
                }

                let definition = ExchangeDefinition::direct(exchange).durable();
                match channel.exchange_declare(&definition.as_passive()).await {
                    Ok(()) => return Ok(channel),
                    Err(AmqpError::ExchangeNotFound(_)) => {
                        debug!(exchange, "exchange missing, declaring it");
                        dispose(channel.as_ref()).await;
                    }
                    Err(err) => {
                        dispose(channel.as_ref()).await;
                        return Err(err);
                    }
                }

                let channel =
                    open_confirmed_channel(&self.connections, &connection_key, options).await?;
                channel.exchange_declare(&definition).await?;
                Ok(channel)
            })
            .await
    }
}

/// Closes a channel left unusable by a failed declare.
async fn dispose(channel: &dyn AmqpChannel) {
    if let Err(err) = channel.close().await {
        warn!(error = err.to_string(), "failure to dispose channel");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeBroker, FakeConnectionFactory};

    fn connections(broker: Arc<FakeBroker>, delay: Duration) -> Arc<ConnectionResolver> {
        Arc::new(ConnectionResolver::new(
            Arc::new(FakeConnectionFactory::new(broker).with_delay(delay)),
            ResolverOptions::default(),
        ))
    }

    #[tokio::test]
    async fn concurrent_consumer_resolves_share_one_channel() {
        let broker = FakeBroker::new();
        let resolver = Arc::new(ConsumerChannelResolver::new(
            connections(broker.clone(), Duration::from_millis(30)),
            &ResolverOptions::default(),
        ));
        let options = RabbitMqOptions::default();

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let resolver = resolver.clone();
                let options = options.clone();
                tokio::spawn(async move {
                    resolver
                        .resolve("settix.svc-a.consumer", &options, "/_localhost")
                        .await
                })
            })
            .collect();

        let mut channels = vec![];
        for handle in handles {
            channels.push(handle.await.unwrap().unwrap());
        }

        assert_eq!(broker.channels_created(), 1);
        assert!(channels.windows(2).all(|p| Arc::ptr_eq(&p[0], &p[1])));
    }

    #[tokio::test]
    async fn resolve_keys_are_case_insensitive() {
        let broker = FakeBroker::new();
        let resolver = ConsumerChannelResolver::new(
            connections(broker.clone(), Duration::ZERO),
            &ResolverOptions::default(),
        );
        let options = RabbitMqOptions::default();

        let a = resolver.resolve("Settix.Svc-A", &options, "ctx").await.unwrap();
        let b = resolver.resolve("settix.svc-a", &options, "ctx").await.unwrap();

        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn closed_channel_is_evicted_and_recreated() {
        let broker = FakeBroker::new();
        let resolver = ConsumerChannelResolver::new(
            connections(broker.clone(), Duration::ZERO),
            &ResolverOptions::default(),
        );
        let options = RabbitMqOptions::default();

        let stale = resolver.resolve("queue", &options, "ctx").await.unwrap();
        stale.close().await.unwrap();

        let fresh = resolver.resolve("queue", &options, "ctx").await.unwrap();

        assert!(fresh.is_open());
        assert!(!Arc::ptr_eq(&stale, &fresh));
        assert_eq!(broker.channels_created(), 2);
    }

    #[tokio::test]
    async fn missing_exchange_is_declared_once() {
        let broker = FakeBroker::new();
        let resolver = PublisherChannelResolver::new(
            connections(broker.clone(), Duration::ZERO),
            &ResolverOptions::default(),
        );
        let options = RabbitMqOptions::default();

        let channel = resolver
            .resolve(naming::EXCHANGE_NAME, &options, "svc-a")
            .await
            .unwrap();

        assert!(channel.is_open());
        assert_eq!(broker.passive_exchange_declares(), 1);
        assert_eq!(broker.active_exchange_declares(), 1);
        assert_eq!(broker.channels_created(), 2);

        let declared = broker.state().exchange_declares.last().cloned().unwrap();
        assert!(declared.durable && !declared.passive);
    }

    #[tokio::test]
    async fn existing_exchange_is_never_redeclared() {
        let broker = FakeBroker::new().with_exchange(naming::EXCHANGE_NAME);
        let resolver = PublisherChannelResolver::new(
            connections(broker.clone(), Duration::ZERO),
            &ResolverOptions::default(),
        );
        let options = RabbitMqOptions::default();

        let first = resolver
            .resolve(naming::EXCHANGE_NAME, &options, "svc-a")
            .await
            .unwrap();
        let second = resolver
            .resolve(naming::EXCHANGE_NAME, &options, "svc-a")
            .await
            .unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(broker.passive_exchange_declares(), 1);
        assert_eq!(broker.active_exchange_declares(), 0);
    }

    #[tokio::test]
    async fn publisher_channels_are_scoped_per_service() {
        let broker = FakeBroker::new().with_exchange(naming::EXCHANGE_NAME);
        let resolver = PublisherChannelResolver::new(
            connections(broker.clone(), Duration::ZERO),
            &ResolverOptions::default(),
        );
        let options = RabbitMqOptions::default();

        let a = resolver
            .resolve(naming::EXCHANGE_NAME, &options, "svc-a")
            .await
            .unwrap();
        let b = resolver
            .resolve(naming::EXCHANGE_NAME, &options, "svc-b")
            .await
            .unwrap();

        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(broker.channels_created(), 2);
    }

    #[tokio::test]
    async fn concurrent_publisher_resolves_share_one_channel() {
        let broker = FakeBroker::new();
        let resolver = Arc::new(PublisherChannelResolver::new(
            connections(broker.clone(), Duration::from_millis(30)),
            &ResolverOptions::default(),
        ));
        let options = RabbitMqOptions::default();

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let resolver = resolver.clone();
                let options = options.clone();
                tokio::spawn(async move {
                    resolver
                        .resolve(naming::EXCHANGE_NAME, &options, "svc-a")
                        .await
                })
            })
            .collect();

        let mut channels = vec![];
        for handle in handles {
            channels.push(handle.await.unwrap().unwrap());
        }

        assert!(channels.windows(2).all(|p| Arc::ptr_eq(&p[0], &p[1])));
        assert_eq!(broker.passive_exchange_declares(), 1);
        assert_eq!(broker.active_exchange_declares(), 1);
    }

    #[tokio::test]
    async fn refused_exchange_check_is_not_redeclared() {
        let broker = FakeBroker::new().with_exchange(naming::EXCHANGE_NAME);
        broker.refuse_declares(true);
        let resolver = PublisherChannelResolver::new(
            connections(broker.clone(), Duration::ZERO),
            &ResolverOptions::default(),
        );
        let options = RabbitMqOptions::default();

        let refused = resolver
            .resolve(naming::EXCHANGE_NAME, &options, "svc-a")
            .await;

        assert_eq!(
            refused.err(),
            Some(AmqpError::DeclareExchangeError(naming::EXCHANGE_NAME.to_owned()))
        );
        assert_eq!(broker.active_exchange_declares(), 0);
        assert_eq!(broker.channels_created(), 1);

        broker.refuse_declares(false);
        let channel = resolver
            .resolve(naming::EXCHANGE_NAME, &options, "svc-a")
            .await
            .unwrap();
        assert!(channel.is_open());
        assert_eq!(broker.active_exchange_declares(), 0);
    }
}
