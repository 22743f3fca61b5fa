// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Settix Messaging Root
//!
//! Wires the connection factory, the resolvers, the topology bootstrap, the
//! contract registry, the publisher and the consumer factory into one value
//! the host service keeps for its lifetime.

use crate::{
    config::{ConsumerOptions, RabbitMqClusterOptions, RabbitMqOptions, SettixOptions},
    connection::{ConnectionFactory, ConnectionResolver, LapinConnectionFactory},
    consumer::{ConsumerState, SettixConsumer},
    contracts::Contract,
    dispatcher::{ConfigurationMessageHandler, ContractRegistry},
    errors::AmqpError,
    management::{HttpManagementApiFactory, ManagementApiFactory},
    naming,
    publisher::{PublishReport, SettixPublisher},
    resolver::{ConsumerChannelResolver, PublisherChannelResolver},
    topology::TopologyBootstrap,
};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Creates and owns the consumer of the host service's queue.
pub struct SettixConsumerFactory {
    options: RabbitMqOptions,
    consumer_options: ConsumerOptions,
    bootstrap: Arc<TopologyBootstrap>,
    channels: Arc<ConsumerChannelResolver>,
    registry: Arc<ContractRegistry>,
    consumer: Mutex<Option<Arc<SettixConsumer>>>,
}

impl SettixConsumerFactory {
    pub fn new(
        options: RabbitMqOptions,
        consumer_options: ConsumerOptions,
        bootstrap: Arc<TopologyBootstrap>,
        channels: Arc<ConsumerChannelResolver>,
        registry: Arc<ContractRegistry>,
    ) -> Self {
        SettixConsumerFactory {
            options,
            consumer_options,
            bootstrap,
            channels,
            registry,
            consumer: Mutex::new(None),
        }
    }

    /// Provisions the topology for `service_key` and starts consuming its queue.
    ///
    /// Broker failures are logged and leave the factory without a running
    /// consumer. Only a resolver lock timeout is returned.
    pub async fn create_and_start(&self, service_key: &str) -> Result<(), AmqpError> {
        self.bootstrap.ensure_topology(service_key).await;

        match self.start(service_key).await {
            Ok(()) => {
                let queue = naming::queue_name(service_key);
                info!(service_key, %queue, "settix consumer started");
                Ok(())
            }
            Err(err @ AmqpError::LockTimeout(_)) => {
                error!(
                    error = err.to_string(),
                    service_key,
                    "timed out resolving consumer channel"
                );
                Err(err)
            }
            Err(err) => {
                error!(
                    error = err.to_string(),
                    service_key,
                    "failed to start settix rabbitmq consumer"
                );
                Ok(())
            }
        }
    }

    async fn start(&self, service_key: &str) -> Result<(), AmqpError> {
        let mut current = self.consumer.lock().await;
        if let Some(existing) = current.as_ref() {
            if existing.is_active() {
                debug!(service_key, "settix consumer already running");
                return Ok(());
            }
        }
        if let Some(stale) = current.take() {
            debug!(service_key, state = ?stale.state(), "replacing detached settix consumer");
            stale.stop().await;
        }

        let channel = self
            .channels
            .resolve(
                &naming::consumer_channel_key(service_key),
                &self.options,
                &naming::connection_key(&self.options),
            )
            .await?;

        let consumer = Arc::new(SettixConsumer::new(
            channel,
            self.registry.clone(),
            self.consumer_options.clone(),
        ));
        consumer.configure(&naming::queue_name(service_key)).await?;
        *current = Some(consumer);

        Ok(())
    }

    /// Drains and stops the running consumer, if any.
    pub async fn stop(&self) {
        let consumer = self.consumer.lock().await.take();
        if let Some(consumer) = consumer {
            consumer.stop().await;
        }
    }

    pub async fn state(&self) -> Option<ConsumerState> {
        self.consumer
            .lock()
            .await
            .as_ref()
            .map(|consumer| consumer.state())
    }
}

pub struct SettixRabbitMq {
    connections: Arc<ConnectionResolver>,
    bootstrap: Arc<TopologyBootstrap>,
    publisher: SettixPublisher,
    consumers: SettixConsumerFactory,
    cancellation: CancellationToken,
}

impl SettixRabbitMq {
    /// Builds the messaging root on top of lapin and the HTTP management API.
    pub fn new(options: SettixOptions, handler: Arc<dyn ConfigurationMessageHandler>) -> Self {
        let cancellation = CancellationToken::new();
        let factory = Arc::new(LapinConnectionFactory::new(
            options.retry.clone(),
            cancellation.clone(),
        ));

        Self::assemble(
            options,
            handler,
            factory,
            Arc::new(HttpManagementApiFactory::default()),
            cancellation,
        )
    }

    pub fn with_factories(
        options: SettixOptions,
        handler: Arc<dyn ConfigurationMessageHandler>,
        connections: Arc<dyn ConnectionFactory>,
        management: Arc<dyn ManagementApiFactory>,
    ) -> Self {
        Self::assemble(options, handler, connections, management, CancellationToken::new())
    }

    fn assemble(
        options: SettixOptions,
        handler: Arc<dyn ConfigurationMessageHandler>,
        factory: Arc<dyn ConnectionFactory>,
        management: Arc<dyn ManagementApiFactory>,
        cancellation: CancellationToken,
    ) -> Self {
        let connections = Arc::new(ConnectionResolver::new(
            factory.clone(),
            options.resolver.clone(),
        ));

        let bootstrap = Arc::new(TopologyBootstrap::new(
            topology_clusters(&options),
            factory,
            management,
            options.resolver.close_grace,
        ));

        let publisher = SettixPublisher::new(
            Arc::new(PublisherChannelResolver::new(
                connections.clone(),
                &options.resolver,
            )),
            options.publisher.clone(),
        );

        let consumers = SettixConsumerFactory::new(
            options.consumer.clone(),
            options.consumer_behavior.clone(),
            bootstrap.clone(),
            Arc::new(ConsumerChannelResolver::new(
                connections.clone(),
                &options.resolver,
            )),
            Arc::new(ContractRegistry::new(handler)),
        );

        SettixRabbitMq {
            connections,
            bootstrap,
            publisher,
            consumers,
            cancellation,
        }
    }

    pub fn publisher(&self) -> &SettixPublisher {
        &self.publisher
    }

    pub fn consumers(&self) -> &SettixConsumerFactory {
        &self.consumers
    }

    pub async fn publish<C: Contract>(&self, message: &C) -> PublishReport {
        self.publisher.publish(message).await
    }

    pub async fn start_consumer(&self, service_key: &str) -> Result<(), AmqpError> {
        self.consumers.create_and_start(service_key).await
    }

    /// Provisions the topology of `queue_prefix` without consuming it.
    pub async fn ensure_topology(&self, queue_prefix: &str) {
        self.bootstrap.ensure_topology(queue_prefix).await
    }

    /// Token cancelling pending connection attempts.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    /// Stops the consumer, aborts pending connection attempts and closes every
    /// connection.
    pub async fn shutdown(&self) {
        self.consumers.stop().await;
        self.cancellation.cancel();
        self.connections.close_all().await;
        info!("settix rabbitmq shut down");
    }
}

/// Publisher clusters plus the consumer cluster when it is not one of them.
fn topology_clusters(options: &SettixOptions) -> RabbitMqClusterOptions {
    let mut clusters = options.publisher.clone();
    let consumer_key = naming::connection_key(&options.consumer);
    if !clusters
        .clusters
        .iter()
        .any(|cluster| naming::connection_key(cluster) == consumer_key)
    {
        clusters.clusters.push(options.consumer.clone());
    }
    clusters
}
