// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Settix Broker Topology
//!
//! Every Settix service needs the same small topology on each cluster:
//!
//! - the virtual host, with permissions for the operating user,
//! - the durable direct exchange `settix.configuration`,
//! - a durable queue named after the service,
//! - a binding from the queue to the exchange with the service routing key.
//!
//! [`TopologyBootstrap::ensure_topology`] provisions all of it. It is
//! idempotent and never fails the caller: problems are logged, and a queue
//! that could not be provisioned shows up later when the consumer attaches.

use crate::{
    channel::AmqpChannel,
    config::{RabbitMqClusterOptions, RabbitMqOptions},
    connection::ConnectionFactory,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    management::{ManagementApi, ManagementApiFactory, ManagementError, PermissionInfo, UserInfo},
    naming,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tracing::{debug, error, warn};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TopologyError {
    #[error(transparent)]
    Management(#[from] ManagementError),

    #[error(transparent)]
    Amqp(#[from] AmqpError),
}

/// Collects exchanges, queues and bindings and declares them on a channel.
#[async_trait]
pub trait Topology {
    fn exchange(self, def: ExchangeDefinition) -> Self;

    fn queue(self, def: QueueDefinition) -> Self;

    fn queue_binding(self, binding: QueueBinding) -> Self;

    /// Declares exchanges first, then queues, then bindings.
    async fn install(&self) -> Result<(), AmqpError>;
}

pub struct AmqpTopology<'tp> {
    channel: &'tp dyn AmqpChannel,
    pub(crate) exchanges: Vec<ExchangeDefinition>,
    pub(crate) queues: Vec<QueueDefinition>,
    pub(crate) queues_binding: Vec<QueueBinding>,
}

impl<'tp> AmqpTopology<'tp> {
    pub fn new(channel: &'tp dyn AmqpChannel) -> AmqpTopology<'tp> {
        AmqpTopology {
            channel,
            exchanges: vec![],
            queues: vec![],
            queues_binding: vec![],
        }
    }

    /// The exchange, queue and binding a Settix service consumes from.
    pub fn settix(channel: &'tp dyn AmqpChannel, queue_prefix: &str) -> AmqpTopology<'tp> {
        let queue = naming::queue_name(queue_prefix);

        AmqpTopology::new(channel)
            .exchange(ExchangeDefinition::direct(naming::exchange_name()).durable())
            .queue(QueueDefinition::new(&queue).durable())
            .queue_binding(
                QueueBinding::new(&queue)
                    .exchange(naming::exchange_name())
                    .routing_key(&naming::routing_key(queue_prefix)),
            )
    }
}

#[async_trait]
impl Topology for AmqpTopology<'_> {
    fn exchange(mut self, def: ExchangeDefinition) -> Self {
        self.exchanges.push(def);
        self
    }

    fn queue(mut self, def: QueueDefinition) -> Self {
        self.queues.push(def);
        self
    }

    fn queue_binding(mut self, binding: QueueBinding) -> Self {
        self.queues_binding.push(binding);
        self
    }

    async fn install(&self) -> Result<(), AmqpError> {
        for exch in &self.exchanges {
            debug!("creating exchange: {}", exch.name());
            self.channel.exchange_declare(exch).await?;
        }

        for queue in &self.queues {
            debug!("creating queue: {}", queue.name());
            self.channel.queue_declare(queue).await?;
        }

        for binding in &self.queues_binding {
            debug!(
                "binding queue: {} - exchange: {} - key: {}",
                binding.queue_name, binding.exchange_name, binding.routing_key
            );
            self.channel.queue_bind(binding).await?;
        }

        Ok(())
    }
}

/// Provisions the Settix topology on every configured cluster.
pub struct TopologyBootstrap {
    clusters: RabbitMqClusterOptions,
    connections: Arc<dyn ConnectionFactory>,
    management: Arc<dyn ManagementApiFactory>,
    close_grace: Duration,
}

impl TopologyBootstrap {
    pub fn new(
        clusters: RabbitMqClusterOptions,
        connections: Arc<dyn ConnectionFactory>,
        management: Arc<dyn ManagementApiFactory>,
        close_grace: Duration,
    ) -> Self {
        TopologyBootstrap {
            clusters,
            connections,
            management,
            close_grace,
        }
    }

    /// Makes sure every cluster can route messages to `queue_prefix`.
    ///
    /// A failing cluster is logged and skipped.
    pub async fn ensure_topology(&self, queue_prefix: &str) {
        for cluster in &self.clusters.clusters {
            if let Err(err) = self.ensure_vhost(cluster).await {
                error!(
                    error = err.to_string(),
                    cluster = cluster.server,
                    vhost = cluster.vhost,
                    "failure to provision virtual host"
                );
            }

            match self.install(cluster, queue_prefix).await {
                Ok(()) => debug!(cluster = cluster.server, queue_prefix, "settix topology ready"),
                Err(err) => error!(
                    error = err.to_string(),
                    cluster = cluster.server,
                    queue_prefix,
                    "failed to start settix rabbitmq infrastructure"
                ),
            }
        }
    }

    async fn ensure_vhost(&self, cluster: &RabbitMqOptions) -> Result<(), TopologyError> {
        let api = self.management.create(cluster)?;
        provision_vhost(api.as_ref(), cluster).await?;
        Ok(())
    }

    async fn install(
        &self,
        cluster: &RabbitMqOptions,
        queue_prefix: &str,
    ) -> Result<(), TopologyError> {
        let connection = self.connections.create_connection(cluster).await?;
        let channel = connection.create_channel().await?;

        let installed = AmqpTopology::settix(channel.as_ref(), queue_prefix)
            .install()
            .await;

        if let Err(err) = channel.close().await {
            warn!(error = err.to_string(), "failure to close bootstrap channel");
        }
        if let Err(err) = connection.close(self.close_grace).await {
            warn!(error = err.to_string(), "failure to close bootstrap connection");
        }

        Ok(installed?)
    }
}

/// Creates the cluster's virtual host when missing and grants the operating
/// user access to it, creating the user as well when needed.
pub async fn provision_vhost(
    api: &dyn ManagementApi,
    cluster: &RabbitMqOptions,
) -> Result<(), ManagementError> {
    let vhosts = api.get_vhosts().await?;
    if vhosts.iter().any(|vhost| vhost.name == cluster.vhost) {
        return Ok(());
    }

    debug!(vhost = cluster.vhost, "creating virtual host");
    let vhost = api.create_vhost(&cluster.vhost).await?;

    let existing = api
        .get_users()
        .await?
        .into_iter()
        .find(|user| user.name == cluster.username);
    let user = match existing {
        Some(user) => user,
        None => {
            api.create_user(&UserInfo::new(&cluster.username, &cluster.password))
                .await?
        }
    };

    api.create_permission(&PermissionInfo::new(&user, &vhost))
        .await
}
