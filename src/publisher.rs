// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Settix Message Publisher
//!
//! Publishes a contract to every configured cluster. Each cluster gets its
//! own channel, resolved for the destination service, and the per-cluster
//! publishes run concurrently. A failing cluster is logged and reported in the
//! returned [`PublishReport`] without affecting the others.

use crate::{
    config::{RabbitMqClusterOptions, RabbitMqOptions},
    contracts::Contract,
    errors::AmqpError,
    naming::{self, EXCHANGE_NAME, MESSAGE_TYPE_HEADER},
    otel,
    resolver::PublisherChannelResolver,
};
use chrono::Utc;
use futures_util::future::join_all;
use lapin::{
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties,
};
use opentelemetry::Context;
use std::{collections::BTreeMap, sync::Arc};
use tracing::{error, info};
use uuid::Uuid;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// A cluster the message could not be published to, and why.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishFailure {
    pub cluster: String,
    pub error: AmqpError,
}

/// Outcome of a fan-out publish.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub published: Vec<String>,
    pub failures: Vec<PublishFailure>,
}

impl PublishReport {
    /// # Returns
    /// `true` when every configured cluster confirmed the message
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    /// At least one cluster got the message and at least one did not.
    pub fn is_partial(&self) -> bool {
        !self.published.is_empty() && !self.failures.is_empty()
    }
}

/// Publishes contracts to the Settix exchange of every configured cluster.
pub struct SettixPublisher {
    resolver: Arc<PublisherChannelResolver>,
    clusters: RabbitMqClusterOptions,
}

impl SettixPublisher {
    /// Creates a new Settix publisher.
    ///
    /// # Parameters
    /// * `resolver` - Source of the per-cluster publishing channels
    /// * `clusters` - Clusters every message is fanned out to
    pub fn new(resolver: Arc<PublisherChannelResolver>, clusters: RabbitMqClusterOptions) -> Self {
        SettixPublisher { resolver, clusters }
    }

    /// Publishes `message` under the current trace context.
    pub async fn publish<C: Contract>(&self, message: &C) -> PublishReport {
        self.publish_with_context(&Context::current(), message)
            .await
    }

    /// Publishes `message` to every cluster concurrently.
    ///
    /// The message is routed by its destination service and carries its
    /// contract id in the message-type header, along with the trace context
    /// of `ctx`. A failing cluster does not prevent delivery to the others.
    ///
    /// # Parameters
    /// * `ctx` - OpenTelemetry context injected into the message headers
    /// * `message` - Contract to publish
    ///
    /// # Returns
    /// A [`PublishReport`] listing the clusters that confirmed the message and
    /// the ones that failed
    pub async fn publish_with_context<C: Contract>(
        &self,
        ctx: &Context,
        message: &C,
    ) -> PublishReport {
        let contract_id = message.contract_id();
        let destination = message.destination_service();

        let payload = match serde_json::to_vec(message) {
            Ok(payload) => payload,
            Err(err) => {
                error!(
                    error = err.to_string(),
                    contract = contract_id,
                    "failure to serialize message"
                );
                let error = AmqpError::SerializePayloadError(err.to_string());
                return PublishReport {
                    published: vec![],
                    failures: self
                        .clusters
                        .clusters
                        .iter()
                        .map(|cluster| PublishFailure {
                            cluster: cluster.server.clone(),
                            error: error.clone(),
                        })
                        .collect(),
                };
            }
        };

        let properties = properties(ctx, contract_id);
        let results = join_all(self.clusters.clusters.iter().map(|cluster| {
            self.publish_to(cluster, destination, &payload, properties.clone())
        }))
        .await;

        let mut report = PublishReport::default();
        for (cluster, result) in self.clusters.clusters.iter().zip(results) {
            match result {
                Ok(()) => {
                    info!(
                        contract = contract_id,
                        destination,
                        cluster = cluster.server,
                        "message published"
                    );
                    report.published.push(cluster.server.clone());
                }
                Err(err) => {
                    error!(
                        error = err.to_string(),
                        exchange = EXCHANGE_NAME,
                        cluster = cluster.server,
                        payload = String::from_utf8_lossy(&payload).as_ref(),
                        "failure to publish message"
                    );
                    report.failures.push(PublishFailure {
                        cluster: cluster.server.clone(),
                        error: err,
                    });
                }
            }
        }

        report
    }

    async fn publish_to(
        &self,
        cluster: &RabbitMqOptions,
        destination: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        let channel = self
            .resolver
            .resolve(EXCHANGE_NAME, cluster, destination)
            .await?;

        channel
            .basic_publish(
                EXCHANGE_NAME,
                &naming::routing_key(destination),
                payload,
                properties,
            )
            .await
    }
}

fn properties(ctx: &Context, contract_id: &str) -> BasicProperties {
    let mut headers = BTreeMap::<ShortString, AMQPValue>::default();
    otel::inject(ctx, &mut headers);
    headers.insert(
        ShortString::from(MESSAGE_TYPE_HEADER),
        AMQPValue::LongString(LongString::from(contract_id)),
    );

    BasicProperties::default()
        .with_content_type(ShortString::from(JSON_CONTENT_TYPE))
        .with_delivery_mode(PERSISTENT_DELIVERY_MODE)
        .with_type(ShortString::from(contract_id))
        .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
        .with_timestamp(Utc::now().timestamp().max(0) as u64)
        .with_headers(FieldTable::from(headers))
}
