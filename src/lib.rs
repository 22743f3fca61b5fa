// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Settix over RabbitMQ
//!
//! Configuration messages between services: a request contract is published
//! on the `settix.configuration` direct exchange, routed to the target
//! service's queue and dispatched by contract id to the application's
//! [`ConfigurationMessageHandler`]. Responses travel back the same way to the
//! service named in the request.

mod otel;

pub mod channel;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod contracts;
pub mod dispatcher;
pub mod errors;
pub mod exchange;
pub mod management;
pub mod naming;
pub mod publisher;
pub mod queue;
pub mod resolver;
pub mod settix;
pub mod topology;

#[cfg(test)]
mod testing;

pub use config::{RabbitMqClusterOptions, RabbitMqOptions, SettixOptions};
pub use contracts::{
    ConfigurationData, ConfigurationEntry, ConfigurationRemoved, ConfigureService, Contract,
    RemoveConfiguration, SchemaVersion, ServiceConfigured,
};
pub use dispatcher::{ConfigurationMessageHandler, HandlerError};
pub use errors::AmqpError;
pub use publisher::{PublishReport, SettixPublisher};
pub use settix::{SettixConsumerFactory, SettixRabbitMq};
