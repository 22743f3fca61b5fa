// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Settix RabbitMQ Layer
//!
//! `AmqpError` covers everything that can go wrong while talking to the broker:
//! connection and channel creation, topology declarations, publishing,
//! acknowledging and the resolvers' bounded lock waits. Errors of the HTTP
//! management API and of the message contracts live next to their modules
//! (`management::ManagementError`, `contracts::ContractError`).

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect `{0}`")]
    ConnectionError(String),

    /// The broker could not be reached at all (refused, unresolvable, reset)
    #[error("broker unreachable `{0}`")]
    BrokerUnreachable(String),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel `{0}`")]
    ChannelError(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// A passive declare found no exchange with the given name
    #[error("exchange `{0}` not found")]
    ExchangeNotFound(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding an exchange to a queue
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error binding a consumer to a queue
    #[error("failure to declare consumer `{0}`")]
    BindingConsumerError(String),

    /// Error publishing a message, or the broker refused to confirm it
    #[error("failure to publish `{0}`")]
    PublishingError(String),

    /// Error serializing an outgoing message
    #[error("failure to serialize payload `{0}`")]
    SerializePayloadError(String),

    /// The consumer was driven through an invalid state transition
    #[error("consumer error `{0}`")]
    ConsumerError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error closing a connection or channel
    #[error("failure to close `{0}`")]
    CloseError(String),

    /// A resolver could not enter its critical section in time
    #[error("unable to acquire lock for {0}")]
    LockTimeout(&'static str),

    /// The operation was abandoned because its cancellation token fired
    #[error("operation cancelled")]
    Cancelled,
}
