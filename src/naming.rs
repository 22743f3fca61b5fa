// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Deterministic broker names derived from a service key (queue prefix).

use crate::config::RabbitMqOptions;

/// The single direct exchange every Settix message goes through.
pub const EXCHANGE_NAME: &str = "settix.configuration";

/// Header carrying the contract id of a delivery.
pub const MESSAGE_TYPE_HEADER: &str = "settix-message-type";

const PREFIX: &str = "settix";

pub fn exchange_name() -> &'static str {
    EXCHANGE_NAME
}

pub fn queue_name(service_key: &str) -> String {
    format!("{}.{}", PREFIX, service_key.trim()).to_lowercase()
}

pub fn routing_key(service_key: &str) -> String {
    format!("{}.{}", PREFIX, service_key.trim()).to_lowercase()
}

pub fn consumer_channel_key(service_key: &str) -> String {
    format!("{}.{}.consumer", PREFIX, service_key.trim()).to_lowercase()
}

/// Key under which the connection for a cluster is cached.
pub fn connection_key(options: &RabbitMqOptions) -> String {
    format!("{}_{}", options.vhost, options.server).to_lowercase()
}

/// Key under which a publisher channel is cached.
pub fn publisher_channel_key(
    service_key: &str,
    exchange: &str,
    options: &RabbitMqOptions,
) -> String {
    format!("{}_{}_{}", service_key, exchange, options.server).to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_and_routing_key_match_for_a_prefix() {
        assert_eq!(queue_name("Svc-A"), "settix.svc-a");
        assert_eq!(routing_key("Svc-A"), queue_name("svc-a"));
        assert_eq!(consumer_channel_key("svc-a"), "settix.svc-a.consumer");
    }

    #[test]
    fn keys_are_case_insensitive() {
        let options = RabbitMqOptions {
            server: "RMQ-1".to_owned(),
            vhost: "Tenants".to_owned(),
            ..Default::default()
        };

        assert_eq!(connection_key(&options), "tenants_rmq-1");
        assert_eq!(
            publisher_channel_key("Svc-B", EXCHANGE_NAME, &options),
            "svc-b_settix.configuration_rmq-1"
        );
    }
}
