// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-memory broker implementing the connection and channel traits for tests.
//!
//! Exchanges route by exact routing key to bound queues. Deliveries handed to
//! a consumer stay unacked until `basic_ack`; closing the channel (or its
//! connection) puts unacked deliveries back at the head of their queue and
//! marks them redelivered.

use crate::{
    channel::{AmqpChannel, AmqpConnection, Delivery, DeliveryStream},
    config::RabbitMqOptions,
    connection::ConnectionFactory,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use lapin::BasicProperties;
use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};

const POLL: Duration = Duration::from_millis(2);

#[derive(Debug, Clone)]
pub(crate) struct Published {
    pub exchange: String,
    pub routing_key: String,
    pub properties: BasicProperties,
    pub data: Vec<u8>,
}

#[derive(Default)]
pub(crate) struct BrokerState {
    pub exchanges: HashSet<String>,
    pub queues: HashMap<String, VecDeque<Delivery>>,
    pub bindings: Vec<QueueBinding>,
    pub exchange_declares: Vec<ExchangeDefinition>,
    pub queue_declares: Vec<QueueDefinition>,
    pub published: Vec<Published>,
    pub acked: Vec<u64>,
    pub qos: Vec<u16>,
    pub channels_created: usize,
    pub fail_publishing: bool,
    pub refuse_declares: bool,
    next_tag: u64,
}

pub(crate) struct FakeBroker {
    state: Mutex<BrokerState>,
}

impl FakeBroker {
    pub fn new() -> Arc<FakeBroker> {
        Arc::new(FakeBroker {
            state: Mutex::new(BrokerState::default()),
        })
    }

    pub fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap()
    }

    pub fn with_exchange(self: Arc<Self>, name: &str) -> Arc<Self> {
        self.state().exchanges.insert(name.to_owned());
        self
    }

    pub fn with_queue(self: Arc<Self>, name: &str) -> Arc<Self> {
        self.state().queues.entry(name.to_owned()).or_default();
        self
    }

    pub fn with_binding(
        self: Arc<Self>,
        exchange: &str,
        queue: &str,
        routing_key: &str,
    ) -> Arc<Self> {
        {
            let mut state = self.state();
            state.exchanges.insert(exchange.to_owned());
            state.queues.entry(queue.to_owned()).or_default();
            state.bindings.push(
                QueueBinding::new(queue)
                    .exchange(exchange)
                    .routing_key(routing_key),
            );
        }
        self
    }

    pub fn enqueue(&self, queue: &str, properties: BasicProperties, data: &[u8]) {
        self.state()
            .queues
            .entry(queue.to_owned())
            .or_default()
            .push_back(Delivery {
                properties,
                data: data.to_vec(),
                ..Default::default()
            });
    }

    pub fn queue_len(&self, queue: &str) -> usize {
        self.state().queues.get(queue).map_or(0, VecDeque::len)
    }

    pub fn acked(&self) -> Vec<u64> {
        self.state().acked.clone()
    }

    pub fn published(&self) -> Vec<Published> {
        self.state().published.clone()
    }

    pub fn active_exchange_declares(&self) -> usize {
        self.state()
            .exchange_declares
            .iter()
            .filter(|def| !def.passive)
            .count()
    }

    pub fn passive_exchange_declares(&self) -> usize {
        self.state()
            .exchange_declares
            .iter()
            .filter(|def| def.passive)
            .count()
    }

    pub fn channels_created(&self) -> usize {
        self.state().channels_created
    }

    pub fn fail_publishing(&self, fail: bool) {
        self.state().fail_publishing = fail;
    }

    /// Makes every exchange declare fail with an access refusal.
    pub fn refuse_declares(&self, refuse: bool) {
        self.state().refuse_declares = refuse;
    }
}

pub(crate) struct FakeConnection {
    broker: Arc<FakeBroker>,
    open: AtomicBool,
    channels: Mutex<Vec<Arc<FakeChannel>>>,
}

impl FakeConnection {
    pub fn new(broker: Arc<FakeBroker>) -> Self {
        FakeConnection {
            broker,
            open: AtomicBool::new(true),
            channels: Mutex::new(vec![]),
        }
    }
}

#[async_trait]
impl AmqpConnection for FakeConnection {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn create_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        if !self.is_open() {
            return Err(AmqpError::ChannelError("connection closed".to_owned()));
        }

        self.broker.state().channels_created += 1;
        let channel = Arc::new(FakeChannel::new(self.broker.clone()));
        self.channels.lock().unwrap().push(channel.clone());
        Ok(channel)
    }

    async fn close(&self, _grace: Duration) -> Result<(), AmqpError> {
        self.open.store(false, Ordering::SeqCst);
        let channels: Vec<_> = self.channels.lock().unwrap().drain(..).collect();
        for channel in channels {
            channel.shutdown();
        }
        Ok(())
    }
}

pub(crate) struct FakeChannel {
    broker: Arc<FakeBroker>,
    open: Arc<AtomicBool>,
    cancelled: Arc<AtomicBool>,
    unacked: Arc<Mutex<Vec<(String, Delivery)>>>,
}

impl FakeChannel {
    fn new(broker: Arc<FakeBroker>) -> Self {
        FakeChannel {
            broker,
            open: Arc::new(AtomicBool::new(true)),
            cancelled: Arc::new(AtomicBool::new(false)),
            unacked: Arc::new(Mutex::new(vec![])),
        }
    }

    fn ensure_open(&self) -> Result<(), AmqpError> {
        if self.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(AmqpError::ChannelError("channel closed".to_owned()))
        }
    }

    fn shutdown(&self) {
        self.open.store(false, Ordering::SeqCst);
        let unacked: Vec<_> = self.unacked.lock().unwrap().drain(..).collect();
        let mut state = self.broker.state();
        for (queue, mut delivery) in unacked.into_iter().rev() {
            delivery.redelivered = true;
            state.queues.entry(queue).or_default().push_front(delivery);
        }
    }
}

#[async_trait]
impl AmqpChannel for FakeChannel {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn confirm_select(&self) -> Result<(), AmqpError> {
        self.ensure_open()
    }

    async fn exchange_declare(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        self.ensure_open()?;
        let mut state = self.broker.state();
        state.exchange_declares.push(def.clone());

        // a failed declare closes the channel, as on a real broker
        if state.refuse_declares {
            drop(state);
            self.shutdown();
            return Err(AmqpError::DeclareExchangeError(def.name.clone()));
        }

        if def.passive {
            if state.exchanges.contains(&def.name) {
                return Ok(());
            }
            drop(state);
            self.shutdown();
            return Err(AmqpError::ExchangeNotFound(def.name.clone()));
        }

        state.exchanges.insert(def.name.clone());
        Ok(())
    }

    async fn queue_declare(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        self.ensure_open()?;
        let mut state = self.broker.state();
        state.queue_declares.push(def.clone());
        state.queues.entry(def.name.clone()).or_default();
        Ok(())
    }

    async fn queue_bind(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        self.ensure_open()?;
        let mut state = self.broker.state();
        if !state.exchanges.contains(&binding.exchange_name)
            || !state.queues.contains_key(&binding.queue_name)
        {
            return Err(AmqpError::BindingExchangeToQueueError(
                binding.exchange_name.clone(),
                binding.queue_name.clone(),
            ));
        }
        if !state.bindings.contains(binding) {
            state.bindings.push(binding.clone());
        }
        Ok(())
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
        self.ensure_open()?;
        self.broker.state().qos.push(prefetch_count);
        Ok(())
    }

    async fn basic_consume(
        &self,
        queue: &str,
        _consumer_tag: &str,
    ) -> Result<DeliveryStream, AmqpError> {
        self.ensure_open()?;
        if !self.broker.state().queues.contains_key(queue) {
            return Err(AmqpError::BindingConsumerError(queue.to_owned()));
        }

        let seed = (
            self.broker.clone(),
            self.open.clone(),
            self.cancelled.clone(),
            self.unacked.clone(),
            queue.to_owned(),
        );

        Ok(stream::unfold(seed, |seed| async move {
            let (broker, open, cancelled, unacked, queue) = &seed;
            loop {
                if !open.load(Ordering::SeqCst) || cancelled.load(Ordering::SeqCst) {
                    return None;
                }

                let next = {
                    let mut state = broker.state();
                    let popped = state.queues.get_mut(queue).and_then(VecDeque::pop_front);
                    popped.map(|mut delivery| {
                        state.next_tag += 1;
                        delivery.delivery_tag = state.next_tag;
                        delivery
                    })
                };

                if let Some(delivery) = next {
                    unacked
                        .lock()
                        .unwrap()
                        .push((queue.clone(), delivery.clone()));
                    return Some((Ok(delivery), seed));
                }

                tokio::time::sleep(POLL).await;
            }
        })
        .boxed())
    }

    async fn basic_cancel(&self, _consumer_tag: &str) -> Result<(), AmqpError> {
        self.cancelled.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.ensure_open()?;
        let mut unacked = self.unacked.lock().unwrap();
        let position = unacked
            .iter()
            .position(|(_, delivery)| delivery.delivery_tag == delivery_tag)
            .ok_or(AmqpError::AckMessageError)?;
        unacked.remove(position);
        self.broker.state().acked.push(delivery_tag);
        Ok(())
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        self.ensure_open()?;
        let mut state = self.broker.state();
        if state.fail_publishing {
            return Err(AmqpError::PublishingError("broker refused the message".to_owned()));
        }
        if !state.exchanges.contains(exchange) {
            return Err(AmqpError::PublishingError(format!("no exchange `{}`", exchange)));
        }

        state.published.push(Published {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            properties: properties.clone(),
            data: payload.to_vec(),
        });

        let targets: Vec<String> = state
            .bindings
            .iter()
            .filter(|b| b.exchange_name == exchange && b.routing_key == routing_key)
            .map(|b| b.queue_name.clone())
            .collect();
        for queue in targets {
            state.queues.entry(queue).or_default().push_back(Delivery {
                exchange: exchange.to_owned(),
                routing_key: routing_key.to_owned(),
                properties: properties.clone(),
                data: payload.to_vec(),
                ..Default::default()
            });
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.shutdown();
        Ok(())
    }
}

/// Counts the connections it creates; an optional delay widens race windows.
pub(crate) struct FakeConnectionFactory {
    broker: Arc<FakeBroker>,
    created: AtomicUsize,
    delay: Duration,
}

impl FakeConnectionFactory {
    pub fn new(broker: Arc<FakeBroker>) -> Self {
        FakeConnectionFactory {
            broker,
            created: AtomicUsize::new(0),
            delay: Duration::ZERO,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConnectionFactory for FakeConnectionFactory {
    async fn create_connection(
        &self,
        _options: &RabbitMqOptions,
    ) -> Result<Arc<dyn AmqpConnection>, AmqpError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(FakeConnection::new(self.broker.clone())))
    }
}

/// Routes each cluster, by its `server`, to its own broker; unknown servers
/// are unreachable.
pub(crate) struct FakeClusterFactory {
    brokers: HashMap<String, Arc<FakeBroker>>,
}

impl FakeClusterFactory {
    pub fn new<'a>(brokers: impl IntoIterator<Item = (&'a str, Arc<FakeBroker>)>) -> Self {
        FakeClusterFactory {
            brokers: brokers
                .into_iter()
                .map(|(server, broker)| (server.to_owned(), broker))
                .collect(),
        }
    }
}

#[async_trait]
impl ConnectionFactory for FakeClusterFactory {
    async fn create_connection(
        &self,
        options: &RabbitMqOptions,
    ) -> Result<Arc<dyn AmqpConnection>, AmqpError> {
        match self.brokers.get(&options.server) {
            Some(broker) => Ok(Arc::new(FakeConnection::new(broker.clone()))),
            None => Err(AmqpError::BrokerUnreachable(options.server.clone())),
        }
    }
}
