// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Settix Queue Consumer
//!
//! A [`SettixConsumer`] owns one channel and consumes one queue:
//!
//! ```text
//! Created --configure--> Attached --stop--> Draining --> Stopped
//!                           |                              ^
//!                           +------ subscription lost -----+
//! ```
//!
//! Deliveries are handled one at a time with prefetch 1 and manual
//! acknowledgement. The contract id travels in the `settix-message-type`
//! header and selects the decoder through the [`ContractRegistry`]. Every
//! delivery is acknowledged once the dispatch attempt is over, whatever its
//! outcome, a panicking handler included; failures are logged together with
//! the base64 encoded payload.
//! A delivery is only lost to the broker once it has been acknowledged, so a
//! channel that closes mid-processing leaves the message to be redelivered.
//!
//! `stop` cancels the subscription, waits until the in-flight delivery (if
//! any) is done and only then closes the channel.

use crate::{
    channel::{AmqpChannel, Delivery, DeliveryStream},
    config::ConsumerOptions,
    dispatcher::{ContractRegistry, DispatchError},
    errors::AmqpError,
    naming::MESSAGE_TYPE_HEADER,
    otel,
};
use base64::{prelude::BASE64_STANDARD, Engine};
use futures_util::{FutureExt, StreamExt};
use lapin::{types::AMQPValue, BasicProperties};
use opentelemetry::{
    global::{self, BoxedTracer},
    trace::{Span, Status},
    Context,
};
use std::{
    any::Any,
    borrow::Cow,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicBool, AtomicU8, Ordering},
        Arc,
    },
};
use tokio::{
    sync::{watch, Mutex},
    task::JoinHandle,
    time::Instant,
};
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Lifecycle of a [`SettixConsumer`]. A consumer only moves forward, except
/// back to `Created` when attaching fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Created,
    Attached,
    Draining,
    Stopped,
}

impl ConsumerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConsumerState::Created,
            1 => ConsumerState::Attached,
            2 => ConsumerState::Draining,
            _ => ConsumerState::Stopped,
        }
    }
}

/// Handshake between the delivery loop and `stop`.
///
/// The loop raises `busy` before checking `accepting`; `stop` lowers
/// `accepting` before polling `busy`. With sequentially consistent ordering
/// either the loop sees the stop and skips the delivery, or `stop` sees the
/// loop busy and waits for it.
#[derive(Debug)]
struct Activity {
    busy: AtomicBool,
    accepting: AtomicBool,
}

/// Consumes one service queue on a dedicated channel and hands every
/// delivery to the contract registry, one at a time.
pub struct SettixConsumer {
    channel: Arc<dyn AmqpChannel>,
    registry: Arc<ContractRegistry>,
    options: ConsumerOptions,
    consumer_tag: String,
    state: Arc<AtomicU8>,
    activity: Arc<Activity>,
    stop_signal: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SettixConsumer {
    /// Creates a consumer in the `Created` state. Nothing is subscribed until
    /// [`configure`](Self::configure) is called.
    ///
    /// # Parameters
    /// * `channel` - Channel the consumer owns and closes on stop
    /// * `registry` - Contract registry deliveries are dispatched through
    /// * `options` - Prefetch count applied before subscribing
    pub fn new(
        channel: Arc<dyn AmqpChannel>,
        registry: Arc<ContractRegistry>,
        options: ConsumerOptions,
    ) -> Self {
        let (stop_signal, _) = watch::channel(false);

        SettixConsumer {
            channel,
            registry,
            options,
            consumer_tag: format!("settix-{}", Uuid::new_v4()),
            state: Arc::new(AtomicU8::new(ConsumerState::Created as u8)),
            activity: Arc::new(Activity {
                busy: AtomicBool::new(false),
                accepting: AtomicBool::new(true),
            }),
            stop_signal,
            task: Mutex::new(None),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConsumerState {
        ConsumerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Attached and still holding an open channel.
    ///
    /// # Returns
    /// `false` once the consumer stopped or its connection was lost, in which
    /// case it must be replaced
    pub fn is_active(&self) -> bool {
        self.state() == ConsumerState::Attached && self.channel.is_open()
    }

    fn transition(&self, from: ConsumerState, to: ConsumerState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Starts consuming `queue`.
    ///
    /// Applies the prefetch count, subscribes and spawns the delivery loop.
    ///
    /// # Parameters
    /// * `queue` - Name of the service queue, which must already exist
    ///
    /// # Returns
    /// Ok(()) once subscribed, or `ConsumerError` when the consumer is not in
    /// the `Created` state. A failed subscription leaves it `Created`.
    pub async fn configure(&self, queue: &str) -> Result<(), AmqpError> {
        if !self.transition(ConsumerState::Created, ConsumerState::Attached) {
            return Err(AmqpError::ConsumerError(format!(
                "cannot attach a consumer in state {:?}",
                self.state()
            )));
        }

        let deliveries = match self.subscribe(queue).await {
            Ok(deliveries) => deliveries,
            Err(err) => {
                self.transition(ConsumerState::Attached, ConsumerState::Created);
                return Err(err);
            }
        };

        let worker = Worker {
            channel: self.channel.clone(),
            registry: self.registry.clone(),
            activity: self.activity.clone(),
            state: self.state.clone(),
            queue: queue.to_owned(),
        };
        let handle = tokio::spawn(worker.run(deliveries, self.stop_signal.subscribe()));
        *self.task.lock().await = Some(handle);

        debug!(queue, tag = self.consumer_tag, "consumer attached");
        Ok(())
    }

    async fn subscribe(&self, queue: &str) -> Result<DeliveryStream, AmqpError> {
        self.channel.basic_qos(self.options.prefetch_count).await?;
        self.channel.basic_consume(queue, &self.consumer_tag).await
    }

    /// Detaches from the queue, waits for the in-flight delivery and closes
    /// the channel. Calling it again once stopping has begun is a no-op.
    ///
    /// The wait is bounded by the drain timeout of the consumer options; when
    /// it elapses the delivery loop is aborted and its message is left
    /// unacknowledged for redelivery.
    pub async fn stop(&self) {
        if self.state() == ConsumerState::Stopped {
            // Detached by the delivery loop, which has already returned.
            if let Some(handle) = self.task.lock().await.take() {
                self.close_channel().await;
                if let Err(err) = handle.await {
                    warn!(error = err.to_string(), "consumer task ended abnormally");
                }
            }
            return;
        }
        if self.transition(ConsumerState::Created, ConsumerState::Stopped) {
            self.close_channel().await;
            return;
        }
        if !self.transition(ConsumerState::Attached, ConsumerState::Draining) {
            return;
        }

        self.activity.accepting.store(false, Ordering::SeqCst);
        self.stop_signal.send_replace(true);
        if let Err(err) = self.channel.basic_cancel(&self.consumer_tag).await {
            warn!(error = err.to_string(), tag = self.consumer_tag, "failure to cancel consumer");
        }

        let drained = self.drain().await;
        self.close_channel().await;

        if let Some(handle) = self.task.lock().await.take() {
            if drained {
                if let Err(err) = handle.await {
                    warn!(error = err.to_string(), "consumer task ended abnormally");
                }
            } else {
                handle.abort();
            }
        }

        self.state
            .store(ConsumerState::Stopped as u8, Ordering::SeqCst);
        debug!(tag = self.consumer_tag, "consumer stopped");
    }

    async fn drain(&self) -> bool {
        let started = Instant::now();
        while self.activity.busy.load(Ordering::SeqCst) {
            if let Some(max) = self.options.max_drain_wait {
                if started.elapsed() >= max {
                    warn!(
                        max_drain_wait_ms = max.as_millis() as u64,
                        "in-flight message still running, aborting the channel"
                    );
                    return false;
                }
            }
            tokio::time::sleep(self.options.drain_poll_interval).await;
        }
        true
    }

    async fn close_channel(&self) {
        if let Err(err) = self.channel.close().await {
            warn!(error = err.to_string(), "failure to close consumer channel");
        }
    }
}

struct Worker {
    channel: Arc<dyn AmqpChannel>,
    registry: Arc<ContractRegistry>,
    activity: Arc<Activity>,
    state: Arc<AtomicU8>,
    queue: String,
}

impl Worker {
    async fn run(self, mut deliveries: DeliveryStream, mut stop: watch::Receiver<bool>) {
        let tracer = global::tracer("settix consumer");

        loop {
            let next = tokio::select! {
                biased;
                _ = stop.changed() => break,
                next = deliveries.next() => next,
            };

            let delivery = match next {
                Some(Ok(delivery)) => delivery,
                Some(Err(err)) => {
                    error!(error = err.to_string(), queue = self.queue, "errors consume msg");
                    continue;
                }
                None => {
                    self.detach();
                    break;
                }
            };

            self.activity.busy.store(true, Ordering::SeqCst);
            if !self.activity.accepting.load(Ordering::SeqCst) {
                // left unacked, the broker requeues it when the channel closes
                self.activity.busy.store(false, Ordering::SeqCst);
                break;
            }

            consume(&tracer, &delivery, &self.registry, self.channel.as_ref(), &self.queue).await;
            self.activity.busy.store(false, Ordering::SeqCst);
        }
    }

    /// The broker ended the subscription without a stop: the channel or its
    /// connection is gone and the consumer can no longer receive anything.
    fn detach(&self) {
        let detached = self
            .state
            .compare_exchange(
                ConsumerState::Attached as u8,
                ConsumerState::Stopped as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok();

        if detached {
            warn!(queue = self.queue, "delivery stream ended, consumer detached");
        } else {
            debug!(queue = self.queue, "delivery stream ended");
        }
    }
}

/// Dispatches one delivery and acknowledges it.
pub(crate) async fn consume(
    tracer: &BoxedTracer,
    delivery: &Delivery,
    registry: &ContractRegistry,
    channel: &dyn AmqpChannel,
    queue: &str,
) {
    let contract = contract_id(&delivery.properties);
    let span_name = contract.as_deref().unwrap_or("unknown").to_owned();

    let (ctx, mut span) = otel::new_span(&delivery.properties, tracer, &span_name);

    debug!(
        queue,
        contract = span_name,
        redelivered = delivery.redelivered,
        "received message"
    );

    let result = match contract {
        Ok(id) => dispatch_isolated(registry, &ctx, &id, &delivery.data).await,
        Err(err) => Err(err),
    };

    match result {
        Ok(()) => {
            debug!(queue, contract = span_name, "message successfully processed");
            span.set_status(Status::Ok);
        }
        Err(err) => {
            error!(
                error = err.to_string(),
                queue,
                contract = span_name,
                payload = BASE64_STANDARD.encode(&delivery.data),
                "failure to handle message, removing it from queue"
            );
            span.record_error(&err);
            span.set_status(Status::Error {
                description: Cow::from(err.to_string()),
            });
        }
    }

    if !channel.is_open() {
        warn!(queue, "channel closed before ack, message will be redelivered");
        return;
    }

    if let Err(err) = channel.basic_ack(delivery.delivery_tag).await {
        error!(error = err.to_string(), queue, "error whiling ack msg");
        span.record_error(&err);
        span.set_status(Status::Error {
            description: Cow::from("error to ack msg"),
        });
    }
}

/// Dispatches with handler panics turned into dispatch failures.
async fn dispatch_isolated(
    registry: &ContractRegistry,
    ctx: &Context,
    contract_id: &str,
    body: &[u8],
) -> Result<(), DispatchError> {
    match AssertUnwindSafe(registry.dispatch(ctx, contract_id, body))
        .catch_unwind()
        .await
    {
        Ok(dispatched) => dispatched.map(|_| ()),
        Err(panic) => Err(DispatchError::HandlerError(format!(
            "handler panicked: {}",
            panic_message(panic.as_ref())
        ))),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        *message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown cause"
    }
}

/// Reads the contract id from the message-type header.
fn contract_id(props: &BasicProperties) -> Result<String, DispatchError> {
    let value = props
        .headers()
        .as_ref()
        .and_then(|headers| headers.inner().get(MESSAGE_TYPE_HEADER))
        .ok_or(DispatchError::MissingContract)?;

    let bytes = match value {
        AMQPValue::LongString(value) => value.as_bytes(),
        AMQPValue::ShortString(value) => value.as_str().as_bytes(),
        _ => return Err(DispatchError::InvalidContractHeader),
    };

    std::str::from_utf8(bytes)
        .map(str::to_owned)
        .map_err(|_| DispatchError::InvalidContractHeader)
}
