// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Transport Abstraction
//!
//! The client never talks to lapin directly outside of the `channel` module.
//! Everything it needs from a live connection is expressed by the [`Connector`]
//! and [`Transport`] traits below, whose surface follows the AMQP channel
//! methods one to one.

use crate::errors::AmqpError;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use lapin::{
    options::{ExchangeDeclareOptions, QueueDeclareOptions},
    types::FieldTable,
    BasicProperties, ExchangeKind,
};
use std::sync::Arc;

/// Callback invoked by a transport when its connection fails.
pub type FailureNotifier = Arc<dyn Fn(AmqpError) + Send + Sync>;

/// Stream of deliveries for one consumer.
///
/// `Ok(None)` signals that the broker cancelled the consumer.
pub type DeliveryStream = BoxStream<'static, Result<Option<InboundDelivery>, AmqpError>>;

/// What the transport did with a published frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// The frame was taken and the outbound buffer has room left.
    Accepted,
    /// The frame was buffered but the outbound buffer is now full; callers
    /// must wait for [`Transport::wait_for_drain`] before writing again.
    BufferFull,
}

/// Broker-side state of a queue right after its declaration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueState {
    pub name: String,
    pub message_count: u32,
    pub consumer_count: u32,
}

/// Settles a single delivery.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<(), AmqpError>;

    async fn reject(&self, requeue: bool) -> Result<(), AmqpError>;
}

/// A message handed to a consumer together with its delivery metadata.
#[derive(Clone)]
pub struct InboundDelivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: BasicProperties,
    pub data: Vec<u8>,
    pub acker: Arc<dyn Acknowledger>,
}

impl std::fmt::Debug for InboundDelivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundDelivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("len", &self.data.len())
            .finish()
    }
}

/// One live channel over one live connection.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), AmqpError>;

    async fn exchange_declare(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeDeclareOptions,
        args: FieldTable,
    ) -> Result<(), AmqpError>;

    async fn queue_declare(
        &self,
        name: &str,
        options: QueueDeclareOptions,
        args: FieldTable,
    ) -> Result<QueueState, AmqpError>;

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        args: FieldTable,
    ) -> Result<(), AmqpError>;

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Vec<u8>,
        properties: BasicProperties,
    ) -> Result<PublishOutcome, AmqpError>;

    /// Resolves once the outbound buffer accepts writes again.
    async fn wait_for_drain(&self) -> Result<(), AmqpError>;

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        no_ack: bool,
        exclusive: bool,
    ) -> Result<DeliveryStream, AmqpError>;

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), AmqpError>;

    /// Closes the channel and then the connection.
    async fn close(&self) -> Result<(), AmqpError>;
}

/// Opens transports. One call, one connection, one channel.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, on_failure: FailureNotifier) -> Result<Arc<dyn Transport>, AmqpError>;
}
