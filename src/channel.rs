// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! This module handles the creation and management of lapin connections and
//! channels, and exposes them to the rest of the crate through the
//! [`Transport`] and [`Connector`] traits.

use crate::{
    config::RabbitMQConfigs,
    errors::AmqpError,
    transport::{
        Acknowledger, Connector, DeliveryStream, FailureNotifier, InboundDelivery, PublishOutcome,
        QueueState, Transport,
    },
};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use lapin::{
    acker::Acker,
    message::Delivery,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions,
        BasicQosOptions, BasicRejectOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    types::{FieldTable, LongString},
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use std::sync::Arc;
use tracing::{debug, error};

/// AMQP reply code for a normal shutdown.
const REPLY_SUCCESS: u16 = 200;

/// Creates a new AMQP channel for communication with RabbitMQ.
///
/// This function establishes a connection to RabbitMQ using configuration parameters
/// provided in the `cfg` argument, then creates a channel on that connection.
/// Both the connection and channel are wrapped in Arc for thread-safe sharing.
///
/// # Parameters
/// * `cfg` - Configuration containing RabbitMQ connection details like host, port, credentials, etc.
///
/// # Returns
/// * `Result<(Arc<Connection>, Arc<Channel>), AmqpError>` -
///   A tuple containing the connection and channel on success, or an error on failure.
pub async fn new_amqp_channel(
    cfg: &RabbitMQConfigs,
) -> Result<(Arc<Connection>, Arc<Channel>), AmqpError> {
    debug!(host = cfg.host, port = cfg.port, "creating amqp connection...");
    let options = ConnectionProperties::default()
        .with_connection_name(LongString::from(cfg.connection_name.clone()));

    let conn = match Connection::connect(&cfg.uri(), options).await {
        Ok(c) => Ok(c),
        Err(err) => {
            error!(error = err.to_string(), "failure to connect");
            Err(AmqpError::ConnectionError(err.to_string()))
        }
    }?;
    debug!("amqp connected");

    debug!("creating amqp channel...");
    match conn.create_channel().await {
        Ok(c) => {
            debug!("channel created");
            Ok((Arc::new(conn), Arc::new(c)))
        }
        Err(err) => {
            error!(error = err.to_string(), "error to create the channel");
            Err(AmqpError::ChannelError)
        }
    }
}

/// Opens lapin-backed transports from the client configuration.
pub struct LapinConnector {
    cfg: RabbitMQConfigs,
}

impl LapinConnector {
    pub fn new(cfg: RabbitMQConfigs) -> Arc<LapinConnector> {
        Arc::new(LapinConnector { cfg })
    }
}

#[async_trait]
impl Connector for LapinConnector {
    async fn open(&self, on_failure: FailureNotifier) -> Result<Arc<dyn Transport>, AmqpError> {
        let (conn, channel) = new_amqp_channel(&self.cfg).await?;

        let connection_failure = on_failure.clone();
        conn.on_error(move |err| {
            error!(error = err.to_string(), "amqp connection failure");
            connection_failure(AmqpError::ConnectionError(err.to_string()));
        });

        let watch = ChannelWatch {
            channel: channel.clone(),
            on_failure,
        };
        Ok(Arc::new(LapinTransport {
            conn,
            channel,
            watch,
        }))
    }
}

/// A lapin connection and its single channel.
pub struct LapinTransport {
    conn: Arc<Connection>,
    channel: Arc<Channel>,
    watch: ChannelWatch,
}

/// Reports a channel closed by the broker while its connection stays up.
/// lapin's `on_error` only fires for the connection.
#[derive(Clone)]
struct ChannelWatch {
    channel: Arc<Channel>,
    on_failure: FailureNotifier,
}

impl ChannelWatch {
    fn check(&self, err: &lapin::Error) {
        if channel_closed(err, self.channel.status().connected()) {
            error!(error = err.to_string(), "amqp channel closed");
            (self.on_failure)(AmqpError::ChannelClosed(err.to_string()));
        }
    }
}

fn channel_closed(err: &lapin::Error, connected: bool) -> bool {
    matches!(err, lapin::Error::InvalidChannelState(_)) || !connected
}

struct LapinAcker {
    acker: Acker,
    watch: ChannelWatch,
}

#[async_trait]
impl Acknowledger for LapinAcker {
    async fn ack(&self) -> Result<(), AmqpError> {
        self.acker
            .ack(BasicAckOptions { multiple: false })
            .await
            .map(|_| ())
            .map_err(|err| {
                self.watch.check(&err);
                error!(error = err.to_string(), "error whiling ack msg");
                AmqpError::AckMessageError
            })
    }

    async fn reject(&self, requeue: bool) -> Result<(), AmqpError> {
        self.acker
            .reject(BasicRejectOptions { requeue })
            .await
            .map(|_| ())
            .map_err(|err| {
                self.watch.check(&err);
                error!(error = err.to_string(), requeue, "error whiling reject msg");
                AmqpError::NackMessageError
            })
    }
}

impl ChannelWatch {
    fn inbound(&self, delivery: Delivery) -> InboundDelivery {
        InboundDelivery {
            delivery_tag: delivery.delivery_tag,
            exchange: delivery.exchange.to_string(),
            routing_key: delivery.routing_key.to_string(),
            redelivered: delivery.redelivered,
            properties: delivery.properties,
            data: delivery.data,
            acker: Arc::new(LapinAcker {
                acker: delivery.acker,
                watch: self.clone(),
            }),
        }
    }
}

#[async_trait]
impl Transport for LapinTransport {
    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions { global: false })
            .await
            .map_err(|err| {
                self.watch.check(&err);
                error!(error = err.to_string(), "failure to configure qos");
                AmqpError::QoSDeclarationError(err.to_string())
            })
    }

    async fn exchange_declare(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeDeclareOptions,
        args: FieldTable,
    ) -> Result<(), AmqpError> {
        self.channel
            .exchange_declare(name, kind, options, args)
            .await
            .map_err(|err| {
                self.watch.check(&err);
                error!(error = err.to_string(), name, "error to declare the exchange");
                AmqpError::DeclareExchangeError(name.to_owned())
            })
    }

    async fn queue_declare(
        &self,
        name: &str,
        options: QueueDeclareOptions,
        args: FieldTable,
    ) -> Result<QueueState, AmqpError> {
        match self.channel.queue_declare(name, options, args).await {
            Ok(queue) => Ok(QueueState {
                name: queue.name().to_string(),
                message_count: queue.message_count(),
                consumer_count: queue.consumer_count(),
            }),
            Err(err) => {
                self.watch.check(&err);
                error!(error = err.to_string(), name, "error to declare the queue");
                Err(AmqpError::DeclareQueueError(name.to_owned()))
            }
        }
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        args: FieldTable,
    ) -> Result<(), AmqpError> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions { nowait: false },
                args,
            )
            .await
            .map_err(|err| {
                self.watch.check(&err);
                error!(error = err.to_string(), "error to bind queue to exchange");
                AmqpError::BindingExchangeToQueueError(exchange.to_owned(), queue.to_owned())
            })
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Vec<u8>,
        properties: BasicProperties,
    ) -> Result<PublishOutcome, AmqpError> {
        // lapin resolves once the frame is handed to its io loop, which does its own socket flow control
        match self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                &payload,
                properties,
            )
            .await
        {
            Err(err) => {
                self.watch.check(&err);
                error!(error = err.to_string(), "error publishing message");
                Err(AmqpError::PublishingError)
            }
            _ => Ok(PublishOutcome::Accepted),
        }
    }

    async fn wait_for_drain(&self) -> Result<(), AmqpError> {
        Ok(())
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        no_ack: bool,
        exclusive: bool,
    ) -> Result<DeliveryStream, AmqpError> {
        let consumer = match self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack,
                    exclusive,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                self.watch.check(&err);
                error!(error = err.to_string(), "error to create the consumer");
                Err(AmqpError::BindingConsumerError(queue.to_owned()))
            }
            Ok(c) => Ok(c),
        }?;

        // lapin ends the stream when the broker cancels the consumer
        let watch = self.watch.clone();
        let deliveries = consumer
            .map(move |result| match result {
                Ok(delivery) => Ok(Some(watch.inbound(delivery))),
                Err(err) => {
                    watch.check(&err);
                    Err(AmqpError::ConsumerError(err.to_string()))
                }
            })
            .chain(stream::once(async { Ok(None) }));

        Ok(deliveries.boxed())
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions { nowait: false })
            .await
            .map_err(|err| {
                self.watch.check(&err);
                error!(error = err.to_string(), consumer_tag, "error to cancel the consumer");
                AmqpError::CancelConsumerError(consumer_tag.to_owned())
            })
    }

    async fn close(&self) -> Result<(), AmqpError> {
        let channel = self.channel.close(REPLY_SUCCESS, "client closing").await;
        let conn = self.conn.close(REPLY_SUCCESS, "client closing").await;

        match (channel, conn) {
            (Ok(_), Ok(_)) => Ok(()),
            (Err(err), _) | (_, Err(err)) => Err(AmqpError::CloseError(err.to_string())),
        }
    }
}
