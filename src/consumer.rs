// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Consumer
//!
//! This module subscribes handlers to queues and settles every delivery once
//! its handler finished:
//! 1. Deserializes the JSON body and opens a trace span
//! 2. Runs the handler and waits for it
//! 3. Acknowledges on success, unless the broker auto-acknowledged already
//! 4. Rejects on failure, requeueing only a message that was not redelivered yet
//!
//! The registry keeps at most one consumer per queue and remembers every
//! registration so it can be re-subscribed after a reconnect.

use crate::{
    client::RabbitMQClient,
    dispatcher::ConsumerWorker,
    errors::{AmqpError, HandlerError},
    otel,
    transport::{InboundDelivery, Transport},
};
use async_trait::async_trait;
use lapin::{types::AMQPValue, BasicProperties};
use opentelemetry::{
    global::BoxedTracer,
    trace::{Span, Status},
    Context,
};
use serde::de::DeserializeOwned;
use std::{borrow::Cow, collections::HashMap, sync::Arc};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// What the transport does with a message whose handler failed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RedeliveryPolicy {
    /// Requeue on the first failure, reject for good once the message was redelivered.
    #[default]
    TwoStrikes,
    /// Never requeue; failed messages go to the queue's dead-letter target.
    Never,
}

impl RedeliveryPolicy {
    pub fn should_requeue(&self, err: &HandlerError, redelivered: bool) -> bool {
        match self {
            RedeliveryPolicy::Never => false,
            RedeliveryPolicy::TwoStrikes => !err.is_terminal() && !redelivered,
        }
    }
}

/// Options of a consumer registration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumeOptions {
    /// The broker acknowledges on delivery; handler outcomes are not reported back.
    pub no_ack: bool,
    pub exclusive: bool,
    pub consumer_tag: Option<String>,
    pub redelivery: RedeliveryPolicy,
}

impl ConsumeOptions {
    pub fn no_ack(mut self) -> Self {
        self.no_ack = true;
        self
    }

    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    pub fn consumer_tag(mut self, tag: &str) -> Self {
        self.consumer_tag = Some(tag.to_owned());
        self
    }

    pub fn redelivery(mut self, policy: RedeliveryPolicy) -> Self {
        self.redelivery = policy;
        self
    }
}

/// A delivered message as seen by handlers.
#[derive(Debug, Clone)]
pub struct ConsumerMessage {
    pub queue: String,
    pub content: serde_json::Value,
    pub data: Vec<u8>,
    pub properties: BasicProperties,
    pub redelivered: bool,
    pub delivery_tag: u64,
}

impl ConsumerMessage {
    /// Builds the message of a delivery, with a null content when the body is
    /// not valid JSON.
    pub(crate) fn from_delivery(
        queue: &str,
        delivery: &InboundDelivery,
    ) -> (ConsumerMessage, Option<HandlerError>) {
        let (content, err) = match serde_json::from_slice(&delivery.data) {
            Ok(content) => (content, None),
            Err(err) => (
                serde_json::Value::Null,
                Some(HandlerError::Deserialize(err.to_string())),
            ),
        };

        let msg = ConsumerMessage {
            queue: queue.to_owned(),
            content,
            data: delivery.data.clone(),
            properties: delivery.properties.clone(),
            redelivered: delivery.redelivered,
            delivery_tag: delivery.delivery_tag,
        };

        (msg, err)
    }

    pub fn message_id(&self) -> Option<&str> {
        self.properties.message_id().as_ref().map(|id| id.as_str())
    }

    pub fn header(&self, key: &str) -> Option<&AMQPValue> {
        self.properties
            .headers()
            .as_ref()
            .and_then(|headers| headers.inner().get(key))
    }

    /// Deserializes the content into `T`.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, HandlerError> {
        serde_json::from_value(self.content.clone())
            .map_err(|err| HandlerError::Deserialize(err.to_string()))
    }
}

/// Processes messages delivered to a queue.
///
/// Returning `Err` is the only way to report a failure; the message is then rejected.
#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    async fn exec(&self, ctx: &Context, msg: &ConsumerMessage) -> Result<(), HandlerError>;

    /// Called instead of `exec` when the body is not valid JSON; `msg.content` is null.
    async fn malformed(
        &self,
        _ctx: &Context,
        _msg: &ConsumerMessage,
        err: HandlerError,
    ) -> Result<(), HandlerError> {
        Err(err)
    }
}

/// How a delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Acked,
    AutoAcked,
    Requeued,
    Rejected,
}

struct Registration {
    consumer_tag: String,
    handler: Arc<dyn ConsumerHandler>,
    options: ConsumeOptions,
    worker: Option<ConsumerWorker>,
}

/// Queue → consumer registrations of one client.
#[derive(Default)]
pub(crate) struct ConsumerRegistry {
    registrations: Mutex<HashMap<String, Registration>>,
}

impl ConsumerRegistry {
    pub(crate) async fn register(
        &self,
        transport: &dyn Transport,
        queue: &str,
        handler: Arc<dyn ConsumerHandler>,
        options: ConsumeOptions,
    ) -> Result<String, AmqpError> {
        let mut registrations = self.registrations.lock().await;
        if registrations.contains_key(queue) {
            warn!(queue, "queue already has a consumer");
            return Err(AmqpError::ConsumerAlreadyRegistered(queue.to_owned()));
        }

        let consumer_tag = options
            .consumer_tag
            .clone()
            .unwrap_or_else(|| format!("{}-{}", queue, Uuid::new_v4().simple()));

        let worker = subscribe(transport, queue, &consumer_tag, handler.clone(), &options).await?;

        registrations.insert(
            queue.to_owned(),
            Registration {
                consumer_tag: consumer_tag.clone(),
                handler,
                options,
                worker: Some(worker),
            },
        );

        info!(queue, consumer_tag, "consumer registered");
        Ok(consumer_tag)
    }

    /// Removes the registration of `queue`, waiting for its in-flight handler.
    pub(crate) async fn cancel(
        &self,
        transport: Option<&dyn Transport>,
        queue: &str,
    ) -> Result<(), AmqpError> {
        let Some(registration) = self.registrations.lock().await.remove(queue) else {
            debug!(queue, "no consumer to cancel");
            return Ok(());
        };

        let res = stop(transport, queue, registration).await;
        info!(queue, "consumer cancelled");
        res
    }

    pub(crate) async fn cancel_all(&self, transport: Option<&dyn Transport>) {
        let registrations: Vec<(String, Registration)> =
            self.registrations.lock().await.drain().collect();

        for (queue, registration) in registrations {
            if let Err(err) = stop(transport, &queue, registration).await {
                warn!(error = err.to_string(), queue, "failure to cancel consumer");
            }
        }
    }

    /// Subscribes every registration again on a new transport, cancelling it
    /// on `previous` first when that transport is still open.
    ///
    /// The registry lock is not held while in-flight handlers finish, so a
    /// handler may use the registry during a reconnect.
    pub(crate) async fn resubscribe(
        &self,
        previous: Option<&dyn Transport>,
        transport: &dyn Transport,
    ) {
        let moving: Vec<Resubscription> = self
            .registrations
            .lock()
            .await
            .iter_mut()
            .map(|(queue, registration)| Resubscription {
                queue: queue.clone(),
                consumer_tag: registration.consumer_tag.clone(),
                handler: registration.handler.clone(),
                options: registration.options.clone(),
                worker: registration.worker.take(),
            })
            .collect();

        for moved in moving {
            if let Some(previous) = previous {
                if let Err(err) = previous.basic_cancel(&moved.consumer_tag).await {
                    debug!(
                        error = err.to_string(),
                        queue = moved.queue,
                        "old consumer already gone"
                    );
                }
            }
            if let Some(worker) = moved.worker {
                worker.stop().await;
            }

            let worker = match subscribe(
                transport,
                &moved.queue,
                &moved.consumer_tag,
                moved.handler,
                &moved.options,
            )
            .await
            {
                Ok(worker) => worker,
                Err(err) => {
                    error!(
                        error = err.to_string(),
                        queue = moved.queue,
                        "failure to restore consumer"
                    );
                    continue;
                }
            };

            let orphan = match self.registrations.lock().await.get_mut(&moved.queue) {
                Some(registration)
                    if registration.consumer_tag == moved.consumer_tag
                        && registration.worker.is_none() =>
                {
                    registration.worker = Some(worker);
                    None
                }
                _ => Some(worker),
            };

            match orphan {
                None => info!(queue = moved.queue, "consumer restored"),
                Some(worker) => {
                    debug!(queue = moved.queue, "consumer cancelled while restoring");
                    let _ = transport.basic_cancel(&moved.consumer_tag).await;
                    worker.stop().await;
                }
            }
        }
    }

    pub(crate) async fn queues(&self) -> Vec<String> {
        self.registrations.lock().await.keys().cloned().collect()
    }
}

/// A registration on its way from one transport to the next.
struct Resubscription {
    queue: String,
    consumer_tag: String,
    handler: Arc<dyn ConsumerHandler>,
    options: ConsumeOptions,
    worker: Option<ConsumerWorker>,
}

async fn subscribe(
    transport: &dyn Transport,
    queue: &str,
    consumer_tag: &str,
    handler: Arc<dyn ConsumerHandler>,
    options: &ConsumeOptions,
) -> Result<ConsumerWorker, AmqpError> {
    let stream = transport
        .basic_consume(queue, consumer_tag, options.no_ack, options.exclusive)
        .await?;

    Ok(ConsumerWorker::spawn(
        queue.to_owned(),
        stream,
        handler,
        options.clone(),
    ))
}

async fn stop(
    transport: Option<&dyn Transport>,
    queue: &str,
    registration: Registration,
) -> Result<(), AmqpError> {
    let mut res = Ok(());
    if let Some(transport) = transport {
        res = transport.basic_cancel(&registration.consumer_tag).await;
    }

    if let Some(worker) = registration.worker {
        debug!(queue, "waiting for in-flight handler");
        worker.stop().await;
    }

    res
}

impl RabbitMQClient {
    /// Subscribes `handler` to `queue`. One registration per queue; cancel first
    /// to replace a handler.
    ///
    /// # Returns
    /// The consumer tag of the registration.
    pub async fn consume(
        &self,
        queue: &str,
        handler: Arc<dyn ConsumerHandler>,
        options: ConsumeOptions,
    ) -> Result<String, AmqpError> {
        let transport = self.transport()?;
        self.inner
            .registry
            .register(transport.as_ref(), queue, handler, options)
            .await
    }

    /// Cancels the consumer of `queue`, a no-op when there is none.
    ///
    /// Waits for the handler currently running for that queue, so it must not be
    /// called from inside that handler.
    pub async fn cancel_consumer(&self, queue: &str) -> Result<(), AmqpError> {
        let transport = self.current_transport();
        self.inner.registry.cancel(transport.as_deref(), queue).await
    }

    /// Queues with an active consumer registration.
    pub async fn consumers(&self) -> Vec<String> {
        self.inner.registry.queues().await
    }
}

/// Runs the handler for one delivery and settles it.
pub(crate) async fn consume(
    tracer: &BoxedTracer,
    queue: &str,
    delivery: InboundDelivery,
    handler: &dyn ConsumerHandler,
    options: &ConsumeOptions,
) -> Result<Settlement, AmqpError> {
    let (ctx, mut span) = otel::new_span(&delivery.properties, tracer, queue);
    let message_id = delivery
        .properties
        .message_id()
        .as_ref()
        .map(|id| id.to_string())
        .unwrap_or_default();

    debug!(
        queue,
        message_id,
        redelivered = delivery.redelivered,
        "received message"
    );

    let result = match ConsumerMessage::from_delivery(queue, &delivery) {
        (msg, None) => handler.exec(&ctx, &msg).await,
        (msg, Some(err)) => {
            warn!(queue, message_id, error = err.to_string(), "malformed message body");
            handler.malformed(&ctx, &msg, err).await
        }
    };

    let err = match result {
        Ok(()) => {
            if options.no_ack {
                span.set_status(Status::Ok);
                return Ok(Settlement::AutoAcked);
            }

            return match delivery.acker.ack().await {
                Err(e) => {
                    error!(queue, message_id, "error whiling ack msg");
                    span.record_error(&e);
                    span.set_status(Status::Error {
                        description: Cow::from("error to ack msg"),
                    });
                    Err(e)
                }
                _ => {
                    debug!(queue, message_id, "message successfully processed");
                    span.set_status(Status::Ok);
                    Ok(Settlement::Acked)
                }
            };
        }
        Err(err) => err,
    };

    span.record_error(&err);
    span.set_status(Status::Error {
        description: Cow::from(err.to_string()),
    });

    if options.no_ack {
        error!(
            queue,
            message_id,
            error = err.to_string(),
            "handler failure on an auto-acknowledged message"
        );
        return Ok(Settlement::AutoAcked);
    }

    let requeue = options.redelivery.should_requeue(&err, delivery.redelivered);
    warn!(
        queue,
        message_id,
        requeue,
        redelivered = delivery.redelivered,
        error = err.to_string(),
        "error whiling handling msg, rejecting"
    );

    match delivery.acker.reject(requeue).await {
        Err(e) => {
            error!(queue, message_id, "error whiling reject msg");
            span.record_error(&e);
            Err(e)
        }
        _ if requeue => Ok(Settlement::Requeued),
        _ => Ok(Settlement::Rejected),
    }
}
