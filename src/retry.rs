// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Retry and Dead Letter Engine
//!
//! Bounds how often one logical work item is processed. The attempt count
//! travels in the `x-retry-count` header: it starts at 0, every re-publish of
//! the same item carries exactly one more, and it is only ever reset by a
//! manual resubmission.
//!
//! The delay between two attempts is a broker primitive: failed items are
//! parked in `<queue>-retry`, whose message TTL dead-letters them back to the
//! processing queue. Items failing at the maximum attempt are recorded in the
//! [`DeadLetterStore`] and rejected into `<queue>-dlq`.
//!
//! The engine's attempt counter is the only retry mechanism for its queue: it
//! consumes with [`RedeliveryPolicy::Never`], so the transport never requeues a
//! work item on its own.

use crate::{
    client::RabbitMQClient,
    config::{RetryConfigs, DEFAULT_MAX_ATTEMPTS, DEFAULT_RETRY_DELAY_MS},
    consumer::{ConsumeOptions, ConsumerHandler, ConsumerMessage, RedeliveryPolicy},
    dead_letter::{DeadLetterRecord, DeadLetterStore},
    errors::{AmqpError, HandlerError},
    exchange::ExchangeDefinition,
    publisher::{PublishOptions, RabbitMQPublisher, JSON_CONTENT_TYPE},
    queue::QueueDefinition,
    topology::{AmqpTopology, Topology},
};
use async_trait::async_trait;
use lapin::{types::AMQPValue, BasicProperties};
use opentelemetry::Context;
use serde::Serialize;
use serde_json::json;
use std::{sync::Arc, time::Duration};
use tracing::{debug, error, info, warn};

/// Header carrying the attempt count of a work item
pub const RETRY_COUNT_HEADER: &str = "x-retry-count";
/// Header carrying the message id of the first publish of a work item
pub const ORIGINAL_MESSAGE_ID_HEADER: &str = "x-original-message-id";
/// Header carrying the failure reason of the previous attempt
pub const LAST_ERROR_HEADER: &str = "x-last-error";

/// Lifecycle of one work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkState {
    Pending,
    Processing { attempt: u32 },
    Succeeded { attempt: u32 },
    /// Parked for another try; `attempt` is the count the next execution sees.
    RetryScheduled { attempt: u32 },
    Dead { attempt: u32 },
}

impl WorkState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkState::Succeeded { .. } | WorkState::Dead { .. })
    }
}

/// State reached by an item processed at `attempt`.
pub fn next_state(attempt: u32, max_attempts: u32, succeeded: bool) -> WorkState {
    if succeeded {
        WorkState::Succeeded { attempt }
    } else if attempt < max_attempts {
        WorkState::RetryScheduled {
            attempt: attempt + 1,
        }
    } else {
        WorkState::Dead { attempt }
    }
}

/// Reads the attempt count of a message, 0 when absent or unreadable.
pub fn retry_count(props: &BasicProperties) -> u32 {
    let Some(value) = props
        .headers()
        .as_ref()
        .and_then(|headers| headers.inner().get(RETRY_COUNT_HEADER))
    else {
        return 0;
    };

    let count: i64 = match value {
        AMQPValue::ShortShortInt(v) => *v as i64,
        AMQPValue::ShortShortUInt(v) => *v as i64,
        AMQPValue::ShortInt(v) => *v as i64,
        AMQPValue::ShortUInt(v) => *v as i64,
        AMQPValue::LongInt(v) => *v as i64,
        AMQPValue::LongUInt(v) => *v as i64,
        AMQPValue::LongLongInt(v) => *v,
        AMQPValue::ShortString(v) => v.as_str().trim().parse().unwrap_or_default(),
        AMQPValue::LongString(v) => std::str::from_utf8(v.as_bytes())
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or_default(),
        _ => 0,
    };

    count.clamp(0, u32::MAX as i64) as u32
}

fn header_string(props: &BasicProperties, key: &str) -> Option<String> {
    match props.headers().as_ref()?.inner().get(key)? {
        AMQPValue::LongString(v) => Some(String::from_utf8_lossy(v.as_bytes()).into_owned()),
        AMQPValue::ShortString(v) => Some(v.to_string()),
        _ => None,
    }
}

/// Where success and failure events are published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRoutes {
    pub exchange: String,
    pub succeeded: String,
    pub failed: String,
}

/// Queue layout and limits of one retried work stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub queue: String,
    pub max_attempts: u32,
    pub retry_delay: Duration,
    pub events: Option<EventRoutes>,
}

impl RetryPolicy {
    pub fn new(queue: &str) -> RetryPolicy {
        RetryPolicy {
            queue: queue.to_owned(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
            events: None,
        }
    }

    pub fn from_configs(queue: &str, cfg: &RetryConfigs) -> RetryPolicy {
        RetryPolicy::new(queue)
            .max_attempts(cfg.max_attempts)
            .retry_delay(cfg.retry_delay())
    }

    pub fn max_attempts(mut self, max: u32) -> Self {
        self.max_attempts = max;
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Publishes success and failure events to `exchange` with the given keys.
    pub fn events(mut self, exchange: &str, succeeded: &str, failed: &str) -> Self {
        self.events = Some(EventRoutes {
            exchange: exchange.to_owned(),
            succeeded: succeeded.to_owned(),
            failed: failed.to_owned(),
        });
        self
    }

    /// The processing queue with its retry and dead-letter queues.
    pub fn queue_definition(&self) -> QueueDefinition {
        let ttl = self.retry_delay.as_millis().min(i32::MAX as u128) as i32;
        QueueDefinition::new(&self.queue).with_retry(ttl).with_dlq()
    }

    pub fn retry_queue(&self) -> String {
        format!("{}-retry", self.queue)
    }

    pub fn dead_letter_queue(&self) -> String {
        format!("{}-dlq", self.queue)
    }
}

/// A delivered work item and the attempt it is on.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub message: ConsumerMessage,
    pub attempt: u32,
    pub original_message_id: String,
}

/// The unit of work the engine retries.
#[async_trait]
pub trait WorkHandler: Send + Sync {
    /// Processes the item; the returned value is sent along with the success event.
    async fn process(&self, ctx: &Context, item: &WorkItem) -> Result<serde_json::Value, HandlerError>;
}

/// Retry/dead-letter state machine on top of the publisher and consumer registry.
pub struct RetryEngine {
    client: RabbitMQClient,
    publisher: Arc<RabbitMQPublisher>,
    policy: RetryPolicy,
    handler: Arc<dyn WorkHandler>,
    store: Arc<dyn DeadLetterStore>,
}

impl RetryEngine {
    pub fn new(
        client: RabbitMQClient,
        policy: RetryPolicy,
        handler: Arc<dyn WorkHandler>,
        store: Arc<dyn DeadLetterStore>,
    ) -> Arc<RetryEngine> {
        Arc::new(RetryEngine {
            publisher: RabbitMQPublisher::new(client.clone()),
            client,
            policy,
            handler,
            store,
        })
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Declares the processing, retry and dead-letter queues and the events exchange.
    pub async fn install(&self) -> Result<(), AmqpError> {
        let mut topology = AmqpTopology::new(self.client.clone()).queue(self.policy.queue_definition());

        if let Some(events) = &self.policy.events {
            topology = topology.exchange(ExchangeDefinition::new(&events.exchange).topic());
        }

        topology.install().await
    }

    /// Starts consuming the processing queue.
    pub async fn start(self: &Arc<Self>) -> Result<String, AmqpError> {
        let handler: Arc<dyn ConsumerHandler> = self.clone();
        self.client
            .consume(
                &self.policy.queue,
                handler,
                ConsumeOptions::default().redelivery(RedeliveryPolicy::Never),
            )
            .await
    }

    pub async fn stop(&self) -> Result<(), AmqpError> {
        self.client.cancel_consumer(&self.policy.queue).await
    }

    /// Publishes a new work item at attempt 0.
    pub async fn submit<T>(&self, item: &T) -> Result<String, AmqpError>
    where
        T: Serialize + ?Sized,
    {
        self.publisher
            .send_to_queue(
                &self.policy.queue,
                item,
                PublishOptions::default().header(RETRY_COUNT_HEADER, 0i32),
            )
            .await
    }

    /// Takes a dead item out of the store and submits it again at attempt 0.
    ///
    /// Returns `None` when no record matches `message_id`.
    pub async fn resubmit(&self, message_id: &str) -> Result<Option<String>, AmqpError> {
        let Some(record) = self.store.take(message_id).await? else {
            return Ok(None);
        };

        let options = PublishOptions::default()
            .header(RETRY_COUNT_HEADER, 0i32)
            .header(ORIGINAL_MESSAGE_ID_HEADER, record.original_message_id.as_str());

        match self
            .publisher
            .send_to_queue(&self.policy.queue, &record.payload, options)
            .await
        {
            Ok(id) => {
                info!(
                    queue = self.policy.queue,
                    message_id = id,
                    original_message_id = record.original_message_id,
                    "dead work item resubmitted"
                );
                Ok(Some(id))
            }
            Err(err) => {
                // keep the record for the next attempt
                self.store.record(record).await?;
                Err(err)
            }
        }
    }

    fn work_item(&self, msg: &ConsumerMessage) -> WorkItem {
        let original_message_id = header_string(&msg.properties, ORIGINAL_MESSAGE_ID_HEADER)
            .or_else(|| msg.message_id().map(str::to_owned))
            .unwrap_or_default();

        WorkItem {
            message: msg.clone(),
            attempt: retry_count(&msg.properties),
            original_message_id,
        }
    }

    async fn fail(&self, item: &WorkItem, err: HandlerError) -> Result<(), HandlerError> {
        match next_state(item.attempt, self.policy.max_attempts, false) {
            WorkState::RetryScheduled { attempt } => match self.schedule_retry(item, attempt, &err).await {
                Ok(message_id) => {
                    warn!(
                        queue = self.policy.queue,
                        message_id,
                        attempt,
                        error = err.to_string(),
                        "work item failed, retry scheduled"
                    );
                    Ok(())
                }
                Err(publish_err) => {
                    error!(
                        queue = self.policy.queue,
                        error = publish_err.to_string(),
                        "failure to schedule retry, dead-lettering"
                    );
                    let dead = HandlerError::terminal(format!(
                        "{}; retry not scheduled: {}",
                        err.reason(),
                        publish_err
                    ));
                    self.bury(item, &dead).await;
                    Err(dead)
                }
            },
            _ => {
                self.bury(item, &err).await;
                Err(HandlerError::terminal(err.reason()))
            }
        }
    }

    async fn schedule_retry(
        &self,
        item: &WorkItem,
        attempt: u32,
        err: &HandlerError,
    ) -> Result<String, AmqpError> {
        let props = &item.message.properties;
        let mut options = PublishOptions::default()
            .content_type(
                props
                    .content_type()
                    .as_ref()
                    .map(|ct| ct.as_str())
                    .unwrap_or(JSON_CONTENT_TYPE),
            )
            .header(RETRY_COUNT_HEADER, attempt.min(i32::MAX as u32) as i32)
            .header(ORIGINAL_MESSAGE_ID_HEADER, item.original_message_id.as_str())
            .header(LAST_ERROR_HEADER, err.reason());

        if let Some(kind) = props.kind() {
            options = options.msg_type(kind.as_str());
        }

        self.publisher
            .publish_bytes("", &self.policy.retry_queue(), item.message.data.clone(), options)
            .await
    }

    async fn bury(&self, item: &WorkItem, err: &HandlerError) {
        let payload = match &item.message.content {
            serde_json::Value::Null => {
                serde_json::Value::String(String::from_utf8_lossy(&item.message.data).into_owned())
            }
            content => content.clone(),
        };

        let record = DeadLetterRecord {
            message_id: item.message.message_id().unwrap_or_default().to_owned(),
            original_message_id: item.original_message_id.clone(),
            queue: self.policy.queue.clone(),
            payload,
            retry_count: item.attempt,
            error: err.reason().to_owned(),
            failed_at: chrono::Utc::now(),
        };

        error!(
            queue = self.policy.queue,
            message_id = record.message_id,
            retry_count = item.attempt,
            error = record.error,
            "work item is dead"
        );

        if let Err(store_err) = self.store.record(record).await {
            error!(error = store_err.to_string(), "failure to record dead work item");
        }

        if let Some(events) = &self.policy.events {
            let event = json!({
                "messageId": item.original_message_id,
                "queue": self.policy.queue,
                "retryCount": item.attempt,
                "error": err.reason(),
            });
            self.publish_event(&events.exchange, &events.failed, &event).await;
        }
    }

    async fn publish_event(&self, exchange: &str, routing_key: &str, event: &serde_json::Value) {
        if let Err(err) = self
            .publisher
            .publish(exchange, routing_key, event, PublishOptions::default())
            .await
        {
            error!(
                error = err.to_string(),
                exchange, routing_key, "failure to publish work item event"
            );
        }
    }
}

#[async_trait]
impl ConsumerHandler for RetryEngine {
    async fn exec(&self, ctx: &Context, msg: &ConsumerMessage) -> Result<(), HandlerError> {
        let item = self.work_item(msg);
        debug!(
            queue = self.policy.queue,
            message_id = item.original_message_id,
            attempt = item.attempt,
            "processing work item"
        );

        match self.handler.process(ctx, &item).await {
            Ok(result) => {
                info!(
                    queue = self.policy.queue,
                    message_id = item.original_message_id,
                    attempt = item.attempt,
                    "work item succeeded"
                );

                if let Some(events) = &self.policy.events {
                    let event = json!({
                        "messageId": item.original_message_id,
                        "queue": self.policy.queue,
                        "attempt": item.attempt,
                        "result": result,
                    });
                    self.publish_event(&events.exchange, &events.succeeded, &event)
                        .await;
                }

                Ok(())
            }
            Err(err) => self.fail(&item, err).await,
        }
    }

    async fn malformed(
        &self,
        _ctx: &Context,
        msg: &ConsumerMessage,
        err: HandlerError,
    ) -> Result<(), HandlerError> {
        let item = self.work_item(msg);
        self.fail(&item, err).await
    }
}
