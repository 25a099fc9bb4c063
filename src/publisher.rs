// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Publisher
//!
//! This module serializes messages and hands them to the client's channel,
//! either through an exchange or straight to a queue. Every message gets
//! persistent delivery, a JSON content type, a timestamp and a unique message
//! id unless the caller overrides them.
//!
//! When the transport reports its outbound buffer full, publishing on the
//! channel is suspended until the buffer drains; the pending publish call only
//! completes after that.

use crate::{
    client::RabbitMQClient,
    errors::AmqpError,
    otel,
    transport::PublishOutcome,
};
use lapin::{
    types::{AMQPValue, FieldTable, LongInt, LongLongInt, LongString, LongUInt, ShortString},
    BasicProperties,
};
use serde::Serialize;
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";
/// AMQP delivery mode of messages that survive a broker restart
pub const PERSISTENT_DELIVERY_MODE: u8 = 2;
/// AMQP delivery mode of messages kept in memory only
pub const TRANSIENT_DELIVERY_MODE: u8 = 1;

/// Header value accepted by the publisher.
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValues {
    ShortString(String),
    LongString(String),
    Int(i32),
    LongLongInt(i64),
    Uint(u32),
    Bool(bool),
}

impl From<&str> for HeaderValues {
    fn from(v: &str) -> Self {
        HeaderValues::LongString(v.to_owned())
    }
}

impl From<String> for HeaderValues {
    fn from(v: String) -> Self {
        HeaderValues::LongString(v)
    }
}

impl From<i32> for HeaderValues {
    fn from(v: i32) -> Self {
        HeaderValues::Int(v)
    }
}

impl From<i64> for HeaderValues {
    fn from(v: i64) -> Self {
        HeaderValues::LongLongInt(v)
    }
}

impl From<u32> for HeaderValues {
    fn from(v: u32) -> Self {
        HeaderValues::Uint(v)
    }
}

impl From<bool> for HeaderValues {
    fn from(v: bool) -> Self {
        HeaderValues::Bool(v)
    }
}

impl From<HeaderValues> for AMQPValue {
    fn from(value: HeaderValues) -> Self {
        match value {
            HeaderValues::ShortString(v) => AMQPValue::ShortString(ShortString::from(v)),
            HeaderValues::LongString(v) => AMQPValue::LongString(LongString::from(v)),
            HeaderValues::Int(v) => AMQPValue::LongInt(LongInt::from(v)),
            HeaderValues::LongLongInt(v) => AMQPValue::LongLongInt(LongLongInt::from(v)),
            HeaderValues::Uint(v) => AMQPValue::LongUInt(LongUInt::from(v)),
            HeaderValues::Bool(v) => AMQPValue::Boolean(v),
        }
    }
}

/// Per-message overrides of the publisher defaults.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    pub content_type: Option<String>,
    pub persistent: Option<bool>,
    pub timestamp: Option<u64>,
    pub message_id: Option<String>,
    pub msg_type: Option<String>,
    pub headers: HashMap<String, HeaderValues>,
}

impl PublishOptions {
    pub fn content_type(mut self, content_type: &str) -> Self {
        self.content_type = Some(content_type.to_owned());
        self
    }

    pub fn persistent(mut self, persistent: bool) -> Self {
        self.persistent = Some(persistent);
        self
    }

    /// Unix timestamp in seconds.
    pub fn timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn message_id(mut self, id: &str) -> Self {
        self.message_id = Some(id.to_owned());
        self
    }

    pub fn msg_type(mut self, kind: &str) -> Self {
        self.msg_type = Some(kind.to_owned());
        self
    }

    pub fn header(mut self, key: &str, value: impl Into<HeaderValues>) -> Self {
        self.headers.insert(key.to_owned(), value.into());
        self
    }
}

/// Generates a message id unique per process, time and random suffix.
pub fn new_message_id() -> String {
    let random = Uuid::new_v4().simple().to_string();
    format!(
        "{}-{}-{}",
        std::process::id(),
        chrono::Utc::now().timestamp_millis(),
        &random[..12]
    )
}

/// Publishes messages on the channel of a [`RabbitMQClient`].
pub struct RabbitMQPublisher {
    client: RabbitMQClient,
}

impl RabbitMQPublisher {
    /// Creates a new RabbitMQ publisher sharing the client's channel.
    pub fn new(client: RabbitMQClient) -> Arc<RabbitMQPublisher> {
        Arc::new(RabbitMQPublisher { client })
    }

    /// Serializes `message` as JSON and publishes it to `exchange` with `routing_key`.
    ///
    /// # Returns
    /// The message id once the transport has accepted the message.
    pub async fn publish<T>(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &T,
        options: PublishOptions,
    ) -> Result<String, AmqpError>
    where
        T: Serialize + ?Sized,
    {
        let payload = serialize(message)?;
        self.publish_bytes(exchange, routing_key, payload, options)
            .await
    }

    /// Publishes directly to `queue` through the default exchange.
    pub async fn send_to_queue<T>(
        &self,
        queue: &str,
        message: &T,
        options: PublishOptions,
    ) -> Result<String, AmqpError>
    where
        T: Serialize + ?Sized,
    {
        self.publish("", queue, message, options).await
    }

    /// Publishes with an empty routing key and the given headers, for headers exchanges.
    pub async fn publish_with_headers<T>(
        &self,
        exchange: &str,
        message: &T,
        headers: HashMap<String, HeaderValues>,
        options: PublishOptions,
    ) -> Result<String, AmqpError>
    where
        T: Serialize + ?Sized,
    {
        let mut options = options;
        options.headers.extend(headers);
        self.publish(exchange, "", message, options).await
    }

    /// Publishes an already serialized payload.
    pub async fn publish_bytes(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Vec<u8>,
        options: PublishOptions,
    ) -> Result<String, AmqpError> {
        let transport = self.client.transport()?;

        let message_id = options.message_id.clone().unwrap_or_else(new_message_id);
        let properties = self.properties(&message_id, options);

        // one writer at a time, a full buffer holds every later publish back
        let _guard = self.client.inner.publish_lock.lock().await;

        match transport
            .basic_publish(exchange, routing_key, payload, properties)
            .await
        {
            Ok(PublishOutcome::Accepted) => {}
            Ok(PublishOutcome::BufferFull) => {
                warn!(
                    exchange,
                    routing_key, message_id, "outbound buffer full, waiting for drain"
                );
                transport.wait_for_drain().await?;
                debug!(message_id, "outbound buffer drained");
            }
            Err(err) => {
                error!(
                    error = err.to_string(),
                    exchange, routing_key, message_id, "error publishing message"
                );
                return Err(err);
            }
        }

        debug!(exchange, routing_key, message_id, "message published");
        Ok(message_id)
    }

    fn properties(&self, message_id: &str, options: PublishOptions) -> BasicProperties {
        let mut btree = BTreeMap::<ShortString, AMQPValue>::default();
        otel::inject_current(&mut btree);
        self.btree_map(options.headers, &mut btree);

        let delivery_mode = match options.persistent.unwrap_or(true) {
            true => PERSISTENT_DELIVERY_MODE,
            false => TRANSIENT_DELIVERY_MODE,
        };

        let timestamp = options
            .timestamp
            .unwrap_or_else(|| chrono::Utc::now().timestamp().max(0) as u64);

        let properties = BasicProperties::default()
            .with_content_type(ShortString::from(
                options
                    .content_type
                    .unwrap_or_else(|| JSON_CONTENT_TYPE.to_owned()),
            ))
            .with_delivery_mode(delivery_mode)
            .with_timestamp(timestamp)
            .with_message_id(ShortString::from(message_id.to_owned()))
            .with_headers(FieldTable::from(btree));

        match options.msg_type {
            Some(kind) => properties.with_type(ShortString::from(kind)),
            None => properties,
        }
    }

    /// Converts caller headers to AMQP values, caller values win over trace headers.
    fn btree_map(
        &self,
        hash_map: HashMap<String, HeaderValues>,
        btree: &mut BTreeMap<ShortString, AMQPValue>,
    ) {
        for (key, value) in hash_map {
            btree.insert(ShortString::from(key), value.into());
        }
    }
}

fn serialize<T>(message: &T) -> Result<Vec<u8>, AmqpError>
where
    T: Serialize + ?Sized,
{
    serde_json::to_vec(message).map_err(|err| {
        error!(error = err.to_string(), "failure to serialize payload");
        AmqpError::SerializePayloadError(err.to_string())
    })
}
