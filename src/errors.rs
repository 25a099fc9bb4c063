// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the RabbitMQ Client
//!
//! `AmqpError` covers every failure the client layer can report to its callers:
//! connection and channel problems, topology declarations, publishing, consuming
//! and message settlement. `HandlerError` is what message handlers return to tell
//! the consumer registry how a delivery went.

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
///
/// Connection-class errors are never fatal to the caller: the client logs them,
/// flips its health flag and schedules a reconnect. Precondition errors
/// (`ChannelNotInitialized`) are returned straight away to whoever attempted an
/// operation without a live channel.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect `{0}`")]
    ConnectionError(String),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// The broker closed the channel, e.g. after a failed precondition
    #[error("channel closed `{0}`")]
    ChannelClosed(String),

    /// An operation was attempted while no live channel exists
    #[error("channel not initialized")]
    ChannelNotInitialized,

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding an exchange to a queue
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error binding a consumer to a queue
    #[error("failure to declare consumer `{0}`")]
    BindingConsumerError(String),

    /// The queue already has an active consumer registration on this client
    #[error("queue `{0}` already has a consumer")]
    ConsumerAlreadyRegistered(String),

    /// Error cancelling a consumer
    #[error("failure to cancel consumer `{0}`")]
    CancelConsumerError(String),

    /// Error publishing a message
    #[error("failure to publish")]
    PublishingError,

    /// Error serializing a message payload
    #[error("failure to serialize payload `{0}`")]
    SerializePayloadError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error consuming a message
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),

    /// Error closing the channel or the connection
    #[error("failure to close `{0}`")]
    CloseError(String),

    /// Error loading the client configuration
    #[error("invalid configuration `{0}`")]
    ConfigError(String),

    /// Error reading or writing the terminal failure store
    #[error("dead letter store failure `{0}`")]
    DeadLetterStoreError(String),
}

/// Outcome of a failed handler execution.
///
/// The consumer registry turns every variant into a reject; only the requeue
/// flag differs.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// Ordinary failure, subject to the queue's redelivery policy
    #[error("handler failure `{0}`")]
    Failed(String),

    /// Failure that must never be requeued by the transport
    #[error("terminal handler failure `{0}`")]
    Terminal(String),

    /// The message body could not be deserialized
    #[error("failure to deserialize message `{0}`")]
    Deserialize(String),
}

impl HandlerError {
    pub fn failed(reason: impl ToString) -> Self {
        HandlerError::Failed(reason.to_string())
    }

    pub fn terminal(reason: impl ToString) -> Self {
        HandlerError::Terminal(reason.to_string())
    }

    /// Whether the transport must not requeue a message that failed this way.
    pub fn is_terminal(&self) -> bool {
        matches!(self, HandlerError::Terminal(_))
    }

    /// The bare failure reason, without the variant prefix.
    pub fn reason(&self) -> &str {
        match self {
            HandlerError::Failed(r) | HandlerError::Terminal(r) | HandlerError::Deserialize(r) => r,
        }
    }
}
