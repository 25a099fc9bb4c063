// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Management
//!
//! This module declares exchanges, queues, and the bindings between them.
//! Declarations are idempotent on the broker, so asserting the same entity twice
//! is harmless. Every successful declaration is remembered by the client and
//! replayed after a reconnect.
//!
//! The main components are:
//! - `assert_exchange`, `assert_queue`, `bind_queue` on [`RabbitMQClient`]
//! - `Topology` trait: declarative collection of definitions
//! - `AmqpTopology`: implementation that expands retry and DLQ queues

use crate::{
    client::RabbitMQClient,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
    transport::{QueueState, Transport},
};
use async_trait::async_trait;
use std::sync::PoisonError;
use tracing::{debug, error};

pub use crate::queue::{
    AMQP_HEADERS_DEAD_LETTER_EXCHANGE, AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY,
    AMQP_HEADERS_MAX_LENGTH, AMQP_HEADERS_MAX_LENGTH_BYTES, AMQP_HEADERS_MESSAGE_TTL,
};

/// A declaration the client performed and will repeat after reconnecting.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum TopologyOp {
    Exchange(ExchangeDefinition),
    Queue(QueueDefinition),
    Binding(QueueBinding),
}

impl RabbitMQClient {
    /// Declares an exchange. Durable and non-auto-delete unless the definition says otherwise.
    pub async fn assert_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        let transport = self.transport()?;
        declare_exchange(transport.as_ref(), def).await?;
        self.record(TopologyOp::Exchange(def.clone()));
        Ok(())
    }

    /// Declares a queue and returns its state, including its current depth.
    ///
    /// A definition built `with_retry`/`with_dlq` declares its DLQ and retry
    /// queue first; the returned state is the primary queue's.
    pub async fn assert_queue(&self, def: &QueueDefinition) -> Result<QueueState, AmqpError> {
        let transport = self.transport()?;

        let mut primary = None;
        for queue in expand_queue(def) {
            primary = Some(declare_queue(transport.as_ref(), &queue).await?);
            self.record(TopologyOp::Queue(queue));
        }

        primary.ok_or_else(|| AmqpError::DeclareQueueError(def.name.clone()))
    }

    /// Binds a queue to an exchange by routing key, or by header predicates
    /// carried in the binding arguments.
    pub async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        let transport = self.transport()?;
        declare_binding(transport.as_ref(), binding).await?;
        self.record(TopologyOp::Binding(binding.clone()));
        Ok(())
    }

    pub(crate) fn topology_ops(&self) -> Vec<TopologyOp> {
        self.inner
            .topology
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn record(&self, op: TopologyOp) {
        let mut ops = self
            .inner
            .topology
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !ops.contains(&op) {
            ops.push(op);
        }
    }
}

async fn declare_exchange(
    transport: &dyn Transport,
    def: &ExchangeDefinition,
) -> Result<(), AmqpError> {
    debug!("creating exchange: {}", def.name);

    transport
        .exchange_declare(
            &def.name,
            (&def.kind).into(),
            def.declare_options(),
            def.arguments(),
        )
        .await?;

    debug!("exchange: {} was created", def.name);
    Ok(())
}

async fn declare_queue(
    transport: &dyn Transport,
    def: &QueueDefinition,
) -> Result<QueueState, AmqpError> {
    debug!("creating queue: {}", def.name);

    let state = transport
        .queue_declare(&def.name, def.declare_options(), def.arguments())
        .await?;

    debug!(
        messages = state.message_count,
        consumers = state.consumer_count,
        "queue: {} was created",
        def.name
    );
    Ok(state)
}

async fn declare_binding(transport: &dyn Transport, binding: &QueueBinding) -> Result<(), AmqpError> {
    debug!(
        "binding queue: {} to the exchange: {} with the key: {}",
        binding.queue_name, binding.exchange_name, binding.routing_key
    );

    transport
        .queue_bind(
            &binding.queue_name,
            &binding.exchange_name,
            &binding.routing_key,
            binding.arguments(),
        )
        .await
}

/// Repeats recorded declarations on a fresh transport, in their original order.
pub(crate) async fn replay(transport: &dyn Transport, ops: &[TopologyOp]) -> Result<(), AmqpError> {
    for op in ops {
        match op {
            TopologyOp::Exchange(def) => declare_exchange(transport, def).await?,
            TopologyOp::Queue(def) => {
                declare_queue(transport, def).await?;
            }
            TopologyOp::Binding(binding) => declare_binding(transport, binding).await?,
        }
    }

    Ok(())
}

/// Trait defining the interface for topology management.
///
/// This trait provides methods for registering exchanges, queues, and bindings,
/// as well as installing the topology to the RabbitMQ server.
#[async_trait]
pub trait Topology {
    /// Adds an exchange definition to the topology.
    fn exchange(self, def: ExchangeDefinition) -> Self;

    /// Adds a queue definition to the topology.
    fn queue(self, def: QueueDefinition) -> Self;

    /// Adds a queue-to-exchange binding to the topology.
    fn queue_binding(self, binding: QueueBinding) -> Self;

    /// Installs the topology to the RabbitMQ server.
    ///
    /// This creates all the exchanges and queues, and sets up all the bindings.
    async fn install(&self) -> Result<(), AmqpError>;
}

/// RabbitMQ implementation of the Topology trait.
///
/// Queues configured `with_retry`/`with_dlq` are expanded by
/// [`RabbitMQClient::assert_queue`] into three queues:
/// the primary queue dead-lettering into `<name>-dlq`, the DLQ itself, and a
/// `<name>-retry` queue whose expired messages flow back to the primary queue.
pub struct AmqpTopology {
    client: RabbitMQClient,
    pub(crate) queues: Vec<QueueDefinition>,
    pub(crate) queues_binding: Vec<QueueBinding>,
    pub(crate) exchanges: Vec<ExchangeDefinition>,
}

impl AmqpTopology {
    pub fn new(client: RabbitMQClient) -> AmqpTopology {
        AmqpTopology {
            client,
            queues: vec![],
            queues_binding: vec![],
            exchanges: vec![],
        }
    }
}

#[async_trait]
impl Topology for AmqpTopology {
    fn exchange(mut self, def: ExchangeDefinition) -> Self {
        self.exchanges.push(def);
        self
    }

    fn queue(mut self, def: QueueDefinition) -> Self {
        self.queues.push(def);
        self
    }

    fn queue_binding(mut self, binding: QueueBinding) -> Self {
        self.queues_binding.push(binding);
        self
    }

    /// Installs the topology in order: exchanges, queues (with their DLQ and
    /// retry queues), then bindings.
    async fn install(&self) -> Result<(), AmqpError> {
        self.install_exchange().await?;
        self.install_queue().await?;
        self.binding_queues().await
    }
}

impl AmqpTopology {
    async fn install_exchange(&self) -> Result<(), AmqpError> {
        for exch in &self.exchanges {
            self.client.assert_exchange(exch).await?;
        }

        Ok(())
    }

    async fn install_queue(&self) -> Result<(), AmqpError> {
        for def in &self.queues {
            if let Err(err) = self.client.assert_queue(def).await {
                error!(error = err.to_string(), queue = def.name, "failure to install queue");
                return Err(err);
            }
        }

        Ok(())
    }

    async fn binding_queues(&self) -> Result<(), AmqpError> {
        for binding in &self.queues_binding {
            self.client.bind_queue(binding).await?;
        }

        debug!("queue was bounded");

        Ok(())
    }
}

/// Expands a queue definition into the plain definitions to declare, DLQ first
/// and primary queue last.
pub(crate) fn expand_queue(def: &QueueDefinition) -> Vec<QueueDefinition> {
    let mut queues = vec![];
    let mut primary = def.clone();

    if let Some(dlq_name) = &def.dlq_name {
        let mut dlq = QueueDefinition::new(dlq_name);
        dlq.durable = def.durable;
        queues.push(dlq);

        if primary.dead_letter.is_none() {
            primary = primary.dead_letter_to("", dlq_name);
        }
    }

    if let (Some(retry_name), Some(ttl)) = (&def.retry_name, def.retry_ttl) {
        let mut retry = QueueDefinition::new(retry_name)
            .ttl(ttl)
            .dead_letter_to("", &def.name);
        retry.durable = def.durable;
        queues.push(retry);
    }

    primary.dlq_name = None;
    primary.retry_name = None;
    primary.retry_ttl = None;
    queues.push(primary);

    queues
}
