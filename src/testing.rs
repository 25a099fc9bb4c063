// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-memory broker used by the unit tests.
//!
//! Implements enough of AMQP 0-9-1 to exercise the client: the four exchange
//! types plus the default exchange, per-consumer prefetch with round-robin
//! dispatch, ack/reject with requeue and the redelivered flag, dead-letter
//! arguments, per-queue message TTL, a simulated full outbound buffer, and
//! connection failures.

use crate::{
    consumer::{ConsumerHandler, ConsumerMessage},
    errors::{AmqpError, HandlerError},
    queue::{
        AMQP_HEADERS_DEAD_LETTER_EXCHANGE, AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY,
        AMQP_HEADERS_MATCH, AMQP_HEADERS_MESSAGE_TTL,
    },
    transport::{
        Acknowledger, Connector, DeliveryStream, FailureNotifier, InboundDelivery, PublishOutcome,
        QueueState, Transport,
    },
};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use lapin::{
    options::{ExchangeDeclareOptions, QueueDeclareOptions},
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, ExchangeKind,
};
use opentelemetry::Context;
use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};
use tokio::sync::{mpsc, Notify};

#[derive(Debug, Clone)]
pub(crate) struct StoredMessage {
    seq: u64,
    pub exchange: String,
    pub routing_key: String,
    pub properties: BasicProperties,
    pub data: Vec<u8>,
    pub redelivered: bool,
}

struct MemExchange {
    kind: String,
    durable: bool,
}

struct MemQueue {
    durable: bool,
    args: FieldTable,
    messages: VecDeque<StoredMessage>,
    consumers: Vec<MemConsumer>,
    next_consumer: usize,
}

struct MemConsumer {
    channel: u64,
    tag: String,
    no_ack: bool,
    in_flight: usize,
    tx: mpsc::UnboundedSender<InboundDelivery>,
}

#[derive(PartialEq)]
struct MemBinding {
    queue: String,
    exchange: String,
    routing_key: String,
    args: FieldTable,
}

struct MemChannel {
    alive: bool,
    prefetch: u16,
    next_tag: u64,
    unacked: HashMap<u64, (String, String, StoredMessage)>,
    notifier: FailureNotifier,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, MemExchange>,
    queues: HashMap<String, MemQueue>,
    bindings: Vec<MemBinding>,
    channels: HashMap<u64, MemChannel>,
    next_channel: u64,
    next_seq: u64,
    fail_connects: usize,
    connects: usize,
    buffer_full: usize,
    acks: usize,
    published: Vec<StoredMessage>,
}

/// Shared in-memory broker; every clone is the same broker.
#[derive(Clone, Default)]
pub(crate) struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    drain: Arc<Notify>,
}

impl MemoryBroker {
    pub fn new() -> MemoryBroker {
        MemoryBroker::default()
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(MemoryConnector {
            broker: self.clone(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap()
    }

    /// The next `n` connection attempts are refused.
    pub fn fail_next_connects(&self, n: usize) {
        self.lock().fail_connects = n;
    }

    pub fn connect_count(&self) -> usize {
        self.lock().connects
    }

    /// The next `n` publishes report a full outbound buffer.
    pub fn buffer_full_next(&self, n: usize) {
        self.lock().buffer_full = n;
    }

    /// Signals that the outbound buffer drained.
    pub fn drain(&self) {
        self.drain.notify_one();
    }

    /// Kills every live connection and notifies their owners.
    pub fn drop_connections(&self) {
        let notifiers: Vec<FailureNotifier> = {
            let mut st = self.lock();
            let ids: Vec<u64> = st
                .channels
                .iter()
                .filter(|(_, ch)| ch.alive)
                .map(|(id, _)| *id)
                .collect();
            let notifiers = ids
                .iter()
                .filter_map(|id| self.close_channel(&mut st, *id))
                .collect();
            notifiers
        };

        for notify in notifiers {
            notify(AmqpError::ConnectionError("connection reset by peer".to_owned()));
        }
    }

    /// Drops every connection and forgets all exchanges, queues and bindings.
    pub fn restart(&self) {
        self.drop_connections();

        let mut st = self.lock();
        st.exchanges.clear();
        st.queues.clear();
        st.bindings.clear();
    }

    /// Prefetch of every live channel.
    pub fn prefetches(&self) -> Vec<u16> {
        self.lock()
            .channels
            .values()
            .filter(|ch| ch.alive)
            .map(|ch| ch.prefetch)
            .collect()
    }

    pub fn exchange_count(&self) -> usize {
        self.lock().exchanges.len()
    }

    pub fn queue_names(&self) -> Vec<String> {
        self.lock().queues.keys().cloned().collect()
    }

    pub fn binding_count(&self) -> usize {
        self.lock().bindings.len()
    }

    pub fn queue_arguments(&self, queue: &str) -> Option<FieldTable> {
        self.lock().queues.get(queue).map(|q| q.args.clone())
    }

    /// Ready messages of `queue`, not counting unacknowledged ones.
    pub fn depth(&self, queue: &str) -> usize {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.messages.len())
            .unwrap_or_default()
    }

    pub fn messages(&self, queue: &str) -> Vec<StoredMessage> {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.messages.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.consumers.len())
            .unwrap_or_default()
    }

    pub fn unacked_count(&self) -> usize {
        self.lock().channels.values().map(|ch| ch.unacked.len()).sum()
    }

    pub fn ack_count(&self) -> usize {
        self.lock().acks
    }

    /// Every message published through a transport, in order.
    pub fn published(&self) -> Vec<StoredMessage> {
        self.lock().published.clone()
    }

    /// Publishes from outside any client.
    pub fn inject(&self, exchange: &str, routing_key: &str, data: Vec<u8>) {
        let mut st = self.lock();
        self.route(&mut st, exchange, routing_key, BasicProperties::default(), data);
    }

    pub fn inject_with_header(&self, exchange: &str, key: &str, value: &str) {
        let mut headers = BTreeMap::new();
        headers.insert(
            ShortString::from(key),
            AMQPValue::LongString(LongString::from(value)),
        );
        let props = BasicProperties::default().with_headers(FieldTable::from(headers));

        let mut st = self.lock();
        self.route(&mut st, exchange, "", props, b"{}".to_vec());
    }

    fn route(
        &self,
        st: &mut BrokerState,
        exchange: &str,
        routing_key: &str,
        properties: BasicProperties,
        data: Vec<u8>,
    ) {
        let targets: Vec<String> = if exchange.is_empty() {
            vec![routing_key.to_owned()]
        } else {
            let Some(exch) = st.exchanges.get(exchange) else {
                return;
            };
            let mut targets = vec![];
            for binding in st.bindings.iter().filter(|b| b.exchange == exchange) {
                let matched = match exch.kind.as_str() {
                    "fanout" => true,
                    "topic" => topic_matches(&binding.routing_key, routing_key),
                    "headers" => headers_match(&binding.args, properties.headers().as_ref()),
                    _ => binding.routing_key == routing_key,
                };
                if matched && !targets.contains(&binding.queue) {
                    targets.push(binding.queue.clone());
                }
            }
            targets
        };

        for queue in targets {
            st.next_seq += 1;
            let msg = StoredMessage {
                seq: st.next_seq,
                exchange: exchange.to_owned(),
                routing_key: routing_key.to_owned(),
                properties: properties.clone(),
                data: data.clone(),
                redelivered: false,
            };
            self.enqueue(st, &queue, msg);
        }
    }

    fn enqueue(&self, st: &mut BrokerState, queue: &str, msg: StoredMessage) {
        let Some(q) = st.queues.get_mut(queue) else {
            return;
        };

        if let Some(ttl) = int_arg(&q.args, AMQP_HEADERS_MESSAGE_TTL) {
            let broker = self.clone();
            let queue = queue.to_owned();
            let seq = msg.seq;
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(ttl.max(0) as u64)).await;
                broker.expire(&queue, seq);
            });
        }

        q.messages.push_back(msg);
        self.dispatch(st, queue);
    }

    fn expire(&self, queue: &str, seq: u64) {
        let mut st = self.lock();
        let Some(q) = st.queues.get_mut(queue) else {
            return;
        };
        let Some(pos) = q.messages.iter().position(|m| m.seq == seq) else {
            return;
        };
        if let Some(msg) = q.messages.remove(pos) {
            self.dead_letter(&mut st, queue, msg);
        }
    }

    fn dead_letter(&self, st: &mut BrokerState, queue: &str, msg: StoredMessage) {
        let Some(q) = st.queues.get(queue) else {
            return;
        };
        let Some(exchange) = string_arg(&q.args, AMQP_HEADERS_DEAD_LETTER_EXCHANGE) else {
            return;
        };
        let routing_key = string_arg(&q.args, AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY)
            .unwrap_or_else(|| msg.routing_key.clone());

        self.route(st, &exchange, &routing_key, msg.properties, msg.data);
    }

    fn dispatch(&self, st: &mut BrokerState, queue: &str) {
        loop {
            let BrokerState {
                queues, channels, ..
            } = &mut *st;
            let Some(q) = queues.get_mut(queue) else {
                return;
            };
            if q.messages.is_empty() || q.consumers.is_empty() {
                return;
            }

            let total = q.consumers.len();
            let candidate = (0..total)
                .map(|offset| (q.next_consumer + offset) % total)
                .find(|idx| {
                    let consumer = &q.consumers[*idx];
                    let prefetch = channels
                        .get(&consumer.channel)
                        .map(|ch| ch.prefetch)
                        .unwrap_or_default();
                    consumer.no_ack || prefetch == 0 || consumer.in_flight < prefetch as usize
                });
            let Some(idx) = candidate else {
                return;
            };
            let Some(mut msg) = q.messages.pop_front() else {
                return;
            };

            let consumer = &mut q.consumers[idx];
            let Some(channel) = channels.get_mut(&consumer.channel) else {
                q.messages.push_front(msg);
                return;
            };
            channel.next_tag += 1;
            let tag = channel.next_tag;

            let delivery = InboundDelivery {
                delivery_tag: tag,
                exchange: msg.exchange.clone(),
                routing_key: msg.routing_key.clone(),
                redelivered: msg.redelivered,
                properties: msg.properties.clone(),
                data: msg.data.clone(),
                acker: Arc::new(MemoryAcker {
                    broker: self.clone(),
                    channel: consumer.channel,
                    tag,
                }),
            };

            if consumer.tx.send(delivery).is_err() {
                q.messages.push_front(msg);
                q.consumers.remove(idx);
                continue;
            }

            if !consumer.no_ack {
                consumer.in_flight += 1;
                msg.redelivered = true;
                channel
                    .unacked
                    .insert(tag, (queue.to_owned(), consumer.tag.clone(), msg));
            }
            q.next_consumer = idx + 1;
        }
    }

    fn settle(&self, channel: u64, tag: u64, requeue: Option<bool>) -> Result<(), AmqpError> {
        let mut st = self.lock();
        let entry = st
            .channels
            .get_mut(&channel)
            .filter(|ch| ch.alive)
            .and_then(|ch| ch.unacked.remove(&tag));

        let Some((queue, consumer_tag, msg)) = entry else {
            return Err(match requeue {
                None => AmqpError::AckMessageError,
                Some(_) => AmqpError::NackMessageError,
            });
        };

        if let Some(q) = st.queues.get_mut(&queue) {
            if let Some(consumer) = q
                .consumers
                .iter_mut()
                .find(|c| c.channel == channel && c.tag == consumer_tag)
            {
                consumer.in_flight = consumer.in_flight.saturating_sub(1);
            }
        }

        match requeue {
            None => st.acks += 1,
            Some(true) => {
                if let Some(q) = st.queues.get_mut(&queue) {
                    q.messages.push_front(msg);
                }
            }
            Some(false) => self.dead_letter(&mut st, &queue, msg),
        }

        self.dispatch(&mut st, &queue);
        Ok(())
    }

    /// Marks a channel dead, drops its consumers and requeues its unacked messages.
    fn close_channel(&self, st: &mut BrokerState, id: u64) -> Option<FailureNotifier> {
        let channel = st.channels.get_mut(&id)?;
        if !channel.alive {
            return None;
        }
        channel.alive = false;
        let unacked: Vec<(String, String, StoredMessage)> =
            channel.unacked.drain().map(|(_, entry)| entry).collect();
        let notifier = channel.notifier.clone();

        for q in st.queues.values_mut() {
            q.consumers.retain(|c| c.channel != id);
        }

        let mut touched = vec![];
        for (queue, _, msg) in unacked {
            if let Some(q) = st.queues.get_mut(&queue) {
                q.messages.push_front(msg);
            }
            touched.push(queue);
        }
        for queue in touched {
            self.dispatch(st, &queue);
        }

        Some(notifier)
    }

    /// Closes a channel on a failed precondition and notifies its owner, the
    /// connection itself stays up.
    fn fail_channel(&self, mut st: MutexGuard<'_, BrokerState>, id: u64, reason: String) {
        let notifier = self.close_channel(&mut st, id);
        drop(st);

        if let Some(notify) = notifier {
            notify(AmqpError::ChannelClosed(reason));
        }
    }

    fn channel_alive(&self, st: &BrokerState, id: u64) -> Result<(), AmqpError> {
        match st.channels.get(&id) {
            Some(ch) if ch.alive => Ok(()),
            _ => Err(AmqpError::ChannelError),
        }
    }
}

fn int_arg(args: &FieldTable, key: &str) -> Option<i64> {
    match args.inner().get(key)? {
        AMQPValue::LongInt(v) => Some(*v as i64),
        AMQPValue::LongLongInt(v) => Some(*v),
        AMQPValue::LongUInt(v) => Some(*v as i64),
        _ => None,
    }
}

fn string_arg(args: &FieldTable, key: &str) -> Option<String> {
    match args.inner().get(key)? {
        AMQPValue::LongString(v) => Some(String::from_utf8_lossy(v.as_bytes()).into_owned()),
        AMQPValue::ShortString(v) => Some(v.to_string()),
        _ => None,
    }
}

#[allow(unreachable_patterns)]
fn kind_name(kind: &ExchangeKind) -> String {
    match kind {
        ExchangeKind::Direct => "direct".to_owned(),
        ExchangeKind::Fanout => "fanout".to_owned(),
        ExchangeKind::Topic => "topic".to_owned(),
        ExchangeKind::Headers => "headers".to_owned(),
        ExchangeKind::Custom(name) => name.clone(),
        _ => "direct".to_owned(),
    }
}

fn topic_matches(pattern: &str, key: &str) -> bool {
    fn go(p: &[&str], k: &[&str]) -> bool {
        match (p.first(), k.first()) {
            (None, None) => true,
            (Some(&"#"), _) => go(&p[1..], k) || (!k.is_empty() && go(p, &k[1..])),
            (Some(&"*"), Some(_)) => go(&p[1..], &k[1..]),
            (Some(a), Some(b)) if a == b => go(&p[1..], &k[1..]),
            _ => false,
        }
    }

    let p: Vec<&str> = pattern.split('.').collect();
    let k: Vec<&str> = key.split('.').collect();
    go(&p, &k)
}

fn headers_match(binding: &FieldTable, headers: Option<&FieldTable>) -> bool {
    let any = matches!(
        binding.inner().get(AMQP_HEADERS_MATCH),
        Some(AMQPValue::LongString(v)) if v.as_bytes() == b"any"
    );
    let empty = FieldTable::default();
    let headers = headers.unwrap_or(&empty).inner();
    let mut predicates = binding
        .inner()
        .iter()
        .filter(|(key, _)| !key.as_str().starts_with("x-"));

    if any {
        predicates.any(|(key, value)| headers.get(key) == Some(value))
    } else {
        predicates.all(|(key, value)| headers.get(key) == Some(value))
    }
}

struct MemoryConnector {
    broker: MemoryBroker,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn open(&self, on_failure: FailureNotifier) -> Result<Arc<dyn Transport>, AmqpError> {
        let mut st = self.broker.lock();
        if st.fail_connects > 0 {
            st.fail_connects -= 1;
            return Err(AmqpError::ConnectionError("connection refused".to_owned()));
        }

        st.connects += 1;
        st.next_channel += 1;
        let id = st.next_channel;
        st.channels.insert(
            id,
            MemChannel {
                alive: true,
                prefetch: 0,
                next_tag: 0,
                unacked: HashMap::default(),
                notifier: on_failure,
            },
        );

        Ok(Arc::new(MemoryTransport {
            broker: self.broker.clone(),
            channel: id,
        }))
    }
}

struct MemoryTransport {
    broker: MemoryBroker,
    channel: u64,
}

struct MemoryAcker {
    broker: MemoryBroker,
    channel: u64,
    tag: u64,
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<(), AmqpError> {
        self.broker.settle(self.channel, self.tag, None)
    }

    async fn reject(&self, requeue: bool) -> Result<(), AmqpError> {
        self.broker.settle(self.channel, self.tag, Some(requeue))
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
        let mut st = self.broker.lock();
        self.broker.channel_alive(&st, self.channel)?;
        if let Some(ch) = st.channels.get_mut(&self.channel) {
            ch.prefetch = prefetch_count;
        }
        Ok(())
    }

    async fn exchange_declare(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeDeclareOptions,
        _args: FieldTable,
    ) -> Result<(), AmqpError> {
        let mut st = self.broker.lock();
        self.broker.channel_alive(&st, self.channel)?;

        let kind = kind_name(&kind);
        let conflict = st
            .exchanges
            .get(name)
            .map(|existing| existing.kind != kind || existing.durable != options.durable);
        match conflict {
            Some(true) => {
                let reason = format!("PRECONDITION_FAILED - inequivalent arg for exchange '{}'", name);
                self.broker.fail_channel(st, self.channel, reason);
                Err(AmqpError::DeclareExchangeError(name.to_owned()))
            }
            Some(false) => Ok(()),
            None => {
                st.exchanges.insert(
                    name.to_owned(),
                    MemExchange {
                        kind,
                        durable: options.durable,
                    },
                );
                Ok(())
            }
        }
    }

    async fn queue_declare(
        &self,
        name: &str,
        options: QueueDeclareOptions,
        args: FieldTable,
    ) -> Result<QueueState, AmqpError> {
        let mut st = self.broker.lock();
        self.broker.channel_alive(&st, self.channel)?;

        let q = st.queues.entry(name.to_owned()).or_insert_with(|| MemQueue {
            durable: options.durable,
            args: args.clone(),
            messages: VecDeque::new(),
            consumers: vec![],
            next_consumer: 0,
        });
        let state = QueueState {
            name: name.to_owned(),
            message_count: q.messages.len() as u32,
            consumer_count: q.consumers.len() as u32,
        };
        let conflict = q.durable != options.durable || q.args != args;

        if conflict {
            let reason = format!("PRECONDITION_FAILED - inequivalent arg for queue '{}'", name);
            self.broker.fail_channel(st, self.channel, reason);
            return Err(AmqpError::DeclareQueueError(name.to_owned()));
        }

        Ok(state)
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        args: FieldTable,
    ) -> Result<(), AmqpError> {
        let mut st = self.broker.lock();
        self.broker.channel_alive(&st, self.channel)?;

        if !st.queues.contains_key(queue) || !st.exchanges.contains_key(exchange) {
            return Err(AmqpError::BindingExchangeToQueueError(
                exchange.to_owned(),
                queue.to_owned(),
            ));
        }

        let binding = MemBinding {
            queue: queue.to_owned(),
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            args,
        };
        if !st.bindings.contains(&binding) {
            st.bindings.push(binding);
        }
        Ok(())
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Vec<u8>,
        properties: BasicProperties,
    ) -> Result<PublishOutcome, AmqpError> {
        let mut st = self.broker.lock();
        self.broker.channel_alive(&st, self.channel)?;

        st.next_seq += 1;
        let record = StoredMessage {
            seq: st.next_seq,
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            properties: properties.clone(),
            data: payload.clone(),
            redelivered: false,
        };
        st.published.push(record);
        self.broker
            .route(&mut st, exchange, routing_key, properties, payload);

        if st.buffer_full > 0 {
            st.buffer_full -= 1;
            return Ok(PublishOutcome::BufferFull);
        }
        Ok(PublishOutcome::Accepted)
    }

    async fn wait_for_drain(&self) -> Result<(), AmqpError> {
        self.broker.drain.notified().await;
        Ok(())
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        no_ack: bool,
        _exclusive: bool,
    ) -> Result<DeliveryStream, AmqpError> {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut st = self.broker.lock();
            self.broker.channel_alive(&st, self.channel)?;

            let Some(q) = st.queues.get_mut(queue) else {
                return Err(AmqpError::BindingConsumerError(queue.to_owned()));
            };
            q.consumers.push(MemConsumer {
                channel: self.channel,
                tag: consumer_tag.to_owned(),
                no_ack,
                in_flight: 0,
                tx,
            });
            self.broker.dispatch(&mut st, queue);
        }

        let deliveries = stream::unfold(rx, |mut rx| async move {
            rx.recv()
                .await
                .map(|delivery| (Ok::<_, AmqpError>(Some(delivery)), rx))
        })
        .chain(stream::once(async { Ok::<_, AmqpError>(None) }));

        Ok(deliveries.boxed())
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        let mut st = self.broker.lock();
        self.broker.channel_alive(&st, self.channel)?;

        for q in st.queues.values_mut() {
            q.consumers
                .retain(|c| !(c.channel == self.channel && c.tag == consumer_tag));
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), AmqpError> {
        let mut st = self.broker.lock();
        self.broker.close_channel(&mut st, self.channel);
        Ok(())
    }
}

/// Hands out the same transport on every open; used with mocked transports.
pub(crate) struct FixedConnector {
    transport: Arc<dyn Transport>,
}

impl FixedConnector {
    pub fn new(transport: Arc<dyn Transport>) -> Arc<dyn Connector> {
        Arc::new(FixedConnector { transport })
    }
}

#[async_trait]
impl Connector for FixedConnector {
    async fn open(&self, _on_failure: FailureNotifier) -> Result<Arc<dyn Transport>, AmqpError> {
        Ok(self.transport.clone())
    }
}

/// Handler answering from a script, `Ok` once the script ran out.
#[derive(Default)]
pub(crate) struct ScriptedHandler {
    script: Mutex<VecDeque<Result<(), HandlerError>>>,
    calls: Mutex<Vec<ConsumerMessage>>,
    malformed: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
    delay: Option<Duration>,
}

impl ScriptedHandler {
    pub fn ok() -> Arc<ScriptedHandler> {
        Arc::new(ScriptedHandler::default())
    }

    pub fn answering(script: Vec<Result<(), HandlerError>>) -> Arc<ScriptedHandler> {
        Arc::new(ScriptedHandler {
            script: Mutex::new(script.into()),
            ..Default::default()
        })
    }

    pub fn always_failing() -> Arc<ScriptedHandler> {
        ScriptedHandler::answering(vec![Err(HandlerError::failed("boom")); 16])
    }

    pub fn slow(delay: Duration) -> Arc<ScriptedHandler> {
        Arc::new(ScriptedHandler {
            delay: Some(delay),
            ..Default::default()
        })
    }

    pub fn calls(&self) -> Vec<ConsumerMessage> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn malformed_count(&self) -> usize {
        self.malformed.load(Ordering::SeqCst)
    }

    /// Highest number of executions that overlapped.
    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConsumerHandler for ScriptedHandler {
    async fn exec(&self, _ctx: &Context, msg: &ConsumerMessage) -> Result<(), HandlerError> {
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);
        self.calls.lock().unwrap().push(msg.clone());

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        self.active.fetch_sub(1, Ordering::SeqCst);
        self.script.lock().unwrap().pop_front().unwrap_or(Ok(()))
    }

    async fn malformed(
        &self,
        _ctx: &Context,
        _msg: &ConsumerMessage,
        err: HandlerError,
    ) -> Result<(), HandlerError> {
        self.malformed.fetch_add(1, Ordering::SeqCst);
        Err(err)
    }
}

/// Polls `cond` for a while, giving spawned tasks room to run.
pub(crate) async fn eventually(cond: impl Fn() -> bool) -> bool {
    for _ in 0..500 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

#[test]
fn test_topic_patterns() {
    assert!(topic_matches("payment.*", "payment.failed"));
    assert!(!topic_matches("payment.*", "payment.card.failed"));
    assert!(topic_matches("payment.#", "payment.card.failed"));
    assert!(topic_matches("#", "anything.at.all"));
    assert!(!topic_matches("order.created", "order.updated"));
}
