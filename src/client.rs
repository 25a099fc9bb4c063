// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Client and Connection Supervision
//!
//! `RabbitMQClient` owns the single connection/channel pair of a client
//! instance. It connects, applies the fair-dispatch prefetch, watches for
//! connection failures and reconnects on a fixed delay, forever, until the
//! client is closed. Only one reconnect timer is ever pending.
//!
//! After every successful (re)connect the declared topology and the consumer
//! registrations are restored on the new channel.

use crate::{
    channel::LapinConnector,
    config::RabbitMQConfigs,
    consumer::ConsumerRegistry,
    errors::AmqpError,
    topology::{self, TopologyOp},
    transport::{Connector, FailureNotifier, Transport},
};
use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
    time::Duration,
};
use tokio::{runtime::Handle, task::JoinHandle};
use tracing::{debug, error, info, warn};

/// Maximum number of unacknowledged deliveries per consumer.
pub const PREFETCH_COUNT: u16 = 1;

/// Handle to one client instance. Cloning shares the same connection.
#[derive(Clone)]
pub struct RabbitMQClient {
    pub(crate) inner: Arc<ClientInner>,
}

pub(crate) struct ClientInner {
    cfg: RabbitMQConfigs,
    connector: Arc<dyn Connector>,
    state: Mutex<SupervisorState>,
    pub(crate) registry: ConsumerRegistry,
    pub(crate) topology: Mutex<Vec<TopologyOp>>,
    pub(crate) publish_lock: tokio::sync::Mutex<()>,
}

#[derive(Default)]
struct SupervisorState {
    transport: Option<Arc<dyn Transport>>,
    healthy: bool,
    closed: bool,
    generation: u64,
    failed_generation: u64,
    last_error: Option<String>,
    reconnect: Option<JoinHandle<()>>,
    runtime: Option<Handle>,
}

impl RabbitMQClient {
    /// Creates a client backed by lapin. Nothing is opened until [`connect`](Self::connect).
    pub fn new(cfg: RabbitMQConfigs) -> RabbitMQClient {
        let connector = LapinConnector::new(cfg.clone());
        RabbitMQClient::with_connector(cfg, connector)
    }

    /// Creates a client that opens its transports through `connector`.
    pub fn with_connector(cfg: RabbitMQConfigs, connector: Arc<dyn Connector>) -> RabbitMQClient {
        RabbitMQClient {
            inner: Arc::new(ClientInner {
                cfg,
                connector,
                state: Mutex::new(SupervisorState::default()),
                registry: ConsumerRegistry::default(),
                topology: Mutex::new(vec![]),
                publish_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn configs(&self) -> &RabbitMQConfigs {
        &self.inner.cfg
    }

    /// Opens the connection and its channel. A no-op while already connected.
    ///
    /// A failed attempt is reported to the caller and a reconnect is scheduled;
    /// the client keeps trying on the configured delay until it succeeds or is
    /// closed.
    pub async fn connect(&self) -> Result<(), AmqpError> {
        {
            let mut st = self.lock_state();
            if st.healthy && st.transport.is_some() {
                debug!("already connected to rabbitmq");
                return Ok(());
            }
            st.closed = false;
        }

        match self.try_connect().await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.schedule_reconnect();
                Err(err)
            }
        }
    }

    /// True iff the last connect succeeded and nothing invalidated it since.
    pub fn is_healthy(&self) -> bool {
        self.lock_state().healthy
    }

    /// The error that last invalidated the connection, if any.
    pub fn last_error(&self) -> Option<String> {
        self.lock_state().last_error.clone()
    }

    /// Whether a reconnect timer is currently pending.
    pub fn reconnect_pending(&self) -> bool {
        self.lock_state()
            .reconnect
            .as_ref()
            .is_some_and(|timer| !timer.is_finished())
    }

    /// Closes the client: cancels the pending reconnect, every consumer, then
    /// the channel and the connection. Failures are logged, never returned.
    pub async fn close(&self) {
        let (timer, transport) = {
            let mut st = self.lock_state();
            st.closed = true;
            st.healthy = false;
            (st.reconnect.take(), st.transport.take())
        };

        if let Some(timer) = timer {
            timer.abort();
            debug!("pending reconnect cancelled");
        }

        self.inner.registry.cancel_all(transport.as_deref()).await;

        if let Some(transport) = transport {
            match transport.close().await {
                Ok(()) => info!("rabbitmq connection closed"),
                Err(err) => warn!(error = err.to_string(), "failure while closing the connection"),
            }
        }
    }

    /// The live transport, or `ChannelNotInitialized`.
    pub(crate) fn transport(&self) -> Result<Arc<dyn Transport>, AmqpError> {
        self.lock_state()
            .transport
            .clone()
            .ok_or(AmqpError::ChannelNotInitialized)
    }

    pub(crate) fn current_transport(&self) -> Option<Arc<dyn Transport>> {
        self.lock_state().transport.clone()
    }

    fn lock_state(&self) -> MutexGuard<'_, SupervisorState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn try_connect(&self) -> Result<(), AmqpError> {
        let generation = {
            let mut st = self.lock_state();
            st.generation += 1;
            if let Ok(handle) = Handle::try_current() {
                st.runtime = Some(handle);
            }
            st.generation
        };

        info!(
            host = self.inner.cfg.host,
            port = self.inner.cfg.port,
            vhost = self.inner.cfg.vhost,
            "connecting to rabbitmq"
        );

        let transport = match self
            .inner
            .connector
            .open(self.failure_notifier(generation))
            .await
        {
            Ok(transport) => transport,
            Err(err) => {
                self.record_failure(&err);
                return Err(err);
            }
        };

        if let Err(err) = transport.basic_qos(PREFETCH_COUNT).await {
            self.record_failure(&err);
            let _ = transport.close().await;
            return Err(err);
        }

        let committed = {
            let mut st = self.lock_state();
            if st.closed || st.generation != generation || st.failed_generation == generation {
                None
            } else {
                let previous = st
                    .transport
                    .replace(transport.clone())
                    .filter(|previous| !Arc::ptr_eq(previous, &transport));
                st.healthy = true;
                st.last_error = None;
                Some(previous)
            }
        };

        let Some(previous) = committed else {
            debug!(generation, "connection superseded before it was published");
            let _ = transport.close().await;
            return Err(AmqpError::ConnectionError(
                "connection lost while connecting".to_owned(),
            ));
        };

        info!(prefetch = PREFETCH_COUNT, "rabbitmq connected");
        self.restore(previous.as_deref(), transport.as_ref()).await;

        if let Some(previous) = previous {
            debug!("closing the replaced connection");
            if let Err(err) = previous.close().await {
                warn!(error = err.to_string(), "failure while closing the replaced connection");
            }
        }

        Ok(())
    }

    /// Re-declares the recorded topology and moves every registered consumer
    /// from `previous` onto `transport`.
    async fn restore(&self, previous: Option<&dyn Transport>, transport: &dyn Transport) {
        let ops = self.topology_ops();

        if !ops.is_empty() {
            debug!(count = ops.len(), "restoring topology");
            if let Err(err) = topology::replay(transport, &ops).await {
                error!(error = err.to_string(), "failure to restore topology");
            }
        }

        self.inner.registry.resubscribe(previous, transport).await;
    }

    fn record_failure(&self, err: &AmqpError) {
        let mut st = self.lock_state();
        st.healthy = false;
        st.last_error = Some(err.to_string());
        warn!(error = err.to_string(), "failure to connect to rabbitmq");
    }

    fn failure_notifier(&self, generation: u64) -> FailureNotifier {
        let inner = Arc::downgrade(&self.inner);
        Arc::new(move |err| {
            if let Some(inner) = inner.upgrade() {
                RabbitMQClient { inner }.handle_failure(generation, err);
            }
        })
    }

    /// Invalidates the connection of `generation` and schedules a reconnect.
    ///
    /// A channel closed by the broker leaves its connection open, so the
    /// dropped transport is closed in the background.
    pub(crate) fn handle_failure(&self, generation: u64, err: AmqpError) {
        let mut st = self.lock_state();
        if st.closed || st.generation != generation || st.failed_generation == generation {
            debug!(generation, "ignoring failure of a stale connection");
            return;
        }

        st.failed_generation = generation;
        st.healthy = false;
        st.last_error = Some(err.to_string());
        error!(error = err.to_string(), "rabbitmq connection lost");

        if let (Some(transport), Some(runtime)) = (st.transport.take(), st.runtime.clone()) {
            runtime.spawn(async move {
                if let Err(err) = transport.close().await {
                    debug!(error = err.to_string(), "failed transport already closed");
                }
            });
        }

        self.schedule_reconnect_locked(&mut st);
    }

    fn schedule_reconnect(&self) {
        let mut st = self.lock_state();
        self.schedule_reconnect_locked(&mut st);
    }

    fn schedule_reconnect_locked(&self, st: &mut SupervisorState) {
        if st.closed {
            return;
        }

        if st.reconnect.as_ref().is_some_and(|timer| !timer.is_finished()) {
            debug!("reconnect already scheduled");
            return;
        }

        let Some(runtime) = st.runtime.clone().or_else(|| Handle::try_current().ok()) else {
            error!("no runtime available to schedule a reconnect");
            return;
        };

        let delay = self.inner.cfg.reconnect_delay();
        info!(delay_ms = delay.as_millis() as u64, "scheduling reconnect");
        st.reconnect = Some(runtime.spawn(reconnect_loop(Arc::downgrade(&self.inner), delay)));
    }
}

/// Body of the reconnect timer. Retries on the fixed delay until connected or closed.
async fn reconnect_loop(inner: Weak<ClientInner>, delay: Duration) {
    loop {
        tokio::time::sleep(delay).await;

        let Some(inner) = inner.upgrade() else {
            return;
        };
        let client = RabbitMQClient { inner };

        if client.finish_reconnect() {
            return;
        }

        info!("reconnecting to rabbitmq");
        if let Err(err) = client.try_connect().await {
            warn!(error = err.to_string(), "reconnect attempt failed");
            continue;
        }

        // a failure right after connecting leaves the timer in charge
        if client.finish_reconnect() {
            return;
        }
    }
}

impl RabbitMQClient {
    /// Releases the reconnect timer once there is nothing left to do.
    fn finish_reconnect(&self) -> bool {
        let mut st = self.lock_state();
        if st.closed || st.healthy {
            st.reconnect = None;
            return true;
        }
        false
    }
}
