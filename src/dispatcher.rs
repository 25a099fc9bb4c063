// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Dispatcher
//!
//! One task per consumer registration reads the delivery stream and runs the
//! handler for each delivery, strictly one after the other. With a prefetch of
//! one the broker never has more than a single unacknowledged message out to
//! this task anyway.
//!
//! Stopping a worker lets the in-flight handler finish and then ends the task.

use crate::{
    consumer::{consume, ConsumeOptions, ConsumerHandler},
    transport::DeliveryStream,
};
use futures_util::StreamExt;
use opentelemetry::global;
use std::sync::Arc;
use tokio::{sync::oneshot, task::JoinHandle};
use tracing::{debug, error, warn};

/// Handle on the task dispatching one queue's deliveries.
pub(crate) struct ConsumerWorker {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl ConsumerWorker {
    pub(crate) fn spawn(
        queue: String,
        mut stream: DeliveryStream,
        handler: Arc<dyn ConsumerHandler>,
        options: ConsumeOptions,
    ) -> ConsumerWorker {
        let (shutdown, mut stopped) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            let tracer = global::tracer("amqp consumer");

            loop {
                let next = tokio::select! {
                    biased;
                    _ = &mut stopped => break,
                    next = stream.next() => next,
                };

                match next {
                    Some(Ok(Some(delivery))) => {
                        if let Err(err) =
                            consume(&tracer, &queue, delivery, handler.as_ref(), &options).await
                        {
                            error!(error = err.to_string(), queue, "error consume msg");
                        }
                    }
                    Some(Ok(None)) => warn!(queue, "consumer cancelled by the broker"),
                    Some(Err(err)) => error!(error = err.to_string(), queue, "errors consume msg"),
                    None => break,
                }
            }

            debug!(queue, "consumer stopped");
        });

        ConsumerWorker { shutdown, task }
    }

    /// Signals the task to stop and waits until it did.
    pub(crate) async fn stop(self) {
        let _ = self.shutdown.send(());

        if let Err(err) = self.task.await {
            if !err.is_cancelled() {
                error!(error = err.to_string(), "consumer task failure");
            }
        }
    }
}
