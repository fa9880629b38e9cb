//! Consume-and-dispatch loop.
//!
//! One background task per [`EventBus`](crate::EventBus). It opens a
//! consumer session on the service queue, dispatches each delivery to every
//! handler registered for its routing key and acknowledges it. When the
//! broker ends the delivery stream the task rebuilds the session, topology
//! included, and carries on.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::backoff::{next_delay, sleep_or_cancel, BackoffConfig};
use crate::broker::{Delivery, DeliveryStream, ExchangeKind, QueueOptions};
use crate::connection::{ConnectionError, PersistentConnection, Session};
use crate::handler::HandlerScope;
use crate::registry::SubscriptionRegistry;
use crate::subscription::DispatchError;
use crate::EXCHANGE_NAME;

/// How long [`ConsumerHandle::shutdown`] waits for the task to finish.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything the consume loop needs, shared with the bus.
#[derive(Clone)]
pub(crate) struct ConsumerContext {
    pub connection: Arc<PersistentConnection>,
    pub registry: Arc<RwLock<SubscriptionRegistry>>,
    pub scope: Arc<dyn HandlerScope>,
    pub queue_name: String,
    pub backoff: BackoffConfig,
}

/// A running consume loop.
pub(crate) struct ConsumerHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ConsumerHandle {
    /// Spawn the loop. `cancel` should be a child of the bus token.
    pub fn spawn(context: ConsumerContext, cancel: CancellationToken) -> Self {
        let task = tokio::spawn(run(context, cancel.clone()));
        Self { cancel, task }
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Cancel the loop and wait for it to finish.
    ///
    /// A handler that is already running finishes and its delivery is
    /// acknowledged, however long it takes; nothing new is dispatched.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "Consumer task failed");
        }
    }

    /// Like [`stop`](Self::stop), but aborts the task after
    /// [`SHUTDOWN_TIMEOUT`]. An aborted in-flight delivery is left
    /// unacknowledged and the broker redelivers it.
    pub async fn shutdown(self) {
        self.cancel.cancel();

        let mut task = self.task;
        match tokio::time::timeout(SHUTDOWN_TIMEOUT, &mut task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!(error = %e, "Consumer task failed"),
            Err(_) => {
                tracing::warn!("Consumer task did not stop in time, aborting");
                task.abort();
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Loop
// ---------------------------------------------------------------------------

async fn run(context: ConsumerContext, cancel: CancellationToken) {
    let queue = context.queue_name.as_str();
    let mut delay = context.backoff.initial_delay;

    'session: loop {
        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => break 'session,
            opened = open_consumer(&context) => opened,
        };

        let (session, mut deliveries) = match opened {
            Ok(opened) => {
                delay = context.backoff.initial_delay;
                opened
            }
            Err(e) => {
                tracing::warn!(
                    queue,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Could not start consumer, retrying",
                );
                if !sleep_or_cancel(delay, &cancel).await {
                    break 'session;
                }
                delay = next_delay(delay, &context.backoff);
                continue 'session;
            }
        };

        tracing::info!(queue, "Consumer started");

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break 'session,
                delivery = deliveries.recv() => match delivery {
                    Some(delivery) => process_delivery(&context, &session, delivery).await,
                    None => break,
                },
            }
        }

        tracing::warn!(queue, "Consumer channel closed, recreating");
    }

    tracing::info!(queue, "Consumer stopped");
}

/// Connect if needed, declare topology, rebind every subscribed event
/// name and start consuming.
async fn open_consumer(
    context: &ConsumerContext,
) -> Result<(Session, DeliveryStream), ConnectionError> {
    if !context.connection.is_connected().await {
        context.connection.try_connect().await;
    }

    let session = context.connection.open_session().await?;
    session
        .exchange_declare(EXCHANGE_NAME, ExchangeKind::Direct)
        .await?;
    session
        .queue_declare(&context.queue_name, QueueOptions::durable())
        .await?;

    let event_names = context.registry.read().await.event_names();
    for event_name in &event_names {
        session
            .queue_bind(&context.queue_name, EXCHANGE_NAME, event_name)
            .await?;
    }

    let deliveries = session.basic_consume(&context.queue_name).await?;
    Ok((session, deliveries))
}

/// Dispatch one delivery to its handlers, then acknowledge it.
async fn process_delivery(context: &ConsumerContext, session: &Session, delivery: Delivery) {
    let event_name = delivery.routing_key.as_str();
    let body: Arc<[u8]> = Arc::from(delivery.body);
    let message = String::from_utf8_lossy(&body);

    tracing::info!(
        event_name,
        redelivered = delivery.redelivered,
        "Processing event: {message}",
    );

    let subscriptions = context
        .registry
        .read()
        .await
        .get_handlers_for_event(event_name);

    if subscriptions.is_empty() {
        tracing::warn!(event_name, "No subscription for event");
    }

    for subscription in &subscriptions {
        let handler = subscription.handler();
        let invocation = subscription.invoke(Arc::clone(&context.scope), Arc::clone(&body));

        let outcome = match AssertUnwindSafe(invocation).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(payload) => {
                tracing::warn!(
                    event_name,
                    %handler,
                    panic = panic_message(&*payload),
                    "Handler panicked processing message \"{message}\"",
                );
                continue;
            }
        };

        match outcome {
            Ok(()) => {
                tracing::debug!(event_name, %handler, "Handled event");
            }
            Err(DispatchError::Unresolved(_)) => {
                tracing::warn!(event_name, %handler, "Handler could not be resolved, skipping");
            }
            Err(e) => {
                tracing::warn!(
                    event_name,
                    %handler,
                    error = %e,
                    "Error processing message \"{message}\"",
                );
            }
        }
    }

    // Acked even when handlers failed; there is no dead-letter queue.
    if let Err(e) = session.basic_ack(delivery.delivery_tag).await {
        tracing::warn!(
            event_name,
            delivery_tag = delivery.delivery_tag,
            error = %e,
            "Failed to acknowledge delivery",
        );
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "<non-string panic payload>"
    }
}
