use super::ActiveSessions;
use crate::error::{BrokerError, BrokerResult};
use crate::message::{Acker, Message};
use crate::observability::BrokerMetrics;
use crate::registry::ResolvedSubscription;
use crate::session_span;
use crate::transport::{AmqpChannel, ConnectionManager, ConsumeOptions, Delivery, TransportError};
use std::fmt;
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

/// A live consumer attached to one subscription's queue
///
/// Cloning yields another handle to the same session. Messages are fanned
/// out to every receiver obtained from [`SubscriberSession::messages`].
#[derive(Clone)]
pub struct SubscriberSession {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    id: u64,
    subscription: ResolvedSubscription,
    channel: Arc<dyn AmqpChannel>,
    consumer_tag: String,
    timeout: Duration,
    events: StdMutex<Option<broadcast::Sender<Message>>>,
    /// Receiver created with the session so the first reader misses nothing
    initial_rx: StdMutex<Option<broadcast::Receiver<Message>>>,
    token: CancellationToken,
    pump: StdMutex<Option<JoinHandle<()>>>,
    cancelled: Mutex<bool>,
    active: Weak<ActiveSessions>,
    metrics: Arc<BrokerMetrics>,
}

impl SubscriberSession {
    /// Open a channel, start consuming and spawn the delivery pump
    pub(crate) async fn open(
        id: u64,
        subscription: ResolvedSubscription,
        connections: &ConnectionManager,
        active: Weak<ActiveSessions>,
        metrics: Arc<BrokerMetrics>,
    ) -> BrokerResult<Self> {
        let timeout = connections.timeout(&subscription.vhost)?;
        let channel = connections.channel(&subscription.vhost).await?;

        let consumer = match start_consumer(&subscription, channel.as_ref(), timeout).await {
            Ok(consumer) => consumer,
            Err(e) => {
                if let Err(close_error) = channel.close().await {
                    debug!("Failed to close channel after consume error: {}", close_error);
                }
                return Err(e);
            }
        };

        let (sender, initial_rx) = broadcast::channel(subscription.event_buffer);
        let token = CancellationToken::new();
        let span = session_span!(
            subscription = %subscription.name,
            vhost = %subscription.vhost,
            consumer_tag = %consumer.tag
        );
        let pump = tokio::spawn(
            pump_deliveries(
                consumer.deliveries,
                sender.clone(),
                token.clone(),
                PumpContext {
                    subscription: subscription.name.clone(),
                    vhost: subscription.vhost.clone(),
                    channel: (!subscription.options.no_ack).then(|| Arc::clone(&channel)),
                    timeout,
                    metrics: Arc::clone(&metrics),
                },
            )
            .instrument(span),
        );

        metrics.session_opened();
        info!(
            "Subscribed {} to {} on vhost {}",
            subscription.name, subscription.queue, subscription.vhost
        );

        Ok(Self {
            inner: Arc::new(SessionInner {
                id,
                consumer_tag: consumer.tag,
                subscription,
                channel,
                timeout,
                events: StdMutex::new(Some(sender)),
                initial_rx: StdMutex::new(Some(initial_rx)),
                token,
                pump: StdMutex::new(Some(pump)),
                cancelled: Mutex::new(false),
                active,
                metrics,
            }),
        })
    }

    pub(crate) fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.subscription.name
    }

    pub fn vhost(&self) -> &str {
        &self.inner.subscription.vhost
    }

    pub fn subscription(&self) -> &ResolvedSubscription {
        &self.inner.subscription
    }

    pub fn consumer_tag(&self) -> &str {
        &self.inner.consumer_tag
    }

    pub fn is_active(&self) -> bool {
        !self.inner.token.is_cancelled()
    }

    /// Receive this session's messages
    ///
    /// The first call returns a receiver that has seen every delivery since
    /// the session opened; later calls only see subsequent deliveries. Once
    /// the session is cancelled, receivers yield the remaining buffered
    /// messages and then report the channel closed.
    pub fn messages(&self) -> broadcast::Receiver<Message> {
        if let Some(receiver) = self.inner.initial_rx.lock().ok().and_then(|mut rx| rx.take()) {
            return receiver;
        }

        let sender = self
            .inner
            .events
            .lock()
            .ok()
            .and_then(|events| events.as_ref().map(broadcast::Sender::subscribe));
        sender.unwrap_or_else(|| broadcast::channel(1).1)
    }

    /// Cancel the consumer and wait for the broker to acknowledge
    ///
    /// When this returns, the session will emit no further messages.
    /// Cancelling twice is a no-op.
    pub async fn cancel(&self) -> BrokerResult<()> {
        let inner = &self.inner;
        let mut cancelled = inner.cancelled.lock().await;
        if *cancelled {
            return Ok(());
        }

        let result = match tokio::time::timeout(
            inner.timeout,
            inner.channel.cancel(&inner.consumer_tag),
        )
        .await
        {
            Ok(Ok(())) | Ok(Err(TransportError::ChannelClosed)) => Ok(()),
            Ok(Err(TransportError::ConnectionClosed)) => Ok(()),
            Ok(Err(e)) => Err(BrokerError::channel(
                "cancel consumer",
                format!("{} on subscription {}", inner.consumer_tag, self.name()),
                e,
            )),
            Err(_) => Err(BrokerError::timeout(
                "cancel consumer",
                format!("{} on subscription {}", inner.consumer_tag, self.name()),
                inner.timeout,
            )),
        };

        if result.is_err() {
            inner.token.cancel();
        }

        // Deliveries that reached the consumer before the cancel-ok are still emitted
        let pump = inner.pump.lock().ok().and_then(|mut pump| pump.take());
        if let Some(mut pump) = pump {
            if tokio::time::timeout(inner.timeout, &mut pump).await.is_err() {
                warn!(
                    "Delivery pump for {} did not drain in time, aborting",
                    self.name()
                );
                inner.token.cancel();
                pump.abort();
            }
        }

        inner.token.cancel();
        if let Ok(mut events) = inner.events.lock() {
            events.take();
        }
        if let Ok(mut initial_rx) = inner.initial_rx.lock() {
            initial_rx.take();
        }
        match tokio::time::timeout(inner.timeout, inner.channel.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("Failed to close channel for {}: {}", self.name(), e),
            Err(_) => debug!("Timed out closing channel for {}", self.name()),
        }

        if let Some(active) = inner.active.upgrade() {
            active.remove(inner.id);
        }
        inner.metrics.session_cancelled();
        *cancelled = true;

        info!("Cancelled subscription {}", self.name());
        result
    }
}

impl fmt::Debug for SubscriberSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriberSession")
            .field("name", &self.name())
            .field("vhost", &self.vhost())
            .field("queue", &self.inner.subscription.queue)
            .field("consumer_tag", &self.inner.consumer_tag)
            .field("active", &self.is_active())
            .finish()
    }
}

async fn start_consumer(
    subscription: &ResolvedSubscription,
    channel: &dyn AmqpChannel,
    timeout: Duration,
) -> BrokerResult<crate::transport::Consumer> {
    let target = format!("queue {}", subscription.queue);

    if let Some(prefetch) = effective_prefetch(subscription) {
        match tokio::time::timeout(timeout, channel.set_prefetch(prefetch)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(BrokerError::channel("set prefetch for", target, e)),
            Err(_) => return Err(BrokerError::timeout("set prefetch for", target, timeout)),
        }
    }

    let options = ConsumeOptions {
        no_ack: subscription.options.no_ack,
        exclusive: subscription.options.exclusive,
        consumer_tag: None,
    };
    match tokio::time::timeout(timeout, channel.consume(&subscription.queue, &options)).await {
        Ok(Ok(consumer)) => Ok(consumer),
        Ok(Err(e)) => Err(BrokerError::channel("consume from", target, e)),
        Err(_) => Err(BrokerError::timeout("consume from", target, timeout)),
    }
}

/// Prefetch applied to the consumer's channel
///
/// In ack mode the broker may never have more unacknowledged deliveries in
/// flight than the session's event buffer holds, otherwise a slow listener
/// would lag past messages the broker still considers delivered.
fn effective_prefetch(subscription: &ResolvedSubscription) -> Option<u16> {
    if subscription.options.no_ack {
        return subscription.prefetch;
    }
    let buffer = u16::try_from(subscription.event_buffer).unwrap_or(u16::MAX);
    match subscription.prefetch {
        Some(prefetch) if prefetch > 0 => Some(prefetch.min(buffer)),
        _ => Some(buffer),
    }
}

struct PumpContext {
    subscription: String,
    vhost: String,
    /// Present when deliveries must be acknowledged
    channel: Option<Arc<dyn AmqpChannel>>,
    timeout: Duration,
    metrics: Arc<BrokerMetrics>,
}

/// Forward deliveries until the consumer stream ends or the token fires
async fn pump_deliveries(
    mut deliveries: mpsc::UnboundedReceiver<Delivery>,
    sender: broadcast::Sender<Message>,
    token: CancellationToken,
    context: PumpContext,
) {
    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            delivery = deliveries.recv() => {
                let Some(delivery) = delivery else { break };
                let acker = context
                    .channel
                    .as_ref()
                    .map(|channel| Acker::new(Arc::clone(channel), delivery.delivery_tag, context.timeout));
                let message =
                    Message::from_delivery(&context.subscription, &context.vhost, delivery, acker);
                context.metrics.message_delivered();
                // No receivers is not an error: messages are dropped until someone listens
                let _ = sender.send(message);
            }
        }
    }
    debug!("Delivery pump stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SubscribeOptions;

    fn subscription(prefetch: Option<u16>, event_buffer: usize, no_ack: bool) -> ResolvedSubscription {
        ResolvedSubscription {
            name: "s1".to_string(),
            vhost: "v1".to_string(),
            queue: "ns:q1".to_string(),
            prefetch,
            options: SubscribeOptions {
                no_ack,
                exclusive: false,
            },
            event_buffer,
            auto_created: false,
        }
    }

    #[test]
    fn test_prefetch_defaults_to_event_buffer() {
        assert_eq!(effective_prefetch(&subscription(None, 16, false)), Some(16));
        assert_eq!(effective_prefetch(&subscription(Some(0), 16, false)), Some(16));
    }

    #[test]
    fn test_prefetch_never_exceeds_event_buffer() {
        assert_eq!(effective_prefetch(&subscription(Some(4), 16, false)), Some(4));
        assert_eq!(effective_prefetch(&subscription(Some(100), 16, false)), Some(16));
        assert_eq!(
            effective_prefetch(&subscription(None, 1_000_000, false)),
            Some(u16::MAX)
        );
    }

    #[test]
    fn test_no_ack_keeps_configured_prefetch() {
        assert_eq!(effective_prefetch(&subscription(None, 16, true)), None);
        assert_eq!(effective_prefetch(&subscription(Some(100), 16, true)), Some(100));
    }
}
