//! Reliable message delivery on a single named channel
//!
//! A [`ChannelTransport`] wraps the raw pub/sub backend for one channel in both
//! directions. Publishing is fire-and-forget; subscribing hands all deliveries
//! to one consumer through an unbounded queue and keeps itself alive across
//! silent broker-side subscription loss by periodically tearing down and
//! re-establishing the subscription.

use crate::metrics::{MetricEvent, MetricSink};
use crate::storage::PubSubBackend;
use log::{debug, error, warn};
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep, sleep_until, Instant};

/// Delay between subscription attempts after a backend failure
const SUBSCRIBE_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Lower bound of the per-instance resubscription jitter
const JITTER_MIN: Duration = Duration::from_millis(100);
/// Upper bound (exclusive) of the per-instance resubscription jitter
const JITTER_MAX: Duration = Duration::from_secs(10);

/// Error type for transport operations
#[derive(Error, Debug)]
pub enum TransportError {
    /// A transport carries at most one subscription
    #[error("channel transport is already subscribed")]
    AlreadySubscribed,
    /// The transport was closed before the first subscription became ready
    #[error("channel transport was closed")]
    Closed,
}

/// Duplex handle onto one logical pub/sub channel
///
/// Cheap to clone; all clones share the same subscription and shutdown state.
pub struct ChannelTransport<B: PubSubBackend> {
    inner: Arc<Inner<B>>,
}

impl<B: PubSubBackend> Clone for ChannelTransport<B> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct Inner<B> {
    backend: Arc<B>,
    channel: String,
    metrics: Arc<dyn MetricSink>,
    resubscribe_interval: Option<Duration>,
    /// Fixed per instance so a fleet of processes spreads its resubscriptions
    jitter: Duration,
    shutdown: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    subscribed: AtomicBool,
}

impl<B: PubSubBackend> ChannelTransport<B> {
    /// Creates a new transport for the given channel
    ///
    /// No connection is touched until the first [`publish`](Self::publish) or
    /// [`subscribe`](Self::subscribe) call.
    pub fn new(
        backend: Arc<B>,
        channel: String,
        resubscribe_interval: Option<Duration>,
        metrics: Arc<dyn MetricSink>,
    ) -> Self {
        let jitter = rand::thread_rng().gen_range(JITTER_MIN..JITTER_MAX);
        let (shutdown, shutdown_rx) = watch::channel(false);

        Self {
            inner: Arc::new(Inner {
                backend,
                channel,
                metrics,
                resubscribe_interval,
                jitter,
                shutdown,
                shutdown_rx,
                subscribed: AtomicBool::new(false),
            }),
        }
    }

    /// Name of the channel this transport is bound to
    pub fn channel(&self) -> &str {
        &self.inner.channel
    }

    /// Publishes a message on the channel, fire-and-forget
    ///
    /// Backend errors are logged and fed to the metric sink but never surface;
    /// reliability on top of this layer is the caller's concern.
    pub async fn publish(&self, message: String) {
        debug!("publishing message on channel {}", self.inner.channel);
        self.inner.metrics.record(MetricEvent::Publish);

        if let Err(e) = self.inner.backend.publish(&self.inner.channel, &message).await {
            error!("failed to publish on channel {}: {}", self.inner.channel, e);
            self.inner.metrics.record(MetricEvent::StoreError);
        }
    }

    /// Subscribes to the channel and returns the stream of delivered messages
    ///
    /// Resolves once the first subscription has been established, exactly once
    /// per transport even though the subscription itself may be re-established
    /// many times afterwards. At most one subscription may exist per instance.
    pub async fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<String>, TransportError> {
        if self.inner.subscribed.swap(true, Ordering::SeqCst) {
            return Err(TransportError::AlreadySubscribed);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();

        tokio::spawn(subscription_daemon(self.inner.clone(), tx, ready_tx));

        ready_rx.await.map_err(|_| TransportError::Closed)?;
        Ok(rx)
    }

    /// Shuts down the subscription daemon; idempotent
    pub fn close(&self) {
        self.inner.shutdown.send_replace(true);
    }
}

/// Keeps one subscription to the channel alive until shutdown
///
/// Re-establishes the subscription whenever the backend stream ends, a backend
/// error occurs, or the forced resubscription deadline elapses. The underlying
/// store client's own reconnect behavior covers everything below this loop.
async fn subscription_daemon<B: PubSubBackend>(
    inner: Arc<Inner<B>>,
    tx: mpsc::UnboundedSender<String>,
    ready: oneshot::Sender<()>,
) {
    use futures::StreamExt;

    let mut shutdown = inner.shutdown_rx.clone();
    let mut ready = Some(ready);

    loop {
        if *shutdown.borrow() {
            return;
        }

        let mut stream = match inner.backend.subscribe(&inner.channel).await {
            Ok(stream) => stream,
            Err(e) => {
                error!("failed to subscribe to channel {}: {}", inner.channel, e);
                inner.metrics.record(MetricEvent::StoreError);

                tokio::select! {
                    _ = shutdown.changed() => return,
                    _ = sleep(SUBSCRIBE_RETRY_DELAY) => continue,
                }
            }
        };

        debug!("subscribed to channel {}", inner.channel);
        inner.metrics.record(MetricEvent::Subscribe);

        if let Some(ready) = ready.take() {
            ready.send(()).ok();
        }

        let deadline = inner
            .resubscribe_interval
            .map(|interval| Instant::now() + interval + inner.jitter);

        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = forced_resubscription(deadline) => {
                    debug!("forcing resubscription of channel {}", inner.channel);
                    break;
                }
                message = stream.next() => match message {
                    Some(message) if message.channel == inner.channel => {
                        inner.metrics.record(MetricEvent::MessageReceived);

                        // The consumer dropped its receiver, nothing left to do
                        if tx.send(message.payload).is_err() {
                            return;
                        }
                    }
                    Some(message) => {
                        debug!(
                            "dropping message for foreign channel {} on subscription for {}",
                            message.channel, inner.channel
                        );
                    }
                    None => {
                        warn!("subscription stream for channel {} ended", inner.channel);
                        inner.metrics.record(MetricEvent::StoreError);

                        // A backend which hands out instantly-ending streams
                        // must not turn this loop into a hot resubscribe spin
                        tokio::select! {
                            _ = shutdown.changed() => return,
                            _ = sleep(SUBSCRIBE_RETRY_DELAY) => break,
                        }
                    }
                }
            }
        }
    }
}

/// Sleeps until the forced resubscription deadline, or forever if disabled
async fn forced_resubscription(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => futures::future::pending().await,
    }
}
