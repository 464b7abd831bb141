//! Task correlation engine turning broadcast pub/sub into request/response calls
//!
//! One [`TaskRelay`] instance owns two [`ChannelTransport`]s per topic: tasks
//! go out on `out:{topic}`, results come back on `inc:{topic}`. The sending
//! side keeps a correlation table of pending calls keyed by task id; the
//! receiving side claims each delivered task through the [`TaskLock`] before
//! invoking the user handler, so a fleet of receivers processes every task at
//! most once even though all of them see the broadcast.

use crate::breaker::CircuitBreaker;
use crate::config::RelayOptions;
use crate::envelope::{Envelope, TaskPayload};
use crate::lock::TaskLock;
use crate::metrics::{MetricEvent, MetricSink, NoopMetricSink};
use crate::storage::{KeyValueStore, PubSubBackend};
use crate::transport::{ChannelTransport, TransportError};
use crate::BoxedError;
use async_trait::async_trait;
use log::{debug, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, OnceCell};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant};
use uuid::Uuid;

/// Resolution of one pending call: payload or the receiver's error string
type TaskOutcome = Result<TaskPayload, String>;

/// Correlation table of pending calls
///
/// Removing an entry is the one and only resolution step; whichever path
/// (response or deadline) removes it first wins and every later attempt finds
/// the id gone and backs off. That makes resolution idempotent by construction.
type PendingTable = Arc<Mutex<HashMap<String, oneshot::Sender<TaskOutcome>>>>;

/// Error type for sending tasks
#[derive(Error, Debug)]
pub enum SendError {
    /// The circuit breaker is open; nothing was published
    #[error("circuit breaker is open")]
    CircuitOpen,
    /// No response arrived within the configured deadline
    #[error("task ran into timeout after {0:?}")]
    Timeout(Duration),
    /// The processing receiver reported an application error
    #[error("receiver reported an error: {0}")]
    Remote(String),
    /// The payload could not be serialized for transmission
    #[error("payload could not be serialized")]
    Serialize(#[source] serde_json::Error),
    /// The response subscription could not be established
    #[error("response subscription could not be established")]
    Subscription(#[from] TransportError),
    /// The relay was closed
    #[error("relay was closed")]
    Closed,
}

/// Error type for receiver setup
#[derive(Error, Debug)]
pub enum RelayError {
    /// Receiver setup may run at most once per relay instance
    #[error("receiver setup already ran")]
    ReceiverAlreadyActive,
    /// The task subscription could not be established
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Processor of received tasks on the receiving side of a topic
#[async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    /// Processes one claimed task and returns its result
    ///
    /// The returned error crosses the wire as a string and resolves the
    /// original sender's call as an application error.
    async fn handle(&self, task: TaskPayload) -> Result<TaskPayload, BoxedError>;
}

/// Duplex request/response endpoint on one topic
///
/// A single instance can send, receive, or both. Multiple instances on the
/// same topic share nothing but the store and the broker: horizontal scaling
/// of receivers is coordinated purely through the distributed lock.
pub struct TaskRelay<S: KeyValueStore + PubSubBackend> {
    options: RelayOptions,
    metrics: Arc<dyn MetricSink>,
    outbound: ChannelTransport<S>,
    inbound: ChannelTransport<S>,
    lock: TaskLock<S>,
    breaker: Arc<CircuitBreaker>,
    pending: PendingTable,
    sender_ready: OnceCell<()>,
    receiver_active: AtomicBool,
    paused: Arc<AtomicBool>,
    sampler: JoinHandle<()>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    receiver: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl<S: KeyValueStore + PubSubBackend> TaskRelay<S> {
    /// Creates a new relay on the given store, discarding all metric events
    pub fn new(store: Arc<S>, options: RelayOptions) -> Self {
        Self::with_metrics(store, options, Arc::new(NoopMetricSink))
    }

    /// Creates a new relay emitting metric events into the given sink
    ///
    /// Spawns the breaker sampling task and therefore must be called from
    /// within a Tokio runtime.
    pub fn with_metrics(
        store: Arc<S>,
        options: RelayOptions,
        metrics: Arc<dyn MetricSink>,
    ) -> Self {
        if options.lock_ttl <= options.timeout {
            warn!(
                "lock TTL ({:?}) does not exceed the send timeout ({:?}); a lock expiring \
                 mid-processing allows a second receiver to claim the same task",
                options.lock_ttl, options.timeout
            );
        }

        let outbound = ChannelTransport::new(
            store.clone(),
            format!("out:{}", options.topic),
            options.resubscribe_interval,
            metrics.clone(),
        );
        let inbound = ChannelTransport::new(
            store.clone(),
            format!("inc:{}", options.topic),
            options.resubscribe_interval,
            metrics.clone(),
        );
        let lock = TaskLock::new(
            store,
            options.topic.clone(),
            options.lock_ttl,
            options.lockability_ttl,
        );

        let breaker = Arc::new(CircuitBreaker::new(options.timeout_threshold));
        let sampler = spawn_breaker_sampler(breaker.clone(), options.circuit_check_interval);

        Self {
            options,
            metrics,
            outbound,
            inbound,
            lock,
            breaker,
            pending: Arc::new(Mutex::new(HashMap::new())),
            sender_ready: OnceCell::new(),
            receiver_active: AtomicBool::new(false),
            paused: Arc::new(AtomicBool::new(false)),
            sampler,
            dispatcher: Mutex::new(None),
            receiver: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Sends a task to whichever receiver on the topic claims it first
    ///
    /// Resolves with the receiver's result, the receiver's application error,
    /// or a timeout, whichever happens first. Fails fast without touching the
    /// network while the circuit breaker is open.
    pub async fn send<P: Into<TaskPayload>>(&self, payload: P) -> Result<TaskPayload, SendError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SendError::Closed);
        }

        if self.breaker.is_open() {
            return Err(SendError::CircuitOpen);
        }

        self.ensure_sender().await?;

        let payload = payload.into();
        let id = Uuid::new_v4().to_string();
        let encoded = Envelope::request(id.clone(), &payload)
            .and_then(|envelope| envelope.encode())
            .map_err(SendError::Serialize)?;

        let (tx, mut rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(id.clone(), tx);

        debug!("dispatching task {} on topic {}", id, self.options.topic);
        self.metrics.record(MetricEvent::SendDispatched);
        let dispatched = Instant::now();

        self.outbound.publish(encoded).await;

        match timeout(self.options.timeout, &mut rx).await {
            Ok(outcome) => self.conclude(dispatched, outcome),
            Err(_elapsed) => {
                if self.pending.lock().unwrap().remove(&id).is_some() {
                    debug!("task {} ran into timeout after {:?}", id, self.options.timeout);
                    self.breaker.record_timeout();
                    self.metrics.record(MetricEvent::SendTimeout);
                    Err(SendError::Timeout(self.options.timeout))
                } else {
                    // The response won the photo-finish against the deadline:
                    // the dispatcher already took the entry and completes the
                    // oneshot momentarily.
                    let outcome = rx.await;
                    self.conclude(dispatched, outcome)
                }
            }
        }
    }

    /// Registers the task handler and starts receiving on this instance
    ///
    /// May be called at most once per relay; a second call is a programming
    /// error and fails loudly instead of silently replacing the handler.
    pub async fn setup_receiver<H: TaskHandler>(&self, handler: H) -> Result<(), RelayError> {
        if self.receiver_active.swap(true, Ordering::SeqCst) {
            return Err(RelayError::ReceiverAlreadyActive);
        }

        let mut tasks = self.outbound.subscribe().await?;

        let handler = Arc::new(handler);
        let lock = self.lock.clone();
        let inbound = self.inbound.clone();
        let paused = self.paused.clone();

        let handle = tokio::spawn(async move {
            while let Some(raw) = tasks.recv().await {
                if paused.load(Ordering::SeqCst) {
                    debug!("received task but receiver is paused");
                    continue;
                }

                let envelope = match Envelope::parse(&raw) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        warn!("received malformed task: {} ({})", raw, e);
                        continue;
                    }
                };

                match lock.try_acquire(&envelope.id).await {
                    Ok(true) => {}
                    Ok(false) => {
                        debug!("task {} is already claimed by another receiver", envelope.id);
                        continue;
                    }
                    Err(e) => {
                        warn!("failed to claim task {}: {}", envelope.id, e);
                        continue;
                    }
                }

                let payload = match envelope.decode_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(
                            "claimed task {} carries an undecodable payload: {}",
                            envelope.id, e
                        );
                        lock.release(&envelope.id).await;
                        continue;
                    }
                };

                // Process off the delivery loop so a slow task does not hold
                // up the channel; each task is an independent claim/process/
                // respond cycle with no ordering across ids.
                let handler = handler.clone();
                let lock = lock.clone();
                let inbound = inbound.clone();
                let id = envelope.id;

                tokio::spawn(async move {
                    let result = handler.handle(payload).await;

                    // Free the claim before responding so it does not linger
                    // for its full TTL
                    lock.release(&id).await;

                    let response = match result {
                        Ok(payload) => Envelope::success(id.clone(), &payload),
                        Err(error) => Ok(Envelope::failure(id.clone(), error.to_string())),
                    };

                    match response.and_then(|envelope| envelope.encode()) {
                        Ok(encoded) => inbound.publish(encoded).await,
                        Err(e) => warn!("result of task {} could not be serialized: {}", id, e),
                    }
                });
            }
        });

        self.receiver.lock().unwrap().replace(handle);
        Ok(())
    }

    /// Stops processing newly delivered tasks without tearing down the subscription
    ///
    /// Intended for graceful-drain scenarios; combine with
    /// [`pending_count`](Self::pending_count) on the sending side to confirm
    /// drain-to-zero before shutdown.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    /// Resumes processing of newly delivered tasks
    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    /// Whether this receiver currently drops newly delivered tasks
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Whether the circuit breaker currently rejects new sends
    pub fn is_circuit_open(&self) -> bool {
        self.breaker.is_open()
    }

    /// Number of sends still awaiting resolution
    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    /// Handle onto the distributed lock key-space of this topic
    ///
    /// Exposed for deployments using the lockability guard; the relay itself
    /// only ever acquires and releases processing locks.
    pub fn lock(&self) -> &TaskLock<S> {
        &self.lock
    }

    /// Stops the background tasks and both channel transports; idempotent
    ///
    /// Teardown is issued immediately and does not wait for in-flight pending
    /// entries, which resolve through their own timeouts.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.sampler.abort();
        if let Some(handle) = self.dispatcher.lock().unwrap().take() {
            handle.abort();
        }
        if let Some(handle) = self.receiver.lock().unwrap().take() {
            handle.abort();
        }
        self.outbound.close();
        self.inbound.close();
    }

    /// One-time setup of the response subscription, shared by all sends
    ///
    /// Concurrent first sends all wait on the same initialization and proceed
    /// once it completes.
    async fn ensure_sender(&self) -> Result<(), TransportError> {
        self.sender_ready
            .get_or_try_init(|| async {
                let messages = self.inbound.subscribe().await?;
                let handle = spawn_response_dispatcher(self.pending.clone(), messages);
                self.dispatcher.lock().unwrap().replace(handle);
                Ok(())
            })
            .await
            .map(|_| ())
    }

    /// Completes a resolved send, emitting the completion metrics
    fn conclude(
        &self,
        dispatched: Instant,
        outcome: Result<TaskOutcome, oneshot::error::RecvError>,
    ) -> Result<TaskPayload, SendError> {
        let outcome = outcome.map_err(|_| SendError::Closed)?;

        self.metrics.record(MetricEvent::SendCompleted);
        self.metrics.record(MetricEvent::Duration(dispatched.elapsed()));

        outcome.map_err(SendError::Remote)
    }
}

impl<S: KeyValueStore + PubSubBackend> Drop for TaskRelay<S> {
    fn drop(&mut self) {
        self.close();
    }
}

/// Samples the circuit breaker on a fixed interval
fn spawn_breaker_sampler(breaker: Arc<CircuitBreaker>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticks = interval_at(Instant::now() + period, period);

        loop {
            ticks.tick().await;
            breaker.sample();
        }
    })
}

/// Resolves pending calls from envelopes arriving on the inbound channel
fn spawn_response_dispatcher(
    pending: PendingTable,
    mut messages: mpsc::UnboundedReceiver<String>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(raw) = messages.recv().await {
            let envelope = match Envelope::parse(&raw) {
                Ok(envelope) => envelope,
                Err(e) => {
                    // Cannot be attributed to any pending call, drop it
                    warn!("received malformed response: {} ({})", raw, e);
                    continue;
                }
            };

            let tx = match pending.lock().unwrap().remove(&envelope.id) {
                Some(tx) => tx,
                None => {
                    // The expected common case on a shared topic: this response
                    // answers some other sender's task, or ours timed out.
                    debug!(
                        "task {} is not pending on this sender, or it resolved already",
                        envelope.id
                    );
                    continue;
                }
            };

            let outcome = match envelope.error {
                Some(error) => Err(error),
                None => match envelope.decode_payload() {
                    Ok(payload) => Ok(payload),
                    // Attributable to the pending call, so it resolves the
                    // call instead of leaving it to time out
                    Err(e) => Err(format!("response payload could not be decoded: {}", e)),
                },
            };

            // The sender may have resolved through its deadline in the meantime
            tx.send(outcome).ok();
        }
    })
}
