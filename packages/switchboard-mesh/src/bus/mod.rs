//! In-memory message bus.
//!
//! Per-message state machine:
//!
//! ```text
//! created -> dispatched -> completed
//!                       -> retry-scheduled -> dispatched -> ...
//!                       -> dead-lettered
//! ```
//!
//! All handlers subscribed to a message's type run concurrently and are
//! awaited as a group; the message succeeds only if every handler succeeds.
//! A failed message is retried after `min(2^retry_count * base, cap)` until
//! `max_retries` retries have been spent, then republished as `dead_letter`.
//!
//! Ordering is weak: same-type messages are not FIFO once retries happen, and
//! distinct types carry no relative order. Callers that need strict ordering
//! must put sequence numbers in their payloads.

pub mod handler;
pub mod retry;
pub mod transport;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use futures_util::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::{json, Value};
use switchboard_core::{
    ClockSource, DeadLetterRecord, DeliveryTarget, MessageId, MessageType, QueueMessage, SystemClock,
};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::BusConfig;
use crate::error::MeshError;
use crate::notify::{LogNotifier, Notification, NotificationLevel, Notifier};
use crate::worker::BackgroundWorker;

pub use handler::{handler_fn, FnHandler, HandlerId, MessageHandler};
use handler::HandlerIds;
pub use retry::{backoff_delay, RetryCommand};
use retry::{RetryDrainer, RetryQueue};
pub use transport::{BroadcastTransport, Envelope, Transport};

// ---------------------------------------------------------------------------
// PublishOptions
// ---------------------------------------------------------------------------

/// Options for [`MessageBus::publish`].
#[derive(Debug, Clone, Copy, Default)]
pub struct PublishOptions {
    /// Hold the message back for this long before dispatching it.
    pub delay: Option<Duration>,
    /// Retry budget; `None` uses [`BusConfig::default_max_retries`].
    pub max_retries: Option<u32>,
    pub target: DeliveryTarget,
}

impl PublishOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    #[must_use]
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    #[must_use]
    pub fn target(mut self, target: DeliveryTarget) -> Self {
        self.target = target;
        self
    }

    /// Fire-and-forget: no retries.
    #[must_use]
    pub fn no_retry() -> Self {
        Self::default().max_retries(0)
    }
}

// ---------------------------------------------------------------------------
// BusStatus
// ---------------------------------------------------------------------------

/// Operational snapshot of the bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BusStatus {
    /// Messages currently being dispatched or waiting on a publish delay.
    pub in_flight: usize,
    /// Messages waiting for their retry backoff.
    pub retry_queue_depth: usize,
    /// Types with at least one live subscription.
    pub registered_types: Vec<MessageType>,
    pub published: u64,
    pub completed: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    /// Messages dropped because no handler (or no transport) was available.
    pub dropped: u64,
    pub running: bool,
}

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    completed: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
    dropped: AtomicU64,
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

/// Disposer returned by [`MessageBus::subscribe`].
///
/// Dropping it keeps the handler registered; call [`Subscription::unsubscribe`]
/// to remove it.
#[derive(Debug)]
pub struct Subscription {
    kind: MessageType,
    id: HandlerId,
    state: Weak<BusState>,
}

impl Subscription {
    #[must_use]
    pub fn kind(&self) -> MessageType {
        self.kind
    }

    #[must_use]
    pub fn id(&self) -> HandlerId {
        self.id
    }

    /// Removes the handler. A no-op if the bus is gone.
    pub fn unsubscribe(self) {
        if let Some(state) = self.state.upgrade() {
            state.remove_handler(self.kind, self.id);
        }
    }
}

// ---------------------------------------------------------------------------
// BusState
// ---------------------------------------------------------------------------

type HandlerSet = Vec<(HandlerId, Arc<dyn MessageHandler>)>;

/// Shared state reachable from spawned delay, retry and transport tasks.
pub(crate) struct BusState {
    config: BusConfig,
    origin: Uuid,
    clock: Arc<dyn ClockSource>,
    notifier: Arc<dyn Notifier>,
    /// Invariant: no entry holds an empty handler set.
    handlers: RwLock<HashMap<MessageType, HandlerSet>>,
    handler_ids: HandlerIds,
    in_flight: DashMap<MessageId, MessageType>,
    retries: RetryQueue,
    transport: RwLock<Option<Arc<dyn Transport>>>,
    counters: Counters,
}

impl BusState {
    fn remove_handler(&self, kind: MessageType, id: HandlerId) {
        let mut handlers = self.handlers.write();
        if let Some(set) = handlers.get_mut(&kind) {
            set.retain(|(hid, _)| *hid != id);
            if set.is_empty() {
                handlers.remove(&kind);
            }
        }
        debug!(message_type = %kind, handler = id.0, "handler unsubscribed");
    }

    fn handlers_for(&self, kind: MessageType) -> Vec<Arc<dyn MessageHandler>> {
        self.handlers
            .read()
            .get(&kind)
            .map(|set| set.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default()
    }

    /// Delivers `message` according to `target`.
    async fn route(&self, message: QueueMessage, target: DeliveryTarget) {
        if target.includes_remote() {
            self.relay(&message).await;
        }
        if target.includes_local() {
            self.dispatch(message).await;
        } else {
            self.in_flight.remove(&message.id);
        }
    }

    async fn relay(&self, message: &QueueMessage) {
        let transport = self.transport.read().clone();
        let Some(transport) = transport else {
            warn!(message_id = %message.id, message_type = %message.kind, "no transport attached; remote delivery skipped");
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        };
        if let Err(e) = transport.send(Envelope::new(self.origin, message.clone())).await {
            warn!(message_id = %message.id, error = %e, "failed to relay message");
        }
    }

    /// Runs one dispatch attempt and feeds failures into the retry pipeline.
    pub(crate) async fn dispatch(&self, mut message: QueueMessage) {
        let span = info_span!(
            "dispatch",
            message_id = %message.id,
            message_type = %message.kind,
            attempt = message.retry_count + 1,
        );
        async {
            self.in_flight.insert(message.id, message.kind);
            let outcome = self.deliver(&message).await;
            self.in_flight.remove(&message.id);

            match outcome {
                Delivery::Completed => {
                    self.counters.completed.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!("switchboard_bus_completed_total", "type" => message.kind.as_str())
                        .increment(1);
                    debug!("message completed");
                }
                Delivery::NoHandlers => {
                    self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                    debug!("no handlers registered; message dropped");
                }
                Delivery::Failed(err) => {
                    if message.can_retry() {
                        message.retry_count += 1;
                        let delay = backoff_delay(
                            message.retry_count,
                            self.config.base_backoff,
                            self.config.max_backoff,
                        );
                        warn!(error = %err, retry = message.retry_count, delay = ?delay, "dispatch failed; retry scheduled");
                        self.counters.retried.fetch_add(1, Ordering::Relaxed);
                        metrics::counter!("switchboard_bus_retried_total", "type" => message.kind.as_str())
                            .increment(1);
                        self.retries.push(message, delay);
                    } else {
                        self.dead_letter(&message, &err).await;
                    }
                }
            }
        }
        .instrument(span)
        .await;
    }

    /// Fans the message out to every handler of its type and waits for all of them.
    async fn deliver(&self, message: &QueueMessage) -> Delivery {
        let handlers = self.handlers_for(message.kind);
        if handlers.is_empty() {
            return Delivery::NoHandlers;
        }
        let total = handlers.len();
        let results = join_all(handlers.iter().map(|h| h.handle(message))).await;
        let errors: Vec<anyhow::Error> = results.into_iter().filter_map(Result::err).collect();
        if errors.is_empty() {
            return Delivery::Completed;
        }
        let reason = errors
            .iter()
            .map(|e| format!("{e:#}"))
            .collect::<Vec<_>>()
            .join("; ");
        Delivery::Failed(MeshError::HandlerFailure {
            message_type: message.kind,
            failed: errors.len(),
            total,
            reason,
        })
    }

    /// Converts an exhausted message into a `dead_letter` event.
    async fn dead_letter(&self, message: &QueueMessage, err: &MeshError) {
        self.counters.dead_lettered.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("switchboard_bus_dead_lettered_total", "type" => message.kind.as_str()).increment(1);
        error!(error = %err, retries = message.retry_count, "message permanently failed");

        if message.kind == MessageType::DeadLetter {
            // Never dead-letter a dead letter.
            return;
        }

        self.notifier.notify(Notification::new(
            NotificationLevel::Error,
            "Message failed",
            format!("{} message {} failed after {} retries", message.kind, message.id, message.retry_count),
        ));

        let record = DeadLetterRecord::from_message(message, err.to_string(), self.clock.now_millis());
        let dead = QueueMessage::new(MessageType::DeadLetter, json!(record), self.clock.now_millis(), 0);
        self.counters.published.fetch_add(1, Ordering::Relaxed);
        match self.deliver(&dead).await {
            Delivery::Completed => {
                self.counters.completed.fetch_add(1, Ordering::Relaxed);
            }
            Delivery::NoHandlers => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                debug!("no dead_letter subscribers; record dropped");
            }
            Delivery::Failed(e) => {
                error!(error = %e, "dead_letter handler failed");
            }
        }
    }
}

enum Delivery {
    Completed,
    NoHandlers,
    Failed(MeshError),
}

// ---------------------------------------------------------------------------
// MessageBus
// ---------------------------------------------------------------------------

/// Typed pub/sub router with retry, backoff and dead-lettering.
///
/// `publish` works without `start()`, but failed messages only leave the
/// retry queue while the drainer started by `start()` is running.
pub struct MessageBus {
    state: Arc<BusState>,
    drainer: tokio::sync::Mutex<Option<BackgroundWorker<RetryDrainer>>>,
    listener: Mutex<Option<JoinHandle<()>>>,
    running: AtomicBool,
}

impl MessageBus {
    #[must_use]
    pub fn new(config: BusConfig) -> Self {
        Self::with_parts(config, Arc::new(SystemClock), Arc::new(LogNotifier))
    }

    /// Creates a bus with an explicit clock (message timestamps) and notifier
    /// (permanent-failure notices).
    #[must_use]
    pub fn with_parts(config: BusConfig, clock: Arc<dyn ClockSource>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            state: Arc::new(BusState {
                config,
                origin: Uuid::new_v4(),
                clock,
                notifier,
                handlers: RwLock::new(HashMap::new()),
                handler_ids: HandlerIds::new(),
                in_flight: DashMap::new(),
                retries: RetryQueue::default(),
                transport: RwLock::new(None),
                counters: Counters::default(),
            }),
            drainer: tokio::sync::Mutex::new(None),
            listener: Mutex::new(None),
            running: AtomicBool::new(false),
        }
    }

    /// Id stamped on envelopes this bus relays.
    #[must_use]
    pub fn origin(&self) -> Uuid {
        self.state.origin
    }

    /// Registers `handler` for `kind`.
    #[must_use = "dropping the Subscription makes the handler impossible to unsubscribe"]
    pub fn subscribe<H: MessageHandler>(&self, kind: MessageType, handler: H) -> Subscription {
        let id = self.state.handler_ids.next();
        self.state
            .handlers
            .write()
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));
        debug!(message_type = %kind, handler = id.0, "handler subscribed");
        Subscription {
            kind,
            id,
            state: Arc::downgrade(&self.state),
        }
    }

    /// Number of live handlers for `kind`.
    #[must_use]
    pub fn handler_count(&self, kind: MessageType) -> usize {
        self.state.handlers.read().get(&kind).map_or(0, Vec::len)
    }

    /// Publishes a message and returns its id.
    ///
    /// Without a delay, local handlers have finished (first attempt) when this
    /// returns. With a delay, dispatch happens on a spawned task.
    pub async fn publish(&self, kind: MessageType, payload: Value, options: PublishOptions) -> MessageId {
        let max_retries = options
            .max_retries
            .unwrap_or(self.state.config.default_max_retries);
        let mut message = QueueMessage::new(kind, payload, self.state.clock.now_millis(), max_retries);
        let id = message.id;

        self.state.counters.published.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("switchboard_bus_published_total", "type" => kind.as_str()).increment(1);

        match options.delay.filter(|d| !d.is_zero()) {
            Some(delay) => {
                #[allow(clippy::cast_possible_truncation)]
                let delay_ms = delay.as_millis() as u64;
                message.delay_ms = Some(delay_ms);
                debug!(message_id = %id, message_type = %kind, delay_ms, "message delayed");
                self.state.in_flight.insert(id, kind);
                let state = Arc::clone(&self.state);
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    state.route(message, options.target).await;
                });
            }
            None => self.state.route(message, options.target).await,
        }
        id
    }

    /// Attaches a cross-runtime transport and starts listening for envelopes
    /// from other buses. Replaces any previously attached transport.
    ///
    /// The listener runs until [`MessageBus::stop`]; [`MessageBus::start`]
    /// resumes it. Envelopes sent while it is stopped are not received.
    pub fn attach_transport(&self, transport: Arc<dyn Transport>) {
        *self.state.transport.write() = Some(Arc::clone(&transport));
        self.spawn_listener(transport.as_ref());
    }

    fn spawn_listener(&self, transport: &dyn Transport) {
        let mut rx = transport.subscribe();
        let state = Arc::clone(&self.state);
        let origin = self.state.origin;
        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(envelope) if envelope.origin == origin => {}
                    Ok(envelope) => {
                        let state = Arc::clone(&state);
                        tokio::spawn(async move { state.dispatch(envelope.message).await });
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "transport receiver lagged; envelopes lost");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        if let Some(previous) = self.listener.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Starts the retry drainer and, if a transport is attached, its
    /// listener. Idempotent.
    pub async fn start(&self) {
        let mut drainer = self.drainer.lock().await;
        if !drainer.as_ref().is_some_and(BackgroundWorker::is_running) {
            *drainer = Some(BackgroundWorker::start(
                RetryDrainer {
                    state: Arc::clone(&self.state),
                },
                self.state.config.retry_drain_interval,
            ));
        }

        let listening = self
            .listener
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished());
        if !listening {
            let transport = self.state.transport.read().clone();
            if let Some(transport) = transport {
                debug!("resuming transport listener");
                self.spawn_listener(transport.as_ref());
            }
        }
        self.running.store(true, Ordering::Release);
    }

    /// Drains due retries immediately.
    ///
    /// # Errors
    ///
    /// Returns an error if the bus has not been started.
    pub async fn drain_retries(&self) -> anyhow::Result<()> {
        match self.drainer.lock().await.as_ref() {
            Some(worker) => worker.submit(RetryCommand::DrainNow).await,
            None => Err(anyhow::anyhow!("message bus not started")),
        }
    }

    /// Stops the retry drainer and the transport listener. Idempotent.
    ///
    /// Messages still waiting in the retry queue stay there and are
    /// re-dispatched if the bus is started again.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::Release);
        if let Some(mut worker) = self.drainer.lock().await.take() {
            worker.stop().await;
        }
        if let Some(listener) = self.listener.lock().take() {
            listener.abort();
        }
    }

    /// Operational snapshot.
    #[must_use]
    pub fn status(&self) -> BusStatus {
        let mut registered_types: Vec<MessageType> = self.state.handlers.read().keys().copied().collect();
        registered_types.sort();
        let c = &self.state.counters;
        BusStatus {
            in_flight: self.state.in_flight.len(),
            retry_queue_depth: self.state.retries.len(),
            registered_types,
            published: c.published.load(Ordering::Relaxed),
            completed: c.completed.load(Ordering::Relaxed),
            retried: c.retried.load(Ordering::Relaxed),
            dead_lettered: c.dead_lettered.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
            running: self.running.load(Ordering::Acquire),
        }
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
