//! Durable publish/subscribe event bus.
//!
//! When a domain store is configured, every publish appends an immutable
//! [`EventEnvelope`] to the event log (assigning the next stream version)
//! before any subscriber sees it. Durable subscribers carry a named
//! consumer checkpoint; delivery to them always goes through a drain of
//! "everything past the checkpoint" under a per-consumer lock, so the live
//! path and the background dispatcher can never double-deliver or reorder.
//! Without a store the bus dispatches purely in memory.
//!
//! Guarantee: for a given durable consumer, delivery order equals publish
//! order; redelivery after a crash resumes exactly at the last
//! unacknowledged event.

use std::future::Future;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::EventBusError;
use crate::events::envelope::EventEnvelope;
use crate::events::pattern::EventPattern;
use crate::store::DomainStore;

/// Batch size used for replay drains outside the dispatcher loop.
const DRAIN_BATCH: i64 = 100;

/// An async event handler. Use [`handler`] to adapt an async closure.
pub type EventHandler = Arc<dyn Fn(EventEnvelope) -> BoxFuture<'static, ()> + Send + Sync>;

/// Adapt an async closure into an [`EventHandler`].
pub fn handler<F, Fut>(f: F) -> EventHandler
where
    F: Fn(EventEnvelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |envelope| f(envelope).boxed())
}

/// Identifier returned by [`EventBus::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Options for [`EventBus::subscribe`].
#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    /// Names the durable consumer whose checkpoint tracks this subscriber.
    pub consumer_id: Option<String>,
    pub durable: bool,
    /// Replay persisted events newer than the checkpoint before going live.
    pub replay_from_checkpoint: bool,
}

impl SubscribeOptions {
    pub fn durable(consumer_id: impl Into<String>) -> Self {
        Self {
            consumer_id: Some(consumer_id.into()),
            durable: true,
            replay_from_checkpoint: false,
        }
    }

    pub fn durable_with_replay(consumer_id: impl Into<String>) -> Self {
        Self {
            replay_from_checkpoint: true,
            ..Self::durable(consumer_id)
        }
    }
}

/// Options for [`EventBus::publish_with`].
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    pub aggregate_id: Option<String>,
    pub metadata: Value,
}

struct DurableConsumer {
    consumer_id: String,
    /// Serializes drains so live delivery and the dispatcher cannot
    /// interleave for the same consumer.
    drain_lock: tokio::sync::Mutex<()>,
}

struct Subscription {
    id: SubscriptionId,
    pattern: EventPattern,
    handler: EventHandler,
    consumer: Option<DurableConsumer>,
}

struct DispatcherHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// The durable event bus.
pub struct EventBus {
    subscriptions: RwLock<Vec<Arc<Subscription>>>,
    next_subscription: AtomicU64,
    store: RwLock<Option<Arc<DomainStore>>>,
    /// Version counter for in-memory (store-less) envelopes.
    memory_version: AtomicI64,
    dispatcher: Mutex<Option<DispatcherHandle>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscriptions: RwLock::new(Vec::new()),
            next_subscription: AtomicU64::new(1),
            store: RwLock::new(None),
            memory_version: AtomicI64::new(0),
            dispatcher: Mutex::new(None),
        }
    }

    /// Attach the domain store; publishes from here on are durable.
    pub fn configure_persistence(&self, store: Arc<DomainStore>) {
        *self.store.write() = Some(store);
    }

    fn current_store(&self) -> Option<Arc<DomainStore>> {
        self.store.read().clone()
    }

    // -----------------------------------------------------------------------
    // Publish
    // -----------------------------------------------------------------------

    /// Publish an event and await its delivery to live subscribers.
    pub async fn publish(
        &self,
        event: &str,
        payload: Value,
    ) -> Result<EventEnvelope, EventBusError> {
        self.publish_with(event, payload, PublishOptions::default())
            .await
    }

    pub async fn publish_with(
        &self,
        event: &str,
        payload: Value,
        options: PublishOptions,
    ) -> Result<EventEnvelope, EventBusError> {
        let store = self.current_store();

        let envelope = match &store {
            Some(store) => {
                store
                    .append_event(
                        event,
                        options.aggregate_id.as_deref(),
                        payload,
                        options.metadata,
                    )
                    .await?
            }
            None => {
                let version = self.memory_version.fetch_add(1, Ordering::SeqCst) + 1;
                let mut envelope = EventEnvelope::new(event, payload, version);
                envelope.aggregate_id = options.aggregate_id;
                envelope.metadata = options.metadata;
                envelope
            }
        };

        self.dispatch(&envelope, store.as_deref()).await;
        Ok(envelope)
    }

    /// Publish without awaiting delivery. Errors are logged, not returned.
    pub fn publish_detached(self: &Arc<Self>, event: &str, payload: Value) {
        let bus = Arc::clone(self);
        let event = event.to_string();
        tokio::spawn(async move {
            if let Err(e) = bus.publish(&event, payload).await {
                log::error!("detached publish of {event} failed: {e}");
            }
        });
    }

    async fn dispatch(&self, envelope: &EventEnvelope, store: Option<&DomainStore>) {
        let subscriptions: Vec<Arc<Subscription>> = self.subscriptions.read().clone();

        for subscription in subscriptions {
            if subscription.consumer.is_some() && store.is_some() {
                // Durable path: drain everything past the checkpoint, which
                // includes this envelope.
                if let Err(e) = self.drain_subscription(&subscription, DRAIN_BATCH).await {
                    log::error!(
                        "durable delivery to {:?} failed: {e}",
                        subscription.consumer.as_ref().map(|c| &c.consumer_id)
                    );
                }
            } else if subscription.pattern.matches(&envelope.event) {
                (subscription.handler)(envelope.clone()).await;
                if let Some(store) = store {
                    if let Err(e) = store.mark_event_delivered(&envelope.event_id).await {
                        log::warn!("could not stamp delivery of {}: {e}", envelope.event_id);
                    }
                }
            }
        }
    }

    /// Deliver all persisted events past the consumer's checkpoint, in
    /// version order, advancing the checkpoint after each hand-off. Returns
    /// the number of events scanned. A drain already in progress for the
    /// consumer covers new events itself (it re-queries until empty), so a
    /// contended call returns without waiting.
    async fn drain_subscription(
        &self,
        subscription: &Subscription,
        batch_size: i64,
    ) -> Result<u64, EventBusError> {
        let Some(consumer) = &subscription.consumer else {
            return Ok(0);
        };
        let Some(store) = self.current_store() else {
            return Ok(0);
        };

        let Ok(_guard) = consumer.drain_lock.try_lock() else {
            return Ok(0);
        };

        let mut cursor = store.load_checkpoint(&consumer.consumer_id).await?.unwrap_or(0);
        let mut scanned = 0u64;

        loop {
            let batch = store.events_after(cursor, batch_size).await?;
            if batch.is_empty() {
                break;
            }
            for envelope in batch {
                let version = envelope.version;
                let event_id = envelope.event_id.clone();
                if subscription.pattern.matches(&envelope.event) {
                    (subscription.handler)(envelope).await;
                    store.mark_event_delivered(&event_id).await?;
                }
                // The checkpoint is the consumer's cursor over the whole
                // stream, so it advances past non-matching events too.
                store.save_checkpoint(&consumer.consumer_id, version).await?;
                cursor = version;
                scanned += 1;
            }
        }
        Ok(scanned)
    }

    // -----------------------------------------------------------------------
    // Subscribe
    // -----------------------------------------------------------------------

    /// Register a handler for events matching `pattern`.
    ///
    /// With `durable` and `replay_from_checkpoint`, persisted events newer
    /// than the consumer's checkpoint are replayed (in order, no gaps or
    /// duplicates) before live events arrive.
    pub async fn subscribe(
        &self,
        pattern: &str,
        handler: EventHandler,
        options: SubscribeOptions,
    ) -> Result<SubscriptionId, EventBusError> {
        let compiled = EventPattern::compile(pattern)?;
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));

        let consumer = if options.durable {
            if self.current_store().is_none() {
                log::warn!(
                    "durable subscription to {pattern:?} without persistence; checkpoints disabled"
                );
            }
            Some(DurableConsumer {
                consumer_id: options
                    .consumer_id
                    .unwrap_or_else(|| format!("consumer-{}", id.0)),
                drain_lock: tokio::sync::Mutex::new(()),
            })
        } else {
            None
        };

        let subscription = Arc::new(Subscription {
            id,
            pattern: compiled,
            handler,
            consumer,
        });
        self.subscriptions.write().push(Arc::clone(&subscription));

        if options.durable && options.replay_from_checkpoint {
            self.drain_subscription(&subscription, DRAIN_BATCH).await?;
        }
        Ok(id)
    }

    /// Remove a subscription. Returns whether it existed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscriptions = self.subscriptions.write();
        let before = subscriptions.len();
        subscriptions.retain(|s| s.id != id);
        subscriptions.len() != before
    }

    // -----------------------------------------------------------------------
    // Background dispatcher
    // -----------------------------------------------------------------------

    /// Start the catch-up loop: every `interval_ms`, deliver any events a
    /// durable consumer has not yet acknowledged. Idempotent while running.
    pub fn start_dispatcher(self: &Arc<Self>, interval_ms: u64, batch_size: i64) {
        let mut slot = self.dispatcher.lock();
        if slot.is_some() {
            return;
        }

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let bus = Arc::clone(self);
        let task = tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(std::time::Duration::from_millis(interval_ms.max(1)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let durable: Vec<Arc<Subscription>> = bus
                            .subscriptions
                            .read()
                            .iter()
                            .filter(|s| s.consumer.is_some())
                            .cloned()
                            .collect();
                        for subscription in durable {
                            if let Err(e) = bus.drain_subscription(&subscription, batch_size).await {
                                log::error!("dispatcher drain failed: {e}");
                            }
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
        });

        *slot = Some(DispatcherHandle {
            shutdown: shutdown_tx,
            task,
        });
    }

    /// Stop the catch-up loop and wait for it to exit.
    pub async fn stop_dispatcher(&self) {
        let handle = self.dispatcher.lock().take();
        if let Some(handle) = handle {
            let _ = handle.shutdown.send(true);
            let _ = handle.task.await;
        }
    }
}
