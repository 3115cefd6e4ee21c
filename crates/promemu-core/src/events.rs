use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;

/// Payload carried by an event. Kept as a small set of well-known shapes
/// rather than a fully open map, per the bus's documented payload contract:
/// `feature_on`/`feature_off` carry a timestamp, `host_started`/
/// `host_stopped` carry the host's labels, `metrics_pushed` carries push
/// counters. `Forwarded` lets a listener re-emit another event's payload
/// verbatim (e.g. a balancer host relaying `feature_on` into
/// `peak_load_start`).
#[derive(Debug, Clone)]
pub enum EventData {
    Timestamp { timestamp: u64 },
    Labels(HashMap<String, String>),
    MetricsPushed {
        job: String,
        hosts: usize,
        metrics_count: usize,
    },
    Forwarded(Box<EventData>),
    None,
}

/// A named record delivered through the bus.
#[derive(Debug, Clone)]
pub struct Event {
    pub name: String,
    pub data: EventData,
    pub source: String,
}

type CallbackFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type CallbackFn = Arc<dyn Fn(Event) -> CallbackFuture + Send + Sync>;

/// A boxed async event handler for a host's `listen_events` entries. Unlike
/// `subscribe`'s plain callback, this one also receives the bus it is
/// subscribed on, so a handler can react to one event by emitting another
/// (e.g. a balancer host relaying `feature_on` into `peak_load_start`).
pub type HandlerFn = Arc<dyn Fn(Event, EventBus) -> CallbackFuture + Send + Sync>;

struct Subscription {
    id: u64,
    callback: CallbackFn,
    once: bool,
}

/// A handle returned by `subscribe`, used to `unsubscribe` later. Rust has
/// no stable notion of function-pointer identity for arbitrary closures, so
/// subscribers are tracked by an opaque id rather than by comparing
/// callback values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Named pub/sub fabric binding scenarios and hosts together.
///
/// Dispatch is non-blocking for the emitter: each callback runs as an
/// independent `tokio::spawn`ed task and `emit` returns as soon as the
/// tasks are scheduled. A snapshot of subscribers is taken at emit time, so
/// subscriptions added during dispatch never see the in-flight event.
/// Subscribe/unsubscribe are serialized against each other by the
/// subscriber map's mutex, but never against in-flight callbacks.
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<HashMap<String, Vec<Subscription>>>>,
    next_id: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn subscribe<F, Fut>(&self, name: impl Into<String>, callback: F) -> SubscriptionId
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.subscribe_inner(name, callback, false).await
    }

    pub async fn subscribe_once<F, Fut>(&self, name: impl Into<String>, callback: F) -> SubscriptionId
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.subscribe_inner(name, callback, true).await
    }

    async fn subscribe_inner<F, Fut>(
        &self,
        name: impl Into<String>,
        callback: F,
        once: bool,
    ) -> SubscriptionId
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let boxed: CallbackFn = Arc::new(move |event| Box::pin(callback(event)));
        let mut subs = self.subscribers.lock().await;
        subs.entry(name.into())
            .or_default()
            .push(Subscription {
                id,
                callback: boxed,
                once,
            });
        SubscriptionId(id)
    }

    pub async fn unsubscribe(&self, name: &str, id: SubscriptionId) {
        let mut subs = self.subscribers.lock().await;
        if let Some(list) = subs.get_mut(name) {
            list.retain(|s| s.id != id.0);
        }
    }

    /// Dispatches `name` to every current subscriber as an independent
    /// task. Returns immediately; never awaits the callbacks.
    pub async fn emit(&self, name: &str, data: EventData, source: impl Into<String>) {
        let event = Event {
            name: name.to_string(),
            data,
            source: source.into(),
        };

        let to_run = {
            let mut subs = self.subscribers.lock().await;
            let Some(list) = subs.get_mut(name) else {
                return;
            };
            // Snapshot subscribers at emit time; subscriptions added during
            // dispatch must not see this event. `once` subscriptions are
            // removed from the map before their callback runs.
            let snapshot: Vec<CallbackFn> = list.iter().map(|s| s.callback.clone()).collect();
            list.retain(|s| !s.once);
            snapshot
        };

        for callback in to_run {
            let event = event.clone();
            tokio::spawn(async move {
                callback(event).await;
            });
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering as Ord};
    use std::time::Duration;

    #[tokio::test]
    async fn subscribe_then_emit_then_unsubscribe_delivers_once() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));

        let c = count.clone();
        let id = bus
            .subscribe("ping", move |_event| {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ord::SeqCst);
                }
            })
            .await;

        bus.emit("ping", EventData::None, "test").await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        bus.unsubscribe("ping", id).await;
        bus.emit("ping", EventData::None, "test").await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(count.load(Ord::SeqCst), 1);
    }

    #[tokio::test]
    async fn once_subscription_fires_a_single_time() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));

        let c = count.clone();
        bus.subscribe_once("boot", move |_event| {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ord::SeqCst);
            }
        })
        .await;

        bus.emit("boot", EventData::None, "test").await;
        bus.emit("boot", EventData::None, "test").await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(count.load(Ord::SeqCst), 1);
    }

    #[tokio::test]
    async fn emit_with_no_subscribers_is_a_noop() {
        let bus = EventBus::new();
        bus.emit("nobody-listening", EventData::None, "test").await;
    }
}
