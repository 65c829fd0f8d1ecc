//! Topic-based publish/subscribe bus.
//!
//! # Guarantees
//!
//! - **Subscription order**: subscribers to a topic run in the order they subscribed
//! - **Synchronous delivery**: `publish` returns after every subscriber returned
//! - **Isolation**: a subscriber's error or panic is caught, logged and reported
//!   to the publisher; later subscribers still run
//! - **No lock held during callbacks**: subscribers may subscribe, unsubscribe,
//!   submit work or read engine state from inside a callback
//!
//! Publishing is crate-private. Code outside the engine can only observe the
//! bus; beats and telemetry are the only publishers.
//!
//! # Example
//!
//! ```ignore
//! let sub = conductor.subscribe("canvas:render", |msg| {
//!     let id = msg.data["componentId"].as_str().unwrap_or_default();
//!     if let Some(baton) = msg.baton() {
//!         baton.set("rendered", id.into());
//!     }
//!     Ok(())
//! });
//! conductor.unsubscribe(&sub);
//! ```

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use serde_json::{Map, Value};
use smallvec::SmallVec;
use tracing::{error, warn};

use crate::{lock_unpoisoned, panic_message};

/// Subscriber callback.
pub type Callback = Arc<dyn Fn(&Message) -> anyhow::Result<()> + Send + Sync>;

type SubscriberList = SmallVec<[(u64, Callback); 4]>;

/// A published message.
#[derive(Debug, Clone)]
pub struct Message {
    pub topic: String,
    pub data: Value,
    baton: Option<Baton>,
}

impl Message {
    /// Shared payload of the execution that published this message.
    ///
    /// Present for beat events only.
    pub fn baton(&self) -> Option<&Baton> {
        self.baton.as_ref()
    }

    /// Look up a top-level field of the message data.
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }
}

/// Mutable data baton handed from beat to beat within one execution.
///
/// Cloning shares the same payload.
#[derive(Debug, Clone, Default)]
pub struct Baton(Arc<Mutex<Map<String, Value>>>);

impl Baton {
    pub fn new(initial: Map<String, Value>) -> Self {
        Self(Arc::new(Mutex::new(initial)))
    }

    /// Shallow-merge `data` into the payload; later keys win.
    pub fn merge(&self, data: Map<String, Value>) {
        let mut payload = lock_unpoisoned(&self.0);
        for (key, value) in data {
            payload.insert(key, value);
        }
    }

    pub fn set(&self, key: impl Into<String>, value: Value) {
        lock_unpoisoned(&self.0).insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        lock_unpoisoned(&self.0).get(key).cloned()
    }

    pub fn snapshot(&self) -> Map<String, Value> {
        lock_unpoisoned(&self.0).clone()
    }
}

/// Handle returned by `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subscription {
    topic: String,
    id: u64,
}

impl Subscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }
}

/// A subscriber that failed while handling a message.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriberFailure {
    pub subscriber: u64,
    pub message: String,
}

/// What happened when a message was published.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PublishReport {
    /// Subscribers that were invoked.
    pub delivered: usize,
    pub failures: Vec<SubscriberFailure>,
}

impl PublishReport {
    pub fn is_ok(&self) -> bool {
        self.failures.is_empty()
    }

    /// All failure messages joined into one line.
    pub fn failure_summary(&self) -> String {
        self.failures
            .iter()
            .map(|f| f.message.as_str())
            .collect::<Vec<_>>()
            .join("; ")
    }
}

#[derive(Default)]
struct BusInner {
    topics: RwLock<HashMap<String, SubscriberList>>,
    next_id: AtomicU64,
}

/// Topic registry shared by the engine and its plugins.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` for `topic`.
    pub fn subscribe<F>(&self, topic: impl Into<String>, callback: F) -> Subscription
    where
        F: Fn(&Message) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.subscribe_arc(topic, Arc::new(callback))
    }

    /// Register an already shared callback.
    pub fn subscribe_arc(&self, topic: impl Into<String>, callback: Callback) -> Subscription {
        let topic = topic.into();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);

        let mut topics = self
            .inner
            .topics
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        topics.entry(topic.clone()).or_default().push((id, callback));

        Subscription { topic, id }
    }

    /// Remove a subscription. Returns `false` if it was already gone.
    pub fn unsubscribe(&self, subscription: &Subscription) -> bool {
        let mut topics = self
            .inner
            .topics
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let Some(list) = topics.get_mut(&subscription.topic) else {
            return false;
        };

        let before = list.len();
        list.retain(|(id, _)| *id != subscription.id);
        let removed = list.len() != before;
        if list.is_empty() {
            topics.remove(&subscription.topic);
        }
        removed
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.inner
            .topics
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(topic)
            .map_or(0, |list| list.len())
    }

    /// Deliver `data` to every subscriber of `topic`, in subscription order.
    pub(crate) fn publish(&self, topic: &str, data: Value, baton: Option<Baton>) -> PublishReport {
        // Snapshot so callbacks run without the registry lock.
        let subscribers: SubscriberList = match self
            .inner
            .topics
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(topic)
        {
            Some(list) => list.clone(),
            None => return PublishReport::default(),
        };

        let message = Message {
            topic: topic.to_string(),
            data,
            baton,
        };

        let mut report = PublishReport {
            delivered: subscribers.len(),
            failures: Vec::new(),
        };

        for (id, callback) in subscribers {
            match catch_unwind(AssertUnwindSafe(|| callback(&message))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(topic, subscriber = id, error = %format!("{e:#}"), "subscriber failed");
                    report.failures.push(SubscriberFailure {
                        subscriber: id,
                        message: format!("{e:#}"),
                    });
                }
                Err(panic_info) => {
                    let panic_msg = panic_message(&panic_info);
                    error!(topic, subscriber = id, panic = %panic_msg, "subscriber panicked");
                    report.failures.push(SubscriberFailure {
                        subscriber: id,
                        message: format!("subscriber panicked: {panic_msg}"),
                    });
                }
            }
        }

        report
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let topics = self
            .inner
            .topics
            .read()
            .map(|t| t.len())
            .unwrap_or_default();
        f.debug_struct("EventBus").field("topics", &topics).finish()
    }
}
