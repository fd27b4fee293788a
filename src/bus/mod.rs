//! In-process publish/subscribe event bus.
//!
//! Producers publish [`Event`]s; subscribers register a handler with an
//! optional conjunctive [`EventFilter`]. A handler that returns an error
//! gets the event parked in its private bounded buffer (oldest evicted
//! first) instead of aborting the publish. One failing subscriber never
//! blocks delivery to the others.

use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::clock::epoch_now;

/// Kinds of bus messages flowing through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// Raw sensor reading.
    Data,
    /// Single-parameter deviation from the detector.
    Anomaly,
    /// Cross-sensor temporal cluster.
    Cluster,
    /// Rule-detected external occurrence.
    Pattern,
    /// Periodic health / stats report.
    Health,
    /// Lifecycle notifications.
    System,
}

/// Severity ladder; ordering matters for `min_severity` filtering.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Debug,
    Info,
    Warning,
    Critical,
}

/// An immutable bus message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub timestamp: f64,
    pub source: String,
    pub event_type: EventType,
    pub payload: serde_json::Value,
    pub severity: Severity,
}

impl Event {
    /// Build an event stamped with the current time at Info severity.
    pub fn new(
        source: impl Into<String>,
        event_type: EventType,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            timestamp: epoch_now(),
            source: source.into(),
            event_type,
            payload,
            severity: Severity::Info,
        }
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }
}

/// Conjunctive subscription filter; absent fields admit everything.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub event_types: Option<Vec<EventType>>,
    pub sources: Option<Vec<String>>,
    pub min_severity: Option<Severity>,
}

impl EventFilter {
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(types) = &self.event_types {
            if !types.contains(&event.event_type) {
                return false;
            }
        }
        if let Some(sources) = &self.sources {
            if !sources.iter().any(|s| s == &event.source) {
                return false;
            }
        }
        if let Some(min) = self.min_severity {
            if event.severity < min {
                return false;
            }
        }
        true
    }
}

/// Subscriber handler. Returning `Err` counts as a failed delivery.
pub type BusHandler = Arc<dyn Fn(&Event) -> anyhow::Result<()> + Send + Sync>;

struct Subscription {
    handler: BusHandler,
    filter: EventFilter,
    buffer: VecDeque<Event>,
    dropped: u64,
    delivered: u64,
}

struct BusInner {
    subs: HashMap<Uuid, Subscription>,
    /// Subscription order, so stats and iteration stay deterministic.
    order: Vec<Uuid>,
    total_published: u64,
}

/// Delivery statistics, as exposed to health reporting.
#[derive(Debug, Clone, Serialize)]
pub struct BusStats {
    pub subscriber_count: usize,
    pub total_published: u64,
    pub total_delivered: u64,
}

pub struct EventBus {
    inner: Mutex<BusInner>,
    max_buffer_size: usize,
}

impl EventBus {
    pub fn new(max_buffer_size: usize) -> Self {
        Self {
            inner: Mutex::new(BusInner {
                subs: HashMap::new(),
                order: Vec::new(),
                total_published: 0,
            }),
            max_buffer_size: max_buffer_size.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BusInner> {
        // A poisoned lock only means a handler caller panicked mid-update;
        // the map itself stays usable.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a handler; returns the subscription id.
    pub fn subscribe(&self, handler: BusHandler, filter: EventFilter) -> Uuid {
        let id = Uuid::new_v4();
        let mut inner = self.lock();
        inner.subs.insert(
            id,
            Subscription {
                handler,
                filter,
                buffer: VecDeque::new(),
                dropped: 0,
                delivered: 0,
            },
        );
        inner.order.push(id);
        id
    }

    /// Register a handler with no filter.
    pub fn subscribe_all(&self, handler: BusHandler) -> Uuid {
        self.subscribe(handler, EventFilter::default())
    }

    /// Remove a subscription. Returns true if it existed.
    pub fn unsubscribe(&self, id: Uuid) -> bool {
        let mut inner = self.lock();
        let existed = inner.subs.remove(&id).is_some();
        inner.order.retain(|s| *s != id);
        existed
    }

    /// Deliver an event to every matching subscriber.
    ///
    /// Handlers run outside the bus lock, so a handler may itself publish.
    /// A handler error parks the event in that subscriber's buffer; it is
    /// never raised out of `publish`.
    pub fn publish(&self, event: &Event) {
        let matched: Vec<(Uuid, BusHandler)> = {
            let mut inner = self.lock();
            inner.total_published += 1;
            let mut matched = Vec::new();
            for id in &inner.order {
                if let Some(sub) = inner.subs.get(id) {
                    if sub.filter.matches(event) {
                        matched.push((*id, Arc::clone(&sub.handler)));
                    }
                }
            }
            matched
        };

        for (id, handler) in matched {
            // A panicking handler is contained the same way as an Err one.
            match catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(Ok(())) => {
                    let mut inner = self.lock();
                    if let Some(sub) = inner.subs.get_mut(&id) {
                        sub.delivered += 1;
                    }
                }
                Ok(Err(e)) => {
                    debug!(subscriber = %id, error = %e, "delivery failed, buffering event");
                    self.buffer_failed(id, event);
                }
                Err(_) => {
                    debug!(subscriber = %id, "handler panicked, buffering event");
                    self.buffer_failed(id, event);
                }
            }
        }
    }

    fn buffer_failed(&self, id: Uuid, event: &Event) {
        let mut inner = self.lock();
        if let Some(sub) = inner.subs.get_mut(&id) {
            if sub.buffer.len() >= self.max_buffer_size {
                sub.buffer.pop_front();
                sub.dropped += 1;
            }
            sub.buffer.push_back(event.clone());
        }
    }

    pub fn stats(&self) -> BusStats {
        let inner = self.lock();
        BusStats {
            subscriber_count: inner.subs.len(),
            total_published: inner.total_published,
            total_delivered: inner.subs.values().map(|s| s.delivered).sum(),
        }
    }

    /// Events evicted from a subscriber's failure buffer.
    pub fn dropped_count(&self, id: Uuid) -> Option<u64> {
        self.lock().subs.get(&id).map(|s| s.dropped)
    }

    /// Current size of a subscriber's failure buffer.
    pub fn buffer_size(&self, id: Uuid) -> Option<usize> {
        self.lock().subs.get(&id).map(|s| s.buffer.len())
    }

    /// Drop every subscription.
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.subs.clear();
        inner.order.clear();
    }
}
