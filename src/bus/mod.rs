//! Event bus: sequencing, persistence, and fan-out.
//!
//! Every mutation publishes exactly one event here. The bus assigns the
//! process-wide sequence number, appends the event to the store before any
//! subscriber sees it, and then delivers it to live subscribers through
//! bounded per-subscriber buffers. A slow subscriber never delays the
//! others; when its buffer overflows the subscription is dropped and the
//! client reconnects with its last sequence to trigger replay.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::StoreResult;
use crate::store::{EventEnvelope, EventType, Store};

/// Outgoing buffer size per subscriber.
const SUBSCRIBER_BUFFER: usize = 256;

/// Event bus handle. Cheap to clone.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

struct BusInner {
    store: Arc<dyn Store>,
    // Sequence assignment and log append happen under this lock so the
    // persisted log order always matches sequence order.
    next_sequence: Mutex<u64>,
    subscribers: RwLock<Vec<Subscriber>>,
    next_subscriber_id: AtomicU64,
}

struct Subscriber {
    id: u64,
    session_id: Option<String>,
    tx: mpsc::Sender<EventEnvelope>,
}

/// A live subscription. Dropping it deregisters from the bus.
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<EventEnvelope>,
    inner: Arc<BusInner>,
}

impl Subscription {
    /// Receive the next event. Returns `None` once the bus has shut down or
    /// this subscription was dropped for falling behind.
    pub async fn recv(&mut self) -> Option<EventEnvelope> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let mut subscribers = self
            .inner
            .subscribers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        subscribers.retain(|s| s.id != self.id);
    }
}

impl EventBus {
    /// Create a bus over the given store. Sequence numbering resumes above
    /// whatever the durable log already contains so numbers are never
    /// reused.
    pub async fn new(store: Arc<dyn Store>) -> StoreResult<Self> {
        let start = store.max_sequence().await?;
        Ok(Self {
            inner: Arc::new(BusInner {
                store,
                next_sequence: Mutex::new(start),
                subscribers: RwLock::new(Vec::new()),
                next_subscriber_id: AtomicU64::new(1),
            }),
        })
    }

    /// Assign a sequence number, append the event to the log, and fan it
    /// out to live subscribers. The envelope is returned after the append
    /// completes, so a caller that responds afterwards guarantees replay
    /// visibility.
    pub async fn publish(
        &self,
        event_type: EventType,
        session_id: &str,
        payload: serde_json::Value,
    ) -> StoreResult<EventEnvelope> {
        let mut next = self.inner.next_sequence.lock().await;
        let candidate = *next + 1;

        let envelope = EventEnvelope {
            event_type,
            timestamp: Utc::now(),
            session_id: session_id.to_string(),
            sequence: candidate,
            payload,
        };

        self.inner.store.append_event(&envelope).await?;
        *next = candidate;
        self.fan_out(&envelope);
        drop(next);

        debug!(
            sequence = envelope.sequence,
            event_type = %envelope.event_type,
            session_id = %envelope.session_id,
            "Event published"
        );

        Ok(envelope)
    }

    fn fan_out(&self, envelope: &EventEnvelope) {
        let mut overflowed = Vec::new();
        {
            let subscribers = self
                .inner
                .subscribers
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            for subscriber in subscribers.iter() {
                if let Some(session_id) = &subscriber.session_id {
                    if session_id != &envelope.session_id {
                        continue;
                    }
                }
                match subscriber.tx.try_send(envelope.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!(
                            subscriber = subscriber.id,
                            sequence = envelope.sequence,
                            "Subscriber buffer overflow, dropping subscription"
                        );
                        overflowed.push(subscriber.id);
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        overflowed.push(subscriber.id);
                    }
                }
            }
        }

        if !overflowed.is_empty() {
            let mut subscribers = self
                .inner
                .subscribers
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            subscribers.retain(|s| !overflowed.contains(&s.id));
        }
    }

    /// Subscribe to all events.
    pub fn subscribe(&self) -> Subscription {
        self.add_subscriber(None)
    }

    /// Subscribe to events for one session.
    pub fn subscribe_session(&self, session_id: &str) -> Subscription {
        self.add_subscriber(Some(session_id.to_string()))
    }

    fn add_subscriber(&self, session_id: Option<String>) -> Subscription {
        let id = self.inner.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);

        let mut subscribers = self
            .inner
            .subscribers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        subscribers.push(Subscriber {
            id,
            session_id,
            tx,
        });

        Subscription {
            id,
            rx,
            inner: self.inner.clone(),
        }
    }

    /// Close every live subscription. Their `recv` calls return `None`.
    pub fn shutdown(&self) {
        let mut subscribers = self
            .inner
            .subscribers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let count = subscribers.len();
        subscribers.clear();
        if count > 0 {
            info!(subscribers = count, "Closed live subscriptions");
        }
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.inner
            .subscribers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

/// Spawn the hourly retention sweeper. Events older than the retention
/// window are deleted; sequence numbers are never reused afterwards.
pub fn spawn_retention_sweeper(
    store: Arc<dyn Store>,
    retention_days: i64,
    interval_secs: u64,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let cutoff = Utc::now() - chrono::Duration::days(retention_days);
            match store.prune_events(cutoff).await {
                Ok(0) => {}
                Ok(removed) => info!(removed, retention_days, "Pruned expired events"),
                Err(e) => warn!(error = %e, "Event retention sweep failed"),
            }
        }
    })
}
