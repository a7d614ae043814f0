//! # TelemetryHub: non-blocking fan-out of replies to live subscribers
//!
//! Every connection registers a [`Subscription`] for its lifetime. [`TelemetryHub::publish`]
//! pushes one message into every registered queue **without awaiting** consumers.
//!
//! ## Overflow policy: drop-new
//! Queues are bounded. When a subscriber's queue is full the new message is dropped
//! for that subscriber only; other subscribers are unaffected and the publisher never
//! blocks. Queues whose receiver is gone are pruned on the next publish.
//!
//! The hub has no memory: a subscriber only sees messages published after it subscribed.
//!
//! ```text
//!    publish(reply)
//!        │                        (Arc-clone per subscriber)
//!        ├────────────────► [queue S1] ─► TCP writer
//!        ├────────────────► [queue S2] ─► WebSocket writer
//!        └────────────────► [queue SN] ─► ...
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::messages::Reply;

/// Opaque identifier of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "subscriber_{}", self.0)
    }
}

type Queues = HashMap<SubscriberId, mpsc::Sender<Arc<Reply>>>;

struct HubInner {
    queues: Mutex<Queues>,
    next_id: AtomicU64,
    capacity: usize,
    dropped: AtomicU64,
}

impl HubInner {
    fn queues(&self) -> MutexGuard<'_, Queues> {
        // A poisoned map is still structurally valid.
        self.queues.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn remove(&self, id: SubscriberId) -> bool {
        let removed = self.queues().remove(&id).is_some();
        if removed {
            debug!(subscriber = %id, "Subscriber unregistered");
        }
        removed
    }

    fn deliver(&self, id: SubscriberId, sender: &mpsc::Sender<Arc<Reply>>, msg: Arc<Reply>) -> bool {
        match sender.try_send(msg) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(subscriber = %id, "Subscriber dropped message: queue full");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

/// Fan-out registry mapping live subscriptions to bounded delivery queues.
#[derive(Clone)]
pub struct TelemetryHub {
    inner: Arc<HubInner>,
}

impl TelemetryHub {
    /// Creates a hub whose subscriber queues hold `capacity` messages (minimum 1).
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(HubInner {
                queues: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
                capacity: capacity.max(1),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Registers a new delivery queue. Ownership goes to the caller; dropping the
    /// subscription unregisters it.
    pub fn subscribe(&self) -> Subscription {
        let id = SubscriberId(self.inner.next_id.fetch_add(1, Ordering::SeqCst));
        let (tx, rx) = mpsc::channel(self.inner.capacity);
        self.inner.queues().insert(id, tx);
        debug!(subscriber = %id, "New subscriber registered");
        Subscription {
            id,
            receiver: rx,
            hub: Arc::downgrade(&self.inner),
        }
    }

    /// Removes a subscription's queue. Messages already queued are discarded once
    /// the owner stops draining. Unknown ids are ignored.
    pub fn unsubscribe(&self, id: SubscriberId) {
        self.inner.remove(id);
    }

    /// Pushes `reply` to every current subscriber without blocking.
    pub fn publish(&self, reply: Reply) {
        let msg = Arc::new(reply);
        let mut queues = self.inner.queues();
        let before = queues.len();
        queues.retain(|id, sender| self.inner.deliver(*id, sender, Arc::clone(&msg)));
        let pruned = before - queues.len();
        if pruned > 0 {
            debug!(pruned, "Pruned closed subscriber queues");
        }
        trace!(subscribers = queues.len(), "Published reply");
    }

    /// Pushes `reply` to a single subscriber. Returns `false` when the subscriber
    /// is no longer registered.
    pub fn send_to(&self, id: SubscriberId, reply: Reply) -> bool {
        let mut queues = self.inner.queues();
        let Some(sender) = queues.get(&id) else {
            return false;
        };
        if self.inner.deliver(id, sender, Arc::new(reply)) {
            true
        } else {
            queues.remove(&id);
            false
        }
    }

    /// Number of registered subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.inner.queues().len()
    }

    /// Total messages dropped because a subscriber queue was full.
    pub fn dropped_count(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for TelemetryHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TelemetryHub")
            .field("subscribers", &self.subscriber_count())
            .field("capacity", &self.inner.capacity)
            .finish()
    }
}

/// A per-connection delivery queue registered in a [`TelemetryHub`].
#[derive(Debug)]
pub struct Subscription {
    id: SubscriberId,
    receiver: mpsc::Receiver<Arc<Reply>>,
    hub: Weak<HubInner>,
}

impl Subscription {
    /// Identifier used for targeted replies.
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Waits for the next message. Returns `None` once unsubscribed and drained.
    pub async fn recv(&mut self) -> Option<Arc<Reply>> {
        self.receiver.recv().await
    }

    /// Returns a queued message without waiting.
    pub fn try_recv(&mut self) -> Option<Arc<Reply>> {
        self.receiver.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.remove(self.id);
        }
    }
}

impl fmt::Debug for HubInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HubInner")
            .field("capacity", &self.capacity)
            .finish()
    }
}
