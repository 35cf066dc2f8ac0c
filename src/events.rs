//! Subscription registry for component notifications.
//!
//! Each component owns one [`EventHub`] for its own event type. Subscribers
//! get a crossbeam receiver they drain at their own pace; unsubscribing (or
//! dropping the receiver) removes them deterministically.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_channel::{Receiver, Sender, TryRecvError, TrySendError, unbounded};

/// Identifies one subscription on one hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Receiving end of a subscription.
#[derive(Debug)]
pub struct Subscription<E> {
    id: SubscriptionId,
    receiver: Receiver<E>,
}

impl<E> Subscription<E> {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Next pending event, if any.
    pub fn try_next(&self) -> Option<E> {
        match self.receiver.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// All pending events, oldest first.
    pub fn drain(&self) -> Vec<E> {
        self.receiver.try_iter().collect()
    }
}

/// Fan-out of one event type to any number of subscribers.
pub struct EventHub<E> {
    next_id: AtomicU64,
    subscribers: Mutex<Vec<(SubscriptionId, Sender<E>)>>,
}

impl<E: Clone + Send> EventHub<E> {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self) -> Subscription<E> {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (sender, receiver) = unbounded();
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.push((id, sender));
        }
        Subscription { id, receiver }
    }

    /// Returns false if the id was not subscribed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let Ok(mut subscribers) = self.subscribers.lock() else {
            return false;
        };
        let before = subscribers.len();
        subscribers.retain(|(existing, _)| *existing != id);
        subscribers.len() != before
    }

    /// Deliver `event` to every live subscriber. Subscribers whose receiver
    /// was dropped are removed.
    pub fn emit(&self, event: E) {
        let Ok(mut subscribers) = self.subscribers.lock() else {
            return;
        };
        subscribers.retain(|(_, sender)| match sender.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => true,
            Err(TrySendError::Disconnected(_)) => false,
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().map(|s| s.len()).unwrap_or(0)
    }
}

impl<E: Clone + Send> Default for EventHub<E> {
    fn default() -> Self {
        Self::new()
    }
}
