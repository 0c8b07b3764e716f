//! Snapshot broadcasting to subscribers.

use crate::snapshot::Snapshot;
use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;

type Listener = Arc<dyn Fn(&Snapshot) + Send + Sync>;

/// Delivers each settled snapshot to callback listeners and to a broadcast
/// channel.
pub(crate) struct Broadcaster {
    /// Callback listeners keyed by subscription id.
    listeners: Mutex<Vec<(String, Listener)>>,

    /// Channel for `watch()` receivers.
    sender: broadcast::Sender<Arc<Snapshot>>,
}

impl Broadcaster {
    pub(crate) fn new(channel_capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(channel_capacity.max(1));
        Self {
            listeners: Mutex::new(Vec::new()),
            sender,
        }
    }

    pub(crate) fn subscribe(&self, listener: Listener) -> String {
        let subscription_id = format!("sub-{}", uuid::Uuid::new_v4());
        self.listeners
            .lock()
            .push((subscription_id.clone(), listener));
        subscription_id
    }

    /// Returns true if the subscription was found and removed.
    pub(crate) fn unsubscribe(&self, subscription_id: &str) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(id, _)| id != subscription_id);
        listeners.len() != before
    }

    pub(crate) fn watch(&self) -> broadcast::Receiver<Arc<Snapshot>> {
        self.sender.subscribe()
    }

    /// Calls every listener, then sends to the channel.
    ///
    /// Listeners are called outside the lock so they may subscribe or
    /// unsubscribe.
    pub(crate) fn notify(&self, snapshot: &Arc<Snapshot>) {
        let listeners: Vec<Listener> = self
            .listeners
            .lock()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in listeners {
            listener(snapshot);
        }

        // Ignore send errors (no receivers)
        let _ = self.sender.send(Arc::clone(snapshot));
    }

    pub(crate) fn subscription_count(&self) -> usize {
        self.listeners.lock().len()
    }

    pub(crate) fn clear(&self) {
        self.listeners.lock().clear();
    }
}

impl fmt::Debug for Broadcaster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Broadcaster")
            .field("listeners", &self.subscription_count())
            .field("receivers", &self.sender.receiver_count())
            .finish()
    }
}

/// Handle to a callback subscription.
///
/// Dropping the handle keeps the listener registered; call
/// [`Subscription::unsubscribe`] to remove it.
#[derive(Debug, Clone)]
pub struct Subscription {
    id: String,
    broadcaster: Weak<Broadcaster>,
}

impl Subscription {
    pub(crate) fn new(id: String, broadcaster: Weak<Broadcaster>) -> Self {
        Self { id, broadcaster }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Removes the listener. Returns false if it was already removed or the
    /// machine is gone.
    pub fn unsubscribe(&self) -> bool {
        self.broadcaster
            .upgrade()
            .map_or(false, |broadcaster| broadcaster.unsubscribe(&self.id))
    }
}
