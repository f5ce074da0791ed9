//! Call state subscriptions
//!
//! Negotiators publish an immutable [`CallSnapshot`] after every change.
//! Consumers register a [`StateListener`] and get back a [`ListenerId`] they
//! use to unregister; the latest snapshot is also kept on a watch channel.

use crate::types::CallSnapshot;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

/// Receives call snapshots
pub trait StateListener: Send + Sync {
    /// Called with every published snapshot
    fn on_state(&self, snapshot: &CallSnapshot);
}

impl<F> StateListener for F
where
    F: Fn(&CallSnapshot) + Send + Sync,
{
    fn on_state(&self, snapshot: &CallSnapshot) {
        self(snapshot)
    }
}

/// Handle returned by [`StatePublisher::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Fan-out point for call snapshots
pub struct StatePublisher {
    listeners: RwLock<Vec<(ListenerId, Arc<dyn StateListener>)>>,
    next_id: AtomicU64,
    latest: watch::Sender<Option<CallSnapshot>>,
}

impl StatePublisher {
    /// Publisher with no listeners
    pub fn new() -> Self {
        let (latest, _) = watch::channel(None);
        Self {
            listeners: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            latest,
        }
    }

    /// Register a listener
    pub fn subscribe(&self, listener: Arc<dyn StateListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push((id, listener));
        id
    }

    /// Unregister a listener. Returns false if it was not registered.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    /// Number of registered listeners
    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    /// Deliver a snapshot to every listener
    pub fn publish(&self, snapshot: CallSnapshot) {
        // Listeners may subscribe or unsubscribe from inside the callback
        let listeners: Vec<_> = self
            .listeners
            .read()
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in listeners {
            listener.on_state(&snapshot);
        }
        self.latest.send_replace(Some(snapshot));
    }

    /// Most recently published snapshot
    pub fn latest(&self) -> Option<CallSnapshot> {
        self.latest.borrow().clone()
    }

    /// Watch channel following the latest snapshot
    pub fn watch(&self) -> watch::Receiver<Option<CallSnapshot>> {
        self.latest.subscribe()
    }
}

impl Default for StatePublisher {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for StatePublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatePublisher")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_subscribe_and_unsubscribe() {
        let publisher = StatePublisher::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let id = publisher.subscribe(Arc::new(move |_: &CallSnapshot| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        publisher.publish(CallSnapshot::default());
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        assert!(publisher.unsubscribe(id));
        assert!(!publisher.unsubscribe(id));
        publisher.publish(CallSnapshot::default());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_latest_tracks_last_publish() {
        let publisher = StatePublisher::new();
        assert!(publisher.latest().is_none());
        publisher.publish(CallSnapshot {
            error: Some("boom".to_string()),
            ..Default::default()
        });
        assert_eq!(
            publisher.latest().and_then(|s| s.error).as_deref(),
            Some("boom")
        );
    }
}
