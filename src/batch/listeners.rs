//! Completed-notification listeners

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

/// Handle returned when a completed listener is registered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Listener invoked when a batch run finishes
pub type CompletedListener = Arc<dyn Fn() + Send + Sync>;

/// Ordered multicast list of completed listeners
#[derive(Default)]
pub(crate) struct CompletedListeners {
    next_id: AtomicU64,
    listeners: RwLock<Vec<(ListenerId, CompletedListener)>>,
}

impl CompletedListeners {
    pub(crate) fn add(&self, listener: CompletedListener) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push((id, listener));
        id
    }

    pub(crate) fn remove(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(listener_id, _)| *listener_id != id);
        listeners.len() != before
    }

    pub(crate) fn len(&self) -> usize {
        self.listeners.read().len()
    }

    /// Invoke every listener in registration order.
    ///
    /// Runs against a snapshot, so listeners may register or remove listeners.
    pub(crate) fn notify(&self) {
        let snapshot: Vec<CompletedListener> =
            self.listeners.read().iter().map(|(_, listener)| listener.clone()).collect();

        for listener in snapshot {
            listener();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_notify_in_registration_order() {
        let listeners = CompletedListeners::default();
        let calls = Arc::new(Mutex::new(Vec::new()));

        for name in ["first", "second", "third"] {
            let calls = calls.clone();
            listeners.add(Arc::new(move || calls.lock().push(name)));
        }

        listeners.notify();
        assert_eq!(*calls.lock(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_remove_listener() {
        let listeners = CompletedListeners::default();
        let calls = Arc::new(AtomicU64::new(0));

        let counter = calls.clone();
        let id = listeners.add(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        assert!(listeners.remove(id));
        assert!(!listeners.remove(id));
        assert_eq!(listeners.len(), 0);

        listeners.notify();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
