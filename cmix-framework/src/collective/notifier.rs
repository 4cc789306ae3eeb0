use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use parking_lot::Mutex;
use slab::Slab;

/// Called with `true` when uploads start succeeding again and `false` when they start failing
pub type ConnectivityCallback = Arc<dyn Fn(bool) + Send + Sync>;

/// Tracks whether the remote copy of the local patch is current, calling subscribers only when
/// that changes
pub struct Notifier {
    connected: AtomicBool,
    subscribers: Mutex<Slab<ConnectivityCallback>>,
}

impl Notifier {
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(true),
            subscribers: Mutex::new(Slab::new()),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self, callback: ConnectivityCallback) -> usize {
        self.subscribers.lock().insert(callback)
    }

    pub fn unsubscribe(&self, id: usize) -> bool {
        self.subscribers.lock().try_remove(id).is_some()
    }

    pub fn set(&self, connected: bool) {
        if self.connected.swap(connected, Ordering::SeqCst) == connected {
            return;
        }

        log::debug!(
            "Remote store {}",
            if connected { "reachable" } else { "unreachable" }
        );

        let subscribers = self
            .subscribers
            .lock()
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect::<Vec<_>>();
        for cb in subscribers {
            cb(connected);
        }
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}
