//! Connectivity monitor.
//!
//! Process-scoped online/offline signal owned by the sync engine and
//! exposed only through these accessors. The embedding shell feeds
//! transitions in via `set_online`; the engine watches for the
//! offline→online edge. The watch channel coalesces flickers, so a rapid
//! online→offline→online burst still yields one observable edge per
//! settled state.

use tokio::sync::watch;

#[derive(Clone)]
pub struct ConnectivityMonitor {
    tx: watch::Sender<bool>,
}

impl ConnectivityMonitor {
    /// Start in the given state. Terminals usually boot offline and flip
    /// online once the first health check passes.
    pub fn new(online: bool) -> Self {
        let (tx, _rx) = watch::channel(online);
        Self { tx }
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    /// Record a connectivity transition. No-op sends are suppressed so
    /// watchers only wake on real changes.
    pub fn set_online(&self, online: bool) {
        self.tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
    }

    /// Subscribe to connectivity changes.
    pub fn watch(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(false)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
