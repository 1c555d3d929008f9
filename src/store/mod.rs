//! State store.
//!
//! Holds the latest [`ReconciledState`] behind a version counter. Readers pull
//! the current value lock-free; subscribers are woken on every change. Writers
//! (the reconcile path and consumer-initiated clears) are serialized so a clear
//! can never be lost to a concurrent reconcile.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{broadcast, watch};

use crate::reconcile::ReconciledState;

/// Capacity of the error channel; slow consumers miss the oldest errors.
const ERROR_CHANNEL_CAPACITY: usize = 64;

/// A reconciled state tagged with a monotonically increasing version.
#[derive(Debug, Clone, Serialize)]
pub struct Versioned {
    pub version: u64,
    pub state: Arc<ReconciledState>,
}

/// Connection state of the snapshot source, for status indication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionStatus {
    /// Not started yet.
    Idle,
    Connecting,
    Connected,
    /// Waiting to retry after a transport failure.
    Disconnected {
        reason: String,
        #[serde(with = "humantime_serde")]
        retry_in: Duration,
    },
    Stopped,
}

impl ConnectionStatus {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

/// Recoverable errors surfaced to consumers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    /// A frame was not a well-formed snapshot. Previous state is kept.
    #[error("malformed snapshot: {0}")]
    Malformed(String),
}

struct Inner {
    current: ArcSwap<Versioned>,
    write: parking_lot::Mutex<()>,
    updates: watch::Sender<Arc<Versioned>>,
    errors: broadcast::Sender<StreamError>,
    status: watch::Sender<ConnectionStatus>,
}

/// Shared handle to the reconciled state. Cloning is cheap.
#[derive(Clone)]
pub struct StateStore {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore")
            .field("version", &self.version())
            .field("status", &*self.inner.status.borrow())
            .finish()
    }
}

impl StateStore {
    /// Creates a store holding `initial` at version 0.
    pub fn new(initial: ReconciledState) -> Self {
        let initial = Arc::new(Versioned {
            version: 0,
            state: Arc::new(initial),
        });
        let (updates, _) = watch::channel(Arc::clone(&initial));
        let (errors, _) = broadcast::channel(ERROR_CHANNEL_CAPACITY);
        let (status, _) = watch::channel(ConnectionStatus::Idle);

        Self {
            inner: Arc::new(Inner {
                current: ArcSwap::new(initial),
                write: parking_lot::Mutex::new(()),
                updates,
                errors,
                status,
            }),
        }
    }

    /// Latest state. Never blocks.
    pub fn current(&self) -> Arc<Versioned> {
        self.inner.current.load_full()
    }

    pub fn version(&self) -> u64 {
        self.inner.current.load().version
    }

    /// Subscribe to future updates. The current state counts as already seen.
    pub fn subscribe(&self) -> Subscription {
        Subscription {
            rx: self.inner.updates.subscribe(),
        }
    }

    /// Replace the state with `f(current)`, returning the new version and `f`'s extra output.
    pub fn apply<F, R>(&self, f: F) -> (Arc<Versioned>, R)
    where
        F: FnOnce(&ReconciledState) -> (ReconciledState, R),
    {
        let _guard = self.inner.write.lock();
        let prev = self.inner.current.load_full();
        let (state, extra) = f(&prev.state);
        (self.publish(prev.version + 1, state), extra)
    }

    /// Empty the closed history, keeping active connections and totals.
    ///
    /// Idempotent: clearing an already empty history does not bump the version.
    pub fn clear_closed_history(&self) -> Arc<Versioned> {
        let _guard = self.inner.write.lock();
        let prev = self.inner.current.load_full();
        if prev.state.closed.is_empty() {
            return prev;
        }

        self.publish(prev.version + 1, prev.state.without_closed())
    }

    /// Start a new source session: forget the active set, keep history and totals.
    pub fn begin_session(&self) -> Arc<Versioned> {
        let _guard = self.inner.write.lock();
        let prev = self.inner.current.load_full();
        if prev.state.active.is_empty() {
            return prev;
        }

        self.publish(prev.version + 1, prev.state.without_active())
    }

    fn publish(&self, version: u64, state: ReconciledState) -> Arc<Versioned> {
        let next = Arc::new(Versioned {
            version,
            state: Arc::new(state),
        });
        self.inner.current.store(Arc::clone(&next));
        self.inner.updates.send_replace(Arc::clone(&next));
        next
    }

    /// Surface a recoverable error to consumers.
    pub fn report_error(&self, err: StreamError) {
        // No receivers is fine.
        let _ = self.inner.errors.send(err);
    }

    /// Receive errors reported after this call.
    pub fn errors(&self) -> broadcast::Receiver<StreamError> {
        self.inner.errors.subscribe()
    }

    pub fn set_status(&self, status: ConnectionStatus) {
        self.inner.status.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });
    }

    pub fn status(&self) -> ConnectionStatus {
        self.inner.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status.subscribe()
    }
}

/// Push side of the store.
pub struct Subscription {
    rx: watch::Receiver<Arc<Versioned>>,
}

impl Subscription {
    /// Wait for the next update. Intermediate versions may be skipped; the
    /// returned state is always the newest. `None` once the store is gone.
    pub async fn next(&mut self) -> Option<Arc<Versioned>> {
        self.rx.changed().await.ok()?;
        Some(Arc::clone(&self.rx.borrow_and_update()))
    }
}
