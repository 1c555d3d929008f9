//! Snapshot reconciliation.
//!
//! [`Reconciler::reconcile`] diffs the previous reconciled state against a new
//! raw snapshot and classifies every connection as continuing, newly closed or
//! newly observed. The result is a fresh immutable [`ReconciledState`]; the
//! closed history is shared by reference when nothing closed.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use serde::{Serialize, Serializer};

use crate::snapshot::{ConnectionRecord, RawSnapshot};

/// Default number of closed connections retained.
pub const DEFAULT_CLOSED_CAPACITY: usize = 500;

/// Reconciled view of the connection table.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciledState {
    /// Aggregate upload counter, taken verbatim from the latest snapshot.
    pub upload_total: u64,
    /// Aggregate download counter, taken verbatim from the latest snapshot.
    pub download_total: u64,
    /// Currently open connections, at most one per identifier.
    #[serde(rename = "activeConnections")]
    pub active: Vec<Arc<ConnectionRecord>>,
    /// Recently closed connections, oldest first.
    #[serde(rename = "closedConnections")]
    pub closed: Arc<ClosedHistory>,
}

impl Default for ReconciledState {
    fn default() -> Self {
        Self::empty(DEFAULT_CLOSED_CAPACITY)
    }
}

impl ReconciledState {
    /// An empty state whose closed history holds `closed_capacity` entries.
    pub fn empty(closed_capacity: usize) -> Self {
        Self {
            upload_total: 0,
            download_total: 0,
            active: Vec::new(),
            closed: Arc::new(ClosedHistory::new(closed_capacity)),
        }
    }

    /// Looks up an active connection by identifier.
    pub fn active_by_id(&self, id: &str) -> Option<&ConnectionRecord> {
        self.active.iter().find(|c| c.id == id).map(Arc::as_ref)
    }

    /// Sum of per-connection upload rates over the active set.
    pub fn upload_rate(&self) -> u64 {
        self.active.iter().map(|c| c.upload_rate).sum()
    }

    /// Sum of per-connection download rates over the active set.
    pub fn download_rate(&self) -> u64 {
        self.active.iter().map(|c| c.download_rate).sum()
    }

    /// Same totals and active set with an empty closed history.
    pub fn without_closed(&self) -> Self {
        Self {
            upload_total: self.upload_total,
            download_total: self.download_total,
            active: self.active.clone(),
            closed: Arc::new(ClosedHistory::new(self.closed.capacity())),
        }
    }

    /// Same totals and closed history with an empty active set.
    pub fn without_active(&self) -> Self {
        Self {
            upload_total: self.upload_total,
            download_total: self.download_total,
            active: Vec::new(),
            closed: Arc::clone(&self.closed),
        }
    }
}

/// Bounded FIFO of closed connections. Oldest entries are evicted first.
#[derive(Debug, Clone)]
pub struct ClosedHistory {
    entries: VecDeque<Arc<ConnectionRecord>>,
    capacity: usize,
}

impl ClosedHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &ConnectionRecord> {
        self.entries.iter().map(Arc::as_ref)
    }

    /// Most recently closed entry.
    pub fn last(&self) -> Option<&ConnectionRecord> {
        self.entries.back().map(Arc::as_ref)
    }

    /// Copy of this history with `closed` appended and the oldest overflow dropped.
    fn extended(&self, closed: Vec<Arc<ConnectionRecord>>) -> Self {
        let total = self.entries.len() + closed.len();
        let skip = total.saturating_sub(self.capacity);

        let mut entries = VecDeque::with_capacity(total.min(self.capacity));
        entries.extend(
            self.entries
                .iter()
                .cloned()
                .chain(closed)
                .skip(skip),
        );

        Self {
            entries,
            capacity: self.capacity,
        }
    }
}

impl Serialize for ClosedHistory {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.entries.iter())
    }
}

/// Per-call accounting, used for logging and metrics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileStats {
    pub continuing: usize,
    pub opened: usize,
    pub closed: usize,
    /// Incoming records dropped because a later record reused their identifier.
    pub duplicates: usize,
}

/// Computes the next [`ReconciledState`] from the previous one and a raw snapshot.
#[derive(Debug, Clone, Copy)]
pub struct Reconciler {
    closed_capacity: usize,
}

impl Default for Reconciler {
    fn default() -> Self {
        Self::new(DEFAULT_CLOSED_CAPACITY)
    }
}

impl Reconciler {
    pub fn new(closed_capacity: usize) -> Self {
        Self { closed_capacity }
    }

    /// Initial state matching this reconciler's capacity.
    pub fn initial_state(&self) -> ReconciledState {
        ReconciledState::empty(self.closed_capacity)
    }

    /// Reconcile `raw` against `previous`.
    pub fn reconcile(&self, previous: &ReconciledState, raw: RawSnapshot) -> ReconciledState {
        self.reconcile_with_stats(previous, raw).0
    }

    /// Reconcile and report how many records continued, opened and closed.
    ///
    /// Rates are `incoming - previous` per direction, clamped at zero when the
    /// core's counters went backwards.
    pub fn reconcile_with_stats(
        &self,
        previous: &ReconciledState,
        raw: RawSnapshot,
    ) -> (ReconciledState, ReconcileStats) {
        let RawSnapshot {
            upload_total,
            download_total,
            connections,
            ..
        } = raw;

        let mut stats = ReconcileStats::default();

        // Last occurrence of an identifier wins.
        let mut incoming: Vec<Option<ConnectionRecord>> =
            connections.into_iter().map(Some).collect();
        let mut by_id: HashMap<String, usize> = HashMap::with_capacity(incoming.len());
        for (idx, slot) in incoming.iter().enumerate() {
            if let Some(record) = slot {
                if by_id.insert(record.id.clone(), idx).is_some() {
                    stats.duplicates += 1;
                }
            }
        }

        let mut active = Vec::with_capacity(by_id.len());
        let mut newly_closed = Vec::new();

        for prev in &previous.active {
            let next = by_id
                .remove(prev.id.as_str())
                .and_then(|idx| incoming.get_mut(idx))
                .and_then(Option::take);

            match next {
                Some(mut next) => {
                    next.upload_rate = next.upload.saturating_sub(prev.upload);
                    next.download_rate = next.download.saturating_sub(prev.download);
                    active.push(Arc::new(next));
                    stats.continuing += 1;
                }
                None => {
                    newly_closed.push(Arc::clone(prev));
                    stats.closed += 1;
                }
            }
        }

        // Whatever is left in the lookup has no baseline.
        let mut remaining: Vec<usize> = by_id.into_values().collect();
        remaining.sort_unstable();
        for idx in remaining {
            if let Some(mut record) = incoming.get_mut(idx).and_then(Option::take) {
                record.upload_rate = 0;
                record.download_rate = 0;
                active.push(Arc::new(record));
                stats.opened += 1;
            }
        }

        let closed = if newly_closed.is_empty() {
            Arc::clone(&previous.closed)
        } else {
            let history = if previous.closed.capacity() == self.closed_capacity {
                previous.closed.extended(newly_closed)
            } else {
                ClosedHistory {
                    entries: previous.closed.entries.clone(),
                    capacity: self.closed_capacity,
                }
                .extended(newly_closed)
            };
            Arc::new(history)
        };

        let state = ReconciledState {
            upload_total,
            download_total,
            active,
            closed,
        };

        (state, stats)
    }
}
