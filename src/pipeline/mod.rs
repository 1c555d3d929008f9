//! Ingest pipeline: parse, throttle, reconcile, publish.
//!
//! Owned by the supervisor task, which feeds it frames and sleeps until
//! [`Pipeline::deadline`]. Nothing here spawns or blocks.

use std::sync::Arc;
use std::time::Instant as StdInstant;

use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::config::MonitorConfig;
use crate::export::health::HealthMetrics;
use crate::reconcile::{ReconcileStats, Reconciler};
use crate::snapshot::{parse_snapshot, ParseError, RawSnapshot};
use crate::store::{StateStore, StreamError, Versioned};
use crate::throttle::{Offer, Throttle};

pub struct Pipeline {
    throttle: Throttle<RawSnapshot>,
    reconciler: Reconciler,
    store: StateStore,
    health: Option<Arc<HealthMetrics>>,
}

impl Pipeline {
    pub fn new(cfg: &MonitorConfig, store: StateStore, health: Option<Arc<HealthMetrics>>) -> Self {
        Self {
            throttle: Throttle::new(cfg.throttle_interval),
            reconciler: Reconciler::new(cfg.closed_capacity),
            store,
            health,
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Parse a text frame and hand it to the throttle.
    ///
    /// A malformed frame is reported on the store's error channel and leaves
    /// any pending snapshot in place.
    pub fn deliver(&mut self, text: &str, now: Instant) -> Result<Offer, ParseError> {
        let raw = match parse_snapshot(text) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, len = text.len(), "dropping malformed snapshot");
                if let Some(h) = &self.health {
                    h.parse_errors.inc();
                }
                self.store.report_error(StreamError::Malformed(e.to_string()));
                return Err(e);
            }
        };

        let connections = raw.connections.len();
        let offer = self.throttle.offer(raw, now);

        if let Some(h) = &self.health {
            h.snapshots_received.inc();
            if offer == Offer::Replaced {
                h.snapshots_coalesced.inc();
            }
        }
        trace!(connections, ?offer, "snapshot accepted");

        Ok(offer)
    }

    /// When the pending snapshot is due, if one is pending.
    pub fn deadline(&self) -> Option<Instant> {
        self.throttle.deadline()
    }

    /// Reconcile and publish the pending snapshot if its deadline has passed.
    pub fn flush(&mut self, now: Instant) -> Option<Arc<Versioned>> {
        let raw = self.throttle.poll_due(now)?;
        let reconciler = self.reconciler;

        let started = StdInstant::now();
        let (published, stats): (Arc<Versioned>, ReconcileStats) = self
            .store
            .apply(|prev| reconciler.reconcile_with_stats(prev, raw));
        let elapsed = started.elapsed();

        if let Some(h) = &self.health {
            h.reconciliations.inc();
            h.reconcile_duration.observe(elapsed.as_secs_f64());
            h.observe_state(&published.state);
        }

        debug!(
            version = published.version,
            active = published.state.active.len(),
            continuing = stats.continuing,
            opened = stats.opened,
            closed = stats.closed,
            duplicates = stats.duplicates,
            elapsed_us = elapsed.as_micros() as u64,
            "snapshot reconciled",
        );

        Some(published)
    }

    /// Drop any pending snapshot, e.g. when the session ends.
    pub fn reset(&mut self) {
        if self.throttle.clear().is_some() {
            debug!("discarded pending snapshot");
        }
    }

    /// Drop any pending snapshot and reject all further frames.
    pub fn shutdown(&mut self) {
        self.throttle.close();
    }

    pub fn is_shut_down(&self) -> bool {
        self.throttle.is_closed()
    }
}
