//! Update throttle.
//!
//! A depth-one mailbox with overwrite-on-arrival semantics plus a one-shot
//! deadline. The first arrival after an idle period arms the deadline; later
//! arrivals only replace the pending item. When the deadline passes, the
//! freshest item is released and the throttle goes idle again, so an idle
//! stream never schedules a wakeup.
//!
//! The throttle is plain state; the owner drives it from a single task and
//! sleeps until [`Throttle::deadline`].

use std::time::Duration;

use tokio::time::Instant;

/// Default coalescing window.
pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(200);

/// Outcome of [`Throttle::offer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offer {
    /// Slot was empty; the deadline is now armed.
    Armed(Instant),
    /// A pending item was overwritten; the deadline is unchanged.
    Replaced,
    /// The throttle has been closed; the item was dropped.
    Rejected,
}

#[derive(Debug)]
pub struct Throttle<T> {
    interval: Duration,
    pending: Option<T>,
    deadline: Option<Instant>,
    closed: bool,
    replaced: u64,
}

impl<T> Throttle<T> {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            pending: None,
            deadline: None,
            closed: false,
            replaced: 0,
        }
    }

    /// Store `item` as the pending item, replacing any unreleased one.
    pub fn offer(&mut self, item: T, now: Instant) -> Offer {
        if self.closed {
            return Offer::Rejected;
        }

        // An armed deadline always has an item pending.
        self.pending = Some(item);

        match self.deadline {
            Some(_) => {
                self.replaced += 1;
                Offer::Replaced
            }
            None => {
                let deadline = now + self.interval;
                self.deadline = Some(deadline);
                Offer::Armed(deadline)
            }
        }
    }

    /// When the pending item becomes due, if anything is pending.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Release the pending item if its deadline has passed.
    pub fn poll_due(&mut self, now: Instant) -> Option<T> {
        match self.deadline {
            Some(deadline) if deadline <= now => self.clear(),
            _ => None,
        }
    }

    /// Take the pending item, if any, and disarm. The throttle stays usable.
    pub fn clear(&mut self) -> Option<T> {
        self.deadline = None;
        self.pending.take()
    }

    /// Drop the pending item, disarm, and reject all further offers.
    pub fn close(&mut self) {
        self.clear();
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Number of items overwritten before release since creation.
    pub fn replaced_count(&self) -> u64 {
        self.replaced
    }
}
