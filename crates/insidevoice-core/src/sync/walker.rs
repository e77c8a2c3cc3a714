//! Resumable history walk
//!
//! Streams the history oldest to newest as [`Record`]s, then the sentinel.
//! When the transport reports congestion the walk stops where it is and
//! returns [`WalkStatus::Congested`]; the deferred domain calls [`SyncWalker::walk`]
//! again after [`SYNC_RETRY_DELAY`] and the walk carries on from the record
//! that did not go out. Delivered records are never re-sent.
//!
//! Every step locks the history on its own. No borrow of the history is
//! held across a delivery attempt.

use super::record::{Record, SENTINEL};
use crate::history::SampleHistory;
use crate::service::{Characteristic, Delivery, Transport};
use std::time::Duration;

/// Back-off before retrying after congestion
pub const SYNC_RETRY_DELAY: Duration = Duration::from_millis(20);

/// Outcome of one walk attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkStatus {
    /// Every record and the sentinel went out
    Complete { sent: usize },
    /// The transport is full; call `walk` again later
    Congested { next_index: usize },
    /// No walk in progress
    Idle,
}

/// Cursor over the sample history
#[derive(Debug, Default)]
pub struct SyncWalker {
    next_index: usize,
    active: bool,
    sent: usize,
}

impl SyncWalker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin a walk from the oldest retained sample
    ///
    /// Restarts from index 0 even when a walk is already in progress.
    pub fn start(&mut self) {
        if self.active {
            tracing::debug!(next_index = self.next_index, "Sync restarted from the beginning");
        }
        self.next_index = 0;
        self.sent = 0;
        self.active = true;
    }

    /// Abandon the walk in progress
    pub fn cancel(&mut self) {
        if self.active {
            tracing::info!(sent = self.sent, "Sync abandoned");
        }
        self.next_index = 0;
        self.sent = 0;
        self.active = false;
    }

    /// Deliver records until done or congested
    pub fn walk(&mut self, history: &SampleHistory, transport: &dyn Transport) -> WalkStatus {
        if !self.active {
            return WalkStatus::Idle;
        }

        let mut index = self.next_index;
        // End bound re-read per step: samples committed mid-walk go out too
        while index < history.count() {
            // Evicted between count() and get(): skip
            if let Some(sample) = history.get(index) {
                if transport.notify(Characteristic::SyncData, &Record::encode(&sample))
                    == Delivery::Congested
                {
                    return self.back_off(index);
                }
                self.sent += 1;
            }
            index += 1;
        }

        if transport.notify(Characteristic::SyncData, &SENTINEL) == Delivery::Congested {
            return self.back_off(index);
        }

        let sent = self.sent;
        tracing::info!(sent, "Sync complete");
        self.next_index = 0;
        self.sent = 0;
        self.active = false;
        WalkStatus::Complete { sent }
    }

    fn back_off(&mut self, index: usize) -> WalkStatus {
        self.next_index = index;
        tracing::debug!(next_index = index, "Sync congested, backing off");
        WalkStatus::Congested { next_index: index }
    }

    /// Whether a walk is in progress
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Logical index the walk resumes from
    pub fn next_index(&self) -> usize {
        self.next_index
    }
}
