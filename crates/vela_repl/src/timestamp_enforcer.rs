//! Serializes events keyed by state timestamp.
//!
//! The enforcer tracks which timestamps have completed and lets waiters park
//! until every timestamp up to a threshold has been marked complete. It is
//! the ordering backbone of the write stream during bootstrap; the installed
//! replica does its own ordering afterwards.

use std::collections::BTreeSet;
use std::sync::Mutex;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use vela_store::StateTimestamp;

use crate::error::{Error, Result};

struct Inner {
    begin: StateTimestamp,
    /// Highest T such that every timestamp in (begin, T] has completed.
    latest: StateTimestamp,
    /// Completed timestamps above `latest`, waiting for the gap to close.
    pending: BTreeSet<StateTimestamp>,
}

/// Tracks completion of a dense timestamp sequence starting right after a
/// watermark.
pub struct TimestampEnforcer {
    inner: Mutex<Inner>,
    watermark: watch::Sender<StateTimestamp>,
}

impl TimestampEnforcer {
    /// Create an enforcer whose history up to and including `begin` counts
    /// as already complete.
    pub fn new(begin: StateTimestamp) -> Self {
        Self {
            inner: Mutex::new(Inner {
                begin,
                latest: begin,
                pending: BTreeSet::new(),
            }),
            watermark: watch::channel(begin).0,
        }
    }

    /// Mark `timestamp` complete. Panics on timestamps at or below the
    /// initial watermark and on double completion.
    pub fn complete(&self, timestamp: StateTimestamp) {
        let mut inner = self.inner.lock().expect("enforcer lock poisoned");
        assert!(
            timestamp > inner.begin,
            "completed timestamp {timestamp} at or below the initial watermark {}",
            inner.begin
        );
        assert!(
            timestamp > inner.latest && !inner.pending.contains(&timestamp),
            "timestamp {timestamp} completed twice"
        );
        inner.pending.insert(timestamp);
        let mut advanced = false;
        loop {
            let next = inner.latest.succ();
            if !inner.pending.remove(&next) {
                break;
            }
            inner.latest = next;
            advanced = true;
        }
        if advanced {
            self.watermark.send_replace(inner.latest);
        }
    }

    /// Snapshot of the highest timestamp below which everything completed.
    pub fn latest_all_before_completed(&self) -> StateTimestamp {
        *self.watermark.borrow()
    }

    /// Suspend until every timestamp up to `threshold` has completed, or
    /// fail with `Cancelled` when the token fires first.
    pub async fn wait_all_before(
        &self,
        threshold: StateTimestamp,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut rx = self.watermark.subscribe();
        tokio::select! {
            result = rx.wait_for(|watermark| *watermark >= threshold) => {
                result.map(|_| ()).map_err(|_| Error::Cancelled)
            }
            _ = cancel.cancelled() => Err(Error::Cancelled),
        }
    }
}
