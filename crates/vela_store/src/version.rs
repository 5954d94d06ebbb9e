//! State timestamps, branch identities, versions, and write-ordering tokens.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Logical server identifier within the cluster.
pub type ServerId = u64;

/// Position in the total order of writes on a branch.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize, Default,
)]
pub struct StateTimestamp(u64);

impl StateTimestamp {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn zero() -> Self {
        Self(0)
    }

    pub fn get(self) -> u64 {
        self.0
    }

    /// The timestamp directly before this one.
    pub fn pred(self) -> Self {
        assert!(self.0 > 0, "zero timestamp has no predecessor");
        Self(self.0 - 1)
    }

    /// The timestamp directly after this one.
    pub fn succ(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for StateTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a version lineage. All writes handled by one replica target a
/// single branch.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub struct BranchId(pub u64);

/// Per-key-range version annotation stored alongside data.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Version {
    pub branch: BranchId,
    pub timestamp: StateTimestamp,
}

impl Version {
    pub const fn new(branch: BranchId, timestamp: StateTimestamp) -> Self {
        Self { branch, timestamp }
    }

    /// Sentinel version of a store that has never been written.
    pub const fn zero() -> Self {
        Self {
            branch: BranchId(0),
            timestamp: StateTimestamp::zero(),
        }
    }
}

/// Token stamped on operations by their issuer so downstream consumers can
/// assert they observe a non-decreasing sequence.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct OrderToken(u64);

impl OrderToken {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }
}

/// Mints order tokens in ascending sequence.
#[derive(Debug, Default)]
pub struct OrderSource {
    next: AtomicU64,
}

impl OrderSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check_in(&self) -> OrderToken {
        OrderToken(self.next.fetch_add(1, Ordering::SeqCst))
    }
}

/// Asserts that the order tokens flowing through one point of the pipeline
/// never regress. This is an invariant check, not a sort.
#[derive(Debug, Default)]
pub struct OrderCheckpoint {
    last: Option<OrderToken>,
}

impl OrderCheckpoint {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check_through(&mut self, token: OrderToken) -> OrderToken {
        if let Some(last) = self.last {
            assert!(
                last <= token,
                "order token regressed: {last:?} then {token:?}"
            );
        }
        self.last = Some(token);
        token
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pred_and_succ_are_inverse() {
        let t = StateTimestamp::new(7);
        assert_eq!(t.succ().pred(), t);
        assert_eq!(t.pred().succ(), t);
    }

    #[test]
    #[should_panic(expected = "no predecessor")]
    fn zero_has_no_predecessor() {
        let _ = StateTimestamp::zero().pred();
    }

    #[test]
    fn order_source_is_ascending() {
        let source = OrderSource::new();
        let a = source.check_in();
        let b = source.check_in();
        assert!(a < b);
    }

    #[test]
    fn checkpoint_accepts_monotonic_tokens() {
        let mut cp = OrderCheckpoint::new();
        cp.check_through(OrderToken::new(1));
        cp.check_through(OrderToken::new(1));
        cp.check_through(OrderToken::new(5));
    }

    #[test]
    #[should_panic(expected = "order token regressed")]
    fn checkpoint_rejects_regressing_tokens() {
        let mut cp = OrderCheckpoint::new();
        cp.check_through(OrderToken::new(5));
        cp.check_through(OrderToken::new(4));
    }
}
