//! Branch birth-certificate registry.
//!
//! Every branch a replica serves must be on record before data tagged with it
//! is accepted. The registry is shared opaquely with the backfill machinery
//! and the post-bootstrap replica.

use std::collections::HashMap;
use std::sync::RwLock;

use vela_store::{BranchId, Region, StateTimestamp};

/// Where and when a branch was forked.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BranchBirthCertificate {
    pub branch: BranchId,
    pub origin: Region,
    pub initial_timestamp: StateTimestamp,
}

#[derive(Debug, Default)]
pub struct BranchHistoryManager {
    certificates: RwLock<HashMap<BranchId, BranchBirthCertificate>>,
}

impl BranchHistoryManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a branch. Recording the same certificate again is a no-op;
    /// conflicting certificates for one branch are a programmer error.
    pub fn record(&self, certificate: BranchBirthCertificate) {
        let mut certs = self
            .certificates
            .write()
            .expect("branch history lock poisoned");
        match certs.get(&certificate.branch) {
            Some(existing) => assert_eq!(
                existing, &certificate,
                "conflicting birth certificates for {:?}",
                certificate.branch
            ),
            None => {
                certs.insert(certificate.branch, certificate);
            }
        }
    }

    pub fn is_known(&self, branch: BranchId) -> bool {
        self.certificates
            .read()
            .expect("branch history lock poisoned")
            .contains_key(&branch)
    }

    pub fn get(&self, branch: BranchId) -> Option<BranchBirthCertificate> {
        self.certificates
            .read()
            .expect("branch history lock poisoned")
            .get(&branch)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vela_store::{Key, KeyRange, RightBound};

    fn certificate() -> BranchBirthCertificate {
        BranchBirthCertificate {
            branch: BranchId(4),
            origin: Region::new(
                0,
                u64::MAX,
                KeyRange::new(Key::min(), RightBound::Unbounded),
            ),
            initial_timestamp: StateTimestamp::new(100),
        }
    }

    #[test]
    fn recording_is_idempotent() {
        let manager = BranchHistoryManager::new();
        assert!(!manager.is_known(BranchId(4)));
        manager.record(certificate());
        manager.record(certificate());
        assert!(manager.is_known(BranchId(4)));
        assert_eq!(manager.get(BranchId(4)), Some(certificate()));
    }

    #[test]
    #[should_panic(expected = "conflicting birth certificates")]
    fn conflicting_records_panic() {
        let manager = BranchHistoryManager::new();
        manager.record(certificate());
        let mut other = certificate();
        other.initial_timestamp = StateTimestamp::new(101);
        manager.record(other);
    }
}
