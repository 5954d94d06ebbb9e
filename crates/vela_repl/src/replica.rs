//! Post-bootstrap write and read execution for a synchronized replica.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use vela_store::{
    Durability, OrderToken, Read, ReadResponse, Region, RegionMap, StateTimestamp, Store, Version,
    Write, WriteResponse,
};

use crate::branch_history::BranchHistoryManager;
use crate::error::{Error, Result};
use crate::timestamp_enforcer::TimestampEnforcer;
use vela_store::BranchId;

/// Executes ordered writes against the whole region of a synchronized store
/// and serves reads gated on a minimum timestamp.
pub struct Replica {
    store: Arc<dyn Store>,
    branch: BranchId,
    region: Region,
    enforcer: TimestampEnforcer,
}

impl Replica {
    /// `first_timestamp` is the watermark the store was synchronized at;
    /// every write at or below it is already reflected on disk.
    pub fn new(
        store: Arc<dyn Store>,
        branch_history: &BranchHistoryManager,
        branch: BranchId,
        first_timestamp: StateTimestamp,
    ) -> Self {
        assert!(
            branch_history.is_known(branch),
            "replica created for an unrecorded branch {branch:?}"
        );
        let region = store.region();
        Self {
            store,
            branch,
            region,
            enforcer: TimestampEnforcer::new(first_timestamp),
        }
    }

    /// Apply one write in timestamp order, stamping the whole region.
    pub async fn do_write(
        &self,
        write: &Write,
        timestamp: StateTimestamp,
        order: OrderToken,
        durability: Durability,
        cancel: &CancellationToken,
    ) -> Result<WriteResponse> {
        self.enforcer.wait_all_before(timestamp.pred(), cancel).await?;
        // Token issue order pins the store apply order to admission order.
        let token = self.store.new_write_token();
        self.enforcer.complete(timestamp);

        let metainfo = RegionMap::new(self.region.clone(), Version::new(self.branch, timestamp));
        self.store
            .write(metainfo, write, durability, timestamp, order, token)
            .await
            .map_err(Error::from_store)
    }

    /// Serve a read once every write up to `min_timestamp` has been applied.
    pub async fn do_read(
        &self,
        read: &Read,
        min_timestamp: StateTimestamp,
        cancel: &CancellationToken,
    ) -> Result<ReadResponse> {
        self.enforcer.wait_all_before(min_timestamp, cancel).await?;
        let token = self.store.new_read_token();
        self.store.read(read, token).await.map_err(Error::from_store)
    }
}
