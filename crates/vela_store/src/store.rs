//! The `Store` seam consumed by the replication engine.
//!
//! Stores sequence writes through FIFO write tokens: tokens are issued in
//! ascending order and an operation carrying token `n` may only touch the
//! store once every operation with a smaller token has finished. That lets
//! callers pin a global apply order while the applies themselves run
//! concurrently.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::ops::{Durability, Read, ReadResponse, Write, WriteResponse};
use crate::region::{Key, KeyRange, Region};
use crate::version::{OrderToken, StateTimestamp, Version};
use crate::RegionMap;

/// Marker error distinguishing a fired cancellation signal from genuine store
/// failures. Callers downcast with `err.is::<Cancelled>()`.
#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("cancelled")]
pub struct Cancelled;

/// FIFO write token. Every issued token must be spent on exactly one store
/// operation or later tokens will never get their turn.
#[derive(Debug)]
pub struct WriteToken {
    pub seq: u64,
}

#[derive(Debug)]
pub struct ReadToken {
    pub seq: u64,
}

/// One key/value pair of a backfill transfer.
#[derive(Clone, Debug)]
pub struct BackfillItem {
    pub key: Key,
    pub value: Vec<u8>,
}

/// One contiguous page of a backfill transfer: the data for `range` plus the
/// version each sub-range of it was captured at. `done` marks the last page
/// of the sender's region.
#[derive(Clone, Debug)]
pub struct BackfillPage {
    pub range: KeyRange,
    pub items: Vec<BackfillItem>,
    pub versions: RegionMap<Version>,
    pub done: bool,
}

/// Single-range storage engine.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// The key region this store is responsible for.
    fn region(&self) -> Region;

    /// Blocks while the store is not in a state to accept backfill data, for
    /// example while it rebuilds a secondary index.
    async fn wait_until_ok_to_receive_backfill(
        &self,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()>;

    fn new_write_token(&self) -> WriteToken;

    fn new_read_token(&self) -> ReadToken;

    /// Version annotations for `region`, which must lie inside the store's
    /// region.
    async fn get_metainfo(
        &self,
        token: ReadToken,
        region: &Region,
    ) -> anyhow::Result<RegionMap<Version>>;

    /// Replace the version annotations on `metainfo`'s domain without
    /// touching data.
    async fn set_metainfo(
        &self,
        metainfo: RegionMap<Version>,
        order: OrderToken,
        token: WriteToken,
        durability: Durability,
    ) -> anyhow::Result<()>;

    /// Apply `write` and stamp `metainfo`'s domain with its values in one
    /// step.
    async fn write(
        &self,
        metainfo: RegionMap<Version>,
        write: &Write,
        durability: Durability,
        timestamp: StateTimestamp,
        order: OrderToken,
        token: WriteToken,
    ) -> anyhow::Result<WriteResponse>;

    async fn read(&self, read: &Read, token: ReadToken) -> anyhow::Result<ReadResponse>;

    /// Produce the next backfill page at or after `from`, holding at most
    /// `limit` items. The page range always abuts the previous page.
    async fn backfill_page(&self, from: &Key, limit: usize) -> anyhow::Result<BackfillPage>;

    /// Install a backfill page received from a peer, data and metainfo
    /// together.
    async fn receive_backfill_page(
        &self,
        page: &BackfillPage,
        token: WriteToken,
    ) -> anyhow::Result<()>;
}

/// FIFO turnstile backing write-token issue and redemption.
#[derive(Debug)]
pub struct TokenGate {
    issued: AtomicU64,
    applied: watch::Sender<u64>,
}

impl TokenGate {
    pub fn new() -> Self {
        Self {
            issued: AtomicU64::new(0),
            applied: watch::channel(0).0,
        }
    }

    /// Issue the next token sequence number.
    pub fn issue(&self) -> u64 {
        self.issued.fetch_add(1, Ordering::SeqCst)
    }

    /// Number of tokens issued so far. A read token minted at this point
    /// must wait for all of them through `read_barrier`.
    pub fn issued_count(&self) -> u64 {
        self.issued.load(Ordering::SeqCst)
    }

    /// Wait until every write token issued before `upto` has been redeemed.
    /// Reads use this to observe all writes admitted before them without
    /// blocking later writes.
    pub async fn read_barrier(&self, upto: u64) -> anyhow::Result<()> {
        let mut rx = self.applied.subscribe();
        rx.wait_for(|applied| *applied >= upto)
            .await
            .map(|_| ())
            .map_err(|_| anyhow::anyhow!("write token gate closed"))
    }

    /// Wait until every operation with a smaller sequence number has passed
    /// through `exit`.
    pub async fn enter(&self, seq: u64) -> anyhow::Result<()> {
        let mut rx = self.applied.subscribe();
        rx.wait_for(|applied| *applied >= seq)
            .await
            .map(|_| ())
            .map_err(|_| anyhow::anyhow!("write token gate closed"))
    }

    /// Mark the operation holding `seq` finished and admit the next one.
    pub fn exit(&self, seq: u64) {
        self.applied.send_modify(|applied| {
            debug_assert_eq!(*applied, seq, "write tokens redeemed out of order");
            *applied = seq + 1;
        });
    }
}

impl Default for TokenGate {
    fn default() -> Self {
        Self::new()
    }
}
