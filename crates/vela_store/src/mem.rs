//! In-memory store engine used by tests and single-process deployments.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::ops::{Durability, Mutation, Read, ReadResponse, Write, WriteResponse};
use crate::region::{Key, Region, RegionMap, RightBound};
use crate::store::{
    BackfillItem, BackfillPage, Cancelled, ReadToken, Store, TokenGate, WriteToken,
};
use crate::version::{OrderToken, StateTimestamp, Version};

/// Counters exposed for assertions on store traffic.
#[derive(Clone, Copy, Debug, Default)]
pub struct MemStoreStats {
    pub writes: u64,
    pub metainfo_sets: u64,
    pub backfill_pages_received: u64,
}

#[derive(Clone, Debug)]
struct StoredValue {
    value: Vec<u8>,
    version: Version,
}

struct MemState {
    data: BTreeMap<Key, StoredValue>,
    metainfo: RegionMap<Version>,
}

/// In-memory single-range store with per-key versions and run-encoded
/// metainfo.
pub struct MemStore {
    region: Region,
    state: Mutex<MemState>,
    gate: TokenGate,
    backfill_ok: watch::Sender<bool>,
    writes: AtomicU64,
    metainfo_sets: AtomicU64,
    backfill_pages_received: AtomicU64,
}

impl MemStore {
    pub fn new(region: Region) -> Self {
        let metainfo = RegionMap::new(region.clone(), Version::zero());
        Self {
            region,
            state: Mutex::new(MemState {
                data: BTreeMap::new(),
                metainfo,
            }),
            gate: TokenGate::new(),
            backfill_ok: watch::channel(true).0,
            writes: AtomicU64::new(0),
            metainfo_sets: AtomicU64::new(0),
            backfill_pages_received: AtomicU64::new(0),
        }
    }

    /// Gate or ungate backfill reception, e.g. to model an index rebuild.
    pub fn set_ok_to_receive_backfill(&self, ok: bool) {
        self.backfill_ok.send_replace(ok);
    }

    /// Install a value directly, bypassing token order. Test setup only.
    pub fn seed(&self, key: impl Into<Key>, value: impl Into<Vec<u8>>, version: Version) {
        let mut st = self.state.lock().expect("store state lock poisoned");
        st.data.insert(
            key.into(),
            StoredValue {
                value: value.into(),
                version,
            },
        );
    }

    /// Stamp a sub-region's metainfo directly. Test setup only.
    pub fn seed_metainfo(&self, region: &Region, version: Version) {
        let mut st = self.state.lock().expect("store state lock poisoned");
        st.metainfo.update(region, version);
    }

    pub fn metainfo_snapshot(&self) -> RegionMap<Version> {
        self.state
            .lock()
            .expect("store state lock poisoned")
            .metainfo
            .clone()
    }

    pub fn value_of(&self, key: &Key) -> Option<(Vec<u8>, Version)> {
        let st = self.state.lock().expect("store state lock poisoned");
        st.data.get(key).map(|v| (v.value.clone(), v.version))
    }

    pub fn stats(&self) -> MemStoreStats {
        MemStoreStats {
            writes: self.writes.load(Ordering::Relaxed),
            metainfo_sets: self.metainfo_sets.load(Ordering::Relaxed),
            backfill_pages_received: self.backfill_pages_received.load(Ordering::Relaxed),
        }
    }

    fn apply_ops(st: &mut MemState, write: &Write, metainfo: &RegionMap<Version>) -> usize {
        let mut applied = 0;
        for op in &write.ops {
            let version = *metainfo
                .get(&op.key)
                .expect("write op outside its metainfo domain");
            match &op.mutation {
                Mutation::Put(value) => {
                    st.data.insert(
                        op.key.clone(),
                        StoredValue {
                            value: value.clone(),
                            version,
                        },
                    );
                }
                Mutation::Delete => {
                    st.data.remove(&op.key);
                }
            }
            applied += 1;
        }
        applied
    }

    /// Stamping timestamp T over a sub-range requires that sub-range to sit
    /// at T's predecessor on the same branch. Catches double-applied writes.
    #[cfg(debug_assertions)]
    fn check_metainfo_preconditions(
        st: &MemState,
        metainfo: &RegionMap<Version>,
        timestamp: StateTimestamp,
    ) {
        let Some((_, incoming)) = metainfo.runs().next() else {
            return;
        };
        for (range, current) in st.metainfo.mask(metainfo.domain()).runs() {
            if current.branch == incoming.branch {
                debug_assert_eq!(
                    current.timestamp,
                    timestamp.pred(),
                    "write at {timestamp} over {range:?} expected predecessor metainfo"
                );
            }
        }
    }
}

#[async_trait]
impl Store for MemStore {
    fn region(&self) -> Region {
        self.region.clone()
    }

    async fn wait_until_ok_to_receive_backfill(
        &self,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        let mut rx = self.backfill_ok.subscribe();
        tokio::select! {
            result = rx.wait_for(|ok| *ok) => result
                .map(|_| ())
                .map_err(|_| anyhow::anyhow!("backfill readiness channel closed")),
            _ = cancel.cancelled() => Err(anyhow::Error::new(Cancelled)),
        }
    }

    fn new_write_token(&self) -> WriteToken {
        WriteToken {
            seq: self.gate.issue(),
        }
    }

    // Read tokens snapshot the write-token sequence so a read observes every
    // write admitted before it.
    fn new_read_token(&self) -> ReadToken {
        ReadToken {
            seq: self.gate.issued_count(),
        }
    }

    async fn get_metainfo(
        &self,
        token: ReadToken,
        region: &Region,
    ) -> anyhow::Result<RegionMap<Version>> {
        self.gate.read_barrier(token.seq).await?;
        let st = self.state.lock().expect("store state lock poisoned");
        Ok(st.metainfo.mask(region))
    }

    async fn set_metainfo(
        &self,
        metainfo: RegionMap<Version>,
        _order: OrderToken,
        token: WriteToken,
        _durability: Durability,
    ) -> anyhow::Result<()> {
        self.gate.enter(token.seq).await?;
        {
            let mut st = self.state.lock().expect("store state lock poisoned");
            st.metainfo.update_map(&metainfo);
        }
        self.metainfo_sets.fetch_add(1, Ordering::Relaxed);
        self.gate.exit(token.seq);
        Ok(())
    }

    async fn write(
        &self,
        metainfo: RegionMap<Version>,
        write: &Write,
        _durability: Durability,
        timestamp: StateTimestamp,
        _order: OrderToken,
        token: WriteToken,
    ) -> anyhow::Result<WriteResponse> {
        self.gate.enter(token.seq).await?;
        let ops_applied = {
            let mut st = self.state.lock().expect("store state lock poisoned");
            #[cfg(debug_assertions)]
            Self::check_metainfo_preconditions(&st, &metainfo, timestamp);
            #[cfg(not(debug_assertions))]
            let _ = timestamp;
            let applied = Self::apply_ops(&mut st, write, &metainfo);
            st.metainfo.update_map(&metainfo);
            applied
        };
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.gate.exit(token.seq);
        Ok(WriteResponse { ops_applied })
    }

    async fn read(&self, read: &Read, token: ReadToken) -> anyhow::Result<ReadResponse> {
        self.gate.read_barrier(token.seq).await?;
        let st = self.state.lock().expect("store state lock poisoned");
        let found = st.data.get(&read.key);
        Ok(ReadResponse {
            value: found.map(|v| v.value.clone()),
            version: found.map(|v| v.version),
        })
    }

    async fn backfill_page(&self, from: &Key, limit: usize) -> anyhow::Result<BackfillPage> {
        anyhow::ensure!(limit > 0, "backfill page limit must be positive");
        let st = self.state.lock().expect("store state lock poisoned");
        let start = from.clone().max(self.region.inner.left.clone());

        let mut items = Vec::with_capacity(limit);
        let mut overflow: Option<Key> = None;
        for (key, stored) in st.data.range(start.clone()..) {
            if !self.region.contains_key(key) {
                break;
            }
            if items.len() == limit {
                overflow = Some(key.clone());
                break;
            }
            items.push(BackfillItem {
                key: key.clone(),
                value: stored.value.clone(),
            });
        }

        let (right, done) = match overflow {
            Some(next) => (RightBound::Key(next), false),
            None => (self.region.inner.right.clone(), true),
        };
        let range = crate::region::KeyRange::new(start, right);
        let versions = st.metainfo.mask(&self.region.with_inner(range.clone()));
        Ok(BackfillPage {
            range,
            items,
            versions,
            done,
        })
    }

    async fn receive_backfill_page(
        &self,
        page: &BackfillPage,
        token: WriteToken,
    ) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.region
                .contains_region(&self.region.with_inner(page.range.clone())),
            "backfill page outside the store region"
        );
        self.gate.enter(token.seq).await?;
        {
            let mut st = self.state.lock().expect("store state lock poisoned");
            for item in &page.items {
                let version = *page
                    .versions
                    .get(&item.key)
                    .expect("backfill item without a captured version");
                st.data.insert(
                    item.key.clone(),
                    StoredValue {
                        value: item.value.clone(),
                        version,
                    },
                );
            }
            st.metainfo.update_map(&page.versions);
        }
        self.backfill_pages_received.fetch_add(1, Ordering::Relaxed);
        self.gate.exit(token.seq);
        Ok(())
    }
}
