//! Fjall-backed store engine: a data partition for key/value/version rows and
//! a meta partition holding the run-encoded metainfo.

use std::sync::{Arc, RwLock};

use anyhow::Context;
use async_trait::async_trait;
use fjall::{Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::ops::{Durability, Mutation, Read, ReadResponse, Write, WriteResponse};
use crate::region::{Key, KeyRange, Region, RegionMap, RightBound};
use crate::store::{
    BackfillItem, BackfillPage, Cancelled, ReadToken, Store, TokenGate, WriteToken,
};
use crate::version::{BranchId, OrderToken, StateTimestamp, Version};

const METAINFO_KEY: &[u8] = b"metainfo";

/// On-disk single-range store over a fjall keyspace.
pub struct FjallStore {
    region: Region,
    keyspace: Arc<Keyspace>,
    data: PartitionHandle,
    meta: PartitionHandle,
    lock: RwLock<()>,
    gate: TokenGate,
    backfill_ok: watch::Sender<bool>,
}

impl FjallStore {
    /// Open (or create) the store partitions inside `keyspace`.
    pub fn open(keyspace: Arc<Keyspace>, region: Region) -> anyhow::Result<Self> {
        let data = keyspace.open_partition("kv_data", PartitionCreateOptions::default())?;
        let meta = keyspace.open_partition("kv_meta", PartitionCreateOptions::default())?;

        match meta.get(METAINFO_KEY)? {
            Some(blob) => {
                let stored: RegionMap<Version> =
                    serde_json::from_slice(&blob).context("corrupt metainfo blob")?;
                anyhow::ensure!(
                    stored.domain() == &region,
                    "store region changed since the keyspace was created"
                );
            }
            None => {
                tracing::debug!(region = ?region.inner, "initializing fresh store metainfo");
                let fresh = RegionMap::new(region.clone(), Version::zero());
                meta.insert(METAINFO_KEY, serde_json::to_vec(&fresh)?)?;
            }
        }

        Ok(Self {
            region,
            keyspace,
            data,
            meta,
            lock: RwLock::new(()),
            gate: TokenGate::new(),
            backfill_ok: watch::channel(true).0,
        })
    }

    /// Open a keyspace at `path` and the store partitions inside it.
    pub fn open_path(path: &std::path::Path, region: Region) -> anyhow::Result<Self> {
        let keyspace = Arc::new(fjall::Config::new(path).open()?);
        Self::open(keyspace, region)
    }

    /// Gate or ungate backfill reception.
    pub fn set_ok_to_receive_backfill(&self, ok: bool) {
        self.backfill_ok.send_replace(ok);
    }

    fn load_metainfo(&self) -> anyhow::Result<RegionMap<Version>> {
        let blob = self
            .meta
            .get(METAINFO_KEY)?
            .context("metainfo blob missing")?;
        serde_json::from_slice(&blob).context("corrupt metainfo blob")
    }

    fn store_metainfo(
        &self,
        batch: &mut fjall::Batch,
        metainfo: &RegionMap<Version>,
    ) -> anyhow::Result<()> {
        batch.insert(&self.meta, METAINFO_KEY, serde_json::to_vec(metainfo)?);
        Ok(())
    }

    fn maybe_persist(&self, durability: Durability) -> anyhow::Result<()> {
        if durability == Durability::Hard {
            self.keyspace.persist(PersistMode::SyncAll)?;
        }
        Ok(())
    }
}

#[async_trait]
impl Store for FjallStore {
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
        let _guard = self.lock.read().expect("store lock poisoned");
        Ok(self.load_metainfo()?.mask(region))
    }

    async fn set_metainfo(
        &self,
        metainfo: RegionMap<Version>,
        _order: OrderToken,
        token: WriteToken,
        durability: Durability,
    ) -> anyhow::Result<()> {
        self.gate.enter(token.seq).await?;
        let result = (|| {
            let _guard = self.lock.write().expect("store lock poisoned");
            let mut current = self.load_metainfo()?;
            current.update_map(&metainfo);
            let mut batch = self.keyspace.batch();
            self.store_metainfo(&mut batch, &current)?;
            batch.commit()?;
            self.maybe_persist(durability)
        })();
        self.gate.exit(token.seq);
        result
    }

    async fn write(
        &self,
        metainfo: RegionMap<Version>,
        write: &Write,
        durability: Durability,
        _timestamp: StateTimestamp,
        _order: OrderToken,
        token: WriteToken,
    ) -> anyhow::Result<WriteResponse> {
        self.gate.enter(token.seq).await?;
        let result = (|| {
            let _guard = self.lock.write().expect("store lock poisoned");
            let mut current = self.load_metainfo()?;
            let mut batch = self.keyspace.batch();
            let mut ops_applied = 0;
            for op in &write.ops {
                let version = *metainfo
                    .get(&op.key)
                    .context("write op outside its metainfo domain")?;
                match &op.mutation {
                    Mutation::Put(value) => {
                        batch.insert(&self.data, op.key.as_bytes(), encode_row(version, value));
                    }
                    Mutation::Delete => {
                        batch.remove(&self.data, op.key.as_bytes());
                    }
                }
                ops_applied += 1;
            }
            current.update_map(&metainfo);
            self.store_metainfo(&mut batch, &current)?;
            batch.commit()?;
            self.maybe_persist(durability)?;
            Ok(WriteResponse { ops_applied })
        })();
        self.gate.exit(token.seq);
        result
    }

    async fn read(&self, read: &Read, token: ReadToken) -> anyhow::Result<ReadResponse> {
        self.gate.read_barrier(token.seq).await?;
        let _guard = self.lock.read().expect("store lock poisoned");
        match self.data.get(read.key.as_bytes())? {
            Some(row) => {
                let (version, value) = decode_row(&row)?;
                Ok(ReadResponse {
                    value: Some(value),
                    version: Some(version),
                })
            }
            None => Ok(ReadResponse {
                value: None,
                version: None,
            }),
        }
    }

    async fn backfill_page(&self, from: &Key, limit: usize) -> anyhow::Result<BackfillPage> {
        anyhow::ensure!(limit > 0, "backfill page limit must be positive");
        let _guard = self.lock.read().expect("store lock poisoned");
        let start = from.clone().max(self.region.inner.left.clone());

        let mut items = Vec::with_capacity(limit);
        let mut overflow: Option<Key> = None;
        for entry in self.data.range(start.as_bytes().to_vec()..) {
            let (raw_key, raw_value) = entry?;
            let key = Key::new(raw_key.to_vec());
            if !self.region.contains_key(&key) {
                break;
            }
            if items.len() == limit {
                overflow = Some(key);
                break;
            }
            let (_, value) = decode_row(&raw_value)?;
            items.push(BackfillItem { key, value });
        }

        let (right, done) = match overflow {
            Some(next) => (RightBound::Key(next), false),
            None => (self.region.inner.right.clone(), true),
        };
        let range = KeyRange::new(start, right);
        let versions = self
            .load_metainfo()?
            .mask(&self.region.with_inner(range.clone()));
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
        let result = (|| {
            let _guard = self.lock.write().expect("store lock poisoned");
            let mut current = self.load_metainfo()?;
            let mut batch = self.keyspace.batch();
            for item in &page.items {
                let version = *page
                    .versions
                    .get(&item.key)
                    .context("backfill item without a captured version")?;
                batch.insert(&self.data, item.key.as_bytes(), encode_row(version, &item.value));
            }
            current.update_map(&page.versions);
            self.store_metainfo(&mut batch, &current)?;
            batch.commit()?;
            Ok(())
        })();
        self.gate.exit(token.seq);
        result
    }
}

/// Encode one data row as branch, timestamp, then the value bytes.
fn encode_row(version: Version, value: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + 8 + value.len());
    out.extend_from_slice(&version.branch.0.to_be_bytes());
    out.extend_from_slice(&version.timestamp.get().to_be_bytes());
    out.extend_from_slice(value);
    out
}

fn decode_row(data: &[u8]) -> anyhow::Result<(Version, Vec<u8>)> {
    anyhow::ensure!(data.len() >= 16, "short data row");
    let mut branch = [0u8; 8];
    branch.copy_from_slice(&data[..8]);
    let mut ts = [0u8; 8];
    ts.copy_from_slice(&data[8..16]);
    Ok((
        Version::new(
            BranchId(u64::from_be_bytes(branch)),
            StateTimestamp::new(u64::from_be_bytes(ts)),
        ),
        data[16..].to_vec(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_region() -> Region {
        Region::new(
            0,
            u64::MAX,
            KeyRange::new(Key::from("a"), RightBound::Key(Key::from("z"))),
        )
    }

    fn version(ts: u64) -> Version {
        Version::new(BranchId(3), StateTimestamp::new(ts))
    }

    #[tokio::test]
    async fn write_then_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let keyspace = Arc::new(fjall::Config::new(dir.path()).open().unwrap());
        let store = FjallStore::open(keyspace, test_region()).unwrap();

        let token = store.new_write_token();
        store
            .write(
                RegionMap::new(test_region(), version(1)),
                &Write::put("k", b"v".to_vec()),
                Durability::Hard,
                StateTimestamp::new(1),
                OrderToken::new(0),
                token,
            )
            .await
            .unwrap();

        let read = store
            .read(&Read::key("k"), store.new_read_token())
            .await
            .unwrap();
        assert_eq!(read.value, Some(b"v".to_vec()));
        assert_eq!(read.version, Some(version(1)));
    }

    #[tokio::test]
    async fn metainfo_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let keyspace = Arc::new(fjall::Config::new(dir.path()).open().unwrap());
            let store = FjallStore::open(keyspace, test_region()).unwrap();
            let token = store.new_write_token();
            store
                .set_metainfo(
                    RegionMap::new(test_region(), version(4)),
                    OrderToken::new(0),
                    token,
                    Durability::Hard,
                )
                .await
                .unwrap();
        }

        let keyspace = Arc::new(fjall::Config::new(dir.path()).open().unwrap());
        let store = FjallStore::open(keyspace, test_region()).unwrap();
        let metainfo = store
            .get_metainfo(store.new_read_token(), &test_region())
            .await
            .unwrap();
        assert_eq!(metainfo.get(&Key::from("m")), Some(&version(4)));
    }

    #[tokio::test]
    async fn backfill_page_roundtrip_between_disk_stores() {
        let dir = tempfile::tempdir().unwrap();
        let keyspace = Arc::new(fjall::Config::new(dir.path()).open().unwrap());
        let source = FjallStore::open(keyspace, test_region()).unwrap();
        let token = source.new_write_token();
        source
            .write(
                RegionMap::new(test_region(), version(2)),
                &Write::put("g", b"gv".to_vec()),
                Durability::Soft,
                StateTimestamp::new(2),
                OrderToken::new(0),
                token,
            )
            .await
            .unwrap();

        let page = source.backfill_page(&Key::from("a"), 16).await.unwrap();
        assert!(page.done);

        let dir2 = tempfile::tempdir().unwrap();
        let keyspace2 = Arc::new(fjall::Config::new(dir2.path()).open().unwrap());
        let target = FjallStore::open(keyspace2, test_region()).unwrap();
        let token = target.new_write_token();
        target.receive_backfill_page(&page, token).await.unwrap();

        let read = target
            .read(&Read::key("g"), target.new_read_token())
            .await
            .unwrap();
        assert_eq!(read.value, Some(b"gv".to_vec()));
    }
}
