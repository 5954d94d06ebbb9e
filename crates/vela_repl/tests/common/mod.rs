//! Shared harness for the bootstrap integration tests: a primary dispatcher
//! stub, a scripted backfill source, and a store wrapper that can hold
//! writes in flight.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;
use vela_repl::{
    AsyncWrite, BackfillProgress, Backfiller, Error, Intro, Mailbox, ReadRequest, SecondaryCard,
    SyncWrite,
};
use vela_store::{
    BackfillItem, BackfillPage, BranchId, Durability, Key, KeyRange, MemStore, OrderSource,
    Read, ReadResponse, ReadToken, Region, RegionMap, RightBound, ServerId, StateTimestamp,
    Store, Version, Write, WriteResponse, WriteToken,
};

pub const TEST_TIMEOUT: Duration = Duration::from_secs(20);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub async fn within<T>(future: impl std::future::Future<Output = T>) -> T {
    tokio::time::timeout(TEST_TIMEOUT, future)
        .await
        .expect("test step timed out")
}

pub fn region(left: &str, right: &str) -> Region {
    Region::new(
        0,
        u64::MAX,
        KeyRange::new(Key::from(left), RightBound::Key(Key::from(right))),
    )
}

pub fn range(left: &str, right: &str) -> KeyRange {
    KeyRange::new(Key::from(left), RightBound::Key(Key::from(right)))
}

/// Assert that every sub-range of `store` sits at `{branch, timestamp}`.
pub fn assert_uniform_version(store: &MemStore, branch: BranchId, timestamp: StateTimestamp) {
    let expect = Version::new(branch, timestamp);
    for (sub_range, version) in store.metainfo_snapshot().runs() {
        assert_eq!(
            version, &expect,
            "sub-range {sub_range:?} not at the synchronized version"
        );
    }
}

/// Primary dispatcher stub: accepts one registration, hands out the intro,
/// and streams timestamped writes.
pub struct Primary {
    card: SecondaryCard,
    ready: Mailbox<ServerId>,
    order: OrderSource,
    next_timestamp: StateTimestamp,
}

impl Primary {
    /// Accept the next registration and introduce the secondary at `begin`.
    pub async fn accept(registrar: &mut Mailbox<SecondaryCard>, begin: StateTimestamp) -> Self {
        let card = within(registrar.recv()).await.expect("registration card");
        let ready = Mailbox::new();
        card.intro.send(Intro {
            streaming_begin_timestamp: begin,
            ready: ready.address(),
        });
        Self {
            card,
            ready,
            order: OrderSource::new(),
            next_timestamp: begin,
        }
    }

    /// Stream one async write at the next timestamp. The returned receiver
    /// fires when the secondary acks it.
    pub fn send_async(&mut self, write: Write) -> oneshot::Receiver<()> {
        self.next_timestamp = self.next_timestamp.succ();
        let (tx, rx) = oneshot::channel();
        self.card.async_writes.send(AsyncWrite {
            write,
            timestamp: self.next_timestamp,
            order_token: self.order.check_in(),
            ack: tx,
        });
        rx
    }

    pub fn last_timestamp(&self) -> StateTimestamp {
        self.next_timestamp
    }

    /// Issue a sync write at the next timestamp and wait for its response.
    pub async fn sync_write(
        &mut self,
        write: Write,
        durability: Durability,
    ) -> Result<WriteResponse, Error> {
        self.next_timestamp = self.next_timestamp.succ();
        let (tx, rx) = oneshot::channel();
        self.card.sync_writes.send(SyncWrite {
            write,
            timestamp: self.next_timestamp,
            order_token: self.order.check_in(),
            durability,
            ack: tx,
        });
        within(rx).await.expect("sync write ack dropped")
    }

    /// Issue a sync write at an explicit timestamp without advancing the
    /// stream position. Used to probe rejection paths.
    pub async fn sync_write_at(
        &self,
        timestamp: StateTimestamp,
        write: Write,
    ) -> Result<WriteResponse, Error> {
        let (tx, rx) = oneshot::channel();
        self.card.sync_writes.send(SyncWrite {
            write,
            timestamp,
            order_token: self.order.check_in(),
            durability: Durability::Soft,
            ack: tx,
        });
        within(rx).await.expect("sync write ack dropped")
    }

    pub async fn read(
        &self,
        key: &str,
        min_timestamp: StateTimestamp,
    ) -> Result<ReadResponse, Error> {
        let (tx, rx) = oneshot::channel();
        self.card.reads.send(ReadRequest {
            read: Read::key(key),
            min_timestamp,
            ack: tx,
        });
        within(rx).await.expect("read ack dropped")
    }

    pub async fn await_ready(&mut self) -> ServerId {
        within(self.ready.recv()).await.expect("ready signal")
    }

    /// True when no further ready signal arrives within a grace period.
    pub async fn no_more_ready_signals(&mut self) -> bool {
        tokio::time::timeout(Duration::from_millis(200), self.ready.recv())
            .await
            .is_err()
    }
}

/// One backfill chunk a scripted pass will deliver.
pub struct ScriptedChunk {
    pub range: KeyRange,
    pub timestamp: StateTimestamp,
    pub items: Vec<(Key, Vec<u8>)>,
}

impl ScriptedChunk {
    pub fn new(range: KeyRange, timestamp: u64, items: &[(&str, &str)]) -> Self {
        Self {
            range,
            timestamp: StateTimestamp::new(timestamp),
            items: items
                .iter()
                .map(|(k, v)| (Key::from(*k), v.as_bytes().to_vec()))
                .collect(),
        }
    }
}

/// Backfill source that plays back pre-scripted passes, installing each
/// chunk into the target store before reporting it.
pub struct ScriptedBackfiller {
    target: Arc<dyn Store>,
    branch: BranchId,
    passes: Mutex<Vec<Vec<ScriptedChunk>>>,
    synchronize_calls: Mutex<Vec<StateTimestamp>>,
    synchronize_count: watch::Sender<usize>,
    synchronize_holds: Mutex<Vec<Option<oneshot::Receiver<()>>>>,
    chunks_delivered: AtomicUsize,
}

impl ScriptedBackfiller {
    pub fn new(target: Arc<dyn Store>, branch: BranchId, passes: Vec<Vec<ScriptedChunk>>) -> Arc<Self> {
        Arc::new(Self {
            target,
            branch,
            passes: Mutex::new(passes),
            synchronize_calls: Mutex::new(Vec::new()),
            synchronize_count: watch::channel(0).0,
            synchronize_holds: Mutex::new(Vec::new()),
            chunks_delivered: AtomicUsize::new(0),
        })
    }

    /// Park the n-th synchronize call (0-based) until the returned sender
    /// fires. Lets tests order dispatcher traffic against pass boundaries.
    pub fn hold_synchronize(&self, call: usize) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        let mut holds = self.synchronize_holds.lock().unwrap();
        if holds.len() <= call {
            holds.resize_with(call + 1, || None);
        }
        holds[call] = Some(rx);
        tx
    }

    /// Wait until `count` synchronize calls have started.
    pub async fn wait_synchronize_started(&self, count: usize) {
        let mut rx = self.synchronize_count.subscribe();
        rx.wait_for(|started| *started >= count)
            .await
            .expect("backfiller dropped");
    }

    pub fn synchronize_calls(&self) -> Vec<StateTimestamp> {
        self.synchronize_calls.lock().unwrap().clone()
    }

    pub fn chunks_delivered(&self) -> usize {
        self.chunks_delivered.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Backfiller for ScriptedBackfiller {
    async fn synchronize(
        &self,
        timestamp: StateTimestamp,
        cancel: &CancellationToken,
    ) -> vela_repl::Result<()> {
        let hold = {
            let mut calls = self.synchronize_calls.lock().unwrap();
            calls.push(timestamp);
            let index = calls.len() - 1;
            self.synchronize_count.send_replace(calls.len());
            self.synchronize_holds
                .lock()
                .unwrap()
                .get_mut(index)
                .and_then(Option::take)
        };
        if let Some(hold) = hold {
            tokio::select! {
                _ = hold => {}
                _ = cancel.cancelled() => return Err(Error::Cancelled),
            }
        }
        Ok(())
    }

    async fn go(
        &self,
        progress: &mut dyn BackfillProgress,
        from: Key,
        cancel: &CancellationToken,
    ) -> vela_repl::Result<()> {
        let chunks = {
            let mut passes = self.passes.lock().unwrap();
            assert!(!passes.is_empty(), "backfill pass requested beyond the script");
            passes.remove(0)
        };
        let target_region = self.target.region();
        let mut expected_left = from;
        for chunk in chunks {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            assert_eq!(
                chunk.range.left, expected_left,
                "scripted chunk does not abut the previous one"
            );
            let chunk_region = target_region.with_inner(chunk.range.clone());
            let versions = RegionMap::new(
                chunk_region,
                Version::new(self.branch, chunk.timestamp),
            );
            let page = BackfillPage {
                range: chunk.range.clone(),
                items: chunk
                    .items
                    .iter()
                    .map(|(key, value)| BackfillItem {
                        key: key.clone(),
                        value: value.clone(),
                    })
                    .collect(),
                versions: versions.clone(),
                done: chunk.range.right == target_region.inner.right,
            };
            let token = self.target.new_write_token();
            self.target
                .receive_backfill_page(&page, token)
                .await
                .map_err(Error::from_store)?;
            self.chunks_delivered.fetch_add(1, Ordering::SeqCst);

            if !progress.on_chunk(versions) {
                return Ok(());
            }
            match &chunk.range.right {
                RightBound::Key(next) => expected_left = next.clone(),
                RightBound::Unbounded => return Ok(()),
            }
        }
        Ok(())
    }
}

/// Store wrapper that can hold `write` calls at a gate and reports how many
/// are in flight.
pub struct GatedStore {
    inner: Arc<MemStore>,
    open: watch::Sender<bool>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl GatedStore {
    pub fn closed(inner: Arc<MemStore>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            open: watch::channel(false).0,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        })
    }

    pub fn open_gate(&self) {
        self.open.send_replace(true);
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Poll until at least `count` writes are blocked at the gate.
    pub async fn wait_in_flight(&self, count: usize) {
        loop {
            if self.in_flight() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl Store for GatedStore {
    fn region(&self) -> Region {
        self.inner.region()
    }

    async fn wait_until_ok_to_receive_backfill(
        &self,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        self.inner.wait_until_ok_to_receive_backfill(cancel).await
    }

    fn new_write_token(&self) -> WriteToken {
        self.inner.new_write_token()
    }

    fn new_read_token(&self) -> ReadToken {
        self.inner.new_read_token()
    }

    async fn get_metainfo(
        &self,
        token: ReadToken,
        region: &Region,
    ) -> anyhow::Result<RegionMap<Version>> {
        self.inner.get_metainfo(token, region).await
    }

    async fn set_metainfo(
        &self,
        metainfo: RegionMap<Version>,
        order: vela_store::OrderToken,
        token: WriteToken,
        durability: Durability,
    ) -> anyhow::Result<()> {
        self.inner.set_metainfo(metainfo, order, token, durability).await
    }

    async fn write(
        &self,
        metainfo: RegionMap<Version>,
        write: &Write,
        durability: Durability,
        timestamp: StateTimestamp,
        order: vela_store::OrderToken,
        token: WriteToken,
    ) -> anyhow::Result<WriteResponse> {
        let entered = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(entered, Ordering::SeqCst);
        let mut rx = self.open.subscribe();
        let waited = rx.wait_for(|open| *open).await.is_ok();
        let result = match waited {
            true => {
                self.inner
                    .write(metainfo, write, durability, timestamp, order, token)
                    .await
            }
            false => Err(anyhow::anyhow!("write gate dropped")),
        };
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn read(&self, read: &Read, token: ReadToken) -> anyhow::Result<ReadResponse> {
        self.inner.read(read, token).await
    }

    async fn backfill_page(&self, from: &Key, limit: usize) -> anyhow::Result<BackfillPage> {
        self.inner.backfill_page(from, limit).await
    }

    async fn receive_backfill_page(
        &self,
        page: &BackfillPage,
        token: WriteToken,
    ) -> anyhow::Result<()> {
        self.inner.receive_backfill_page(page, token).await
    }
}
