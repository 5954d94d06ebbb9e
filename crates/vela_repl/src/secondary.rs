//! The secondary-replica bootstrap and streaming engine.
//!
//! A `SecondaryReplicaClient` signs up for the primary's write stream and
//! simultaneously backfills historical state from a peer. During bootstrap
//! the replica's region is partitioned into three adjacent sub-regions:
//! writes are applied directly in `streaming`, parked on a bridging queue in
//! `queueing`, and dropped in `discarding`. Each backfill pass turns the
//! discarding region into the queueing region, pulls chunks until the queue
//! fills, drains the queue with the stream clipped against the capture
//! timestamps, and promotes the drained region into `streaming`. Once
//! `streaming` covers everything, a `Replica` takes over and the primary is
//! told the secondary is ready.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, OnceLock};

use tokio::sync::{
    oneshot, watch, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock, Semaphore,
};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vela_store::{
    BranchId, Durability, Key, KeyRange, OrderCheckpoint, OrderToken, Region, RegionMap,
    RightBound, ServerId, StateTimestamp, Store, Version, Write, WriteToken,
};

use crate::backfill::{BackfillEndTimestamps, BackfillProgress, Backfiller};
use crate::branch_history::{BranchBirthCertificate, BranchHistoryManager};
use crate::config::BackfillConfig;
use crate::error::{Error, Result};
use crate::mailbox::{Address, Mailbox};
use crate::protocol::{AsyncWrite, Intro, ReadRequest, SecondaryCard, SyncWrite};
use crate::replica::Replica;
use crate::timestamp_enforcer::TimestampEnforcer;

/// Ceiling on concurrently in-flight store applies while draining the
/// bridging queue.
const MAX_CONCURRENT_STREAM_QUEUE_ITEMS: usize = 16;

/// One write parked on the bridging queue. `has_write` is false when the
/// write had no effect on the queueing region; the entry still has to
/// advance the metainfo there.
struct QueueEntry {
    has_write: bool,
    write: Write,
    timestamp: StateTimestamp,
    order_token: OrderToken,
}

type SharedQueue = Arc<Mutex<VecDeque<QueueEntry>>>;

enum SinkMode {
    /// Pushes are acked immediately.
    Open,
    /// Pushes park their ack; the drainer trickles them out slower than it
    /// drains so the queue must shrink.
    Throttling {
        pending_acks: VecDeque<oneshot::Sender<()>>,
        acks_to_release: f64,
    },
}

/// Intake-facing end of the bridging queue for one backfill pass.
struct QueueSink {
    queue: SharedQueue,
    mode: Mutex<SinkMode>,
}

impl QueueSink {
    fn new(queue: SharedQueue) -> Arc<Self> {
        Arc::new(Self {
            queue,
            mode: Mutex::new(SinkMode::Open),
        })
    }

    /// Park `entry` and hand back the throttler its ack must wait on.
    fn push(&self, entry: QueueEntry) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.queue
            .lock()
            .expect("queue lock poisoned")
            .push_back(entry);
        let mut mode = self.mode.lock().expect("sink mode lock poisoned");
        match &mut *mode {
            SinkMode::Open => {
                let _ = tx.send(());
            }
            SinkMode::Throttling {
                pending_acks,
                acks_to_release,
            } => {
                if *acks_to_release >= 1.0 {
                    *acks_to_release -= 1.0;
                    let _ = tx.send(());
                } else {
                    pending_acks.push_back(tx);
                }
            }
        }
        rx
    }

    /// Stop acking pushes immediately.
    fn begin_throttling(&self) {
        *self.mode.lock().expect("sink mode lock poisoned") = SinkMode::Throttling {
            pending_acks: VecDeque::new(),
            acks_to_release: 0.0,
        };
    }

    /// One queue entry finished draining; release a fraction of an ack.
    fn finished_one_entry(&self, trickle: f64) {
        let mut mode = self.mode.lock().expect("sink mode lock poisoned");
        if let SinkMode::Throttling {
            pending_acks,
            acks_to_release,
        } = &mut *mode
        {
            *acks_to_release += trickle;
            if *acks_to_release >= 1.0 {
                if let Some(ack) = pending_acks.pop_front() {
                    *acks_to_release -= 1.0;
                    let _ = ack.send(());
                }
            }
        }
    }

    /// Release every parked ack. Called once the queue has fully drained.
    fn release_all(&self) {
        let mut mode = self.mode.lock().expect("sink mode lock poisoned");
        if let SinkMode::Throttling { pending_acks, .. } = &mut *mode {
            while let Some(ack) = pending_acks.pop_front() {
                let _ = ack.send(());
            }
        }
    }
}

/// The triad of adjacent sub-regions partitioning the replica's region
/// during bootstrap, plus everything the write intake snapshots under the
/// boundary lock.
struct TriadState {
    streaming: Region,
    queueing: Region,
    discarding: Region,
    sink: Option<Arc<QueueSink>>,
    replica: Option<Arc<Replica>>,
}

struct Shared {
    config: BackfillConfig,
    store: Arc<dyn Store>,
    branch: BranchId,
    /// Set once the intro from the primary arrives.
    enforcer: OnceLock<Arc<TimestampEnforcer>>,
    registered: watch::Sender<bool>,
    triad: Arc<RwLock<TriadState>>,
    /// Verifies queued entries carry a non-decreasing order-token sequence.
    queue_order_checkpoint: Mutex<OrderCheckpoint>,
}

impl Shared {
    fn enforcer(&self) -> &Arc<TimestampEnforcer> {
        self.enforcer
            .get()
            .expect("timestamp enforcer accessed before registration")
    }
}

async fn write_guard(
    triad: &Arc<RwLock<TriadState>>,
    cancel: &CancellationToken,
) -> Result<OwnedRwLockWriteGuard<TriadState>> {
    tokio::select! {
        guard = triad.clone().write_owned() => Ok(guard),
        _ = cancel.cancelled() => Err(Error::Cancelled),
    }
}

async fn read_guard(
    triad: &Arc<RwLock<TriadState>>,
    cancel: &CancellationToken,
) -> Result<OwnedRwLockReadGuard<TriadState>> {
    tokio::select! {
        guard = triad.clone().read_owned() => Ok(guard),
        _ = cancel.cancelled() => Err(Error::Cancelled),
    }
}

/// A throttler that is already released.
fn pulsed_throttler() -> oneshot::Receiver<()> {
    let (tx, rx) = oneshot::channel();
    let _ = tx.send(());
    rx
}

/// Handle to a running secondary replica. Dropping it stops the serving
/// loops.
pub struct SecondaryReplicaClient {
    shared: Arc<Shared>,
    serve_cancel: CancellationToken,
    server_id: ServerId,
}

impl SecondaryReplicaClient {
    /// Register with the primary, bootstrap the store to full synchronization
    /// and install the serving replica. Returns once the ready signal has
    /// been sent; the write/read serving loops keep running until the handle
    /// is dropped or `cancel` fires.
    pub async fn start(
        config: BackfillConfig,
        server_id: ServerId,
        branch: BranchId,
        registrar: &Address<SecondaryCard>,
        backfiller: Arc<dyn Backfiller>,
        branch_history: Arc<BranchHistoryManager>,
        store: Arc<dyn Store>,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        let region = store.region();
        let triad = Arc::new(RwLock::new(TriadState {
            streaming: region.collapse(),
            queueing: region.collapse(),
            discarding: region,
            sink: None,
            replica: None,
        }));
        let shared = Arc::new(Shared {
            config,
            store,
            branch,
            enforcer: OnceLock::new(),
            registered: watch::channel(false).0,
            triad,
            queue_order_checkpoint: Mutex::new(OrderCheckpoint::new()),
        });

        let mut intro_mailbox = Mailbox::new();
        let async_mailbox = Mailbox::new();
        let sync_mailbox = Mailbox::new();
        let read_mailbox = Mailbox::new();
        registrar.send(SecondaryCard {
            server_id,
            intro: intro_mailbox.address(),
            async_writes: async_mailbox.address(),
            sync_writes: sync_mailbox.address(),
            reads: read_mailbox.address(),
        });

        let serve_cancel = cancel.child_token();
        spawn_serving_loops(
            shared.clone(),
            async_mailbox,
            sync_mailbox,
            read_mailbox,
            serve_cancel.clone(),
        );

        let bootstrapped = Self::bootstrap(
            &shared,
            server_id,
            &*backfiller,
            &branch_history,
            &mut intro_mailbox,
            cancel,
        )
        .await;
        if bootstrapped.is_err() {
            serve_cancel.cancel();
        }
        bootstrapped.map(|()| Self {
            shared,
            serve_cancel,
            server_id,
        })
    }

    pub fn server_id(&self) -> ServerId {
        self.server_id
    }

    /// The highest timestamp below which every streamed write completed.
    pub fn stream_watermark(&self) -> StateTimestamp {
        self.shared.enforcer().latest_all_before_completed()
    }

    async fn bootstrap(
        shared: &Arc<Shared>,
        server_id: ServerId,
        backfiller: &dyn Backfiller,
        branch_history: &BranchHistoryManager,
        intro_mailbox: &mut Mailbox<Intro>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let intro = tokio::select! {
            message = intro_mailbox.recv() => message.ok_or(Error::Cancelled)?,
            _ = cancel.cancelled() => return Err(Error::Cancelled),
        };
        info!(
            server_id,
            begin = %intro.streaming_begin_timestamp,
            "registered with the primary"
        );
        branch_history.record(BranchBirthCertificate {
            branch: shared.branch,
            origin: shared.store.region(),
            initial_timestamp: intro.streaming_begin_timestamp,
        });
        assert!(
            shared
                .enforcer
                .set(Arc::new(TimestampEnforcer::new(
                    intro.streaming_begin_timestamp
                )))
                .is_ok(),
            "intro delivered twice"
        );
        shared.registered.send_replace(true);

        run_bootstrap_passes(shared, backfiller, branch_history, cancel).await?;

        // Fully synchronized; the primary may now send reads and sync
        // writes.
        intro.ready.send(server_id);
        info!(server_id, "secondary replica synchronized and ready");
        Ok(())
    }
}

impl Drop for SecondaryReplicaClient {
    fn drop(&mut self) {
        self.serve_cancel.cancel();
    }
}

/// Accumulates capture timestamps chunk by chunk and stops the transfer once
/// the bridging queue is full.
struct ChunkCollector {
    queue: SharedQueue,
    expected_left: Key,
    bets: BackfillEndTimestamps,
    queue_limit: usize,
}

impl BackfillProgress for ChunkCollector {
    fn on_chunk(&mut self, versions: RegionMap<Version>) -> bool {
        let domain = versions.domain().clone();
        assert_eq!(
            domain.inner.left, self.expected_left,
            "backfill chunk does not abut the previous one"
        );
        if let RightBound::Key(right) = &domain.inner.right {
            self.expected_left = right.clone();
        }
        self.bets.combine(BackfillEndTimestamps::from_region_map(
            &versions.map(|version| version.timestamp),
        ));
        self.queue.lock().expect("queue lock poisoned").len() < self.queue_limit
    }
}

/// One backfill pass per iteration until the streaming region covers the
/// store's region, then install the serving replica.
async fn run_bootstrap_passes(
    shared: &Arc<Shared>,
    backfiller: &dyn Backfiller,
    branch_history: &BranchHistoryManager,
    cancel: &CancellationToken,
) -> Result<()> {
    let full_region = shared.store.region();
    let enforcer = shared.enforcer().clone();

    let mut guard = Some(write_guard(&shared.triad, cancel).await?);
    let mut pass = 0u32;
    loop {
        {
            let g = guard.as_ref().expect("pass loop lost the boundary guard");
            if g.streaming.inner.right == full_region.inner.right {
                break;
            }
        }
        guard = None;
        pass += 1;

        // The store may refuse backfill while it rebuilds an index. This is
        // the only point in the cycle where nothing is queued, so it is the
        // only safe point to park.
        shared
            .store
            .wait_until_ok_to_receive_backfill(cancel)
            .await
            .map_err(Error::from_store)?;

        // Open the queue: the region we used to discard starts queueing.
        let mut g = write_guard(&shared.triad, cancel).await?;
        assert!(
            g.queueing.is_empty(),
            "queueing region not empty at pass start"
        );
        g.queueing = g.discarding.clone();
        g.discarding = g.discarding.collapse();
        let queue: SharedQueue = Arc::new(Mutex::new(VecDeque::new()));
        let sink = QueueSink::new(queue.clone());
        g.sink = Some(sink.clone());
        let pull_from = g.queueing.inner.left.clone();
        let start_timestamp = enforcer.latest_all_before_completed();
        drop(g);
        debug!(pass, start = %start_timestamp, "backfill pass opened its queue");

        // Make sure the captures will carry timestamps at least up to the
        // stream position the queue opened at.
        backfiller.synchronize(start_timestamp, cancel).await?;

        // Pull chunks in ascending key order until the queue hits its bound.
        let mut collector = ChunkCollector {
            queue: queue.clone(),
            expected_left: pull_from.clone(),
            bets: BackfillEndTimestamps::empty(),
            queue_limit: shared.config.write_queue_count,
        };
        backfiller.go(&mut collector, pull_from, cancel).await?;
        let bets = collector.bets;
        assert!(!bets.is_empty(), "backfill pass delivered no chunks");

        // Wait for the stream to deliver everything up to the backfill seam.
        // Past this point clipping queued writes against `bets` is enough to
        // rule out double-applies.
        enforcer
            .wait_all_before(bets.max_timestamp(), cancel)
            .await?;

        // Shrink the queueing region to what was actually backfilled and
        // resume discarding to its right. Pushes throttle from here on.
        let mut g = write_guard(&shared.triad, cancel).await?;
        let backfilled_right = bets.region().inner.right.clone();
        g.queueing.inner.right = backfilled_right.clone();
        match backfilled_right {
            RightBound::Unbounded => g.discarding = full_region.collapse(),
            RightBound::Key(key) => {
                g.discarding = full_region
                    .with_inner(KeyRange::new(key, full_region.inner.right.clone()));
            }
        }
        sink.begin_throttling();
        drop(g);
        debug!(pass, backfilled = ?bets.region().inner, "backfill pass reshaped its boundaries");

        // Drain the queue. The drainer takes the boundary lock the first
        // time it sees the queue empty and hands the guard back to us.
        let hooks = Arc::new(PassHooks {
            triad: shared.triad.clone(),
            guard: Mutex::new(None),
            sink: sink.clone(),
            trickle: shared.config.write_queue_trickle_fraction,
        });
        drain_stream_queue(
            shared.store.clone(),
            shared.branch,
            queue.clone(),
            &bets,
            hooks.clone(),
            cancel,
        )
        .await?;

        let mut g = hooks
            .take_guard()
            .expect("drain finished without the boundary guard");
        assert!(
            queue.lock().expect("queue lock poisoned").is_empty(),
            "queue refilled under the exclusive guard"
        );

        // Throttling ends with the pass; let every parked ack go.
        sink.release_all();

        // Promote: what was queueing is streaming from now on. The queue had
        // to drain completely first because streaming applies and queued
        // applies are not synchronized with each other.
        g.streaming.inner.right = g.queueing.inner.right.clone();
        g.queueing = g.queueing.collapse();
        g.sink = None;
        info!(pass, streaming = ?g.streaming.inner, "backfill pass promoted its region");
        guard = Some(g);
    }

    let watermark = enforcer.latest_all_before_completed();
    #[cfg(debug_assertions)]
    check_synchronized_metainfo(&shared.store, shared.branch, watermark).await;

    let replica = Arc::new(Replica::new(
        shared.store.clone(),
        branch_history,
        shared.branch,
        watermark,
    ));
    let mut g = guard.take().expect("pass loop lost the boundary guard");
    g.replica = Some(replica);
    drop(g);
    Ok(())
}

/// Sanity sweep after the last pass: every sub-range must sit at the final
/// watermark on the replica's branch.
#[cfg(debug_assertions)]
async fn check_synchronized_metainfo(
    store: &Arc<dyn Store>,
    branch: BranchId,
    watermark: StateTimestamp,
) {
    let token = store.new_read_token();
    let region = store.region();
    if let Ok(metainfo) = store.get_metainfo(token, &region).await {
        let expect = Version::new(branch, watermark);
        for (range, version) in metainfo.runs() {
            debug_assert_eq!(
                version, &expect,
                "sub-range {range:?} out of sync after bootstrap"
            );
        }
    }
}

/// Pass-scoped callbacks handed to the queue drainer.
struct PassHooks {
    triad: Arc<RwLock<TriadState>>,
    guard: Mutex<Option<OwnedRwLockWriteGuard<TriadState>>>,
    sink: Arc<QueueSink>,
    trickle: f64,
}

impl PassHooks {
    /// Block new pushes by taking the boundary lock. Entries may slip in
    /// while we wait for it, so the drainer can call this more than once;
    /// the guard is only taken the first time.
    async fn on_queue_empty(&self, cancel: &CancellationToken) -> Result<()> {
        if self
            .guard
            .lock()
            .expect("drain guard lock poisoned")
            .is_some()
        {
            return Ok(());
        }
        let guard = write_guard(&self.triad, cancel).await?;
        *self.guard.lock().expect("drain guard lock poisoned") = Some(guard);
        Ok(())
    }

    fn on_finished_one_entry(&self) {
        self.sink.finished_one_entry(self.trickle);
    }

    fn take_guard(&self) -> Option<OwnedRwLockWriteGuard<TriadState>> {
        self.guard.lock().expect("drain guard lock poisoned").take()
    }
}

/// Apply bridging-queue entries to the store with bounded concurrency,
/// clipping each against the capture timestamps. Returns once the queue is
/// observed empty under the boundary lock and every spawned apply finished.
async fn drain_stream_queue(
    store: Arc<dyn Store>,
    branch: BranchId,
    queue: SharedQueue,
    bets: &BackfillEndTimestamps,
    hooks: Arc<PassHooks>,
    cancel: &CancellationToken,
) -> Result<()> {
    let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT_STREAM_QUEUE_ITEMS));
    let mut applies: JoinSet<Result<()>> = JoinSet::new();

    let loop_result = loop {
        let is_empty = queue.lock().expect("queue lock poisoned").is_empty();
        if is_empty {
            if let Err(err) = hooks.on_queue_empty(cancel).await {
                break Err(err);
            }
            if queue.lock().expect("queue lock poisoned").is_empty() {
                break Ok(());
            }
        }

        let permit = tokio::select! {
            permit = semaphore.clone().acquire_owned() => {
                permit.expect("drain semaphore closed")
            }
            _ = cancel.cancelled() => break Err(Error::Cancelled),
        };

        let mut entry = queue
            .lock()
            .expect("queue lock poisoned")
            .pop_front()
            .expect("queue drained behind the drainer's back");

        // Clip to the sub-region the backfill has not already captured at
        // this timestamp. A fully clipped write still advances metainfo.
        let applicable = bets.region_for_timestamp(entry.timestamp);
        if entry.has_write {
            match entry.write.shard(&applicable) {
                Some(clipped) => entry.write = clipped,
                None => entry.has_write = false,
            }
        }

        // Token taken before spawning so applies keep admission order.
        let token = store.new_write_token();
        let store = store.clone();
        let hooks = hooks.clone();
        applies.spawn(async move {
            let _permit = permit;
            // Deliberately not cancel-aware: a started apply runs to
            // completion so data and metainfo never diverge.
            let write = entry.has_write.then_some(&entry.write);
            apply_write_or_metainfo(
                store.as_ref(),
                branch,
                &applicable,
                write,
                entry.timestamp,
                entry.order_token,
                token,
            )
            .await?;
            hooks.on_finished_one_entry();
            Ok(())
        });
    };

    // Wait for every in-flight apply no matter how the loop ended.
    let mut apply_error = None;
    while let Some(joined) = applies.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                apply_error.get_or_insert(err);
            }
            Err(join_error) => {
                if join_error.is_panic() {
                    std::panic::resume_unwind(join_error.into_panic());
                }
            }
        }
    }

    loop_result?;
    if let Some(err) = apply_error {
        return Err(err);
    }
    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }
    Ok(())
}

/// Stamp `region` with `{branch, timestamp}` and apply the write there, or
/// only advance the metainfo when there is no write left to apply. An empty
/// region is a no-op that still consumes the token.
async fn apply_write_or_metainfo(
    store: &dyn Store,
    branch: BranchId,
    region: &Region,
    write: Option<&Write>,
    timestamp: StateTimestamp,
    order: OrderToken,
    token: WriteToken,
) -> Result<()> {
    let metainfo = RegionMap::new(region.clone(), Version::new(branch, timestamp));
    match write {
        Some(write) => store
            .write(metainfo, write, Durability::Soft, timestamp, order, token)
            .await
            .map(|_| ())
            .map_err(Error::from_store),
        None => store
            .set_metainfo(metainfo, order, token, Durability::Soft)
            .await
            .map_err(Error::from_store),
    }
}

fn spawn_serving_loops(
    shared: Arc<Shared>,
    mut async_mailbox: Mailbox<AsyncWrite>,
    mut sync_mailbox: Mailbox<SyncWrite>,
    mut read_mailbox: Mailbox<ReadRequest>,
    cancel: CancellationToken,
) {
    {
        let shared = shared.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    message = async_mailbox.recv() => message,
                    _ = cancel.cancelled() => None,
                };
                let Some(message) = message else { break };
                let shared = shared.clone();
                let cancel = cancel.clone();
                // Handlers run concurrently; admission order is re-imposed
                // by the timestamp enforcer.
                tokio::spawn(async move {
                    if let Err(err) = handle_async_write(&shared, message, &cancel).await {
                        debug!(error = %err, "async write handler stopped");
                    }
                });
            }
        });
    }
    {
        let shared = shared.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    message = sync_mailbox.recv() => message,
                    _ = cancel.cancelled() => None,
                };
                let Some(message) = message else { break };
                let shared = shared.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_sync_write(&shared, message, &cancel).await {
                        debug!(error = %err, "sync write handler stopped");
                    }
                });
            }
        });
    }
    tokio::spawn(async move {
        loop {
            let message = tokio::select! {
                message = read_mailbox.recv() => message,
                _ = cancel.cancelled() => None,
            };
            let Some(message) = message else { break };
            let shared = shared.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                if let Err(err) = handle_read(&shared, message, &cancel).await {
                    debug!(error = %err, "read handler stopped");
                }
            });
        }
    });
}

async fn wait_registered(shared: &Shared, cancel: &CancellationToken) -> Result<()> {
    let mut rx = shared.registered.subscribe();
    tokio::select! {
        result = rx.wait_for(|registered| *registered) => {
            result.map(|_| ()).map_err(|_| Error::Cancelled)
        }
        _ = cancel.cancelled() => Err(Error::Cancelled),
    }
}

async fn handle_async_write(
    shared: &Arc<Shared>,
    message: AsyncWrite,
    cancel: &CancellationToken,
) -> Result<()> {
    wait_registered(shared, cancel).await?;
    let enforcer = shared.enforcer().clone();
    let AsyncWrite {
        write,
        timestamp,
        order_token,
        ack,
    } = message;

    // Admit strictly in timestamp order.
    enforcer.wait_all_before(timestamp.pred(), cancel).await?;

    let guard = read_guard(&shared.triad, cancel).await?;

    if let Some(replica) = guard.replica.clone() {
        // Common case once bootstrap is over.
        enforcer.complete(timestamp);
        drop(guard);
        replica
            .do_write(&write, timestamp, order_token, Durability::Soft, cancel)
            .await?;
        let _ = ack.send(());
        return Ok(());
    }

    // Bootstrap: split the write across the triad. The streaming shard is
    // applied here, the queueing shard is parked on the bridging queue, and
    // the discarding shard is dropped.
    let streaming_region = guard.streaming.clone();
    let mut streaming_apply = None;
    if !streaming_region.is_empty() {
        let shard = write.shard(&streaming_region);
        let token = shared.store.new_write_token();
        streaming_apply = Some((shard, token));
    }

    let throttler = match guard.sink.clone() {
        Some(sink) => {
            assert!(
                !guard.queueing.is_empty(),
                "queue sink installed without a queueing region"
            );
            let queue_shard = write.shard(&guard.queueing);
            let checked_token = shared
                .queue_order_checkpoint
                .lock()
                .expect("order checkpoint lock poisoned")
                .check_through(order_token);
            sink.push(QueueEntry {
                has_write: queue_shard.is_some(),
                write: queue_shard.unwrap_or_default(),
                timestamp,
                order_token: checked_token,
            })
        }
        // Between two passes there is no queue; nothing holds the ack back.
        None => pulsed_throttler(),
    };

    enforcer.complete(timestamp);
    drop(guard);

    if let Some((shard, token)) = streaming_apply {
        apply_write_or_metainfo(
            shared.store.as_ref(),
            shared.branch,
            &streaming_region,
            shard.as_ref(),
            timestamp,
            order_token,
            token,
        )
        .await?;
    }

    // Back-pressure: the ack goes out at the pace the drainer sets.
    tokio::select! {
        released = throttler => {
            if released.is_err() {
                return Err(Error::Cancelled);
            }
        }
        _ = cancel.cancelled() => return Err(Error::Cancelled),
    }
    let _ = ack.send(());
    Ok(())
}

async fn handle_sync_write(
    shared: &Arc<Shared>,
    message: SyncWrite,
    cancel: &CancellationToken,
) -> Result<()> {
    let SyncWrite {
        write,
        timestamp,
        order_token,
        durability,
        ack,
    } = message;
    let guard = read_guard(&shared.triad, cancel).await?;
    let Some(replica) = guard.replica.clone() else {
        drop(guard);
        warn!(%timestamp, "synchronous write arrived before the replica was ready");
        let _ = ack.send(Err(Error::NotReady));
        return Ok(());
    };
    // The primary stops issuing async writes before it starts sync ones,
    // but the enforcer chain still records every timestamp.
    shared.enforcer().complete(timestamp);
    drop(guard);

    let result = replica
        .do_write(&write, timestamp, order_token, durability, cancel)
        .await;
    let _ = ack.send(result);
    Ok(())
}

async fn handle_read(
    shared: &Arc<Shared>,
    message: ReadRequest,
    cancel: &CancellationToken,
) -> Result<()> {
    let ReadRequest {
        read,
        min_timestamp,
        ack,
    } = message;
    let guard = read_guard(&shared.triad, cancel).await?;
    let Some(replica) = guard.replica.clone() else {
        drop(guard);
        warn!(%min_timestamp, "read arrived before the replica was ready");
        let _ = ack.send(Err(Error::NotReady));
        return Ok(());
    };
    drop(guard);

    let result = replica.do_read(&read, min_timestamp, cancel).await;
    let _ = ack.send(result);
    Ok(())
}
