//! Backfill machinery: capture-timestamp bookkeeping and the paged transfer
//! driver.
//!
//! A write can reach a replica twice during bootstrap, once through the
//! dispatcher stream and once inside the backfill. `BackfillEndTimestamps`
//! records the timestamp each backfilled sub-range was captured at so queued
//! stream writes can be clipped to the sub-ranges that have not yet observed
//! them. This is subtle because a single write may span sub-ranges captured
//! at different timestamps; the part the backfill already covered must be
//! dropped while the rest is still applied.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use vela_store::{Key, Region, RegionMap, RightBound, StateTimestamp, Store, Version};

use crate::config::BackfillConfig;
use crate::error::{Error, Result};

/// How often the paged backfiller re-reads the peer watermark while waiting
/// for it to catch up.
const SYNCHRONIZE_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Map from a backfilled region to the timestamp each sub-range was captured
/// at. Capture timestamps never decrease as keys grow.
#[derive(Clone, Debug, Default)]
pub struct BackfillEndTimestamps {
    region: Option<Region>,
    steps: Vec<(Key, StateTimestamp)>,
}

impl BackfillEndTimestamps {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build from the capture timestamps of one backfilled range, read in
    /// ascending key order. Adjacent equal-timestamp runs collapse into one
    /// step.
    pub fn from_region_map(map: &RegionMap<StateTimestamp>) -> Self {
        if map.is_empty() {
            return Self::empty();
        }
        let mut steps: Vec<(Key, StateTimestamp)> = Vec::new();
        for (range, ts) in map.runs() {
            if let Some((_, last)) = steps.last() {
                assert!(
                    *last <= *ts,
                    "capture timestamps regress inside a backfill chunk"
                );
                if *last == *ts {
                    continue;
                }
            }
            steps.push((range.left.clone(), *ts));
        }
        Self {
            region: Some(map.domain().clone()),
            steps,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// The backfilled region covered so far. Panics when nothing has been
    /// recorded.
    pub fn region(&self) -> &Region {
        self.region
            .as_ref()
            .expect("no backfill timestamps recorded")
    }

    /// The capture timestamp of the right-most sub-range. Writes above it
    /// never need clipping.
    pub fn max_timestamp(&self) -> StateTimestamp {
        self.steps
            .last()
            .expect("no backfill timestamps recorded")
            .1
    }

    /// Concatenate an adjacent, later instance onto this one.
    pub fn combine(&mut self, next: BackfillEndTimestamps) {
        let Some(next_region) = next.region else {
            return;
        };
        let Some(region) = self.region.as_mut() else {
            self.region = Some(next_region);
            self.steps = next.steps;
            return;
        };
        assert!(
            region.same_shard(&next_region),
            "combined backfill ranges from different shards"
        );
        assert!(
            region.inner.right == RightBound::Key(next_region.inner.left.clone()),
            "combined backfill ranges are not adjacent"
        );
        let last = self.steps.last().expect("nonempty instance without steps").1;
        let first = next.steps.first().expect("nonempty instance without steps").1;
        assert!(last <= first, "capture timestamps regress across a seam");
        let skip = usize::from(last == first);
        self.steps.extend(next.steps.into_iter().skip(skip));
        region.inner.right = next_region.inner.right;
    }

    /// The sub-region whose keys were captured strictly before `timestamp`,
    /// i.e. where it is safe to apply a write carrying that timestamp. A
    /// sub-range captured at or after it has already observed the write.
    pub fn region_for_timestamp(&self, timestamp: StateTimestamp) -> Region {
        let mut region = self.region().clone();
        for (left, step_ts) in &self.steps {
            if *step_ts >= timestamp {
                region.inner = region.inner.clip_right(&RightBound::Key(left.clone()));
                break;
            }
        }
        region
    }

    /// Expand back into per-range capture timestamps.
    pub fn to_region_map(&self) -> RegionMap<StateTimestamp> {
        let region = self.region().clone();
        let mut runs = Vec::with_capacity(self.steps.len());
        for (i, (left, ts)) in self.steps.iter().enumerate() {
            let right = match self.steps.get(i + 1) {
                Some((next_left, _)) => RightBound::Key(next_left.clone()),
                None => region.inner.right.clone(),
            };
            runs.push((
                vela_store::KeyRange::new(left.clone(), right),
                *ts,
            ));
        }
        RegionMap::from_runs(region, runs)
    }
}

/// Receives backfill chunks as they land in the local store. Returning
/// `false` stops the transfer at that chunk boundary.
pub trait BackfillProgress: Send {
    fn on_chunk(&mut self, versions: RegionMap<Version>) -> bool;
}

/// The backfill source peer.
#[async_trait]
pub trait Backfiller: Send + Sync + 'static {
    /// Round-trip that returns once the peer's captures are guaranteed to
    /// carry timestamps at or above `timestamp`.
    async fn synchronize(
        &self,
        timestamp: StateTimestamp,
        cancel: &CancellationToken,
    ) -> Result<()>;

    /// Stream chunks in ascending key order starting at `from`, reporting
    /// each to `progress` until the region is exhausted or `progress`
    /// declines more.
    async fn go(
        &self,
        progress: &mut dyn BackfillProgress,
        from: Key,
        cancel: &CancellationToken,
    ) -> Result<()>;
}

/// Paged backfiller that copies a peer store into the local one, page by
/// page, installing data and capture metainfo together.
pub struct StoreBackfiller {
    source: Arc<dyn Store>,
    target: Arc<dyn Store>,
    page_items: usize,
}

impl StoreBackfiller {
    pub fn new(source: Arc<dyn Store>, target: Arc<dyn Store>, config: &BackfillConfig) -> Self {
        Self {
            source,
            target,
            page_items: config.backfill_page_items,
        }
    }

    async fn source_watermark(&self) -> Result<StateTimestamp> {
        let token = self.source.new_read_token();
        let region = self.source.region();
        let metainfo = self
            .source
            .get_metainfo(token, &region)
            .await
            .map_err(Error::from_store)?;
        Ok(metainfo
            .runs()
            .map(|(_, version)| version.timestamp)
            .min()
            .unwrap_or(StateTimestamp::zero()))
    }
}

#[async_trait]
impl Backfiller for StoreBackfiller {
    async fn synchronize(
        &self,
        timestamp: StateTimestamp,
        cancel: &CancellationToken,
    ) -> Result<()> {
        loop {
            let reached = tokio::select! {
                result = self.source_watermark() => result?,
                _ = cancel.cancelled() => return Err(Error::Cancelled),
            };
            if reached >= timestamp {
                return Ok(());
            }
            tokio::select! {
                _ = tokio::time::sleep(SYNCHRONIZE_POLL_INTERVAL) => {}
                _ = cancel.cancelled() => return Err(Error::Cancelled),
            }
        }
    }

    async fn go(
        &self,
        progress: &mut dyn BackfillProgress,
        from: Key,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let source_left = self.source.region().inner.left.clone();
        let mut cursor = from.max(source_left);
        loop {
            let page = tokio::select! {
                result = self.source.backfill_page(&cursor, self.page_items) => {
                    result.map_err(Error::from_store)?
                }
                _ = cancel.cancelled() => return Err(Error::Cancelled),
            };
            assert_eq!(
                page.range.left, cursor,
                "backfill page does not abut the cursor"
            );

            // Install the page before reporting it so a stop at this chunk
            // boundary leaves data and metainfo in agreement.
            let token = self.target.new_write_token();
            self.target
                .receive_backfill_page(&page, token)
                .await
                .map_err(Error::from_store)?;

            let keep_going = progress.on_chunk(page.versions.clone());
            if page.done || !keep_going {
                return Ok(());
            }
            match page.range.right {
                RightBound::Key(next) => {
                    assert!(next > cursor, "backfill cursor stalled at {cursor:?}");
                    cursor = next;
                }
                RightBound::Unbounded => return Ok(()),
            }
        }
    }
}
