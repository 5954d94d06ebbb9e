//! Tuning knobs for the backfill and bridging-queue machinery.

use serde::Deserialize;

/// Backfill configuration. Defaults suit production-scale regions; tests
/// shrink the queue bound to exercise multi-pass bootstraps.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct BackfillConfig {
    /// Stop pulling backfill pages once the bridging queue holds this many
    /// entries. The pass then drains the queue before continuing.
    pub write_queue_count: usize,

    /// Fraction of a dispatcher ack released per drained queue entry while
    /// throttling. Values below one guarantee the queue shrinks.
    pub write_queue_trickle_fraction: f64,

    /// Maximum number of items requested per backfill page.
    pub backfill_page_items: usize,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            write_queue_count: 1000,
            write_queue_trickle_fraction: 0.05,
            backfill_page_items: 256,
        }
    }
}
