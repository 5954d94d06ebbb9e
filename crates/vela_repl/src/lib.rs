//! Secondary-replica bootstrap and streaming engine for the Vela key-value
//! store.
//!
//! A fresh replica signs up for the primary's ordered write stream while it
//! backfills historical state from a peer, guaranteeing every write lands
//! exactly once even where the two overlap. Once its whole region streams,
//! the replica serves synchronous writes and timestamp-gated reads.

pub mod backfill;
pub mod branch_history;
pub mod config;
pub mod error;
pub mod mailbox;
pub mod protocol;
pub mod replica;
pub mod secondary;
pub mod timestamp_enforcer;

pub use backfill::{BackfillEndTimestamps, BackfillProgress, Backfiller, StoreBackfiller};
pub use branch_history::{BranchBirthCertificate, BranchHistoryManager};
pub use config::BackfillConfig;
pub use error::{Error, Result};
pub use mailbox::{Address, Mailbox};
pub use protocol::{AsyncWrite, Intro, ReadRequest, SecondaryCard, SyncWrite};
pub use replica::Replica;
pub use secondary::SecondaryReplicaClient;
pub use timestamp_enforcer::TimestampEnforcer;
