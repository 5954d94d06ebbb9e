//! Messages exchanged between a secondary replica and its primary.

use tokio::sync::oneshot;
use vela_store::{
    Durability, OrderToken, Read, ReadResponse, ServerId, StateTimestamp, Write, WriteResponse,
};

use crate::error::Error;
use crate::mailbox::Address;

/// Pushed to the client's intro mailbox once registration is accepted.
pub struct Intro {
    /// Every write ≤ this timestamp is already reflected in backfill
    /// sources; the stream starts directly after it.
    pub streaming_begin_timestamp: StateTimestamp,
    /// Where the client announces that it finished synchronizing.
    pub ready: Address<ServerId>,
}

/// One write from the primary's dispatcher stream. Acked without payload once
/// the replica has admitted and (eventually) applied it.
pub struct AsyncWrite {
    pub write: Write,
    pub timestamp: StateTimestamp,
    pub order_token: OrderToken,
    pub ack: oneshot::Sender<()>,
}

/// A synchronous write with caller-chosen durability. Only issued once the
/// replica has reported ready.
pub struct SyncWrite {
    pub write: Write,
    pub timestamp: StateTimestamp,
    pub order_token: OrderToken,
    pub durability: Durability,
    pub ack: oneshot::Sender<Result<WriteResponse, Error>>,
}

/// A read gated on a minimum timestamp. Only issued once the replica has
/// reported ready.
pub struct ReadRequest {
    pub read: Read,
    pub min_timestamp: StateTimestamp,
    pub ack: oneshot::Sender<Result<ReadResponse, Error>>,
}

/// Registration card a secondary publishes to the primary's registrar.
pub struct SecondaryCard {
    pub server_id: ServerId,
    pub intro: Address<Intro>,
    pub async_writes: Address<AsyncWrite>,
    pub sync_writes: Address<SyncWrite>,
    pub reads: Address<ReadRequest>,
}
