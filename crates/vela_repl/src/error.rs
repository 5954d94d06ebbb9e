//! Engine-boundary error type.

use vela_store::Cancelled;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A cancellation signal fired while an operation was suspended.
    #[error("operation cancelled")]
    Cancelled,

    /// A synchronous write or read arrived before the replica finished
    /// synchronizing with its primary.
    #[error("replica is not ready for synchronous operations")]
    NotReady,

    /// The underlying store failed. Fatal to this replica.
    #[error("store failure: {0}")]
    Store(anyhow::Error),
}

impl Error {
    /// Map a store-layer error, keeping cancellation distinguishable.
    pub fn from_store(err: anyhow::Error) -> Self {
        if err.is::<Cancelled>() {
            Error::Cancelled
        } else {
            Error::Store(err)
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
