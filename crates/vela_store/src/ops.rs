//! Write and read operation payloads and their region-sharding helpers.

use serde::{Deserialize, Serialize};

use crate::region::{Key, Region};
use crate::version::Version;

/// Durability requested for one store operation. Bootstrap traffic runs soft;
/// synchronous writes carry the caller's choice.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum Durability {
    Soft,
    Hard,
}

/// A single keyed mutation.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum Mutation {
    Put(Vec<u8>),
    Delete,
}

#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct WriteOp {
    pub key: Key,
    pub mutation: Mutation,
}

/// A batch of keyed mutations sequenced under one state timestamp.
#[derive(Clone, Default, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Write {
    pub ops: Vec<WriteOp>,
}

impl Write {
    pub fn with_ops(ops: Vec<WriteOp>) -> Self {
        Self { ops }
    }

    pub fn put(key: impl Into<Key>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            ops: vec![WriteOp {
                key: key.into(),
                mutation: Mutation::Put(value.into()),
            }],
        }
    }

    pub fn delete(key: impl Into<Key>) -> Self {
        Self {
            ops: vec![WriteOp {
                key: key.into(),
                mutation: Mutation::Delete,
            }],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Restrict the write to the keys inside `region`. Returns `None` when
    /// nothing of the write falls inside it.
    pub fn shard(&self, region: &Region) -> Option<Write> {
        if region.is_empty() {
            return None;
        }
        let ops: Vec<WriteOp> = self
            .ops
            .iter()
            .filter(|op| region.contains_key(&op.key))
            .cloned()
            .collect();
        if ops.is_empty() {
            None
        } else {
            Some(Write { ops })
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WriteResponse {
    pub ops_applied: usize,
}

/// A point lookup.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Read {
    pub key: Key,
}

impl Read {
    pub fn key(key: impl Into<Key>) -> Self {
        Self { key: key.into() }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReadResponse {
    pub value: Option<Vec<u8>>,
    pub version: Option<Version>,
}
