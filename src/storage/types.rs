use serde::{Deserialize, Serialize};
use std::fmt;

use crate::membership::types::NodeId;

/// A single key/value pair of the replicated map.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Entry {
    pub key: String,
    pub value: i32,
}

impl Entry {
    pub fn new(key: impl Into<String>, value: i32) -> Self {
        Self {
            key: key.into(),
            value,
        }
    }
}

impl fmt::Display for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} = {}", self.key, self.value)
    }
}

/// A replicated mutation.
///
/// Carries no version or clock: applying it is unconditional and the last
/// applied mutation for a key wins. Both variants are idempotent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MutationMessage {
    Insert { key: String, value: i32 },
    Remove { key: String },
}

impl MutationMessage {
    pub fn key(&self) -> &str {
        match self {
            MutationMessage::Insert { key, .. } | MutationMessage::Remove { key } => key,
        }
    }
}

/// Opaque encoding of the whole map at one instant, used for state transfer.
///
/// Produced by `codec::encode_snapshot` and only ever consumed whole.
#[derive(Clone, PartialEq, Eq)]
pub struct Snapshot(Vec<u8>);

impl Snapshot {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Snapshot({} bytes)", self.0.len())
    }
}

/// Where a store mutation came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    Local,
    Remote(NodeId),
}

/// Change notification fanned out to store subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    Inserted {
        key: String,
        value: i32,
        origin: Origin,
    },
    Removed {
        key: String,
        origin: Origin,
    },
    /// The whole state was replaced by a snapshot holding `len` entries.
    Restored { len: usize },
}
