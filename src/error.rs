//! Error Types
//!
//! Typed failures surfaced by the replication core. None of them is fatal to
//! the process: callers log them and keep serving local state.

use std::time::Duration;
use thiserror::Error;

use crate::membership::types::NodeId;
use crate::storage::codec::EncodeError;

/// Failures raised by a group transport (broadcast, state request, setup).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport is not connected to a group")]
    NotConnected,

    #[error("transport is already connected to group '{0}'")]
    AlreadyConnected(String),

    #[error("failed to set up transport: {0}")]
    Setup(String),

    #[error("member {0} is not part of the current view")]
    UnknownMember(NodeId),

    #[error("member {0} is unreachable")]
    Unreachable(NodeId),

    #[error("request to {member} failed: {reason}")]
    Request { member: NodeId, reason: String },

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("outbound channel closed")]
    Closed,

    #[error(transparent)]
    Encode(#[from] EncodeError),
}

/// Malformed mutation or snapshot payload. The payload is discarded whole.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("empty payload")]
    Empty,

    #[error("unknown message variant {0}")]
    UnknownVariant(u32),

    #[error("unsupported snapshot version {0}")]
    UnsupportedVersion(u32),

    #[error("duplicate key '{0}' in snapshot")]
    DuplicateKey(String),

    #[error("malformed payload: {0}")]
    Malformed(String),
}

impl From<bincode::Error> for DecodeError {
    fn from(e: bincode::Error) -> Self {
        DecodeError::Malformed(e.to_string())
    }
}

/// Failure of a join-time or merge-time state transfer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateTransferError {
    #[error("state request failed: {0}")]
    Transport(#[from] TransportError),

    #[error("received snapshot could not be decoded: {0}")]
    Decode(#[from] DecodeError),
}
