//! Cluster Transport Protocol
//!
//! Defines the HTTP endpoints and envelopes used between nodes of the
//! `cluster` transport. Membership gossip runs separately over UDP.

use serde::{Deserialize, Serialize};

use crate::membership::types::NodeId;

// --- API Endpoints ---

/// Endpoint receiving broadcast mutation frames.
pub const ENDPOINT_DELIVER: &str = "/internal/deliver";
/// Endpoint answering state-transfer requests with a full snapshot.
pub const ENDPOINT_STATE: &str = "/internal/state";

/// The HTTP listener binds to the gossip port plus this offset.
pub const HTTP_PORT_OFFSET: u16 = 1000;

// --- Envelopes ---

/// Body of a `POST /internal/deliver`, bincode-encoded.
///
/// `payload` is a mutation frame produced by `storage::codec::encode_mutation`.
/// It stays opaque here so that a frame this node cannot decode is discarded
/// on its own, without failing the envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryEnvelope {
    /// Group the sender is connected to.
    pub group: String,
    /// Address of the originating member.
    pub sender: NodeId,
    pub payload: Vec<u8>,
}
