//! Group Communication Transport
//!
//! The replication core talks to the cluster exclusively through the
//! [`GroupTransport`] trait and receives callbacks through [`GroupReceiver`].
//! The transport owns connection management, per-sender ordered delivery,
//! membership-view computation and point-to-point state requests.
//!
//! ## Implementations
//! - **`cluster`**: UDP gossip for membership, HTTP (axum + reqwest) for
//!   broadcast frames and state transfer. Used by the `replicated-map` binary.
//! - **`memory`**: an in-process hub with injectable views and partitions,
//!   used by tests and single-process demos.

pub mod cluster;
pub mod handlers;
pub mod memory;
pub mod protocol;


use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::Span;

use crate::error::{DecodeError, TransportError};
use crate::membership::types::{NodeId, ViewChange};
use crate::storage::codec::{self, EncodeError};
use crate::storage::types::{MutationMessage, Snapshot};

/// Callbacks a transport invokes on the local node.
///
/// Implementations must not block: `deliver` and `view_accepted` run on the
/// transport's delivery path, `capture_state` answers a peer's state request.
pub trait GroupReceiver: Send + Sync {
    /// A mutation broadcast by `sender` was delivered.
    fn deliver(&self, message: MutationMessage, sender: NodeId);

    /// A new membership view (plain or merge) was installed.
    fn view_accepted(&self, view: ViewChange);

    /// A peer asked for the full local state.
    fn capture_state(&self) -> Result<Snapshot, EncodeError>;
}

#[async_trait]
pub trait GroupTransport: Send + Sync {
    /// Address of this node within the group. Stable for the transport's lifetime.
    fn local_address(&self) -> NodeId;

    /// Registers the callback target. Must be called before `connect`.
    fn set_receiver(&self, receiver: Arc<dyn GroupReceiver>);

    /// Joins `group`. Returns once the first view has been installed.
    async fn connect(&self, group: &str) -> Result<(), TransportError>;

    /// Fire-and-forget send to every other current member. Never blocks on I/O.
    fn broadcast(&self, message: &MutationMessage) -> Result<(), TransportError>;

    /// Pulls a full snapshot from `member`, failing after `timeout`.
    async fn request_state(
        &self,
        member: &NodeId,
        timeout: Duration,
    ) -> Result<Snapshot, TransportError>;

    /// Leaves the group and drops the registered receiver.
    async fn disconnect(&self);
}

/// Decodes an inbound mutation frame and hands it to `receiver`.
///
/// Malformed frames and frames of unknown variants are discarded here, so a
/// bad payload never reaches the store and never stops later deliveries.
pub fn deliver_frame(
    receiver: &dyn GroupReceiver,
    frame: &[u8],
    sender: NodeId,
    span: &Span,
) -> Result<(), DecodeError> {
    match codec::decode_mutation(frame) {
        Ok(message) => {
            receiver.deliver(message, sender);
            Ok(())
        }
        Err(DecodeError::UnknownVariant(tag)) => {
            tracing::debug!(
                parent: span,
                "Ignoring message of unknown variant {} from {}",
                tag,
                sender
            );
            Err(DecodeError::UnknownVariant(tag))
        }
        Err(e) => {
            tracing::warn!(parent: span, "Discarding malformed message from {}: {}", sender, e);
            Err(e)
        }
    }
}
