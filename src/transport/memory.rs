//! In-Memory Transport
//!
//! A process-local stand-in for the cluster. Every [`MemoryTransport`] handed
//! out by one [`MemoryNetwork`] shares a hub that routes broadcasts, computes
//! views and serves state requests.
//!
//! ## Core Concepts
//! - **Synchronous delivery**: `broadcast` hands the frame to every reachable
//!   member before returning, so per-sender order is trivially kept.
//! - **Views**: members are ordered by connect time. Each member runs its own
//!   [`ViewTracker`], so healing a partition yields a merge view on every side.
//! - **Fault injection**: partitions, slow or failing state sources, failing
//!   broadcasts and raw frames can be set up from tests.
//!
//! The hub lock is never held while a receiver callback runs.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::Span;

use super::{GroupReceiver, GroupTransport, deliver_frame};
use crate::error::{DecodeError, TransportError};
use crate::membership::types::{NodeId, ViewChange};
use crate::membership::view::ViewTracker;
use crate::storage::codec;
use crate::storage::types::{MutationMessage, Snapshot};

struct Member {
    group: String,
    receiver: Arc<dyn GroupReceiver>,
    loopback: bool,
    partition: usize,
    tracker: ViewTracker,
}

#[derive(Default)]
struct Hub {
    members: HashMap<NodeId, Member>,
    /// Connected members, oldest first.
    order: Vec<NodeId>,
    state_delay: Duration,
    failing_state_sources: HashSet<NodeId>,
    failing_broadcasts: bool,
}

type Pending = Vec<(Arc<dyn GroupReceiver>, ViewChange)>;

impl Hub {
    fn reachable(&self, a: &NodeId, b: &NodeId) -> bool {
        match (self.members.get(a), self.members.get(b)) {
            (Some(a), Some(b)) => a.group == b.group && a.partition == b.partition,
            _ => false,
        }
    }

    /// Recomputes every member's view; returns the views to dispatch.
    fn refresh_views(&mut self) -> Pending {
        let mut pending = Vec::new();
        for id in self.order.clone() {
            let visible: Vec<NodeId> = self
                .order
                .iter()
                .filter(|other| self.reachable(&id, other))
                .cloned()
                .collect();

            if let Some(member) = self.members.get_mut(&id)
                && let Some(view) = member.tracker.observe(visible)
            {
                pending.push((member.receiver.clone(), view));
            }
        }
        pending
    }
}

fn dispatch(pending: Pending) {
    for (receiver, view) in pending {
        receiver.view_accepted(view);
    }
}

/// Shared hub for a set of in-process members.
#[derive(Clone)]
pub struct MemoryNetwork {
    hub: Arc<Mutex<Hub>>,
    span: Span,
}

impl MemoryNetwork {
    pub fn new(span: Span) -> Self {
        Self {
            hub: Arc::new(Mutex::new(Hub::default())),
            span,
        }
    }

    /// A transport whose own broadcasts are not delivered back to it.
    pub fn transport(&self, id: &str) -> Arc<MemoryTransport> {
        self.build(id, false)
    }

    /// A transport that also receives its own broadcasts.
    pub fn transport_with_loopback(&self, id: &str) -> Arc<MemoryTransport> {
        self.build(id, true)
    }

    fn build(&self, id: &str, loopback: bool) -> Arc<MemoryTransport> {
        Arc::new(MemoryTransport {
            id: NodeId::from(id),
            loopback,
            hub: self.hub.clone(),
            receiver: Mutex::new(None),
            span: tracing::info_span!(parent: &self.span, "node", id = %id),
        })
    }

    /// Connected members, oldest first.
    pub fn members(&self) -> Vec<NodeId> {
        self.hub.lock().order.clone()
    }

    /// Splits connected members into the given sides. Members not listed end
    /// up together on one extra side. Members connecting later join side 0.
    pub fn partition(&self, sides: &[&[&str]]) {
        let pending = {
            let mut hub = self.hub.lock();
            let mut placement: HashMap<NodeId, usize> = HashMap::new();
            for (index, side) in sides.iter().enumerate() {
                for id in side.iter() {
                    placement.insert(NodeId::from(*id), index);
                }
            }
            for (id, member) in hub.members.iter_mut() {
                member.partition = placement.get(id).copied().unwrap_or(sides.len());
            }
            hub.refresh_views()
        };
        tracing::info!(parent: &self.span, "Partitioned into {} sides", sides.len());
        dispatch(pending);
    }

    /// Reconnects every side; members that see each other again install merge views.
    pub fn heal(&self) {
        let pending = {
            let mut hub = self.hub.lock();
            for member in hub.members.values_mut() {
                member.partition = 0;
            }
            hub.refresh_views()
        };
        tracing::info!(parent: &self.span, "Partitions healed");
        dispatch(pending);
    }

    /// Hands an arbitrary view to one member, bypassing view computation.
    pub fn inject_view(&self, id: &str, view: ViewChange) -> bool {
        let receiver = self
            .hub
            .lock()
            .members
            .get(&NodeId::from(id))
            .map(|member| member.receiver.clone());
        match receiver {
            Some(receiver) => {
                receiver.view_accepted(view);
                true
            }
            None => false,
        }
    }

    /// Delay applied before any member answers a state request.
    pub fn set_state_delay(&self, delay: Duration) {
        self.hub.lock().state_delay = delay;
    }

    /// State requests addressed to `id` fail immediately.
    pub fn fail_state_requests_from(&self, id: &str) {
        self.hub
            .lock()
            .failing_state_sources
            .insert(NodeId::from(id));
    }

    pub fn fail_broadcasts(&self, fail: bool) {
        self.hub.lock().failing_broadcasts = fail;
    }

    /// Delivers a raw frame to `to` as if `from` had broadcast it.
    ///
    /// Returns `None` if `to` is not connected.
    pub fn deliver_raw(&self, to: &str, from: &str, frame: &[u8]) -> Option<Result<(), DecodeError>> {
        let receiver = self
            .hub
            .lock()
            .members
            .get(&NodeId::from(to))
            .map(|member| member.receiver.clone())?;
        Some(deliver_frame(
            receiver.as_ref(),
            frame,
            NodeId::from(from),
            &self.span,
        ))
    }
}

pub struct MemoryTransport {
    id: NodeId,
    loopback: bool,
    hub: Arc<Mutex<Hub>>,
    receiver: Mutex<Option<Arc<dyn GroupReceiver>>>,
    span: Span,
}

#[async_trait]
impl GroupTransport for MemoryTransport {
    fn local_address(&self) -> NodeId {
        self.id.clone()
    }

    fn set_receiver(&self, receiver: Arc<dyn GroupReceiver>) {
        *self.receiver.lock() = Some(receiver);
    }

    async fn connect(&self, group: &str) -> Result<(), TransportError> {
        let receiver = self
            .receiver
            .lock()
            .clone()
            .ok_or_else(|| TransportError::Setup("no receiver registered".to_string()))?;

        let pending = {
            let mut hub = self.hub.lock();
            if let Some(member) = hub.members.get(&self.id) {
                return Err(TransportError::AlreadyConnected(member.group.clone()));
            }
            hub.members.insert(
                self.id.clone(),
                Member {
                    group: group.to_string(),
                    receiver,
                    loopback: self.loopback,
                    partition: 0,
                    tracker: ViewTracker::new(),
                },
            );
            hub.order.push(self.id.clone());
            hub.refresh_views()
        };

        tracing::info!(parent: &self.span, "Connected to group '{}'", group);
        dispatch(pending);
        Ok(())
    }

    fn broadcast(&self, message: &MutationMessage) -> Result<(), TransportError> {
        let frame = codec::encode_mutation(message)?;

        let targets: Vec<Arc<dyn GroupReceiver>> = {
            let hub = self.hub.lock();
            let Some(sender) = hub.members.get(&self.id) else {
                return Err(TransportError::NotConnected);
            };
            if hub.failing_broadcasts {
                return Err(TransportError::Closed);
            }
            hub.order
                .iter()
                .filter(|id| {
                    if **id == self.id {
                        sender.loopback
                    } else {
                        hub.reachable(&self.id, id)
                    }
                })
                .filter_map(|id| hub.members.get(id))
                .map(|member| member.receiver.clone())
                .collect()
        };

        for receiver in targets {
            let _ = deliver_frame(receiver.as_ref(), &frame, self.id.clone(), &self.span);
        }
        Ok(())
    }

    async fn request_state(
        &self,
        member: &NodeId,
        timeout: Duration,
    ) -> Result<Snapshot, TransportError> {
        let (source, delay) = {
            let hub = self.hub.lock();
            if !hub.members.contains_key(&self.id) {
                return Err(TransportError::NotConnected);
            }
            let source = hub
                .members
                .get(member)
                .ok_or_else(|| TransportError::UnknownMember(member.clone()))?;
            if !hub.reachable(&self.id, member) {
                return Err(TransportError::Unreachable(member.clone()));
            }
            if hub.failing_state_sources.contains(member) {
                return Err(TransportError::Request {
                    member: member.clone(),
                    reason: "state provider failed".to_string(),
                });
            }
            (source.receiver.clone(), hub.state_delay)
        };

        let transfer = async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            source.capture_state()
        };
        match tokio::time::timeout(timeout, transfer).await {
            Ok(snapshot) => Ok(snapshot?),
            Err(_) => Err(TransportError::Timeout(timeout)),
        }
    }

    async fn disconnect(&self) {
        let pending = {
            let mut hub = self.hub.lock();
            hub.members.remove(&self.id);
            hub.order.retain(|id| *id != self.id);
            let pending = hub.refresh_views();
            for member in hub.members.values_mut() {
                member.tracker.forget(&self.id);
            }
            pending
        };
        *self.receiver.lock() = None;
        tracing::info!(parent: &self.span, "Disconnected");
        dispatch(pending);
    }
}
